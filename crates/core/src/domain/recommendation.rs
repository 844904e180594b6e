use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Hold,
    Sell,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Hold => "HOLD",
            Action::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        match s.trim() {
            "BUY" => Some(Action::Buy),
            "HOLD" => Some(Action::Hold),
            "SELL" => Some(Action::Sell),
            _ => None,
        }
    }
}

/// Strength of the call: strong (強烈), normal (一般) or neutral (中性).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "強烈")]
    Strong,
    #[serde(rename = "一般")]
    Normal,
    #[serde(rename = "中性")]
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: Action,
    pub confidence: Confidence,
    pub upside_pct: f64,
    pub fair_value: f64,
    pub reasons: Vec<String>,
}
