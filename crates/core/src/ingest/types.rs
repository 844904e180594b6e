use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One daily close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Datasets requested from the market-data provider, keyed by their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    StockPrice,
}

impl Dataset {
    pub fn as_str(self) -> &'static str {
        match self {
            Dataset::StockPrice => "TaiwanStockPrice",
        }
    }
}

/// Response envelope shared by every dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetResponse {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl DatasetResponse {
    pub fn is_success(&self) -> bool {
        self.msg == "success"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub close: f64,
}

impl From<PriceRow> for PricePoint {
    fn from(r: PriceRow) -> Self {
        Self {
            date: r.date,
            close: r.close,
        }
    }
}
