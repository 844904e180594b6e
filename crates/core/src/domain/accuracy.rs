use crate::domain::classification::Archetype;
use crate::domain::model::ModelKey;
use crate::domain::recommendation::Action;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Realized closes further than this from a horizon's target date do not count.
pub const PRICE_TOLERANCE_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "30d")]
    D30,
    #[serde(rename = "90d")]
    D90,
    #[serde(rename = "180d")]
    D180,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::D30, Horizon::D90, Horizon::D180];

    pub fn days(self) -> i64 {
        match self {
            Horizon::D30 => 30,
            Horizon::D90 => 90,
            Horizon::D180 => 180,
        }
    }

    pub fn is_due(self, analysis_date: NaiveDate, today: NaiveDate) -> bool {
        (today - analysis_date).num_days() >= self.days()
    }

    /// The whole tolerance window around the target date is in the past, so a price
    /// history fetched now is final for this horizon.
    pub fn window_closed(self, analysis_date: NaiveDate, today: NaiveDate) -> bool {
        (today - analysis_date).num_days() > self.days() + PRICE_TOLERANCE_DAYS
    }
}

/// Absolute percentage error of one model at each horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HorizonErrors {
    pub mae_30d: Option<f64>,
    pub mae_90d: Option<f64>,
    pub mae_180d: Option<f64>,
}

impl HorizonErrors {
    pub fn get(&self, horizon: Horizon) -> Option<f64> {
        match horizon {
            Horizon::D30 => self.mae_30d,
            Horizon::D90 => self.mae_90d,
            Horizon::D180 => self.mae_180d,
        }
    }

    pub fn set(&mut self, horizon: Horizon, value: Option<f64>) {
        match horizon {
            Horizon::D30 => self.mae_30d = value,
            Horizon::D90 => self.mae_90d = value,
            Horizon::D180 => self.mae_180d = value,
        }
    }
}

pub type ModelErrors = BTreeMap<ModelKey, HorizonErrors>;

/// Realized price and direction outcome at one horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HorizonOutcome {
    pub actual_price: Option<f64>,
    pub direction_correct: Option<bool>,
    /// The tolerance window closed without a trading day (long market closure, data gap).
    /// Terminal: the horizon is never looked up again.
    #[serde(default)]
    pub no_close: bool,
}

impl HorizonOutcome {
    pub fn priced(actual_price: f64, direction_correct: Option<bool>) -> Self {
        Self {
            actual_price: Some(actual_price),
            direction_correct,
            no_close: false,
        }
    }

    pub fn without_close() -> Self {
        Self {
            no_close: true,
            ..Self::default()
        }
    }

    /// Neither priced nor settled without a close.
    pub fn is_open(&self) -> bool {
        self.actual_price.is_none() && !self.no_close
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccuracyCheck {
    pub analysis_id: Uuid,
    pub ticker: String,
    pub analysis_date: NaiveDate,
    pub predicted_fair_value: f64,
    pub predicted_action: Action,
    pub price_at_analysis: f64,
    pub classification_type: Option<Archetype>,
    pub d30: HorizonOutcome,
    pub d90: HorizonOutcome,
    pub d180: HorizonOutcome,
    pub model_fair_values: BTreeMap<ModelKey, f64>,
    pub model_errors: ModelErrors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyCheck {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub ticker: String,
    pub analysis_date: NaiveDate,
    pub predicted_fair_value: f64,
    pub predicted_action: Action,
    pub price_at_analysis: f64,
    pub classification_type: Option<Archetype>,
    pub d30: HorizonOutcome,
    pub d90: HorizonOutcome,
    pub d180: HorizonOutcome,
    pub model_fair_values: BTreeMap<ModelKey, f64>,
    pub model_errors: ModelErrors,
}

impl AccuracyCheck {
    pub fn from_new(id: Uuid, new: NewAccuracyCheck) -> Self {
        Self {
            id,
            analysis_id: new.analysis_id,
            ticker: new.ticker,
            analysis_date: new.analysis_date,
            predicted_fair_value: new.predicted_fair_value,
            predicted_action: new.predicted_action,
            price_at_analysis: new.price_at_analysis,
            classification_type: new.classification_type,
            d30: new.d30,
            d90: new.d90,
            d180: new.d180,
            model_fair_values: new.model_fair_values,
            model_errors: new.model_errors,
        }
    }

    pub fn outcome(&self, horizon: Horizon) -> &HorizonOutcome {
        match horizon {
            Horizon::D30 => &self.d30,
            Horizon::D90 => &self.d90,
            Horizon::D180 => &self.d180,
        }
    }

    /// Every horizon is priced or settled without a close.
    pub fn is_complete(&self) -> bool {
        Horizon::ALL.into_iter().all(|h| !self.outcome(h).is_open())
    }

    /// Horizons that are due on `today` and still open.
    pub fn open_due_horizons(&self, today: NaiveDate) -> Vec<Horizon> {
        Horizon::ALL
            .into_iter()
            .filter(|h| self.outcome(*h).is_open() && h.is_due(self.analysis_date, today))
            .collect()
    }

    /// Apply a backfill in place, leaving settled horizons untouched.
    pub fn apply(&mut self, update: &AccuracyUpdate) {
        for (horizon, outcome) in &update.outcomes {
            let slot = match horizon {
                Horizon::D30 => &mut self.d30,
                Horizon::D90 => &mut self.d90,
                Horizon::D180 => &mut self.d180,
            };
            if slot.is_open() {
                *slot = *outcome;
            }
        }
        if let Some(errors) = &update.model_errors {
            self.model_errors = errors.clone();
        }
    }
}

/// Fields a backfill pass adds to an existing check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyUpdate {
    pub outcomes: BTreeMap<Horizon, HorizonOutcome>,
    pub model_errors: Option<ModelErrors>,
}

impl AccuracyUpdate {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.model_errors.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(d90: HorizonOutcome, d180: HorizonOutcome) -> AccuracyCheck {
        AccuracyCheck {
            id: Uuid::new_v4(),
            analysis_id: Uuid::new_v4(),
            ticker: "2330".to_string(),
            analysis_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            predicted_fair_value: 120.0,
            predicted_action: Action::Buy,
            price_at_analysis: 100.0,
            classification_type: None,
            d30: HorizonOutcome::priced(110.0, Some(true)),
            d90,
            d180,
            model_fair_values: BTreeMap::new(),
            model_errors: BTreeMap::new(),
        }
    }

    #[test]
    fn open_ninety_day_horizon_keeps_check_incomplete() {
        let gap = check(HorizonOutcome::default(), HorizonOutcome::priced(90.0, Some(false)));
        assert!(!gap.is_complete());
        let today = NaiveDate::from_ymd_opt(2026, 7, 10).unwrap();
        assert_eq!(gap.open_due_horizons(today), vec![Horizon::D90]);

        let settled = check(HorizonOutcome::without_close(), HorizonOutcome::priced(90.0, Some(false)));
        assert!(settled.is_complete());
        assert!(settled.open_due_horizons(today).is_empty());
    }

    #[test]
    fn settled_horizons_ignore_later_updates() {
        let mut c = check(HorizonOutcome::without_close(), HorizonOutcome::default());
        let update = AccuracyUpdate {
            outcomes: BTreeMap::from([
                (Horizon::D90, HorizonOutcome::priced(130.0, Some(true))),
                (Horizon::D180, HorizonOutcome::priced(95.0, Some(false))),
            ]),
            model_errors: None,
        };
        c.apply(&update);
        assert!(c.d90.no_close);
        assert_eq!(c.d90.actual_price, None);
        assert_eq!(c.d180.actual_price, Some(95.0));
    }

    #[test]
    fn window_closes_after_the_tolerance() {
        let base = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let day = |n: i64| base + chrono::Duration::days(n);
        assert!(Horizon::D30.is_due(base, day(30)));
        assert!(!Horizon::D30.window_closed(base, day(33)));
        assert!(Horizon::D30.window_closed(base, day(34)));
    }
}
