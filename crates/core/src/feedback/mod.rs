pub mod adaptive;
pub mod cache;

use crate::config::env_or;
use crate::domain::accuracy::Horizon;

const DEFAULT_MIN_SAMPLES: usize = 5;
const DEFAULT_BLEND_RATIO: f64 = 0.3;
const DEFAULT_MAX_WEIGHT: f64 = 0.5;
const DEFAULT_STALE_HOURS: i64 = 24;
const DEFAULT_EPSILON: f64 = 0.01;

/// Relative weight of each horizon when averaging per-model error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonWeights {
    pub d30: f64,
    pub d90: f64,
    pub d180: f64,
}

impl HorizonWeights {
    pub fn get(&self, horizon: Horizon) -> f64 {
        match horizon {
            Horizon::D30 => self.d30,
            Horizon::D90 => self.d90,
            Horizon::D180 => self.d180,
        }
    }
}

impl Default for HorizonWeights {
    fn default() -> Self {
        Self {
            d30: 0.5,
            d90: 0.3,
            d180: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackConfig {
    /// Minimum 30d samples before a model takes part in feedback for an archetype.
    pub min_samples: usize,
    /// Share of feedback weights in the final blend.
    pub blend_ratio: f64,
    /// Cap on any single model's share, applied after each blending stage.
    pub max_weight: f64,
    pub stale_after: chrono::Duration,
    pub horizon_weights: HorizonWeights,
    pub epsilon: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            blend_ratio: DEFAULT_BLEND_RATIO,
            max_weight: DEFAULT_MAX_WEIGHT,
            stale_after: chrono::Duration::hours(DEFAULT_STALE_HOURS),
            horizon_weights: HorizonWeights::default(),
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl FeedbackConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let hw = d.horizon_weights;
        Self {
            min_samples: env_or("FEEDBACK_MIN_SAMPLES", d.min_samples),
            blend_ratio: env_or("FEEDBACK_BLEND_RATIO", d.blend_ratio).clamp(0.0, 1.0),
            max_weight: env_or("FEEDBACK_MAX_WEIGHT", d.max_weight),
            stale_after: chrono::Duration::hours(env_or(
                "FEEDBACK_STALE_HOURS",
                DEFAULT_STALE_HOURS,
            )),
            horizon_weights: HorizonWeights {
                d30: env_or("FEEDBACK_HORIZON_WEIGHT_30D", hw.d30),
                d90: env_or("FEEDBACK_HORIZON_WEIGHT_90D", hw.d90),
                d180: env_or("FEEDBACK_HORIZON_WEIGHT_180D", hw.d180),
            },
            epsilon: d.epsilon,
        }
    }
}
