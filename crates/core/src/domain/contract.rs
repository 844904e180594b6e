//! Trust boundary for externally supplied classification/weight proposals.
//!
//! A proposal is accepted whole or not at all; nothing from a rejected proposal may
//! reach the blender.

use crate::domain::classification::{Archetype, Weights};
use crate::domain::model::ModelKey;
use crate::error::GuardrailViolation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Largest share any single model may receive in a proposal.
pub const MAX_PROPOSED_WEIGHT: f64 = 0.50;
/// Allowed deviation of the proposed weight sum from 1.0.
pub const WEIGHT_SUM_SLACK: f64 = 0.02;

const DEFAULT_CONFIDENCE: &str = "MEDIUM";

/// Proposal exactly as received. Every field is untrusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalProposal {
    #[serde(rename = "type", default)]
    pub archetype: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weights: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
}

/// A proposal that passed every check, with weights summing to exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedProposal {
    #[serde(rename = "type")]
    pub archetype: Archetype,
    pub description: String,
    pub weights: Weights,
    pub confidence: String,
    pub narrative: String,
}

impl ExternalProposal {
    pub fn validate_and_into_sanitized(
        self,
        available: &BTreeMap<ModelKey, bool>,
    ) -> Result<SanitizedProposal, GuardrailViolation> {
        let mut errors = Vec::new();

        let archetype = match self.archetype.as_deref().and_then(Archetype::from_label) {
            Some(a) => Some(a),
            None => {
                let valid: Vec<&str> = Archetype::ALL.iter().map(|a| a.label()).collect();
                errors.push(format!(
                    "invalid type {:?}; must be one of: {}",
                    self.archetype.as_deref().unwrap_or(""),
                    valid.join(", ")
                ));
                None
            }
        };

        let Some(raw_weights) = self.weights else {
            errors.push("missing weights object".to_string());
            return Err(GuardrailViolation { errors });
        };

        for key in raw_weights.keys() {
            if ModelKey::from_wire(key).is_none() {
                tracing::warn!(key = %key, "ignoring unknown model key in proposal");
            }
        }

        let mut weights = Weights::new();
        for key in ModelKey::ALL {
            let Some(w) = raw_weights.get(key.as_str()).and_then(Value::as_f64) else {
                errors.push(format!(
                    "weights.{key} must be a number (got {})",
                    raw_weights
                        .get(key.as_str())
                        .map(Value::to_string)
                        .unwrap_or_else(|| "nothing".to_string())
                ));
                continue;
            };

            if !w.is_finite() || !(0.0..=MAX_PROPOSED_WEIGHT).contains(&w) {
                errors.push(format!(
                    "weights.{key} = {w} is outside [0, {MAX_PROPOSED_WEIGHT}]"
                ));
                continue;
            }

            let is_available = available.get(&key).copied().unwrap_or(false);
            if !is_available && w != 0.0 {
                errors.push(format!(
                    "model {key} is unavailable but weights.{key} = {w} (must be 0)"
                ));
                continue;
            }

            weights.set(key, w);
        }

        if !errors.is_empty() {
            return Err(GuardrailViolation { errors });
        }

        let sum = weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_SLACK {
            errors.push(format!(
                "weights sum to {:.4}, outside 1.0 ± {WEIGHT_SUM_SLACK}",
                sum
            ));
            return Err(GuardrailViolation { errors });
        }

        let (Some(archetype), Some(weights)) = (archetype, weights.normalized()) else {
            return Err(GuardrailViolation {
                errors: vec!["weights could not be normalized".to_string()],
            });
        };

        Ok(SanitizedProposal {
            archetype,
            description: trimmed_or_empty(self.description),
            weights,
            confidence: self
                .confidence
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_CONFIDENCE.to_string()),
            narrative: trimmed_or_empty(self.narrative),
        })
    }
}

fn trimmed_or_empty(s: Option<String>) -> String {
    s.map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Per-ticker outcome of validating a batch of proposals.
pub type BatchValidation = BTreeMap<String, Result<SanitizedProposal, GuardrailViolation>>;

pub fn validate_batch(
    batch: BTreeMap<String, ExternalProposal>,
    availability: &BTreeMap<String, BTreeMap<ModelKey, bool>>,
) -> BatchValidation {
    batch
        .into_iter()
        .map(|(ticker, proposal)| {
            let result = match availability.get(&ticker) {
                Some(available) => proposal.validate_and_into_sanitized(available),
                None => Err(GuardrailViolation {
                    errors: vec![format!("no model availability known for {ticker}")],
                }),
            };
            (ticker, result)
        })
        .collect()
}
