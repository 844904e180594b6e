use crate::domain::accuracy::AccuracyCheck;
use crate::domain::classification::{Archetype, Weights};
use crate::domain::model::ModelKey;
use crate::feedback::adaptive::{compute_by_archetype, ArchetypeFeedback};
use crate::feedback::FeedbackConfig;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct Snapshot {
    computed_at: DateTime<Utc>,
    total_checks: usize,
    by_archetype: BTreeMap<Archetype, ArchetypeFeedback>,
}

/// A fresh feedback entry handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEntry {
    pub feedback: ArchetypeFeedback,
    pub computed_at: DateTime<Utc>,
    pub total_checks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchetypeStatus {
    pub weights: Weights,
    pub total_checks: usize,
    pub sample_counts: BTreeMap<ModelKey, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub initialized: bool,
    pub computed_at: Option<DateTime<Utc>>,
    pub age_ms: Option<i64>,
    pub is_stale: bool,
    pub total_checks: usize,
    pub covered_types: Vec<Archetype>,
    pub feedback_by_type: BTreeMap<Archetype, ArchetypeStatus>,
}

/// Feedback weights by archetype, replaced wholesale on refresh.
///
/// Readers load the current snapshot without locking; an entry older than the
/// staleness window reads as absent until the next refresh.
pub struct FeedbackCache {
    snapshot: ArcSwap<Option<Snapshot>>,
    clock: Arc<dyn Clock>,
    config: FeedbackConfig,
}

impl FeedbackCache {
    pub fn new(config: FeedbackConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FeedbackConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(None),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    fn is_fresh(&self, computed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - computed_at < self.config.stale_after
    }

    pub fn get(&self, archetype: Archetype) -> Option<FeedbackEntry> {
        let guard = self.snapshot.load();
        let snap = (**guard).as_ref()?;
        if !self.is_fresh(snap.computed_at, self.clock.now()) {
            return None;
        }
        snap.by_archetype.get(&archetype).map(|f| FeedbackEntry {
            feedback: f.clone(),
            computed_at: snap.computed_at,
            total_checks: snap.total_checks,
        })
    }

    /// Recompute from every accuracy check and swap in the result. Returns the number
    /// of archetypes covered.
    pub fn refresh(&self, checks: &[AccuracyCheck]) -> usize {
        let by_archetype = compute_by_archetype(checks, &self.config);
        let covered = by_archetype.len();
        self.snapshot.store(Arc::new(Some(Snapshot {
            computed_at: self.clock.now(),
            total_checks: checks.len(),
            by_archetype,
        })));
        tracing::info!(total_checks = checks.len(), covered, "feedback cache refreshed");
        covered
    }

    pub fn clear(&self) {
        self.snapshot.store(Arc::new(None));
    }

    pub fn status(&self) -> CacheStatus {
        let guard = self.snapshot.load();
        let Some(snap) = (**guard).as_ref() else {
            return CacheStatus {
                initialized: false,
                computed_at: None,
                age_ms: None,
                is_stale: false,
                total_checks: 0,
                covered_types: Vec::new(),
                feedback_by_type: BTreeMap::new(),
            };
        };
        let now = self.clock.now();
        CacheStatus {
            initialized: true,
            computed_at: Some(snap.computed_at),
            age_ms: Some((now - snap.computed_at).num_milliseconds()),
            is_stale: !self.is_fresh(snap.computed_at, now),
            total_checks: snap.total_checks,
            covered_types: snap.by_archetype.keys().copied().collect(),
            feedback_by_type: snap
                .by_archetype
                .iter()
                .map(|(a, f)| {
                    (
                        *a,
                        ArchetypeStatus {
                            weights: f.weights.clone(),
                            total_checks: f.total_checks,
                            sample_counts: f.sample_counts.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::accuracy::{HorizonErrors, HorizonOutcome};
    use crate::domain::recommendation::Action;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Mutex;
    use uuid::Uuid;

    pub(crate) struct FixedClock(pub Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub(crate) fn at(t: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(t)))
        }

        pub(crate) fn advance(&self, d: chrono::Duration) {
            let mut t = self.0.lock().unwrap();
            *t += d;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    pub(crate) fn growth_checks(n: usize) -> Vec<AccuracyCheck> {
        (0..n)
            .map(|_| AccuracyCheck {
                id: Uuid::new_v4(),
                analysis_id: Uuid::new_v4(),
                ticker: "2330".to_string(),
                analysis_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                predicted_fair_value: 100.0,
                predicted_action: Action::Buy,
                price_at_analysis: 90.0,
                classification_type: Some(Archetype::Growth),
                d30: HorizonOutcome::default(),
                d90: HorizonOutcome::default(),
                d180: HorizonOutcome::default(),
                model_fair_values: BTreeMap::new(),
                model_errors: [
                    (ModelKey::Dcf, 12.0),
                    (ModelKey::Per, 6.0),
                    (ModelKey::Pbr, 9.0),
                ]
                .into_iter()
                .map(|(k, m)| {
                    (
                        k,
                        HorizonErrors {
                            mae_30d: Some(m),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            })
            .collect()
    }

    #[test]
    fn empty_cache_reports_uninitialized() {
        let cache = FeedbackCache::new(FeedbackConfig::default());
        assert!(cache.get(Archetype::Growth).is_none());
        let status = cache.status();
        assert!(!status.initialized);
        assert!(status.covered_types.is_empty());
    }

    #[test]
    fn entries_expire_after_staleness_window() {
        let clock = FixedClock::at(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let cache = FeedbackCache::with_clock(FeedbackConfig::default(), clock.clone());

        assert_eq!(cache.refresh(&growth_checks(6)), 1);
        let entry = cache.get(Archetype::Growth).unwrap();
        assert_eq!(entry.total_checks, 6);
        assert!(cache.get(Archetype::IncomeStock).is_none());

        clock.advance(chrono::Duration::hours(23));
        assert!(cache.get(Archetype::Growth).is_some());
        assert!(!cache.status().is_stale);

        clock.advance(chrono::Duration::hours(1));
        assert!(cache.get(Archetype::Growth).is_none());
        let status = cache.status();
        assert!(status.initialized);
        assert!(status.is_stale);
        assert_eq!(status.age_ms, Some(24 * 3_600_000));
        assert_eq!(status.covered_types, vec![Archetype::Growth]);

        cache.refresh(&growth_checks(6));
        assert!(cache.get(Archetype::Growth).is_some());
    }

    #[test]
    fn clear_drops_snapshot() {
        let cache = FeedbackCache::new(FeedbackConfig::default());
        cache.refresh(&growth_checks(5));
        cache.clear();
        assert!(!cache.status().initialized);
    }
}
