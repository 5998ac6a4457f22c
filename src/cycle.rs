//! 🔁 Scoring cycle
//!
//! One externally triggered pass over every tracked (symbol, interval):
//! features → classify → persistence → validation → budgeted scoring → signal candidate.
//! Each key is processed independently; one key's failure is logged and counted.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::decision_engine::pack_generator::SignalCandidate;
use crate::regime::{RegimeClassifier, RegimeKey, RegimePersistenceTracker};
use crate::scoring::{BudgetedScorer, NotComputedReason, ScoreOutcome, ScoreRequest};
use crate::signing::RecordSigner;
use crate::store::{retry_once, SqliteStore, StoreError};
use crate::validation::{RegimeValidationInput, ValidationFramework};

#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Strategy name stamped on produced candidates
    pub strategy: String,
    pub asset_class: String,
    /// Signal-agreement multiplier handed to the sizer
    pub agreement: f64,
    pub loop_interval_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            strategy: "regime_momentum".to_string(),
            asset_class: "equity".to_string(),
            agreement: 1.0,
            loop_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Candidate stored
    Scored(Uuid),
    /// Validation passed but the backend produced nothing
    NotScored(NotComputedReason),
    /// ERROR/CRITICAL validation failure; lists "tier:check"
    Blocked(Vec<String>),
    InsufficientFeatures { present: usize },
    NoFeatures,
    /// Latest feature vector already applied
    AlreadyCurrent,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(RegimeKey, CycleOutcome)>,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&CycleOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn scored(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::Scored(_)))
    }

    pub fn blocked(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::Blocked(_)))
    }

    pub fn not_scored(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::NotScored(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CycleOutcome::Failed(_)))
    }
}

pub struct ScoringCycle {
    store: Arc<SqliteStore>,
    classifier: RegimeClassifier,
    tracker: Arc<RegimePersistenceTracker>,
    validator: ValidationFramework,
    scorer: BudgetedScorer,
    clock: Arc<dyn Clock>,
    config: CycleConfig,
}

impl ScoringCycle {
    pub fn new(
        store: Arc<SqliteStore>,
        classifier: RegimeClassifier,
        tracker: Arc<RegimePersistenceTracker>,
        validator: ValidationFramework,
        scorer: BudgetedScorer,
        clock: Arc<dyn Clock>,
        config: CycleConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            tracker,
            validator,
            scorer,
            clock,
            config,
        }
    }

    /// Rebuild the persistence tracker from stored records and transition logs
    pub fn restore_tracker(store: &SqliteStore, signer: RecordSigner) -> Result<RegimePersistenceTracker, StoreError> {
        let records = store.load_persistence_records()?;
        let transitions = store.load_transitions()?;
        Ok(RegimePersistenceTracker::restore(signer, records, transitions))
    }

    pub fn tracker(&self) -> &RegimePersistenceTracker {
        &self.tracker
    }

    pub async fn run_once(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let keys = match retry_once("tracked keys", || self.store.tracked_keys()) {
            Ok(keys) => keys,
            Err(e) => {
                error!("❌ Scoring cycle could not list tracked keys: {}", e);
                return report;
            }
        };

        for key in keys {
            let outcome = match self.process_key(&key).await {
                Ok(outcome) => outcome,
                Err(detail) => {
                    error!("❌ {} failed: {}", key, detail);
                    CycleOutcome::Failed(detail)
                }
            };
            report.outcomes.push((key, outcome));
        }

        info!(
            "🔁 Scoring cycle: {} keys, {} scored, {} not scored, {} blocked, {} failed",
            report.outcomes.len(),
            report.scored(),
            report.not_scored(),
            report.blocked(),
            report.failed()
        );
        report
    }

    async fn process_key(&self, key: &RegimeKey) -> Result<CycleOutcome, String> {
        let (at, features) = match retry_once("latest feature vector", || self.store.latest_feature_vector(key))
            .map_err(|e| e.to_string())?
        {
            Some(latest) => latest,
            None => return Ok(CycleOutcome::NoFeatures),
        };

        if let Some(record) = self.tracker.record(key) {
            if at <= record.updated_at {
                return Ok(CycleOutcome::AlreadyCurrent);
            }
        }

        let previous = self.tracker.current_regime(key);
        let classification = self.classifier.classify(&features, previous);
        if !classification.valid {
            warn!(
                "⚠️ {} at {}: only {}/7 features present, regime not updated",
                key, at, classification.features_present
            );
            return Ok(CycleOutcome::InsufficientFeatures {
                present: classification.features_present,
            });
        }

        // Store write happens under the tracker's key lock; on failure neither side advances
        let update = self
            .tracker
            .update_regime_with(key, classification.label, classification.confidence, at, |u| {
                retry_once("commit regime update", || {
                    self.store.commit_regime_update(&u.record, u.transition.as_ref())
                })
            })
            .map_err(|e| e.to_string())?;

        let transitions = self.tracker.transitions(key);
        let report = self.validator.validate_regime(&RegimeValidationInput {
            subject: key.to_string(),
            features: &features,
            classification: &classification,
            record: &update.record,
            transitions: &transitions,
            now: at,
        });
        if report.blocks_downstream() {
            let failures = report
                .failures()
                .map(|r| format!("{}:{}", r.tier, r.check))
                .collect::<Vec<_>>();
            return Ok(CycleOutcome::Blocked(failures));
        }
        if !report.overall_pass() {
            warn!("⚠️ {} signal untrusted, scoring anyway", key);
        }

        let request = ScoreRequest::new(key, &classification, &update.record);
        let score = match self.scorer.score(&request).await {
            ScoreOutcome::Computed(score) => score,
            ScoreOutcome::NotComputed(reason) => {
                info!("⏭️ {} not scored: {}", key, reason);
                return Ok(CycleOutcome::NotScored(reason));
            }
        };

        let candidate = SignalCandidate {
            id: Uuid::new_v4(),
            source_ref: source_ref(&self.config.strategy, key, at),
            strategy: self.config.strategy.clone(),
            asset: key.symbol.clone(),
            asset_class: self.config.asset_class.clone(),
            direction: score.direction,
            forecast_type: score.forecast_type,
            raw_confidence: score.confidence,
            edge: score.edge,
            agreement: self.config.agreement,
            regime: update.record.regime,
            created_at: self.clock.now(),
        };
        retry_once("insert signal candidate", || self.store.insert_signal_candidate(&candidate))
            .map_err(|e| e.to_string())?;

        info!(
            "📈 {} candidate {}: {} edge={:.3} conf={:.2} regime={}",
            key, candidate.id, candidate.direction, candidate.edge, candidate.raw_confidence, candidate.regime
        );
        Ok(CycleOutcome::Scored(candidate.id))
    }

    /// Repeat `run_once` on a fixed interval until Ctrl-C
    pub async fn run_loop(&self) {
        let period = std::time::Duration::from_secs(self.config.loop_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        info!("🔁 Scoring loop every {}s", period.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Scoring loop stopped");
                    break;
                }
            }
        }
    }
}

/// One candidate per strategy, key and observation day
fn source_ref(strategy: &str, key: &RegimeKey, at: DateTime<Utc>) -> String {
    format!("{}:{}:{}", strategy, key.interval, at.format("%Y%m%d"))
}
