//! 🏭 Decision pack generation
//!
//! Per candidate, in order:
//!   duplicate lookup → regime stamp → calibration ceiling → Kelly sizing (bandit
//!   sizing action) → brackets → risk:reward guard → sign → insert
//!
//! Idempotent per (hypothesis, asset): the lookup runs before any work and the table's
//! UNIQUE constraint catches a racing writer. Each candidate is processed on its own;
//! a failure is logged with the candidate id and the batch continues.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::bandit::{sizing_multiplier, BanditError, BanditKey, BanditRegistry, DecisionDimension};
use super::calibration::ConfidenceCalibrationService;
use super::decision_pack::{
    Brackets, ConfidenceStack, DecisionPack, Direction, MarketSnapshot, PackEconomics, PackSizing, RiskEnvelope,
};
use super::position_sizer::{PositionSizer, SizingInput};
use crate::clock::Clock;
use crate::providers::{PriceSeriesProvider, RegimeStateProvider};
use crate::regime::RegimeLabel;
use crate::signing::{RecordSigner, SigningError};
use crate::store::{retry_once, SqliteStore, StoreError, StoreErrorKind};

/// A scored signal waiting to become a pack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub id: Uuid,
    /// Hypothesis / upstream reference; (source_ref, asset) is the idempotency key
    pub source_ref: String,
    pub strategy: String,
    pub asset: String,
    pub asset_class: String,
    pub direction: Direction,
    pub forecast_type: String,
    pub raw_confidence: f64,
    /// Sharpe-like edge score
    pub edge: f64,
    /// External signal-agreement multiplier
    pub agreement: f64,
    /// Regime the candidate was scored under
    pub regime: RegimeLabel,
    pub created_at: DateTime<Utc>,
}

/// Why a candidate produced no pack
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoRegime,
    NoPrice,
    NoCalibration { detail: String },
    KellyBelowFloor,
    NeutralDirection,
    RiskRewardBelowMinimum { risk_reward: f64 },
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::NoRegime => "NO_REGIME",
            SkipReason::NoPrice => "NO_PRICE",
            SkipReason::NoCalibration { .. } => "NO_CALIBRATION",
            SkipReason::KellyBelowFloor => "KELLY_BELOW_FLOOR",
            SkipReason::NeutralDirection => "NEUTRAL_DIRECTION",
            SkipReason::RiskRewardBelowMinimum { .. } => "RISK_REWARD_BELOW_MINIMUM",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCalibration { detail } => write!(f, "{} ({})", self.code(), detail),
            SkipReason::RiskRewardBelowMinimum { risk_reward } => write!(f, "{} ({:.2})", self.code(), risk_reward),
            _ => f.write_str(self.code()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Bandit(#[from] BanditError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Created(Uuid),
    /// Dry run: everything but the insert succeeded
    WouldCreate(Uuid),
    /// A pack already exists for (source_ref, asset)
    Duplicate(Uuid),
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct GenerationReport {
    pub outcomes: Vec<(Uuid, CandidateOutcome)>,
}

impl GenerationReport {
    fn count(&self, pred: impl Fn(&CandidateOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Created(_) | CandidateOutcome::WouldCreate(_)))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Duplicate(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Failed(_)))
    }
}

#[derive(Debug, Clone)]
pub struct PackGeneratorConfig {
    pub capital_usd: f64,
    pub stop_pct: f64,
    pub target_pct: f64,
    pub min_risk_reward: f64,
    /// Applied after the calibration cap
    pub confidence_damping: f64,
    pub snapshot_ttl_secs: i64,
    pub order_ttl_secs: i64,
    pub dry_run: bool,
}

impl Default for PackGeneratorConfig {
    fn default() -> Self {
        Self {
            capital_usd: 100_000.0,
            stop_pct: 0.05,
            target_pct: 0.10,
            min_risk_reward: 1.0,
            confidence_damping: 0.90,
            snapshot_ttl_secs: 4 * 3600,
            order_ttl_secs: 24 * 3600,
            dry_run: false,
        }
    }
}

pub struct PackGenerator {
    store: Arc<SqliteStore>,
    prices: Arc<dyn PriceSeriesProvider>,
    regimes: Arc<dyn RegimeStateProvider>,
    calibration: Arc<dyn ConfidenceCalibrationService>,
    sizer: PositionSizer,
    bandits: Arc<BanditRegistry>,
    signer: RecordSigner,
    clock: Arc<dyn Clock>,
    config: PackGeneratorConfig,
}

impl PackGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        prices: Arc<dyn PriceSeriesProvider>,
        regimes: Arc<dyn RegimeStateProvider>,
        calibration: Arc<dyn ConfidenceCalibrationService>,
        sizer: PositionSizer,
        bandits: Arc<BanditRegistry>,
        signer: RecordSigner,
        clock: Arc<dyn Clock>,
        config: PackGeneratorConfig,
    ) -> Self {
        Self {
            store,
            prices,
            regimes,
            calibration,
            sizer,
            bandits,
            signer,
            clock,
            config,
        }
    }

    /// Process every candidate independently
    pub fn generate(&self, candidates: &[SignalCandidate]) -> GenerationReport {
        let mut report = GenerationReport::default();

        for candidate in candidates {
            let outcome = match self.process(candidate) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("❌ Pack generation failed for candidate {}: {}", candidate.id, e);
                    CandidateOutcome::Failed(e.to_string())
                }
            };
            if let CandidateOutcome::Skipped(reason) = &outcome {
                debug!("⏭️ Candidate {} ({}) skipped: {}", candidate.id, candidate.asset, reason);
            }
            report.outcomes.push((candidate.id, outcome));
        }

        info!(
            "📦 Pack generation{}: {} created, {} duplicates, {} skipped, {} failed",
            if self.config.dry_run { " (dry run)" } else { "" },
            report.created(),
            report.duplicates(),
            report.skipped(),
            report.failed()
        );
        report
    }

    fn process(&self, candidate: &SignalCandidate) -> Result<CandidateOutcome, GenerationError> {
        let now = self.clock.now();

        // 1. Duplicate lookup
        if let Some(existing) = self.store.find_pack(&candidate.source_ref, &candidate.asset)? {
            return Ok(CandidateOutcome::Duplicate(existing.id()));
        }

        // 2. Regime stamp
        let regime = match self.regimes.current_regime(&candidate.asset)? {
            Some(regime) => regime,
            None => return Ok(CandidateOutcome::Skipped(SkipReason::NoRegime)),
        };

        let bar = match self.prices.latest_bar(&candidate.asset, now)? {
            Some(bar) if bar.close > 0.0 => bar,
            _ => return Ok(CandidateOutcome::Skipped(SkipReason::NoPrice)),
        };

        // 3. Calibration ceiling (no band = no attestation = skip)
        let ceiling = match self
            .calibration
            .ceiling(&candidate.forecast_type, candidate.raw_confidence, regime)
        {
            Ok(ceiling) => ceiling,
            Err(e) => {
                return Ok(CandidateOutcome::Skipped(SkipReason::NoCalibration { detail: e.to_string() }));
            }
        };
        let confidence = ConfidenceStack::new(candidate.raw_confidence, ceiling.ceiling, self.config.confidence_damping);

        // 4. Kelly sizing with the bandit's sizing action
        let bandit_key = BanditKey::new(candidate.strategy.clone(), regime, DecisionDimension::Sizing);
        let action = self.bandits.select(&bandit_key)?;
        let multiplier = sizing_multiplier(&action).unwrap_or(1.0);
        let size = self.sizer.calculate(
            &SizingInput::new(candidate.edge, confidence.damped, self.config.capital_usd)
                .with_price(bar.close)
                .with_agreement(candidate.agreement)
                .with_action_multiplier(multiplier),
        );
        if size.is_skip() {
            return Ok(CandidateOutcome::Skipped(SkipReason::KellyBelowFloor));
        }

        // 5. Brackets
        let risk = RiskEnvelope::new(self.config.stop_pct, self.config.target_pct);
        let brackets = Brackets::compute(candidate.direction, bar.close, &risk);
        if !brackets.is_complete() {
            return Ok(CandidateOutcome::Skipped(SkipReason::NeutralDirection));
        }

        // 6. Risk:reward guard
        if risk.risk_reward < self.config.min_risk_reward {
            return Ok(CandidateOutcome::Skipped(SkipReason::RiskRewardBelowMinimum {
                risk_reward: risk.risk_reward,
            }));
        }

        // 7. Sign
        let economics = PackEconomics {
            source_ref: candidate.source_ref.clone(),
            strategy: candidate.strategy.clone(),
            asset: candidate.asset.clone(),
            asset_class: candidate.asset_class.clone(),
            direction: candidate.direction,
            forecast_type: candidate.forecast_type.clone(),
            snapshot: MarketSnapshot {
                price: bar.close,
                regime,
                observed_at: now,
                ttl_secs: self.config.snapshot_ttl_secs,
            },
            calibration_attestation: Some(ceiling.attestation(&candidate.forecast_type)),
            confidence,
            risk,
            brackets,
            sizing: PackSizing {
                usd: size.usd,
                quantity: size.quantity,
                kelly_fraction: size.fraction,
                category: size.category,
                sizing_action: Some(action),
            },
            order_ttl_secs: self.config.order_ttl_secs,
            created_at: now,
        };
        let pack = DecisionPack::seal(economics, &self.signer, now)?;

        if self.config.dry_run {
            info!(
                "🧪 [dry run] would create pack {} {} {} ${:.2}",
                pack.asset(),
                pack.direction(),
                size.category,
                size.usd
            );
            return Ok(CandidateOutcome::WouldCreate(pack.id()));
        }

        // 8. Insert (retried once on transient failure)
        match retry_once("insert pack", || self.store.insert_pack(&pack)) {
            Ok(()) => {
                info!(
                    "📦 Pack {} created: {} {} {} ${:.2} (kelly {:.2}%)",
                    pack.id(),
                    pack.asset(),
                    pack.direction(),
                    size.category,
                    size.usd,
                    size.fraction * 100.0
                );
                Ok(CandidateOutcome::Created(pack.id()))
            }
            Err(e) if e.kind == StoreErrorKind::Duplicate => {
                // Lost a race with another writer
                let existing = self
                    .store
                    .find_pack(&candidate.source_ref, &candidate.asset)?
                    .map(|p| p.id())
                    .unwrap_or(pack.id());
                Ok(CandidateOutcome::Duplicate(existing))
            }
            Err(e) => Err(e.into()),
        }
    }
}
