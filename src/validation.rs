//! ✅ Regime Validation Framework
//!
//! Five independent tiers gate classifier/tracker output before anything downstream
//! trusts it:
//! - Tier 1: signature verification (CRITICAL)
//! - Tier 2: feature quality, ≥ 5 of 7 present (WARNING, reported but untrusted)
//! - Tier 3: average regime-segment duration ≥ minimum (ERROR)
//! - Tier 4: 90-day transition count ≤ ceiling (ERROR)
//! - Tier 5: internal consistency of the classification (CRITICAL)
//!
//! Overall trust needs every tier to pass; only ERROR/CRITICAL failures block.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decision_engine::decision_pack::DecisionPack;
use crate::regime::{
    FeatureVector, PersistenceRecord, RegimeClassification, RegimeLabel, RegimeTransition, TRANSITION_WINDOW_DAYS,
};
use crate::signing::RecordSigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn blocks(self) -> bool {
        self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub tier: u8,
    pub check: String,
    pub passed: bool,
    pub severity: Severity,
    pub reason: String,
}

impl ValidationResult {
    fn pass(tier: u8, check: &str, reason: impl Into<String>) -> Self {
        Self {
            tier,
            check: check.to_string(),
            passed: true,
            severity: Severity::Info,
            reason: reason.into(),
        }
    }

    fn fail(tier: u8, check: &str, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            tier,
            check: check.to_string(),
            passed: false,
            severity,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub subject: String,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn overall_pass(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// True only for ERROR/CRITICAL failures
    pub fn blocks_downstream(&self) -> bool {
        self.results.iter().any(|r| !r.passed && r.severity.blocks())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn tier(&self, tier: u8) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.tier == tier)
    }

    fn log(&self) {
        for failure in self.failures() {
            warn!(
                "⚠️ {} tier {} {} [{}]: {}",
                self.subject, failure.tier, failure.check, failure.severity, failure.reason
            );
        }
        debug!(
            "✅ {} validation: pass={} blocks={}",
            self.subject,
            self.overall_pass(),
            self.blocks_downstream()
        );
    }
}

/// Validation configuration
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Minimum non-null features (default: 5)
    pub min_features: usize,

    /// Minimum average regime-segment duration in days (default: 5)
    pub min_avg_segment_days: f64,

    /// Maximum transitions in the trailing 90 days (default: 30)
    pub max_transitions_90d: u32,

    /// Probability sum / confidence tolerance (default: 0.01)
    pub tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_features: 5,
            min_avg_segment_days: 5.0,
            max_transitions_90d: 30,
            tolerance: 0.01,
        }
    }
}

/// Everything one regime validation looks at
pub struct RegimeValidationInput<'a> {
    pub subject: String,
    pub features: &'a FeatureVector,
    pub classification: &'a RegimeClassification,
    pub record: &'a PersistenceRecord,
    pub transitions: &'a [RegimeTransition],
    pub now: DateTime<Utc>,
}

pub struct ValidationFramework {
    config: ValidationConfig,
    signer: RecordSigner,
}

impl ValidationFramework {
    pub fn new(config: ValidationConfig, signer: RecordSigner) -> Self {
        Self { config, signer }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run all five tiers
    pub fn validate_regime(&self, input: &RegimeValidationInput<'_>) -> ValidationReport {
        let report = ValidationReport {
            subject: input.subject.clone(),
            results: vec![
                self.check_signature(input.record),
                self.check_feature_quality(input.features),
                self.check_persistence(input.transitions, input.now),
                self.check_transition_rate(input.record),
                self.check_consistency(input.classification),
            ],
        };
        report.log();
        report
    }

    /// Tier 1 against a decision pack: evidence hash and signature recomputation
    pub fn validate_pack(&self, pack: &DecisionPack) -> ValidationReport {
        let hash = if pack.seal_info().evidence_hash.is_none() {
            ValidationResult::fail(1, "evidence_hash", Severity::Critical, "evidence hash missing")
        } else if pack.evidence_matches() {
            ValidationResult::pass(1, "evidence_hash", "evidence hash matches economic fields")
        } else {
            ValidationResult::fail(
                1,
                "evidence_hash",
                Severity::Critical,
                "evidence hash does not match economic fields",
            )
        };
        let signature = if pack.signature_valid(&self.signer) {
            ValidationResult::pass(1, "pack_signature", "signature verified")
        } else {
            ValidationResult::fail(1, "pack_signature", Severity::Critical, "signature missing or invalid")
        };

        let report = ValidationReport {
            subject: format!("pack {}", pack.id()),
            results: vec![hash, signature],
        };
        report.log();
        report
    }

    /// Tier 1: recompute and byte-compare the persistence signature
    pub fn check_signature(&self, record: &PersistenceRecord) -> ValidationResult {
        if record.verify(&self.signer) {
            ValidationResult::pass(1, "signature", "persistence signature verified")
        } else {
            ValidationResult::fail(
                1,
                "signature",
                Severity::Critical,
                format!("persistence record {} failed signature verification", record.key),
            )
        }
    }

    /// Tier 2
    pub fn check_feature_quality(&self, features: &FeatureVector) -> ValidationResult {
        let present = features.present_count();
        if present >= self.config.min_features {
            ValidationResult::pass(2, "feature_quality", format!("{}/7 features present", present))
        } else {
            ValidationResult::fail(
                2,
                "feature_quality",
                Severity::Warning,
                format!("{}/7 features present, need {}", present, self.config.min_features),
            )
        }
    }

    /// Tier 3: mean prior-duration of segments completed inside the trailing window
    pub fn check_persistence(&self, transitions: &[RegimeTransition], now: DateTime<Utc>) -> ValidationResult {
        let window_start = now - Duration::days(TRANSITION_WINDOW_DAYS);
        let durations: Vec<i64> = transitions
            .iter()
            .filter(|t| t.at > window_start && t.at <= now)
            .map(|t| t.prior_duration_days)
            .collect();

        if durations.is_empty() {
            return ValidationResult::pass(3, "persistence", "no completed regime segment in window");
        }

        let avg = durations.iter().sum::<i64>() as f64 / durations.len() as f64;
        if avg >= self.config.min_avg_segment_days {
            ValidationResult::pass(
                3,
                "persistence",
                format!("average segment {:.1}d over {} segments", avg, durations.len()),
            )
        } else {
            ValidationResult::fail(
                3,
                "persistence",
                Severity::Error,
                format!(
                    "average segment {:.1}d < minimum {:.1}d",
                    avg, self.config.min_avg_segment_days
                ),
            )
        }
    }

    /// Tier 4
    pub fn check_transition_rate(&self, record: &PersistenceRecord) -> ValidationResult {
        let count = record.transition_count_90d;
        if count <= self.config.max_transitions_90d {
            ValidationResult::pass(4, "transition_rate", format!("{} transitions in 90d", count))
        } else {
            ValidationResult::fail(
                4,
                "transition_rate",
                Severity::Error,
                format!(
                    "{} transitions in 90d exceeds ceiling {}",
                    count, self.config.max_transitions_90d
                ),
            )
        }
    }

    /// Tier 5: state/label agreement, probabilities sum, confidence = max probability
    pub fn check_consistency(&self, classification: &RegimeClassification) -> ValidationResult {
        let tol = self.config.tolerance;

        if RegimeLabel::from_state(classification.state) != Some(classification.label) {
            return ValidationResult::fail(
                5,
                "consistency",
                Severity::Critical,
                format!(
                    "state {} does not match label {}",
                    classification.state, classification.label
                ),
            );
        }

        let sum: f64 = classification.probabilities.iter().sum();
        if (sum - 1.0).abs() > tol || classification.probabilities.iter().any(|p| !p.is_finite()) {
            return ValidationResult::fail(
                5,
                "consistency",
                Severity::Critical,
                format!("probabilities sum to {:.4}", sum),
            );
        }

        let max = classification.probabilities.iter().cloned().fold(f64::MIN, f64::max);
        if (classification.confidence - max).abs() > tol {
            return ValidationResult::fail(
                5,
                "consistency",
                Severity::Critical,
                format!(
                    "confidence {:.4} differs from max probability {:.4}",
                    classification.confidence, max
                ),
            );
        }

        ValidationResult::pass(5, "consistency", "label, state and probabilities agree")
    }
}
