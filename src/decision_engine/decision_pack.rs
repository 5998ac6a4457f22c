//! 📦 Decision Pack - immutable, hashed, signed trade intent
//!
//! A pack aggregates the regime stamp, confidence stack, risk envelope, brackets and
//! sizing for one (hypothesis, asset). The economic fields are hashed (SHA-256 over
//! canonical JSON) and the pack is signed over `id|evidence_hash|signer|signed_at`.
//!
//! Economic fields are private and have no setters; only the execution outcome can be
//! written after signing. `is_valid_for_execution` is fail-closed and returns the first
//! named rejection.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::position_sizer::SizeCategory;
use crate::regime::RegimeLabel;
use crate::signing::{evidence_hash, RecordSigner, SigningError};

/// Minimum reward:risk for an executable pack
pub const MIN_RISK_REWARD: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        }
    }

    /// +1 long, -1 short, 0 neutral
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            "NEUTRAL" => Ok(Direction::Neutral),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Time-boxed market observation the pack was built against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub regime: RegimeLabel,
    pub observed_at: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl MarketSnapshot {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.observed_at + Duration::seconds(self.ttl_secs)
    }
}

/// raw → min(raw, ceiling) → capped × damping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStack {
    pub raw: f64,
    pub ceiling: f64,
    pub capped: f64,
    pub damping: f64,
    pub damped: f64,
}

impl ConfidenceStack {
    pub fn new(raw: f64, ceiling: f64, damping: f64) -> Self {
        let raw = raw.clamp(0.0, 1.0);
        let capped = raw.min(ceiling);
        let damping = damping.clamp(0.0, 1.0);
        Self {
            raw,
            ceiling,
            capped,
            damping,
            damped: capped * damping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEnvelope {
    pub stop_pct: f64,
    pub target_pct: f64,
    pub risk_reward: f64,
}

impl RiskEnvelope {
    pub fn new(stop_pct: f64, target_pct: f64) -> Self {
        let risk_reward = if stop_pct > 0.0 { target_pct / stop_pct } else { 0.0 };
        Self {
            stop_pct,
            target_pct,
            risk_reward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brackets {
    pub entry: Option<f64>,
    pub stop: Option<f64>,
    pub target: Option<f64>,
}

impl Brackets {
    /// Direction-aware brackets; SHORT mirrors LONG, NEUTRAL has none
    pub fn compute(direction: Direction, entry: f64, risk: &RiskEnvelope) -> Self {
        match direction {
            Direction::Long => Self {
                entry: Some(entry),
                stop: Some(entry - entry * risk.stop_pct),
                target: Some(entry + entry * risk.target_pct),
            },
            Direction::Short => Self {
                entry: Some(entry),
                stop: Some(entry + entry * risk.stop_pct),
                target: Some(entry - entry * risk.target_pct),
            },
            Direction::Neutral => Self {
                entry: Some(entry),
                stop: None,
                target: None,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.entry.is_some() && self.stop.is_some() && self.target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackSizing {
    pub usd: f64,
    pub quantity: Option<f64>,
    pub kelly_fraction: f64,
    pub category: SizeCategory,
    /// Bandit sizing action used for the Kelly multiplier
    pub sizing_action: Option<String>,
}

/// Every economically meaningful field; the evidence hash covers exactly this struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackEconomics {
    pub source_ref: String,
    pub strategy: String,
    pub asset: String,
    pub asset_class: String,
    pub direction: Direction,
    pub forecast_type: String,
    pub snapshot: MarketSnapshot,
    pub confidence: ConfidenceStack,
    pub calibration_attestation: Option<String>,
    pub risk: RiskEnvelope,
    pub brackets: Brackets,
    pub sizing: PackSizing,
    pub order_ttl_secs: i64,
    pub created_at: DateTime<Utc>,
}

impl PackEconomics {
    pub fn order_expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.order_ttl_secs)
    }
}

/// Evidence hash and signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackSeal {
    pub evidence_hash: Option<String>,
    pub signature: Option<String>,
    pub signer_id: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Rejected,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Submitted => "SUBMITTED",
            ExecutionStatus::Filled => "FILLED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "SUBMITTED" => Ok(ExecutionStatus::Submitted),
            "FILLED" => Ok(ExecutionStatus::Filled),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            "REJECTED" => Ok(ExecutionStatus::Rejected),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// The only fields that may change after signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub fill_price: Option<f64>,
    pub filled_at: Option<DateTime<Utc>>,
    pub external_order_id: Option<String>,
}

impl Default for ExecutionOutcome {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            fill_price: None,
            filled_at: None,
            external_order_id: None,
        }
    }
}

/// Why a pack may not be executed
#[derive(Debug, Clone, PartialEq)]
pub enum PackRejection {
    MissingCalibrationAttestation,
    MissingEvidenceHash,
    MissingSignature,
    EvidenceHashMismatch,
    InvalidSignature,
    SnapshotExpired { expired_at: DateTime<Utc> },
    OrderExpired { expired_at: DateTime<Utc> },
    MissingEntryPrice,
    IncompleteBrackets,
    RiskRewardBelowMinimum { risk_reward: f64 },
}

impl PackRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PackRejection::MissingCalibrationAttestation => "MISSING_CALIBRATION_ATTESTATION",
            PackRejection::MissingEvidenceHash => "MISSING_EVIDENCE_HASH",
            PackRejection::MissingSignature => "MISSING_SIGNATURE",
            PackRejection::EvidenceHashMismatch => "EVIDENCE_HASH_MISMATCH",
            PackRejection::InvalidSignature => "INVALID_SIGNATURE",
            PackRejection::SnapshotExpired { .. } => "SNAPSHOT_EXPIRED",
            PackRejection::OrderExpired { .. } => "ORDER_EXPIRED",
            PackRejection::MissingEntryPrice => "MISSING_ENTRY_PRICE",
            PackRejection::IncompleteBrackets => "INCOMPLETE_BRACKETS",
            PackRejection::RiskRewardBelowMinimum { .. } => "RISK_REWARD_BELOW_MINIMUM",
        }
    }
}

impl fmt::Display for PackRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackRejection::SnapshotExpired { expired_at } | PackRejection::OrderExpired { expired_at } => {
                write!(f, "{} (at {})", self.code(), expired_at)
            }
            PackRejection::RiskRewardBelowMinimum { risk_reward } => {
                write!(f, "{} ({:.2} < {:.2})", self.code(), risk_reward, MIN_RISK_REWARD)
            }
            _ => f.write_str(self.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPack {
    id: Uuid,
    economics: PackEconomics,
    seal: PackSeal,
    execution: ExecutionOutcome,
}

fn signature_fields(id: &Uuid, hash: &str, signer_id: &str, signed_at: &DateTime<Utc>) -> [String; 4] {
    [
        id.to_string(),
        hash.to_string(),
        signer_id.to_string(),
        signed_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    ]
}

impl DecisionPack {
    /// Hash and sign a fresh pack
    pub fn seal(economics: PackEconomics, signer: &RecordSigner, signed_at: DateTime<Utc>) -> Result<Self, SigningError> {
        let id = Uuid::new_v4();
        let hash = evidence_hash(&economics)?;
        let fields = signature_fields(&id, &hash, signer.signer_id(), &signed_at);
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        let signature = signer.sign_fields(&refs);

        debug!("📦 Sealed pack {} for {} ({})", id, economics.asset, &hash[..12]);

        Ok(Self {
            id,
            economics,
            seal: PackSeal {
                evidence_hash: Some(hash),
                signature: Some(signature),
                signer_id: Some(signer.signer_id().to_string()),
                signed_at: Some(signed_at),
            },
            execution: ExecutionOutcome::default(),
        })
    }

    /// Rehydrate a stored pack exactly as persisted (no re-signing)
    pub fn from_parts(id: Uuid, economics: PackEconomics, seal: PackSeal, execution: ExecutionOutcome) -> Self {
        Self {
            id,
            economics,
            seal,
            execution,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn economics(&self) -> &PackEconomics {
        &self.economics
    }

    pub fn seal_info(&self) -> &PackSeal {
        &self.seal
    }

    pub fn execution(&self) -> &ExecutionOutcome {
        &self.execution
    }

    pub fn source_ref(&self) -> &str {
        &self.economics.source_ref
    }

    pub fn asset(&self) -> &str {
        &self.economics.asset
    }

    pub fn direction(&self) -> Direction {
        self.economics.direction
    }

    /// Update the whitelisted execution outcome; economic fields are untouched
    pub fn record_execution(&mut self, outcome: ExecutionOutcome) {
        self.execution = outcome;
    }

    /// Recompute the evidence hash and compare with the sealed one
    pub fn evidence_matches(&self) -> bool {
        match (&self.seal.evidence_hash, evidence_hash(&self.economics)) {
            (Some(stored), Ok(fresh)) => stored.as_bytes() == fresh.as_bytes(),
            _ => false,
        }
    }

    /// Recompute the signature over id|hash|signer|signed_at and byte-compare
    pub fn signature_valid(&self, signer: &RecordSigner) -> bool {
        let (Some(hash), Some(sig), Some(signer_id), Some(signed_at)) = (
            &self.seal.evidence_hash,
            &self.seal.signature,
            &self.seal.signer_id,
            &self.seal.signed_at,
        ) else {
            return false;
        };
        if signer_id != signer.signer_id() {
            return false;
        }
        let fields = signature_fields(&self.id, hash, signer_id, signed_at);
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        signer.verify_fields(&refs, sig)
    }

    /// Fail-closed execution gate, evaluated lazily against `now`
    pub fn is_valid_for_execution(&self, signer: &RecordSigner, now: DateTime<Utc>) -> Result<(), PackRejection> {
        let econ = &self.economics;

        if econ.calibration_attestation.as_deref().map_or(true, str::is_empty) {
            return Err(PackRejection::MissingCalibrationAttestation);
        }
        if self.seal.evidence_hash.as_deref().map_or(true, str::is_empty) {
            return Err(PackRejection::MissingEvidenceHash);
        }
        if self.seal.signature.as_deref().map_or(true, str::is_empty) {
            return Err(PackRejection::MissingSignature);
        }
        if !self.evidence_matches() {
            return Err(PackRejection::EvidenceHashMismatch);
        }
        if !self.signature_valid(signer) {
            return Err(PackRejection::InvalidSignature);
        }

        let snapshot_expiry = econ.snapshot.expires_at();
        if now >= snapshot_expiry {
            return Err(PackRejection::SnapshotExpired {
                expired_at: snapshot_expiry,
            });
        }
        let order_expiry = econ.order_expires_at();
        if now >= order_expiry {
            return Err(PackRejection::OrderExpired { expired_at: order_expiry });
        }

        match econ.brackets.entry {
            Some(entry) if entry > 0.0 => {}
            _ => return Err(PackRejection::MissingEntryPrice),
        }
        if !econ.brackets.is_complete() {
            return Err(PackRejection::IncompleteBrackets);
        }
        if econ.risk.risk_reward < MIN_RISK_REWARD {
            return Err(PackRejection::RiskRewardBelowMinimum {
                risk_reward: econ.risk.risk_reward,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 14, 30, 0).unwrap()
    }

    pub(crate) fn signer() -> RecordSigner {
        RecordSigner::new("rehearsal-desk", b"pack-secret").unwrap()
    }

    pub(crate) fn economics(direction: Direction, entry: f64) -> PackEconomics {
        let risk = RiskEnvelope::new(0.05, 0.10);
        PackEconomics {
            source_ref: "hyp-42".into(),
            strategy: "momentum".into(),
            asset: "SPY".into(),
            asset_class: "ETF".into(),
            direction,
            forecast_type: "direction".into(),
            snapshot: MarketSnapshot {
                price: entry,
                regime: RegimeLabel::Bull,
                observed_at: t0(),
                ttl_secs: 3600,
            },
            confidence: ConfidenceStack::new(0.9, 0.7, 0.9),
            calibration_attestation: Some("direction:[0.80,1.00):acc=0.6800:n=200:ceil=0.7000".into()),
            brackets: Brackets::compute(direction, entry, &risk),
            risk,
            sizing: PackSizing {
                usd: 5_000.0,
                quantity: Some(50.0),
                kelly_fraction: 0.05,
                category: SizeCategory::Medium,
                sizing_action: Some("standard".into()),
            },
            order_ttl_secs: 86_400,
            created_at: t0(),
        }
    }

    #[test]
    fn test_long_and_short_brackets_mirror() {
        let risk = RiskEnvelope::new(0.05, 0.10);
        let long = Brackets::compute(Direction::Long, 100.0, &risk);
        let short = Brackets::compute(Direction::Short, 100.0, &risk);

        assert!((long.stop.unwrap() - 95.0).abs() < 1e-9);
        assert!((long.target.unwrap() - 110.0).abs() < 1e-9);
        assert!((short.stop.unwrap() - 105.0).abs() < 1e-9);
        assert!((short.target.unwrap() - 90.0).abs() < 1e-9);
        assert_eq!(risk.risk_reward, 2.0);
    }

    #[test]
    fn test_confidence_stack() {
        let stack = ConfidenceStack::new(0.95, 0.40, 0.9);
        assert_eq!(stack.capped, 0.40);
        assert!((stack.damped - 0.36).abs() < 1e-12);
    }

    #[test]
    fn test_sealed_pack_is_executable() {
        let pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        assert_eq!(pack.is_valid_for_execution(&signer(), t0() + Duration::minutes(5)), Ok(()));
    }

    #[test]
    fn test_snapshot_and_order_ttl_checked_lazily() {
        let pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        let err = pack.is_valid_for_execution(&signer(), t0() + Duration::hours(2)).unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_EXPIRED");

        let mut econ = economics(Direction::Long, 100.0);
        econ.snapshot.ttl_secs = 10 * 86_400;
        let pack = DecisionPack::seal(econ, &signer(), t0()).unwrap();
        let err = pack.is_valid_for_execution(&signer(), t0() + Duration::days(2)).unwrap_err();
        assert_eq!(err.code(), "ORDER_EXPIRED");
    }

    #[test]
    fn test_missing_attestation_rejected() {
        let mut econ = economics(Direction::Long, 100.0);
        econ.calibration_attestation = None;
        let pack = DecisionPack::seal(econ, &signer(), t0()).unwrap();
        assert_eq!(
            pack.is_valid_for_execution(&signer(), t0()),
            Err(PackRejection::MissingCalibrationAttestation)
        );
    }

    #[test]
    fn test_unsigned_and_tampered_packs_rejected() {
        let sealed = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();

        let mut seal = sealed.seal_info().clone();
        seal.signature = None;
        let unsigned = DecisionPack::from_parts(sealed.id(), sealed.economics().clone(), seal, ExecutionOutcome::default());
        assert_eq!(
            unsigned.is_valid_for_execution(&signer(), t0()),
            Err(PackRejection::MissingSignature)
        );

        let mut seal = sealed.seal_info().clone();
        seal.evidence_hash = None;
        let unhashed = DecisionPack::from_parts(sealed.id(), sealed.economics().clone(), seal, ExecutionOutcome::default());
        assert_eq!(
            unhashed.is_valid_for_execution(&signer(), t0()),
            Err(PackRejection::MissingEvidenceHash)
        );

        let mut econ = sealed.economics().clone();
        econ.sizing.usd = 50_000.0;
        let tampered = DecisionPack::from_parts(sealed.id(), econ, sealed.seal_info().clone(), ExecutionOutcome::default());
        assert_eq!(
            tampered.is_valid_for_execution(&signer(), t0()),
            Err(PackRejection::EvidenceHashMismatch)
        );

        let other = RecordSigner::new("rehearsal-desk", b"wrong").unwrap();
        assert_eq!(
            sealed.is_valid_for_execution(&other, t0()),
            Err(PackRejection::InvalidSignature)
        );
    }

    #[test]
    fn test_neutral_pack_not_executable() {
        let pack = DecisionPack::seal(economics(Direction::Neutral, 100.0), &signer(), t0()).unwrap();
        assert_eq!(
            pack.is_valid_for_execution(&signer(), t0()),
            Err(PackRejection::IncompleteBrackets)
        );
    }

    #[test]
    fn test_poor_risk_reward_rejected() {
        let mut econ = economics(Direction::Long, 100.0);
        econ.risk = RiskEnvelope::new(0.08, 0.04);
        econ.brackets = Brackets::compute(Direction::Long, 100.0, &econ.risk);
        let pack = DecisionPack::seal(econ, &signer(), t0()).unwrap();
        let err = pack.is_valid_for_execution(&signer(), t0()).unwrap_err();
        assert_eq!(err.code(), "RISK_REWARD_BELOW_MINIMUM");
    }

    #[test]
    fn test_execution_outcome_does_not_break_seal() {
        let mut pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        pack.record_execution(ExecutionOutcome {
            status: ExecutionStatus::Filled,
            fill_price: Some(100.2),
            filled_at: Some(t0() + Duration::minutes(1)),
            external_order_id: Some("ord-1".into()),
        });
        assert!(pack.evidence_matches());
        assert_eq!(pack.execution().status, ExecutionStatus::Filled);
        assert!(pack.is_valid_for_execution(&signer(), t0()).is_ok());
    }
}
