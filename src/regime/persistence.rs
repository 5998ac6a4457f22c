//! 📅 Regime Persistence Tracker
//!
//! Owns the per-(symbol, interval) persistence record and the transitions inside the
//! trailing 90-day window (the store keeps the full log). `update_regime_with` is the
//! only mutation path:
//! - Same regime: persistence_days = whole days since regime_start
//! - New regime: emit a RegimeTransition for the segment that just ended, reset to 0
//! - Every mutation re-signs the record
//!
//! Updates for one key are serialised by the map shard lock; different keys are
//! independent. Updates must arrive in calendar order per key. The caller's persist
//! step runs under that lock and the in-memory state only advances once it succeeds.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::classifier::RegimeLabel;
use crate::signing::{RecordSigner, SigningError};
use crate::store::StoreError;

/// Trailing window for the transition-rate count
pub const TRANSITION_WINDOW_DAYS: i64 = 90;

/// persistence_days at which stability saturates at 1.0
pub const STABILITY_HORIZON_DAYS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegimeKey {
    pub symbol: String,
    pub interval: String,
}

impl RegimeKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl fmt::Display for RegimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.interval)
    }
}

/// Signed persistence state for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub key: RegimeKey,
    pub regime: RegimeLabel,
    pub regime_start: DateTime<Utc>,
    pub persistence_days: i64,
    pub stability: f64,
    pub transition_count_90d: u32,
    pub last_confidence: f64,
    pub updated_at: DateTime<Utc>,
    pub signature: String,
}

/// Fields covered by the record signature (everything except the signature itself)
#[derive(Serialize)]
struct SignedPersistenceFields<'a> {
    symbol: &'a str,
    interval: &'a str,
    regime: RegimeLabel,
    regime_start: i64,
    persistence_days: i64,
    stability: f64,
    transition_count_90d: u32,
    last_confidence: f64,
    updated_at: i64,
}

impl PersistenceRecord {
    fn signed_fields(&self) -> SignedPersistenceFields<'_> {
        SignedPersistenceFields {
            symbol: &self.key.symbol,
            interval: &self.key.interval,
            regime: self.regime,
            regime_start: self.regime_start.timestamp(),
            persistence_days: self.persistence_days,
            stability: self.stability,
            transition_count_90d: self.transition_count_90d,
            last_confidence: self.last_confidence,
            updated_at: self.updated_at.timestamp(),
        }
    }

    /// Recompute the signature and byte-compare it with the stored one
    pub fn verify(&self, signer: &RecordSigner) -> bool {
        signer.verify_record(&self.signed_fields(), &self.signature)
    }

    fn resign(&mut self, signer: &RecordSigner) -> Result<(), SigningError> {
        self.signature = signer.sign_record(&self.signed_fields())?;
        Ok(())
    }
}

/// Immutable record of one regime change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeTransition {
    pub id: Uuid,
    pub key: RegimeKey,
    pub previous: RegimeLabel,
    pub new: RegimeLabel,
    pub at: DateTime<Utc>,
    /// Whole days the previous regime held
    pub prior_duration_days: i64,
    /// Classifier confidence that triggered the change
    pub confidence: f64,
}

/// Result of one `update_regime` call
#[derive(Debug, Clone)]
pub struct PersistenceUpdate {
    pub record: PersistenceRecord,
    pub transition: Option<RegimeTransition>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("out-of-order update for {key}: {attempted} precedes last update {last}")]
    OutOfOrder {
        key: RegimeKey,
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error("failed to sign persistence record: {0}")]
    Signing(#[from] SigningError),
    #[error("failed to persist regime update: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct KeyState {
    record: PersistenceRecord,
    transitions: Vec<RegimeTransition>,
}

pub struct RegimePersistenceTracker {
    signer: RecordSigner,
    entries: DashMap<RegimeKey, KeyState>,
}

impl RegimePersistenceTracker {
    pub fn new(signer: RecordSigner) -> Self {
        Self {
            signer,
            entries: DashMap::new(),
        }
    }

    /// Rebuild the tracker from stored records and their transition logs.
    ///
    /// Transitions for keys without a record are ignored.
    pub fn restore(
        signer: RecordSigner,
        records: Vec<PersistenceRecord>,
        transitions: Vec<RegimeTransition>,
    ) -> Self {
        let tracker = Self::new(signer);
        for record in records {
            tracker.entries.insert(
                record.key.clone(),
                KeyState {
                    record,
                    transitions: Vec::new(),
                },
            );
        }
        for transition in transitions {
            if let Some(mut state) = tracker.entries.get_mut(&transition.key) {
                state.transitions.push(transition);
            }
        }
        for mut state in tracker.entries.iter_mut() {
            let window_start = state.record.updated_at - Duration::days(TRANSITION_WINDOW_DAYS);
            state.transitions.retain(|t| t.at > window_start);
            state.transitions.sort_by_key(|t| t.at);
        }
        info!("📅 Persistence tracker restored: {} keys", tracker.entries.len());
        tracker
    }

    pub fn signer(&self) -> &RecordSigner {
        &self.signer
    }

    /// Apply one classification for `key` at `at` without persisting it.
    pub fn update_regime(
        &self,
        key: &RegimeKey,
        label: RegimeLabel,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Result<PersistenceUpdate, TrackerError> {
        self.update_regime_with(key, label, confidence, at, |_| Ok(()))
    }

    /// Apply one classification for `key` at `at`.
    ///
    /// `persist` sees the signed update while the key is locked. If it fails the
    /// tracker keeps its previous state and the observation can be applied again.
    pub fn update_regime_with<F>(
        &self,
        key: &RegimeKey,
        label: RegimeLabel,
        confidence: f64,
        at: DateTime<Utc>,
        persist: F,
    ) -> Result<PersistenceUpdate, TrackerError>
    where
        F: FnOnce(&PersistenceUpdate) -> Result<(), StoreError>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let mut record = PersistenceRecord {
                    key: key.clone(),
                    regime: label,
                    regime_start: at,
                    persistence_days: 0,
                    stability: 0.0,
                    transition_count_90d: 0,
                    last_confidence: confidence,
                    updated_at: at,
                    signature: String::new(),
                };
                record.resign(&self.signer)?;
                let update = PersistenceUpdate {
                    record,
                    transition: None,
                };
                persist(&update)?;
                debug!("📅 {} first observation: {}", key, label);
                vacant.insert(KeyState {
                    record: update.record.clone(),
                    transitions: Vec::new(),
                });
                Ok(update)
            }
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if at < state.record.updated_at {
                    return Err(TrackerError::OutOfOrder {
                        key: key.clone(),
                        last: state.record.updated_at,
                        attempted: at,
                    });
                }

                // Work on a copy; state only changes after signing and persisting succeed
                let mut record = state.record.clone();
                let mut transition = None;

                if label == record.regime {
                    record.persistence_days = (at - record.regime_start).num_days();
                    record.stability = stability(record.persistence_days);
                } else {
                    transition = Some(RegimeTransition {
                        id: Uuid::new_v4(),
                        key: key.clone(),
                        previous: record.regime,
                        new: label,
                        at,
                        prior_duration_days: (at - record.regime_start).num_days(),
                        confidence,
                    });
                    record.regime = label;
                    record.regime_start = at;
                    record.persistence_days = 0;
                    record.stability = 0.0;
                }

                record.transition_count_90d =
                    count_in_window(&state.transitions, at) + u32::from(transition.is_some());
                record.last_confidence = confidence;
                record.updated_at = at;
                record.resign(&self.signer)?;

                let update = PersistenceUpdate { record, transition };
                persist(&update)?;

                if let Some(t) = &update.transition {
                    info!(
                        "🔀 {} regime change {} → {} after {}d (conf={:.2})",
                        key, t.previous, t.new, t.prior_duration_days, confidence
                    );
                    state.transitions.push(t.clone());
                }
                let window_start = at - Duration::days(TRANSITION_WINDOW_DAYS);
                state.transitions.retain(|t| t.at > window_start);
                state.record = update.record.clone();

                Ok(update)
            }
        }
    }

    pub fn record(&self, key: &RegimeKey) -> Option<PersistenceRecord> {
        self.entries.get(key).map(|s| s.record.clone())
    }

    pub fn current_regime(&self, key: &RegimeKey) -> Option<RegimeLabel> {
        self.entries.get(key).map(|s| s.record.regime)
    }

    pub fn transitions(&self, key: &RegimeKey) -> Vec<RegimeTransition> {
        self.entries
            .get(key)
            .map(|s| s.transitions.clone())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<RegimeKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

fn stability(persistence_days: i64) -> f64 {
    (persistence_days as f64 / STABILITY_HORIZON_DAYS).min(1.0)
}

/// Transitions strictly inside the trailing window ending at `now`
pub fn count_in_window(transitions: &[RegimeTransition], now: DateTime<Utc>) -> u32 {
    let window_start = now - Duration::days(TRANSITION_WINDOW_DAYS);
    transitions.iter().filter(|t| t.at > window_start && t.at <= now).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreErrorKind;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn tracker() -> RegimePersistenceTracker {
        RegimePersistenceTracker::new(RecordSigner::new("tracker", b"k").unwrap())
    }

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    #[test]
    fn test_first_update_creates_record() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");
        let update = t.update_regime(&key, RegimeLabel::Bull, 0.8, day(0)).unwrap();

        assert!(update.transition.is_none());
        assert_eq!(update.record.persistence_days, 0);
        assert!(update.record.verify(t.signer()));
    }

    #[test]
    fn test_persistence_grows_then_resets_on_transition() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");

        let mut last = 0;
        for d in 0..12 {
            let u = t.update_regime(&key, RegimeLabel::Bull, 0.7, day(d)).unwrap();
            assert!(u.record.persistence_days >= last);
            last = u.record.persistence_days;
        }
        assert_eq!(last, 11);
        assert!((t.record(&key).unwrap().stability - 11.0 / 30.0).abs() < 1e-9);

        let u = t.update_regime(&key, RegimeLabel::Bear, 0.9, day(12)).unwrap();
        assert_eq!(u.record.persistence_days, 0);
        assert_eq!(u.record.stability, 0.0);
        let transition = u.transition.unwrap();
        assert_eq!(transition.previous, RegimeLabel::Bull);
        assert_eq!(transition.prior_duration_days, 12);
        assert_eq!(u.record.transition_count_90d, 1);
        assert!(u.record.verify(t.signer()));
    }

    #[test]
    fn test_stability_saturates() {
        let t = tracker();
        let key = RegimeKey::new("QQQ", "1d");
        t.update_regime(&key, RegimeLabel::Neutral, 0.5, day(0)).unwrap();
        let u = t.update_regime(&key, RegimeLabel::Neutral, 0.5, day(45)).unwrap();
        assert_eq!(u.record.stability, 1.0);
    }

    #[test]
    fn test_out_of_order_update_rejected() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");
        t.update_regime(&key, RegimeLabel::Bull, 0.7, day(5)).unwrap();

        let err = t.update_regime(&key, RegimeLabel::Bear, 0.7, day(3)).unwrap_err();
        assert!(matches!(err, TrackerError::OutOfOrder { .. }));
        assert_eq!(t.current_regime(&key), Some(RegimeLabel::Bull));
        assert!(t.transitions(&key).is_empty());
    }

    #[test]
    fn test_transition_window_drops_old_changes() {
        let t = tracker();
        let key = RegimeKey::new("IWM", "1d");
        t.update_regime(&key, RegimeLabel::Bull, 0.7, day(0)).unwrap();
        t.update_regime(&key, RegimeLabel::Bear, 0.7, day(10)).unwrap();
        t.update_regime(&key, RegimeLabel::Bull, 0.7, day(20)).unwrap();
        let u = t.update_regime(&key, RegimeLabel::Bull, 0.7, day(105)).unwrap();

        // day-10 change is outside (105-90, 105], day-20 is inside
        assert_eq!(u.record.transition_count_90d, 1);
        let kept = t.transitions(&key);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].at, day(20));
    }

    #[test]
    fn test_transition_log_stays_bounded() {
        let t = tracker();
        let key = RegimeKey::new("TLT", "1d");
        let labels = [RegimeLabel::Bull, RegimeLabel::Bear];
        // A change every other day for two years
        for d in 0..730 {
            t.update_regime(&key, labels[(d / 2 % 2) as usize], 0.7, day(d)).unwrap();
        }
        let kept = t.transitions(&key);
        assert!(kept.len() <= 45, "{} transitions kept", kept.len());
        assert!(kept.iter().all(|tr| tr.at > day(729) - Duration::days(TRANSITION_WINDOW_DAYS)));
        assert_eq!(t.record(&key).unwrap().transition_count_90d as usize, kept.len());
    }

    #[test]
    fn test_failed_persist_leaves_state_untouched() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");
        let first = t.update_regime(&key, RegimeLabel::Bull, 0.7, day(0)).unwrap();

        let err = t
            .update_regime_with(&key, RegimeLabel::Bear, 0.9, day(6), |_| {
                Err(StoreError::new(StoreErrorKind::Unavailable, "commit", "disk I/O error"))
            })
            .unwrap_err();
        assert!(matches!(err, TrackerError::Store(_)));
        assert_eq!(t.record(&key).unwrap(), first.record);
        assert!(t.transitions(&key).is_empty());

        // Same update goes through once the store recovers
        let mut seen = None;
        let retried = t
            .update_regime_with(&key, RegimeLabel::Bear, 0.9, day(6), |u| {
                seen = Some(u.record.clone());
                Ok(())
            })
            .unwrap();
        assert!(retried.transition.is_some());
        assert_eq!(seen, Some(retried.record.clone()));
        assert_eq!(t.current_regime(&key), Some(RegimeLabel::Bear));

        let fresh = RegimeKey::new("QQQ", "1d");
        assert!(t
            .update_regime_with(&fresh, RegimeLabel::Bull, 0.7, day(0), |_| {
                Err(StoreError::new(StoreErrorKind::Unavailable, "commit", "locked"))
            })
            .is_err());
        assert!(t.record(&fresh).is_none());
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");
        let mut record = t.update_regime(&key, RegimeLabel::Bull, 0.7, day(0)).unwrap().record;
        record.persistence_days = 40;
        assert!(!record.verify(t.signer()));
    }

    #[test]
    fn test_restore_round_trip() {
        let t = tracker();
        let key = RegimeKey::new("SPY", "1d");
        t.update_regime(&key, RegimeLabel::Bull, 0.7, day(0)).unwrap();
        t.update_regime(&key, RegimeLabel::Bear, 0.7, day(8)).unwrap();

        let restored = RegimePersistenceTracker::restore(
            t.signer().clone(),
            vec![t.record(&key).unwrap()],
            t.transitions(&key),
        );
        let u = restored.update_regime(&key, RegimeLabel::Bear, 0.7, day(10)).unwrap();
        assert_eq!(u.record.persistence_days, 2);
        assert_eq!(u.record.transition_count_90d, 1);
    }

    #[test]
    fn test_independent_keys_update_in_parallel() {
        let t = Arc::new(tracker());
        let handles: Vec<_> = ["SPY", "QQQ", "IWM", "DIA"]
            .iter()
            .map(|symbol| {
                let t = t.clone();
                let key = RegimeKey::new(*symbol, "1d");
                std::thread::spawn(move || {
                    for d in 0..30 {
                        t.update_regime(&key, RegimeLabel::Bull, 0.7, day(d)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.keys().len(), 4);
        assert_eq!(t.record(&RegimeKey::new("DIA", "1d")).unwrap().persistence_days, 29);
    }
}
