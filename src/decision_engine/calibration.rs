//! 🎯 Confidence calibration ceilings
//!
//! A raw confidence is never trusted as-is: the band of historical accuracy it falls in
//! (per forecast type, optionally per regime) defines a hard ceiling:
//!
//!   ceiling = min(band_accuracy + margin, 1.0)
//!   margin  = +5% if accuracy < 50%, +2% if < 60%, else 0
//!
//! `CachedCalibration` keeps the band table in memory with an explicit max age.
//! Callers refresh it with `refresh_if_stale()`; a stale or empty cache never serves.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::clock::Clock;
use crate::regime::RegimeLabel;
use crate::store::StoreError;

/// Historical accuracy of one confidence band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBand {
    pub forecast_type: String,
    /// None = applies to every regime
    pub regime: Option<RegimeLabel>,
    /// Inclusive lower bound
    pub lower: f64,
    /// Exclusive upper bound (1.0 is inclusive)
    pub upper: f64,
    pub accuracy: f64,
    pub samples: u32,
}

impl CalibrationBand {
    pub fn contains(&self, confidence: f64) -> bool {
        confidence >= self.lower && (confidence < self.upper || (self.upper >= 1.0 && confidence <= 1.0))
    }
}

/// Ceiling plus the attestation that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCeiling {
    pub ceiling: f64,
    pub band_accuracy: f64,
    pub margin: f64,
    pub band_lower: f64,
    pub band_upper: f64,
    pub samples: u32,
}

impl CalibrationCeiling {
    pub fn from_band(band: &CalibrationBand) -> Self {
        let margin = safety_margin(band.accuracy);
        Self {
            ceiling: (band.accuracy + margin).clamp(0.0, 1.0),
            band_accuracy: band.accuracy,
            margin,
            band_lower: band.lower,
            band_upper: band.upper,
            samples: band.samples,
        }
    }

    /// Stable attestation string stored on the pack
    pub fn attestation(&self, forecast_type: &str) -> String {
        format!(
            "{}:[{:.2},{:.2}):acc={:.4}:n={}:ceil={:.4}",
            forecast_type, self.band_lower, self.band_upper, self.band_accuracy, self.samples, self.ceiling
        )
    }

    pub fn cap(&self, raw: f64) -> f64 {
        raw.min(self.ceiling)
    }
}

/// Asymmetric margin: worse bands get more headroom above their measured accuracy
pub fn safety_margin(accuracy: f64) -> f64 {
    if accuracy < 0.50 {
        0.05
    } else if accuracy < 0.60 {
        0.02
    } else {
        0.0
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no calibration band for {forecast_type} at confidence {confidence:.3}")]
    NoBand { forecast_type: String, confidence: f64 },
    #[error("calibration table not loaded")]
    NotLoaded,
    #[error("calibration table stale: loaded {loaded_at}, max age {max_age_secs}s")]
    Stale { loaded_at: DateTime<Utc>, max_age_secs: i64 },
    #[error("calibration source failed: {0}")]
    Source(#[from] StoreError),
}

/// Given (forecast type, raw confidence, regime), return a hard ceiling
pub trait ConfidenceCalibrationService: Send + Sync {
    fn ceiling(
        &self,
        forecast_type: &str,
        raw_confidence: f64,
        regime: RegimeLabel,
    ) -> Result<CalibrationCeiling, CalibrationError>;
}

/// Where band tables come from
pub trait CalibrationSource: Send + Sync {
    fn load_bands(&self) -> Result<Vec<CalibrationBand>, StoreError>;
}

impl CalibrationSource for Vec<CalibrationBand> {
    fn load_bands(&self) -> Result<Vec<CalibrationBand>, StoreError> {
        Ok(self.clone())
    }
}

/// Exact (forecast, regime) band first, then a regime-agnostic one. Another regime's
/// band is never used.
pub fn find_band<'a>(
    bands: &'a [CalibrationBand],
    forecast_type: &str,
    confidence: f64,
    regime: RegimeLabel,
) -> Option<&'a CalibrationBand> {
    let covering = || {
        bands
            .iter()
            .filter(move |b| b.forecast_type == forecast_type && b.contains(confidence))
    };
    covering()
        .find(|b| b.regime == Some(regime))
        .or_else(|| covering().find(|b| b.regime.is_none()))
}

struct Snapshot {
    loaded_at: DateTime<Utc>,
    bands: Vec<CalibrationBand>,
}

/// In-memory band table with explicit staleness
pub struct CachedCalibration {
    source: Arc<dyn CalibrationSource>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl CachedCalibration {
    pub fn new(source: Arc<dyn CalibrationSource>, clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            source,
            clock,
            max_age,
            snapshot: RwLock::new(None),
        }
    }

    pub fn is_stale(&self) -> bool {
        let now = self.clock.now();
        match self.snapshot.read() {
            Ok(guard) => match guard.as_ref() {
                Some(snap) => now - snap.loaded_at >= self.max_age,
                None => true,
            },
            Err(_) => true,
        }
    }

    /// Reload from the source when empty or older than max age. Returns true on reload.
    pub fn refresh_if_stale(&self) -> Result<bool, CalibrationError> {
        if !self.is_stale() {
            return Ok(false);
        }
        self.refresh()?;
        Ok(true)
    }

    pub fn refresh(&self) -> Result<usize, CalibrationError> {
        let bands = self.source.load_bands()?;
        let count = bands.len();
        let loaded_at = self.clock.now();
        match self.snapshot.write() {
            Ok(mut guard) => *guard = Some(Snapshot { loaded_at, bands }),
            Err(poisoned) => *poisoned.into_inner() = Some(Snapshot { loaded_at, bands }),
        }
        info!("🎯 Calibration table refreshed: {} bands", count);
        Ok(count)
    }
}

impl ConfidenceCalibrationService for CachedCalibration {
    fn ceiling(
        &self,
        forecast_type: &str,
        raw_confidence: f64,
        regime: RegimeLabel,
    ) -> Result<CalibrationCeiling, CalibrationError> {
        let now = self.clock.now();
        let guard = self.snapshot.read().map_err(|_| CalibrationError::NotLoaded)?;
        let snap = guard.as_ref().ok_or(CalibrationError::NotLoaded)?;
        if now - snap.loaded_at >= self.max_age {
            warn!("⚠️ Calibration table is stale, refusing to serve ceilings");
            return Err(CalibrationError::Stale {
                loaded_at: snap.loaded_at,
                max_age_secs: self.max_age.num_seconds(),
            });
        }

        let band = find_band(&snap.bands, forecast_type, raw_confidence, regime).ok_or_else(|| {
            CalibrationError::NoBand {
                forecast_type: forecast_type.to_string(),
                confidence: raw_confidence,
            }
        })?;
        let ceiling = CalibrationCeiling::from_band(band);
        debug!(
            "🎯 {} raw={:.3} regime={} → band acc={:.3} ceiling={:.3}",
            forecast_type, raw_confidence, regime, band.accuracy, ceiling.ceiling
        );
        Ok(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn band(regime: Option<RegimeLabel>, lower: f64, upper: f64, accuracy: f64) -> CalibrationBand {
        CalibrationBand {
            forecast_type: "direction".into(),
            regime,
            lower,
            upper,
            accuracy,
            samples: 120,
        }
    }

    fn cache(bands: Vec<CalibrationBand>) -> (CachedCalibration, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let cache = CachedCalibration::new(Arc::new(bands), clock.clone(), Duration::hours(6));
        (cache, clock)
    }

    #[test]
    fn test_margins() {
        assert_eq!(safety_margin(0.35), 0.05);
        assert_eq!(safety_margin(0.55), 0.02);
        assert_eq!(safety_margin(0.72), 0.0);
    }

    #[test]
    fn test_overconfident_raw_is_capped_by_poor_band() {
        let (cache, _) = cache(vec![band(None, 0.9, 1.0, 0.35)]);
        cache.refresh_if_stale().unwrap();

        let ceiling = cache.ceiling("direction", 0.95, RegimeLabel::Bull).unwrap();
        assert!(ceiling.ceiling <= 0.40 + 1e-12);
        assert!(ceiling.cap(0.95) <= 0.40 + 1e-12);
    }

    #[test]
    fn test_regime_specific_band_preferred() {
        let (cache, _) = cache(vec![
            band(None, 0.5, 1.0, 0.70),
            band(Some(RegimeLabel::Bear), 0.5, 1.0, 0.45),
        ]);
        cache.refresh().unwrap();

        let bear = cache.ceiling("direction", 0.8, RegimeLabel::Bear).unwrap();
        let bull = cache.ceiling("direction", 0.8, RegimeLabel::Bull).unwrap();
        assert!((bear.ceiling - 0.50).abs() < 1e-12);
        assert!((bull.ceiling - 0.70).abs() < 1e-12);
    }

    #[test]
    fn test_missing_band_is_error() {
        let (cache, _) = cache(vec![band(None, 0.5, 0.7, 0.6)]);
        cache.refresh().unwrap();
        assert!(matches!(
            cache.ceiling("direction", 0.9, RegimeLabel::Neutral),
            Err(CalibrationError::NoBand { .. })
        ));
        assert!(matches!(
            cache.ceiling("volatility", 0.6, RegimeLabel::Neutral),
            Err(CalibrationError::NoBand { .. })
        ));
    }

    #[test]
    fn test_other_regime_band_is_not_borrowed() {
        let (cache, _) = cache(vec![band(Some(RegimeLabel::Bear), 0.5, 1.0, 0.45)]);
        cache.refresh().unwrap();

        assert!(cache.ceiling("direction", 0.8, RegimeLabel::Bear).is_ok());
        assert!(matches!(
            cache.ceiling("direction", 0.8, RegimeLabel::Bull),
            Err(CalibrationError::NoBand { .. })
        ));
    }

    #[test]
    fn test_stale_cache_refuses_until_refreshed() {
        let (cache, clock) = cache(vec![band(None, 0.0, 1.0, 0.65)]);
        assert!(matches!(
            cache.ceiling("direction", 0.5, RegimeLabel::Bull),
            Err(CalibrationError::NotLoaded)
        ));

        assert!(cache.refresh_if_stale().unwrap());
        assert!(!cache.refresh_if_stale().unwrap());
        assert!(cache.ceiling("direction", 0.5, RegimeLabel::Bull).is_ok());

        clock.advance(Duration::hours(7));
        assert!(matches!(
            cache.ceiling("direction", 0.5, RegimeLabel::Bull),
            Err(CalibrationError::Stale { .. })
        ));
        assert!(cache.refresh_if_stale().unwrap());
        assert!(cache.ceiling("direction", 0.5, RegimeLabel::Bull).is_ok());
    }

    #[test]
    fn test_upper_bound_inclusive_at_one() {
        let b = band(None, 0.9, 1.0, 0.8);
        assert!(b.contains(1.0));
        assert!(!band(None, 0.5, 0.9, 0.8).contains(0.9));
    }
}
