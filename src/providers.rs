//! 📈 Read-only collaborators: price series and prevailing regime
//!
//! Price series contract: bars deduplicated by timestamp, strictly ascending, and never
//! later than the requested horizon (no look-ahead).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::regime::{RegimeKey, RegimeLabel};
use crate::store::{SqliteStore, StoreError};

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    pub fn new(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            ts,
            open,
            high,
            low,
            close,
            volume: 0.0,
        }
    }
}

/// Index of the first bar that is not strictly after its predecessor
pub fn first_out_of_order(bars: &[PriceBar]) -> Option<usize> {
    bars.windows(2).position(|w| w[1].ts <= w[0].ts).map(|i| i + 1)
}

pub trait PriceSeriesProvider: Send + Sync {
    /// Bars with `after < ts <= until`, ascending
    fn bars_between(&self, asset: &str, after: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<PriceBar>, StoreError>;

    /// Most recent bar at or before `at`
    fn latest_bar(&self, asset: &str, at: DateTime<Utc>) -> Result<Option<PriceBar>, StoreError>;
}

pub trait RegimeStateProvider: Send + Sync {
    /// The single prevailing regime for `asset`, if one is tracked
    fn current_regime(&self, asset: &str) -> Result<Option<RegimeLabel>, StoreError>;
}

/// Prices served from the `price_bars` table
pub struct StorePriceSeries {
    store: Arc<SqliteStore>,
}

impl StorePriceSeries {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

impl PriceSeriesProvider for StorePriceSeries {
    fn bars_between(&self, asset: &str, after: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<PriceBar>, StoreError> {
        self.store.price_bars_between(asset, after, until)
    }

    fn latest_bar(&self, asset: &str, at: DateTime<Utc>) -> Result<Option<PriceBar>, StoreError> {
        self.store.latest_price_bar(asset, at)
    }
}

/// Regime read from the persistence record of `(asset, interval)`
pub struct StoreRegimeState {
    store: Arc<SqliteStore>,
    interval: String,
}

impl StoreRegimeState {
    pub fn new(store: Arc<SqliteStore>, interval: impl Into<String>) -> Self {
        Self {
            store,
            interval: interval.into(),
        }
    }
}

impl RegimeStateProvider for StoreRegimeState {
    fn current_regime(&self, asset: &str) -> Result<Option<RegimeLabel>, StoreError> {
        let key = RegimeKey::new(asset, self.interval.clone());
        Ok(self.store.persistence_record(&key)?.map(|r| r.regime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_first_out_of_order() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let ok = vec![
            PriceBar::new(t, 1.0, 1.0, 1.0, 1.0),
            PriceBar::new(t + Duration::days(1), 1.0, 1.0, 1.0, 1.0),
        ];
        assert_eq!(first_out_of_order(&ok), None);

        let dup = vec![
            PriceBar::new(t, 1.0, 1.0, 1.0, 1.0),
            PriceBar::new(t + Duration::days(1), 1.0, 1.0, 1.0, 1.0),
            PriceBar::new(t + Duration::days(1), 1.0, 1.0, 1.0, 1.0),
        ];
        assert_eq!(first_out_of_order(&dup), Some(2));
    }
}
