//! 🧭 Regime Classifier
//!
//! Maps a 7-indicator z-score vector to BEAR / NEUTRAL / BULL using asymmetric
//! hysteresis thresholds:
//! - Entering BULL or BEAR needs |composite z| above `enter_threshold` (0.85)
//! - Staying in BULL or BEAR only needs |composite z| above `stay_threshold` (0.60)
//!
//! The classifier holds no state. The previous regime is an input and the caller owns
//! whatever it does with the output.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Indicators per vector, in order: momentum_20d, momentum_60d, trend_slope, rsi_z,
/// macd_z, volatility_z, volume_z
pub const FEATURE_COUNT: usize = 7;

/// Z-scores are clipped to this magnitude
pub const FEATURE_CLIP: f64 = 5.0;

/// Market regime. The discriminant is the integer regime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeLabel {
    Bear = 0,
    Neutral = 1,
    Bull = 2,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 3] = [RegimeLabel::Bear, RegimeLabel::Neutral, RegimeLabel::Bull];

    /// Integer regime state (BEAR=0, NEUTRAL=1, BULL=2)
    pub fn state(self) -> u8 {
        self as u8
    }

    pub fn from_state(state: u8) -> Option<Self> {
        match state {
            0 => Some(RegimeLabel::Bear),
            1 => Some(RegimeLabel::Neutral),
            2 => Some(RegimeLabel::Bull),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegimeLabel::Bear => "BEAR",
            RegimeLabel::Neutral => "NEUTRAL",
            RegimeLabel::Bull => "BULL",
        }
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegimeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BEAR" => Ok(RegimeLabel::Bear),
            "NEUTRAL" => Ok(RegimeLabel::Neutral),
            "BULL" => Ok(RegimeLabel::Bull),
            other => Err(format!("unknown regime label: {}", other)),
        }
    }
}

/// Seven z-scored indicators, clipped to [-5, 5]. Missing entries are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    values: [Option<f64>; FEATURE_COUNT],
}

impl FeatureVector {
    /// Build a vector, clipping every value and dropping non-finite ones.
    pub fn new(values: [Option<f64>; FEATURE_COUNT]) -> Self {
        let mut clipped = [None; FEATURE_COUNT];
        for (slot, value) in clipped.iter_mut().zip(values.iter()) {
            *slot = value
                .filter(|v| v.is_finite())
                .map(|v| v.clamp(-FEATURE_CLIP, FEATURE_CLIP));
        }
        Self { values: clipped }
    }

    pub fn complete(values: [f64; FEATURE_COUNT]) -> Self {
        Self::new(values.map(Some))
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    pub fn values(&self) -> &[Option<f64>; FEATURE_COUNT] {
        &self.values
    }

    /// Number of non-null indicators
    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// Classifier thresholds and weights
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// |z| needed to enter BULL/BEAR from another regime
    pub enter_threshold: f64,
    /// |z| needed to remain in BULL/BEAR
    pub stay_threshold: f64,
    /// Minimum non-null features for a trusted classification
    pub min_features: usize,
    /// Softmax sharpness applied to hysteresis-relative logits
    pub sharpness: f64,
    /// Minimum days a change must hold before the series filter accepts it
    pub min_persistence_days: i64,
    /// Per-indicator weights (volatility is bearish, hence negative)
    pub weights: [f64; FEATURE_COUNT],
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enter_threshold: 0.85,
            stay_threshold: 0.60,
            min_features: 5,
            sharpness: 4.0,
            min_persistence_days: 5,
            weights: [0.20, 0.20, 0.20, 0.10, 0.15, -0.10, 0.05],
        }
    }
}

/// Output of one classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub label: RegimeLabel,
    pub state: u8,
    /// [bear, neutral, bull]
    pub probabilities: [f64; 3],
    /// Max probability
    pub confidence: f64,
    pub composite_z: Option<f64>,
    pub features_present: usize,
    /// False when feature coverage is below the minimum; callers must not trust it
    pub valid: bool,
    /// True when the series filter kept the prior regime over the raw label
    pub filtered: bool,
}

impl RegimeClassification {
    fn invalid(features_present: usize, label: RegimeLabel) -> Self {
        let p = 1.0 / 3.0;
        Self {
            label,
            state: label.state(),
            probabilities: [p, p, p],
            confidence: p,
            composite_z: None,
            features_present,
            valid: false,
            filtered: false,
        }
    }
}

/// Pure hysteresis regime classifier
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    config: ClassifierConfig,
}

impl RegimeClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Weighted mean of the present indicators, normalised by their absolute weight
    pub fn composite_z(&self, features: &FeatureVector) -> Option<f64> {
        let mut weighted = 0.0;
        let mut norm = 0.0;
        for (value, weight) in features.values().iter().zip(self.config.weights.iter()) {
            if let Some(v) = value {
                weighted += v * weight;
                norm += weight.abs();
            }
        }
        if norm <= f64::EPSILON {
            None
        } else {
            Some(weighted / norm)
        }
    }

    /// Classify one feature vector given the previous regime.
    pub fn classify(&self, features: &FeatureVector, previous: Option<RegimeLabel>) -> RegimeClassification {
        let present = features.present_count();
        if present < self.config.min_features {
            debug!("Regime classification invalid: {}/{} features present", present, FEATURE_COUNT);
            return RegimeClassification::invalid(present, RegimeLabel::Neutral);
        }

        let z = match self.composite_z(features) {
            Some(z) => z,
            None => return RegimeClassification::invalid(present, RegimeLabel::Neutral),
        };

        let bull_threshold = self.threshold_for(RegimeLabel::Bull, previous);
        let bear_threshold = self.threshold_for(RegimeLabel::Bear, previous);

        let label = if z > bull_threshold {
            RegimeLabel::Bull
        } else if z < -bear_threshold {
            RegimeLabel::Bear
        } else {
            RegimeLabel::Neutral
        };

        let k = self.config.sharpness;
        let probabilities = softmax([k * (-z - bear_threshold), 0.0, k * (z - bull_threshold)]);
        let confidence = probabilities.iter().cloned().fold(0.0, f64::max);

        RegimeClassification {
            label,
            state: label.state(),
            probabilities,
            confidence,
            composite_z: Some(z),
            features_present: present,
            valid: true,
            filtered: false,
        }
    }

    /// Classify a dated series, applying the minimum-persistence filter.
    ///
    /// A change to a new regime is accepted only if the raw (unfiltered) labels would
    /// hold it for at least `min_persistence_days`; otherwise the prior regime stays.
    /// Observations must be in ascending date order.
    pub fn classify_series(
        &self,
        observations: &[(DateTime<Utc>, FeatureVector)],
        initial: Option<RegimeLabel>,
    ) -> Vec<(DateTime<Utc>, RegimeClassification)> {
        let mut raw = Vec::with_capacity(observations.len());
        let mut raw_prev = initial;
        for (_, features) in observations {
            let c = self.classify(features, raw_prev);
            if c.valid {
                raw_prev = Some(c.label);
            }
            raw.push(c);
        }

        let mut out = Vec::with_capacity(observations.len());
        let mut current = initial;

        for (i, (at, _)) in observations.iter().enumerate() {
            let c = &raw[i];

            if !c.valid {
                let held = current.unwrap_or(RegimeLabel::Neutral);
                out.push((*at, RegimeClassification::invalid(c.features_present, held)));
                continue;
            }

            let accepted = match current {
                None => true,
                Some(cur) if cur == c.label => true,
                Some(_) => self.run_days(observations, &raw, i) >= self.config.min_persistence_days,
            };

            if accepted {
                current = Some(c.label);
                out.push((*at, c.clone()));
            } else {
                let held = current.unwrap_or(RegimeLabel::Neutral);
                let mut kept = c.clone();
                kept.label = held;
                kept.state = held.state();
                kept.filtered = true;
                out.push((*at, kept));
            }
        }

        out
    }

    /// Calendar days the raw label at `start` keeps holding (invalid rows don't break a run)
    fn run_days(
        &self,
        observations: &[(DateTime<Utc>, FeatureVector)],
        raw: &[RegimeClassification],
        start: usize,
    ) -> i64 {
        let candidate = raw[start].label;
        let mut last = start;
        for (j, c) in raw.iter().enumerate().skip(start + 1) {
            if !c.valid {
                continue;
            }
            if c.label != candidate {
                break;
            }
            last = j;
        }
        (observations[last].0 - observations[start].0).num_days() + 1
    }

    fn threshold_for(&self, regime: RegimeLabel, previous: Option<RegimeLabel>) -> f64 {
        if previous == Some(regime) {
            self.config.stay_threshold
        } else {
            self.config.enter_threshold
        }
    }
}

fn softmax(logits: [f64; 3]) -> [f64; 3] {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps = logits.map(|l| (l - max).exp());
    let sum: f64 = exps.iter().sum();
    exps.map(|e| e / sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Every indicator except volatility at `z`, volatility at `-z`, so composite == z
    fn uniform(z: f64) -> FeatureVector {
        FeatureVector::complete([z, z, z, z, z, -z, z])
    }

    #[test]
    fn test_label_state_bijection() {
        for label in RegimeLabel::ALL {
            assert_eq!(RegimeLabel::from_state(label.state()), Some(label));
            assert_eq!(label.as_str().parse::<RegimeLabel>().unwrap(), label);
        }
        assert_eq!(RegimeLabel::from_state(3), None);
    }

    #[test]
    fn test_features_are_clipped() {
        let fv = FeatureVector::new([Some(9.0), Some(-7.5), Some(f64::NAN), None, Some(1.0), Some(0.0), Some(2.0)]);
        assert_eq!(fv.get(0), Some(5.0));
        assert_eq!(fv.get(1), Some(-5.0));
        assert_eq!(fv.get(2), None);
        assert_eq!(fv.present_count(), 5);
    }

    #[test]
    fn test_insufficient_features_is_invalid() {
        let classifier = RegimeClassifier::default();
        let fv = FeatureVector::new([Some(2.0), Some(2.0), Some(2.0), Some(2.0), None, None, None]);
        let c = classifier.classify(&fv, None);

        assert!(!c.valid);
        assert_eq!(c.label, RegimeLabel::Neutral);
        assert!((c.probabilities.iter().sum::<f64>() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_composite_matches_uniform_vector() {
        let classifier = RegimeClassifier::default();
        let z = classifier.composite_z(&uniform(0.7)).unwrap();
        assert!((z - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_hysteresis_enter_vs_stay() {
        let classifier = RegimeClassifier::default();

        // 0.7 is not enough to enter BULL from NEUTRAL...
        let fresh = classifier.classify(&uniform(0.7), Some(RegimeLabel::Neutral));
        assert_eq!(fresh.label, RegimeLabel::Neutral);

        // ...but is enough to stay in BULL
        let sticky = classifier.classify(&uniform(0.7), Some(RegimeLabel::Bull));
        assert_eq!(sticky.label, RegimeLabel::Bull);

        // Same on the bear side
        let bear = classifier.classify(&uniform(-0.7), Some(RegimeLabel::Bear));
        assert_eq!(bear.label, RegimeLabel::Bear);
        let enter_bear = classifier.classify(&uniform(-0.9), None);
        assert_eq!(enter_bear.label, RegimeLabel::Bear);
    }

    #[test]
    fn test_probabilities_and_argmax_agree_with_label() {
        let classifier = RegimeClassifier::default();
        let previous = [None, Some(RegimeLabel::Bear), Some(RegimeLabel::Neutral), Some(RegimeLabel::Bull)];

        for step in -50..=50 {
            let z = step as f64 * 0.05;
            for prev in previous {
                let c = classifier.classify(&uniform(z), prev);
                let sum: f64 = c.probabilities.iter().sum();
                assert!((sum - 1.0).abs() < 0.01, "sum={} at z={}", sum, z);
                assert_eq!(RegimeLabel::from_state(c.state), Some(c.label));
                let max = c.probabilities.iter().cloned().fold(0.0, f64::max);
                assert!((c.confidence - max).abs() < 1e-12);
                if (c.probabilities[c.label.state() as usize] - max).abs() > 1e-12 {
                    panic!("label {} is not argmax at z={} prev={:?}", c.label, z, prev);
                }
            }
        }
    }

    #[test]
    fn test_series_filter_rejects_short_excursions() {
        let classifier = RegimeClassifier::default();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        // 10 neutral days, a 3-day bull spike, 10 neutral days
        let mut obs = Vec::new();
        for d in 0..23 {
            let z = if (10..13).contains(&d) { 1.5 } else { 0.0 };
            obs.push((start + Duration::days(d), uniform(z)));
        }

        let out = classifier.classify_series(&obs, None);
        assert!(out.iter().all(|(_, c)| c.label == RegimeLabel::Neutral));
        assert!(out[11].1.filtered);
    }

    #[test]
    fn test_series_filter_accepts_persistent_change() {
        let classifier = RegimeClassifier::default();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut obs = Vec::new();
        for d in 0..20 {
            let z = if d >= 8 { 1.5 } else { 0.0 };
            obs.push((start + Duration::days(d), uniform(z)));
        }

        let out = classifier.classify_series(&obs, Some(RegimeLabel::Neutral));
        assert_eq!(out[7].1.label, RegimeLabel::Neutral);
        assert_eq!(out[8].1.label, RegimeLabel::Bull);
        assert!(!out[8].1.filtered);
        assert_eq!(out[19].1.label, RegimeLabel::Bull);
    }

    #[test]
    fn test_series_bounds_transition_count_on_noise() {
        let classifier = RegimeClassifier::default();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        // Alternating every 2 days between strong bull and strong bear
        let obs: Vec<_> = (0..90)
            .map(|d| {
                let z = if (d / 2) % 2 == 0 { 2.0 } else { -2.0 };
                (start + Duration::days(d), uniform(z))
            })
            .collect();

        let out = classifier.classify_series(&obs, None);
        let transitions = out.windows(2).filter(|w| w[0].1.label != w[1].1.label).count();
        assert_eq!(transitions, 0);
    }
}
