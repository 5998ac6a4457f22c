//! 💰 Position Sizer - Kelly Criterion sizing with hard caps
//!
//! Maps a Sharpe-like edge score to a win probability and payoff ratio, computes the
//! raw Kelly fraction, then applies fractional Kelly, confidence, signal agreement and
//! the bandit's sizing action before the ceiling/floor guards.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucket for the final fraction of capital
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizeCategory {
    Skip,
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn from_fraction(fraction: f64) -> Self {
        if fraction <= 0.0 {
            SizeCategory::Skip
        } else if fraction < 0.03 {
            SizeCategory::Small
        } else if fraction < 0.08 {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeCategory::Skip => "SKIP",
            SizeCategory::Small => "SMALL",
            SizeCategory::Medium => "MEDIUM",
            SizeCategory::Large => "LARGE",
        }
    }
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position sizer configuration
#[derive(Debug, Clone)]
pub struct PositionSizerConfig {
    /// Multiplier on the raw Kelly fraction (0.25 = quarter Kelly)
    pub kelly_multiplier: f64,

    /// p = 0.5 + win_slope * edge
    pub win_slope: f64,

    /// b = 1 + payoff_slope * edge
    pub payoff_slope: f64,

    /// Hard ceiling as a fraction of capital
    pub max_fraction: f64,

    /// Fractions below this are skipped
    pub min_fraction: f64,

    /// Minimum absolute position in USD
    pub min_position_usd: f64,

    /// Cumulative exposure ceiling for portfolio allocation
    pub max_portfolio_exposure: f64,
}

impl Default for PositionSizerConfig {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.25,
            win_slope: 0.15,
            payoff_slope: 0.5,
            max_fraction: 0.15,
            min_fraction: 0.005,
            min_position_usd: 100.0,
            max_portfolio_exposure: 0.50,
        }
    }
}

const MIN_WIN_PROBABILITY: f64 = 0.50;
const MAX_WIN_PROBABILITY: f64 = 0.95;
const MAX_PAYOFF_RATIO: f64 = 3.0;

/// One sizing request
#[derive(Debug, Clone)]
pub struct SizingInput {
    /// Sharpe-like edge / quality score
    pub edge: f64,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub capital_usd: f64,
    pub price: Option<f64>,
    /// External signal-agreement multiplier (1.0 = neutral)
    pub agreement_multiplier: f64,
    /// Bandit sizing action multiplier (1.0 = standard)
    pub action_multiplier: f64,
}

impl SizingInput {
    pub fn new(edge: f64, confidence: f64, capital_usd: f64) -> Self {
        Self {
            edge,
            confidence,
            capital_usd,
            price: None,
            agreement_multiplier: 1.0,
            action_multiplier: 1.0,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_agreement(mut self, multiplier: f64) -> Self {
        self.agreement_multiplier = multiplier;
        self
    }

    pub fn with_action_multiplier(mut self, multiplier: f64) -> Self {
        self.action_multiplier = multiplier;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub win_probability: f64,
    pub payoff_ratio: f64,
    pub raw_kelly: f64,
    /// Final fraction of capital after every guard
    pub fraction: f64,
    pub usd: f64,
    pub quantity: Option<f64>,
    pub category: SizeCategory,
}

impl PositionSize {
    pub fn is_skip(&self) -> bool {
        self.category == SizeCategory::Skip
    }

    fn skip(win_probability: f64, payoff_ratio: f64, raw_kelly: f64) -> Self {
        Self {
            win_probability,
            payoff_ratio,
            raw_kelly,
            fraction: 0.0,
            usd: 0.0,
            quantity: None,
            category: SizeCategory::Skip,
        }
    }
}

/// A ranked candidate's allocation outcome
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: String,
    pub size: PositionSize,
    /// False when the candidate would have pushed exposure past the ceiling
    pub included: bool,
}

/// Position sizer - Kelly fraction with guards
pub struct PositionSizer {
    config: PositionSizerConfig,
}

impl PositionSizer {
    /// Create new position sizer with config
    pub fn new(config: PositionSizerConfig) -> Self {
        info!("💰 Position Sizer initialized:");
        info!("   Kelly multiplier: {:.2}", config.kelly_multiplier);
        info!(
            "   Ceiling: {:.1}% | floor: {:.2}% | min size: ${:.0}",
            config.max_fraction * 100.0,
            config.min_fraction * 100.0,
            config.min_position_usd
        );
        info!("   Portfolio exposure ceiling: {:.0}%", config.max_portfolio_exposure * 100.0);

        Self { config }
    }

    pub fn config(&self) -> &PositionSizerConfig {
        &self.config
    }

    /// Monotone edge → win probability, clamped to [0.50, 0.95]
    pub fn win_probability(&self, edge: f64) -> f64 {
        if edge <= 0.0 || !edge.is_finite() {
            return MIN_WIN_PROBABILITY;
        }
        (MIN_WIN_PROBABILITY + self.config.win_slope * edge).clamp(MIN_WIN_PROBABILITY, MAX_WIN_PROBABILITY)
    }

    /// Monotone edge → payoff ratio, in [0, 3]
    pub fn payoff_ratio(&self, edge: f64) -> f64 {
        if !edge.is_finite() {
            return 0.0;
        }
        (1.0 + self.config.payoff_slope * edge).clamp(0.0, MAX_PAYOFF_RATIO)
    }

    /// f* = (p(b+1) - 1) / b, floored at 0
    pub fn raw_kelly(p: f64, b: f64) -> f64 {
        if b <= 0.0 {
            return 0.0;
        }
        ((p * (b + 1.0) - 1.0) / b).max(0.0)
    }

    /// Calculate position size for one signal
    pub fn calculate(&self, input: &SizingInput) -> PositionSize {
        let p = self.win_probability(input.edge);
        let b = self.payoff_ratio(input.edge);
        let raw = Self::raw_kelly(p, b);

        // 1. Fractional Kelly, then confidence/agreement/action scaling
        let confidence = input.confidence.clamp(0.0, 1.0);
        let scaled = raw
            * self.config.kelly_multiplier
            * confidence
            * input.agreement_multiplier.max(0.0)
            * input.action_multiplier.max(0.0);

        // 2. Hard ceiling
        let capped = scaled.min(self.config.max_fraction);

        // 3. Floor to zero below the minimum threshold
        if capped < self.config.min_fraction || input.capital_usd <= 0.0 {
            debug!(
                "💰 SKIP: edge={:.3} p={:.3} b={:.2} raw={:.4} scaled={:.4}",
                input.edge, p, b, raw, scaled
            );
            return PositionSize::skip(p, b, raw);
        }

        // 4. Minimum dollar size; the implied fraction may not pass the ceiling
        let mut fraction = capped;
        let mut usd = input.capital_usd * fraction;
        if usd < self.config.min_position_usd {
            let floored = self.config.min_position_usd / input.capital_usd;
            if floored > self.config.max_fraction {
                debug!(
                    "💰 SKIP: ${:.0} minimum needs {:.2}% of capital (ceiling {:.2}%)",
                    self.config.min_position_usd,
                    floored * 100.0,
                    self.config.max_fraction * 100.0
                );
                return PositionSize::skip(p, b, raw);
            }
            usd = self.config.min_position_usd;
            fraction = floored;
        }

        let quantity = input.price.filter(|px| *px > 0.0).map(|px| usd / px);
        let category = SizeCategory::from_fraction(fraction);

        debug!(
            "💰 Sizing: edge={:.3} conf={:.2} p={:.3} b={:.2} raw={:.4} final={:.4} (${:.2}, {})",
            input.edge, confidence, p, b, raw, fraction, usd, category
        );

        PositionSize {
            win_probability: p,
            payoff_ratio: b,
            raw_kelly: raw,
            fraction,
            usd,
            quantity,
            category,
        }
    }

    /// Rank candidates by edge × confidence and allocate until the exposure ceiling.
    ///
    /// A candidate that would exceed the ceiling is excluded; later (smaller) candidates
    /// are still considered.
    pub fn allocate(&self, candidates: &[(String, SizingInput)]) -> Vec<Allocation> {
        let mut ranked: Vec<&(String, SizingInput)> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            let sa = a.1.edge * a.1.confidence;
            let sb = b.1.edge * b.1.confidence;
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut exposure = 0.0;
        let mut out = Vec::with_capacity(ranked.len());
        for (id, input) in ranked {
            let size = self.calculate(input);
            let included = !size.is_skip() && exposure + size.fraction <= self.config.max_portfolio_exposure + 1e-12;
            if included {
                exposure += size.fraction;
            } else if !size.is_skip() {
                debug!(
                    "💰 {} excluded: exposure {:.2}% + {:.2}% > {:.0}%",
                    id,
                    exposure * 100.0,
                    size.fraction * 100.0,
                    self.config.max_portfolio_exposure * 100.0
                );
            }
            out.push(Allocation {
                id: id.clone(),
                size,
                included,
            });
        }

        info!(
            "💰 Allocated {}/{} candidates, exposure {:.2}%",
            out.iter().filter(|a| a.included).count(),
            out.len(),
            exposure * 100.0
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(PositionSizerConfig::default())
    }

    #[test]
    fn test_non_positive_edge_is_skip() {
        let sizer = sizer();
        for edge in [0.0, -0.5, -3.0] {
            let size = sizer.calculate(&SizingInput::new(edge, 0.9, 100_000.0));
            assert_eq!(size.fraction, 0.0);
            assert_eq!(size.category, SizeCategory::Skip);
            assert_eq!(size.win_probability, 0.5);
        }
    }

    #[test]
    fn test_win_probability_and_payoff_bounds() {
        let sizer = sizer();
        assert_eq!(sizer.win_probability(100.0), 0.95);
        assert_eq!(sizer.payoff_ratio(100.0), 3.0);
        assert_eq!(sizer.payoff_ratio(-100.0), 0.0);
        assert_eq!(PositionSizer::raw_kelly(0.9, 0.0), 0.0);
    }

    #[test]
    fn test_raw_kelly_formula() {
        // p=0.6, b=1 → f* = 0.2
        assert!((PositionSizer::raw_kelly(0.6, 1.0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_fraction_monotone_in_edge_and_capped() {
        let sizer = sizer();
        let mut last = 0.0;
        for i in 0..200 {
            let edge = i as f64 * 0.05;
            let size = sizer.calculate(&SizingInput::new(edge, 0.8, 1_000_000.0));
            assert!(size.fraction >= last, "edge {} dropped from {} to {}", edge, last, size.fraction);
            assert!(size.fraction <= 0.15);
            last = size.fraction;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_ceiling_binds_with_aggressive_multipliers() {
        let sizer = sizer();
        let input = SizingInput::new(8.0, 1.0, 50_000.0)
            .with_agreement(2.0)
            .with_action_multiplier(1.5);
        let size = sizer.calculate(&input);
        assert_eq!(size.fraction, 0.15);
        assert_eq!(size.category, SizeCategory::Large);
    }

    #[test]
    fn test_min_dollar_floor_recomputes_fraction() {
        let sizer = sizer();
        // Small but above the skip floor: 1k capital → needs $100 = 10%
        let size = sizer.calculate(&SizingInput::new(1.0, 0.5, 1_000.0).with_price(50.0));
        assert!(!size.is_skip());
        assert_eq!(size.usd, 100.0);
        assert!((size.fraction - 0.10).abs() < 1e-12);
        assert_eq!(size.quantity, Some(2.0));
    }

    #[test]
    fn test_min_dollar_floor_never_exceeds_ceiling() {
        let sizer = sizer();
        // $100 on $500 is 20% > 15% ceiling
        let size = sizer.calculate(&SizingInput::new(1.0, 0.5, 500.0));
        assert!(size.is_skip());
    }

    #[test]
    fn test_allocation_respects_exposure_ceiling() {
        let sizer = PositionSizer::new(PositionSizerConfig {
            max_portfolio_exposure: 0.30,
            ..Default::default()
        });
        let candidates: Vec<(String, SizingInput)> = vec![
            ("a".into(), SizingInput::new(8.0, 1.0, 1_000_000.0)),
            ("b".into(), SizingInput::new(7.0, 1.0, 1_000_000.0)),
            ("c".into(), SizingInput::new(6.0, 1.0, 1_000_000.0)),
            ("d".into(), SizingInput::new(-1.0, 1.0, 1_000_000.0)),
        ];

        let allocations = sizer.allocate(&candidates);
        let included: Vec<&str> = allocations
            .iter()
            .filter(|a| a.included)
            .map(|a| a.id.as_str())
            .collect();

        assert_eq!(allocations[0].id, "a");
        assert_eq!(included, vec!["a", "b"]);
        let exposure: f64 = allocations.iter().filter(|a| a.included).map(|a| a.size.fraction).sum();
        assert!(exposure <= 0.30 + 1e-12);
    }
}
