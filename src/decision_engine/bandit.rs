//! 🎰 Action Bandit - Thompson Sampling over sizing/timing actions
//!
//! One Beta(1,1)-initialised posterior per action, per (strategy, regime, dimension).
//! - `select_action` samples every posterior and takes the largest draw (exploration
//!   comes from posterior variance alone)
//! - `recommended_action` is the highest posterior mean, for reporting only
//! - `update` takes either binary rewards (threshold) or continuous P&L-like rewards
//!   squashed through a bounded logistic into fractional pseudo-counts

use dashmap::DashMap;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

use crate::regime::RegimeLabel;

/// Logistic output is clamped to this band so one outlier can't dominate a posterior
const MIN_PSEUDO_SUCCESS: f64 = 0.01;
const MAX_PSEUDO_SUCCESS: f64 = 0.99;

/// Which decision a bandit learns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionDimension {
    Sizing,
    Timing,
}

impl DecisionDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionDimension::Sizing => "sizing",
            DecisionDimension::Timing => "timing",
        }
    }

    /// Discrete actions for this dimension
    pub fn actions(self) -> &'static [&'static str] {
        match self {
            DecisionDimension::Sizing => &["conservative", "standard", "aggressive"],
            DecisionDimension::Timing => &["immediate", "wait_pullback", "scale_in"],
        }
    }
}

impl fmt::Display for DecisionDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sizing" => Ok(DecisionDimension::Sizing),
            "timing" => Ok(DecisionDimension::Timing),
            other => Err(format!("unknown decision dimension: {}", other)),
        }
    }
}

/// Kelly multiplier for a sizing action
pub fn sizing_multiplier(action: &str) -> Option<f64> {
    match action {
        "conservative" => Some(0.5),
        "standard" => Some(1.0),
        "aggressive" => Some(1.5),
        _ => None,
    }
}

/// How realised rewards are turned into posterior updates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RewardMode {
    /// alpha += 1 if reward > threshold, else beta += 1
    Binary { threshold: f64 },
    /// alpha += p, beta += 1 - p with p = logistic(reward / scale)
    Continuous { scale: f64 },
}

impl Default for RewardMode {
    fn default() -> Self {
        RewardMode::Continuous { scale: 5.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BanditKey {
    pub strategy: String,
    pub regime: RegimeLabel,
    pub dimension: DecisionDimension,
}

impl BanditKey {
    pub fn new(strategy: impl Into<String>, regime: RegimeLabel, dimension: DecisionDimension) -> Self {
        Self {
            strategy: strategy.into(),
            regime,
            dimension,
        }
    }
}

impl fmt::Display for BanditKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.strategy, self.regime, self.dimension)
    }
}

/// Posterior for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditState {
    pub key: BanditKey,
    pub action: String,
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
    pub cumulative_reward: f64,
}

impl BanditState {
    pub fn fresh(key: BanditKey, action: impl Into<String>) -> Self {
        Self {
            key,
            action: action.into(),
            alpha: 1.0,
            beta: 1.0,
            pulls: 0,
            cumulative_reward: 0.0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

#[derive(Debug, Error)]
pub enum BanditError {
    #[error("unknown action '{action}' for bandit {key}")]
    UnknownAction { key: BanditKey, action: String },
    #[error("invalid posterior for {key}/{action}: alpha={alpha}, beta={beta}")]
    InvalidPosterior {
        key: BanditKey,
        action: String,
        alpha: f64,
        beta: f64,
    },
    #[error("bandit {0} has no actions")]
    Empty(BanditKey),
}

/// Thompson-sampling bandit for one (strategy, regime, dimension)
#[derive(Debug, Clone)]
pub struct ActionBandit {
    key: BanditKey,
    arms: Vec<BanditState>,
    reward_mode: RewardMode,
}

impl ActionBandit {
    /// Bandit over the dimension's standard actions
    pub fn new(key: BanditKey, reward_mode: RewardMode) -> Self {
        let actions = key.dimension.actions();
        Self::with_actions(key, actions, reward_mode)
    }

    /// Bandit over an explicit action list
    pub fn with_actions(key: BanditKey, actions: &[&str], reward_mode: RewardMode) -> Self {
        let arms = actions
            .iter()
            .map(|a| BanditState::fresh(key.clone(), *a))
            .collect();
        Self { key, arms, reward_mode }
    }

    /// Reload persisted posteriors. Actions without stored state start at Beta(1,1);
    /// stored rows for actions outside the dimension are ignored.
    pub fn from_states(key: BanditKey, states: Vec<BanditState>, reward_mode: RewardMode) -> Result<Self, BanditError> {
        let mut bandit = Self::new(key, reward_mode);
        for state in states {
            if state.alpha < 1.0 || state.beta < 1.0 || !state.alpha.is_finite() || !state.beta.is_finite() {
                return Err(BanditError::InvalidPosterior {
                    key: bandit.key.clone(),
                    action: state.action,
                    alpha: state.alpha,
                    beta: state.beta,
                });
            }
            if let Some(arm) = bandit.arms.iter_mut().find(|a| a.action == state.action) {
                *arm = BanditState {
                    key: bandit.key.clone(),
                    ..state
                };
            }
        }
        Ok(bandit)
    }

    pub fn key(&self) -> &BanditKey {
        &self.key
    }

    pub fn states(&self) -> &[BanditState] {
        &self.arms
    }

    /// Draw once from every posterior and return the action with the largest draw
    pub fn select_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&str, BanditError> {
        let mut best: Option<(&BanditState, f64)> = None;
        for arm in &self.arms {
            let dist = Beta::new(arm.alpha, arm.beta).map_err(|_| BanditError::InvalidPosterior {
                key: self.key.clone(),
                action: arm.action.clone(),
                alpha: arm.alpha,
                beta: arm.beta,
            })?;
            let draw = dist.sample(rng);
            if best.map_or(true, |(_, b)| draw > b) {
                best = Some((arm, draw));
            }
        }
        best.map(|(arm, _)| arm.action.as_str())
            .ok_or_else(|| BanditError::Empty(self.key.clone()))
    }

    /// Action with the highest posterior mean (ties go to the earlier action)
    pub fn recommended_action(&self) -> Result<&str, BanditError> {
        let mut best: Option<&BanditState> = None;
        for arm in &self.arms {
            if best.map_or(true, |b| arm.mean() > b.mean()) {
                best = Some(arm);
            }
        }
        best.map(|arm| arm.action.as_str())
            .ok_or_else(|| BanditError::Empty(self.key.clone()))
    }

    /// Fold one realised reward into the chosen action's posterior
    pub fn update(&mut self, action: &str, reward: f64) -> Result<&BanditState, BanditError> {
        let mode = self.reward_mode;
        let key = self.key.clone();
        let arm = self
            .arms
            .iter_mut()
            .find(|a| a.action == action)
            .ok_or_else(|| BanditError::UnknownAction {
                key: key.clone(),
                action: action.to_string(),
            })?;

        match mode {
            RewardMode::Binary { threshold } => {
                if reward > threshold {
                    arm.alpha += 1.0;
                } else {
                    arm.beta += 1.0;
                }
            }
            RewardMode::Continuous { scale } => {
                let p = pseudo_success(reward, scale);
                arm.alpha += p;
                arm.beta += 1.0 - p;
            }
        }
        arm.pulls += 1;
        arm.cumulative_reward += reward;

        debug!(
            "🎰 {} {} reward={:.4} → Beta({:.2}, {:.2})",
            key, action, reward, arm.alpha, arm.beta
        );
        Ok(arm)
    }
}

/// Bounded logistic transform of a continuous reward
pub fn pseudo_success(reward: f64, scale: f64) -> f64 {
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let p = 1.0 / (1.0 + (-reward / scale).exp());
    if p.is_nan() {
        0.5
    } else {
        p.clamp(MIN_PSEUDO_SUCCESS, MAX_PSEUDO_SUCCESS)
    }
}

/// All bandits of one process, keyed per (strategy, regime, dimension).
///
/// Writers to the same key are serialised by the map shard lock.
pub struct BanditRegistry {
    bandits: DashMap<BanditKey, ActionBandit>,
    reward_mode: RewardMode,
    rng: Mutex<StdRng>,
}

impl BanditRegistry {
    pub fn new(reward_mode: RewardMode, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            bandits: DashMap::new(),
            reward_mode,
            rng: Mutex::new(rng),
        }
    }

    /// Load persisted posteriors, grouping rows by key
    pub fn load(&self, states: Vec<BanditState>) -> Result<usize, BanditError> {
        let mut grouped: std::collections::BTreeMap<BanditKey, Vec<BanditState>> = Default::default();
        for state in states {
            grouped.entry(state.key.clone()).or_default().push(state);
        }
        let count = grouped.len();
        for (key, rows) in grouped {
            let bandit = ActionBandit::from_states(key.clone(), rows, self.reward_mode)?;
            self.bandits.insert(key, bandit);
        }
        info!("🎰 Loaded {} bandits", count);
        Ok(count)
    }

    /// Exploratory selection for live behaviour
    pub fn select(&self, key: &BanditKey) -> Result<String, BanditError> {
        let bandit = self
            .bandits
            .entry(key.clone())
            .or_insert_with(|| ActionBandit::new(key.clone(), self.reward_mode));
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        bandit.select_action(&mut *rng).map(str::to_string)
    }

    pub fn recommended(&self, key: &BanditKey) -> Result<String, BanditError> {
        match self.bandits.get(key) {
            Some(bandit) => bandit.recommended_action().map(str::to_string),
            None => ActionBandit::new(key.clone(), self.reward_mode)
                .recommended_action()
                .map(str::to_string),
        }
    }

    /// Apply a reward and return the updated posterior for persistence
    pub fn update(&self, key: &BanditKey, action: &str, reward: f64) -> Result<BanditState, BanditError> {
        let mut bandit = self
            .bandits
            .entry(key.clone())
            .or_insert_with(|| ActionBandit::new(key.clone(), self.reward_mode));
        bandit.update(action, reward).cloned()
    }

    pub fn states(&self, key: &BanditKey) -> Vec<BanditState> {
        self.bandits
            .get(key)
            .map(|b| b.states().to_vec())
            .unwrap_or_default()
    }
}
