//! Configuration management for the rehearsal engine
//!
//! Loads configuration from environment variables (via .env file) and provides
//! validated, type-safe access to all parameters. Each section converts into the
//! component's own config struct.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cycle::CycleConfig;
use crate::decision_engine::bandit::RewardMode;
use crate::decision_engine::pack_generator::PackGeneratorConfig;
use crate::decision_engine::position_sizer::PositionSizerConfig;
use crate::regime::ClassifierConfig;
use crate::scoring::BudgetConfig;
use crate::shadow::ShadowEngineConfig;
use crate::validation::ValidationConfig as ValidationTierConfig;

/// Complete configuration for the rehearsal engine
#[derive(Debug, Clone)]
pub struct Config {
    pub regime: RegimeConfig,
    pub validation: ValidationConfig,
    pub sizing: SizingConfig,
    pub pack: PackConfig,
    pub bandit: BanditConfig,
    pub shadow: ShadowConfig,
    pub scoring: ScoringConfig,
    pub signing: SigningConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub cycle: CycleSettings,
}

/// Regime classifier thresholds
#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub enter_threshold: f64,
    pub stay_threshold: f64,
    pub min_features: usize,
    pub sharpness: f64,
    pub min_persistence_days: i64,
    /// Interval whose persistence record stamps regime at entry/exit
    pub interval: String,
}

/// Validation tier limits
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub min_features: usize,
    pub min_avg_segment_days: f64,
    pub max_transitions_90d: u32,
    pub tolerance: f64,
}

/// Kelly sizing parameters
#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub kelly_multiplier: f64,
    pub win_slope: f64,
    pub payoff_slope: f64,
    pub max_fraction: f64,
    pub min_fraction: f64,
    pub min_position_usd: f64,
    pub max_portfolio_exposure: f64,
}

/// Decision pack generation
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub capital_usd: f64,
    pub stop_pct: f64,
    pub target_pct: f64,
    pub min_risk_reward: f64,
    pub confidence_damping: f64,
    pub snapshot_ttl_secs: i64,
    pub order_ttl_secs: i64,
    /// Calibration table max age before a refresh is required
    pub calibration_max_age_secs: i64,
    /// How far back to pick up signal candidates
    pub candidate_lookback_hours: i64,
}

/// Bandit reward shaping
#[derive(Debug, Clone)]
pub struct BanditConfig {
    /// "binary" or "continuous"
    pub reward_mode: String,
    pub binary_threshold: f64,
    pub continuous_scale: f64,
    /// Fixed seed for reproducible replays
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ShadowConfig {
    pub expected_holding_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringBackendKind {
    Mock,
    Http,
}

impl FromStr for ScoringBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(ScoringBackendKind::Mock),
            "http" => Ok(ScoringBackendKind::Http),
            other => anyhow::bail!("Unknown SCORING_BACKEND '{}' (expected mock|http)", other),
        }
    }
}

/// Scoring backend and call budget
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub backend: ScoringBackendKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_calls_per_hour: usize,
    pub daily_cost_ceiling_usd: f64,
    pub cost_per_call_usd: f64,
}

/// Record/pack signing identity
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub signer_id: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
    pub wal_mode: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

/// Scoring cycle settings
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub strategy: String,
    pub asset_class: String,
    pub agreement: f64,
    pub loop_interval_secs: u64,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    /// Load configuration from environment variables
    ///
    /// Reads a .env file in the working directory if present. Unset keys take their
    /// defaults; set but unparsable keys are an error.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (ignoring error if not found)
        let _ = dotenv::dotenv();
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    fn from_lookup(env: Lookup<'_>) -> Result<Self> {
        Ok(Config {
            regime: RegimeConfig {
                enter_threshold: get_env(env, "REGIME_ENTER_THRESHOLD", 0.85)?,
                stay_threshold: get_env(env, "REGIME_STAY_THRESHOLD", 0.60)?,
                min_features: get_env(env, "REGIME_MIN_FEATURES", 5)?,
                sharpness: get_env(env, "REGIME_SHARPNESS", 4.0)?,
                min_persistence_days: get_env(env, "REGIME_MIN_PERSISTENCE_DAYS", 5)?,
                interval: get_env_string(env, "REGIME_INTERVAL", "1d"),
            },
            validation: ValidationConfig {
                min_features: get_env(env, "VALIDATION_MIN_FEATURES", 5)?,
                min_avg_segment_days: get_env(env, "VALIDATION_MIN_AVG_SEGMENT_DAYS", 5.0)?,
                max_transitions_90d: get_env(env, "VALIDATION_MAX_TRANSITIONS_90D", 30)?,
                tolerance: get_env(env, "VALIDATION_TOLERANCE", 0.01)?,
            },
            sizing: SizingConfig {
                kelly_multiplier: get_env(env, "KELLY_MULTIPLIER", 0.25)?,
                win_slope: get_env(env, "KELLY_WIN_SLOPE", 0.15)?,
                payoff_slope: get_env(env, "KELLY_PAYOFF_SLOPE", 0.5)?,
                max_fraction: get_env(env, "MAX_POSITION_FRACTION", 0.15)?,
                min_fraction: get_env(env, "MIN_POSITION_FRACTION", 0.005)?,
                min_position_usd: get_env(env, "MIN_POSITION_USD", 100.0)?,
                max_portfolio_exposure: get_env(env, "MAX_PORTFOLIO_EXPOSURE", 0.50)?,
            },
            pack: PackConfig {
                capital_usd: get_env(env, "CAPITAL_USD", 100_000.0)?,
                stop_pct: get_env(env, "STOP_PCT", 0.05)?,
                target_pct: get_env(env, "TARGET_PCT", 0.10)?,
                min_risk_reward: get_env(env, "MIN_RISK_REWARD", 1.0)?,
                confidence_damping: get_env(env, "CONFIDENCE_DAMPING", 0.90)?,
                snapshot_ttl_secs: get_env(env, "SNAPSHOT_TTL_SECS", 4 * 3600)?,
                order_ttl_secs: get_env(env, "ORDER_TTL_SECS", 24 * 3600)?,
                calibration_max_age_secs: get_env(env, "CALIBRATION_MAX_AGE_SECS", 6 * 3600)?,
                candidate_lookback_hours: get_env(env, "CANDIDATE_LOOKBACK_HOURS", 24)?,
            },
            bandit: BanditConfig {
                reward_mode: get_env_string(env, "BANDIT_REWARD_MODE", "continuous"),
                binary_threshold: get_env(env, "BANDIT_BINARY_THRESHOLD", 0.0)?,
                continuous_scale: get_env(env, "BANDIT_REWARD_SCALE", 5.0)?,
                seed: get_env_opt::<u64>(env, "BANDIT_SEED")?,
            },
            shadow: ShadowConfig {
                expected_holding_days: get_env(env, "EXPECTED_HOLDING_DAYS", 10)?,
            },
            scoring: ScoringConfig {
                backend: get_env_string(env, "SCORING_BACKEND", "mock").parse()?,
                endpoint: get_env_string(env, "SCORING_ENDPOINT", ""),
                api_key: env("SCORING_API_KEY").filter(|k| !k.is_empty()),
                timeout_secs: get_env(env, "SCORING_TIMEOUT_SECS", 30)?,
                max_calls_per_hour: get_env(env, "SCORING_MAX_CALLS_PER_HOUR", 60)?,
                daily_cost_ceiling_usd: get_env(env, "SCORING_DAILY_COST_CEILING_USD", 5.0)?,
                cost_per_call_usd: get_env(env, "SCORING_COST_PER_CALL_USD", 0.02)?,
            },
            signing: SigningConfig {
                signer_id: get_env_string(env, "SIGNER_ID", "rehearsal-desk"),
                key: get_env_string(env, "SIGNING_KEY", ""),
            },
            database: DatabaseConfig {
                sqlite_path: PathBuf::from(get_env_string(env, "SQLITE_PATH", "./data/rehearsal.db")),
                wal_mode: get_env_bool(env, "SQLITE_WAL", true)?,
            },
            logging: LoggingConfig {
                log_level: get_env_string(env, "LOG_LEVEL", "info"),
            },
            cycle: CycleSettings {
                strategy: get_env_string(env, "STRATEGY_NAME", "regime_momentum"),
                asset_class: get_env_string(env, "ASSET_CLASS", "equity"),
                agreement: get_env(env, "SIGNAL_AGREEMENT", 1.0)?,
                loop_interval_secs: get_env(env, "CYCLE_INTERVAL_SECS", 3600)?,
            },
        })
    }

    /// Validate configuration values are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        // Regime
        if self.regime.stay_threshold <= 0.0 || self.regime.stay_threshold > self.regime.enter_threshold {
            anyhow::bail!("REGIME_STAY_THRESHOLD must be > 0 and ≤ REGIME_ENTER_THRESHOLD");
        }
        if self.regime.min_features == 0 || self.regime.min_features > crate::regime::FEATURE_COUNT {
            anyhow::bail!("REGIME_MIN_FEATURES must be between 1 and 7");
        }
        if self.regime.sharpness <= 0.0 {
            anyhow::bail!("REGIME_SHARPNESS must be > 0");
        }
        if self.regime.min_persistence_days < 0 {
            anyhow::bail!("REGIME_MIN_PERSISTENCE_DAYS must be ≥ 0");
        }

        // Validation
        if self.validation.min_features > crate::regime::FEATURE_COUNT {
            anyhow::bail!("VALIDATION_MIN_FEATURES must be ≤ 7");
        }
        if self.validation.tolerance <= 0.0 || self.validation.tolerance >= 1.0 {
            anyhow::bail!("VALIDATION_TOLERANCE must be between 0.0 and 1.0");
        }

        // Sizing
        for (name, value) in [
            ("KELLY_MULTIPLIER", self.sizing.kelly_multiplier),
            ("MAX_POSITION_FRACTION", self.sizing.max_fraction),
            ("MIN_POSITION_FRACTION", self.sizing.min_fraction),
            ("MAX_PORTFOLIO_EXPOSURE", self.sizing.max_portfolio_exposure),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }
        if self.sizing.min_fraction > self.sizing.max_fraction {
            anyhow::bail!("MIN_POSITION_FRACTION cannot exceed MAX_POSITION_FRACTION");
        }

        // Pack
        if self.pack.capital_usd <= 0.0 {
            anyhow::bail!("CAPITAL_USD must be > 0");
        }
        if self.pack.stop_pct <= 0.0 || self.pack.stop_pct >= 1.0 {
            anyhow::bail!("STOP_PCT must be between 0.0 and 1.0");
        }
        if self.pack.target_pct <= 0.0 {
            anyhow::bail!("TARGET_PCT must be > 0");
        }
        if !(0.0..=1.0).contains(&self.pack.confidence_damping) {
            anyhow::bail!("CONFIDENCE_DAMPING must be between 0.0 and 1.0");
        }
        if self.pack.snapshot_ttl_secs <= 0 || self.pack.order_ttl_secs <= 0 {
            anyhow::bail!("SNAPSHOT_TTL_SECS and ORDER_TTL_SECS must be > 0");
        }
        if self.pack.calibration_max_age_secs <= 0 {
            anyhow::bail!("CALIBRATION_MAX_AGE_SECS must be > 0");
        }

        // Bandit
        self.reward_mode()?;
        if self.bandit.continuous_scale <= 0.0 {
            anyhow::bail!("BANDIT_REWARD_SCALE must be > 0");
        }

        // Shadow
        if self.shadow.expected_holding_days <= 0 {
            anyhow::bail!("EXPECTED_HOLDING_DAYS must be > 0");
        }

        // Scoring
        if self.scoring.backend == ScoringBackendKind::Http && self.scoring.endpoint.is_empty() {
            anyhow::bail!("SCORING_ENDPOINT must be set when SCORING_BACKEND=http");
        }
        if self.scoring.max_calls_per_hour == 0 {
            anyhow::bail!("SCORING_MAX_CALLS_PER_HOUR must be > 0");
        }
        if self.scoring.daily_cost_ceiling_usd < 0.0 || self.scoring.cost_per_call_usd < 0.0 {
            anyhow::bail!("Scoring cost settings must be ≥ 0");
        }

        // Signing
        if self.signing.key.is_empty() {
            anyhow::bail!("SIGNING_KEY must be set");
        }
        if self.signing.signer_id.is_empty() {
            anyhow::bail!("SIGNER_ID must be set");
        }

        // Cycle
        if self.cycle.agreement <= 0.0 {
            anyhow::bail!("SIGNAL_AGREEMENT must be > 0");
        }
        if self.cycle.loop_interval_secs == 0 {
            anyhow::bail!("CYCLE_INTERVAL_SECS must be > 0");
        }

        Ok(())
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            enter_threshold: self.regime.enter_threshold,
            stay_threshold: self.regime.stay_threshold,
            min_features: self.regime.min_features,
            sharpness: self.regime.sharpness,
            min_persistence_days: self.regime.min_persistence_days,
            ..ClassifierConfig::default()
        }
    }

    pub fn validation_config(&self) -> ValidationTierConfig {
        ValidationTierConfig {
            min_features: self.validation.min_features,
            min_avg_segment_days: self.validation.min_avg_segment_days,
            max_transitions_90d: self.validation.max_transitions_90d,
            tolerance: self.validation.tolerance,
        }
    }

    pub fn sizer_config(&self) -> PositionSizerConfig {
        PositionSizerConfig {
            kelly_multiplier: self.sizing.kelly_multiplier,
            win_slope: self.sizing.win_slope,
            payoff_slope: self.sizing.payoff_slope,
            max_fraction: self.sizing.max_fraction,
            min_fraction: self.sizing.min_fraction,
            min_position_usd: self.sizing.min_position_usd,
            max_portfolio_exposure: self.sizing.max_portfolio_exposure,
        }
    }

    pub fn pack_generator_config(&self, dry_run: bool) -> PackGeneratorConfig {
        PackGeneratorConfig {
            capital_usd: self.pack.capital_usd,
            stop_pct: self.pack.stop_pct,
            target_pct: self.pack.target_pct,
            min_risk_reward: self.pack.min_risk_reward,
            confidence_damping: self.pack.confidence_damping,
            snapshot_ttl_secs: self.pack.snapshot_ttl_secs,
            order_ttl_secs: self.pack.order_ttl_secs,
            dry_run,
        }
    }

    pub fn reward_mode(&self) -> Result<RewardMode> {
        match self.bandit.reward_mode.to_ascii_lowercase().as_str() {
            "binary" => Ok(RewardMode::Binary {
                threshold: self.bandit.binary_threshold,
            }),
            "continuous" => Ok(RewardMode::Continuous {
                scale: self.bandit.continuous_scale,
            }),
            other => anyhow::bail!("Unknown BANDIT_REWARD_MODE '{}' (expected binary|continuous)", other),
        }
    }

    pub fn shadow_config(&self, dry_run: bool) -> ShadowEngineConfig {
        ShadowEngineConfig {
            expected_holding_days: self.shadow.expected_holding_days,
            dry_run,
        }
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_calls_per_hour: self.scoring.max_calls_per_hour,
            daily_cost_ceiling_usd: self.scoring.daily_cost_ceiling_usd,
            cost_per_call_usd: self.scoring.cost_per_call_usd,
        }
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_secs(self.scoring.timeout_secs)
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            strategy: self.cycle.strategy.clone(),
            asset_class: self.cycle.asset_class.clone(),
            agreement: self.cycle.agreement,
            loop_interval_secs: self.cycle.loop_interval_secs,
        }
    }
}

// Helper functions for environment variable parsing

fn get_env_string(env: Lookup<'_>, key: &str, default: &str) -> String {
    env(key).unwrap_or_else(|| default.to_string())
}

fn get_env<T: FromStr>(env: Lookup<'_>, key: &str, default: T) -> Result<T> {
    Ok(get_env_opt(env, key)?.unwrap_or(default))
}

fn get_env_opt<T: FromStr>(env: Lookup<'_>, key: &str) -> Result<Option<T>> {
    match env(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .ok()
            .context(format!("Invalid {} value: {}", key, raw)),
    }
}

fn get_env_bool(env: Lookup<'_>, key: &str, default: bool) -> Result<bool> {
    match env(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("Invalid {} value: {}", key, v),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(&move |key: &str| map.get(key).cloned())
    }

    fn valid() -> Config {
        load(&[("SIGNING_KEY", "test-key")]).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = valid();
        assert_eq!(config.regime.enter_threshold, 0.85);
        assert_eq!(config.validation.max_transitions_90d, 30);
        assert_eq!(config.sizing.kelly_multiplier, 0.25);
        assert_eq!(config.pack.stop_pct, 0.05);
        assert_eq!(config.scoring.backend, ScoringBackendKind::Mock);
        assert_eq!(config.bandit.seed, None);
        assert!(config.database.wal_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_override() {
        let config = load(&[
            ("SIGNING_KEY", "k"),
            ("KELLY_MULTIPLIER", "0.5"),
            ("BANDIT_SEED", "42"),
            ("SCORING_BACKEND", "HTTP"),
            ("SCORING_ENDPOINT", "http://localhost:8080/score"),
            ("SQLITE_WAL", "false"),
        ])
        .unwrap();
        assert_eq!(config.sizing.kelly_multiplier, 0.5);
        assert_eq!(config.bandit.seed, Some(42));
        assert_eq!(config.scoring.backend, ScoringBackendKind::Http);
        assert!(!config.database.wal_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_value_is_an_error() {
        assert!(load(&[("CAPITAL_USD", "lots")]).is_err());
        assert!(load(&[("SCORING_BACKEND", "oracle")]).is_err());
        assert!(load(&[("SQLITE_WAL", "maybe")]).is_err());
    }

    #[test]
    fn test_config_validation_missing_signing_key() {
        let config = load(&[]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_threshold_order() {
        let mut config = valid();
        config.regime.stay_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fractions() {
        let mut config = valid();
        config.sizing.max_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.sizing.min_fraction = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_http_needs_endpoint() {
        let mut config = valid();
        config.scoring.backend = ScoringBackendKind::Http;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_reward_mode() {
        let mut config = valid();
        config.bandit.reward_mode = "greedy".into();
        assert!(config.validate().is_err());

        config.bandit.reward_mode = "binary".into();
        assert_eq!(config.reward_mode().unwrap(), RewardMode::Binary { threshold: 0.0 });
    }

    #[test]
    fn test_component_conversions() {
        let config = valid();
        let classifier = config.classifier_config();
        assert_eq!(classifier.weights, ClassifierConfig::default().weights);
        assert!(config.pack_generator_config(true).dry_run);
        assert_eq!(config.shadow_config(false).expected_holding_days, 10);
        assert_eq!(config.budget_config().max_calls_per_hour, 60);
        assert_eq!(config.cycle_config().strategy, "regime_momentum");
    }
}
