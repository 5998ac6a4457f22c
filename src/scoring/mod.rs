//! 🎯 Signal scoring backends
//!
//! Two explicit variants chosen by configuration: a deterministic `Mock` derived from
//! the regime classification, and an `Http` backend that POSTs the regime context to an
//! external scoring service. Every call goes through the `CallBudget`; a denied or failed
//! call becomes `ScoreOutcome::NotComputed` with a reason code instead of an error that
//! would abort the cycle.

pub mod budget;

pub use budget::{BudgetConfig, BudgetDenial, CallBudget};

use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::decision_engine::decision_pack::Direction;
use crate::regime::{PersistenceRecord, RegimeClassification, RegimeKey, RegimeLabel};

/// Forecast type the mock backend reports
pub const MOCK_FORECAST_TYPE: &str = "regime_direction";

/// Regime context sent to a scoring backend
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub symbol: String,
    pub interval: String,
    pub regime: RegimeLabel,
    pub regime_confidence: f64,
    pub probabilities: [f64; 3],
    pub composite_z: Option<f64>,
    pub persistence_days: i64,
    pub stability: f64,
}

impl ScoreRequest {
    pub fn new(key: &RegimeKey, classification: &RegimeClassification, record: &PersistenceRecord) -> Self {
        Self {
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
            regime: record.regime,
            regime_confidence: classification.confidence,
            probabilities: classification.probabilities,
            composite_z: classification.composite_z,
            persistence_days: record.persistence_days,
            stability: record.stability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    /// Sharpe-like edge
    pub edge: f64,
    pub confidence: f64,
    pub direction: Direction,
    pub forecast_type: String,
}

#[derive(Debug, Deserialize)]
struct HttpScoreResponse {
    edge: f64,
    confidence: f64,
    direction: String,
    #[serde(default)]
    forecast_type: Option<String>,
}

impl HttpScoreResponse {
    fn into_score(self) -> Result<Score, ScoringError> {
        if !self.edge.is_finite() {
            return Err(ScoringError::InvalidResponse(format!("non-finite edge {}", self.edge)));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ScoringError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        let direction = Direction::from_str(&self.direction).map_err(ScoringError::InvalidResponse)?;
        Ok(Score {
            edge: self.edge,
            confidence: self.confidence,
            direction,
            forecast_type: self.forecast_type.unwrap_or_else(|| MOCK_FORECAST_TYPE.to_string()),
        })
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scoring service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid scoring response: {0}")]
    InvalidResponse(String),
}

/// Why no score was produced
#[derive(Debug, Clone, PartialEq)]
pub enum NotComputedReason {
    RateLimited { calls_in_window: usize },
    CostCeiling { spent_today_usd: f64 },
    ProviderError { detail: String },
}

impl NotComputedReason {
    pub fn code(&self) -> &'static str {
        match self {
            NotComputedReason::RateLimited { .. } => "RATE_LIMITED",
            NotComputedReason::CostCeiling { .. } => "COST_CEILING",
            NotComputedReason::ProviderError { .. } => "PROVIDER_ERROR",
        }
    }
}

impl fmt::Display for NotComputedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotComputedReason::RateLimited { calls_in_window } => {
                write!(f, "{} ({} calls this hour)", self.code(), calls_in_window)
            }
            NotComputedReason::CostCeiling { spent_today_usd } => {
                write!(f, "{} (${:.2} today)", self.code(), spent_today_usd)
            }
            NotComputedReason::ProviderError { detail } => write!(f, "{} ({})", self.code(), detail),
        }
    }
}

impl From<BudgetDenial> for NotComputedReason {
    fn from(denial: BudgetDenial) -> Self {
        match denial {
            BudgetDenial::RateLimited { calls_in_window, .. } => NotComputedReason::RateLimited { calls_in_window },
            BudgetDenial::CostCeiling { spent_today_usd, .. } => NotComputedReason::CostCeiling { spent_today_usd },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    Computed(Score),
    NotComputed(NotComputedReason),
}

impl ScoreOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            ScoreOutcome::Computed(_) => "COMPUTED",
            ScoreOutcome::NotComputed(reason) => reason.code(),
        }
    }
}

pub enum ScoringBackend {
    Mock,
    Http {
        client: Client,
        endpoint: String,
        api_key: Option<String>,
    },
}

impl ScoringBackend {
    pub fn http(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, ScoringError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(ScoringBackend::Http {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScoringBackend::Mock => "mock",
            ScoringBackend::Http { .. } => "http",
        }
    }

    pub async fn score(&self, request: &ScoreRequest) -> Result<Score, ScoringError> {
        match self {
            ScoringBackend::Mock => Ok(mock_score(request)),
            ScoringBackend::Http {
                client,
                endpoint,
                api_key,
            } => {
                let mut builder = client.post(endpoint).json(request);
                if let Some(key) = api_key {
                    builder = builder.bearer_auth(key);
                }
                let response = builder.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ScoringError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                let parsed: HttpScoreResponse = response.json().await?;
                parsed.into_score()
            }
        }
    }
}

/// Direction follows the regime; edge scales the composite z by regime stability
fn mock_score(request: &ScoreRequest) -> Score {
    let direction = match request.regime {
        RegimeLabel::Bull => Direction::Long,
        RegimeLabel::Bear => Direction::Short,
        RegimeLabel::Neutral => Direction::Neutral,
    };
    let z = request.composite_z.unwrap_or(0.0).abs();
    Score {
        edge: z * (0.5 + 0.5 * request.stability),
        confidence: request.regime_confidence,
        direction,
        forecast_type: MOCK_FORECAST_TYPE.to_string(),
    }
}

/// Scoring backend wrapped in the call budget
pub struct BudgetedScorer {
    backend: ScoringBackend,
    budget: CallBudget,
}

impl BudgetedScorer {
    pub fn new(backend: ScoringBackend, budget: CallBudget) -> Self {
        Self { backend, budget }
    }

    pub fn budget(&self) -> &CallBudget {
        &self.budget
    }

    pub async fn score(&self, request: &ScoreRequest) -> ScoreOutcome {
        if let Err(denial) = self.budget.try_acquire() {
            return ScoreOutcome::NotComputed(denial.into());
        }
        match self.backend.score(request).await {
            Ok(score) => {
                debug!(
                    "🎯 {}/{} scored by {}: {} edge={:.3} conf={:.2}",
                    request.symbol,
                    request.interval,
                    self.backend.name(),
                    score.direction,
                    score.edge,
                    score.confidence
                );
                ScoreOutcome::Computed(score)
            }
            Err(e) => {
                warn!("⚠️ Scoring {}/{} failed: {}", request.symbol, request.interval, e);
                ScoreOutcome::NotComputed(NotComputedReason::ProviderError { detail: e.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn request(regime: RegimeLabel, z: Option<f64>, stability: f64) -> ScoreRequest {
        ScoreRequest {
            symbol: "SPY".into(),
            interval: "1d".into(),
            regime,
            regime_confidence: 0.8,
            probabilities: [0.1, 0.1, 0.8],
            composite_z: z,
            persistence_days: 12,
            stability,
        }
    }

    fn budget(max_calls: usize) -> CallBudget {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()));
        CallBudget::new(
            BudgetConfig {
                max_calls_per_hour: max_calls,
                daily_cost_ceiling_usd: 10.0,
                cost_per_call_usd: 0.01,
            },
            clock,
        )
    }

    #[test]
    fn test_mock_score_follows_regime() {
        let bull = mock_score(&request(RegimeLabel::Bull, Some(1.2), 1.0));
        assert_eq!(bull.direction, Direction::Long);
        assert!((bull.edge - 1.2).abs() < 1e-12);
        assert_eq!(bull.confidence, 0.8);

        let bear = mock_score(&request(RegimeLabel::Bear, Some(-1.2), 0.0));
        assert_eq!(bear.direction, Direction::Short);
        assert!((bear.edge - 0.6).abs() < 1e-12);

        let flat = mock_score(&request(RegimeLabel::Neutral, None, 0.5));
        assert_eq!(flat.direction, Direction::Neutral);
        assert_eq!(flat.edge, 0.0);
    }

    #[test]
    fn test_http_response_validation() {
        let ok = HttpScoreResponse {
            edge: 0.4,
            confidence: 0.7,
            direction: "short".into(),
            forecast_type: Some("earnings_drift".into()),
        }
        .into_score()
        .unwrap();
        assert_eq!(ok.direction, Direction::Short);
        assert_eq!(ok.forecast_type, "earnings_drift");

        let bad = HttpScoreResponse {
            edge: 0.4,
            confidence: 1.7,
            direction: "LONG".into(),
            forecast_type: None,
        };
        assert!(matches!(bad.into_score(), Err(ScoringError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_flagged_not_computed() {
        let scorer = BudgetedScorer::new(ScoringBackend::Mock, budget(1));
        let req = request(RegimeLabel::Bull, Some(1.0), 0.5);

        assert!(matches!(scorer.score(&req).await, ScoreOutcome::Computed(_)));
        let second = scorer.score(&req).await;
        assert_eq!(second.code(), "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_provider_failure_is_flagged_not_computed() {
        let backend = ScoringBackend::http("http://127.0.0.1:1/score", None, Duration::from_secs(2)).unwrap();
        let scorer = BudgetedScorer::new(backend, budget(10));
        let outcome = scorer.score(&request(RegimeLabel::Bull, Some(1.0), 0.5)).await;
        assert_eq!(outcome.code(), "PROVIDER_ERROR");
    }
}
