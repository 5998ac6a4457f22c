//! 🛡️ Scoring call budget
//!
//! Rolling one-hour call-rate limit plus a UTC-daily cost ceiling around external
//! scoring calls. A denied call is reported, never silently dropped.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Configuration for the call budget
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_calls_per_hour: usize,   // Default: 60
    pub daily_cost_ceiling_usd: f64, // Default: 5.00
    pub cost_per_call_usd: f64,      // Default: 0.02
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_calls_per_hour: 60,
            daily_cost_ceiling_usd: 5.0,
            cost_per_call_usd: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDenial {
    RateLimited { calls_in_window: usize, limit: usize },
    CostCeiling { spent_today_usd: f64, ceiling_usd: f64 },
}

impl fmt::Display for BudgetDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetDenial::RateLimited { calls_in_window, limit } => {
                write!(f, "{} calls in the last hour (limit {})", calls_in_window, limit)
            }
            BudgetDenial::CostCeiling {
                spent_today_usd,
                ceiling_usd,
            } => write!(f, "${:.2} spent today (ceiling ${:.2})", spent_today_usd, ceiling_usd),
        }
    }
}

#[derive(Debug)]
struct BudgetState {
    calls: VecDeque<DateTime<Utc>>,
    day: NaiveDate,
    spent_today_usd: f64,
}

pub struct CallBudget {
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BudgetState>,
}

impl CallBudget {
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        info!("🛡️ Scoring budget:");
        info!("   Rate limit: {} calls/hour", config.max_calls_per_hour);
        info!(
            "   Cost ceiling: ${:.2}/day at ${:.3}/call",
            config.daily_cost_ceiling_usd, config.cost_per_call_usd
        );
        let today = clock.now().date_naive();
        Self {
            config,
            clock,
            state: Mutex::new(BudgetState {
                calls: VecDeque::new(),
                day: today,
                spent_today_usd: 0.0,
            }),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn roll(&self, state: &mut BudgetState, now: DateTime<Utc>) {
        let window_start = now - Duration::hours(1);
        while state.calls.front().map_or(false, |t| *t <= window_start) {
            state.calls.pop_front();
        }
        let today = now.date_naive();
        if today != state.day {
            debug!("🛡️ New UTC day {}, resetting spend (was ${:.2})", today, state.spent_today_usd);
            state.day = today;
            state.spent_today_usd = 0.0;
        }
    }

    /// Reserve one call; the cost is charged up front
    pub fn try_acquire(&self) -> Result<(), BudgetDenial> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.roll(&mut state, now);

        if state.calls.len() >= self.config.max_calls_per_hour {
            let denial = BudgetDenial::RateLimited {
                calls_in_window: state.calls.len(),
                limit: self.config.max_calls_per_hour,
            };
            warn!("🚫 Scoring call denied: {}", denial);
            return Err(denial);
        }

        if state.spent_today_usd + self.config.cost_per_call_usd > self.config.daily_cost_ceiling_usd + 1e-9 {
            let denial = BudgetDenial::CostCeiling {
                spent_today_usd: state.spent_today_usd,
                ceiling_usd: self.config.daily_cost_ceiling_usd,
            };
            warn!("🚫 Scoring call denied: {}", denial);
            return Err(denial);
        }

        state.calls.push_back(now);
        state.spent_today_usd += self.config.cost_per_call_usd;
        Ok(())
    }

    pub fn calls_in_window(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        self.roll(&mut state, now);
        state.calls.len()
    }

    pub fn spent_today_usd(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock();
        self.roll(&mut state, now);
        state.spent_today_usd
    }
}
