//! 👻 Shadow trade and the exit state machine
//!
//! OPEN → CLOSED, exactly once. Bars strictly after entry are walked in order; per bar
//! the first matching condition wins:
//!   1. STOP_LOSS   adverse extreme breaches entry × (1 ∓ stop%)
//!   2. TAKE_PROFIT favorable extreme breaches entry × (1 ± target%)
//!   3. TIME_EXPIRY bar date ≥ entry date + expected holding period (closes at bar close)
//!
//! Stop-before-target inside one bar is a modelling choice; intrabar ordering is unknown.
//! Stop/target fills happen at the threshold price, not the bar close.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::decision_engine::decision_pack::{DecisionPack, Direction};
use crate::providers::{first_out_of_order, PriceBar};
use crate::regime::RegimeLabel;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeExpiry,
    /// Direction-neutral trades close at the first bar
    NeutralClose,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TimeExpiry => "TIME_EXPIRY",
            ExitReason::NeutralClose => "NEUTRAL_CLOSE",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOP_LOSS" => Ok(ExitReason::StopLoss),
            "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
            "TIME_EXPIRY" => Ok(ExitReason::TimeExpiry),
            "NEUTRAL_CLOSE" => Ok(ExitReason::NeutralClose),
            other => Err(format!("unknown exit reason: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("trade {trade_id}: bar {index} is not strictly after its predecessor")]
    NonAscendingBars { trade_id: Uuid, index: usize },
    #[error("trade {0} is already closed")]
    AlreadyClosed(Uuid),
    #[error("pack {0} has no entry price")]
    MissingEntry(Uuid),
    #[error("shadow store failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowTrade {
    pub id: Uuid,
    pub pack_id: Option<Uuid>,
    pub strategy: String,
    pub asset: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_at: DateTime<Utc>,
    pub expected_holding_days: i64,
    pub stop_pct: f64,
    pub target_pct: f64,
    pub sizing_action: Option<String>,
    pub regime_at_entry: Option<RegimeLabel>,
    pub status: TradeStatus,
    /// Running max favorable excursion, % of entry
    pub mfe_pct: f64,
    /// Running max adverse excursion, % of entry (positive number)
    pub mae_pct: f64,
    pub exit_price: Option<f64>,
    pub exit_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub regime_at_exit: Option<RegimeLabel>,
    pub pnl_usd: Option<f64>,
    pub return_pct: Option<f64>,
}

/// What one evaluation pass concluded
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Exit {
        reason: ExitReason,
        price: f64,
        at: DateTime<Utc>,
        mfe_pct: f64,
        mae_pct: f64,
    },
    /// Bars exist but no condition fired yet
    Holding { mfe_pct: f64, mae_pct: f64, bars_seen: usize },
    /// No bars after entry
    DataGap,
}

impl ShadowTrade {
    /// Open a trade from an executable pack
    pub fn from_pack(pack: &DecisionPack, expected_holding_days: i64) -> Result<Self, ShadowError> {
        let econ = pack.economics();
        let entry_price = econ
            .brackets
            .entry
            .filter(|p| *p > 0.0)
            .ok_or(ShadowError::MissingEntry(pack.id()))?;
        let quantity = econ.sizing.quantity.unwrap_or(econ.sizing.usd / entry_price);

        Ok(Self {
            id: Uuid::new_v4(),
            pack_id: Some(pack.id()),
            strategy: econ.strategy.clone(),
            asset: econ.asset.clone(),
            direction: econ.direction,
            size_usd: econ.sizing.usd,
            quantity,
            entry_price,
            entry_at: econ.snapshot.observed_at,
            expected_holding_days,
            stop_pct: econ.risk.stop_pct,
            target_pct: econ.risk.target_pct,
            sizing_action: econ.sizing.sizing_action.clone(),
            regime_at_entry: Some(econ.snapshot.regime),
            status: TradeStatus::Open,
            mfe_pct: 0.0,
            mae_pct: 0.0,
            exit_price: None,
            exit_at: None,
            exit_reason: None,
            regime_at_exit: None,
            pnl_usd: None,
            return_pct: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn stop_price(&self) -> f64 {
        match self.direction {
            Direction::Short => self.entry_price + self.entry_price * self.stop_pct,
            _ => self.entry_price - self.entry_price * self.stop_pct,
        }
    }

    pub fn target_price(&self) -> f64 {
        match self.direction {
            Direction::Short => self.entry_price - self.entry_price * self.target_pct,
            _ => self.entry_price + self.entry_price * self.target_pct,
        }
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.entry_at + Duration::days(self.expected_holding_days)
    }

    /// Walk `bars` (already restricted to the evaluation horizon) without mutating.
    ///
    /// Bars at or before entry are ignored; the rest must be strictly ascending.
    pub fn evaluate(&self, bars: &[PriceBar]) -> Result<Evaluation, ShadowError> {
        if !self.is_open() {
            return Err(ShadowError::AlreadyClosed(self.id));
        }

        let after_entry: Vec<&PriceBar> = bars.iter().filter(|b| b.ts > self.entry_at).collect();
        if after_entry.is_empty() {
            return Ok(Evaluation::DataGap);
        }
        let owned: Vec<PriceBar> = after_entry.iter().map(|b| (*b).clone()).collect();
        if let Some(index) = first_out_of_order(&owned) {
            return Err(ShadowError::NonAscendingBars {
                trade_id: self.id,
                index,
            });
        }

        let stop = self.stop_price();
        let target = self.target_price();
        let expiry_date = self.expiry().date_naive();
        let mut mfe = self.mfe_pct;
        let mut mae = self.mae_pct;

        for bar in &owned {
            let (favorable, adverse) = self.excursions(bar);
            mfe = mfe.max(favorable);
            mae = mae.max(adverse);

            let exit = match self.direction {
                Direction::Neutral => Some((ExitReason::NeutralClose, bar.close)),
                Direction::Long if bar.low <= stop => Some((ExitReason::StopLoss, stop)),
                Direction::Short if bar.high >= stop => Some((ExitReason::StopLoss, stop)),
                Direction::Long if bar.high >= target => Some((ExitReason::TakeProfit, target)),
                Direction::Short if bar.low <= target => Some((ExitReason::TakeProfit, target)),
                _ if bar.ts.date_naive() >= expiry_date => Some((ExitReason::TimeExpiry, bar.close)),
                _ => None,
            };

            if let Some((reason, price)) = exit {
                return Ok(Evaluation::Exit {
                    reason,
                    price,
                    at: bar.ts,
                    mfe_pct: mfe,
                    mae_pct: mae,
                });
            }
        }

        Ok(Evaluation::Holding {
            mfe_pct: mfe,
            mae_pct: mae,
            bars_seen: owned.len(),
        })
    }

    /// Favorable / adverse excursion of one bar, % of entry
    fn excursions(&self, bar: &PriceBar) -> (f64, f64) {
        let entry = self.entry_price;
        match self.direction {
            Direction::Long => (
                ((bar.high - entry) / entry * 100.0).max(0.0),
                ((entry - bar.low) / entry * 100.0).max(0.0),
            ),
            Direction::Short => (
                ((entry - bar.low) / entry * 100.0).max(0.0),
                ((bar.high - entry) / entry * 100.0).max(0.0),
            ),
            Direction::Neutral => (0.0, 0.0),
        }
    }

    /// The closed copy of this trade. All exit fields are set together.
    pub fn closed(
        &self,
        reason: ExitReason,
        exit_price: f64,
        exit_at: DateTime<Utc>,
        mfe_pct: f64,
        mae_pct: f64,
        regime_at_exit: Option<RegimeLabel>,
    ) -> Self {
        let sign = self.direction.sign();
        let move_per_unit = (exit_price - self.entry_price) * sign;
        let mut closed = self.clone();
        closed.status = TradeStatus::Closed;
        closed.mfe_pct = mfe_pct;
        closed.mae_pct = mae_pct;
        closed.exit_price = Some(exit_price);
        closed.exit_at = Some(exit_at);
        closed.exit_reason = Some(reason);
        closed.regime_at_exit = regime_at_exit;
        closed.pnl_usd = Some(move_per_unit * self.quantity);
        closed.return_pct = Some(move_per_unit / self.entry_price * 100.0);
        closed
    }
}
