//! 👻 Shadow Execution Engine
//!
//! Opens shadow trades from executable packs (one per pack) and runs exit passes over
//! OPEN trades. A pass is idempotent: only OPEN trades are evaluated and the close is
//! a conditional update, so re-running after a partial failure never double-closes.

use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use super::trade::{Evaluation, ExitReason, ShadowError, ShadowTrade};
use crate::clock::Clock;
use crate::decision_engine::bandit::{BanditKey, BanditRegistry, DecisionDimension};
use crate::decision_engine::decision_pack::DecisionPack;
use crate::providers::{PriceSeriesProvider, RegimeStateProvider};
use crate::signing::RecordSigner;
use crate::store::{retry_once, SqliteStore};

#[derive(Debug, Clone)]
pub struct ShadowEngineConfig {
    /// Holding period before TIME_EXPIRY
    pub expected_holding_days: i64,
    /// Evaluate and report but write nothing
    pub dry_run: bool,
}

impl Default for ShadowEngineConfig {
    fn default() -> Self {
        Self {
            expected_holding_days: 10,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct OpenReport {
    pub opened: Vec<Uuid>,
    /// (pack id, rejection code)
    pub rejected: Vec<(Uuid, String)>,
    pub already_open: usize,
    pub failed: Vec<(Uuid, String)>,
}

#[derive(Debug, Default)]
pub struct ExitReport {
    pub closed: Vec<(Uuid, ExitReason)>,
    pub holding: usize,
    /// No bars after entry yet; the trade stays OPEN
    pub data_gaps: Vec<Uuid>,
    /// Bar history not strictly ascending; the trade stays OPEN
    pub bad_bars: Vec<Uuid>,
    /// Another writer closed the trade first
    pub lost_races: usize,
    pub failed: Vec<(Uuid, String)>,
}

enum ExitStep {
    Closed(ExitReason),
    Holding,
    DataGap,
    LostRace,
}

pub struct ShadowExecutionEngine {
    store: Arc<SqliteStore>,
    prices: Arc<dyn PriceSeriesProvider>,
    regimes: Arc<dyn RegimeStateProvider>,
    bandits: Arc<BanditRegistry>,
    signer: RecordSigner,
    clock: Arc<dyn Clock>,
    config: ShadowEngineConfig,
}

impl ShadowExecutionEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        prices: Arc<dyn PriceSeriesProvider>,
        regimes: Arc<dyn RegimeStateProvider>,
        bandits: Arc<BanditRegistry>,
        signer: RecordSigner,
        clock: Arc<dyn Clock>,
        config: ShadowEngineConfig,
    ) -> Self {
        Self {
            store,
            prices,
            regimes,
            bandits,
            signer,
            clock,
            config,
        }
    }

    /// Open one shadow trade per executable pack not yet opened
    pub fn open_pending(&self) -> Result<OpenReport, ShadowError> {
        let packs = self.store.packs_without_shadow_trade()?;
        Ok(self.open_from_packs(&packs))
    }

    pub fn open_from_packs(&self, packs: &[DecisionPack]) -> OpenReport {
        let now = self.clock.now();
        let mut report = OpenReport::default();

        for pack in packs {
            match self.open_one(pack, now) {
                Ok(Some(trade_id)) => report.opened.push(trade_id),
                Ok(None) => report.already_open += 1,
                Err(OpenError::Rejected(code)) => {
                    debug!("🚫 Pack {} not executable: {}", pack.id(), code);
                    report.rejected.push((pack.id(), code));
                }
                Err(OpenError::Failed(e)) => {
                    warn!("❌ Failed to open shadow trade for pack {}: {}", pack.id(), e);
                    report.failed.push((pack.id(), e.to_string()));
                }
            }
        }

        info!(
            "👻 Shadow open{}: {} opened, {} rejected, {} already open, {} failed",
            if self.config.dry_run { " (dry run)" } else { "" },
            report.opened.len(),
            report.rejected.len(),
            report.already_open,
            report.failed.len()
        );
        report
    }

    fn open_one(&self, pack: &DecisionPack, now: chrono::DateTime<chrono::Utc>) -> Result<Option<Uuid>, OpenError> {
        if self.store.shadow_trade_for_pack(pack.id()).map_err(ShadowError::from)?.is_some() {
            return Ok(None);
        }
        pack.is_valid_for_execution(&self.signer, now)
            .map_err(|r| OpenError::Rejected(r.code().to_string()))?;

        let trade = ShadowTrade::from_pack(pack, self.config.expected_holding_days)?;
        if !self.config.dry_run {
            retry_once("insert shadow trade", || self.store.insert_shadow_trade(&trade)).map_err(ShadowError::from)?;
            info!(
                "👻 Shadow trade {} opened: {} {} @ {:.4} (pack {})",
                trade.id, trade.asset, trade.direction, trade.entry_price, pack.id()
            );
        }
        Ok(Some(trade.id))
    }

    /// Evaluate every OPEN trade against bars up to now
    pub fn run_exit_pass(&self) -> Result<ExitReport, ShadowError> {
        let trades = self.store.open_shadow_trades()?;
        let mut report = ExitReport::default();

        for trade in &trades {
            match self.evaluate_one(trade) {
                Ok(ExitStep::Closed(reason)) => report.closed.push((trade.id, reason)),
                Ok(ExitStep::Holding) => report.holding += 1,
                Ok(ExitStep::DataGap) => {
                    warn!("⚠️ Data gap: no bars after entry for trade {} ({})", trade.id, trade.asset);
                    report.data_gaps.push(trade.id);
                }
                Ok(ExitStep::LostRace) => report.lost_races += 1,
                Err(ShadowError::NonAscendingBars { trade_id, index }) => {
                    warn!("⚠️ Trade {}: bars out of order at index {}, left OPEN", trade_id, index);
                    report.bad_bars.push(trade_id);
                }
                Err(e) => {
                    warn!("❌ Exit evaluation failed for trade {}: {}", trade.id, e);
                    report.failed.push((trade.id, e.to_string()));
                }
            }
        }

        info!(
            "👻 Exit pass{}: {} closed, {} holding, {} data gaps, {} bad bar series, {} failed",
            if self.config.dry_run { " (dry run)" } else { "" },
            report.closed.len(),
            report.holding,
            report.data_gaps.len(),
            report.bad_bars.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn evaluate_one(&self, trade: &ShadowTrade) -> Result<ExitStep, ShadowError> {
        // Everything up to now: the first bar on or after an expiry that lands on a
        // non-trading day can be several days past it
        let bars = self.prices.bars_between(&trade.asset, trade.entry_at, self.clock.now())?;

        match trade.evaluate(&bars)? {
            Evaluation::DataGap => Ok(ExitStep::DataGap),
            Evaluation::Holding { mfe_pct, mae_pct, .. } => {
                if !self.config.dry_run && (mfe_pct != trade.mfe_pct || mae_pct != trade.mae_pct) {
                    self.store.update_open_excursions(trade.id, mfe_pct, mae_pct)?;
                }
                Ok(ExitStep::Holding)
            }
            Evaluation::Exit {
                reason,
                price,
                at,
                mfe_pct,
                mae_pct,
            } => {
                let regime_at_exit = match self.regimes.current_regime(&trade.asset) {
                    Ok(regime) => regime,
                    Err(e) => {
                        debug!("Regime at exit unavailable for {}: {}", trade.asset, e);
                        None
                    }
                };
                let closed = trade.closed(reason, price, at, mfe_pct, mae_pct, regime_at_exit);

                if self.config.dry_run {
                    info!(
                        "🧪 [dry run] trade {} would close {} @ {:.4} ({:+.2}%)",
                        trade.id,
                        reason,
                        price,
                        closed.return_pct.unwrap_or(0.0)
                    );
                    return Ok(ExitStep::Closed(reason));
                }

                if !retry_once("close shadow trade", || self.store.close_shadow_trade(&closed))? {
                    debug!("Trade {} already closed by another writer", trade.id);
                    return Ok(ExitStep::LostRace);
                }
                info!(
                    "🏁 Trade {} closed {} @ {:.4}: P&L ${:.2} ({:+.2}%)",
                    trade.id,
                    reason,
                    price,
                    closed.pnl_usd.unwrap_or(0.0),
                    closed.return_pct.unwrap_or(0.0)
                );
                self.feed_bandit(&closed);
                Ok(ExitStep::Closed(reason))
            }
        }
    }

    /// Realised return% goes back into the sizing bandit of the entry regime
    fn feed_bandit(&self, closed: &ShadowTrade) {
        let (Some(action), Some(regime), Some(return_pct)) =
            (&closed.sizing_action, closed.regime_at_entry, closed.return_pct)
        else {
            return;
        };
        let key = BanditKey::new(closed.strategy.clone(), regime, DecisionDimension::Sizing);
        match self.bandits.update(&key, action, return_pct) {
            Ok(state) => {
                if let Err(e) = self.store.upsert_bandit_state(&state, self.clock.now()) {
                    warn!("⚠️ Failed to persist bandit state {} / {}: {}", key, action, e);
                }
            }
            Err(e) => warn!("⚠️ Bandit update skipped for trade {}: {}", closed.id, e),
        }
    }
}

enum OpenError {
    Rejected(String),
    Failed(ShadowError),
}

impl From<ShadowError> for OpenError {
    fn from(e: ShadowError) -> Self {
        OpenError::Failed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::decision_engine::bandit::RewardMode;
    use crate::decision_engine::decision_pack::tests::{economics, signer, t0};
    use crate::decision_engine::decision_pack::Direction;
    use crate::providers::{PriceBar, StorePriceSeries, StoreRegimeState};
    use crate::shadow::trade::TradeStatus;
    use chrono::Duration;

    struct Fixture {
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        bandits: Arc<BanditRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(SqliteStore::open_in_memory().unwrap()),
                clock: Arc::new(ManualClock::new(t0())),
                bandits: Arc::new(BanditRegistry::new(RewardMode::default(), Some(1))),
            }
        }

        fn engine(&self, dry_run: bool) -> ShadowExecutionEngine {
            self.engine_holding(10, dry_run)
        }

        fn engine_holding(&self, expected_holding_days: i64, dry_run: bool) -> ShadowExecutionEngine {
            ShadowExecutionEngine::new(
                self.store.clone(),
                Arc::new(StorePriceSeries::new(self.store.clone())),
                Arc::new(StoreRegimeState::new(self.store.clone(), "1d")),
                self.bandits.clone(),
                signer(),
                self.clock.clone(),
                ShadowEngineConfig {
                    expected_holding_days,
                    dry_run,
                },
            )
        }

        fn pack(&self) -> DecisionPack {
            let pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
            self.store.insert_pack(&pack).unwrap();
            pack
        }

        fn bars(&self, rows: &[(i64, f64, f64, f64)]) {
            for (day, high, low, close) in rows {
                let bar = PriceBar::new(t0() + Duration::days(*day), *close, *high, *low, *close);
                self.store.insert_price_bar("SPY", &bar).unwrap();
            }
        }
    }

    #[test]
    fn test_open_once_per_pack() {
        let fx = Fixture::new();
        fx.pack();
        let engine = fx.engine(false);

        let first = engine.open_pending().unwrap();
        assert_eq!(first.opened.len(), 1);
        let second = engine.open_pending().unwrap();
        assert!(second.opened.is_empty());
        assert_eq!(fx.store.open_shadow_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_pack_is_rejected_with_code() {
        let fx = Fixture::new();
        fx.pack();
        fx.clock.advance(Duration::hours(5));
        let report = fx.engine(false).open_pending().unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].1, "SNAPSHOT_EXPIRED");
    }

    #[test]
    fn test_take_profit_pass_and_idempotent_rerun() {
        let fx = Fixture::new();
        let pack = fx.pack();
        let engine = fx.engine(false);
        engine.open_pending().unwrap();

        fx.bars(&[(1, 103.0, 99.0, 102.0), (2, 104.0, 101.0, 103.0), (3, 111.0, 104.0, 108.0)]);
        fx.clock.advance(Duration::days(4));

        let report = engine.run_exit_pass().unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].1, ExitReason::TakeProfit);

        let trade = fx.store.shadow_trade_for_pack(pack.id()).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_price, Some(110.0));
        assert_eq!(trade.exit_at, Some(t0() + Duration::days(3)));

        let rerun = engine.run_exit_pass().unwrap();
        assert!(rerun.closed.is_empty());
        let again = fx.store.shadow_trade_for_pack(pack.id()).unwrap().unwrap();
        assert_eq!(again, trade);
    }

    #[test]
    fn test_close_feeds_sizing_bandit() {
        let fx = Fixture::new();
        fx.pack();
        let engine = fx.engine(false);
        engine.open_pending().unwrap();
        fx.bars(&[(1, 101.0, 94.0, 96.0)]);
        fx.clock.advance(Duration::days(2));
        engine.run_exit_pass().unwrap();

        let states = fx.store.load_bandit_states().unwrap();
        let standard = states.iter().find(|s| s.action == "standard").unwrap();
        assert_eq!(standard.pulls, 1);
        assert_eq!(standard.cumulative_reward, -5.0);
        assert!(standard.beta > standard.alpha);
    }

    #[test]
    fn test_data_gap_leaves_trade_open() {
        let fx = Fixture::new();
        fx.pack();
        let engine = fx.engine(false);
        engine.open_pending().unwrap();
        fx.clock.advance(Duration::days(3));

        let report = engine.run_exit_pass().unwrap();
        assert_eq!(report.data_gaps.len(), 1);
        assert_eq!(fx.store.open_shadow_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_no_look_ahead_past_now() {
        let fx = Fixture::new();
        fx.pack();
        let engine = fx.engine(false);
        engine.open_pending().unwrap();
        fx.bars(&[(1, 101.0, 99.0, 100.0), (2, 101.0, 90.0, 92.0)]);
        fx.clock.advance(Duration::days(1) + Duration::hours(1));

        let report = engine.run_exit_pass().unwrap();
        assert_eq!(report.holding, 1);
        assert!(report.closed.is_empty());
    }

    #[test]
    fn test_weekend_expiry_closes_on_next_trading_bar() {
        let fx = Fixture::new();
        let pack = fx.pack();
        // Entry Monday 2024-05-06, 12 days puts expiry on Saturday 2024-05-18
        let engine = fx.engine_holding(12, false);
        engine.open_pending().unwrap();

        let weekdays: Vec<(i64, f64, f64, f64)> = [1, 2, 3, 4, 7, 8, 9, 10, 11, 14, 15, 16, 17, 18]
            .iter()
            .map(|&d| {
                let close = 100.0 + 0.1 * d as f64;
                (d, close + 0.5, close - 0.5, close)
            })
            .collect();
        fx.bars(&weekdays);
        fx.clock.advance(Duration::days(20));

        let report = engine.run_exit_pass().unwrap();
        assert_eq!(report.closed.len(), 1, "{:?}", report);
        assert_eq!(report.closed[0].1, ExitReason::TimeExpiry);

        let trade = fx.store.shadow_trade_for_pack(pack.id()).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_at, Some(t0() + Duration::days(14)));
        assert!((trade.exit_price.unwrap() - 101.4).abs() < 1e-9);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let fx = Fixture::new();
        fx.pack();
        fx.engine(false).open_pending().unwrap();
        fx.bars(&[(1, 101.0, 94.0, 96.0)]);
        fx.clock.advance(Duration::days(2));

        let report = fx.engine(true).run_exit_pass().unwrap();
        assert_eq!(report.closed.len(), 1);
        assert_eq!(fx.store.open_shadow_trades().unwrap().len(), 1);
        assert!(fx.store.load_bandit_states().unwrap().is_empty());
    }
}
