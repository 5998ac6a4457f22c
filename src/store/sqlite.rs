//! SQLite-backed store
//!
//! Write semantics per table:
//! - regime_transitions, feature_vectors, price_bars: append / insert-once
//! - regime_persistence, bandit_states: upsert per key
//! - decision_packs: insert once (UNIQUE(source_ref, asset)); only execution columns update
//! - shadow_trades: insert once per pack, then a single close guarded by status = 'OPEN'
//!
//! A regime update (persistence upsert plus optional transition) commits in one transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, Params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{StoreError, StoreErrorKind};
use crate::decision_engine::bandit::{BanditKey, BanditState};
use crate::decision_engine::calibration::{CalibrationBand, CalibrationSource};
use crate::decision_engine::decision_pack::{DecisionPack, ExecutionOutcome, PackSeal};
use crate::decision_engine::pack_generator::SignalCandidate;
use crate::providers::PriceBar;
use crate::regime::{FeatureVector, PersistenceRecord, RegimeKey, RegimeTransition, FEATURE_COUNT};
use crate::shadow::trade::ShadowTrade;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS feature_vectors (
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        observed_at INTEGER NOT NULL,
        values_json TEXT NOT NULL,
        PRIMARY KEY(symbol, interval, observed_at)
    );

    CREATE TABLE IF NOT EXISTS regime_transitions (
        id TEXT PRIMARY KEY,
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        previous_regime TEXT NOT NULL,
        new_regime TEXT NOT NULL,
        at TEXT NOT NULL,
        at_ts INTEGER NOT NULL,
        prior_duration_days INTEGER NOT NULL,
        confidence REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS regime_persistence (
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        regime TEXT NOT NULL,
        regime_start TEXT NOT NULL,
        persistence_days INTEGER NOT NULL,
        stability REAL NOT NULL,
        transition_count_90d INTEGER NOT NULL,
        last_confidence REAL NOT NULL,
        updated_at TEXT NOT NULL,
        signature TEXT NOT NULL,
        PRIMARY KEY(symbol, interval)
    );

    CREATE TABLE IF NOT EXISTS bandit_states (
        strategy TEXT NOT NULL,
        regime TEXT NOT NULL,
        dimension TEXT NOT NULL,
        action TEXT NOT NULL,
        alpha REAL NOT NULL CHECK(alpha >= 1.0),
        beta REAL NOT NULL CHECK(beta >= 1.0),
        pulls INTEGER NOT NULL,
        cumulative_reward REAL NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(strategy, regime, dimension, action)
    );

    CREATE TABLE IF NOT EXISTS decision_packs (
        id TEXT PRIMARY KEY,
        source_ref TEXT NOT NULL,
        asset TEXT NOT NULL,
        direction TEXT NOT NULL,
        economics_json TEXT NOT NULL,
        evidence_hash TEXT,
        signature TEXT,
        signer_id TEXT,
        signed_at TEXT,
        execution_status TEXT NOT NULL DEFAULT 'PENDING',
        fill_price REAL,
        filled_at TEXT,
        external_order_id TEXT,
        created_at_ts INTEGER NOT NULL,
        UNIQUE(source_ref, asset)
    );

    CREATE TABLE IF NOT EXISTS shadow_trades (
        id TEXT PRIMARY KEY,
        pack_id TEXT UNIQUE,
        strategy TEXT NOT NULL,
        asset TEXT NOT NULL,
        direction TEXT NOT NULL,
        size_usd REAL NOT NULL,
        quantity REAL NOT NULL,
        entry_price REAL NOT NULL,
        entry_at TEXT NOT NULL,
        expected_holding_days INTEGER NOT NULL,
        stop_pct REAL NOT NULL,
        target_pct REAL NOT NULL,
        sizing_action TEXT,
        regime_at_entry TEXT,
        status TEXT NOT NULL CHECK(status IN ('OPEN', 'CLOSED')),
        mfe_pct REAL NOT NULL DEFAULT 0.0,
        mae_pct REAL NOT NULL DEFAULT 0.0,
        exit_price REAL,
        exit_at TEXT,
        exit_reason TEXT,
        regime_at_exit TEXT,
        pnl_usd REAL,
        return_pct REAL
    );

    CREATE TABLE IF NOT EXISTS price_bars (
        asset TEXT NOT NULL,
        ts INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL DEFAULT 0.0,
        PRIMARY KEY(asset, ts)
    );

    CREATE TABLE IF NOT EXISTS calibration_bands (
        forecast_type TEXT NOT NULL,
        regime TEXT,
        lower REAL NOT NULL,
        upper REAL NOT NULL,
        accuracy REAL NOT NULL,
        samples INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS signal_candidates (
        id TEXT PRIMARY KEY,
        source_ref TEXT NOT NULL,
        strategy TEXT NOT NULL,
        asset TEXT NOT NULL,
        asset_class TEXT NOT NULL,
        direction TEXT NOT NULL,
        forecast_type TEXT NOT NULL,
        raw_confidence REAL NOT NULL,
        edge REAL NOT NULL,
        agreement REAL NOT NULL,
        regime TEXT NOT NULL,
        created_at TEXT NOT NULL,
        created_at_ts INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transitions_key_ts ON regime_transitions(symbol, interval, at_ts);
    CREATE INDEX IF NOT EXISTS idx_shadow_status ON shadow_trades(status);
    CREATE INDEX IF NOT EXISTS idx_candidates_ts ON signal_candidates(created_at_ts);
"#;

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn sql(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::from_sqlite(operation, e)
}

/// Typed column reads; decode failures become `Corrupt` errors tagged with the operation
struct Cols<'a, 'stmt> {
    row: &'a rusqlite::Row<'stmt>,
    op: &'static str,
}

impl Cols<'_, '_> {
    fn get<T: FromSql>(&self, idx: usize) -> Result<T, StoreError> {
        self.row.get(idx).map_err(sql(self.op))
    }

    fn corrupt(&self, message: String) -> StoreError {
        StoreError::corrupt(self.op, message)
    }

    fn parse_ts(&self, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| self.corrupt(format!("bad timestamp '{}': {}", raw, e)))
    }

    fn ts(&self, idx: usize) -> Result<DateTime<Utc>, StoreError> {
        self.parse_ts(&self.get::<String>(idx)?)
    }

    fn opt_ts(&self, idx: usize) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get::<Option<String>>(idx)?.map(|raw| self.parse_ts(&raw)).transpose()
    }

    fn unix(&self, idx: usize) -> Result<DateTime<Utc>, StoreError> {
        let secs: i64 = self.get(idx)?;
        DateTime::from_timestamp(secs, 0).ok_or_else(|| self.corrupt(format!("bad unix timestamp {}", secs)))
    }

    fn parse<T: FromStr<Err = String>>(&self, idx: usize) -> Result<T, StoreError> {
        self.get::<String>(idx)?.parse::<T>().map_err(|e| self.corrupt(e))
    }

    fn opt_parse<T: FromStr<Err = String>>(&self, idx: usize) -> Result<Option<T>, StoreError> {
        self.get::<Option<String>>(idx)?
            .map(|raw| raw.parse::<T>().map_err(|e| self.corrupt(e)))
            .transpose()
    }

    fn uuid(&self, idx: usize) -> Result<Uuid, StoreError> {
        let raw: String = self.get(idx)?;
        Uuid::parse_str(&raw).map_err(|e| self.corrupt(format!("bad uuid '{}': {}", raw, e)))
    }

    fn json<T: serde::de::DeserializeOwned>(&self, idx: usize) -> Result<T, StoreError> {
        serde_json::from_str(&self.get::<String>(idx)?).map_err(|e| self.corrupt(e.to_string()))
    }

    fn count<T: TryFrom<i64>>(&self, idx: usize) -> Result<T, StoreError> {
        let raw: i64 = self.get(idx)?;
        T::try_from(raw).map_err(|_| self.corrupt(format!("count {} out of range", raw)))
    }
}

const PERSISTENCE_COLUMNS: &str = "symbol, interval, regime, regime_start, persistence_days, stability, \
                                   transition_count_90d, last_confidence, updated_at, signature";

fn decode_persistence(c: &Cols<'_, '_>) -> Result<PersistenceRecord, StoreError> {
    Ok(PersistenceRecord {
        key: RegimeKey::new(c.get::<String>(0)?, c.get::<String>(1)?),
        regime: c.parse(2)?,
        regime_start: c.ts(3)?,
        persistence_days: c.get(4)?,
        stability: c.get(5)?,
        transition_count_90d: c.count(6)?,
        last_confidence: c.get(7)?,
        updated_at: c.ts(8)?,
        signature: c.get(9)?,
    })
}

const TRANSITION_COLUMNS: &str = "id, symbol, interval, previous_regime, new_regime, at, prior_duration_days, confidence";

fn decode_transition(c: &Cols<'_, '_>) -> Result<RegimeTransition, StoreError> {
    Ok(RegimeTransition {
        id: c.uuid(0)?,
        key: RegimeKey::new(c.get::<String>(1)?, c.get::<String>(2)?),
        previous: c.parse(3)?,
        new: c.parse(4)?,
        at: c.ts(5)?,
        prior_duration_days: c.get(6)?,
        confidence: c.get(7)?,
    })
}

const PACK_COLUMNS: &str = "id, economics_json, evidence_hash, signature, signer_id, signed_at, \
                            execution_status, fill_price, filled_at, external_order_id";

fn decode_pack(c: &Cols<'_, '_>) -> Result<DecisionPack, StoreError> {
    let seal = PackSeal {
        evidence_hash: c.get(2)?,
        signature: c.get(3)?,
        signer_id: c.get(4)?,
        signed_at: c.opt_ts(5)?,
    };
    let execution = ExecutionOutcome {
        status: c.parse(6)?,
        fill_price: c.get(7)?,
        filled_at: c.opt_ts(8)?,
        external_order_id: c.get(9)?,
    };
    Ok(DecisionPack::from_parts(c.uuid(0)?, c.json(1)?, seal, execution))
}

const SHADOW_COLUMNS: &str = "id, pack_id, strategy, asset, direction, size_usd, quantity, entry_price, entry_at, \
                              expected_holding_days, stop_pct, target_pct, sizing_action, regime_at_entry, status, \
                              mfe_pct, mae_pct, exit_price, exit_at, exit_reason, regime_at_exit, pnl_usd, return_pct";

fn decode_trade(c: &Cols<'_, '_>) -> Result<ShadowTrade, StoreError> {
    let pack_id: Option<String> = c.get(1)?;
    Ok(ShadowTrade {
        id: c.uuid(0)?,
        pack_id: pack_id
            .map(|raw| Uuid::parse_str(&raw).map_err(|e| c.corrupt(format!("bad pack id '{}': {}", raw, e))))
            .transpose()?,
        strategy: c.get(2)?,
        asset: c.get(3)?,
        direction: c.parse(4)?,
        size_usd: c.get(5)?,
        quantity: c.get(6)?,
        entry_price: c.get(7)?,
        entry_at: c.ts(8)?,
        expected_holding_days: c.get(9)?,
        stop_pct: c.get(10)?,
        target_pct: c.get(11)?,
        sizing_action: c.get(12)?,
        regime_at_entry: c.opt_parse(13)?,
        status: c.parse(14)?,
        mfe_pct: c.get(15)?,
        mae_pct: c.get(16)?,
        exit_price: c.get(17)?,
        exit_at: c.opt_ts(18)?,
        exit_reason: c.opt_parse(19)?,
        regime_at_exit: c.opt_parse(20)?,
        pnl_usd: c.get(21)?,
        return_pct: c.get(22)?,
    })
}

const BAR_COLUMNS: &str = "ts, open, high, low, close, volume";

fn decode_bar(c: &Cols<'_, '_>) -> Result<PriceBar, StoreError> {
    Ok(PriceBar {
        ts: c.unix(0)?,
        open: c.get(1)?,
        high: c.get(2)?,
        low: c.get(3)?,
        close: c.get(4)?,
        volume: c.get(5)?,
    })
}

fn write_persistence(conn: &Connection, record: &PersistenceRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO regime_persistence ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(symbol, interval) DO UPDATE SET
                regime = excluded.regime,
                regime_start = excluded.regime_start,
                persistence_days = excluded.persistence_days,
                stability = excluded.stability,
                transition_count_90d = excluded.transition_count_90d,
                last_confidence = excluded.last_confidence,
                updated_at = excluded.updated_at,
                signature = excluded.signature",
            PERSISTENCE_COLUMNS
        ),
        params![
            record.key.symbol,
            record.key.interval,
            record.regime.as_str(),
            ts(&record.regime_start),
            record.persistence_days,
            record.stability,
            record.transition_count_90d,
            record.last_confidence,
            ts(&record.updated_at),
            record.signature,
        ],
    )
    .map_err(sql("upsert persistence"))?;
    Ok(())
}

fn write_transition(conn: &Connection, transition: &RegimeTransition) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO regime_transitions ({}, at_ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            TRANSITION_COLUMNS
        ),
        params![
            transition.id.to_string(),
            transition.key.symbol,
            transition.key.interval,
            transition.previous.as_str(),
            transition.new.as_str(),
            ts(&transition.at),
            transition.prior_duration_days,
            transition.confidence,
            transition.at.timestamp(),
        ],
    )
    .map_err(sql("append transition"))?;
    Ok(())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, wal_mode: bool) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::new(StoreErrorKind::Unavailable, "create database directory", e.to_string())
                })?;
            }
        }

        let conn = Connection::open(path).map_err(sql("open database"))?;
        if wal_mode {
            conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql("enable WAL"))?;
        }
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql("open in-memory database"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(sql("initialize schema"))?;
        info!("📊 Database schema initialized");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::new(StoreErrorKind::Unavailable, "lock connection", "connection mutex poisoned"))
    }

    fn query<T, P, F>(&self, op: &'static str, sql_text: &str, args: P, decode: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: Fn(&Cols<'_, '_>) -> Result<T, StoreError>,
    {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql_text).map_err(sql(op))?;
        let mut rows = stmt.query(args).map_err(sql(op))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql(op))? {
            out.push(decode(&Cols { row, op })?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql_text: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql_text).map_err(sql("execute batch"))
    }

    // ---------------------------------------------------------------- features

    pub fn insert_feature_vector(
        &self,
        key: &RegimeKey,
        at: DateTime<Utc>,
        features: &FeatureVector,
    ) -> Result<(), StoreError> {
        let values = serde_json::to_string(features.values())
            .map_err(|e| StoreError::corrupt("encode feature vector", e.to_string()))?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO feature_vectors (symbol, interval, observed_at, values_json) VALUES (?1, ?2, ?3, ?4)",
                params![key.symbol, key.interval, at.timestamp(), values],
            )
            .map_err(sql("insert feature vector"))?;
        Ok(())
    }

    pub fn latest_feature_vector(&self, key: &RegimeKey) -> Result<Option<(DateTime<Utc>, FeatureVector)>, StoreError> {
        Ok(self
            .query(
                "latest feature vector",
                "SELECT observed_at, values_json FROM feature_vectors
                 WHERE symbol = ?1 AND interval = ?2 ORDER BY observed_at DESC LIMIT 1",
                params![key.symbol, key.interval],
                |c| {
                    let values: [Option<f64>; FEATURE_COUNT] = c.json(1)?;
                    Ok((c.unix(0)?, FeatureVector::new(values)))
                },
            )?
            .into_iter()
            .next())
    }

    /// Every (symbol, interval) with at least one feature vector
    pub fn tracked_keys(&self) -> Result<Vec<RegimeKey>, StoreError> {
        self.query(
            "tracked keys",
            "SELECT DISTINCT symbol, interval FROM feature_vectors ORDER BY symbol, interval",
            [],
            |c| Ok(RegimeKey::new(c.get::<String>(0)?, c.get::<String>(1)?)),
        )
    }

    // ------------------------------------------------- persistence + transitions

    /// Upsert the persistence record and append the transition, if any, atomically
    pub fn commit_regime_update(
        &self,
        record: &PersistenceRecord,
        transition: Option<&RegimeTransition>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql("begin regime update"))?;
        if let Some(t) = transition {
            write_transition(&tx, t)?;
        }
        write_persistence(&tx, record)?;
        tx.commit().map_err(sql("commit regime update"))?;
        debug!("💾 Persistence {} saved", record.key);
        Ok(())
    }

    pub fn persistence_record(&self, key: &RegimeKey) -> Result<Option<PersistenceRecord>, StoreError> {
        Ok(self
            .query(
                "load persistence",
                &format!(
                    "SELECT {} FROM regime_persistence WHERE symbol = ?1 AND interval = ?2",
                    PERSISTENCE_COLUMNS
                ),
                params![key.symbol, key.interval],
                decode_persistence,
            )?
            .into_iter()
            .next())
    }

    pub fn load_persistence_records(&self) -> Result<Vec<PersistenceRecord>, StoreError> {
        self.query(
            "load persistence",
            &format!("SELECT {} FROM regime_persistence ORDER BY symbol, interval", PERSISTENCE_COLUMNS),
            [],
            decode_persistence,
        )
    }

    pub fn load_transitions(&self) -> Result<Vec<RegimeTransition>, StoreError> {
        self.query(
            "load transitions",
            &format!("SELECT {} FROM regime_transitions ORDER BY at_ts ASC", TRANSITION_COLUMNS),
            [],
            decode_transition,
        )
    }

    pub fn transitions_for(&self, key: &RegimeKey) -> Result<Vec<RegimeTransition>, StoreError> {
        self.query(
            "load transitions",
            &format!(
                "SELECT {} FROM regime_transitions WHERE symbol = ?1 AND interval = ?2 ORDER BY at_ts ASC",
                TRANSITION_COLUMNS
            ),
            params![key.symbol, key.interval],
            decode_transition,
        )
    }

    // ----------------------------------------------------------------- bandits

    pub fn upsert_bandit_state(&self, state: &BanditState, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO bandit_states (
                    strategy, regime, dimension, action, alpha, beta, pulls, cumulative_reward, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(strategy, regime, dimension, action) DO UPDATE SET
                    alpha = excluded.alpha,
                    beta = excluded.beta,
                    pulls = excluded.pulls,
                    cumulative_reward = excluded.cumulative_reward,
                    updated_at = excluded.updated_at
                "#,
                params![
                    state.key.strategy,
                    state.key.regime.as_str(),
                    state.key.dimension.as_str(),
                    state.action,
                    state.alpha,
                    state.beta,
                    state.pulls as i64,
                    state.cumulative_reward,
                    ts(&at),
                ],
            )
            .map_err(sql("upsert bandit state"))?;
        Ok(())
    }

    pub fn load_bandit_states(&self) -> Result<Vec<BanditState>, StoreError> {
        self.query(
            "load bandit states",
            "SELECT strategy, regime, dimension, action, alpha, beta, pulls, cumulative_reward
             FROM bandit_states ORDER BY strategy, regime, dimension, action",
            [],
            |c| {
                Ok(BanditState {
                    key: BanditKey::new(c.get::<String>(0)?, c.parse(1)?, c.parse(2)?),
                    action: c.get(3)?,
                    alpha: c.get(4)?,
                    beta: c.get(5)?,
                    pulls: c.count(6)?,
                    cumulative_reward: c.get(7)?,
                })
            },
        )
    }

    // ------------------------------------------------------------------- packs

    /// Insert once; a second pack for the same (source_ref, asset) is a Duplicate error
    pub fn insert_pack(&self, pack: &DecisionPack) -> Result<(), StoreError> {
        let econ = pack.economics();
        let seal = pack.seal_info();
        let exec = pack.execution();
        let economics_json =
            serde_json::to_string(econ).map_err(|e| StoreError::corrupt("encode pack", e.to_string()))?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO decision_packs (
                    id, source_ref, asset, direction, economics_json, evidence_hash, signature,
                    signer_id, signed_at, execution_status, fill_price, filled_at, external_order_id,
                    created_at_ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    pack.id().to_string(),
                    econ.source_ref,
                    econ.asset,
                    econ.direction.as_str(),
                    economics_json,
                    seal.evidence_hash,
                    seal.signature,
                    seal.signer_id,
                    seal.signed_at.as_ref().map(ts),
                    exec.status.as_str(),
                    exec.fill_price,
                    exec.filled_at.as_ref().map(ts),
                    exec.external_order_id,
                    econ.created_at.timestamp(),
                ],
            )
            .map_err(sql("insert pack"))?;
        debug!("💾 Pack {} stored ({} / {})", pack.id(), econ.source_ref, econ.asset);
        Ok(())
    }

    fn query_packs<P: Params>(&self, where_clause: &str, args: P) -> Result<Vec<DecisionPack>, StoreError> {
        self.query(
            "load packs",
            &format!("SELECT {} FROM decision_packs {}", PACK_COLUMNS, where_clause),
            args,
            decode_pack,
        )
    }

    /// Lookup-before-insert key
    pub fn find_pack(&self, source_ref: &str, asset: &str) -> Result<Option<DecisionPack>, StoreError> {
        Ok(self
            .query_packs("WHERE source_ref = ?1 AND asset = ?2", params![source_ref, asset])?
            .into_iter()
            .next())
    }

    /// Packs that have not been opened as shadow trades yet
    pub fn packs_without_shadow_trade(&self) -> Result<Vec<DecisionPack>, StoreError> {
        self.query_packs(
            "WHERE id NOT IN (SELECT pack_id FROM shadow_trades WHERE pack_id IS NOT NULL) ORDER BY created_at_ts ASC",
            [],
        )
    }

    /// Whitelisted post-signing update
    pub fn update_pack_execution(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<(), StoreError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE decision_packs SET execution_status = ?1, fill_price = ?2, filled_at = ?3, external_order_id = ?4
                 WHERE id = ?5",
                params![
                    outcome.status.as_str(),
                    outcome.fill_price,
                    outcome.filled_at.as_ref().map(ts),
                    outcome.external_order_id,
                    id.to_string(),
                ],
            )
            .map_err(sql("update pack execution"))?;
        if changed == 0 {
            return Err(StoreError::new(
                StoreErrorKind::NotFound,
                "update pack execution",
                format!("pack {} not found", id),
            ));
        }
        Ok(())
    }

    // ----------------------------------------------------------- shadow trades

    pub fn insert_shadow_trade(&self, trade: &ShadowTrade) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO shadow_trades ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                     ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                    SHADOW_COLUMNS
                ),
                params![
                    trade.id.to_string(),
                    trade.pack_id.map(|p| p.to_string()),
                    trade.strategy,
                    trade.asset,
                    trade.direction.as_str(),
                    trade.size_usd,
                    trade.quantity,
                    trade.entry_price,
                    ts(&trade.entry_at),
                    trade.expected_holding_days,
                    trade.stop_pct,
                    trade.target_pct,
                    trade.sizing_action,
                    trade.regime_at_entry.map(|r| r.as_str()),
                    trade.status.as_str(),
                    trade.mfe_pct,
                    trade.mae_pct,
                    trade.exit_price,
                    trade.exit_at.as_ref().map(ts),
                    trade.exit_reason.map(|r| r.as_str()),
                    trade.regime_at_exit.map(|r| r.as_str()),
                    trade.pnl_usd,
                    trade.return_pct,
                ],
            )
            .map_err(sql("insert shadow trade"))?;
        Ok(())
    }

    fn query_trades<P: Params>(&self, where_clause: &str, args: P) -> Result<Vec<ShadowTrade>, StoreError> {
        self.query(
            "load shadow trades",
            &format!("SELECT {} FROM shadow_trades {}", SHADOW_COLUMNS, where_clause),
            args,
            decode_trade,
        )
    }

    pub fn shadow_trade_for_pack(&self, pack_id: Uuid) -> Result<Option<ShadowTrade>, StoreError> {
        let id = pack_id.to_string();
        Ok(self.query_trades("WHERE pack_id = ?1", params![id])?.into_iter().next())
    }

    pub fn open_shadow_trades(&self) -> Result<Vec<ShadowTrade>, StoreError> {
        self.query_trades("WHERE status = 'OPEN' ORDER BY entry_at ASC", [])
    }

    /// Persist running excursions; no-op once the trade is closed
    pub fn update_open_excursions(&self, id: Uuid, mfe_pct: f64, mae_pct: f64) -> Result<bool, StoreError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE shadow_trades SET mfe_pct = ?1, mae_pct = ?2 WHERE id = ?3 AND status = 'OPEN'",
                params![mfe_pct, mae_pct, id.to_string()],
            )
            .map_err(sql("update excursions"))?;
        Ok(changed == 1)
    }

    /// Single conditional close. Returns false when the trade was no longer OPEN.
    pub fn close_shadow_trade(&self, trade: &ShadowTrade) -> Result<bool, StoreError> {
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE shadow_trades SET
                    status = 'CLOSED',
                    mfe_pct = ?1,
                    mae_pct = ?2,
                    exit_price = ?3,
                    exit_at = ?4,
                    exit_reason = ?5,
                    regime_at_exit = ?6,
                    pnl_usd = ?7,
                    return_pct = ?8
                WHERE id = ?9 AND status = 'OPEN'
                "#,
                params![
                    trade.mfe_pct,
                    trade.mae_pct,
                    trade.exit_price,
                    trade.exit_at.as_ref().map(ts),
                    trade.exit_reason.map(|r| r.as_str()),
                    trade.regime_at_exit.map(|r| r.as_str()),
                    trade.pnl_usd,
                    trade.return_pct,
                    trade.id.to_string(),
                ],
            )
            .map_err(sql("close shadow trade"))?;
        Ok(changed == 1)
    }

    // ------------------------------------------------------------------ prices

    /// Insert a bar; an existing bar at the same timestamp wins (dedup)
    pub fn insert_price_bar(&self, asset: &str, bar: &PriceBar) -> Result<bool, StoreError> {
        let changed = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO price_bars (asset, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![asset, bar.ts.timestamp(), bar.open, bar.high, bar.low, bar.close, bar.volume],
            )
            .map_err(sql("insert price bar"))?;
        Ok(changed == 1)
    }

    pub fn price_bars_between(
        &self,
        asset: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PriceBar>, StoreError> {
        self.query(
            "load price bars",
            &format!(
                "SELECT {} FROM price_bars WHERE asset = ?1 AND ts > ?2 AND ts <= ?3 ORDER BY ts ASC",
                BAR_COLUMNS
            ),
            params![asset, after.timestamp(), until.timestamp()],
            decode_bar,
        )
    }

    pub fn latest_price_bar(&self, asset: &str, at: DateTime<Utc>) -> Result<Option<PriceBar>, StoreError> {
        Ok(self
            .query(
                "load price bars",
                &format!(
                    "SELECT {} FROM price_bars WHERE asset = ?1 AND ts <= ?2 ORDER BY ts DESC LIMIT 1",
                    BAR_COLUMNS
                ),
                params![asset, at.timestamp()],
                decode_bar,
            )?
            .into_iter()
            .next())
    }

    // ------------------------------------------------------- signal candidates

    pub fn insert_signal_candidate(&self, candidate: &SignalCandidate) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO signal_candidates (
                    id, source_ref, strategy, asset, asset_class, direction, forecast_type,
                    raw_confidence, edge, agreement, regime, created_at, created_at_ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    candidate.id.to_string(),
                    candidate.source_ref,
                    candidate.strategy,
                    candidate.asset,
                    candidate.asset_class,
                    candidate.direction.as_str(),
                    candidate.forecast_type,
                    candidate.raw_confidence,
                    candidate.edge,
                    candidate.agreement,
                    candidate.regime.as_str(),
                    ts(&candidate.created_at),
                    candidate.created_at.timestamp(),
                ],
            )
            .map_err(sql("insert signal candidate"))?;
        Ok(())
    }

    pub fn signal_candidates_since(&self, since: DateTime<Utc>) -> Result<Vec<SignalCandidate>, StoreError> {
        self.query(
            "load signal candidates",
            "SELECT id, source_ref, strategy, asset, asset_class, direction, forecast_type,
                    raw_confidence, edge, agreement, regime, created_at
             FROM signal_candidates WHERE created_at_ts >= ?1 ORDER BY created_at_ts ASC",
            params![since.timestamp()],
            |c| {
                Ok(SignalCandidate {
                    id: c.uuid(0)?,
                    source_ref: c.get(1)?,
                    strategy: c.get(2)?,
                    asset: c.get(3)?,
                    asset_class: c.get(4)?,
                    direction: c.parse(5)?,
                    forecast_type: c.get(6)?,
                    raw_confidence: c.get(7)?,
                    edge: c.get(8)?,
                    agreement: c.get(9)?,
                    regime: c.parse(10)?,
                    created_at: c.ts(11)?,
                })
            },
        )
    }
}

impl CalibrationSource for SqliteStore {
    fn load_bands(&self) -> Result<Vec<CalibrationBand>, StoreError> {
        self.query(
            "load calibration bands",
            "SELECT forecast_type, regime, lower, upper, accuracy, samples FROM calibration_bands
             ORDER BY forecast_type, lower",
            [],
            |c| {
                Ok(CalibrationBand {
                    forecast_type: c.get(0)?,
                    regime: c.opt_parse(1)?,
                    lower: c.get(2)?,
                    upper: c.get(3)?,
                    accuracy: c.get(4)?,
                    samples: c.get(5)?,
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_engine::bandit::DecisionDimension;
    use crate::decision_engine::decision_pack::tests::{economics, signer, t0};
    use crate::decision_engine::decision_pack::{Direction, ExecutionStatus};
    use crate::regime::RegimeLabel;
    use crate::shadow::trade::tests::trade;
    use crate::shadow::trade::ExitReason;
    use chrono::{Duration, TimeZone};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_pack_round_trip_keeps_seal_valid() {
        let store = store();
        let pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        store.insert_pack(&pack).unwrap();

        let loaded = store.find_pack("hyp-42", "SPY").unwrap().unwrap();
        assert_eq!(loaded, pack);
        assert!(loaded.is_valid_for_execution(&signer(), t0()).is_ok());
    }

    #[test]
    fn test_duplicate_pack_is_tagged() {
        let store = store();
        let first = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        let second = DecisionPack::seal(economics(Direction::Long, 101.0), &signer(), t0()).unwrap();
        store.insert_pack(&first).unwrap();
        let err = store.insert_pack(&second).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Duplicate);
    }

    #[test]
    fn test_check_constraint_is_rejected_not_duplicate() {
        let store = store();
        let key = BanditKey::new("momentum", RegimeLabel::Bull, DecisionDimension::Sizing);
        let mut state = BanditState::fresh(key, "half");
        state.alpha = 0.5;

        let err = store.upsert_bandit_state(&state, t0()).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Rejected);
        assert!(!err.is_retryable());
        assert!(store.load_bandit_states().unwrap().is_empty());
    }

    #[test]
    fn test_execution_update_is_whitelisted() {
        let store = store();
        let pack = DecisionPack::seal(economics(Direction::Long, 100.0), &signer(), t0()).unwrap();
        store.insert_pack(&pack).unwrap();

        let outcome = ExecutionOutcome {
            status: ExecutionStatus::Filled,
            fill_price: Some(100.1),
            filled_at: Some(t0() + Duration::minutes(2)),
            external_order_id: Some("broker-7".into()),
        };
        store.update_pack_execution(pack.id(), &outcome).unwrap();

        let loaded = store.find_pack("hyp-42", "SPY").unwrap().unwrap();
        assert_eq!(loaded.execution(), &outcome);
        assert_eq!(loaded.economics(), pack.economics());
        assert!(loaded.evidence_matches());

        let missing = store.update_pack_execution(Uuid::new_v4(), &outcome).unwrap_err();
        assert_eq!(missing.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn test_shadow_close_happens_once() {
        let store = store();
        let mut open = trade(Direction::Long);
        let pack_id = Uuid::new_v4();
        open.pack_id = Some(pack_id);
        store.insert_shadow_trade(&open).unwrap();
        assert_eq!(store.open_shadow_trades().unwrap().len(), 1);

        let closed = open.closed(ExitReason::TakeProfit, 110.0, t0(), 10.0, 1.0, Some(RegimeLabel::Bull));
        assert!(store.close_shadow_trade(&closed).unwrap());
        assert!(!store.close_shadow_trade(&closed).unwrap());
        assert!(!store.update_open_excursions(open.id, 50.0, 50.0).unwrap());

        let loaded = store.shadow_trade_for_pack(pack_id).unwrap().unwrap();
        assert_eq!(loaded, closed);
        assert!(store.open_shadow_trades().unwrap().is_empty());
    }

    #[test]
    fn test_price_bars_dedup_and_window() {
        let store = store();
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        for d in 0..5 {
            let bar = PriceBar::new(t + Duration::days(d), 1.0, 2.0, 0.5, 1.5);
            assert!(store.insert_price_bar("SPY", &bar).unwrap());
        }
        assert!(!store.insert_price_bar("SPY", &PriceBar::new(t, 9.0, 9.0, 9.0, 9.0)).unwrap());

        let bars = store.price_bars_between("SPY", t, t + Duration::days(3)).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].ts, t + Duration::days(1));
        assert_eq!(store.latest_price_bar("SPY", t + Duration::hours(30)).unwrap().unwrap().ts, t + Duration::days(1));
    }

    #[test]
    fn test_regime_updates_round_trip() {
        use crate::regime::RegimePersistenceTracker;
        use crate::signing::RecordSigner;

        let store = store();
        let signer = RecordSigner::new("tracker", b"k").unwrap();
        let tracker = RegimePersistenceTracker::new(signer.clone());
        let key = RegimeKey::new("QQQ", "1d");
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for (d, label) in [(0, RegimeLabel::Bull), (6, RegimeLabel::Bull), (9, RegimeLabel::Bear)] {
            let update = tracker.update_regime(&key, label, 0.9, t + Duration::days(d)).unwrap();
            store.commit_regime_update(&update.record, update.transition.as_ref()).unwrap();
        }

        let record = store.persistence_record(&key).unwrap().unwrap();
        assert_eq!(record, tracker.record(&key).unwrap());
        assert!(record.verify(&signer));
        assert_eq!(store.transitions_for(&key).unwrap(), tracker.transitions(&key));
        assert_eq!(store.load_persistence_records().unwrap(), vec![record]);
    }

    #[test]
    fn test_failed_regime_update_rolls_back_transition() {
        use crate::regime::RegimePersistenceTracker;
        use crate::signing::RecordSigner;

        let store = store();
        let tracker = RegimePersistenceTracker::new(RecordSigner::new("tracker", b"k").unwrap());
        let key = RegimeKey::new("QQQ", "1d");
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = tracker.update_regime(&key, RegimeLabel::Bull, 0.9, t).unwrap();
        store.commit_regime_update(&first.record, None).unwrap();

        store
            .execute_batch(
                "CREATE TEMP TRIGGER reject_persistence BEFORE UPDATE ON regime_persistence
                 BEGIN SELECT RAISE(ABORT, 'persistence rejected'); END;",
            )
            .unwrap();
        let change = tracker.update_regime(&key, RegimeLabel::Bear, 0.9, t + Duration::days(4)).unwrap();
        assert!(change.transition.is_some());
        assert!(store.commit_regime_update(&change.record, change.transition.as_ref()).is_err());

        // Transition row written before the failing upsert is rolled back with it
        assert!(store.transitions_for(&key).unwrap().is_empty());
        assert_eq!(store.persistence_record(&key).unwrap().unwrap(), first.record);
    }

    #[test]
    fn test_bandit_states_round_trip() {
        let store = store();
        let key = BanditKey::new("momentum", RegimeLabel::Bear, DecisionDimension::Timing);
        let mut state = BanditState::fresh(key, "scale_in");
        state.alpha = 3.5;
        state.pulls = 4;
        store.upsert_bandit_state(&state, t0()).unwrap();
        state.beta = 2.25;
        store.upsert_bandit_state(&state, t0()).unwrap();

        assert_eq!(store.load_bandit_states().unwrap(), vec![state]);
    }

    #[test]
    fn test_feature_vector_latest() {
        let store = store();
        let key = RegimeKey::new("SPY", "1d");
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let fv = FeatureVector::new([Some(1.0), None, Some(0.5), Some(-0.2), Some(0.1), Some(0.0), Some(9.0)]);
        store.insert_feature_vector(&key, t, &FeatureVector::default()).unwrap();
        store.insert_feature_vector(&key, t + Duration::days(1), &fv).unwrap();

        let (at, latest) = store.latest_feature_vector(&key).unwrap().unwrap();
        assert_eq!(at, t + Duration::days(1));
        assert_eq!(latest, fv);
        assert_eq!(store.tracked_keys().unwrap(), vec![key]);
    }
}
