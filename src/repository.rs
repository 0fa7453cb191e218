// ===============================
// src/repository.rs
// ===============================
//
// Durable store for the one open position per (mode, account) and the
// closed-trade ledger. Every operation runs in its own short transaction;
// close_position is the single arbitration point for concurrent closers.
//
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{
    realized_pnl, trade_metrics, CloseParams, ClosedTrade, EntrySnapshot, Mode, NewPosition,
    OpenPosition, PositionSide, Scope,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

pub trait PositionRepository: Send + Sync {
    /// Upsert keyed by scope. A new row, or one whose side or symbol changes,
    /// starts its extremes at the entry price.
    fn save_open_position(&self, scope: &Scope, pos: &NewPosition) -> RepoResult<OpenPosition>;

    /// Widen min/max with `price`; Ok(false) when nothing changed or no row.
    fn update_trade_extremes(&self, scope: &Scope, price: f64) -> RepoResult<bool>;

    /// Atomic open -> closed transition. Ok(None) if no open position exists.
    fn close_position(&self, scope: &Scope, params: &CloseParams) -> RepoResult<Option<ClosedTrade>>;

    fn load_open_position(&self, scope: &Scope) -> RepoResult<Option<OpenPosition>>;

    /// Full scan; startup only.
    fn recover_all_open_positions(&self) -> RepoResult<Vec<OpenPosition>>;

    fn realized_pnl_total(&self, scope: &Scope) -> RepoResult<f64>;

    fn recent_trades(&self, scope: &Scope, limit: usize) -> RepoResult<Vec<ClosedTrade>>;

    fn trade_count(&self) -> RepoResult<u64>;

    /// Latest exit time across the whole ledger.
    fn last_fill_time(&self) -> RepoResult<Option<DateTime<Utc>>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS open_positions (
    mode TEXT NOT NULL,
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    qty REAL NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    entry_time TEXT NOT NULL,
    entry_vwap REAL,
    entry_cum_delta REAL,
    entry_poc REAL,
    target_price REAL,
    stop_price REAL,
    trade_min_price REAL NOT NULL,
    trade_max_price REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (mode, account)
);

CREATE TABLE IF NOT EXISTS closed_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    entry_time TEXT NOT NULL,
    exit_time TEXT NOT NULL,
    realized_pnl REAL NOT NULL,
    commissions REAL NOT NULL,
    mae REAL NOT NULL,
    mfe REAL NOT NULL,
    efficiency REAL,
    r_multiple REAL,
    trade_min_price REAL NOT NULL,
    trade_max_price REAL NOT NULL,
    entry_vwap REAL,
    entry_cum_delta REAL,
    entry_poc REAL
);

CREATE INDEX IF NOT EXISTS idx_closed_trades_scope ON closed_trades(mode, account);
CREATE INDEX IF NOT EXISTS idx_closed_trades_exit ON closed_trades(exit_time);
"#;

const OPEN_COLUMNS: &str = "mode, account, symbol, qty, side, entry_price, entry_time, entry_vwap, \
    entry_cum_delta, entry_poc, target_price, stop_price, trade_min_price, trade_max_price, \
    created_at, updated_at";

const TRADE_COLUMNS: &str = "id, mode, account, symbol, side, qty, entry_price, exit_price, \
    entry_time, exit_time, realized_pnl, commissions, mae, mfe, efficiency, r_multiple, \
    trade_min_price, trade_max_price";

fn mode_col(row: &Row, idx: usize) -> rusqlite::Result<Mode> {
    let s: String = row.get(idx)?;
    Mode::parse(&s).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(idx, "mode".to_string(), rusqlite::types::Type::Text)
    })
}

fn read_open(row: &Row) -> rusqlite::Result<OpenPosition> {
    let side: String = row.get(4)?;
    Ok(OpenPosition {
        mode: mode_col(row, 0)?,
        account: row.get(1)?,
        symbol: row.get(2)?,
        qty: row.get(3)?,
        side: PositionSide::parse(&side),
        entry_price: row.get(5)?,
        entry_time: row.get(6)?,
        entry_snapshot: EntrySnapshot { vwap: row.get(7)?, cum_delta: row.get(8)?, poc: row.get(9)? },
        target_price: row.get(10)?,
        stop_price: row.get(11)?,
        trade_min_price: row.get(12)?,
        trade_max_price: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn read_trade(row: &Row) -> rusqlite::Result<ClosedTrade> {
    let side: String = row.get(4)?;
    Ok(ClosedTrade {
        id: row.get(0)?,
        mode: mode_col(row, 1)?,
        account: row.get(2)?,
        symbol: row.get(3)?,
        side: PositionSide::parse(&side),
        qty: row.get(5)?,
        entry_price: row.get(6)?,
        exit_price: row.get(7)?,
        entry_time: row.get(8)?,
        exit_time: row.get(9)?,
        realized_pnl: row.get(10)?,
        commissions: row.get(11)?,
        mae: row.get(12)?,
        mfe: row.get(13)?,
        efficiency: row.get(14)?,
        r_multiple: row.get(15)?,
        trade_min_price: row.get(16)?,
        trade_max_price: row.get(17)?,
    })
}

fn select_open(conn: &Connection, scope: &Scope) -> rusqlite::Result<Option<OpenPosition>> {
    conn.query_row(
        &format!("SELECT {OPEN_COLUMNS} FROM open_positions WHERE mode = ?1 AND account = ?2"),
        params![scope.mode.as_str(), scope.account],
        read_open,
    )
    .optional()
}

/// SQLite-backed repository.
pub struct SqlitePositionRepository {
    conn: Mutex<Connection>,
}

impl SqlitePositionRepository {
    pub fn open(path: &Path) -> RepoResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "position repository opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> RepoResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub(crate) fn set_updated_at(&self, scope: &Scope, at: DateTime<Utc>) -> RepoResult<()> {
        self.conn.lock().execute(
            "UPDATE open_positions SET updated_at = ?1 WHERE mode = ?2 AND account = ?3",
            params![at, scope.mode.as_str(), scope.account],
        )?;
        Ok(())
    }
}

fn validate(pos: &NewPosition) -> RepoResult<PositionSide> {
    if pos.symbol.trim().is_empty() {
        return Err(RepoError::InvalidInput("empty symbol".into()));
    }
    if !pos.entry_price.is_finite() || pos.entry_price <= 0.0 {
        return Err(RepoError::InvalidInput(format!("entry price {}", pos.entry_price)));
    }
    PositionSide::from_qty(pos.qty).ok_or_else(|| RepoError::InvalidInput("zero quantity".into()))
}

impl PositionRepository for SqlitePositionRepository {
    fn save_open_position(&self, scope: &Scope, pos: &NewPosition) -> RepoResult<OpenPosition> {
        let side = validate(pos)?;
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO open_positions (
                mode, account, symbol, qty, side, entry_price, entry_time,
                entry_vwap, entry_cum_delta, entry_poc, target_price, stop_price,
                trade_min_price, trade_max_price, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?6, ?6, ?13, ?13)
            ON CONFLICT(mode, account) DO UPDATE SET
                trade_min_price = CASE WHEN open_positions.side = excluded.side AND open_positions.symbol = excluded.symbol
                    THEN open_positions.trade_min_price ELSE excluded.trade_min_price END,
                trade_max_price = CASE WHEN open_positions.side = excluded.side AND open_positions.symbol = excluded.symbol
                    THEN open_positions.trade_max_price ELSE excluded.trade_max_price END,
                entry_time = CASE WHEN open_positions.side = excluded.side AND open_positions.symbol = excluded.symbol
                    THEN open_positions.entry_time ELSE excluded.entry_time END,
                created_at = CASE WHEN open_positions.side = excluded.side AND open_positions.symbol = excluded.symbol
                    THEN open_positions.created_at ELSE excluded.created_at END,
                symbol = excluded.symbol,
                qty = excluded.qty,
                side = excluded.side,
                entry_price = excluded.entry_price,
                target_price = COALESCE(excluded.target_price, open_positions.target_price),
                stop_price = COALESCE(excluded.stop_price, open_positions.stop_price),
                updated_at = excluded.updated_at
            "#,
            params![
                scope.mode.as_str(),
                scope.account,
                pos.symbol,
                pos.qty,
                side.as_str(),
                pos.entry_price,
                pos.entry_time,
                pos.entry_snapshot.vwap,
                pos.entry_snapshot.cum_delta,
                pos.entry_snapshot.poc,
                pos.target_price,
                pos.stop_price,
                now,
            ],
        )?;
        let saved = select_open(&tx, scope)?
            .ok_or_else(|| RepoError::InvalidInput("row vanished after upsert".into()))?;
        tx.commit()?;
        debug!(mode = %scope.mode, account = %scope.account, qty = saved.qty, "open position saved");
        Ok(saved)
    }

    fn update_trade_extremes(&self, scope: &Scope, price: f64) -> RepoResult<bool> {
        if !price.is_finite() || price <= 0.0 {
            return Ok(false);
        }
        let changed = self.conn.lock().execute(
            r#"
            UPDATE open_positions SET
                trade_min_price = MIN(trade_min_price, ?1),
                trade_max_price = MAX(trade_max_price, ?1),
                updated_at = ?2
            WHERE mode = ?3 AND account = ?4
              AND (trade_min_price > ?1 OR trade_max_price < ?1)
            "#,
            params![price, Utc::now(), scope.mode.as_str(), scope.account],
        )?;
        Ok(changed > 0)
    }

    fn close_position(&self, scope: &Scope, params: &CloseParams) -> RepoResult<Option<ClosedTrade>> {
        if !params.exit_price.is_finite() || params.exit_price <= 0.0 {
            return Err(RepoError::InvalidInput(format!("exit price {}", params.exit_price)));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(pos) = select_open(&tx, scope)? else {
            return Ok(None);
        };
        let pnl = realized_pnl(pos.entry_price, params.exit_price, pos.qty, params.point_value, params.commissions);
        let m = trade_metrics(&pos, params, pnl);
        tx.execute(
            r#"
            INSERT INTO closed_trades (
                mode, account, symbol, side, qty, entry_price, exit_price, entry_time, exit_time,
                realized_pnl, commissions, mae, mfe, efficiency, r_multiple,
                trade_min_price, trade_max_price, entry_vwap, entry_cum_delta, entry_poc
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
            params![
                pos.mode.as_str(),
                pos.account,
                pos.symbol,
                pos.side.as_str(),
                pos.qty,
                pos.entry_price,
                params.exit_price,
                pos.entry_time,
                params.exit_time,
                pnl,
                params.commissions,
                m.mae,
                m.mfe,
                m.efficiency,
                m.r_multiple,
                pos.trade_min_price.min(params.exit_price),
                pos.trade_max_price.max(params.exit_price),
                pos.entry_snapshot.vwap,
                pos.entry_snapshot.cum_delta,
                pos.entry_snapshot.poc,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "DELETE FROM open_positions WHERE mode = ?1 AND account = ?2",
            params![scope.mode.as_str(), scope.account],
        )?;
        let trade = tx.query_row(
            &format!("SELECT {TRADE_COLUMNS} FROM closed_trades WHERE id = ?1"),
            params![id],
            read_trade,
        )?;
        tx.commit()?;
        info!(id, mode = %trade.mode, account = %trade.account, pnl = trade.realized_pnl, "position closed into ledger");
        Ok(Some(trade))
    }

    fn load_open_position(&self, scope: &Scope) -> RepoResult<Option<OpenPosition>> {
        Ok(select_open(&self.conn.lock(), scope)?)
    }

    fn recover_all_open_positions(&self) -> RepoResult<Vec<OpenPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPEN_COLUMNS} FROM open_positions ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map([], read_open)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn realized_pnl_total(&self, scope: &Scope) -> RepoResult<f64> {
        let total: f64 = self.conn.lock().query_row(
            "SELECT COALESCE(SUM(realized_pnl), 0.0) FROM closed_trades WHERE mode = ?1 AND account = ?2",
            params![scope.mode.as_str(), scope.account],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    fn recent_trades(&self, scope: &Scope, limit: usize) -> RepoResult<Vec<ClosedTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM closed_trades WHERE mode = ?1 AND account = ?2 \
             ORDER BY id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![scope.mode.as_str(), scope.account, limit as i64], read_trade)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn trade_count(&self) -> RepoResult<u64> {
        let n: i64 = self.conn.lock().query_row("SELECT COUNT(*) FROM closed_trades", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn last_fill_time(&self) -> RepoResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let t: Option<DateTime<Utc>> = conn
            .query_row(
                "SELECT exit_time FROM closed_trades ORDER BY exit_time DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sim() -> Scope {
        Scope::new(Mode::Sim, "Sim1")
    }

    fn close_at(price: f64, point_value: f64) -> CloseParams {
        CloseParams {
            exit_price: price,
            exit_time: Utc::now(),
            point_value,
            commissions: 0.0,
            mae: None,
            mfe: None,
        }
    }

    #[test]
    fn first_save_seeds_extremes() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        let p = repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 2.0, 6000.0, Utc::now()))?;
        assert_eq!(p.trade_min_price, 6000.0);
        assert_eq!(p.trade_max_price, 6000.0);
        assert_eq!(p.side, PositionSide::Long);
        Ok(())
    }

    #[test]
    fn upsert_keeps_one_row_per_scope() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
        repo.update_trade_extremes(&sim(), 5990.0)?;
        let p = repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 3.0, 6002.0, Utc::now()))?;
        assert_eq!(p.qty, 3.0);
        assert_eq!(p.trade_min_price, 5990.0);
        assert_eq!(repo.recover_all_open_positions()?.len(), 1);
        Ok(())
    }

    #[test]
    fn side_change_restarts_extremes() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
        repo.update_trade_extremes(&sim(), 5950.0)?;
        let p = repo.save_open_position(&sim(), &NewPosition::new("ESZ5", -2.0, 6010.0, Utc::now()))?;
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!((p.trade_min_price, p.trade_max_price), (6010.0, 6010.0));
        Ok(())
    }

    #[test]
    fn extremes_widen_monotonically() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
        assert!(repo.update_trade_extremes(&sim(), 6010.0)?);
        assert!(!repo.update_trade_extremes(&sim(), 6005.0)?);
        assert!(repo.update_trade_extremes(&sim(), 5990.0)?);
        assert!(!repo.update_trade_extremes(&Scope::new(Mode::Live, "1"), 1.0)?);
        let p = repo.load_open_position(&sim())?.unwrap();
        assert_eq!((p.trade_min_price, p.trade_max_price), (5990.0, 6010.0));
        Ok(())
    }

    #[test]
    fn close_twice_writes_one_row() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
        repo.update_trade_extremes(&sim(), 5990.0)?;
        repo.update_trade_extremes(&sim(), 6010.0)?;
        let first = repo.close_position(&sim(), &close_at(6005.0, 1.0))?;
        let trade = first.expect("first close returns a trade");
        assert!(trade.id > 0);
        assert_eq!(trade.realized_pnl, 5.0);
        assert_eq!((trade.mae, trade.mfe), (10.0, 10.0));
        assert!(repo.close_position(&sim(), &close_at(6005.0, 1.0))?.is_none());
        assert_eq!(repo.trade_count()?, 1);
        assert!(repo.load_open_position(&sim())?.is_none());
        Ok(())
    }

    #[test]
    fn short_excursions_scale_with_point_value() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", -10.0, 6000.0, Utc::now()))?;
        repo.update_trade_extremes(&sim(), 5990.0)?;
        repo.update_trade_extremes(&sim(), 6010.0)?;
        let t = repo.close_position(&sim(), &close_at(6000.0, 50.0))?.unwrap();
        assert_eq!(t.side, PositionSide::Short);
        assert_eq!((t.mae, t.mfe), (5000.0, 5000.0));
        Ok(())
    }

    #[test]
    fn concurrent_closers_produce_one_trade() -> RepoResult<()> {
        let dir = tempfile::tempdir().map_err(|e| RepoError::InvalidInput(e.to_string()))?;
        let repo = Arc::new(SqlitePositionRepository::open(&dir.path().join("t.sqlite3"))?);
        repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                std::thread::spawn(move || repo.close_position(&sim(), &close_at(6001.0, 1.0)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap().unwrap())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(repo.trade_count()?, 1);
        Ok(())
    }

    #[test]
    fn ledger_queries() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        assert!(repo.last_fill_time()?.is_none());
        for exit in [6002.0, 5999.0] {
            repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))?;
            repo.close_position(&sim(), &close_at(exit, 50.0))?;
        }
        assert_eq!(repo.realized_pnl_total(&sim())?, 50.0);
        assert_eq!(repo.realized_pnl_total(&Scope::new(Mode::Live, "Sim1"))?, 0.0);
        let recent = repo.recent_trades(&sim(), 1)?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].exit_price, 5999.0);
        assert!(repo.last_fill_time()?.is_some());
        Ok(())
    }

    #[test]
    fn rejects_bad_input() -> RepoResult<()> {
        let repo = SqlitePositionRepository::in_memory()?;
        assert!(repo.save_open_position(&sim(), &NewPosition::new("ESZ5", 0.0, 6000.0, Utc::now())).is_err());
        assert!(repo.save_open_position(&sim(), &NewPosition::new("", 1.0, 6000.0, Utc::now())).is_err());
        assert!(repo.close_position(&sim(), &close_at(f64::NAN, 1.0)).is_err());
        Ok(())
    }
}
