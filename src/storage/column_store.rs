// =============================================================================
// Column store — read-optimised analytics over historical data
// =============================================================================
//
// SQLite (WAL mode) behind a parking_lot mutex. Populated by the ETL and the
// trading loop; strategies get read-only handles and cannot write. All writes
// are upserts keyed by natural composite keys, which makes ETL replay
// idempotent.
//
// DATA TIER SAFETY: bar reads exclude tier-0 rows by default, and a backtest
// read that would surface tier-0 rows (or rows from more than one tier) is a
// hard failure, not a warning. Feeding survey-grade data into decisions is a
// bug, never a condition to tolerate.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Bar, BarQuality, DataTier};

/// Schema is additive-only; columns missing in older rows read as NULL.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    tier TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    estimated_spread_bps REAL,
    quality TEXT,
    UNIQUE (symbol, timestamp, timeframe)
);

CREATE INDEX IF NOT EXISTS idx_bars_lookup
    ON bars(symbol, timeframe, timestamp);

CREATE TABLE IF NOT EXISTS sentiment (
    symbol TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    score REAL NOT NULL,
    volume INTEGER,
    UNIQUE (symbol, timestamp, source)
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    client_order_id TEXT,
    symbol TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    price REAL NOT NULL,
    strategy_id TEXT,
    signal_id TEXT
);

CREATE TABLE IF NOT EXISTS regimes (
    timestamp TEXT NOT NULL,
    symbol TEXT,
    trend_regime TEXT NOT NULL,
    vol_regime TEXT NOT NULL,
    adx REAL,
    fast_vol REAL,
    slow_vol REAL,
    vol_ratio REAL,
    momentum_enabled INTEGER,
    position_scale REAL,
    UNIQUE (timestamp, symbol)
);

CREATE TABLE IF NOT EXISTS performance (
    date TEXT PRIMARY KEY,
    equity REAL NOT NULL,
    cash REAL NOT NULL,
    positions_value REAL NOT NULL,
    daily_return REAL,
    cumulative_return REAL,
    max_drawdown REAL,
    current_drawdown REAL
);
"#;

/// How a bar read treats data tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarReadMode {
    /// Default contract: tier-0 excluded in SQL, and any tier-0 or
    /// mixed-tier result is a hard failure.
    Backtest,
    /// No filtering and no checks. Debugging only.
    Raw,
}

/// An executed-trade row (drained from order-filled events).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub trade_id: String,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub strategy_id: Option<String>,
    pub signal_id: Option<String>,
}

/// A sentiment score row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentRow {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub score: f64,
    pub volume: Option<i64>,
}

/// A regime classification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeRow {
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub trend_regime: String,
    pub vol_regime: String,
    pub adx: Option<f64>,
    pub fast_vol: Option<f64>,
    pub slow_vol: Option<f64>,
    pub vol_ratio: Option<f64>,
    pub momentum_enabled: bool,
    pub position_scale: f64,
}

/// A daily performance snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRow {
    pub date: String,
    pub equity: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub daily_return: Option<f64>,
    pub cumulative_return: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub current_drawdown: Option<f64>,
}

/// The column store handle.
pub struct ColumnStore {
    conn: Mutex<Connection>,
    read_only: bool,
}

impl ColumnStore {
    /// Open read-write and initialise the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db dir {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open column store at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("schema initialisation failed")?;

        info!(path = %path.display(), "column store opened (read-write)");

        Ok(Self {
            conn: Mutex::new(conn),
            read_only: false,
        })
    }

    /// Open a read-only handle (handed to strategies). Any write attempt
    /// fails, both by our guard and at the SQLite layer.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open read-only column store at {}", path.display()))?;

        info!(path = %path.display(), "column store opened (read-only)");

        Ok(Self {
            conn: Mutex::new(conn),
            read_only: true,
        })
    }

    fn guard_writable(&self) -> Result<()> {
        if self.read_only {
            bail!("column store is read-only: writes are not permitted");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bars
    // -------------------------------------------------------------------------

    /// Upsert a batch of bars keyed by (symbol, timestamp, timeframe).
    pub fn insert_bars(&self, bars: &[Bar]) -> Result<usize> {
        self.guard_writable()?;
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO bars
                   (symbol, timestamp, timeframe, tier, open, high, low, close, volume,
                    estimated_spread_bps, quality)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(symbol, timestamp, timeframe) DO UPDATE SET
                   tier = excluded.tier,
                   open = excluded.open,
                   high = excluded.high,
                   low = excluded.low,
                   close = excluded.close,
                   volume = excluded.volume,
                   estimated_spread_bps = excluded.estimated_spread_bps,
                   quality = excluded.quality",
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol,
                    bar.timestamp.to_rfc3339(),
                    bar.timeframe,
                    bar.tier.as_str(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.estimated_spread_bps,
                    serde_json::to_string(&bar.quality)?.trim_matches('"'),
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = bars.len(), "bars upserted");
        Ok(bars.len())
    }

    /// Range query for one symbol + timeframe.
    ///
    /// Under [`BarReadMode::Backtest`] (the default contract for anything
    /// feeding decisions) tier-0 rows are excluded in SQL, and the result is
    /// verified: any tier-0 row or a mix of tiers fails hard.
    pub fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: &str,
        mode: BarReadMode,
    ) -> Result<Vec<Bar>> {
        let tier_filter = match mode {
            BarReadMode::Backtest => "AND tier != 'TIER_0_UNIVERSE'",
            BarReadMode::Raw => "",
        };

        let sql = format!(
            "SELECT symbol, timestamp, timeframe, tier, open, high, low, close, volume,
                    estimated_spread_bps, quality
             FROM bars
             WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3 AND timeframe = ?4
             {tier_filter}
             ORDER BY timestamp"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![symbol, start.to_rfc3339(), end.to_rfc3339(), timeframe],
            Self::row_to_bar,
        )?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        drop(stmt);
        drop(conn);

        if mode == BarReadMode::Backtest {
            Self::verify_tier_safety(symbol, &bars)?;
        }

        Ok(bars)
    }

    /// Multi-symbol variant of [`get_bars`]. Each symbol is checked
    /// independently so one clean symbol never masks another's violation.
    pub fn get_bars_multi(
        &self,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: &str,
        mode: BarReadMode,
    ) -> Result<std::collections::HashMap<String, Vec<Bar>>> {
        let mut out = std::collections::HashMap::new();
        for symbol in symbols {
            out.insert(
                symbol.clone(),
                self.get_bars(symbol, start, end, timeframe, mode)?,
            );
        }
        Ok(out)
    }

    fn verify_tier_safety(symbol: &str, bars: &[Bar]) -> Result<()> {
        if bars.iter().any(|b| b.tier == DataTier::Tier0Universe) {
            bail!("tier-0 data in backtest read for {symbol}: results would be invalid");
        }
        let mut tiers: Vec<DataTier> = bars.iter().map(|b| b.tier).collect();
        tiers.sort_by_key(|t| t.as_str());
        tiers.dedup();
        if tiers.len() > 1 {
            bail!(
                "mixed data tiers in a single query for {symbol}: {:?}",
                tiers
            );
        }
        Ok(())
    }

    fn row_to_bar(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bar> {
        let ts: String = row.get(1)?;
        let tier: String = row.get(3)?;
        let quality: Option<String> = row.get(10)?;
        Ok(Bar {
            symbol: row.get(0)?,
            timestamp: DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            timeframe: row.get(2)?,
            tier: DataTier::parse(&tier).unwrap_or(DataTier::Tier0Universe),
            open: row.get(4)?,
            high: row.get(5)?,
            low: row.get(6)?,
            close: row.get(7)?,
            volume: row.get(8)?,
            estimated_spread_bps: row.get(9)?,
            quality: match quality.as_deref() {
                Some("realtime") => BarQuality::Realtime,
                _ => BarQuality::Delayed,
            },
        })
    }

    // -------------------------------------------------------------------------
    // Sentiment
    // -------------------------------------------------------------------------

    pub fn insert_sentiment(&self, rows: &[SentimentRow]) -> Result<usize> {
        self.guard_writable()?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sentiment (symbol, timestamp, source, score, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(symbol, timestamp, source) DO UPDATE SET
                   score = excluded.score,
                   volume = excluded.volume",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.symbol,
                    r.timestamp.to_rfc3339(),
                    r.source,
                    r.score,
                    r.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, trade: &TradeRow) -> Result<()> {
        self.guard_writable()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO trades
               (trade_id, order_id, client_order_id, symbol, timestamp, side, qty, price,
                strategy_id, signal_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.trade_id,
                trade.order_id,
                trade.client_order_id,
                trade.symbol,
                trade.timestamp.to_rfc3339(),
                trade.side,
                trade.qty,
                trade.price,
                trade.strategy_id,
                trade.signal_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_trades(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock();

        let (sql, use_symbol) = match symbol {
            Some(_) => (
                "SELECT trade_id, order_id, client_order_id, symbol, timestamp, side, qty,
                        price, strategy_id, signal_id
                 FROM trades
                 WHERE timestamp >= ?1 AND timestamp <= ?2 AND symbol = ?3
                 ORDER BY timestamp",
                true,
            ),
            None => (
                "SELECT trade_id, order_id, client_order_id, symbol, timestamp, side, qty,
                        price, strategy_id, signal_id
                 FROM trades
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                 ORDER BY timestamp",
                false,
            ),
        };

        let mut stmt = conn.prepare_cached(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<TradeRow> {
            let ts: String = row.get(4)?;
            Ok(TradeRow {
                trade_id: row.get(0)?,
                order_id: row.get(1)?,
                client_order_id: row.get(2)?,
                symbol: row.get(3)?,
                timestamp: DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                side: row.get(5)?,
                qty: row.get(6)?,
                price: row.get(7)?,
                strategy_id: row.get(8)?,
                signal_id: row.get(9)?,
            })
        };

        let mut trades = Vec::new();
        if use_symbol {
            let rows = stmt.query_map(
                params![start.to_rfc3339(), end.to_rfc3339(), symbol.unwrap()],
                map_row,
            )?;
            for row in rows {
                trades.push(row?);
            }
        } else {
            let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], map_row)?;
            for row in rows {
                trades.push(row?);
            }
        }
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Regimes
    // -------------------------------------------------------------------------

    pub fn insert_regime(&self, regime: &RegimeRow) -> Result<()> {
        self.guard_writable()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO regimes
               (timestamp, symbol, trend_regime, vol_regime, adx, fast_vol, slow_vol,
                vol_ratio, momentum_enabled, position_scale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(timestamp, symbol) DO UPDATE SET
               trend_regime = excluded.trend_regime,
               vol_regime = excluded.vol_regime,
               adx = excluded.adx,
               fast_vol = excluded.fast_vol,
               slow_vol = excluded.slow_vol,
               vol_ratio = excluded.vol_ratio,
               momentum_enabled = excluded.momentum_enabled,
               position_scale = excluded.position_scale",
            params![
                regime.timestamp.to_rfc3339(),
                regime.symbol,
                regime.trend_regime,
                regime.vol_regime,
                regime.adx,
                regime.fast_vol,
                regime.slow_vol,
                regime.vol_ratio,
                regime.momentum_enabled as i64,
                regime.position_scale,
            ],
        )?;
        Ok(())
    }

    /// Most recent regime classification for a symbol (or the market-wide
    /// row when `symbol` is `None`).
    pub fn latest_regime(&self, symbol: Option<&str>) -> Result<Option<RegimeRow>> {
        let conn = self.conn.lock();

        let sql = match symbol {
            Some(_) => {
                "SELECT timestamp, symbol, trend_regime, vol_regime, adx, fast_vol, slow_vol,
                        vol_ratio, momentum_enabled, position_scale
                 FROM regimes WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1"
            }
            None => {
                "SELECT timestamp, symbol, trend_regime, vol_regime, adx, fast_vol, slow_vol,
                        vol_ratio, momentum_enabled, position_scale
                 FROM regimes WHERE symbol IS NULL ORDER BY timestamp DESC LIMIT 1"
            }
        };

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RegimeRow> {
            let ts: String = row.get(0)?;
            Ok(RegimeRow {
                timestamp: DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                symbol: row.get(1)?,
                trend_regime: row.get(2)?,
                vol_regime: row.get(3)?,
                adx: row.get(4)?,
                fast_vol: row.get(5)?,
                slow_vol: row.get(6)?,
                vol_ratio: row.get(7)?,
                momentum_enabled: row.get::<_, i64>(8)? != 0,
                position_scale: row.get(9)?,
            })
        };

        let mut stmt = conn.prepare_cached(sql)?;
        let result = if let Some(s) = symbol {
            stmt.query_map(params![s], map_row)?.next()
        } else {
            stmt.query_map([], map_row)?.next()
        };

        match result {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Performance
    // -------------------------------------------------------------------------

    pub fn insert_performance(&self, row: &PerformanceRow) -> Result<()> {
        self.guard_writable()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO performance
               (date, equity, cash, positions_value, daily_return, cumulative_return,
                max_drawdown, current_drawdown)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.date,
                row.equity,
                row.cash,
                row.positions_value,
                row.daily_return,
                row.cumulative_return,
                row.max_drawdown,
                row.current_drawdown,
            ],
        )?;
        Ok(())
    }

    pub fn performance_history(&self, start_date: &str, end_date: &str) -> Result<Vec<PerformanceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT date, equity, cash, positions_value, daily_return, cumulative_return,
                    max_drawdown, current_drawdown
             FROM performance WHERE date >= ?1 AND date <= ?2 ORDER BY date",
        )?;

        let rows = stmt.query_map(params![start_date, end_date], |row| {
            Ok(PerformanceRow {
                date: row.get(0)?,
                equity: row.get(1)?,
                cash: row.get(2)?,
                positions_value: row.get(3)?,
                daily_return: row.get(4)?,
                cumulative_return: row.get(5)?,
                max_drawdown: row.get(6)?,
                current_drawdown: row.get(7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Close the store handle (graceful shutdown). The connection itself
    /// drops with the last reference; this marks the boundary for the
    /// shutdown protocol.
    pub fn close(&self) -> Result<()> {
        info!("column store closed");
        Ok(())
    }
}
