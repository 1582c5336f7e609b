//! SQLite trade and candle storage.
//!
//! One database file under the storage root holds every converted instrument.
//! Prices are stored as decimal text so tick-scaled values survive exactly.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::dispatch::{DayOutput, TradeStorage};
use super::types::{AggressorSide, Candle, Instrument, Trade};

/// Database file name inside the storage root.
pub const DATABASE_FILE: &str = "trades.db";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

// =============================================================================
// Storage Schema
// =============================================================================

const STORAGE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS instruments (
    symbol TEXT PRIMARY KEY,
    instrument_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    tick_size TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    trade_id INTEGER NOT NULL,
    time TEXT NOT NULL,
    price TEXT NOT NULL,
    volume INTEGER NOT NULL,
    aggressor TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol_time ON trades(symbol, time);

CREATE TABLE IF NOT EXISTS candles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe_secs INTEGER NOT NULL,
    open_time TEXT NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume INTEGER NOT NULL,
    trade_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_candles_symbol_tf_time
    ON candles(symbol, timeframe_secs, open_time);
"#;

// =============================================================================
// Stored rows
// =============================================================================

/// A trade read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrade {
    pub trade_id: i64,
    pub time: NaiveDateTime,
    pub price: Decimal,
    pub volume: i64,
    pub aggressor: AggressorSide,
}

// =============================================================================
// SQLite Storage
// =============================================================================

/// SQLite-backed [`TradeStorage`].
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Open or create storage under `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            std::fs::create_dir_all(root)
                .with_context(|| format!("Failed to create storage root {}", root.display()))?;
        }

        let path = root.join(DATABASE_FILE);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&path, flags)
            .with_context(|| format!("Failed to open storage database: {}", path.display()))?;
        conn.execute_batch(STORAGE_SCHEMA)?;

        info!(path = %path.display(), "Trade storage opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(STORAGE_SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file path, `None` for in-memory storage.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn upsert_instrument(conn: &Connection, instrument: &Instrument) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO instruments (symbol, instrument_id, name, kind, tick_size)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(symbol) DO UPDATE SET
                instrument_id = excluded.instrument_id,
                name = excluded.name,
                kind = excluded.kind,
                tick_size = excluded.tick_size
            "#,
            params![
                instrument.symbol,
                instrument.id,
                instrument.name,
                instrument.kind.as_str(),
                instrument.tick_size.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Count trades stored for a symbol.
    pub fn count_trades(&self, symbol: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Load all trades for a symbol in insertion order.
    pub fn load_trades(&self, symbol: &str) -> Result<Vec<StoredTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT trade_id, time, price, volume, aggressor
            FROM trades
            WHERE symbol = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![symbol], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(trade_id, time, price, volume, aggressor)| -> Result<StoredTrade> {
                Ok(StoredTrade {
                    trade_id,
                    time: parse_time(&time)?,
                    price: Decimal::from_str(&price)
                        .with_context(|| format!("Invalid stored price: {}", price))?,
                    volume,
                    aggressor: AggressorSide::parse(&aggressor),
                })
            })
            .collect()
    }

    /// Load candles for a symbol and timeframe in insertion order.
    pub fn load_candles(&self, symbol: &str, timeframe: Duration) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT open_time, open, high, low, close, volume, trade_count
            FROM candles
            WHERE symbol = ?1 AND timeframe_secs = ?2
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![symbol, timeframe.as_secs() as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(open_time, open, high, low, close, volume, trade_count)| -> Result<Candle> {
                Ok(Candle {
                    open_time: parse_time(&open_time)?,
                    open: Decimal::from_str(&open)?,
                    high: Decimal::from_str(&high)?,
                    low: Decimal::from_str(&low)?,
                    close: Decimal::from_str(&close)?,
                    volume,
                    trade_count: trade_count as u32,
                })
            })
            .collect()
    }

    /// Symbols with stored instruments.
    pub fn symbols(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT symbol FROM instruments ORDER BY symbol")?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(symbols)
    }
}

impl TradeStorage for SqliteStorage {
    fn save_trades(&self, trades: &[Trade], instrument: &Instrument) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::upsert_instrument(&tx, instrument)?;
        insert_trades(&tx, trades, instrument)?;
        tx.commit()?;
        Ok(())
    }

    fn save_candles(
        &self,
        candles: &[Candle],
        timeframe: Duration,
        instrument: &Instrument,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::upsert_instrument(&tx, instrument)?;
        insert_candles(&tx, candles, timeframe, instrument)?;
        tx.commit()?;
        Ok(())
    }

    /// One transaction for the whole file; dropped uncommitted on error.
    fn save_days(&self, days: &[DayOutput<'_>]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for day in days {
            Self::upsert_instrument(&tx, day.instrument)?;
            insert_trades(&tx, day.trades, day.instrument)?;
            for (timeframe, candles) in &day.candles {
                insert_candles(&tx, candles, *timeframe, day.instrument)?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

fn insert_trades(conn: &Connection, trades: &[Trade], instrument: &Instrument) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO trades (symbol, trade_id, time, price, volume, aggressor)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )?;
    for trade in trades {
        stmt.execute(params![
            instrument.symbol,
            trade.id,
            trade.time.format(TIME_FORMAT).to_string(),
            trade.price.to_string(),
            trade.volume,
            trade.aggressor.as_str(),
        ])?;
    }
    Ok(())
}

fn insert_candles(
    conn: &Connection,
    candles: &[Candle],
    timeframe: Duration,
    instrument: &Instrument,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO candles (
            symbol, timeframe_secs, open_time, open, high, low, close, volume, trade_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )?;
    for candle in candles {
        stmt.execute(params![
            instrument.symbol,
            timeframe.as_secs() as i64,
            candle.open_time.format(TIME_FORMAT).to_string(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume,
            candle.trade_count as i64,
        ])?;
    }
    Ok(())
}

fn parse_time(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .with_context(|| format!("Invalid stored timestamp: {}", s))
}
