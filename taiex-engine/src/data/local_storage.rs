//! Local market data storage using SQLite.
//!
//! Provides persistent storage for:
//! - Daily bars (one logical series per symbol, keyed by (code, date))
//! - The trading calendar
//! - The symbol registry (valid and invalid codes)
//! - The watchlist
//! - Per-symbol sync metadata
//!
//! A single connection sits behind an async mutex; each operation acquires it
//! for its own duration only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::store::{
    BarStore, SymbolRegistry, SyncLedger, TradingCalendar, UpsertOutcome, WatchedSymbol, Watchlist,
};
use super::{DailyBar, Market, MarketFilter, SourceKind, Symbol};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Registered symbols
CREATE TABLE IF NOT EXISTS symbols (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    market TEXT NOT NULL DEFAULT 'unknown',
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_symbols_market
ON symbols(market);

-- Codes listed on no board
CREATE TABLE IF NOT EXISTS invalid_symbols (
    code TEXT PRIMARY KEY
);

-- Trading calendar
CREATE TABLE IF NOT EXISTS trading_days (
    date TEXT PRIMARY KEY,
    has_trading INTEGER NOT NULL
);

-- Daily bars
CREATE TABLE IF NOT EXISTS daily_bars (
    code TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (code, date)
);

CREATE INDEX IF NOT EXISTS idx_daily_bars_date
ON daily_bars(date);

-- Watchlist
CREATE TABLE IF NOT EXISTS watchlist (
    code TEXT PRIMARY KEY,
    watch_date TEXT NOT NULL
);

-- Sync metadata table
CREATE TABLE IF NOT EXISTS sync_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_type TEXT NOT NULL,
    code TEXT NOT NULL,
    last_sync_at TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    error_message TEXT,
    UNIQUE(data_type, code)
);
"#;

const DATE_FMT: &str = "%Y-%m-%d";

/// `sync_metadata.data_type` for daily bar backfills.
pub const DAILY_BARS: &str = "daily_bars";

// ============================================================================
// Sync Status
// ============================================================================

/// Sync status for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failed,
    Partial,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl SyncStatus {
    fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

/// Sync metadata record
#[derive(Debug, Clone)]
pub struct SyncMetadata {
    pub data_type: String,
    pub code: String,
    pub last_sync_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
}

/// Row counts for a quick health overview.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub symbols: u64,
    pub invalid_symbols: u64,
    pub bars: u64,
    pub trading_days: u64,
    pub closed_days: u64,
    pub watched: u64,
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed implementation of every storage capability.
#[derive(Clone)]
pub struct SqliteStore {
    /// rusqlite::Connection is Send but not Sync; Mutex<T> is Sync when T: Send
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(db_path).context("Failed to open market database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;

        info!(db_path = %db_path.display(), "Initialized market database");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn row_to_bar(row: &rusqlite::Row) -> rusqlite::Result<DailyBar> {
        let date_str: String = row.get(1)?;
        let date = NaiveDate::parse_from_str(&date_str, DATE_FMT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let volume: i64 = row.get(6)?;

        Ok(DailyBar {
            code: row.get(0)?,
            date,
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: volume.max(0) as u64,
        })
    }

    fn row_to_symbol(row: &rusqlite::Row) -> rusqlite::Result<Symbol> {
        let market: String = row.get(2)?;
        Ok(Symbol {
            code: row.get(0)?,
            name: row.get(1)?,
            market: market.parse().unwrap_or(Market::Unknown),
        })
    }

    fn collect_dates(stmt: &mut rusqlite::Statement, params: impl rusqlite::Params) -> Result<BTreeSet<NaiveDate>> {
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut dates = BTreeSet::new();
        for row in rows {
            let raw = row?;
            let date = NaiveDate::parse_from_str(&raw, DATE_FMT)
                .with_context(|| format!("Corrupt date in database: {}", raw))?;
            dates.insert(date);
        }
        Ok(dates)
    }

    // ========================================================================
    // Sync Metadata Operations
    // ========================================================================

    /// Get sync metadata
    pub async fn get_sync_metadata(&self, data_type: &str, code: &str) -> Result<Option<SyncMetadata>> {
        let db = self.db.lock().await;

        let result = db.query_row(
            "SELECT data_type, code, last_sync_at, sync_status, error_message
             FROM sync_metadata WHERE data_type = ?1 AND code = ?2",
            params![data_type, code],
            |row| {
                let last_sync_str: String = row.get(2)?;
                let status_str: String = row.get(3)?;

                Ok(SyncMetadata {
                    data_type: row.get(0)?,
                    code: row.get(1)?,
                    last_sync_at: DateTime::parse_from_rfc3339(&last_sync_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    sync_status: SyncStatus::parse(&status_str),
                    error_message: row.get(4)?,
                })
            },
        );

        match result {
            Ok(meta) => Ok(Some(meta)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Update sync metadata
    pub async fn update_sync_metadata(
        &self,
        data_type: &str,
        code: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;

        db.execute(
            r#"
            INSERT INTO sync_metadata (data_type, code, last_sync_at, sync_status, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(data_type, code) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                sync_status = excluded.sync_status,
                error_message = excluded.error_message
            "#,
            params![
                data_type,
                code,
                Utc::now().to_rfc3339(),
                status.to_string(),
                error_message,
            ],
        )?;

        Ok(())
    }

    // ========================================================================
    // Maintenance Operations
    // ========================================================================

    /// Get database statistics
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let db = self.db.lock().await;
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = db.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        Ok(StoreStats {
            symbols: count("SELECT COUNT(*) FROM symbols")?,
            invalid_symbols: count("SELECT COUNT(*) FROM invalid_symbols")?,
            bars: count("SELECT COUNT(*) FROM daily_bars")?,
            trading_days: count("SELECT COUNT(*) FROM trading_days WHERE has_trading = 1")?,
            closed_days: count("SELECT COUNT(*) FROM trading_days WHERE has_trading = 0")?,
            watched: count("SELECT COUNT(*) FROM watchlist")?,
        })
    }
}

// ============================================================================
// Bar Store
// ============================================================================

#[async_trait]
impl BarStore for SqliteStore {
    async fn upsert_if_absent(&self, bar: &DailyBar, source: SourceKind) -> Result<UpsertOutcome> {
        let db = self.db.lock().await;

        let changed = db.execute(
            r#"
            INSERT OR IGNORE INTO daily_bars
            (code, date, open, high, low, close, volume, source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                bar.code,
                bar.date.format(DATE_FMT).to_string(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume as i64,
                source.as_str(),
            ],
        )?;

        if changed == 0 {
            debug!(code = %bar.code, date = %bar.date, "Bar already present");
            Ok(UpsertOutcome::AlreadyPresent)
        } else {
            Ok(UpsertOutcome::Inserted)
        }
    }

    async fn get_range(&self, code: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyBar>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT code, date, open, high, low, close, volume
             FROM daily_bars WHERE code = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date ASC",
        )?;

        let bars = stmt
            .query_map(
                params![
                    code,
                    start.format(DATE_FMT).to_string(),
                    end.format(DATE_FMT).to_string()
                ],
                Self::row_to_bar,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    async fn latest_n(&self, code: &str, n: usize) -> Result<Vec<DailyBar>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT code, date, open, high, low, close, volume
             FROM daily_bars WHERE code = ?1
             ORDER BY date DESC LIMIT ?2",
        )?;

        let bars = stmt
            .query_map(params![code, n as i64], Self::row_to_bar)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    async fn dates_between(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT date FROM daily_bars WHERE code = ?1 AND date >= ?2 AND date <= ?3",
        )?;
        Self::collect_dates(
            &mut stmt,
            params![
                code,
                start.format(DATE_FMT).to_string(),
                end.format(DATE_FMT).to_string()
            ],
        )
    }

    async fn bar_on(&self, code: &str, date: NaiveDate) -> Result<Option<DailyBar>> {
        let db = self.db.lock().await;
        let bar = db
            .query_row(
                "SELECT code, date, open, high, low, close, volume
                 FROM daily_bars WHERE code = ?1 AND date = ?2",
                params![code, date.format(DATE_FMT).to_string()],
                Self::row_to_bar,
            )
            .optional()?;
        Ok(bar)
    }
}

// ============================================================================
// Trading Calendar
// ============================================================================

#[async_trait]
impl TradingCalendar for SqliteStore {
    async fn is_trading_day(&self, date: NaiveDate) -> Result<Option<bool>> {
        let db = self.db.lock().await;
        let flag: Option<i64> = db
            .query_row(
                "SELECT has_trading FROM trading_days WHERE date = ?1",
                params![date.format(DATE_FMT).to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.map(|v| v != 0))
    }

    async fn mark_trading_day(&self, date: NaiveDate, has_trading: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "INSERT OR IGNORE INTO trading_days (date, has_trading) VALUES (?1, ?2)",
            params![date.format(DATE_FMT).to_string(), has_trading as i64],
        )?;
        if changed > 0 {
            debug!(date = %date, has_trading, "Calendar date recorded");
        }
        Ok(changed > 0)
    }

    async fn non_trading_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT date FROM trading_days WHERE has_trading = 0 AND date >= ?1 AND date <= ?2",
        )?;
        Self::collect_dates(
            &mut stmt,
            params![start.format(DATE_FMT).to_string(), end.format(DATE_FMT).to_string()],
        )
    }

    async fn known_between(&self, start: NaiveDate, end: NaiveDate) -> Result<BTreeSet<NaiveDate>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT date FROM trading_days WHERE date >= ?1 AND date <= ?2")?;
        Self::collect_dates(
            &mut stmt,
            params![start.format(DATE_FMT).to_string(), end.format(DATE_FMT).to_string()],
        )
    }
}

// ============================================================================
// Symbol Registry
// ============================================================================

#[async_trait]
impl SymbolRegistry for SqliteStore {
    async fn is_known_valid(&self, code: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM symbols WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn is_known_invalid(&self, code: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM invalid_symbols WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn register_valid(&self, symbol: &Symbol) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        tx.execute(
            r#"
            INSERT INTO symbols (code, name, market, updated_at)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                market = excluded.market,
                updated_at = excluded.updated_at
            "#,
            params![symbol.code, symbol.name, symbol.market.as_str()],
        )?;
        tx.execute("DELETE FROM invalid_symbols WHERE code = ?1", params![symbol.code])?;
        tx.commit()?;

        debug!(code = %symbol.code, market = %symbol.market, "Registered symbol");
        Ok(())
    }

    async fn register_invalid(&self, code: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO invalid_symbols (code)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM symbols WHERE code = ?1)",
            params![code],
        )?;
        Ok(())
    }

    async fn list_valid(&self, filter: MarketFilter) -> Result<Vec<Symbol>> {
        let db = self.db.lock().await;
        let symbols = match filter {
            MarketFilter::All => {
                let mut stmt = db.prepare("SELECT code, name, market FROM symbols ORDER BY code")?;
                let rows = stmt
                    .query_map([], Self::row_to_symbol)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            MarketFilter::Only(market) => {
                let mut stmt = db.prepare(
                    "SELECT code, name, market FROM symbols WHERE market = ?1 ORDER BY code",
                )?;
                let rows = stmt
                    .query_map(params![market.as_str()], Self::row_to_symbol)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(symbols)
    }

    async fn get(&self, code: &str) -> Result<Option<Symbol>> {
        let db = self.db.lock().await;
        let symbol = db
            .query_row(
                "SELECT code, name, market FROM symbols WHERE code = ?1",
                params![code],
                Self::row_to_symbol,
            )
            .optional()?;
        Ok(symbol)
    }
}

// ============================================================================
// Watchlist
// ============================================================================

#[async_trait]
impl Watchlist for SqliteStore {
    async fn watch(&self, code: &str, date: NaiveDate) -> Result<()> {
        if !self.is_known_valid(code).await? {
            return Err(taiex_common::Error::NotFound(format!("symbol {} is not registered", code)).into());
        }

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO watchlist (code, watch_date) VALUES (?1, ?2)
             ON CONFLICT(code) DO UPDATE SET watch_date = MAX(watch_date, excluded.watch_date)",
            params![code, date.format(DATE_FMT).to_string()],
        )?;
        Ok(())
    }

    async fn unwatch(&self, code: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let removed = db.execute("DELETE FROM watchlist WHERE code = ?1", params![code])?;
        Ok(removed > 0)
    }

    async fn watched(&self) -> Result<Vec<WatchedSymbol>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT code, watch_date FROM watchlist ORDER BY watch_date DESC, code ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (code, raw_date) = row?;
            let watch_date = NaiveDate::parse_from_str(&raw_date, DATE_FMT)
                .with_context(|| format!("Corrupt watch date for {}: {}", code, raw_date))?;
            entries.push(WatchedSymbol { code, watch_date });
        }
        Ok(entries)
    }
}

// ============================================================================
// Sync Ledger
// ============================================================================

#[async_trait]
impl SyncLedger for SqliteStore {
    async fn record_sync(&self, code: &str, status: SyncStatus, error: Option<&str>) -> Result<()> {
        self.update_sync_metadata(DAILY_BARS, code, status, error).await
    }
}

// ============================================================================
// Tests
// ============================================================================
