//! Storage capabilities consumed by the sync engine and the screener.
//!
//! The core only depends on these traits; `SqliteStore` implements all of
//! them over a single database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::local_storage::SyncStatus;
use super::{DailyBar, MarketFilter, Symbol, SourceKind};

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was written
    Inserted,
    /// A row for (code, date) already existed; nothing changed
    AlreadyPresent,
}

/// Append-only daily bar storage keyed by (code, date).
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert `bar` unless a bar for the same (code, date) exists. Never overwrites.
    async fn upsert_if_absent(&self, bar: &DailyBar, source: SourceKind) -> Result<UpsertOutcome>;

    /// Bars in `[start, end]`, ascending by date.
    async fn get_range(&self, code: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyBar>>;

    /// The `n` most recent bars, most recent first.
    async fn latest_n(&self, code: &str, n: usize) -> Result<Vec<DailyBar>>;

    /// Dates with a stored bar in `[start, end]`.
    async fn dates_between(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>>;

    /// The bar stored for exactly `date`.
    async fn bar_on(&self, code: &str, date: NaiveDate) -> Result<Option<DailyBar>>;
}

/// Per-date "did the market trade" oracle.
#[async_trait]
pub trait TradingCalendar: Send + Sync {
    /// `None` when the date has never been observed.
    async fn is_trading_day(&self, date: NaiveDate) -> Result<Option<bool>>;

    /// Record a date. First writer wins; returns whether a row was created.
    async fn mark_trading_day(&self, date: NaiveDate, has_trading: bool) -> Result<bool>;

    /// Dates known to be closed in `[start, end]`.
    async fn non_trading_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>>;

    /// Dates with any calendar entry in `[start, end]`.
    async fn known_between(&self, start: NaiveDate, end: NaiveDate) -> Result<BTreeSet<NaiveDate>>;
}

/// Known-valid and known-invalid symbol codes.
///
/// A code is never in both sets.
#[async_trait]
pub trait SymbolRegistry: Send + Sync {
    async fn is_known_valid(&self, code: &str) -> Result<bool>;

    async fn is_known_invalid(&self, code: &str) -> Result<bool>;

    /// Upsert name and market, moving the code out of the invalid set.
    async fn register_valid(&self, symbol: &Symbol) -> Result<()>;

    /// Record a code as listed nowhere. No-op if the code is already valid.
    async fn register_invalid(&self, code: &str) -> Result<()>;

    /// Valid symbols ordered by code.
    async fn list_valid(&self, filter: MarketFilter) -> Result<Vec<Symbol>>;

    async fn get(&self, code: &str) -> Result<Option<Symbol>>;
}

/// A user-tracked symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedSymbol {
    pub code: String,
    pub watch_date: NaiveDate,
}

/// User watchlist. The latest watch date per code wins.
#[async_trait]
pub trait Watchlist: Send + Sync {
    /// Fails with `Error::NotFound` when `code` is not a known-valid symbol.
    async fn watch(&self, code: &str, date: NaiveDate) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn unwatch(&self, code: &str) -> Result<bool>;

    /// Entries ordered by watch date, newest first.
    async fn watched(&self) -> Result<Vec<WatchedSymbol>>;
}

/// Records the outcome of each symbol sync.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    async fn record_sync(&self, code: &str, status: SyncStatus, error: Option<&str>) -> Result<()>;
}

/// Everything the sync engine needs from one backing store.
pub trait MarketStore: BarStore + TradingCalendar + SymbolRegistry + SyncLedger {}

impl<T> MarketStore for T where T: BarStore + TradingCalendar + SymbolRegistry + SyncLedger {}
