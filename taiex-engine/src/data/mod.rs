//! Market data module for Taiwan-listed equities.
//!
//! Provides symbol discovery, the trading calendar, daily-bar storage and
//! the synchronization engine that backfills bars from several external
//! sources with automatic failover.
//!
//! # Data Sources
//! - **TWSE** (official, primary board): monthly JSON per symbol, ROC dates
//! - **TPEx** (official, secondary board): monthly `aaData` tables, ROC dates
//! - **FinMind** (vendor aggregator): ISO dates, spans up to a year
//! - **Yahoo** (secondary vendor): chart API, unix timestamps

mod calendar;
mod control;
mod finmind;
mod membership;
mod provider;
mod rate_limiter;
mod registry;
mod store;
mod tpex;
mod twse;
mod verify;
mod wire;
mod yahoo;
pub mod local_storage;
pub mod sync;

pub use calendar::{effective_end_date, fill_calendar, taipei_now, taipei_offset, CalendarFill};
pub use control::{Flow, RunState, SyncControl};
pub use finmind::{FinMindAdapter, FinMindNameDirectory};
pub use membership::{ListingEntry, MembershipSource, NameDirectory, TpexListing, TwseListing};
pub use provider::{
    fetch_range, http_client, AdapterError, DateWindow, MarketSnapshotSource, SourceAdapter,
    WindowGranularity,
};
pub use rate_limiter::{shared_limiter, RateLimiter, SharedRateLimiter};
pub use registry::{code_space, refresh_names, NameRefresh, ProbeOutcome, ProbeSummary, SymbolProber};
pub use store::{
    BarStore, MarketStore, SymbolRegistry, SyncLedger, TradingCalendar, UpsertOutcome, WatchedSymbol,
    Watchlist,
};
pub use tpex::TpexAdapter;
pub use twse::TwseAdapter;
pub use verify::{verify_range, BarValues, Discrepancy};
pub use yahoo::YahooAdapter;
pub use local_storage::{SqliteStore, StoreStats, SyncMetadata, SyncStatus, DAILY_BARS};
pub use sync::{
    CalendarInference, MarketDayOutcome, SyncConfig, SyncEngine, SyncPhase, SyncProgress,
    SyncSummary, SymbolOutcome,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Markets & Symbols
// ============================================================================

/// Board a symbol trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    /// Taiwan Stock Exchange (primary board)
    Twse,
    /// Taipei Exchange (secondary board, OTC)
    Tpex,
    /// Listed somewhere we could not classify
    Unknown,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twse => "twse",
            Self::Tpex => "tpex",
            Self::Unknown => "unknown",
        }
    }

    /// Suffix used by charting tools and the Yahoo chart API.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Self::Twse => Some(".TW"),
            Self::Tpex => Some(".TWO"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twse" | "tse" | "上市" => Ok(Self::Twse),
            "tpex" | "otc" | "上櫃" => Ok(Self::Tpex),
            "unknown" | "" => Ok(Self::Unknown),
            _ => Err(format!("Unknown market: {}", s)),
        }
    }
}

/// Universe selector for registry listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarketFilter {
    #[default]
    All,
    Only(Market),
}

impl MarketFilter {
    pub fn matches(&self, market: Market) -> bool {
        match self {
            Self::All => true,
            Self::Only(m) => *m == market,
        }
    }
}

impl FromStr for MarketFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

/// A registered, tradable symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Four-digit code (e.g., "2330")
    pub code: String,
    /// Display name
    pub name: String,
    /// Board classification
    pub market: Market,
}

impl Symbol {
    pub fn new(code: impl Into<String>, name: impl Into<String>, market: Market) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            market,
        }
    }

    /// Code with its market suffix, e.g. "2330.TW".
    pub fn suffixed_code(&self) -> String {
        match self.market.suffix() {
            Some(suffix) => format!("{}{}", self.code, suffix),
            None => self.code.clone(),
        }
    }
}

/// True when `code` is exactly four ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 4 && code.bytes().all(|b| b.is_ascii_digit())
}

// ============================================================================
// Bars
// ============================================================================

/// Origin of a raw bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Twse,
    Tpex,
    FinMind,
    Yahoo,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twse => "twse",
            Self::Tpex => "tpex",
            Self::FinMind => "finmind",
            Self::Yahoo => "yahoo",
        }
    }

    /// Trust rank when sources disagree (higher wins). Exchanges outrank vendors.
    pub fn authority(&self) -> u8 {
        match self {
            Self::Twse | Self::Tpex => 3,
            Self::FinMind => 2,
            Self::Yahoo => 1,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twse" => Ok(Self::Twse),
            "tpex" => Ok(Self::Tpex),
            "finmind" => Ok(Self::FinMind),
            "yahoo" => Ok(Self::Yahoo),
            _ => Err(format!("Unknown source: {}", s)),
        }
    }
}

/// A bar as produced by a source adapter: western date, volume in lots.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub source: SourceKind,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in lots (1 lot = 1000 shares)
    pub volume: u64,
}

/// Why a raw bar was refused by the store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BarRejected {
    #[error("non-finite price on {0}")]
    NonFinite(NaiveDate),
    #[error("negative price on {0}")]
    Negative(NaiveDate),
    #[error("high {high} below low {low} on {date}")]
    Inverted { date: NaiveDate, high: f64, low: f64 },
}

impl RawBar {
    /// Validate and normalize into a storable bar (prices rounded to 2dp).
    pub fn into_daily(self, code: &str) -> Result<DailyBar, BarRejected> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(BarRejected::NonFinite(self.date));
        }
        if prices.iter().any(|p| *p < 0.0) {
            return Err(BarRejected::Negative(self.date));
        }
        if self.high < self.low {
            return Err(BarRejected::Inverted {
                date: self.date,
                high: self.high,
                low: self.low,
            });
        }

        Ok(DailyBar {
            code: code.to_string(),
            date: self.date,
            open: round2(self.open),
            high: round2(self.high),
            low: round2(self.low),
            close: round2(self.close),
            volume: self.volume,
        })
    }
}

/// One stored trading day for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub code: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in lots
    pub volume: u64,
}

/// Round a price to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(open: f64, high: f64, low: f64, close: f64) -> RawBar {
        RawBar {
            source: SourceKind::Twse,
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open,
            high,
            low,
            close,
            volume: 10,
        }
    }

    #[test]
    fn test_code_validation() {
        assert!(is_valid_code("0050"));
        assert!(is_valid_code("2330"));
        assert!(!is_valid_code("233"));
        assert!(!is_valid_code("23300"));
        assert!(!is_valid_code("23A0"));
    }

    #[test]
    fn test_market_parse_and_suffix() {
        assert_eq!("TWSE".parse::<Market>().unwrap(), Market::Twse);
        assert_eq!("otc".parse::<Market>().unwrap(), Market::Tpex);
        assert!("nyse".parse::<Market>().is_err());
        assert_eq!(Market::Tpex.suffix(), Some(".TWO"));

        let symbol = Symbol::new("6488", "GlobalWafers", Market::Tpex);
        assert_eq!(symbol.suffixed_code(), "6488.TWO");
    }

    #[test]
    fn test_market_filter() {
        assert!(MarketFilter::All.matches(Market::Tpex));
        assert!(!MarketFilter::Only(Market::Twse).matches(Market::Tpex));
        assert_eq!("all".parse::<MarketFilter>().unwrap(), MarketFilter::All);
        assert_eq!(
            "tpex".parse::<MarketFilter>().unwrap(),
            MarketFilter::Only(Market::Tpex)
        );
    }

    #[test]
    fn test_authority_prefers_exchanges() {
        assert!(SourceKind::Twse.authority() > SourceKind::FinMind.authority());
        assert!(SourceKind::Tpex.authority() > SourceKind::Yahoo.authority());
        assert!(SourceKind::FinMind.authority() > SourceKind::Yahoo.authority());
    }

    #[test]
    fn test_into_daily_rounds_prices() {
        let bar = raw(10.004, 10.456, 9.999, 10.125).into_daily("2330").unwrap();
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.high, 10.46);
        assert_eq!(bar.low, 10.0);
        assert_eq!(bar.code, "2330");
    }

    #[test]
    fn test_into_daily_rejects_bad_rows() {
        assert!(matches!(
            raw(10.0, 9.0, 11.0, 10.0).into_daily("2330"),
            Err(BarRejected::Inverted { .. })
        ));
        assert!(matches!(
            raw(-1.0, 9.0, 8.0, 9.0).into_daily("2330"),
            Err(BarRejected::Negative(_))
        ));
        assert!(matches!(
            raw(f64::NAN, 9.0, 8.0, 9.0).into_daily("2330"),
            Err(BarRejected::NonFinite(_))
        ));
    }
}
