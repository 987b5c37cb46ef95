//! Source adapter abstraction for multi-source daily bars.
//!
//! Defines the `SourceAdapter` trait that every external source implements,
//! so the sync engine can fail over between sources without knowing any of
//! their wire formats.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;

use super::rate_limiter::RateLimiter;
use super::{Market, RawBar, SourceKind, Symbol};

// ============================================================================
// Adapter Error
// ============================================================================

/// Whole-request failures. Single malformed rows never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network error (connection failed, timeout, HTTP error status)
    Network(String),
    /// Source asked us to slow down
    RateLimited { retry_after_secs: Option<u64> },
    /// The response as a whole could not be understood
    ParseFailure(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after_secs {
                    write!(f, ", retry after {} seconds", secs)?;
                }
                Ok(())
            }
            Self::ParseFailure(msg) => write!(f, "Parse failure: {}", msg),
        }
    }
}

impl std::error::Error for AdapterError {}

impl AdapterError {
    /// Transient errors are worth trying again on a later run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub(crate) fn network(e: impl fmt::Display) -> Self {
        Self::Network(e.to_string())
    }

    pub(crate) fn parse(e: impl fmt::Display) -> Self {
        Self::ParseFailure(e.to_string())
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Inclusive date range requested from a source in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Number of calendar days covered.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Every calendar date in the window, ascending.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// How a source paginates history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowGranularity {
    /// One request per calendar month
    Monthly,
    /// Arbitrary spans up to `max_days` per request
    Span { max_days: u32 },
}

impl WindowGranularity {
    /// Split `[start, end]` into request windows, ascending.
    pub fn split(&self, start: NaiveDate, end: NaiveDate) -> Vec<DateWindow> {
        let mut windows = Vec::new();
        if start > end {
            return windows;
        }

        let mut cursor = start;
        while cursor <= end {
            let window_end = match self {
                Self::Monthly => last_day_of_month(cursor).min(end),
                Self::Span { max_days } => {
                    (cursor + Duration::days(i64::from((*max_days).max(1)) - 1)).min(end)
                }
            };
            windows.push(DateWindow::new(cursor, window_end));
            cursor = window_end + Duration::days(1);
        }
        windows
    }
}

/// Last calendar day of `date`'s month.
pub(crate) fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

// ============================================================================
// Source Adapter Trait
// ============================================================================

/// Trait for daily bar sources.
///
/// TWSE, TPEx, FinMind and Yahoo all implement this trait so the sync engine
/// can treat them uniformly.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which source this is
    fn kind(&self) -> SourceKind;

    /// Get the adapter name (e.g., "twse", "finmind")
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Failover priority (lower = tried first)
    fn priority(&self) -> u8;

    /// Whether this source carries symbols of `market`
    fn serves(&self, market: Market) -> bool;

    /// Request pagination
    fn granularity(&self) -> WindowGranularity;

    /// Fetch one window. Pacing is applied inside the adapter.
    async fn fetch_window(
        &self,
        symbol: &Symbol,
        window: DateWindow,
    ) -> Result<Vec<RawBar>, AdapterError>;
}

/// Whole-market single-day snapshot.
#[async_trait]
pub trait MarketSnapshotSource: Send + Sync {
    /// Every symbol's bar for `date`, as `(code, bar)`.
    async fn fetch_market_day(&self, date: NaiveDate)
        -> Result<Vec<(String, RawBar)>, AdapterError>;
}

/// Lazily fetch `[start, end]` for `symbol`, one adapter window per poll.
///
/// Bars outside the range are dropped. A window that fails yields one `Err`
/// and the stream moves on to the next window, so the caller decides whether
/// to stop. Restart with a later `start` to resume.
pub fn fetch_range<'a>(
    adapter: &'a dyn SourceAdapter,
    symbol: &'a Symbol,
    start: NaiveDate,
    end: NaiveDate,
) -> BoxStream<'a, Result<RawBar, AdapterError>> {
    let windows = adapter.granularity().split(start, end);

    stream::iter(windows)
        .then(move |window| adapter.fetch_window(symbol, window))
        .flat_map(move |result| {
            let items: Vec<Result<RawBar, AdapterError>> = match result {
                Ok(bars) => bars
                    .into_iter()
                    .filter(|bar| bar.date >= start && bar.date <= end)
                    .map(Ok)
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
}

// ============================================================================
// HTTP helpers shared by adapters
// ============================================================================

/// Build the HTTP client used by every adapter.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)")
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Run `call` after the limiter grants a slot, adjusting backoff on the outcome.
pub(crate) async fn paced<T, F>(limiter: &RateLimiter, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    limiter.acquire().await;
    let result = call.await;
    match &result {
        Ok(_) => limiter.reset_backoff(),
        Err(AdapterError::RateLimited { .. }) => limiter.penalize(),
        Err(_) => {}
    }
    result
}

/// Send a request and return the body, mapping HTTP failures.
pub(crate) async fn fetch_body(request: reqwest::RequestBuilder) -> Result<String, AdapterError> {
    let response = request.send().await.map_err(AdapterError::network)?;
    let status = response.status();

    // FinMind reports an exhausted quota as 402
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::PAYMENT_REQUIRED
    {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        return Err(AdapterError::RateLimited { retry_after_secs });
    }

    if !status.is_success() {
        return Err(AdapterError::Network(format!("HTTP {}", status)));
    }

    response.text().await.map_err(AdapterError::network)
}

/// Decode a JSON body.
pub(crate) fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T, AdapterError> {
    serde_json::from_str(body).map_err(|e| AdapterError::ParseFailure(format!("Invalid JSON: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================
