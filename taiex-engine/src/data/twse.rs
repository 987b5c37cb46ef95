//! TWSE (Taiwan Stock Exchange) adapter for primary-board daily bars.
//!
//! # Endpoints
//! - `exchangeReport/STOCK_DAY`: one symbol, one calendar month per request
//! - `exchangeReport/MI_INDEX`: every listed symbol for one trading day
//!
//! # Format
//! Dates are ROC (`113/01/02`), numbers are comma-grouped strings and `--`
//! marks a session with no trade. Volume is reported in shares.
//!
//! # Rate Limits
//! The exchange serves an HTML block page instead of JSON when hit too often,
//! so requests are paced at one every few seconds.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::provider::{
    decode_json, fetch_body, http_client, paced, AdapterError, DateWindow, MarketSnapshotSource,
    SourceAdapter, WindowGranularity,
};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::wire::{cell, parse_count, parse_number, parse_roc_date, shares_to_lots};
use super::{is_valid_code, Market, RawBar, SourceKind, Symbol};

// ============================================================================
// Constants
// ============================================================================

/// TWSE website base URL
const TWSE_BASE: &str = "https://www.twse.com.tw";

/// Per-symbol monthly endpoint
const STOCK_DAY_ENDPOINT: &str = "/exchangeReport/STOCK_DAY";

/// Whole-market daily endpoint
const MI_INDEX_ENDPOINT: &str = "/exchangeReport/MI_INDEX";

/// Marker in the MI_INDEX table title for the per-stock quote table
const STOCK_TABLE_MARKER: &str = "個股";

/// Default pacing between requests
const DEFAULT_INTERVAL_MS: u64 = 3000;

// ============================================================================
// TWSE Adapter
// ============================================================================

/// Adapter for the official primary-board exchange.
pub struct TwseAdapter {
    /// HTTP client
    client: reqwest::Client,
    /// Base URL, overridable for tests
    base_url: String,
    /// Failover priority
    priority: u8,
    /// Shared pacing for every TWSE request
    rate_limiter: SharedRateLimiter,
}

impl TwseAdapter {
    /// Create an adapter that paces through `rate_limiter`.
    pub fn new(rate_limiter: SharedRateLimiter) -> Self {
        Self {
            client: http_client(),
            base_url: TWSE_BASE.to_string(),
            priority: 1,
            rate_limiter,
        }
    }

    /// Point the adapter at another host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Create from config. Returns `None` when the source is disabled.
    pub fn from_config(config: &taiex_common::Config) -> Option<Self> {
        let settings = &config.sources.twse;
        if !settings.enabled {
            return None;
        }

        let interval = if settings.min_interval_ms > 0 {
            settings.min_interval_ms
        } else {
            DEFAULT_INTERVAL_MS
        };
        let limiter = shared_limiter(
            "twse",
            Duration::from_millis(interval),
            settings.max_backoff_level,
        );

        let mut adapter = Self::new(limiter).with_priority(settings.priority);
        if let Some(url) = &settings.base_url {
            adapter = adapter.with_base_url(url.as_str());
        }
        Some(adapter)
    }

    /// The limiter this adapter paces through.
    pub fn rate_limiter(&self) -> &SharedRateLimiter {
        &self.rate_limiter
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, ?query, "Fetching from TWSE");

        paced(&self.rate_limiter, async {
            let body = fetch_body(self.client.get(&url).query(query)).await?;
            if body.trim_start().starts_with('<') {
                // Block page instead of JSON
                return Err(AdapterError::RateLimited {
                    retry_after_secs: None,
                });
            }
            decode_json(&body)
        })
        .await
    }
}

#[async_trait]
impl SourceAdapter for TwseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Twse
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn serves(&self, market: Market) -> bool {
        market == Market::Twse
    }

    fn granularity(&self) -> WindowGranularity {
        WindowGranularity::Monthly
    }

    async fn fetch_window(
        &self,
        symbol: &Symbol,
        window: DateWindow,
    ) -> Result<Vec<RawBar>, AdapterError> {
        let query = [
            ("response", "json".to_string()),
            ("date", window.start.format("%Y%m01").to_string()),
            ("stockNo", symbol.code.clone()),
        ];
        let response: StockDayResponse = self.get_json(STOCK_DAY_ENDPOINT, &query).await?;

        if response.stat != "OK" {
            debug!(code = %symbol.code, stat = %response.stat, "No TWSE data for month");
            return Ok(Vec::new());
        }

        let bars = response
            .data
            .iter()
            .filter_map(|row| {
                let bar = parse_stock_day_row(row);
                if bar.is_none() {
                    debug!(code = %symbol.code, ?row, "Skipping malformed TWSE row");
                }
                bar
            })
            .filter(|bar| window.contains(bar.date))
            .collect();

        Ok(bars)
    }
}

#[async_trait]
impl MarketSnapshotSource for TwseAdapter {
    async fn fetch_market_day(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(String, RawBar)>, AdapterError> {
        let query = [
            ("response", "json".to_string()),
            ("date", date.format("%Y%m%d").to_string()),
            ("type", "ALL".to_string()),
        ];
        let response: MiIndexResponse = self.get_json(MI_INDEX_ENDPOINT, &query).await?;

        if response.stat != "OK" {
            debug!(%date, stat = %response.stat, "No TWSE market snapshot");
            return Ok(Vec::new());
        }

        let rows = response
            .tables
            .iter()
            .find(|t| {
                t.title
                    .as_deref()
                    .is_some_and(|title| title.contains(STOCK_TABLE_MARKER))
            })
            .map(|t| &t.data)
            .or(response.data9.as_ref());

        let Some(rows) = rows else {
            return Err(AdapterError::ParseFailure(
                "MI_INDEX response has no per-stock table".into(),
            ));
        };

        Ok(rows
            .iter()
            .filter_map(|row| parse_mi_index_row(row, date))
            .collect())
    }
}

// ============================================================================
// Row Parsing
// ============================================================================

/// `[ROC date, shares, value, open, high, low, close, change, transactions]`
fn parse_stock_day_row(row: &[Value]) -> Option<RawBar> {
    let date = parse_roc_date(&cell(row, 0)?)?;
    let shares = parse_count(&cell(row, 1)?)?;

    Some(RawBar {
        source: SourceKind::Twse,
        date,
        open: parse_number(&cell(row, 3)?)?,
        high: parse_number(&cell(row, 4)?)?,
        low: parse_number(&cell(row, 5)?)?,
        close: parse_number(&cell(row, 6)?)?,
        volume: shares_to_lots(shares),
    })
}

/// `[code, name, shares, transactions, value, open, high, low, close, ...]`
fn parse_mi_index_row(row: &[Value], date: NaiveDate) -> Option<(String, RawBar)> {
    let code = cell(row, 0)?;
    if !is_valid_code(&code) {
        return None;
    }
    let shares = parse_count(&cell(row, 2)?)?;

    let bar = RawBar {
        source: SourceKind::Twse,
        date,
        open: parse_number(&cell(row, 5)?)?,
        high: parse_number(&cell(row, 6)?)?,
        low: parse_number(&cell(row, 7)?)?,
        close: parse_number(&cell(row, 8)?)?,
        volume: shares_to_lots(shares),
    };
    Some((code, bar))
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StockDayResponse {
    stat: String,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct MiIndexResponse {
    stat: String,
    #[serde(default)]
    tables: Vec<MiIndexTable>,
    /// Layout used before the `tables` array was introduced
    #[serde(default)]
    data9: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Deserialize)]
struct MiIndexTable {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn adapter(server: &MockServer) -> TwseAdapter {
        TwseAdapter::new(shared_limiter("twse", Duration::from_millis(1), 2))
            .with_base_url(server.uri())
    }

    fn tsmc() -> Symbol {
        Symbol::new("2330", "台積電", Market::Twse)
    }

    const STOCK_DAY_BODY: &str = r#"{
        "stat": "OK",
        "date": "20240101",
        "data": [
            ["113/01/02", "25,387,941", "15,000,000,000", "590.00", "593.00", "589.00", "593.00", "+7.00", "26,181"],
            ["113/01/03", "37,146,032", "21,000,000,000", "584.00", "585.00", "576.00", "578.00", "-15.00", "51,330"],
            ["113/01/04", "0", "0", "--", "--", "--", "--", " 0.00", "0"],
            ["113/01/05", "21,000,000"]
        ]
    }"#;

    #[tokio::test]
    async fn test_fetch_window_parses_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_DAY_ENDPOINT))
            .and(query_param("stockNo", "2330"))
            .and(query_param("date", "20240101"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STOCK_DAY_BODY))
            .mount(&server)
            .await;

        let source = adapter(&server);
        let window = DateWindow::new(day(2024, 1, 1), day(2024, 1, 31));
        let bars = source.fetch_window(&tsmc(), window).await.unwrap();

        // No-trade and truncated rows are skipped
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, day(2024, 1, 2));
        assert_eq!(bars[0].close, 593.0);
        assert_eq!(bars[0].volume, 25_388);
        assert_eq!(bars[1].low, 576.0);
    }

    #[tokio::test]
    async fn test_fetch_window_filters_to_window() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_DAY_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_string(STOCK_DAY_BODY))
            .mount(&server)
            .await;

        let source = adapter(&server);
        let window = DateWindow::new(day(2024, 1, 3), day(2024, 1, 31));
        let bars = source.fetch_window(&tsmc(), window).await.unwrap();

        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].date, day(2024, 1, 3));
    }

    #[tokio::test]
    async fn test_no_data_stat_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_DAY_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"stat": "很抱歉，沒有符合條件的資料!"}"#),
            )
            .mount(&server)
            .await;

        let source = adapter(&server);
        let window = DateWindow::new(day(2009, 1, 1), day(2009, 1, 31));
        assert!(source.fetch_window(&tsmc(), window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_page_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_DAY_ENDPOINT))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>請稍後再試</body></html>"),
            )
            .mount(&server)
            .await;

        let source = adapter(&server);
        let window = DateWindow::new(day(2024, 1, 1), day(2024, 1, 31));
        let err = source.fetch_window(&tsmc(), window).await.unwrap_err();

        assert!(err.is_rate_limited());
        assert_eq!(source.rate_limiter().current_interval(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_invalid_json_is_parse_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_DAY_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"stat\": "))
            .mount(&server)
            .await;

        let source = adapter(&server);
        let window = DateWindow::new(day(2024, 1, 1), day(2024, 1, 31));
        let err = source.fetch_window(&tsmc(), window).await.unwrap_err();
        assert!(matches!(err, AdapterError::ParseFailure(_)));
    }

    #[tokio::test]
    async fn test_market_day_snapshot() {
        let body = r#"{
            "stat": "OK",
            "tables": [
                {"title": "113年01月02日 大盤統計資訊", "data": [["發行量加權股價指數", "17,853.76"]]},
                {"title": "113年01月02日每日收盤行情(全部)個股", "data": [
                    ["0050", "元大台灣50", "12,345,000", "8,000", "1,600,000,000", "130.00", "131.00", "129.50", "130.80"],
                    ["2330", "台積電", "25,387,941", "26,181", "15,000,000,000", "590.00", "593.00", "589.00", "593.00"],
                    ["030001", "元大權證", "1,000", "1", "100", "1.00", "1.00", "1.00", "1.00"],
                    ["9999", "停牌", "0", "0", "0", "--", "--", "--", "--"]
                ]}
            ]
        }"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MI_INDEX_ENDPOINT))
            .and(query_param("date", "20240102"))
            .and(query_param("type", "ALL"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let source = adapter(&server);
        let rows = source.fetch_market_day(day(2024, 1, 2)).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "0050");
        assert_eq!(rows[0].1.volume, 12_345);
        assert_eq!(rows[1].0, "2330");
        assert_eq!(rows[1].1.date, day(2024, 1, 2));
    }

    #[tokio::test]
    async fn test_market_day_legacy_layout() {
        let body = r#"{
            "stat": "OK",
            "data9": [["1101", "台泥", "9,000,000", "4,000", "300,000,000", "33.00", "33.50", "32.80", "33.20"]]
        }"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(MI_INDEX_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let rows = adapter(&server).fetch_market_day(day(2015, 6, 1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.close, 33.2);
    }

    #[test]
    fn test_from_config_respects_enabled() {
        let mut config = taiex_common::Config::default();
        assert!(TwseAdapter::from_config(&config).is_some());

        config.sources.twse.enabled = false;
        assert!(TwseAdapter::from_config(&config).is_none());
    }
}
