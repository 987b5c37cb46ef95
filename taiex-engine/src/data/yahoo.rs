//! Yahoo Finance chart API adapter.
//!
//! Taiwan symbols are addressed with a board suffix (`2330.TW`, `6488.TWO`).
//! Timestamps mark the session open and are converted to Taipei dates;
//! volume is in shares.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::calendar::taipei_offset;
use super::provider::{
    decode_json, fetch_body, http_client, paced, AdapterError, DateWindow, SourceAdapter,
    WindowGranularity,
};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::wire::taipei_date_from_unix;
use super::{Market, RawBar, SourceKind, Symbol};

const YAHOO_BASE: &str = "https://query1.finance.yahoo.com";

const CHART_ENDPOINT: &str = "/v8/finance/chart";

/// Ten years per request
const MAX_SPAN_DAYS: u32 = 3650;

const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Secondary vendor used as the last fallback.
pub struct YahooAdapter {
    client: reqwest::Client,
    base_url: String,
    priority: u8,
    rate_limiter: SharedRateLimiter,
}

impl YahooAdapter {
    pub fn new(rate_limiter: SharedRateLimiter) -> Self {
        Self {
            client: http_client(),
            base_url: YAHOO_BASE.to_string(),
            priority: 3,
            rate_limiter,
        }
    }

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
        let settings = &config.sources.yahoo;
        if !settings.enabled {
            return None;
        }

        let interval = if settings.min_interval_ms > 0 {
            settings.min_interval_ms
        } else {
            DEFAULT_INTERVAL_MS
        };
        let limiter = shared_limiter(
            "yahoo",
            Duration::from_millis(interval),
            settings.max_backoff_level,
        );

        let mut adapter = Self::new(limiter).with_priority(settings.priority);
        if let Some(url) = &settings.base_url {
            adapter = adapter.with_base_url(url.as_str());
        }
        Some(adapter)
    }
}

/// Unix seconds of Taipei midnight on `date`.
fn taipei_midnight(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp() - i64::from(taipei_offset().local_minus_utc()))
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for YahooAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Yahoo
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn serves(&self, market: Market) -> bool {
        market.suffix().is_some()
    }

    fn granularity(&self) -> WindowGranularity {
        WindowGranularity::Span {
            max_days: MAX_SPAN_DAYS,
        }
    }

    async fn fetch_window(
        &self,
        symbol: &Symbol,
        window: DateWindow,
    ) -> Result<Vec<RawBar>, AdapterError> {
        let url = format!("{}{}/{}", self.base_url, CHART_ENDPOINT, symbol.suffixed_code());
        let query = [
            ("period1", taipei_midnight(window.start).to_string()),
            (
                "period2",
                taipei_midnight(window.end + ChronoDuration::days(1)).to_string(),
            ),
            ("interval", "1d".to_string()),
        ];
        debug!(url = %url, start = %window.start, end = %window.end, "Fetching chart from Yahoo");

        let response: ChartResponse = paced(&self.rate_limiter, async {
            let body = fetch_body(self.client.get(&url).query(&query)).await?;
            decode_json(&body)
        })
        .await?;

        if let Some(error) = response.chart.error.filter(|e| !e.is_null()) {
            return Err(AdapterError::ParseFailure(format!("Yahoo chart error: {}", error)));
        }

        let Some(result) = response.chart.result.into_iter().flatten().next() else {
            return Ok(Vec::new());
        };
        let timestamps = result.timestamp.unwrap_or_default();
        let Some(quote) = result.indicators.quote.into_iter().next() else {
            return Ok(Vec::new());
        };

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let at = |series: &[Option<f64>]| series.get(i).copied().flatten();
            let parsed = (|| {
                Some(RawBar {
                    source: SourceKind::Yahoo,
                    date: taipei_date_from_unix(ts)?,
                    open: at(&quote.open)?,
                    high: at(&quote.high)?,
                    low: at(&quote.low)?,
                    close: at(&quote.close)?,
                    volume: (at(&quote.volume)?.max(0.0) / 1000.0).round() as u64,
                })
            })();

            match parsed {
                Some(bar) if window.contains(bar.date) => bars.push(bar),
                Some(_) => {}
                None => debug!(code = %symbol.code, ts, "Skipping incomplete Yahoo row"),
            }
        }

        Ok(bars)
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartData,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn adapter(server: &MockServer) -> YahooAdapter {
        YahooAdapter::new(shared_limiter("yahoo", Duration::from_millis(1), 0))
            .with_base_url(server.uri())
    }

    #[test]
    fn test_taipei_midnight() {
        // 2024-01-02 00:00 +08:00 == 2024-01-01 16:00 UTC
        assert_eq!(taipei_midnight(day(2024, 1, 2)), 1_704_124_800);
    }

    #[tokio::test]
    async fn test_fetch_window_uses_suffix_and_skips_nulls() {
        // 09:00 Taipei on Jan 2, 3 and 4
        let body = r#"{
            "chart": {
                "result": [{
                    "meta": {"currency": "TWD", "symbol": "6488.TWO"},
                    "timestamp": [1704157200, 1704243600, 1704330000],
                    "indicators": {"quote": [{
                        "open": [560.0, null, 571.0],
                        "high": [571.0, 575.0, 574.0],
                        "low": [558.0, 566.0, 565.0],
                        "close": [570.0, 566.0, 568.5],
                        "volume": [1234000, 987000, 1500400]
                    }]}
                }],
                "error": null
            }
        }"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/6488.TWO"))
            .and(query_param("interval", "1d"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let symbol = Symbol::new("6488", "環球晶", Market::Tpex);
        let window = DateWindow::new(day(2024, 1, 1), day(2024, 1, 31));
        let bars = adapter(&server).fetch_window(&symbol, window).await.unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, day(2024, 1, 2));
        assert_eq!(bars[0].volume, 1234);
        assert_eq!(bars[1].date, day(2024, 1, 4));
        assert_eq!(bars[1].volume, 1500);
    }

    #[tokio::test]
    async fn test_chart_error_is_parse_failure() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}}}"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let symbol = Symbol::new("9998", "", Market::Twse);
        let window = DateWindow::new(day(2024, 1, 1), day(2024, 1, 31));
        let err = adapter(&server).fetch_window(&symbol, window).await.unwrap_err();
        assert!(matches!(err, AdapterError::ParseFailure(_)));
    }

    #[test]
    fn test_serves_classified_markets() {
        let source = YahooAdapter::new(shared_limiter("yahoo", Duration::from_millis(1), 0));
        assert!(source.serves(Market::Twse));
        assert!(source.serves(Market::Tpex));
        assert!(!source.serves(Market::Unknown));
    }
}
