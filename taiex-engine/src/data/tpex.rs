//! TPEx (Taipei Exchange) adapter for secondary-board daily bars.
//!
//! The per-symbol monthly table comes back as `aaData` rows shaped like the
//! TWSE ones, except that volume is already in thousands of shares.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::provider::{
    decode_json, fetch_body, http_client, paced, AdapterError, DateWindow, SourceAdapter,
    WindowGranularity,
};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::wire::{cell, parse_count, parse_number, parse_roc_date, roc_month_param};
use super::{Market, RawBar, SourceKind, Symbol};

const TPEX_BASE: &str = "https://www.tpex.org.tw";

const DAILY_TRADING_ENDPOINT: &str = "/web/stock/aftertrading/daily_trading_info/st43_result.php";

const DEFAULT_INTERVAL_MS: u64 = 3000;

/// Adapter for the official secondary-board (OTC) exchange.
pub struct TpexAdapter {
    client: reqwest::Client,
    base_url: String,
    priority: u8,
    rate_limiter: SharedRateLimiter,
}

impl TpexAdapter {
    pub fn new(rate_limiter: SharedRateLimiter) -> Self {
        Self {
            client: http_client(),
            base_url: TPEX_BASE.to_string(),
            priority: 1,
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
        let settings = &config.sources.tpex;
        if !settings.enabled {
            return None;
        }

        let interval = if settings.min_interval_ms > 0 {
            settings.min_interval_ms
        } else {
            DEFAULT_INTERVAL_MS
        };
        let limiter = shared_limiter(
            "tpex",
            Duration::from_millis(interval),
            settings.max_backoff_level,
        );

        let mut adapter = Self::new(limiter).with_priority(settings.priority);
        if let Some(url) = &settings.base_url {
            adapter = adapter.with_base_url(url.as_str());
        }
        Some(adapter)
    }

    pub fn rate_limiter(&self) -> &SharedRateLimiter {
        &self.rate_limiter
    }
}

#[async_trait]
impl SourceAdapter for TpexAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Tpex
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn serves(&self, market: Market) -> bool {
        market == Market::Tpex
    }

    fn granularity(&self) -> WindowGranularity {
        WindowGranularity::Monthly
    }

    async fn fetch_window(
        &self,
        symbol: &Symbol,
        window: DateWindow,
    ) -> Result<Vec<RawBar>, AdapterError> {
        let url = format!("{}{}", self.base_url, DAILY_TRADING_ENDPOINT);
        let query = [
            ("l", "zh-tw".to_string()),
            ("d", roc_month_param(window.start)),
            ("stkno", symbol.code.clone()),
        ];
        debug!(url = %url, code = %symbol.code, month = %query[1].1, "Fetching from TPEx");

        let response: DailyTradingResponse = paced(&self.rate_limiter, async {
            let body = fetch_body(self.client.get(&url).query(&query)).await?;
            if body.trim_start().starts_with('<') {
                return Err(AdapterError::RateLimited {
                    retry_after_secs: None,
                });
            }
            decode_json(&body)
        })
        .await?;

        let rows = if !response.aa_data.is_empty() {
            response.aa_data
        } else {
            response
                .tables
                .into_iter()
                .next()
                .map(|t| t.data)
                .unwrap_or_default()
        };

        let bars = rows
            .iter()
            .filter_map(|row| {
                let bar = parse_row(row);
                if bar.is_none() {
                    debug!(code = %symbol.code, ?row, "Skipping malformed TPEx row");
                }
                bar
            })
            .filter(|bar| window.contains(bar.date))
            .collect();

        Ok(bars)
    }
}

/// `[ROC date, lots, value, open, high, low, close, change, transactions]`
fn parse_row(row: &[Value]) -> Option<RawBar> {
    Some(RawBar {
        source: SourceKind::Tpex,
        date: parse_roc_date(&cell(row, 0)?)?,
        open: parse_number(&cell(row, 3)?)?,
        high: parse_number(&cell(row, 4)?)?,
        low: parse_number(&cell(row, 5)?)?,
        close: parse_number(&cell(row, 6)?)?,
        volume: parse_count(&cell(row, 1)?)?,
    })
}

#[derive(Debug, Deserialize)]
struct DailyTradingResponse {
    #[serde(default, rename = "aaData")]
    aa_data: Vec<Vec<Value>>,
    /// Newer responses wrap the same rows in `tables`
    #[serde(default)]
    tables: Vec<TpexTable>,
}

#[derive(Debug, Deserialize)]
struct TpexTable {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}
