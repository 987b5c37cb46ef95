//! FinMind API adapter.
//!
//! # API Documentation
//! <https://finmind.github.io/>
//!
//! # Datasets
//! - `TaiwanStockPrice`: daily bars for both boards, ISO dates, volume in shares
//! - `TaiwanStockInfo`: code, name and board of every listed symbol
//!
//! # Rate Limits
//! Anonymous use is heavily throttled; a token raises the quota. An exhausted
//! quota is reported as status 402.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::membership::{ListingEntry, NameDirectory};
use super::provider::{
    decode_json, fetch_body, http_client, paced, AdapterError, DateWindow, SourceAdapter,
    WindowGranularity,
};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::{is_valid_code, Market, RawBar, SourceKind, Symbol};

// ============================================================================
// Constants
// ============================================================================

/// FinMind API base URL
const FINMIND_BASE: &str = "https://api.finmindtrade.com";

/// Data endpoint shared by every dataset
const DATA_ENDPOINT: &str = "/api/v4/data";

const PRICE_DATASET: &str = "TaiwanStockPrice";

const INFO_DATASET: &str = "TaiwanStockInfo";

/// Largest span requested in one call
const MAX_SPAN_DAYS: u32 = 366;

/// Status FinMind uses for an exhausted quota
const QUOTA_EXHAUSTED: u16 = 402;

const DEFAULT_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Shared client
// ============================================================================

/// HTTP access to the FinMind data endpoint.
#[derive(Clone)]
struct FinMindClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    rate_limiter: SharedRateLimiter,
}

impl FinMindClient {
    async fn fetch<T: DeserializeOwned>(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, AdapterError> {
        let url = format!("{}{}", self.base_url, DATA_ENDPOINT);

        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.as_str())]);
        }
        debug!(url = %url, ?query, "Fetching from FinMind");

        let response: FinMindResponse<T> = paced(&self.rate_limiter, async {
            let body = fetch_body(request).await?;
            decode_json(&body)
        })
        .await?;

        match response.status {
            Some(200) | None => Ok(response.data),
            Some(QUOTA_EXHAUSTED) => {
                // In-body 402 bypasses the HTTP path, so back off here too
                self.rate_limiter.penalize();
                Err(AdapterError::RateLimited {
                    retry_after_secs: None,
                })
            }
            Some(status) => Err(AdapterError::Network(format!(
                "FinMind status {}: {}",
                status,
                response.msg.unwrap_or_default()
            ))),
        }
    }
}

// ============================================================================
// FinMind Adapter
// ============================================================================

/// Vendor aggregator covering both boards.
pub struct FinMindAdapter {
    api: FinMindClient,
    priority: u8,
}

impl FinMindAdapter {
    pub fn new(rate_limiter: SharedRateLimiter) -> Self {
        Self {
            api: FinMindClient {
                client: http_client(),
                base_url: FINMIND_BASE.to_string(),
                token: None,
                rate_limiter,
            },
            priority: 2,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Create from config. Returns `None` when the source is disabled.
    pub fn from_config(config: &taiex_common::Config) -> Option<Self> {
        let settings = &config.sources.finmind;
        if !settings.enabled {
            return None;
        }

        let interval = if settings.min_interval_ms > 0 {
            settings.min_interval_ms
        } else {
            DEFAULT_INTERVAL_MS
        };
        let limiter = shared_limiter(
            "finmind",
            Duration::from_millis(interval),
            settings.max_backoff_level,
        );

        let mut adapter = Self::new(limiter)
            .with_priority(settings.priority)
            .with_token(settings.token.clone());
        if let Some(url) = &settings.base_url {
            adapter = adapter.with_base_url(url.as_str());
        }
        Some(adapter)
    }

    /// A name directory sharing this adapter's client, token and limiter.
    pub fn name_directory(&self) -> FinMindNameDirectory {
        FinMindNameDirectory {
            api: self.api.clone(),
        }
    }

    pub fn rate_limiter(&self) -> &SharedRateLimiter {
        &self.api.rate_limiter
    }
}

#[async_trait]
impl SourceAdapter for FinMindAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::FinMind
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn serves(&self, market: Market) -> bool {
        matches!(market, Market::Twse | Market::Tpex)
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
        let query = [
            ("dataset", PRICE_DATASET.to_string()),
            ("data_id", symbol.code.clone()),
            ("start_date", window.start.to_string()),
            ("end_date", window.end.to_string()),
        ];
        let rows: Vec<PriceRow> = self.api.fetch(&query).await?;

        let bars = rows
            .into_iter()
            .filter_map(|row| {
                let bar = row.to_raw_bar();
                if bar.is_none() {
                    debug!(code = %symbol.code, date = %row.date, "Skipping malformed FinMind row");
                }
                bar
            })
            .filter(|bar| window.contains(bar.date))
            .collect();

        Ok(bars)
    }
}

// ============================================================================
// Name Directory
// ============================================================================

/// `TaiwanStockInfo` as a code → name/board directory.
pub struct FinMindNameDirectory {
    api: FinMindClient,
}

#[async_trait]
impl NameDirectory for FinMindNameDirectory {
    async fn entries(&self) -> Result<Vec<ListingEntry>, AdapterError> {
        let rows: Vec<InfoRow> = self
            .api
            .fetch(&[("dataset", INFO_DATASET.to_string())])
            .await?;

        // The dataset repeats a symbol once per industry category
        let mut entries: BTreeMap<String, ListingEntry> = BTreeMap::new();
        for row in rows {
            let code = row.stock_id.trim().to_string();
            if !is_valid_code(&code) {
                continue;
            }
            let market = match row.kind.as_deref().map(str::parse::<Market>) {
                Some(Ok(market)) => market,
                _ => {
                    debug!(code = %code, kind = ?row.kind, "Unclassified board in directory");
                    Market::Unknown
                }
            };
            entries.entry(code.clone()).or_insert(ListingEntry {
                code,
                name: row.stock_name.trim().to_string(),
                market,
            });
        }

        Ok(entries.into_values().collect())
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct FinMindResponse<T> {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    date: String,
    #[serde(rename = "Trading_Volume", default)]
    trading_volume: Option<f64>,
    open: Option<f64>,
    max: Option<f64>,
    min: Option<f64>,
    close: Option<f64>,
}

impl PriceRow {
    fn to_raw_bar(&self) -> Option<RawBar> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        let shares = self.trading_volume.filter(|v| *v >= 0.0)?;
        Some(RawBar {
            source: SourceKind::FinMind,
            date,
            open: self.open?,
            high: self.max?,
            low: self.min?,
            close: self.close?,
            volume: (shares / 1000.0).round() as u64,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InfoRow {
    stock_id: String,
    #[serde(default)]
    stock_name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
