//! Board membership listings used to classify symbol codes.
//!
//! Each board publishes an open-data listing of every symbol that traded on
//! the latest session. The listing is downloaded once per source instance and
//! answered from memory afterwards.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::provider::{decode_json, fetch_body, http_client, AdapterError};
use super::{is_valid_code, Market};

const TWSE_LISTING_URL: &str = "https://openapi.twse.com.tw/v1/exchangeReport/STOCK_DAY_ALL";

const TPEX_LISTING_URL: &str =
    "https://www.tpex.org.tw/openapi/v1/tpex_mainboard_daily_close_quotes";

/// One entry of a listing or name directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub code: String,
    pub name: String,
    pub market: Market,
}

/// Answers "is this code listed on my board?".
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Board this source speaks for
    fn market(&self) -> Market;

    /// Name for logging
    fn name(&self) -> &'static str;

    /// `Some(name)` when listed, `None` when not.
    async fn lookup(&self, code: &str) -> Result<Option<String>, AdapterError>;
}

/// Full code → name/market directory from a vendor.
#[async_trait]
pub trait NameDirectory: Send + Sync {
    async fn entries(&self) -> Result<Vec<ListingEntry>, AdapterError>;
}

// ============================================================================
// Cached listing
// ============================================================================

/// A downloaded listing, fetched on first use.
struct CachedListing {
    client: reqwest::Client,
    url: String,
    codes: OnceCell<HashMap<String, String>>,
}

impl CachedListing {
    fn new(url: String) -> Self {
        Self {
            client: http_client(),
            url,
            codes: OnceCell::new(),
        }
    }

    async fn get<F>(&self, source: &str, parse: F) -> Result<&HashMap<String, String>, AdapterError>
    where
        F: FnOnce(&str) -> Result<Vec<(String, String)>, AdapterError>,
    {
        // A failed download leaves the cell empty so the next lookup retries
        self.codes
            .get_or_try_init(|| async {
                debug!(source, url = %self.url, "Downloading listing");
                let body = fetch_body(self.client.get(&self.url)).await?;
                let codes: HashMap<String, String> = parse(&body)?
                    .into_iter()
                    .filter(|(code, _)| is_valid_code(code))
                    .collect();
                info!(source, count = codes.len(), "Listing loaded");
                Ok(codes)
            })
            .await
    }
}

// ============================================================================
// TWSE listing
// ============================================================================

/// Primary-board listing (`STOCK_DAY_ALL`).
pub struct TwseListing {
    listing: CachedListing,
}

impl TwseListing {
    pub fn new(url: Option<String>) -> Self {
        Self {
            listing: CachedListing::new(url.unwrap_or_else(|| TWSE_LISTING_URL.to_string())),
        }
    }
}

impl Default for TwseListing {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Deserialize)]
struct TwseListingRow {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Name", default)]
    name: String,
}

#[async_trait]
impl MembershipSource for TwseListing {
    fn market(&self) -> Market {
        Market::Twse
    }

    fn name(&self) -> &'static str {
        "twse-listing"
    }

    async fn lookup(&self, code: &str) -> Result<Option<String>, AdapterError> {
        let codes = self
            .listing
            .get(self.name(), |body| {
                let rows: Vec<TwseListingRow> = decode_json(body)?;
                Ok(rows
                    .into_iter()
                    .map(|r| (r.code.trim().to_string(), r.name.trim().to_string()))
                    .collect())
            })
            .await?;
        Ok(codes.get(code).cloned())
    }
}

// ============================================================================
// TPEx listing
// ============================================================================

/// Secondary-board listing (`tpex_mainboard_daily_close_quotes`).
pub struct TpexListing {
    listing: CachedListing,
}

impl TpexListing {
    pub fn new(url: Option<String>) -> Self {
        Self {
            listing: CachedListing::new(url.unwrap_or_else(|| TPEX_LISTING_URL.to_string())),
        }
    }
}

impl Default for TpexListing {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Deserialize)]
struct TpexListingRow {
    #[serde(rename = "SecuritiesCompanyCode")]
    code: String,
    #[serde(rename = "CompanyName", default)]
    name: String,
}

#[async_trait]
impl MembershipSource for TpexListing {
    fn market(&self) -> Market {
        Market::Tpex
    }

    fn name(&self) -> &'static str {
        "tpex-listing"
    }

    async fn lookup(&self, code: &str) -> Result<Option<String>, AdapterError> {
        let codes = self
            .listing
            .get(self.name(), |body| {
                let rows: Vec<TpexListingRow> = decode_json(body)?;
                Ok(rows
                    .into_iter()
                    .map(|r| (r.code.trim().to_string(), r.name.trim().to_string()))
                    .collect())
            })
            .await?;
        Ok(codes.get(code).cloned())
    }
}
