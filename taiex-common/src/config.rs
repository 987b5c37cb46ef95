//! Configuration management for taiex services.
//!
//! All taiex tools share one configuration file at `~/.taiex/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (TAIEX_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `TAIEX_DB_PATH` → storage.db_path
//! - `TAIEX_LOG_LEVEL` → observability.log_level
//! - `TAIEX_LOG_FORMAT` → observability.log_format
//! - `TAIEX_START_YEAR` → sync.start_year
//! - `TAIEX_SYNC_CONCURRENCY` → sync.concurrency
//! - `FINMIND_TOKEN` → sources.finmind.token

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".taiex"),
        |dirs| dirs.home_dir().join(".taiex"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Local SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file (`~` is expanded)
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_path(&self.db_path)
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Which symbols may mark calendar dates as non-trading when a fetch window
/// comes back without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarInferenceMode {
    /// Every synced symbol contributes, inside the reference's stored span
    AllSymbols,
    /// Only the reference instrument contributes holiday inference
    ReferenceOnly,
}

impl Default for CalendarInferenceMode {
    fn default() -> Self {
        Self::ReferenceOnly
    }
}

/// Backfill behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// First calendar year to backfill from (January 1st)
    #[serde(default = "default_start_year")]
    pub start_year: i32,

    /// Local hour after which today's session is considered complete
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,

    /// Liquid benchmark used for trading-calendar discovery
    #[serde(default = "default_reference_symbol")]
    pub reference_symbol: String,

    /// Number of symbols synchronized concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Holiday inference policy
    #[serde(default)]
    pub calendar_inference: CalendarInferenceMode,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            start_year: default_start_year(),
            cutoff_hour: default_cutoff_hour(),
            reference_symbol: default_reference_symbol(),
            concurrency: default_concurrency(),
            calendar_inference: CalendarInferenceMode::default(),
        }
    }
}

// ============================================================================
// Source Configuration
// ============================================================================

/// Per-source connection and pacing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Whether the source participates in sync
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override for the source's base URL (mirrors, tests)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Minimum delay between two calls to this source
    pub min_interval_ms: u64,

    /// Maximum number of interval doublings after rate-limit responses (0 = no backoff)
    #[serde(default = "default_backoff_level")]
    pub max_backoff_level: u32,

    /// Failover priority (lower = tried first)
    pub priority: u8,

    /// API token, when the source accepts one
    #[serde(default)]
    pub token: Option<String>,
}

impl SourceSettings {
    fn with_pacing(min_interval_ms: u64, priority: u8) -> Self {
        Self {
            enabled: true,
            base_url: None,
            min_interval_ms,
            max_backoff_level: default_backoff_level(),
            priority,
            token: None,
        }
    }
}

/// Settings for every market-data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Taiwan Stock Exchange (primary board, official)
    #[serde(default = "default_twse")]
    pub twse: SourceSettings,

    /// Taipei Exchange (secondary board, official)
    #[serde(default = "default_tpex")]
    pub tpex: SourceSettings,

    /// FinMind open data API
    #[serde(default = "default_finmind")]
    pub finmind: SourceSettings,

    /// Yahoo Finance chart API
    #[serde(default = "default_yahoo")]
    pub yahoo: SourceSettings,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            twse: default_twse(),
            tpex: default_tpex(),
            finmind: default_finmind(),
            yahoo: default_yahoo(),
        }
    }
}

fn default_twse() -> SourceSettings {
    SourceSettings::with_pacing(3000, 1)
}

fn default_tpex() -> SourceSettings {
    SourceSettings::with_pacing(3000, 1)
}

fn default_finmind() -> SourceSettings {
    SourceSettings::with_pacing(1000, 2)
}

fn default_yahoo() -> SourceSettings {
    SourceSettings::with_pacing(1000, 3)
}

// ============================================================================
// Probe Configuration
// ============================================================================

/// Symbol discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Minimum delay between two probes
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    /// Override for the primary-board listing URL
    #[serde(default)]
    pub twse_listing_url: Option<String>,

    /// Override for the secondary-board listing URL
    #[serde(default)]
    pub tpex_listing_url: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval_ms(),
            twse_listing_url: None,
            tpex_listing_url: None,
        }
    }
}

// ============================================================================
// Screener Configuration
// ============================================================================

/// Screening defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerSettings {
    /// Minimum latest-day volume (lots) for liquidity-gated indicators
    #[serde(default = "default_liquidity_floor")]
    pub liquidity_floor: u64,

    /// Directory used when an export path is relative
    #[serde(default = "default_export_dir")]
    pub export_dir: String,

    /// Append `.TW` / `.TWO` to exported codes
    #[serde(default = "default_true")]
    pub market_suffix: bool,

    /// Per-criterion floor overrides keyed by criterion name (e.g. "volume-surge")
    #[serde(default)]
    pub floor_overrides: BTreeMap<String, u64>,
}

impl Default for ScreenerSettings {
    fn default() -> Self {
        Self {
            liquidity_floor: default_liquidity_floor(),
            export_dir: default_export_dir(),
            market_suffix: true,
            floor_overrides: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to quiet down to `warn`
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub screener: ScreenerSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (environment, test maps).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TAIEX_DB_PATH") {
            self.storage.db_path = path;
        }

        if let Some(level) = lookup("TAIEX_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("TAIEX_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Some(year) = lookup("TAIEX_START_YEAR") {
            if let Ok(y) = year.parse() {
                self.sync.start_year = y;
            }
        }
        if let Some(concurrency) = lookup("TAIEX_SYNC_CONCURRENCY") {
            if let Ok(c) = concurrency.parse() {
                self.sync.concurrency = c;
            }
        }

        if let Some(token) = lookup("FINMIND_TOKEN") {
            if !token.is_empty() {
                self.sources.finmind.token = Some(token);
            }
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "~/.taiex/market.db".to_string()
}

fn default_start_year() -> i32 {
    2010
}

fn default_cutoff_hour() -> u32 {
    17
}

fn default_reference_symbol() -> String {
    "0050".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_backoff_level() -> u32 {
    4
}

fn default_probe_interval_ms() -> u64 {
    50
}

fn default_liquidity_floor() -> u64 {
    100
}

fn default_export_dir() -> String {
    "~/.taiex/exports".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
