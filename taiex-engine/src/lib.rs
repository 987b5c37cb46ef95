//! Taiex Engine
//!
//! Keeps a local store of daily bars for every TWSE and TPEx listed equity
//! and screens the universe with technical indicators.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          taiex (CLI)                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐     │
//! │  │  Symbol         │  │  Sync           │  │  Screener       │     │
//! │  │  Prober         │  │  Engine         │  │  Engine         │     │
//! │  └────────┬────────┘  └────────┬────────┘  └────────┬────────┘     │
//! │           │     ┌──────────────┴──────────┐         │              │
//! │           │     │ TWSE │ TPEx │ FinMind │ Yahoo      │              │
//! │           │     └─────────────────────────┘         │              │
//! │  ┌────────┴────────────────────────────────────────┴────────┐     │
//! │  │        SQLite: symbols, calendar, bars, watchlist         │     │
//! │  └───────────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Idempotent backfill
//! - Bars are written insert-if-absent keyed by (code, date)
//! - Only dates neither stored nor known holidays are fetched
//! - Sources are tried in priority order per window
//!
//! ## Trading calendar
//! - A date with no bars from a successful fetch is a holiday
//! - Known holidays are never requested again

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod data;
pub mod indicators;
pub mod screener;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use taiex_common::config::Config;

use crate::data::{
    shared_limiter, FinMindAdapter, MembershipSource, MarketSnapshotSource, NameDirectory,
    SourceAdapter, SqliteStore, SymbolProber, SyncConfig, SyncControl, SyncEngine, TpexAdapter,
    TpexListing, TwseAdapter, TwseListing, YahooAdapter,
};
use crate::screener::{ScreenerConfig, ScreenerEngine};

/// Store, sources and engines assembled from one configuration.
pub struct TaiexService {
    /// Configuration
    pub config: Config,
    /// Local SQLite store
    pub store: Arc<SqliteStore>,
    /// Enabled bar sources
    pub adapters: Vec<Arc<dyn SourceAdapter>>,
    /// Whole-market daily snapshot (TWSE), when enabled
    pub snapshot: Option<Arc<dyn MarketSnapshotSource>>,
    /// Vendor name directory (FinMind), when enabled
    pub directory: Option<Arc<dyn NameDirectory>>,
    /// Shared stop/pause switch for long runs
    pub control: SyncControl,
}

impl TaiexService {
    /// Open the store and build every enabled source.
    pub fn new(config: Config) -> Result<Self> {
        let db_path = config.storage.resolved_db_path();
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open store at {}", db_path.display()))?,
        );

        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        let mut snapshot: Option<Arc<dyn MarketSnapshotSource>> = None;

        if let Some(twse) = TwseAdapter::from_config(&config) {
            let twse = Arc::new(twse);
            snapshot = Some(twse.clone());
            adapters.push(twse);
        }
        if let Some(tpex) = TpexAdapter::from_config(&config) {
            adapters.push(Arc::new(tpex));
        }

        let mut directory: Option<Arc<dyn NameDirectory>> = None;
        if let Some(finmind) = FinMindAdapter::from_config(&config) {
            directory = Some(Arc::new(finmind.name_directory()));
            adapters.push(Arc::new(finmind));
        }
        if let Some(yahoo) = YahooAdapter::from_config(&config) {
            adapters.push(Arc::new(yahoo));
        }

        tracing::info!(
            db = %db_path.display(),
            sources = adapters.len(),
            snapshot = snapshot.is_some(),
            "Taiex service initialized"
        );

        Ok(Self {
            config,
            store,
            adapters,
            snapshot,
            directory,
            control: SyncControl::new(),
        })
    }

    /// Sync engine over every enabled source.
    pub fn sync_engine(&self) -> SyncEngine<SqliteStore> {
        let engine = SyncEngine::new(
            self.store.clone(),
            self.adapters.clone(),
            SyncConfig::from(&self.config.sync),
        )
        .with_control(self.control.clone());

        match &self.snapshot {
            Some(snapshot) => engine.with_snapshot_source(snapshot.clone()),
            None => engine,
        }
    }

    /// Prober over the exchange listings.
    pub fn prober(&self) -> SymbolProber {
        let probe = &self.config.probe;
        let sources: Vec<Arc<dyn MembershipSource>> = vec![
            Arc::new(TwseListing::new(probe.twse_listing_url.clone())),
            Arc::new(TpexListing::new(probe.tpex_listing_url.clone())),
        ];
        let limiter = shared_limiter("probe", Duration::from_millis(probe.interval_ms), 0);

        SymbolProber::new(self.store.clone(), sources, limiter).with_control(self.control.clone())
    }

    pub fn screener(&self) -> ScreenerEngine {
        ScreenerEngine::new(
            self.store.clone(),
            ScreenerConfig::from(&self.config.screener),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_assembles_enabled_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("taiex.db").display().to_string();
        config.sources.yahoo.enabled = false;

        let service = TaiexService::new(config).unwrap();
        assert!(service.snapshot.is_some());
        assert!(service.directory.is_some());
        assert!(service
            .adapters
            .iter()
            .all(|a| a.kind() != crate::data::SourceKind::Yahoo));

        let engine = service.sync_engine();
        let priorities: Vec<u8> = engine.adapters().iter().map(|a| a.priority()).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }
}
