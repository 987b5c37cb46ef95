//! End-to-end sync flow: probe the code space, backfill every symbol with
//! failover, re-run as a no-op, then verify against a disagreeing source.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use taiex_engine::data::{
    shared_limiter, AdapterError, BarStore, DateWindow, Market, MarketFilter, MarketSnapshotSource,
    MembershipSource, RawBar, SourceAdapter, SourceKind, SqliteStore, Symbol, SymbolProber,
    SymbolRegistry, SyncConfig, SyncEngine, TradingCalendar, WindowGranularity,
};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn is_weekday(date: &NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

// ============================================================================
// Mock sources
// ============================================================================

/// Fixed listing for one board.
struct StaticListing {
    market: Market,
    codes: HashMap<String, String>,
}

impl StaticListing {
    fn new(market: Market, entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            market,
            codes: entries
                .iter()
                .map(|(code, name)| (code.to_string(), name.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl MembershipSource for StaticListing {
    fn market(&self) -> Market {
        self.market
    }

    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, code: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.codes.get(code).cloned())
    }
}

/// One bar per weekday at a fixed close; optionally always failing.
struct MockSource {
    kind: SourceKind,
    priority: u8,
    markets: Vec<Market>,
    close: f64,
    fail: bool,
    calls: AtomicU32,
}

impl MockSource {
    fn new(kind: SourceKind, priority: u8, markets: &[Market], close: f64, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            priority,
            markets: markets.to_vec(),
            close,
            fail,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn serves(&self, market: Market) -> bool {
        self.markets.contains(&market)
    }

    fn granularity(&self) -> WindowGranularity {
        WindowGranularity::Monthly
    }

    async fn fetch_window(
        &self,
        _symbol: &Symbol,
        window: DateWindow,
    ) -> Result<Vec<RawBar>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AdapterError::Network("connection reset".into()));
        }
        Ok(window
            .dates()
            .filter(is_weekday)
            .map(|date| RawBar {
                source: self.kind,
                date,
                open: self.close - 1.0,
                high: self.close + 1.0,
                low: self.close - 2.0,
                close: self.close,
                volume: 2000,
            })
            .collect())
    }
}

/// Whole-market rows for any date.
struct FixedSnapshot {
    rows: Vec<(String, RawBar)>,
}

#[async_trait]
impl MarketSnapshotSource for FixedSnapshot {
    async fn fetch_market_day(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(String, RawBar)>, AdapterError> {
        Ok(self
            .rows
            .iter()
            .cloned()
            .map(|(code, mut bar)| {
                bar.date = date;
                (code, bar)
            })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn open_store() -> (Arc<SqliteStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("data/taiex.db")).unwrap());
    (store, dir)
}

async fn probe_universe(store: &Arc<SqliteStore>) {
    let twse = StaticListing::new(Market::Twse, &[("0050", "元大台灣50"), ("2330", "台積電")]);
    let tpex = StaticListing::new(Market::Tpex, &[("6488", "環球晶")]);
    let prober = SymbolProber::new(
        store.clone(),
        vec![twse, tpex],
        shared_limiter("probe-test", Duration::ZERO, 0),
    );

    let codes = ["0050", "2330", "6488", "9999"].map(String::from);
    let summary = prober.probe_codes(codes.clone()).await.unwrap();
    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.registered_twse, 2);
    assert_eq!(summary.registered_tpex, 1);
    assert_eq!(summary.invalid, 1);

    // A second pass never asks the listings again
    let again = prober.probe_codes(codes).await.unwrap();
    assert_eq!(again.already_known, 4);
}

fn engine(store: Arc<SqliteStore>, adapters: Vec<Arc<dyn SourceAdapter>>) -> SyncEngine<SqliteStore> {
    let config = SyncConfig {
        start_year: 2024,
        ..SyncConfig::default()
    };
    SyncEngine::new(store, adapters, config)
        .with_clock(|| day(2024, 2, 15).and_hms_opt(18, 0, 0).unwrap())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_probe_sync_and_rerun() {
    let (store, _dir) = open_store();
    probe_universe(&store).await;

    assert!(store.is_known_invalid("9999").await.unwrap());
    let twse_symbols = store.list_valid(MarketFilter::Only(Market::Twse)).await.unwrap();
    assert_eq!(twse_symbols.len(), 2);

    let twse = MockSource::new(SourceKind::Twse, 1, &[Market::Twse], 0.0, true);
    let tpex = MockSource::new(SourceKind::Tpex, 1, &[Market::Tpex], 480.0, false);
    let finmind = MockSource::new(SourceKind::FinMind, 2, &[Market::Twse, Market::Tpex], 600.0, false);
    let engine = engine(
        store.clone(),
        vec![finmind.clone(), twse.clone(), tpex.clone()],
    );

    let summary = engine.sync_all(MarketFilter::All).await.unwrap();
    // 23 January weekdays plus 11 in February through the 15th
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.inserted, 3 * 34);
    assert_eq!(summary.windows_failed, 0);
    assert!(twse.calls() > 0);

    // Exchange failure fell through to the vendor; the secondary board kept its own source
    let bar = store.bar_on("2330", day(2024, 1, 2)).await.unwrap().unwrap();
    assert_eq!(bar.close, 600.0);
    let bar = store.bar_on("6488", day(2024, 1, 2)).await.unwrap().unwrap();
    assert_eq!(bar.close, 480.0);

    assert_eq!(store.is_trading_day(day(2024, 1, 6)).await.unwrap(), Some(false));
    assert_eq!(store.is_trading_day(day(2024, 2, 15)).await.unwrap(), Some(true));

    let finmind_calls = finmind.calls();
    let tpex_calls = tpex.calls();
    let rerun = engine.sync_all(MarketFilter::All).await.unwrap();
    assert_eq!(rerun.skipped, 3);
    assert_eq!(rerun.inserted, 0);
    assert_eq!(finmind.calls(), finmind_calls);
    assert_eq!(tpex.calls(), tpex_calls);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.symbols, 3);
    assert_eq!(stats.invalid_symbols, 1);
    assert_eq!(stats.bars, 3 * 34);
}

#[tokio::test]
async fn test_verify_reports_disagreement() {
    let (store, _dir) = open_store();
    probe_universe(&store).await;

    let finmind = MockSource::new(SourceKind::FinMind, 2, &[Market::Twse], 600.0, false);
    let first = engine(store.clone(), vec![finmind.clone()]);
    let symbol = store.get("2330").await.unwrap().unwrap();
    first
        .backfill(&symbol, day(2024, 1, 1), day(2024, 1, 31))
        .await
        .unwrap();

    // Agreement is silent
    let found = first
        .verify(&symbol, day(2024, 1, 1), day(2024, 1, 12))
        .await
        .unwrap();
    assert!(found.is_empty());

    let exchange = MockSource::new(SourceKind::Twse, 1, &[Market::Twse], 601.0, false);
    let checker = engine(store.clone(), vec![finmind, exchange]);
    let found = checker
        .verify(&symbol, day(2024, 1, 1), day(2024, 1, 12))
        .await
        .unwrap();

    // Ten weekdays in range
    assert_eq!(found.len(), 10);
    let first_gap = &found[0];
    assert_eq!(first_gap.date, day(2024, 1, 1));
    assert_eq!(first_gap.stored.unwrap().close, 600.0);
    assert_eq!(first_gap.candidates.len(), 2);
    let (source, values) = first_gap.preferred.unwrap();
    assert_eq!(source, SourceKind::Twse);
    assert_eq!(values.close, 601.0);
}

#[tokio::test]
async fn test_market_day_merges_registered_rows_only() {
    let (store, _dir) = open_store();
    probe_universe(&store).await;

    let bar = |close: f64, high: f64, low: f64| RawBar {
        source: SourceKind::Twse,
        date: day(2024, 1, 1),
        open: close,
        high,
        low,
        close,
        volume: 12_000,
    };
    let snapshot = Arc::new(FixedSnapshot {
        rows: vec![
            ("2330".to_string(), bar(593.0, 595.0, 589.0)),
            ("0050".to_string(), bar(132.15, 131.0, 133.0)),
            ("1101".to_string(), bar(33.5, 34.0, 33.0)),
            ("6488".to_string(), bar(480.0, 482.0, 470.0)),
        ],
    });

    let engine = engine(store.clone(), Vec::new()).with_snapshot_source(snapshot);
    let outcome = engine.sync_market_day(day(2024, 1, 12)).await.unwrap();

    assert_eq!(outcome.rows, 4);
    assert_eq!(outcome.inserted, 1);
    // Inverted high/low
    assert_eq!(outcome.rejected, 1);
    // Unknown code and a secondary-board symbol
    assert_eq!(outcome.unregistered, 2);
    assert_eq!(
        store.bar_on("2330", day(2024, 1, 12)).await.unwrap().unwrap().close,
        593.0
    );
    assert_eq!(store.is_trading_day(day(2024, 1, 12)).await.unwrap(), Some(true));

    let again = engine.sync_market_day(day(2024, 1, 12)).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.already_present, 1);
}
