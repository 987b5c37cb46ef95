//! Data synchronization engine.
//!
//! Backfills daily bars for every registered symbol, asking only for dates
//! that are neither stored nor known market holidays. Each window goes to the
//! adapters serving the symbol's board in priority order; the first success
//! wins and the rest are skipped. Failed windows are counted and left for the
//! next run, never retried in a loop.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::calendar::{effective_end_date, fill_calendar, taipei_now, CalendarFill};
use super::control::{Flow, SyncControl};
use super::local_storage::SyncStatus;
use super::provider::{
    fetch_range, DateWindow, MarketSnapshotSource, SourceAdapter, WindowGranularity,
};
use super::store::{
    BarStore, MarketStore, SymbolRegistry, SyncLedger, TradingCalendar, UpsertOutcome,
};
use super::verify::{verify_range, Discrepancy};
use super::{Market, MarketFilter, RawBar, SourceKind, Symbol};

// ============================================================================
// Sync Configuration
// ============================================================================

/// Which symbols may teach the calendar that a date was a holiday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalendarInference {
    /// Any symbol's non-empty response, limited to gaps the reference
    /// instrument's stored bars already show
    AllSymbols,
    /// Only the reference instrument
    #[default]
    ReferenceOnly,
}

impl From<taiex_common::CalendarInferenceMode> for CalendarInference {
    fn from(mode: taiex_common::CalendarInferenceMode) -> Self {
        match mode {
            taiex_common::CalendarInferenceMode::AllSymbols => Self::AllSymbols,
            taiex_common::CalendarInferenceMode::ReferenceOnly => Self::ReferenceOnly,
        }
    }
}

/// Configuration for data synchronization
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First year of history to backfill
    pub start_year: i32,
    /// Hour (Taipei) after which today's session counts as complete
    pub cutoff_hour: u32,
    /// Instrument synced first and used for calendar discovery
    pub reference_symbol: String,
    /// Symbols synced at once
    pub concurrency: usize,
    pub calendar_inference: CalendarInference,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_year: 2010,
            cutoff_hour: 17,
            reference_symbol: "0050".to_string(),
            concurrency: 1,
            calendar_inference: CalendarInference::ReferenceOnly,
        }
    }
}

impl From<&taiex_common::SyncSettings> for SyncConfig {
    fn from(settings: &taiex_common::SyncSettings) -> Self {
        Self {
            start_year: settings.start_year,
            cutoff_hour: settings.cutoff_hour,
            reference_symbol: settings.reference_symbol.clone(),
            concurrency: settings.concurrency.max(1),
            calendar_inference: settings.calendar_inference.into(),
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Per-symbol state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    DetermineMissingRange,
    FetchBatch(DateWindow),
    MergeBatch(DateWindow),
}

/// Latest phase published by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub code: String,
    /// 1-based position in the run
    pub position: usize,
    pub total: usize,
    pub phase: SyncPhase,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Counts for one symbol's backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolOutcome {
    pub code: String,
    pub windows_planned: usize,
    pub windows_failed: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub rejected: usize,
    pub closed_marked: usize,
    pub stopped: bool,
}

impl SymbolOutcome {
    fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Self::default()
        }
    }

    /// Nothing was missing.
    pub fn is_up_to_date(&self) -> bool {
        self.windows_planned == 0
    }

    pub fn status(&self) -> SyncStatus {
        if self.stopped {
            SyncStatus::Partial
        } else if self.windows_failed == 0 {
            SyncStatus::Success
        } else if self.windows_failed < self.windows_planned {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }
}

/// Per-run report.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub rejected: usize,
    pub windows_failed: usize,
    pub closed_marked: usize,
    pub stopped: bool,
    pub elapsed: Duration,
}

impl SyncSummary {
    fn absorb(&mut self, outcome: &SymbolOutcome) {
        if outcome.stopped {
            // Interrupted symbols are left unclassified
        } else if outcome.is_up_to_date() {
            self.skipped += 1;
        } else if outcome.windows_failed > 0 {
            self.errored += 1;
        } else {
            self.succeeded += 1;
        }
        self.inserted += outcome.inserted;
        self.already_present += outcome.already_present;
        self.rejected += outcome.rejected;
        self.windows_failed += outcome.windows_failed;
        self.closed_marked += outcome.closed_marked;
        self.stopped |= outcome.stopped;
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Sync {} in {:.1}s",
            if self.stopped { "stopped" } else { "complete" },
            self.elapsed.as_secs_f64()
        )?;
        writeln!(
            f,
            "  symbols:  {} succeeded, {} up to date, {} errored",
            self.succeeded, self.skipped, self.errored
        )?;
        writeln!(
            f,
            "  bars:     {} inserted, {} already present, {} rejected",
            self.inserted, self.already_present, self.rejected
        )?;
        writeln!(f, "  windows:  {} failed", self.windows_failed)?;
        write!(f, "  calendar: {} days marked closed", self.closed_marked)
    }
}

/// Counts for one whole-market day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketDayOutcome {
    pub date: Option<NaiveDate>,
    /// The date was already known to be a holiday
    pub skipped_closed: bool,
    pub rows: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub rejected: usize,
    pub unregistered: usize,
}

// ============================================================================
// Window planning
// ============================================================================

/// One request window and the dates it should fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedWindow {
    pub window: DateWindow,
    pub missing: BTreeSet<NaiveDate>,
}

/// Group the missing dates of `[start, end]` into request windows.
///
/// A date is missing unless it is stored or known closed. Monthly sources
/// get one window per calendar month; span sources get runs of missing
/// dates, broken by stored dates and capped at `max_days`.
pub(crate) fn plan_windows(
    granularity: WindowGranularity,
    start: NaiveDate,
    end: NaiveDate,
    stored: &BTreeSet<NaiveDate>,
    closed: &BTreeSet<NaiveDate>,
) -> Vec<PlannedWindow> {
    let mut plans: Vec<PlannedWindow> = Vec::new();
    if start > end {
        return plans;
    }

    let mut run_broken = false;
    for date in DateWindow::new(start, end).dates() {
        if stored.contains(&date) {
            run_broken = true;
            continue;
        }
        if closed.contains(&date) {
            continue;
        }

        let extends = |last: &&mut PlannedWindow| match granularity {
            WindowGranularity::Monthly => {
                last.window.start.year() == date.year() && last.window.start.month() == date.month()
            }
            WindowGranularity::Span { max_days } => {
                !run_broken && (date - last.window.start).num_days() < i64::from(max_days.max(1))
            }
        };

        match plans.last_mut().filter(extends) {
            Some(last) => {
                last.window.end = date;
                last.missing.insert(date);
            }
            None => plans.push(PlannedWindow {
                window: DateWindow::new(date, date),
                missing: BTreeSet::from([date]),
            }),
        }
        run_broken = false;
    }

    plans
}

// ============================================================================
// Sync Engine
// ============================================================================

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Keeps the bar store in step with the external sources.
pub struct SyncEngine<S: MarketStore + 'static> {
    store: Arc<S>,
    /// Sorted by priority, lowest first
    adapters: Vec<Arc<dyn SourceAdapter>>,
    snapshot: Option<Arc<dyn MarketSnapshotSource>>,
    config: SyncConfig,
    control: SyncControl,
    progress: watch::Sender<SyncProgress>,
    clock: Clock,
}

impl<S: MarketStore + 'static> SyncEngine<S> {
    /// Create a new sync engine
    pub fn new(store: Arc<S>, mut adapters: Vec<Arc<dyn SourceAdapter>>, config: SyncConfig) -> Self {
        adapters.sort_by_key(|a| a.priority());
        let (progress, _rx) = watch::channel(SyncProgress::default());
        Self {
            store,
            adapters,
            snapshot: None,
            config,
            control: SyncControl::new(),
            progress,
            clock: Arc::new(taipei_now),
        }
    }

    /// Source for `sync_market_day`.
    pub fn with_snapshot_source(mut self, snapshot: Arc<dyn MarketSnapshotSource>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_control(mut self, control: SyncControl) -> Self {
        self.control = control;
        self
    }

    /// Replace the Taipei wall clock.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn control(&self) -> &SyncControl {
        &self.control
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    /// Watch the engine's phase.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    fn today(&self) -> NaiveDate {
        self.now().date()
    }

    /// Full backfill range for a fresh run.
    pub fn default_range(&self) -> (NaiveDate, NaiveDate) {
        let end = effective_end_date(self.now(), self.config.cutoff_hour);
        let start = NaiveDate::from_ymd_opt(self.config.start_year, 1, 1).unwrap_or(end);
        (start, end)
    }

    fn publish(&self, code: &str, position: usize, total: usize, phase: SyncPhase) {
        self.progress.send_replace(SyncProgress {
            code: code.to_string(),
            position,
            total,
            phase,
        });
    }

    fn adapters_for(&self, market: Market) -> Vec<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().filter(|a| a.serves(market)).collect()
    }

    fn infers_calendar(&self, code: &str) -> bool {
        match self.config.calendar_inference {
            CalendarInference::AllSymbols => true,
            CalendarInference::ReferenceOnly => code == self.config.reference_symbol,
        }
    }

    /// Stored span of the reference instrument inside `window`, with its dates.
    async fn reference_span(
        &self,
        window: DateWindow,
    ) -> Result<Option<(DateWindow, BTreeSet<NaiveDate>)>> {
        let traded = self
            .store
            .dates_between(&self.config.reference_symbol, window.start, window.end)
            .await?;
        Ok(match (traded.first(), traded.last()) {
            (Some(first), Some(last)) => Some((DateWindow::new(*first, *last), traded)),
            _ => None,
        })
    }

    // ------------------------------------------------------------------------
    // Per-symbol backfill
    // ------------------------------------------------------------------------

    /// Sync one symbol over the default range and record the outcome.
    pub async fn sync_symbol(&self, symbol: &Symbol) -> Result<SymbolOutcome> {
        self.sync_symbol_at(symbol, 1, 1).await
    }

    async fn sync_symbol_at(
        &self,
        symbol: &Symbol,
        position: usize,
        total: usize,
    ) -> Result<SymbolOutcome> {
        let (start, end) = self.default_range();
        let result = self.backfill_at(symbol, start, end, position, total).await;

        let recorded = match &result {
            Ok(outcome) => {
                let message = (outcome.windows_failed > 0).then(|| {
                    format!(
                        "{} of {} windows failed",
                        outcome.windows_failed, outcome.windows_planned
                    )
                });
                self.store
                    .record_sync(&symbol.code, outcome.status(), message.as_deref())
                    .await
            }
            Err(e) => {
                self.store
                    .record_sync(&symbol.code, SyncStatus::Failed, Some(&e.to_string()))
                    .await
            }
        };
        if let Err(e) = recorded {
            warn!(code = %symbol.code, error = %e, "Failed to record sync metadata");
        }

        result
    }

    /// Fill every missing date of `[start, end]` for `symbol`.
    pub async fn backfill(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SymbolOutcome> {
        self.backfill_at(symbol, start, end, 1, 1).await
    }

    async fn backfill_at(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
        position: usize,
        total: usize,
    ) -> Result<SymbolOutcome> {
        let code = symbol.code.as_str();
        let mut outcome = SymbolOutcome::new(code);

        let adapters = self.adapters_for(symbol.market);
        let Some(primary) = adapters.first() else {
            warn!(code, market = %symbol.market, "No source serves this market");
            return Ok(outcome);
        };

        // DetermineMissingRange
        self.publish(code, position, total, SyncPhase::DetermineMissingRange);
        let stored = self.store.dates_between(code, start, end).await?;
        let closed = self.store.non_trading_between(start, end).await?;
        let plans = plan_windows(primary.granularity(), start, end, &stored, &closed);
        outcome.windows_planned = plans.len();

        if plans.is_empty() {
            debug!(code, "Bars already up to date");
            self.publish(code, position, total, SyncPhase::Idle);
            return Ok(outcome);
        }

        debug!(
            code,
            %start,
            %end,
            windows = plans.len(),
            source = primary.name(),
            "Syncing daily bars"
        );

        let today = self.today();
        let infer = self.infers_calendar(code);

        for plan in &plans {
            if self.control.checkpoint().await == Flow::Stop {
                outcome.stopped = true;
                break;
            }

            // FetchBatch
            self.publish(code, position, total, SyncPhase::FetchBatch(plan.window));
            let Some((source, bars)) = self.fetch_with_failover(symbol, plan.window, &adapters).await
            else {
                outcome.windows_failed += 1;
                continue;
            };

            // MergeBatch
            self.publish(code, position, total, SyncPhase::MergeBatch(plan.window));
            self.merge_window(symbol, plan, source, bars, today, infer, &mut outcome)
                .await?;
        }

        self.publish(code, position, total, SyncPhase::Idle);
        info!(
            code,
            inserted = outcome.inserted,
            rejected = outcome.rejected,
            windows_failed = outcome.windows_failed,
            closed_marked = outcome.closed_marked,
            stopped = outcome.stopped,
            "Symbol synced"
        );
        Ok(outcome)
    }

    /// Try each adapter in order; the first complete answer wins.
    async fn fetch_with_failover(
        &self,
        symbol: &Symbol,
        window: DateWindow,
        adapters: &[&Arc<dyn SourceAdapter>],
    ) -> Option<(SourceKind, Vec<RawBar>)> {
        for adapter in adapters.iter().copied() {
            let fetched: Result<Vec<RawBar>, _> =
                fetch_range(&**adapter, symbol, window.start, window.end)
                    .try_collect()
                    .await;

            match fetched {
                Ok(bars) => return Some((adapter.kind(), bars)),
                Err(e) => warn!(
                    code = %symbol.code,
                    source = adapter.name(),
                    start = %window.start,
                    end = %window.end,
                    error = %e,
                    "Source failed, trying next"
                ),
            }
        }

        warn!(
            code = %symbol.code,
            start = %window.start,
            end = %window.end,
            "All sources failed for window"
        );
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_window(
        &self,
        symbol: &Symbol,
        plan: &PlannedWindow,
        source: SourceKind,
        bars: Vec<RawBar>,
        today: NaiveDate,
        infer: bool,
        outcome: &mut SymbolOutcome,
    ) -> Result<()> {
        let code = symbol.code.as_str();
        let mut returned: BTreeSet<NaiveDate> = BTreeSet::new();

        for raw in bars {
            if !plan.missing.contains(&raw.date) {
                continue;
            }
            returned.insert(raw.date);

            let date = raw.date;
            let bar = match raw.into_daily(code) {
                Ok(bar) => bar,
                Err(e) => {
                    debug!(code, source = %source, error = %e, "Rejected bar");
                    outcome.rejected += 1;
                    continue;
                }
            };

            match self.store.upsert_if_absent(&bar, source).await? {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::AlreadyPresent => outcome.already_present += 1,
            }
            self.store.mark_trading_day(date, true).await?;
        }

        // An empty answer says nothing about the calendar (not yet listed, suspended)
        if infer && !returned.is_empty() {
            // Other symbols only confirm gaps inside the reference's stored span
            let reference = if code == self.config.reference_symbol {
                None
            } else {
                match self.reference_span(plan.window).await? {
                    Some(span) => Some(span),
                    None => {
                        debug!(code, "No reference bars in window, calendar left unknown");
                        return Ok(());
                    }
                }
            };

            for date in plan.missing.iter().filter(|d| **d < today && !returned.contains(*d)) {
                if let Some((span, traded)) = &reference {
                    if !span.contains(*date) || traded.contains(date) {
                        continue;
                    }
                }
                if self.store.mark_trading_day(*date, false).await? {
                    outcome.closed_marked += 1;
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Whole-universe run
    // ------------------------------------------------------------------------

    /// Sync the reference instrument, then every valid symbol matching `filter`.
    pub async fn sync_all(&self, filter: MarketFilter) -> Result<SyncSummary> {
        let started = Instant::now();
        let mut summary = SyncSummary::default();

        let reference_code = self.config.reference_symbol.clone();
        let universe: Vec<Symbol> = self
            .store
            .list_valid(filter)
            .await?
            .into_iter()
            .filter(|s| s.code != reference_code)
            .collect();
        let total = universe.len() + 1;

        info!(
            symbols = total,
            concurrency = self.config.concurrency,
            reference = %reference_code,
            "Starting full data synchronization"
        );

        match self.store.get(&reference_code).await? {
            Some(reference) => match self.sync_symbol_at(&reference, 1, total).await {
                Ok(outcome) => summary.absorb(&outcome),
                Err(e) => {
                    warn!(code = %reference_code, error = %e, "Reference sync failed");
                    summary.errored += 1;
                }
            },
            None => warn!(
                code = %reference_code,
                "Reference symbol is not registered; calendar discovery relies on other symbols"
            ),
        }

        let mut results = stream::iter(universe.into_iter().enumerate())
            .map(|(i, symbol)| async move {
                if self.control.is_stopping() {
                    return (symbol.code, None);
                }
                let result = self.sync_symbol_at(&symbol, i + 2, total).await;
                (symbol.code, Some(result))
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((code, result)) = results.next().await {
            match result {
                Some(Ok(outcome)) => summary.absorb(&outcome),
                Some(Err(e)) => {
                    warn!(code = %code, error = %e, "Symbol sync failed");
                    summary.errored += 1;
                }
                None => {}
            }
        }

        summary.stopped |= self.control.is_stopping();
        summary.elapsed = started.elapsed();

        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            errored = summary.errored,
            inserted = summary.inserted,
            windows_failed = summary.windows_failed,
            stopped = summary.stopped,
            elapsed_secs = summary.elapsed.as_secs(),
            "Data synchronization completed"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Supplementary operations
    // ------------------------------------------------------------------------

    /// Merge the whole-market snapshot for `date` into every registered
    /// primary-board symbol.
    pub async fn sync_market_day(&self, date: NaiveDate) -> Result<MarketDayOutcome> {
        let snapshot = self.snapshot.as_ref().ok_or_else(|| {
            taiex_common::Error::Config("no market snapshot source is enabled".into())
        })?;

        let mut outcome = MarketDayOutcome {
            date: Some(date),
            ..MarketDayOutcome::default()
        };

        if self.store.is_trading_day(date).await? == Some(false) {
            debug!(%date, "Market closed, skipping snapshot");
            outcome.skipped_closed = true;
            return Ok(outcome);
        }

        let rows = snapshot
            .fetch_market_day(date)
            .await
            .with_context(|| format!("Failed to fetch market snapshot for {}", date))?;
        outcome.rows = rows.len();

        let registered: HashSet<String> = self
            .store
            .list_valid(MarketFilter::Only(Market::Twse))
            .await?
            .into_iter()
            .map(|s| s.code)
            .collect();

        for (code, raw) in rows {
            if !registered.contains(&code) {
                outcome.unregistered += 1;
                continue;
            }
            let source = raw.source;
            match raw.into_daily(&code) {
                Ok(bar) => match self.store.upsert_if_absent(&bar, source).await? {
                    UpsertOutcome::Inserted => outcome.inserted += 1,
                    UpsertOutcome::AlreadyPresent => outcome.already_present += 1,
                },
                Err(e) => {
                    debug!(code = %code, error = %e, "Rejected snapshot row");
                    outcome.rejected += 1;
                }
            }
        }

        if outcome.rows > 0 {
            self.store.mark_trading_day(date, true).await?;
        } else if date < self.today() {
            self.store.mark_trading_day(date, false).await?;
        }

        info!(
            %date,
            rows = outcome.rows,
            inserted = outcome.inserted,
            unregistered = outcome.unregistered,
            "Market day merged"
        );
        Ok(outcome)
    }

    /// Resolve unknown past calendar dates from the reference instrument's bars.
    pub async fn fill_calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<CalendarFill> {
        fill_calendar(
            self.store.as_ref(),
            self.store.as_ref(),
            &self.config.reference_symbol,
            start,
            end,
            self.today(),
        )
        .await
    }

    /// Compare stored bars with every serving source.
    pub async fn verify(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Discrepancy>> {
        verify_range(self.store.as_ref(), &self.adapters, symbol, start, end).await
    }
}

// ============================================================================
// Tests
// ============================================================================
