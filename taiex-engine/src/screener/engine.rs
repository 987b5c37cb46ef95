//! Screener engine.
//!
//! Applies one criterion to every symbol in a universe, keeps the symbols
//! that produce a signal and ranks them. Storage errors on one symbol are
//! logged and counted; they never abort the run.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::data::{BarStore, DailyBar, Symbol};
use crate::indicators::{
    bias, bollinger, daily_rebound, intraday_range, is_liquid, ma_breakthrough, ma_cross,
    ma_trend, macd_cross, period_volatility, price_gap, sideways, volatility_pct, volume_surge,
    Bollinger, Cross, Gap, IndicatorError, IndicatorResult, IntradayRange, MaAlignment,
    MaBreakthrough, MaCross, Macd, PeriodVolatility, Rebound, Sideways, VolumeSurge,
    BOLLINGER_K, BOLLINGER_PERIOD,
};

use super::criteria::{BarWindow, Criterion, ScreenerConfig};

// ============================================================================
// Signals
// ============================================================================

/// What an indicator found for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Signal {
    Volatility { volatility_pct: f64 },
    BollingerPosition { bands: Bollinger, position_pct: f64 },
    BollingerWidth { bands: Bollinger, width_pct: f64 },
    Bias { bias_pct: f64 },
    MaTrend(MaAlignment),
    MaCross(MaCross),
    MaBreakthrough(MaBreakthrough),
    VolumeSurge(VolumeSurge),
    PriceGap(Gap),
    MacdCross { cross: Cross, macd: Macd },
    Sideways(Sideways),
    DailyRebound(Rebound),
    PeriodVolatility(PeriodVolatility),
    IntradayRange(IntradayRange),
}

/// How hits of one criterion are ranked.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Rank {
    Descending(f64),
    Ascending(f64),
    ByCode,
}

impl Signal {
    /// Headline number shown in reports.
    pub fn metric(&self) -> f64 {
        match self {
            Self::Volatility { volatility_pct } => *volatility_pct,
            Self::BollingerPosition { position_pct, .. } => *position_pct,
            Self::BollingerWidth { width_pct, .. } => *width_pct,
            Self::Bias { bias_pct } => *bias_pct,
            Self::MaTrend(a) => a.ma5,
            Self::MaCross(c) => c.ma5 - c.ma20,
            Self::MaBreakthrough(b) => b.breakthrough_pct,
            Self::VolumeSurge(s) => s.ratio,
            Self::PriceGap(g) => g.gap_pct,
            Self::MacdCross { macd, .. } => macd.macd,
            Self::Sideways(s) => s.range_pct,
            Self::DailyRebound(r) => r.rebound_pct,
            Self::PeriodVolatility(p) => p.volatility_pct,
            Self::IntradayRange(r) => r.range_pct,
        }
    }

    fn rank(&self) -> Rank {
        match self {
            Self::Volatility { .. } | Self::PeriodVolatility(_) => Rank::Descending(self.metric()),
            Self::BollingerPosition { .. } | Self::BollingerWidth { .. } | Self::Sideways(_) => {
                Rank::Ascending(self.metric())
            }
            Self::IntradayRange(r) => Rank::Descending(r.traded_value),
            Self::Bias { bias_pct } => Rank::Descending(bias_pct.abs()),
            Self::MaBreakthrough(_)
            | Self::VolumeSurge(_)
            | Self::PriceGap(_)
            | Self::DailyRebound(_) => Rank::Descending(self.metric()),
            Self::MaTrend(_) | Self::MaCross(_) | Self::MacdCross { .. } => Rank::ByCode,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// A symbol that produced a signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenHit {
    pub symbol: Symbol,
    /// Date of the latest bar evaluated
    pub date: NaiveDate,
    pub close: f64,
    /// Latest volume in lots
    pub volume: u64,
    pub signal: Signal,
}

/// Progress after each symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenProgress {
    /// 1-based index of the symbol just evaluated
    pub current: usize,
    pub total: usize,
    pub code: String,
}

impl ScreenProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.current as f64 / self.total as f64 * 100.0
        }
    }
}

/// Result of one screening run.
#[derive(Debug, Clone, Serialize)]
pub struct ScreenOutcome {
    pub criterion: Criterion,
    /// Ranked hits
    pub hits: Vec<ScreenHit>,
    pub scanned: usize,
    pub matched: usize,
    /// Symbols with too few bars for the criterion
    pub insufficient: usize,
    /// Symbols whose bars could not be read
    pub errored: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl ScreenOutcome {
    pub fn top(&self, n: usize) -> &[ScreenHit] {
        &self.hits[..n.min(self.hits.len())]
    }

    /// Summary string for logging.
    pub fn summary(&self) -> String {
        format!(
            "Screened {} symbols for {} in {:.1}s: {} matched, {} insufficient, {} errored",
            self.scanned,
            self.criterion,
            self.elapsed.as_secs_f64(),
            self.matched,
            self.insufficient,
            self.errored
        )
    }
}

enum Evaluation {
    Hit(ScreenHit),
    NoSignal,
    Insufficient,
}

// ============================================================================
// Screener Engine
// ============================================================================

pub struct ScreenerEngine {
    bars: Arc<dyn BarStore>,
    config: ScreenerConfig,
}

impl ScreenerEngine {
    pub fn new(bars: Arc<dyn BarStore>, config: ScreenerConfig) -> Self {
        Self { bars, config }
    }

    pub fn config(&self) -> &ScreenerConfig {
        &self.config
    }

    /// Evaluate `criterion` across `universe`, calling `on_progress` after
    /// every symbol.
    pub async fn screen<F>(
        &self,
        criterion: &Criterion,
        universe: &[Symbol],
        mut on_progress: F,
    ) -> ScreenOutcome
    where
        F: FnMut(ScreenProgress),
    {
        let started = Instant::now();
        let floor = self.config.floor_for(criterion);
        info!(
            criterion = %criterion,
            universe = universe.len(),
            floor,
            "Starting screen"
        );

        let mut hits = Vec::new();
        let mut insufficient = 0;
        let mut errored = 0;

        for (i, symbol) in universe.iter().enumerate() {
            match self.evaluate(criterion, symbol, floor).await {
                Ok(Evaluation::Hit(hit)) => hits.push(hit),
                Ok(Evaluation::NoSignal) => {}
                Ok(Evaluation::Insufficient) => insufficient += 1,
                Err(e) => {
                    warn!(code = %symbol.code, error = %e, "Failed to read bars for screening");
                    errored += 1;
                }
            }

            on_progress(ScreenProgress {
                current: i + 1,
                total: universe.len(),
                code: symbol.code.clone(),
            });
        }

        sort_hits(&mut hits);

        let outcome = ScreenOutcome {
            criterion: criterion.clone(),
            matched: hits.len(),
            hits,
            scanned: universe.len(),
            insufficient,
            errored,
            elapsed: started.elapsed(),
        };
        info!(
            matched = outcome.matched,
            insufficient,
            errored,
            duration = format!("{:.1}s", outcome.elapsed.as_secs_f64()),
            "Screen complete"
        );
        outcome
    }

    async fn evaluate(&self, criterion: &Criterion, symbol: &Symbol, floor: u64) -> Result<Evaluation> {
        let bars = match criterion.window() {
            BarWindow::Latest(n) => {
                let mut bars = self.bars.latest_n(&symbol.code, n).await?;
                bars.reverse();
                bars
            }
            BarWindow::Range(start, end) => self.bars.get_range(&symbol.code, start, end).await?,
            BarWindow::On(date) => self.bars.bar_on(&symbol.code, date).await?.into_iter().collect(),
        };

        let Some(latest) = bars.last() else {
            debug!(code = %symbol.code, "No bars in screening window");
            return Ok(Evaluation::Insufficient);
        };

        match apply(criterion, &bars, floor) {
            Ok(Some(signal)) => Ok(Evaluation::Hit(ScreenHit {
                symbol: symbol.clone(),
                date: latest.date,
                close: latest.close,
                volume: latest.volume,
                signal,
            })),
            Ok(None) => Ok(Evaluation::NoSignal),
            Err(IndicatorError::InsufficientData { needed, got }) => {
                debug!(code = %symbol.code, needed, got, "Insufficient data");
                Ok(Evaluation::Insufficient)
            }
        }
    }
}

/// Run the indicator behind `criterion` on ascending `bars`.
fn apply(criterion: &Criterion, bars: &[DailyBar], floor: u64) -> IndicatorResult<Option<Signal>> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let signal = match criterion {
        Criterion::Volatility { days, min_pct } => {
            let volatility_pct = volatility_pct(bars, *days)?;
            (is_liquid(bars, floor) && volatility_pct >= *min_pct)
                .then_some(Signal::Volatility { volatility_pct })
        }
        Criterion::BollingerPosition => {
            let bands = bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_K)?;
            let position = bands.position_pct(closes[closes.len() - 1]);
            position
                .filter(|_| is_liquid(bars, floor))
                .map(|position_pct| Signal::BollingerPosition { bands, position_pct })
        }
        Criterion::BollingerWidth => {
            let bands = bollinger(&closes, BOLLINGER_PERIOD, BOLLINGER_K)?;
            is_liquid(bars, floor).then(|| Signal::BollingerWidth {
                bands,
                width_pct: bands.width_pct(),
            })
        }
        Criterion::Bias { min_abs_pct } => {
            let bias_pct = bias(&closes, BOLLINGER_PERIOD)?;
            (is_liquid(bars, floor) && bias_pct.abs() >= *min_abs_pct)
                .then_some(Signal::Bias { bias_pct })
        }
        Criterion::MaTrend => ma_trend(bars, floor)?.map(Signal::MaTrend),
        Criterion::MaCross => ma_cross(bars, floor)?.map(Signal::MaCross),
        Criterion::MaBreakthrough => ma_breakthrough(bars, floor)?.map(Signal::MaBreakthrough),
        Criterion::VolumeSurge { ratio } => volume_surge(bars, *ratio, floor)?.map(Signal::VolumeSurge),
        Criterion::PriceGap { min_pct } => price_gap(bars, floor)?
            .filter(|g| g.gap_pct >= *min_pct)
            .map(Signal::PriceGap),
        Criterion::MacdCross => {
            let cross = macd_cross(&closes)?;
            cross
                .filter(|_| is_liquid(bars, floor))
                .map(|(cross, macd)| Signal::MacdCross { cross, macd })
        }
        Criterion::Sideways { window, threshold_pct } => {
            sideways(bars, *window, *threshold_pct, floor)?.map(Signal::Sideways)
        }
        Criterion::DailyRebound { lookback, min_pct } => {
            daily_rebound(bars, *lookback, *min_pct, floor)?.map(Signal::DailyRebound)
        }
        Criterion::PeriodVolatility {
            min_pct,
            min_total_volume,
            ..
        } => period_volatility(bars, *min_total_volume, *min_pct)?.map(Signal::PeriodVolatility),
        Criterion::IntradayRange {
            min_range_pct,
            min_volume,
            ..
        } => bars
            .last()
            .filter(|bar| bar.volume >= (*min_volume).max(floor))
            .and_then(intraday_range)
            .filter(|r| r.range_pct >= *min_range_pct)
            .map(Signal::IntradayRange),
    };
    Ok(signal)
}

/// Rank hits by their criterion's rule, ties broken on code.
pub(crate) fn sort_hits(hits: &mut [ScreenHit]) {
    hits.sort_by(|a, b| {
        let primary = match (a.signal.rank(), b.signal.rank()) {
            (Rank::Descending(x), Rank::Descending(y)) => y.partial_cmp(&x),
            (Rank::Ascending(x), Rank::Ascending(y)) => x.partial_cmp(&y),
            _ => Some(Ordering::Equal),
        };
        primary
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.symbol.code.cmp(&b.symbol.code))
    });
}
