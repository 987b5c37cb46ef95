//! Price-range indicators: volatility, gaps, consolidation and rebounds.

use chrono::NaiveDate;
use serde::Serialize;

use super::{closes, is_liquid, pct, require, tail, IndicatorError, IndicatorResult};
use crate::data::DailyBar;

// ============================================================================
// Volatility
// ============================================================================

/// `(max high - min low) / min low × 100` over the last `days` bars.
pub fn volatility_pct(bars: &[DailyBar], days: usize) -> IndicatorResult<f64> {
    let window = tail(bars, days.max(1))?;
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if low <= 0.0 {
        return Err(IndicatorError::InsufficientData { needed: days, got: 0 });
    }
    Ok(pct(high - low, low))
}

/// Swing over a calendar period such as one month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodVolatility {
    pub volatility_pct: f64,
    pub high: f64,
    pub low: f64,
    pub first_close: f64,
    pub last_close: f64,
    pub trading_days: usize,
    pub total_volume: u64,
}

/// Volatility across every bar in `bars`, gated on total volume instead of
/// the latest day. `Some` when the swing reaches `min_pct`.
pub fn period_volatility(
    bars: &[DailyBar],
    min_total_volume: u64,
    min_pct: f64,
) -> IndicatorResult<Option<PeriodVolatility>> {
    require(bars.len(), 1)?;

    let total_volume: u64 = bars.iter().map(|b| b.volume).sum();
    if total_volume < min_total_volume {
        return Ok(None);
    }

    let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if low <= 0.0 {
        return Ok(None);
    }

    let volatility_pct = pct(high - low, low);
    if volatility_pct < min_pct {
        return Ok(None);
    }

    Ok(Some(PeriodVolatility {
        volatility_pct,
        high,
        low,
        first_close: bars[0].close,
        last_close: bars[bars.len() - 1].close,
        trading_days: bars.len(),
        total_volume,
    }))
}

// ============================================================================
// Gaps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapDirection {
    Up,
    Down,
}

/// Opening gap against yesterday's range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gap {
    pub direction: GapDirection,
    pub gap_pct: f64,
    pub open: f64,
    /// Yesterday's high for an up-gap, its low for a down-gap
    pub reference: f64,
    pub close: f64,
}

pub fn price_gap(bars: &[DailyBar], floor: u64) -> IndicatorResult<Option<Gap>> {
    let window = tail(bars, 2)?;
    if !is_liquid(bars, floor) {
        return Ok(None);
    }
    let (yesterday, today) = (&window[0], &window[1]);

    let gap = if yesterday.high > 0.0 && today.open > yesterday.high {
        Gap {
            direction: GapDirection::Up,
            gap_pct: pct(today.open - yesterday.high, yesterday.high),
            open: today.open,
            reference: yesterday.high,
            close: today.close,
        }
    } else if yesterday.low > 0.0 && today.open < yesterday.low {
        Gap {
            direction: GapDirection::Down,
            gap_pct: pct(yesterday.low - today.open, yesterday.low),
            open: today.open,
            reference: yesterday.low,
            close: today.close,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(gap))
}

// ============================================================================
// Consolidation
// ============================================================================

/// Narrow closing range over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sideways {
    pub range_pct: f64,
    pub max: f64,
    pub min: f64,
    pub avg: f64,
    pub days: usize,
}

/// `Some` when `(max close - min close) / avg close × 100` stays within
/// `threshold_pct` over the last `window` bars.
pub fn sideways(
    bars: &[DailyBar],
    window: usize,
    threshold_pct: f64,
    floor: u64,
) -> IndicatorResult<Option<Sideways>> {
    let closes = closes(tail(bars, window.max(1))?);
    if !is_liquid(bars, floor) {
        return Ok(None);
    }

    let max = closes.iter().copied().fold(f64::MIN, f64::max);
    let min = closes.iter().copied().fold(f64::MAX, f64::min);
    let avg = closes.iter().sum::<f64>() / closes.len() as f64;
    if avg <= 0.0 {
        return Ok(None);
    }

    let range_pct = pct(max - min, avg);
    Ok((range_pct <= threshold_pct).then_some(Sideways {
        range_pct,
        max,
        min,
        avg,
        days: closes.len(),
    }))
}

// ============================================================================
// Rebound
// ============================================================================

/// A day that closed well off its low while the 5-day mean was still falling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rebound {
    pub date: NaiveDate,
    pub rebound_pct: f64,
    pub volume: u64,
    pub ma5: f64,
}

/// Most recent day within `lookback` bars where `(close - low) / low × 100`
/// reaches `min_pct` and MA5 is below the previous day's MA5.
pub fn daily_rebound(
    bars: &[DailyBar],
    lookback: usize,
    min_pct: f64,
    floor: u64,
) -> IndicatorResult<Option<Rebound>> {
    require(bars.len(), 6)?;
    if !is_liquid(bars, floor) {
        return Ok(None);
    }

    let window = &bars[bars.len() - lookback.clamp(6, bars.len())..];
    let closes = closes(window);

    for i in (5..window.len()).rev() {
        let bar = &window[i];
        if bar.low <= 0.0 {
            continue;
        }
        let rebound_pct = pct(bar.close - bar.low, bar.low);
        if rebound_pct < min_pct {
            continue;
        }

        let ma5 = closes[i - 4..=i].iter().sum::<f64>() / 5.0;
        let prev_ma5 = closes[i - 5..i].iter().sum::<f64>() / 5.0;
        if ma5 < prev_ma5 {
            return Ok(Some(Rebound {
                date: bar.date,
                rebound_pct,
                volume: bar.volume,
                ma5,
            }));
        }
    }
    Ok(None)
}

// ============================================================================
// Intraday range
// ============================================================================

/// Single-day swing with where the close landed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntradayRange {
    /// `(high - low) / low × 100`
    pub range_pct: f64,
    /// Volume × close, in thousands of TWD since volume is in lots
    pub traded_value: f64,
    /// 0 at the low, 100 at the high; `None` on a zero-range day
    pub close_position_pct: Option<f64>,
}

/// `None` when the low is not positive.
pub fn intraday_range(bar: &DailyBar) -> Option<IntradayRange> {
    if bar.low <= 0.0 {
        return None;
    }
    let spread = bar.high - bar.low;
    Some(IntradayRange {
        range_pct: pct(spread, bar.low),
        traded_value: bar.volume as f64 * bar.close,
        close_position_pct: (spread > 0.0).then(|| pct(bar.close - bar.low, spread)),
    })
}
