//! Technical indicator library.
//!
//! Pure functions over daily bars or closes in ascending date order; the
//! last element is "today". Every function reports a short input as
//! [`IndicatorError::InsufficientData`] instead of panicking.
//!
//! Functions taking a `floor` are liquidity-gated: when the latest bar's
//! volume (lots) is below the floor they return `Ok(None)` without looking
//! at prices.

mod average;
mod bollinger;
mod macd;
mod price;
mod volume;

pub use average::{bias, ema, ma_breakthrough, ma_cross, ma_trend, sma, MaAlignment, MaBreakthrough, MaCross};
pub use bollinger::{bollinger, Bollinger, BOLLINGER_K, BOLLINGER_PERIOD};
pub use macd::{macd, macd_cross, Macd, MACD_MIN_POINTS};
pub use price::{
    daily_rebound, intraday_range, period_volatility, price_gap, sideways, volatility_pct, Gap,
    GapDirection, IntradayRange, PeriodVolatility, Rebound, Sideways,
};
pub use volume::{volume_surge, VolumeSurge, SURGE_BASELINE_DAYS};

use serde::Serialize;
use thiserror::Error;

use crate::data::DailyBar;

/// Default liquidity floor in lots.
pub const DEFAULT_LIQUIDITY_FLOOR: u64 = 100;

/// Indicator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndicatorError {
    /// Fewer usable points than the window requires
    #[error("insufficient data: needed {needed} points, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

pub type IndicatorResult<T> = Result<T, IndicatorError>;

/// Direction of a crossover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cross {
    /// Fast line crossed above the slow line (or zero)
    Golden,
    /// Fast line crossed below
    Death,
}

impl std::fmt::Display for Cross {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Golden => write!(f, "golden"),
            Self::Death => write!(f, "death"),
        }
    }
}

pub(crate) fn require(got: usize, needed: usize) -> IndicatorResult<()> {
    if got < needed {
        Err(IndicatorError::InsufficientData { needed, got })
    } else {
        Ok(())
    }
}

/// The last `n` bars, or `InsufficientData`.
pub(crate) fn tail(bars: &[DailyBar], n: usize) -> IndicatorResult<&[DailyBar]> {
    require(bars.len(), n)?;
    Ok(&bars[bars.len() - n..])
}

pub(crate) fn closes(bars: &[DailyBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// True when the latest bar trades at least `floor` lots.
pub fn is_liquid(bars: &[DailyBar], floor: u64) -> bool {
    bars.last().is_some_and(|b| b.volume >= floor)
}

/// `(value / base) × 100`.
pub(crate) fn pct(value: f64, base: f64) -> f64 {
    value / base * 100.0
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::{Duration, NaiveDate};

    /// Bars with the given closes, flat OHLC and a fixed volume.
    pub fn bars_from_closes(closes: &[f64], volume: u64) -> Vec<DailyBar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| DailyBar {
                code: "2330".into(),
                date: start + Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume,
            })
            .collect()
    }

    /// Replace the latest bar's volume.
    pub fn with_last_volume(mut bars: Vec<DailyBar>, volume: u64) -> Vec<DailyBar> {
        if let Some(last) = bars.last_mut() {
            last.volume = volume;
        }
        bars
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_tail_reports_shortfall() {
        let bars = bars_from_closes(&[1.0, 2.0], 500);
        assert_eq!(tail(&bars, 2).unwrap().len(), 2);
        assert_eq!(
            tail(&bars, 3).unwrap_err(),
            IndicatorError::InsufficientData { needed: 3, got: 2 }
        );
    }

    #[test]
    fn test_is_liquid_uses_latest_bar() {
        let bars = with_last_volume(bars_from_closes(&[1.0, 2.0], 500), 50);
        assert!(!is_liquid(&bars, 100));
        assert!(is_liquid(&bars, 50));
        assert!(!is_liquid(&[], 0));
    }
}
