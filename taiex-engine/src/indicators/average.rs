//! Moving averages and the signals built on them.

use serde::Serialize;

use super::{closes, is_liquid, pct, require, tail, Cross, IndicatorError, IndicatorResult};
use crate::data::DailyBar;

/// Mean of the last `n` values.
pub fn sma(values: &[f64], n: usize) -> IndicatorResult<f64> {
    require(values.len(), n.max(1))?;
    let window = &values[values.len() - n.max(1)..];
    Ok(window.iter().sum::<f64>() / window.len() as f64)
}

/// Exponential average over the last `n` values.
///
/// Seeded on the first value of the window, multiplier `2 / (n + 1)`.
pub fn ema(values: &[f64], n: usize) -> IndicatorResult<f64> {
    require(values.len(), n.max(1))?;
    let window = &values[values.len() - n.max(1)..];
    let multiplier = 2.0 / (n as f64 + 1.0);
    Ok(window[1..]
        .iter()
        .fold(window[0], |ema, v| v * multiplier + ema * (1.0 - multiplier)))
}

/// Distance of the latest close from its `n`-day mean, in percent.
pub fn bias(closes: &[f64], n: usize) -> IndicatorResult<f64> {
    let mean = sma(closes, n)?;
    if mean == 0.0 {
        return Err(IndicatorError::InsufficientData { needed: n, got: 0 });
    }
    let last = closes[closes.len() - 1];
    Ok(pct(last - mean, mean))
}

// ============================================================================
// Alignment
// ============================================================================

/// Bullish stacking of the 5/10/20/30-day averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaAlignment {
    pub close: f64,
    pub ma5: f64,
    pub ma10: f64,
    pub ma20: f64,
    pub ma30: f64,
}

/// `Some` when MA5 > MA10 > MA20 > MA30 on the latest day.
pub fn ma_trend(bars: &[DailyBar], floor: u64) -> IndicatorResult<Option<MaAlignment>> {
    let window = closes(tail(bars, 30)?);
    if !is_liquid(bars, floor) {
        return Ok(None);
    }

    let ma5 = sma(&window, 5)?;
    let ma10 = sma(&window, 10)?;
    let ma20 = sma(&window, 20)?;
    let ma30 = sma(&window, 30)?;

    if ma5 > ma10 && ma10 > ma20 && ma20 > ma30 {
        Ok(Some(MaAlignment {
            close: window[window.len() - 1],
            ma5,
            ma10,
            ma20,
            ma30,
        }))
    } else {
        Ok(None)
    }
}

// ============================================================================
// Crossovers
// ============================================================================

/// MA5 crossing MA20 between yesterday and today.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaCross {
    pub cross: Cross,
    pub close: f64,
    pub ma5: f64,
    pub ma20: f64,
}

pub fn ma_cross(bars: &[DailyBar], floor: u64) -> IndicatorResult<Option<MaCross>> {
    let today = closes(tail(bars, 21)?);
    if !is_liquid(bars, floor) {
        return Ok(None);
    }
    let yesterday = &today[..today.len() - 1];

    let (ma5, ma20) = (sma(&today, 5)?, sma(&today, 20)?);
    let (prev_ma5, prev_ma20) = (sma(yesterday, 5)?, sma(yesterday, 20)?);

    let cross = if prev_ma5 < prev_ma20 && ma5 > ma20 {
        Cross::Golden
    } else if prev_ma5 > prev_ma20 && ma5 < ma20 {
        Cross::Death
    } else {
        return Ok(None);
    };

    Ok(Some(MaCross {
        cross,
        close: today[today.len() - 1],
        ma5,
        ma20,
    }))
}

/// Close moving from below to above the prior 20-day mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaBreakthrough {
    pub close: f64,
    /// Mean of the 20 closes before today
    pub ma20: f64,
    pub breakthrough_pct: f64,
}

pub fn ma_breakthrough(bars: &[DailyBar], floor: u64) -> IndicatorResult<Option<MaBreakthrough>> {
    let window = closes(tail(bars, 21)?);
    if !is_liquid(bars, floor) {
        return Ok(None);
    }

    let close = window[20];
    let prev_close = window[19];
    let ma20 = sma(&window[..20], 20)?;

    if ma20 > 0.0 && prev_close < ma20 && close > ma20 {
        Ok(Some(MaBreakthrough {
            close,
            ma20,
            breakthrough_pct: pct(close - ma20, ma20),
        }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::testing::{bars_from_closes, with_last_volume};

    #[test]
    fn test_sma_of_one_to_five() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 5).unwrap(), 3.0);
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 2).unwrap(), 4.5);
        assert!(matches!(
            sma(&[1.0, 2.0], 5),
            Err(IndicatorError::InsufficientData { needed: 5, got: 2 })
        ));
    }

    #[test]
    fn test_ema_matches_hand_recursion() {
        // k = 2/6; seed 1, then 2k + 1(1-k), ...
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let k = 2.0 / 6.0;
        let mut expected = 1.0;
        for v in &values[1..] {
            expected = v * k + expected * (1.0 - k);
        }
        assert!((ema(&values, 5).unwrap() - expected).abs() < 1e-12);

        // only the last n values take part
        assert!((ema(&[100.0, 1.0, 2.0, 3.0], 3).unwrap() - 2.25).abs() < 1e-12);
    }

    #[test]
    fn test_bias() {
        let mut closes = vec![100.0; 19];
        closes.push(119.0);
        // mean = 100.95
        let b = bias(&closes, 20).unwrap();
        assert!((b - (119.0 - 100.95) / 100.95 * 100.0).abs() < 1e-9);

        assert!(bias(&[0.0; 20], 20).is_err());
    }

    #[test]
    fn test_ma_trend_on_rising_series() {
        let closes: Vec<f64> = (1..=30).map(f64::from).collect();
        let aligned = ma_trend(&bars_from_closes(&closes, 500), 100).unwrap().unwrap();
        assert_eq!(aligned.ma5, 28.0);
        assert_eq!(aligned.ma30, 15.5);

        let falling: Vec<f64> = closes.iter().rev().copied().collect();
        assert!(ma_trend(&bars_from_closes(&falling, 500), 100).unwrap().is_none());
    }

    fn cross_series(base: f64, dip: f64, last: f64) -> Vec<DailyBar> {
        let mut closes = vec![base; 15];
        closes.extend([dip; 5]);
        closes.push(last);
        bars_from_closes(&closes, 500)
    }

    #[test]
    fn test_ma_cross_golden_and_death() {
        let golden = ma_cross(&cross_series(10.0, 9.0, 15.0), 100).unwrap().unwrap();
        assert_eq!(golden.cross, Cross::Golden);
        assert!((golden.ma5 - 10.2).abs() < 1e-9);
        assert!((golden.ma20 - 10.0).abs() < 1e-9);

        let death = ma_cross(&cross_series(10.0, 11.0, 5.0), 100).unwrap().unwrap();
        assert_eq!(death.cross, Cross::Death);

        let flat = bars_from_closes(&[10.0; 21], 500);
        assert!(ma_cross(&flat, 100).unwrap().is_none());
    }

    #[test]
    fn test_ma_breakthrough() {
        let mut closes = vec![10.0; 19];
        closes.extend([9.0, 11.0]);
        let hit = ma_breakthrough(&bars_from_closes(&closes, 500), 100)
            .unwrap()
            .unwrap();
        assert!((hit.ma20 - 9.95).abs() < 1e-9);
        assert!((hit.breakthrough_pct - (11.0 - 9.95) / 9.95 * 100.0).abs() < 1e-9);

        assert!(matches!(
            ma_breakthrough(&bars_from_closes(&closes[..20], 500), 100),
            Err(IndicatorError::InsufficientData { needed: 21, got: 20 })
        ));
    }

    #[test]
    fn test_gated_averages_respect_floor() {
        let rising: Vec<f64> = (1..=30).map(f64::from).collect();
        let thin = with_last_volume(bars_from_closes(&rising, 500), 50);
        assert!(ma_trend(&thin, 100).unwrap().is_none());

        let thin = with_last_volume(cross_series(10.0, 9.0, 15.0), 50);
        assert!(ma_cross(&thin, 100).unwrap().is_none());

        let mut closes = vec![10.0; 19];
        closes.extend([9.0, 11.0]);
        let thin = with_last_volume(bars_from_closes(&closes, 500), 50);
        assert!(ma_breakthrough(&thin, 100).unwrap().is_none());
    }
}
