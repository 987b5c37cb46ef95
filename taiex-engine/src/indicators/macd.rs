//! MACD (12/26/9) and its zero-line cross.

use serde::Serialize;

use super::{ema, require, Cross, IndicatorResult};

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;

/// Closes needed for today's signal line.
pub const MACD_MIN_POINTS: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Macd {
    pub macd: f64,
    /// Yesterday's MACD line
    pub prev_macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

fn macd_line(closes: &[f64]) -> IndicatorResult<f64> {
    Ok(ema(closes, FAST)? - ema(closes, SLOW)?)
}

pub fn macd(closes: &[f64]) -> IndicatorResult<Macd> {
    require(closes.len(), MACD_MIN_POINTS)?;
    let len = closes.len();

    let series = (len + 1 - SIGNAL..=len)
        .map(|end| macd_line(&closes[..end]))
        .collect::<IndicatorResult<Vec<_>>>()?;
    let macd = series[SIGNAL - 1];
    let signal = ema(&series, SIGNAL)?;

    Ok(Macd {
        macd,
        prev_macd: series[SIGNAL - 2],
        signal,
        histogram: macd - signal,
    })
}

/// Golden when the MACD line moves from below zero to above it, death for
/// the reverse.
pub fn macd_cross(closes: &[f64]) -> IndicatorResult<Option<(Cross, Macd)>> {
    let m = macd(closes)?;
    let cross = if m.prev_macd < 0.0 && m.macd > 0.0 {
        Some(Cross::Golden)
    } else if m.prev_macd > 0.0 && m.macd < 0.0 {
        Some(Cross::Death)
    } else {
        None
    };
    Ok(cross.map(|c| (c, m)))
}
