//! Bollinger bands.

use serde::Serialize;

use super::{pct, require, sma, IndicatorResult};

pub const BOLLINGER_PERIOD: usize = 20;

/// Band half-width in standard deviations.
pub const BOLLINGER_K: f64 = 2.0;

/// Bands over the latest window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bollinger {
    pub mid: f64,
    pub upper: f64,
    pub lower: f64,
    /// Population standard deviation of the window
    pub std_dev: f64,
}

impl Bollinger {
    /// `(upper - lower) / mid × 100`; zero when the mean is zero.
    pub fn width_pct(&self) -> f64 {
        if self.mid == 0.0 {
            0.0
        } else {
            pct(self.upper - self.lower, self.mid)
        }
    }

    /// Where `close` sits between the bands, 0 at the lower band and 100 at
    /// the upper. `None` when the bands have collapsed.
    pub fn position_pct(&self, close: f64) -> Option<f64> {
        let band = self.upper - self.lower;
        (band > 0.0).then(|| pct(close - self.lower, band))
    }
}

/// Bands of `k` population standard deviations around the `n`-day mean.
pub fn bollinger(closes: &[f64], n: usize, k: f64) -> IndicatorResult<Bollinger> {
    require(closes.len(), n.max(1))?;
    let window = &closes[closes.len() - n.max(1)..];
    let mid = sma(window, window.len())?;
    let variance = window.iter().map(|c| (c - mid).powi(2)).sum::<f64>() / window.len() as f64;
    let std_dev = variance.sqrt();

    Ok(Bollinger {
        mid,
        upper: mid + k * std_dev,
        lower: mid - k * std_dev,
        std_dev,
    })
}
