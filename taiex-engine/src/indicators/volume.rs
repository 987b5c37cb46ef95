//! Volume indicators.

use serde::Serialize;

use super::{is_liquid, tail, IndicatorResult};
use crate::data::DailyBar;

/// Days averaged as the surge baseline.
pub const SURGE_BASELINE_DAYS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeSurge {
    /// Today's volume over the baseline average
    pub ratio: f64,
    pub volume: u64,
    pub avg_volume: f64,
    pub close: f64,
}

/// `Some` when today's volume exceeds `ratio` times the mean of the prior
/// five days. A zero baseline never signals.
pub fn volume_surge(
    bars: &[DailyBar],
    ratio: f64,
    floor: u64,
) -> IndicatorResult<Option<VolumeSurge>> {
    let window = tail(bars, SURGE_BASELINE_DAYS + 1)?;
    if !is_liquid(bars, floor) {
        return Ok(None);
    }

    let (baseline, today) = window.split_at(SURGE_BASELINE_DAYS);
    let today = &today[0];
    let avg_volume =
        baseline.iter().map(|b| b.volume as f64).sum::<f64>() / SURGE_BASELINE_DAYS as f64;
    if avg_volume <= 0.0 {
        return Ok(None);
    }

    let observed = today.volume as f64 / avg_volume;
    Ok((observed > ratio).then(|| VolumeSurge {
        ratio: observed,
        volume: today.volume,
        avg_volume,
        close: today.close,
    }))
}
