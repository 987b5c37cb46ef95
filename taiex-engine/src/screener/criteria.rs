//! Screening criteria and screener configuration.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::indicators::{
    BOLLINGER_PERIOD, DEFAULT_LIQUIDITY_FLOOR, MACD_MIN_POINTS, SURGE_BASELINE_DAYS,
};

// ============================================================================
// Criterion
// ============================================================================

/// What a screen looks for, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Criterion {
    /// Swing of at least `min_pct` over the last `days` bars
    Volatility { days: usize, min_pct: f64 },
    /// Every liquid symbol, ranked by its position inside the bands
    BollingerPosition,
    /// Every liquid symbol, tightest bands first
    BollingerWidth,
    /// |close vs MA20| of at least `min_abs_pct`
    Bias { min_abs_pct: f64 },
    MaTrend,
    MaCross,
    MaBreakthrough,
    VolumeSurge { ratio: f64 },
    PriceGap { min_pct: f64 },
    MacdCross,
    Sideways { window: usize, threshold_pct: f64 },
    DailyRebound { lookback: usize, min_pct: f64 },
    /// Swing across one calendar month
    PeriodVolatility {
        year: i32,
        month: u32,
        min_pct: f64,
        min_total_volume: u64,
    },
    /// Single-day range on `date`
    IntradayRange {
        date: NaiveDate,
        min_range_pct: f64,
        min_volume: u64,
    },
}

/// Bars a criterion reads for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarWindow {
    /// The most recent `n` bars
    Latest(usize),
    /// Every bar in `[start, end]`
    Range(NaiveDate, NaiveDate),
    /// Exactly one date
    On(NaiveDate),
}

impl Criterion {
    /// Stable kebab-case name, also the key for floor overrides.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn kind(&self) -> CriterionKind {
        match self {
            Self::Volatility { .. } => CriterionKind::Volatility,
            Self::BollingerPosition => CriterionKind::BollingerPosition,
            Self::BollingerWidth => CriterionKind::BollingerWidth,
            Self::Bias { .. } => CriterionKind::Bias,
            Self::MaTrend => CriterionKind::MaTrend,
            Self::MaCross => CriterionKind::MaCross,
            Self::MaBreakthrough => CriterionKind::MaBreakthrough,
            Self::VolumeSurge { .. } => CriterionKind::VolumeSurge,
            Self::PriceGap { .. } => CriterionKind::PriceGap,
            Self::MacdCross => CriterionKind::MacdCross,
            Self::Sideways { .. } => CriterionKind::Sideways,
            Self::DailyRebound { .. } => CriterionKind::DailyRebound,
            Self::PeriodVolatility { .. } => CriterionKind::PeriodVolatility,
            Self::IntradayRange { .. } => CriterionKind::IntradayRange,
        }
    }

    /// The minimal window of bars needed to evaluate this criterion.
    pub fn window(&self) -> BarWindow {
        match self {
            Self::Volatility { days, .. } => BarWindow::Latest(*days),
            Self::BollingerPosition | Self::BollingerWidth | Self::Bias { .. } => {
                BarWindow::Latest(BOLLINGER_PERIOD)
            }
            Self::MaTrend => BarWindow::Latest(30),
            Self::MaCross | Self::MaBreakthrough => BarWindow::Latest(21),
            Self::VolumeSurge { .. } => BarWindow::Latest(SURGE_BASELINE_DAYS + 1),
            Self::PriceGap { .. } => BarWindow::Latest(2),
            Self::MacdCross => BarWindow::Latest(MACD_MIN_POINTS),
            Self::Sideways { window, .. } => BarWindow::Latest(*window),
            Self::DailyRebound { lookback, .. } => BarWindow::Latest(*lookback),
            Self::PeriodVolatility { year, month, .. } => {
                let (start, end) = month_bounds(*year, *month);
                BarWindow::Range(start, end)
            }
            Self::IntradayRange { date, .. } => BarWindow::On(*date),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volatility { days, min_pct } => {
                write!(f, "volatility >= {min_pct}% over {days} days")
            }
            Self::Bias { min_abs_pct } => write!(f, "|bias| >= {min_abs_pct}%"),
            Self::VolumeSurge { ratio } => write!(f, "volume > {ratio}x 5-day average"),
            Self::PriceGap { min_pct } => write!(f, "opening gap >= {min_pct}%"),
            Self::Sideways { window, threshold_pct } => {
                write!(f, "range <= {threshold_pct}% over {window} days")
            }
            Self::DailyRebound { lookback, min_pct } => {
                write!(f, "rebound >= {min_pct}% within {lookback} days")
            }
            Self::PeriodVolatility { year, month, min_pct, .. } => {
                write!(f, "volatility >= {min_pct}% in {year}-{month:02}")
            }
            Self::IntradayRange { date, min_range_pct, .. } => {
                write!(f, "intraday range >= {min_range_pct}% on {date}")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// First and last day of a calendar month. Months outside 1-12 are rejected
/// when the criterion is tuned; here they fall back to January.
fn month_bounds(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .or_else(|| NaiveDate::from_ymd_opt(year, 1, 1))
        .unwrap_or_default();
    let last = first
        .checked_add_months(chrono::Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(first);
    (first, last)
}

// ============================================================================
// Criterion names
// ============================================================================

/// Criterion without parameters, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CriterionKind {
    Volatility,
    BollingerPosition,
    BollingerWidth,
    Bias,
    MaTrend,
    MaCross,
    MaBreakthrough,
    VolumeSurge,
    PriceGap,
    MacdCross,
    Sideways,
    DailyRebound,
    PeriodVolatility,
    IntradayRange,
}

impl CriterionKind {
    pub const ALL: [CriterionKind; 14] = [
        Self::Volatility,
        Self::BollingerPosition,
        Self::BollingerWidth,
        Self::Bias,
        Self::MaTrend,
        Self::MaCross,
        Self::MaBreakthrough,
        Self::VolumeSurge,
        Self::PriceGap,
        Self::MacdCross,
        Self::Sideways,
        Self::DailyRebound,
        Self::PeriodVolatility,
        Self::IntradayRange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volatility => "volatility",
            Self::BollingerPosition => "bollinger-position",
            Self::BollingerWidth => "bollinger-width",
            Self::Bias => "bias",
            Self::MaTrend => "ma-trend",
            Self::MaCross => "ma-cross",
            Self::MaBreakthrough => "ma-breakthrough",
            Self::VolumeSurge => "volume-surge",
            Self::PriceGap => "price-gap",
            Self::MacdCross => "macd-cross",
            Self::Sideways => "sideways",
            Self::DailyRebound => "daily-rebound",
            Self::PeriodVolatility => "period-volatility",
            Self::IntradayRange => "intraday-range",
        }
    }

    /// The criterion with its default parameters.
    ///
    /// Period volatility defaults to last December; intraday range to `today`.
    pub fn with_defaults(&self, today: NaiveDate) -> Criterion {
        match self {
            Self::Volatility => Criterion::Volatility {
                days: 30,
                min_pct: 30.0,
            },
            Self::BollingerPosition => Criterion::BollingerPosition,
            Self::BollingerWidth => Criterion::BollingerWidth,
            Self::Bias => Criterion::Bias { min_abs_pct: 10.0 },
            Self::MaTrend => Criterion::MaTrend,
            Self::MaCross => Criterion::MaCross,
            Self::MaBreakthrough => Criterion::MaBreakthrough,
            Self::VolumeSurge => Criterion::VolumeSurge { ratio: 2.0 },
            Self::PriceGap => Criterion::PriceGap { min_pct: 0.0 },
            Self::MacdCross => Criterion::MacdCross,
            Self::Sideways => Criterion::Sideways {
                window: 20,
                threshold_pct: 5.0,
            },
            Self::DailyRebound => Criterion::DailyRebound {
                lookback: 200,
                min_pct: 4.0,
            },
            Self::PeriodVolatility => Criterion::PeriodVolatility {
                year: today.year() - 1,
                month: 12,
                min_pct: 20.0,
                min_total_volume: 1000,
            },
            Self::IntradayRange => Criterion::IntradayRange {
                date: today,
                min_range_pct: 5.0,
                min_volume: 100,
            },
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CriterionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("Unknown criterion: {}", s))
    }
}

// ============================================================================
// Screener Configuration
// ============================================================================

/// Settings shared by every screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Minimum latest-day volume in lots
    pub liquidity_floor: u64,
    /// Floors for specific criteria, keyed by [`Criterion::name`]
    #[serde(default)]
    pub floor_overrides: BTreeMap<String, u64>,
    /// Append `.TW` / `.TWO` when exporting codes
    pub market_suffix: bool,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            liquidity_floor: DEFAULT_LIQUIDITY_FLOOR,
            floor_overrides: BTreeMap::new(),
            market_suffix: true,
        }
    }
}

impl ScreenerConfig {
    /// Liquidity floor applied to `criterion`.
    pub fn floor_for(&self, criterion: &Criterion) -> u64 {
        self.floor_overrides
            .get(criterion.name())
            .copied()
            .unwrap_or(self.liquidity_floor)
    }

    pub fn with_floor_override(mut self, criterion: CriterionKind, floor: u64) -> Self {
        self.floor_overrides.insert(criterion.as_str().to_string(), floor);
        self
    }
}

impl From<&taiex_common::ScreenerSettings> for ScreenerConfig {
    fn from(settings: &taiex_common::ScreenerSettings) -> Self {
        Self {
            liquidity_floor: settings.liquidity_floor,
            floor_overrides: settings.floor_overrides.clone(),
            market_suffix: settings.market_suffix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in CriterionKind::ALL {
            assert_eq!(kind.as_str().parse::<CriterionKind>().unwrap(), kind);
            assert_eq!(kind.with_defaults(day(2025, 3, 1)).kind(), kind);
        }
        assert_eq!(
            "volume_surge".parse::<CriterionKind>().unwrap(),
            CriterionKind::VolumeSurge
        );
        assert!("rsi".parse::<CriterionKind>().is_err());
    }

    #[test]
    fn test_period_defaults_to_last_december() {
        let criterion = CriterionKind::PeriodVolatility.with_defaults(day(2025, 3, 1));
        assert_eq!(
            criterion.window(),
            BarWindow::Range(day(2024, 12, 1), day(2024, 12, 31))
        );
    }

    #[test]
    fn test_month_bounds_handles_february() {
        assert_eq!(month_bounds(2024, 2), (day(2024, 2, 1), day(2024, 2, 29)));
        assert_eq!(month_bounds(2023, 2).1, day(2023, 2, 28));
    }

    #[test]
    fn test_windows() {
        let today = day(2025, 3, 1);
        assert_eq!(
            CriterionKind::MacdCross.with_defaults(today).window(),
            BarWindow::Latest(35)
        );
        assert_eq!(
            CriterionKind::VolumeSurge.with_defaults(today).window(),
            BarWindow::Latest(6)
        );
        assert_eq!(
            CriterionKind::IntradayRange.with_defaults(today).window(),
            BarWindow::On(today)
        );
    }

    #[test]
    fn test_floor_override() {
        let config = ScreenerConfig::default().with_floor_override(CriterionKind::PriceGap, 500);
        assert_eq!(config.floor_for(&Criterion::PriceGap { min_pct: 0.0 }), 500);
        assert_eq!(config.floor_for(&Criterion::MaTrend), 100);
    }
}
