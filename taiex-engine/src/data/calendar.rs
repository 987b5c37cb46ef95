//! Trading calendar helpers.
//!
//! The calendar itself lives in storage (`TradingCalendar`); this module
//! holds the time rules around it. Taiwan has no daylight saving, so Taipei
//! time is a fixed +08:00 offset.

use anyhow::Result;
use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use tracing::info;

use super::provider::DateWindow;
use super::store::{BarStore, TradingCalendar};

const TAIPEI_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// The Asia/Taipei offset.
pub fn taipei_offset() -> FixedOffset {
    FixedOffset::east_opt(TAIPEI_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Current wall-clock time in Taipei.
pub fn taipei_now() -> NaiveDateTime {
    Utc::now().with_timezone(&taipei_offset()).naive_local()
}

/// Last date whose session can be considered complete.
///
/// Before `cutoff_hour` today's bar may still be missing or provisional, so
/// the range ends yesterday.
pub fn effective_end_date(now: NaiveDateTime, cutoff_hour: u32) -> NaiveDate {
    let today = now.date();
    if now.hour() >= cutoff_hour {
        today
    } else {
        today - Duration::days(1)
    }
}

/// Counts produced by [`fill_calendar`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarFill {
    pub marked_trading: usize,
    pub marked_closed: usize,
}

/// Resolve every still-unknown past date in `[start, end]` from the
/// reference instrument's stored bars.
///
/// A stored reference bar means the market traded. A date without one is
/// closed only when it falls between the first and last reference bar in range.
/// Dates on or after `today` are left unknown.
pub async fn fill_calendar(
    calendar: &dyn TradingCalendar,
    bars: &dyn BarStore,
    reference: &str,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Result<CalendarFill> {
    let mut fill = CalendarFill::default();
    if start > end {
        return Ok(fill);
    }

    let known = calendar.known_between(start, end).await?;
    let traded = bars.dates_between(reference, start, end).await?;
    // Closed days are only inferred inside the reference's stored span
    let span = match (traded.first(), traded.last()) {
        (Some(first), Some(last)) => Some(DateWindow::new(*first, *last)),
        _ => None,
    };

    for date in DateWindow::new(start, end).dates() {
        if date >= today || known.contains(&date) {
            continue;
        }
        let has_trading = traded.contains(&date);
        if !has_trading && !span.is_some_and(|s| s.contains(date)) {
            continue;
        }
        if calendar.mark_trading_day(date, has_trading).await? {
            if has_trading {
                fill.marked_trading += 1;
            } else {
                fill.marked_closed += 1;
            }
        }
    }

    info!(
        reference,
        %start,
        %end,
        trading = fill.marked_trading,
        closed = fill.marked_closed,
        "Calendar gaps filled"
    );
    Ok(fill)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DailyBar, SourceKind, SqliteStore};

    fn at(y: i32, m: u32, d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_effective_end_date_cutoff() {
        assert_eq!(effective_end_date(at(2024, 5, 10, 16), 17), day(2024, 5, 9));
        assert_eq!(effective_end_date(at(2024, 5, 10, 17), 17), day(2024, 5, 10));
        assert_eq!(effective_end_date(at(2024, 1, 1, 9), 17), day(2023, 12, 31));
    }

    #[test]
    fn test_taipei_offset() {
        assert_eq!(taipei_offset().local_minus_utc(), 8 * 3600);
    }

    #[tokio::test]
    async fn test_fill_calendar_from_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("cal.db")).unwrap();

        for date in [day(2024, 1, 2), day(2024, 1, 5)] {
            let bar = DailyBar {
                code: "0050".into(),
                date,
                open: 130.0,
                high: 131.0,
                low: 129.5,
                close: 130.8,
                volume: 12000,
            };
            store.upsert_if_absent(&bar, SourceKind::Twse).await.unwrap();
        }
        // Already known dates are left alone
        store.mark_trading_day(day(2024, 1, 3), true).await.unwrap();

        let fill = fill_calendar(&store, &store, "0050", day(2024, 1, 1), day(2024, 1, 8), day(2024, 1, 8))
            .await
            .unwrap();

        assert_eq!(fill.marked_trading, 2);
        assert_eq!(fill.marked_closed, 1); // Jan 4
        assert_eq!(store.is_trading_day(day(2024, 1, 2)).await.unwrap(), Some(true));
        assert_eq!(store.is_trading_day(day(2024, 1, 4)).await.unwrap(), Some(false));
        assert_eq!(store.is_trading_day(day(2024, 1, 5)).await.unwrap(), Some(true));
        // Outside Jan 2..=Jan 5 the reference says nothing
        assert_eq!(store.is_trading_day(day(2024, 1, 1)).await.unwrap(), None);
        assert_eq!(store.is_trading_day(day(2024, 1, 6)).await.unwrap(), None);
        assert_eq!(store.is_trading_day(day(2024, 1, 8)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fill_calendar_without_reference_bars_marks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("cal.db")).unwrap();

        let fill = fill_calendar(&store, &store, "0050", day(2024, 1, 1), day(2024, 1, 31), day(2024, 2, 1))
            .await
            .unwrap();

        assert_eq!(fill, CalendarFill::default());
        assert_eq!(store.is_trading_day(day(2024, 1, 6)).await.unwrap(), None);
    }
}
