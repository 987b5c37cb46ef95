//! Cross-source verification of stored bars.

use anyhow::Result;
use chrono::NaiveDate;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::provider::{fetch_range, SourceAdapter};
use super::store::BarStore;
use super::{round2, SourceKind, Symbol};

/// Largest lot difference still treated as agreement (sources round shares differently).
const VOLUME_TOLERANCE_LOTS: u64 = 1;

/// The values compared between sources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BarValues {
    pub close: f64,
    pub volume: u64,
}

impl BarValues {
    pub fn agrees_with(&self, other: &BarValues) -> bool {
        (round2(self.close) - round2(other.close)).abs() < 0.005
            && self.volume.abs_diff(other.volume) <= VOLUME_TOLERANCE_LOTS
    }
}

/// A date where the store and at least one source disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub date: NaiveDate,
    /// `None` when the store has no bar for the date
    pub stored: Option<BarValues>,
    pub candidates: Vec<(SourceKind, BarValues)>,
    /// Highest-authority candidate
    pub preferred: Option<(SourceKind, BarValues)>,
}

/// Compare stored bars in `[start, end]` with every adapter serving the symbol.
///
/// Sources that fail are logged and left out of the comparison.
pub async fn verify_range(
    bars: &dyn BarStore,
    adapters: &[Arc<dyn SourceAdapter>],
    symbol: &Symbol,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Discrepancy>> {
    let stored: BTreeMap<NaiveDate, BarValues> = bars
        .get_range(&symbol.code, start, end)
        .await?
        .into_iter()
        .map(|b| {
            (
                b.date,
                BarValues {
                    close: b.close,
                    volume: b.volume,
                },
            )
        })
        .collect();

    let mut candidates: BTreeMap<NaiveDate, Vec<(SourceKind, BarValues)>> = BTreeMap::new();
    for adapter in adapters.iter().filter(|a| a.serves(symbol.market)) {
        let mut stream = fetch_range(&**adapter, symbol, start, end);
        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => candidates.entry(raw.date).or_default().push((
                    raw.source,
                    BarValues {
                        close: raw.close,
                        volume: raw.volume,
                    },
                )),
                Err(e) => warn!(
                    code = %symbol.code,
                    source = adapter.name(),
                    error = %e,
                    "Verification window failed"
                ),
            }
        }
    }

    let dates: BTreeSet<NaiveDate> = stored.keys().chain(candidates.keys()).copied().collect();
    let mut discrepancies = Vec::new();

    for date in dates {
        let Some(found) = candidates.remove(&date) else {
            continue;
        };
        let stored_values = stored.get(&date).copied();

        let disagrees = match &stored_values {
            Some(values) => found.iter().any(|(_, c)| !c.agrees_with(values)),
            None => true,
        };
        if !disagrees {
            continue;
        }

        let preferred = found
            .iter()
            .copied()
            .max_by_key(|(source, _)| source.authority());
        discrepancies.push(Discrepancy {
            date,
            stored: stored_values,
            candidates: found,
            preferred,
        });
    }

    info!(
        code = %symbol.code,
        %start,
        %end,
        stored = stored.len(),
        discrepancies = discrepancies.len(),
        "Verification finished"
    );
    Ok(discrepancies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::{AdapterError, DateWindow, WindowGranularity};
    use crate::data::{DailyBar, Market, RawBar, SqliteStore};
    use async_trait::async_trait;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    struct FixedSource {
        kind: SourceKind,
        bars: Vec<(u32, f64, u64)>,
    }

    #[async_trait]
    impl SourceAdapter for FixedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn priority(&self) -> u8 {
            1
        }

        fn serves(&self, _market: Market) -> bool {
            true
        }

        fn granularity(&self) -> WindowGranularity {
            WindowGranularity::Monthly
        }

        async fn fetch_window(
            &self,
            _symbol: &Symbol,
            window: DateWindow,
        ) -> Result<Vec<RawBar>, AdapterError> {
            Ok(self
                .bars
                .iter()
                .map(|&(d, close, volume)| RawBar {
                    source: self.kind,
                    date: day(d),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume,
                })
                .filter(|b| window.contains(b.date))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_verify_reports_disagreements_with_preferred_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("verify.db")).unwrap();
        for (d, close, volume) in [(2, 593.0, 25_388), (3, 578.0, 37_146)] {
            let bar = DailyBar {
                code: "2330".into(),
                date: day(d),
                open: close,
                high: close,
                low: close,
                close,
                volume,
            };
            store.upsert_if_absent(&bar, SourceKind::Yahoo).await.unwrap();
        }

        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(FixedSource {
                kind: SourceKind::Twse,
                bars: vec![(2, 593.0, 25_387), (3, 580.0, 37_146), (4, 590.0, 20_000)],
            }),
            Arc::new(FixedSource {
                kind: SourceKind::FinMind,
                bars: vec![(2, 593.0, 25_388), (3, 578.0, 37_146)],
            }),
        ];

        let symbol = Symbol::new("2330", "台積電", Market::Twse);
        let found = verify_range(&store, &adapters, &symbol, day(1), day(31)).await.unwrap();

        // Jan 2 agrees within tolerance; Jan 3 close differs; Jan 4 is missing locally
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].date, day(3));
        assert_eq!(found[0].preferred.unwrap().0, SourceKind::Twse);
        assert_eq!(found[0].preferred.unwrap().1.close, 580.0);
        assert_eq!(found[1].date, day(4));
        assert!(found[1].stored.is_none());
    }

    #[test]
    fn test_bar_values_agreement() {
        let a = BarValues { close: 10.0, volume: 100 };
        assert!(a.agrees_with(&BarValues { close: 10.001, volume: 101 }));
        assert!(!a.agrees_with(&BarValues { close: 10.01, volume: 100 }));
        assert!(!a.agrees_with(&BarValues { close: 10.0, volume: 103 }));
    }
}
