//! Symbol discovery: probing the four-digit code space against board listings.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::control::{Flow, SyncControl};
use super::membership::{MembershipSource, NameDirectory};
use super::rate_limiter::SharedRateLimiter;
use super::store::SymbolRegistry;
use super::{Market, Symbol};

/// Every candidate code, `0000` through `9999`.
pub fn code_space() -> impl Iterator<Item = String> {
    (0..10_000u32).map(|n| format!("{:04}", n))
}

/// Result of probing one code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Already in the valid or invalid registry; no request made
    AlreadyKnown,
    /// Found on a board and registered valid
    Registered(Market),
    /// Every source answered "not listed"
    Invalid,
    /// Some sources failed and none matched; retried next run
    Unresolved,
}

/// Counts for a probe run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub scanned: usize,
    pub already_known: usize,
    pub registered_twse: usize,
    pub registered_tpex: usize,
    pub invalid: usize,
    pub unresolved: usize,
    pub stopped: bool,
}

impl ProbeSummary {
    fn record(&mut self, outcome: ProbeOutcome) {
        self.scanned += 1;
        match outcome {
            ProbeOutcome::AlreadyKnown => self.already_known += 1,
            ProbeOutcome::Registered(Market::Tpex) => self.registered_tpex += 1,
            ProbeOutcome::Registered(_) => self.registered_twse += 1,
            ProbeOutcome::Invalid => self.invalid += 1,
            ProbeOutcome::Unresolved => self.unresolved += 1,
        }
    }

    pub fn registered(&self) -> usize {
        self.registered_twse + self.registered_tpex
    }
}

impl fmt::Display for ProbeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Probe {}", if self.stopped { "stopped" } else { "complete" })?;
        writeln!(f, "  scanned:       {}", self.scanned)?;
        writeln!(f, "  already known: {}", self.already_known)?;
        writeln!(
            f,
            "  registered:    {} (twse {}, tpex {})",
            self.registered(),
            self.registered_twse,
            self.registered_tpex
        )?;
        writeln!(f, "  invalid:       {}", self.invalid)?;
        write!(f, "  unresolved:    {}", self.unresolved)
    }
}

/// Classifies codes by asking membership sources in a fixed order.
pub struct SymbolProber {
    registry: Arc<dyn SymbolRegistry>,
    /// Consulted in order; the first match wins
    sources: Vec<Arc<dyn MembershipSource>>,
    rate_limiter: SharedRateLimiter,
    control: SyncControl,
}

impl SymbolProber {
    pub fn new(
        registry: Arc<dyn SymbolRegistry>,
        sources: Vec<Arc<dyn MembershipSource>>,
        rate_limiter: SharedRateLimiter,
    ) -> Self {
        Self {
            registry,
            sources,
            rate_limiter,
            control: SyncControl::new(),
        }
    }

    pub fn with_control(mut self, control: SyncControl) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> &SyncControl {
        &self.control
    }

    /// Probe a single code.
    ///
    /// Fails with `SourcesExhausted` when every source errored.
    pub async fn probe_code(&self, code: &str) -> Result<ProbeOutcome> {
        if self.registry.is_known_valid(code).await? || self.registry.is_known_invalid(code).await?
        {
            return Ok(ProbeOutcome::AlreadyKnown);
        }

        self.rate_limiter.acquire().await;

        let mut failures = 0usize;
        for source in &self.sources {
            match source.lookup(code).await {
                Ok(Some(name)) => {
                    let symbol = Symbol::new(code, name, source.market());
                    self.registry.register_valid(&symbol).await?;
                    info!(code, name = %symbol.name, market = %symbol.market, "Registered symbol");
                    return Ok(ProbeOutcome::Registered(symbol.market));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(code, source = source.name(), error = %e, "Membership lookup failed");
                    failures += 1;
                }
            }
        }

        if failures == 0 {
            self.registry.register_invalid(code).await?;
            debug!(code, "Code not listed on any board");
            return Ok(ProbeOutcome::Invalid);
        }

        if failures == self.sources.len() {
            return Err(taiex_common::Error::SourcesExhausted(format!(
                "every membership source failed for {}",
                code
            ))
            .into());
        }

        Ok(ProbeOutcome::Unresolved)
    }

    /// Probe `codes` in order, stopping early on a stop request.
    pub async fn probe_codes<I>(&self, codes: I) -> Result<ProbeSummary>
    where
        I: IntoIterator<Item = String>,
    {
        let mut summary = ProbeSummary::default();

        for code in codes {
            if self.control.checkpoint().await == Flow::Stop {
                summary.stopped = true;
                break;
            }

            let outcome = self.probe_code(&code).await?;
            summary.record(outcome);

            if summary.scanned % 500 == 0 {
                info!(
                    scanned = summary.scanned,
                    registered = summary.registered(),
                    invalid = summary.invalid,
                    "Probe progress"
                );
            }
        }

        info!(
            scanned = summary.scanned,
            registered = summary.registered(),
            invalid = summary.invalid,
            unresolved = summary.unresolved,
            stopped = summary.stopped,
            "Probe finished"
        );
        Ok(summary)
    }

    /// Probe the whole code space.
    pub async fn probe_all(&self) -> Result<ProbeSummary> {
        self.probe_codes(code_space()).await
    }
}

/// Counts from [`refresh_names`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameRefresh {
    pub updated: usize,
    pub skipped_invalid: usize,
}

/// Upsert name and board for every directory entry not known to be invalid.
///
/// An entry with no board classification keeps the board already on record.
pub async fn refresh_names(
    directory: &dyn NameDirectory,
    registry: &dyn SymbolRegistry,
) -> Result<NameRefresh> {
    let entries = directory
        .entries()
        .await
        .map_err(|e| taiex_common::Error::SourcesExhausted(format!("name directory: {}", e)))?;

    let mut refresh = NameRefresh::default();
    for entry in entries {
        if registry.is_known_invalid(&entry.code).await? {
            refresh.skipped_invalid += 1;
            continue;
        }

        let market = match entry.market {
            Market::Unknown => registry
                .get(&entry.code)
                .await?
                .map(|s| s.market)
                .unwrap_or(Market::Unknown),
            market => market,
        };

        registry
            .register_valid(&Symbol::new(entry.code, entry.name, market))
            .await?;
        refresh.updated += 1;
    }

    info!(
        updated = refresh.updated,
        skipped_invalid = refresh.skipped_invalid,
        "Symbol names refreshed"
    );
    Ok(refresh)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::membership::ListingEntry;
    use crate::data::provider::AdapterError;
    use crate::data::rate_limiter::shared_limiter;
    use crate::data::{MarketFilter, SqliteStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeListing {
        market: Market,
        codes: HashMap<String, String>,
        fail: bool,
        calls: AtomicU32,
    }

    impl FakeListing {
        fn new(market: Market, codes: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                market,
                codes: codes
                    .iter()
                    .map(|(c, n)| (c.to_string(), n.to_string()))
                    .collect(),
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(market: Market) -> Arc<Self> {
            Arc::new(Self {
                market,
                codes: HashMap::new(),
                fail: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MembershipSource for FakeListing {
        fn market(&self) -> Market {
            self.market
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn lookup(&self, code: &str) -> Result<Option<String>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterError::Network("unreachable".into()));
            }
            Ok(self.codes.get(code).cloned())
        }
    }

    fn store() -> (Arc<SqliteStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("probe.db")).unwrap();
        (Arc::new(store), dir)
    }

    fn prober(store: &Arc<SqliteStore>, sources: Vec<Arc<dyn MembershipSource>>) -> SymbolProber {
        SymbolProber::new(
            store.clone(),
            sources,
            shared_limiter("probe", Duration::from_millis(1), 0),
        )
    }

    #[test]
    fn test_code_space() {
        let codes: Vec<String> = code_space().collect();
        assert_eq!(codes.len(), 10_000);
        assert_eq!(codes[0], "0000");
        assert_eq!(codes[50], "0050");
        assert_eq!(codes[9999], "9999");
    }

    #[tokio::test]
    async fn test_probe_first_match_wins() {
        let (store, _dir) = store();
        let twse = FakeListing::new(Market::Twse, &[("2330", "台積電")]);
        let tpex = FakeListing::new(Market::Tpex, &[("2330", "wrong"), ("6488", "環球晶")]);
        let prober = prober(&store, vec![twse.clone(), tpex.clone()]);

        assert_eq!(
            prober.probe_code("2330").await.unwrap(),
            ProbeOutcome::Registered(Market::Twse)
        );
        assert_eq!(tpex.calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            prober.probe_code("6488").await.unwrap(),
            ProbeOutcome::Registered(Market::Tpex)
        );
        assert_eq!(store.get("2330").await.unwrap().unwrap().name, "台積電");
    }

    #[tokio::test]
    async fn test_probe_unlisted_is_invalid_and_not_reprobed() {
        let (store, _dir) = store();
        let twse = FakeListing::new(Market::Twse, &[]);
        let prober = prober(&store, vec![twse.clone()]);

        assert_eq!(prober.probe_code("1234").await.unwrap(), ProbeOutcome::Invalid);
        assert!(store.is_known_invalid("1234").await.unwrap());

        assert_eq!(prober.probe_code("1234").await.unwrap(), ProbeOutcome::AlreadyKnown);
        assert_eq!(twse.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_unresolved() {
        let (store, _dir) = store();
        let twse = FakeListing::new(Market::Twse, &[]);
        let tpex = FakeListing::failing(Market::Tpex);
        let prober = prober(&store, vec![twse, tpex]);

        assert_eq!(prober.probe_code("1234").await.unwrap(), ProbeOutcome::Unresolved);
        assert!(!store.is_known_invalid("1234").await.unwrap());
        assert!(!store.is_known_valid("1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_total_failure_is_fatal() {
        let (store, _dir) = store();
        let prober = prober(
            &store,
            vec![FakeListing::failing(Market::Twse), FakeListing::failing(Market::Tpex)],
        );

        let err = prober.probe_code("2330").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<taiex_common::Error>(),
            Some(taiex_common::Error::SourcesExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_codes_summary_and_stop() {
        let (store, _dir) = store();
        let twse = FakeListing::new(Market::Twse, &[("0050", "元大台灣50")]);
        let prober = prober(&store, vec![twse]);

        let codes = ["0050", "0051", "0050"].map(String::from);
        let summary = prober.probe_codes(codes).await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.registered_twse, 1);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.already_known, 1);

        prober.control().stop();
        let summary = prober.probe_all().await.unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.scanned, 0);
    }

    struct FakeDirectory(Vec<ListingEntry>);

    #[async_trait]
    impl NameDirectory for FakeDirectory {
        async fn entries(&self) -> Result<Vec<ListingEntry>, AdapterError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_refresh_names() {
        let (store, _dir) = store();
        store
            .register_valid(&Symbol::new("2330", "old", Market::Twse))
            .await
            .unwrap();
        store.register_invalid("9999").await.unwrap();

        let directory = FakeDirectory(vec![
            ListingEntry {
                code: "2330".into(),
                name: "台積電".into(),
                market: Market::Unknown,
            },
            ListingEntry {
                code: "6488".into(),
                name: "環球晶".into(),
                market: Market::Tpex,
            },
            ListingEntry {
                code: "9999".into(),
                name: "ghost".into(),
                market: Market::Twse,
            },
        ]);

        let refresh = refresh_names(&directory, store.as_ref()).await.unwrap();
        assert_eq!(refresh.updated, 2);
        assert_eq!(refresh.skipped_invalid, 1);

        let tsmc = store.get("2330").await.unwrap().unwrap();
        assert_eq!(tsmc.name, "台積電");
        assert_eq!(tsmc.market, Market::Twse);
        assert_eq!(store.list_valid(MarketFilter::All).await.unwrap().len(), 2);
    }
}
