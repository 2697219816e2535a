use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::alerts::{AlertEngine, ScanSummary, compute_scan_summary};
use crate::core::pipeline::{FetchMode, Pipeline};
use crate::core::{AlertEvent, Chain, ScoredWallet, Wallet};
use crate::db::SharedDatabase;
use crate::error::{Result, WhaleError};
use crate::fetchers::validate_address;
use crate::signals::{Correlation, ScoringEngine};

/// Which wallets a scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    /// One address; scanned ad hoc when it is not tracked.
    Address { address: String, chain: Chain },
    Chain(Chain),
    All,
}

impl ScanTarget {
    fn label(&self) -> String {
        match self {
            ScanTarget::Address { chain, .. } | ScanTarget::Chain(chain) => chain.to_string(),
            ScanTarget::All => "ALL".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: ScanTarget,
    pub hours: u32,
    /// Trims the returned wallets only; 0 returns all.
    pub threshold: u8,
    pub use_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub scan_time: DateTime<Utc>,
    pub chain: String,
    pub window_hours: u32,
    pub wallets_scanned: usize,
    pub alerts_triggered: usize,
    pub wallets: Vec<ScoredWallet>,
    pub alerts: Vec<AlertEvent>,
    pub summary: ScanSummary,
}

/// One-shot batch scans.
pub struct Scanner<'a> {
    db: SharedDatabase,
    pipeline: &'a Pipeline,
    scoring: &'a ScoringEngine,
    alerts: &'a AlertEngine,
    cache_ttl: Duration,
}

impl<'a> Scanner<'a> {
    pub fn new(
        db: SharedDatabase,
        pipeline: &'a Pipeline,
        scoring: &'a ScoringEngine,
        alerts: &'a AlertEngine,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            db,
            pipeline,
            scoring,
            alerts,
            cache_ttl,
        }
    }

    fn cohort(&self, target: &ScanTarget) -> Result<Vec<Wallet>> {
        let wallets = match target {
            ScanTarget::Address { address, chain } => {
                if !validate_address(*chain, address) {
                    return Err(WhaleError::InvalidAddress {
                        chain: *chain,
                        address: address.clone(),
                    });
                }
                match self.db.get_wallet(address, *chain) {
                    Ok(wallet) => vec![wallet],
                    Err(WhaleError::WalletNotFound { .. }) => {
                        vec![Wallet::ad_hoc(&chain.normalize_address(address), *chain)]
                    }
                    Err(e) => return Err(e),
                }
            }
            ScanTarget::Chain(chain) => self.db.list_wallets(Some(*chain), true)?,
            ScanTarget::All => self.db.list_wallets(None, true)?,
        };
        if wallets.is_empty() {
            return Err(WhaleError::NoWallets);
        }
        Ok(wallets)
    }

    /// Fetch, score with peer correlation per chain, persist every snapshot,
    /// then alert over the whole cohort.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanResult> {
        let scan_time = Utc::now();
        let wallets = self.cohort(&request.target)?;
        let mode = if request.use_cache {
            FetchMode::CacheAside { ttl: self.cache_ttl }
        } else {
            FetchMode::Fresh
        };
        info!(
            target = %request.target.label(),
            wallets = wallets.len(),
            hours = request.hours,
            "scan started"
        );

        let by_chain = self.pipeline.collect(&wallets, request.hours, mode).await?;
        let mut scored: Vec<ScoredWallet> = Vec::with_capacity(wallets.len());
        for cohort in by_chain.values() {
            scored.extend(self.scoring.score_cohort(cohort, request.hours, Correlation::Cohort));
        }

        for wallet in &scored {
            self.db.save_score(&wallet.snapshot)?;
        }
        let alerts = self.alerts.process_alerts(&mut scored).await?;
        let summary = compute_scan_summary(&scored, &alerts);

        scored.sort_by(|a, b| b.snapshot.total.cmp(&a.snapshot.total));
        if request.threshold > 0 {
            scored.retain(|w| w.snapshot.total >= request.threshold);
        }

        info!(
            wallets = wallets.len(),
            alerts = alerts.len(),
            dominant = ?summary.dominant_signal,
            "scan finished"
        );
        Ok(ScanResult {
            scan_id: Uuid::new_v4().to_string(),
            scan_time,
            chain: request.target.label(),
            window_hours: request.hours,
            wallets_scanned: wallets.len(),
            alerts_triggered: alerts.len(),
            wallets: scored,
            alerts,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::DominantSignal;
    use crate::config::AlertConfig;
    use crate::core::Direction;
    use crate::core::pipeline::tests::{MockFetcher, inflow};
    use crate::db::temp_db;
    use crate::fetchers::Fetchers;
    use crate::tags::ExchangeDirectory;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const A: &str = "0xaaaa000000000000000000000000000000000001";
    const B: &str = "0xbbbb000000000000000000000000000000000002";
    const C: &str = "0xcccc000000000000000000000000000000000003";

    struct Harness {
        db: SharedDatabase,
        pipeline: Pipeline,
        scoring: ScoringEngine,
        alerts: AlertEngine,
    }

    impl Harness {
        fn new(mock: MockFetcher) -> Self {
            let db = temp_db();
            let alert_config = AlertConfig {
                score_threshold: 101,
                flow_threshold_usd: 1_000_000.0,
                ..AlertConfig::default()
            };
            Self {
                pipeline: Pipeline::new(db.clone(), Fetchers::default().with(Arc::new(mock))),
                scoring: ScoringEngine::new(ExchangeDirectory::empty()),
                alerts: AlertEngine::new(db.clone(), alert_config),
                db,
            }
        }

        fn scanner(&self) -> Scanner<'_> {
            Scanner::new(
                self.db.clone(),
                &self.pipeline,
                &self.scoring,
                &self.alerts,
                Duration::from_secs(3600),
            )
        }
    }

    fn request(target: ScanTarget) -> ScanRequest {
        ScanRequest {
            target,
            hours: 24,
            threshold: 0,
            use_cache: false,
        }
    }

    fn accumulating_mock() -> MockFetcher {
        MockFetcher::new(Chain::Eth)
            .with_txs(A, vec![inflow("0x1", A, 2_000_000.0)])
            .with_txs(B, vec![inflow("0x2", B, 500_000.0)])
            .with_txs(C, vec![inflow("0x3", C, 300_000.0)])
    }

    fn track(db: &SharedDatabase, address: &str) {
        db.add_wallet(address, Chain::Eth, "", &BTreeSet::new()).unwrap();
    }

    #[tokio::test]
    async fn empty_registry_is_no_wallets() {
        let h = Harness::new(MockFetcher::new(Chain::Eth));
        let err = h.scanner().scan(&request(ScanTarget::All)).await.unwrap_err();
        assert!(matches!(err, WhaleError::NoWallets));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn cohort_scan_correlates_persists_and_alerts() {
        let h = Harness::new(accumulating_mock());
        for addr in [A, B, C] {
            track(&h.db, addr);
        }

        let result = h.scanner().scan(&request(ScanTarget::Chain(Chain::Eth))).await.unwrap();
        assert_eq!(result.wallets_scanned, 3);
        assert_eq!(result.chain, "ETH");
        assert!(result.wallets.iter().all(|w| w.snapshot.breakdown.correlation == 20));
        assert!(result.wallets.iter().all(|w| w.snapshot.direction == Direction::Accumulating));
        assert_eq!(result.summary.dominant_signal, DominantSignal::Accumulating);

        // Only A crosses the $1M flow threshold
        assert_eq!(result.alerts_triggered, 1);
        assert_eq!(result.alerts[0].address, A);
        let a = result.wallets.iter().find(|w| w.snapshot.address == A).unwrap();
        assert!(a.snapshot.alert_triggered);

        for addr in [A, B, C] {
            assert_eq!(h.db.score_history(addr, Chain::Eth, 1).unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn threshold_trims_returned_wallets_only() {
        let h = Harness::new(accumulating_mock());
        for addr in [A, B, C] {
            track(&h.db, addr);
        }
        let mut req = request(ScanTarget::All);
        req.threshold = 100;

        let result = h.scanner().scan(&req).await.unwrap();
        assert!(result.wallets.is_empty());
        assert_eq!(result.wallets_scanned, 3);
        assert_eq!(result.summary.accumulating, 3);
        assert_eq!(result.alerts_triggered, 1);
        assert_eq!(result.chain, "ALL");
    }

    #[tokio::test]
    async fn untracked_address_scans_ad_hoc() {
        let h = Harness::new(accumulating_mock());
        let target = ScanTarget::Address {
            address: A.to_ascii_uppercase().replacen("0X", "0x", 1),
            chain: Chain::Eth,
        };
        let result = h.scanner().scan(&request(target)).await.unwrap();
        assert_eq!(result.wallets_scanned, 1);
        assert_eq!(result.wallets[0].snapshot.address, A);
        // A lone wallet has no peers
        assert_eq!(result.wallets[0].snapshot.breakdown.correlation, 0);
        assert!(h.db.list_wallets(None, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_address_rejected() {
        let h = Harness::new(MockFetcher::new(Chain::Eth));
        let target = ScanTarget::Address {
            address: "0xnope".into(),
            chain: Chain::Eth,
        };
        let err = h.scanner().scan(&request(target)).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_address");
    }

    #[tokio::test]
    async fn rescan_inside_window_does_not_realert() {
        let h = Harness::new(accumulating_mock());
        track(&h.db, A);
        let first = h.scanner().scan(&request(ScanTarget::All)).await.unwrap();
        let second = h.scanner().scan(&request(ScanTarget::All)).await.unwrap();
        assert_eq!(first.alerts_triggered, 1);
        assert_eq!(second.alerts_triggered, 0);
        assert!(!second.wallets[0].snapshot.alert_triggered);
    }
}
