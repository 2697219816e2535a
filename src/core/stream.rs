use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, score_passes_threshold};
use crate::config::StreamConfig;
use crate::core::pipeline::{FetchMode, Pipeline};
use crate::core::{Chain, Direction, ScoreBreakdown, ScoredWallet, Wallet};
use crate::db::SharedDatabase;
use crate::error::Result;
use crate::signals::{Correlation, ScoringEngine};

/// Chains polled when no chain is given.
pub const DEFAULT_CHAINS: [Chain; 2] = [Chain::Eth, Chain::Btc];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletEvent {
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub chain: Chain,
    pub label: String,
    pub score: u8,
    pub score_breakdown: ScoreBreakdown,
    pub direction: Direction,
    pub net_flow_usd: f64,
    pub tx_count_in_window: usize,
    pub alert_triggered: bool,
    pub cycle: u64,
}

impl WalletEvent {
    fn from_scored(wallet: &ScoredWallet, cycle: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            address: wallet.snapshot.address.clone(),
            chain: wallet.snapshot.chain,
            label: wallet.label.clone(),
            score: wallet.snapshot.total,
            score_breakdown: wallet.snapshot.breakdown,
            direction: wallet.snapshot.direction,
            net_flow_usd: wallet.snapshot.net_flow_usd,
            tx_count_in_window: wallet.tx_count,
            alert_triggered: wallet.snapshot.alert_triggered,
            cycle,
        }
    }
}

/// One JSONL line of the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart {
        timestamp: DateTime<Utc>,
        chain: String,
        interval_secs: u64,
        threshold: u8,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        cycle: u64,
        wallets_checked: usize,
    },
    WhaleAlert(WalletEvent),
    WhaleActivity(WalletEvent),
    StreamError {
        timestamp: DateTime<Utc>,
        error_code: String,
        message: String,
        recoverable: bool,
        cycle: u64,
    },
    StreamEnd {
        timestamp: DateTime<Utc>,
        cycles_completed: u64,
        total_alerts: usize,
    },
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// `None` polls [`DEFAULT_CHAINS`].
    pub chain: Option<Chain>,
    pub interval: Duration,
    pub threshold: u8,
    pub hours: u32,
    pub correlation: Correlation,
}

impl StreamOptions {
    pub fn from_config(config: &StreamConfig, chain: Option<Chain>) -> Self {
        Self {
            chain,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            threshold: config.threshold,
            hours: config.hours.max(1),
            correlation: if config.correlate_peers {
                Correlation::Cohort
            } else {
                Correlation::Disabled
            },
        }
    }

    fn chains(&self) -> Vec<Chain> {
        match self.chain {
            Some(chain) => vec![chain],
            None => DEFAULT_CHAINS.to_vec(),
        }
    }

    fn chain_label(&self) -> String {
        self.chain.map_or_else(|| "ALL".to_string(), |c| c.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub cycles_completed: u64,
    pub total_alerts: usize,
}

#[derive(Debug, Clone, Copy)]
struct CycleReport {
    wallets: usize,
    /// Cancelled before every wallet was handled.
    interrupted: bool,
}

fn emit(events: &UnboundedSender<StreamEvent>, event: StreamEvent) {
    if events.send(event).is_err() {
        debug!("stream consumer gone, event dropped");
    }
}

/// Poll → score → alert → emit → heartbeat → sleep, until cancelled.
pub struct StreamScheduler {
    db: SharedDatabase,
    pipeline: Pipeline,
    scoring: ScoringEngine,
    alerts: AlertEngine,
    options: StreamOptions,
}

impl StreamScheduler {
    /// The alert engine runs with the stream threshold.
    pub fn new(
        db: SharedDatabase,
        pipeline: Pipeline,
        scoring: ScoringEngine,
        alerts: AlertEngine,
        options: StreamOptions,
    ) -> Self {
        let alerts = alerts.with_score_threshold(options.threshold);
        Self {
            db,
            pipeline,
            scoring,
            alerts,
            options,
        }
    }

    /// Always ends with `stream_end`, cancelled or not.
    pub async fn run(&self, events: &UnboundedSender<StreamEvent>, cancel: &CancellationToken) -> StreamStats {
        let mut stats = StreamStats::default();
        emit(
            events,
            StreamEvent::StreamStart {
                timestamp: Utc::now(),
                chain: self.options.chain_label(),
                interval_secs: self.options.interval.as_secs(),
                threshold: self.options.threshold,
            },
        );
        info!(
            chain = %self.options.chain_label(),
            interval_secs = self.options.interval.as_secs(),
            threshold = self.options.threshold,
            "stream started"
        );

        loop {
            if cancel.is_cancelled() || events.is_closed() {
                break;
            }
            let cycle = stats.cycles_completed + 1;
            let wallets_checked = match self.run_cycle(cycle, events, cancel, &mut stats).await {
                Ok(report) if report.interrupted => {
                    info!(cycle, "stream cancelled mid-cycle");
                    break;
                }
                Ok(report) => report.wallets,
                Err(e) => {
                    warn!(cycle, error_code = e.error_code(), "stream cycle failed: {e}");
                    emit(
                        events,
                        StreamEvent::StreamError {
                            timestamp: Utc::now(),
                            error_code: e.error_code().to_string(),
                            message: e.to_string(),
                            recoverable: true,
                            cycle,
                        },
                    );
                    0
                }
            };
            stats.cycles_completed = cycle;
            emit(
                events,
                StreamEvent::Heartbeat {
                    timestamp: Utc::now(),
                    cycle,
                    wallets_checked,
                },
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }

        emit(
            events,
            StreamEvent::StreamEnd {
                timestamp: Utc::now(),
                cycles_completed: stats.cycles_completed,
                total_alerts: stats.total_alerts,
            },
        );
        info!(
            cycles = stats.cycles_completed,
            alerts = stats.total_alerts,
            "stream ended"
        );
        stats
    }

    fn cohort(&self) -> Result<Vec<Wallet>> {
        let mut wallets = Vec::new();
        for chain in self.options.chains() {
            wallets.extend(self.db.list_wallets(Some(chain), true)?);
        }
        Ok(wallets)
    }

    /// Cancellation is honoured while fetching and before each alert. An
    /// alert that has been persisted is always dispatched, emitted and
    /// counted in `stats`.
    async fn run_cycle(
        &self,
        cycle: u64,
        events: &UnboundedSender<StreamEvent>,
        cancel: &CancellationToken,
        stats: &mut StreamStats,
    ) -> Result<CycleReport> {
        let wallets = self.cohort()?;
        if wallets.is_empty() {
            debug!(cycle, "no wallets tracked on the streamed chains");
            return Ok(CycleReport {
                wallets: 0,
                interrupted: false,
            });
        }
        let interrupted = CycleReport {
            wallets: wallets.len(),
            interrupted: true,
        };
        let hours = self.options.hours;
        let by_chain = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(interrupted),
            collected = self.pipeline.collect(&wallets, hours, FetchMode::Fresh) => collected?,
        };

        let mut scored: Vec<ScoredWallet> = Vec::with_capacity(wallets.len());
        for cohort in by_chain.values() {
            scored.extend(self.scoring.score_cohort(cohort, hours, self.options.correlation));
        }
        for wallet in &scored {
            self.db.save_score(&wallet.snapshot)?;
        }

        // Same predicate the engine alerts on, so a 0 threshold means no alerts
        let (hot, cold): (Vec<ScoredWallet>, Vec<ScoredWallet>) = scored
            .into_iter()
            .partition(|w| score_passes_threshold(w.snapshot.total, self.alerts.config()));
        for wallet in &cold {
            emit(events, StreamEvent::WhaleActivity(WalletEvent::from_scored(wallet, cycle)));
        }

        let mut alerts = 0;
        for mut wallet in hot {
            if cancel.is_cancelled() {
                return Ok(interrupted);
            }
            // Each event follows its own dispatch
            let created = self.alerts.process_alerts(std::slice::from_mut(&mut wallet)).await?;
            alerts += created.len();
            stats.total_alerts += created.len();
            emit(events, StreamEvent::WhaleAlert(WalletEvent::from_scored(&wallet, cycle)));
        }

        debug!(cycle, wallets = wallets.len(), alerts, "stream cycle complete");
        Ok(CycleReport {
            wallets: wallets.len(),
            interrupted: false,
        })
    }
}
