use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertEngine;
use crate::config::Config;
use crate::core::pipeline::Pipeline;
use crate::core::scan::{ScanRequest, ScanTarget, Scanner};
use crate::core::stream::{StreamEvent, StreamOptions, StreamScheduler};
use crate::core::{Chain, RuleType, RuleWindow};
use crate::db::SharedDatabase;
use crate::error::{Result, WhaleError};
use crate::fetchers::{Fetchers, validate_address};
use crate::signals::ScoringEngine;
use crate::tags::ExchangeDirectory;

/// Exit status after a stream stopped by Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Multi-chain whale wallet monitor.
#[derive(Parser)]
#[command(name = "whalecli", version, about = "Multi-chain whale wallet monitor")]
pub struct Args {
    /// Config file (defaults to $WHALECLI_CONFIG_PATH, then ~/.whalecli/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Score wallets once and print the result as JSON
    Scan {
        /// ETH, BTC, HL or ALL
        #[arg(long)]
        chain: Option<String>,
        /// Scan a single address (tracked or not)
        #[arg(long)]
        wallet: Option<String>,
        /// Scan every tracked wallet
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u32).range(1..=720))]
        hours: u32,
        /// Only return wallets scoring at least this much
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
        threshold: u8,
        /// Fetch fresh data instead of using the transaction cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Poll continuously and emit JSONL events on stdout
    Stream {
        /// ETH, BTC, HL or ALL (ETH and BTC)
        #[arg(long)]
        chain: Option<String>,
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        threshold: Option<u8>,
        #[arg(long)]
        hours: Option<u32>,
        /// Score each wallet against its chain cohort
        #[arg(long)]
        correlate: bool,
    },
    /// Manage the wallet registry
    Wallet {
        #[command(subcommand)]
        action: WalletCommand,
    },
    /// Manage alert rules and inspect alert history
    Alert {
        #[command(subcommand)]
        action: AlertCommand,
    },
    /// Maintain the response cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand)]
pub enum WalletCommand {
    /// Track a wallet
    Add {
        address: String,
        #[arg(long)]
        chain: String,
        #[arg(long, default_value = "")]
        label: String,
        /// Repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List tracked wallets
    List {
        #[arg(long)]
        chain: Option<String>,
        /// Only wallets carrying every given tag
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Include removed wallets
        #[arg(long)]
        all: bool,
    },
    /// Stop tracking a wallet
    Remove {
        address: String,
        #[arg(long)]
        chain: String,
        /// Delete the row and its cached transactions
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
pub enum AlertCommand {
    /// Create an alert rule
    Set {
        /// Alert when the whale score reaches this value
        #[arg(long, conflicts_with = "flow", required_unless_present = "flow",
              value_parser = clap::value_parser!(u8).range(0..=100))]
        score: Option<u8>,
        /// Alert when |net flow| reaches this many USD
        #[arg(long)]
        flow: Option<f64>,
        /// 15m, 30m, 1h, 4h or 24h
        #[arg(long, default_value = "1h")]
        window: String,
        #[arg(long)]
        chain: Option<String>,
        #[arg(long)]
        webhook: Option<String>,
    },
    /// Show active rules and recent alerts
    List {
        #[arg(long)]
        chain: Option<String>,
        /// Only alerts from the last N hours
        #[arg(long)]
        since_hours: Option<u32>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Deactivate a rule; its id is never reused
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Delete expired response cache entries
    Prune,
}

/// `None` for ALL.
fn chain_filter(raw: Option<&str>) -> Result<Option<Chain>> {
    match raw.map(str::trim) {
        None => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| WhaleError::InvalidInput(format!("failed to encode output: {e}")))?;
    println!("{out}");
    Ok(())
}

/// Error envelope written to stderr.
pub fn print_error(err: &WhaleError) {
    eprintln!("{}", json!({"error": err.error_code(), "message": err.to_string()}));
}

struct App {
    config: Config,
    db: SharedDatabase,
}

impl App {
    fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load(Config::resolve_path(config_path))?;
        let db_path = Path::new(&config.database.path);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| WhaleError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let db = SharedDatabase::open(db_path)?;
        tracing::debug!("Database opened at {}", config.database.path);
        Ok(Self { config, db })
    }

    fn exchanges(&self) -> ExchangeDirectory {
        let mut dir = ExchangeDirectory::builtin();
        if let Some(path) = self.config.database.exchange_csv.as_deref() {
            match dir.load_csv(Path::new(path)) {
                Ok(count) => tracing::info!("Loaded {count} exchange addresses from {path}"),
                Err(e) => tracing::warn!("Failed to load exchange CSV: {e}"),
            }
        }
        dir
    }

    fn pipeline(&self) -> Result<Pipeline> {
        Ok(Pipeline::new(
            self.db.clone(),
            Fetchers::from_config(&self.config, self.db.clone())?,
        ))
    }

    fn alert_engine(&self) -> AlertEngine {
        AlertEngine::new(self.db.clone(), self.config.alert.clone())
    }
}

/// Run one command. Returns the process exit code on success.
pub async fn run(args: Args) -> Result<i32> {
    let app = App::open(args.config.as_deref())?;
    match args.command {
        Command::Scan {
            chain,
            wallet,
            all,
            hours,
            threshold,
            no_cache,
        } => {
            let chain = chain_filter(chain.as_deref())?;
            let target = match (wallet, chain) {
                (Some(address), chain) => ScanTarget::Address {
                    address,
                    chain: chain.unwrap_or(Chain::Eth),
                },
                (None, Some(chain)) if !all => ScanTarget::Chain(chain),
                _ => ScanTarget::All,
            };
            let pipeline = app.pipeline()?;
            let scoring = ScoringEngine::new(app.exchanges());
            let alerts = app.alert_engine();
            let cache_ttl = Duration::from_secs(u64::from(app.config.database.cache_ttl_hours) * 3600);
            let scanner = Scanner::new(app.db.clone(), &pipeline, &scoring, &alerts, cache_ttl);
            let result = scanner
                .scan(&ScanRequest {
                    target,
                    hours,
                    threshold,
                    use_cache: !no_cache,
                })
                .await?;
            print_json(&result)?;
            Ok(0)
        }

        Command::Stream {
            chain,
            interval,
            threshold,
            hours,
            correlate,
        } => {
            let mut options = StreamOptions::from_config(&app.config.stream, chain_filter(chain.as_deref())?);
            if let Some(secs) = interval {
                options.interval = Duration::from_secs(secs.max(1));
            }
            if let Some(t) = threshold {
                options.threshold = t;
            }
            if let Some(h) = hours {
                options.hours = h.max(1);
            }
            if correlate {
                options.correlation = crate::signals::Correlation::Cohort;
            }
            let scheduler = StreamScheduler::new(
                app.db.clone(),
                app.pipeline()?,
                ScoringEngine::new(app.exchanges()),
                app.alert_engine(),
                options,
            );
            run_stream(&scheduler).await
        }

        Command::Wallet { action } => wallet_command(&app, action),
        Command::Alert { action } => alert_command(&app, action),
        Command::Cache {
            action: CacheCommand::Prune,
        } => {
            let removed = app.db.cache_prune()?;
            print_json(&json!({"status": "pruned", "removed": removed}))?;
            Ok(0)
        }
    }
}

async fn run_stream(scheduler: &StreamScheduler) -> Result<i32> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping stream");
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Failed to encode stream event: {e}");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                tracing::warn!("stdout closed, stopping stream output");
                break;
            }
        }
    });

    scheduler.run(&tx, &cancel).await;
    drop(tx);
    if let Err(e) = writer.await {
        tracing::warn!("stream writer task failed: {e}");
    }
    Ok(if cancel.is_cancelled() { EXIT_INTERRUPTED } else { 0 })
}

fn wallet_command(app: &App, action: WalletCommand) -> Result<i32> {
    match action {
        WalletCommand::Add {
            address,
            chain,
            label,
            tags,
        } => {
            let chain: Chain = chain.parse()?;
            let address = address.trim();
            if !validate_address(chain, address) {
                return Err(WhaleError::InvalidAddress {
                    chain,
                    address: address.to_string(),
                });
            }
            let tags: BTreeSet<String> = tags.into_iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
            let wallet = app.db.add_wallet(address, chain, &label, &tags)?;
            tracing::info!(address = %wallet.address, chain = %wallet.chain, "wallet added");
            print_json(&json!({"status": "added", "wallet": wallet}))?;
        }
        WalletCommand::List { chain, tags, all } => {
            let chain = chain_filter(chain.as_deref())?;
            let mut wallets = app.db.list_wallets(chain, !all)?;
            wallets.retain(|w| tags.iter().all(|t| w.tags.contains(t)));
            print_json(&json!({"count": wallets.len(), "wallets": wallets}))?;
        }
        WalletCommand::Remove { address, chain, purge } => {
            let removed = app.db.remove_wallet(&address, chain.parse()?, purge)?;
            tracing::info!(address = %removed.address, purged = removed.purged, "wallet removed");
            print_json(&json!({"status": "removed", "wallet": removed}))?;
        }
    }
    Ok(0)
}

fn alert_command(app: &App, action: AlertCommand) -> Result<i32> {
    match action {
        AlertCommand::Set {
            score,
            flow,
            window,
            chain,
            webhook,
        } => {
            let (rule_type, value) = match (score, flow) {
                (Some(score), _) => (RuleType::Score, f64::from(score)),
                (None, Some(flow)) if flow.is_finite() && flow >= 0.0 => (RuleType::Flow, flow),
                (None, Some(flow)) => {
                    return Err(WhaleError::InvalidInput(format!(
                        "flow threshold must be a non-negative amount, got {flow}"
                    )));
                }
                (None, None) => return Err(WhaleError::InvalidInput("provide --score or --flow".into())),
            };
            let window: RuleWindow = window.parse()?;
            let chain = chain_filter(chain.as_deref())?;
            let rule = app.db.create_alert_rule(rule_type, value, window, chain, webhook.as_deref())?;
            tracing::info!(rule_id = %rule.id, "alert rule created");
            print_json(&json!({"status": "alert_configured", "rule": rule}))?;
        }
        AlertCommand::List {
            chain,
            since_hours,
            limit,
        } => {
            let since = since_hours.map(|h| Utc::now() - chrono::Duration::hours(i64::from(h)));
            let rules = app.db.list_alert_rules(true)?;
            let recent = app.db.list_alerts(chain_filter(chain.as_deref())?, since, limit)?;
            print_json(&json!({"rules": rules, "recent_alerts": recent}))?;
        }
        AlertCommand::Remove { id } => {
            if !app.db.deactivate_alert_rule(&id)? {
                return Err(WhaleError::InvalidInput(format!(
                    "alert rule {id} not found or already inactive"
                )));
            }
            print_json(&json!({"status": "removed", "id": id}))?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_filter_accepts_all() {
        assert_eq!(chain_filter(None).unwrap(), None);
        assert_eq!(chain_filter(Some("ALL")).unwrap(), None);
        assert_eq!(chain_filter(Some("all")).unwrap(), None);
        assert_eq!(chain_filter(Some("btc")).unwrap(), Some(Chain::Btc));
        assert!(chain_filter(Some("DOGE")).is_err());
    }

    #[test]
    fn scan_args_parse() {
        let args = Args::try_parse_from(["whalecli", "scan", "--chain", "ETH", "--hours", "48", "--no-cache"]).unwrap();
        match args.command {
            Command::Scan { chain, hours, no_cache, threshold, .. } => {
                assert_eq!(chain.as_deref(), Some("ETH"));
                assert_eq!(hours, 48);
                assert!(no_cache);
                assert_eq!(threshold, 0);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn scan_hours_bounded() {
        assert!(Args::try_parse_from(["whalecli", "scan", "--hours", "0"]).is_err());
        assert!(Args::try_parse_from(["whalecli", "scan", "--hours", "721"]).is_err());
        assert!(Args::try_parse_from(["whalecli", "scan", "--threshold", "101"]).is_err());
    }

    #[test]
    fn alert_set_needs_exactly_one_kind() {
        assert!(Args::try_parse_from(["whalecli", "alert", "set"]).is_err());
        assert!(Args::try_parse_from(["whalecli", "alert", "set", "--score", "80", "--flow", "5"]).is_err());
        let args = Args::try_parse_from(["whalecli", "alert", "set", "--flow", "1000000", "--window", "4h"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Alert {
                action: AlertCommand::Set { flow: Some(_), score: None, .. }
            }
        ));
    }

    #[test]
    fn wallet_add_collects_tags() {
        let args = Args::try_parse_from([
            "whalecli",
            "--config",
            "/tmp/w.toml",
            "wallet",
            "add",
            "0xabc",
            "--chain",
            "ETH",
            "--tag",
            "fund",
            "--tag",
            "otc",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some(Path::new("/tmp/w.toml")));
        match args.command {
            Command::Wallet {
                action: WalletCommand::Add { tags, label, .. },
            } => {
                assert_eq!(tags, vec!["fund", "otc"]);
                assert_eq!(label, "");
            }
            _ => panic!("expected wallet add"),
        }
    }
}
