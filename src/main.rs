//! # wo-sync CLI
//!
//! ## Usage
//!
//! ```bash
//! wo-sync --config ./config/wo-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wo-sync sync <source> <code>` | Sync one municipality |
//! | `wo-sync sync-all` | Sync every configured municipality |
//! | `wo-sync alerts resend <date>` | Re-send alerts for documents finished after a date |
//! | `wo-sync subscription create/activate/delete` | Manage saved searches |
//! | `wo-sync snippets <index> <id>` | Show a stored document's snippets |
//!
//! ## Examples
//!
//! ```bash
//! # Sync Amsterdam without mailing anyone
//! wo-sync sync 'ori_amsterdam_*' GM0363 --dry-run-alerts
//!
//! # Everything in the config, with JSON progress on stderr
//! wo-sync sync-all --progress json
//!
//! # Show the snippets of one document for district E03
//! wo-sync snippets wo_gm0363 abc123 --code E03
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use wo_core::models::MunicipalityCode;
use wo_sync::alerts::AlertMatcher;
use wo_sync::annotate::HttpAnnotator;
use wo_sync::config::{self, Config};
use wo_sync::es::EsClient;
use wo_sync::ingest::{self, SyncOptions, SyncServices};
use wo_sync::inspect;
use wo_sync::mail::create_mailer;
use wo_sync::progress::ProgressMode;
use wo_sync::subscriptions::{NewSubscription, SubscriptionManager};

/// Geo-annotation and alert sync for council proceedings.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wo-sync.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "wo-sync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wo-sync.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). `WO_SYNC_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync one source index into a municipality's sink index.
    ///
    /// Compares document counts, finds the weeks the sink is missing,
    /// annotates and indexes them, then percolates new documents for alerts.
    Sync {
        /// Source index or pattern, e.g. `ori_amsterdam_*`.
        source: String,

        /// Municipality code, e.g. `GM0363`.
        code: String,

        /// Log alert matches instead of mailing subscribers.
        #[arg(long)]
        dry_run_alerts: bool,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to human on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Sync every `[[municipalities]]` entry of the config.
    SyncAll {
        #[arg(long)]
        dry_run_alerts: bool,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Alert maintenance.
    Alerts {
        #[command(subcommand)]
        action: AlertsAction,
    },

    /// Manage saved-search subscriptions.
    Subscription {
        #[command(subcommand)]
        action: SubscriptionAction,
    },

    /// Print the snippets and toponyms of a stored sink document.
    Snippets {
        index: String,
        id: String,

        /// Only snippets mentioning this district or neighborhood.
        #[arg(long)]
        code: Option<String>,
    },
}

#[derive(Subcommand)]
enum AlertsAction {
    /// Notify subscribers about documents finished after a date.
    Resend {
        /// Date in YYYY-MM-DD format.
        since: String,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SubscriptionAction {
    /// Store a new, unactivated subscription and mail its activation link.
    Create {
        #[arg(long)]
        email: String,

        /// Municipality whose sink index the query runs against.
        #[arg(long)]
        code: String,

        /// Query DSL as JSON.
        #[arg(long)]
        query: String,

        #[arg(long, default_value = "")]
        area_name: String,

        /// Search page URL to link back to.
        #[arg(long, default_value = "")]
        querystring: String,
    },
    Activate { token: String },
    Delete { token: String },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("WO_SYNC_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn sink_client(config: &Config) -> Result<Arc<EsClient>> {
    let timeout = Duration::from_secs(config.elasticsearch.timeout_secs);
    Ok(Arc::new(EsClient::new(&config.elasticsearch.sink_url, timeout)?))
}

fn services(config: &Config) -> Result<SyncServices> {
    let timeout = Duration::from_secs(config.elasticsearch.timeout_secs);
    Ok(SyncServices {
        source: Arc::new(EsClient::new(&config.elasticsearch.source_url, timeout)?),
        sink: sink_client(config)?,
        annotator: Arc::new(HttpAnnotator::new(&config.annotation)?),
        mailer: create_mailer(&config.mail)?,
    })
}

/// Stop flag raised on Ctrl-C. Runs finish the chunk in flight and exit.
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current chunk");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sync {
            source,
            code,
            dry_run_alerts,
            progress,
        } => {
            let code: MunicipalityCode = code.parse()?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = ingest::run_sync(
                &services(&cfg)?,
                SyncOptions::from_config(&cfg, dry_run_alerts),
                &source,
                code,
                stop_on_ctrl_c(),
                reporter.as_ref(),
            )
            .await?;
            ingest::print_report(&report);
        }
        Commands::SyncAll {
            dry_run_alerts,
            progress,
        } => {
            if cfg.municipalities.is_empty() {
                bail!("No [[municipalities]] configured");
            }
            let municipalities = cfg
                .municipalities
                .iter()
                .map(|m| Ok((m.source.clone(), m.parsed_code()?)))
                .collect::<Result<Vec<_>>>()?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();

            let results = ingest::run_sync_all(
                &services(&cfg)?,
                SyncOptions::from_config(&cfg, dry_run_alerts),
                &municipalities,
                cfg.sync.parallelism,
                stop_on_ctrl_c(),
                Arc::from(reporter),
            )
            .await;

            let mut failed = 0;
            for (code, result) in &results {
                match result {
                    Ok(report) => ingest::print_report(report),
                    Err(e) => {
                        failed += 1;
                        eprintln!("sync {} failed: {:#}", code, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} municipalities failed", failed, results.len());
            }
        }
        Commands::Alerts {
            action: AlertsAction::Resend { since, dry_run },
        } => {
            let since = NaiveDate::parse_from_str(&since, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", since))?;
            let matcher = AlertMatcher::new(
                sink_client(&cfg)?,
                create_mailer(&cfg.mail)?,
                &cfg.sink.subscription_index,
                &cfg.mail.site_url,
            );
            let report = matcher.resend_since(since, dry_run).await?;
            println!("alerts resend {}", since);
            println!("  subscriptions checked: {}", report.checked);
            println!("  matched: {}", report.matched);
            println!(
                "  sent: {}, dry-run: {}, failed: {}",
                report.sent, report.dry_run, report.failed
            );
            println!("ok");
        }
        Commands::Subscription { action } => {
            let manager = SubscriptionManager::new(
                sink_client(&cfg)?,
                create_mailer(&cfg.mail)?,
                &cfg.sink.subscription_index,
                &cfg.mail.site_url,
            );
            match action {
                SubscriptionAction::Create {
                    email,
                    code,
                    query,
                    area_name,
                    querystring,
                } => {
                    let code: MunicipalityCode = code.parse()?;
                    let query: serde_json::Value = serde_json::from_str(&query).context("--query is not valid JSON")?;
                    let created = manager
                        .create(NewSubscription {
                            email,
                            area_name,
                            query,
                            querystring,
                            doc_index: code.sink_index(&cfg.sink.index_prefix),
                        })
                        .await?;
                    println!("token: {}", created.token);
                }
                SubscriptionAction::Activate { token } => {
                    let sub = manager.activate(&token).await?;
                    println!("activated {} ({})", token, sub.email);
                }
                SubscriptionAction::Delete { token } => {
                    manager.delete(&token).await?;
                    println!("deleted {}", token);
                }
            }
        }
        Commands::Snippets { index, id, code } => {
            let report = inspect::inspect_snippets(
                sink_client(&cfg)?.as_ref(),
                &index,
                &id,
                code.as_deref(),
                cfg.snippets.context_chars,
            )
            .await?;
            inspect::print_snippets(&report);
        }
    }

    Ok(())
}
