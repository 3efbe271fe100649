use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use futures::TryStreamExt;
use google_gmail1::Gmail;
use std::io::Read;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gmex::auth::{self, RingStorage};
use gmex::backfill::{self, Backfill};
use gmex::cancel::CancelToken;
use gmex::config::Config;
use gmex::error::ExportError;
use gmex::export::Exporter;
use gmex::gmail::GmailProvider;
use gmex::merge::CandidateMerge;
use gmex::models::MessageId;
use gmex::provider::{MailProvider, RetryPolicy};
use gmex::store::{EmailStore, ListQuery, StoreConfig};
use gmex::sync::SyncCoordinator;

#[derive(Debug, Parser)]
#[command(name = "gmex", version, about = "Sync Gmail messages into a local archive")]
pub struct Cli {
    /// Config file (defaults to ./gmex.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging, overriding LOG_LEVEL.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive messages matching QUERY that are not archived yet.
    Sync {
        query: Option<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Record search results as pending messages without fetching content.
    Merge {
        query: Option<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Fetch content for pending messages.
    Fill {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Write <OUTPUT>-export.html and <OUTPUT>-export.txt.
    Export {
        #[arg(short, long, default_value = "emails")]
        output: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Show archive counts.
    Check,
    /// List archived messages in key order.
    List {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        newest_first: bool,
    },
    /// Attach stdin to a message as sidecar NAME.
    Attach { id: String, name: String },
    /// Manage the stored OAuth token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Debug, Args)]
struct RangeArgs {
    /// Only messages on or after this date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<NaiveDate>,
    /// Only messages before this date (YYYY-MM-DD).
    #[arg(long)]
    until: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum TokenAction {
    Status,
    /// Read a token JSON document from stdin.
    Import,
    Clear,
}

impl RangeArgs {
    fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let at_midnight = |d: &NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        (
            self.since.as_ref().and_then(at_midnight),
            self.until.as_ref().and_then(at_midnight),
        )
    }
}

pub fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref());
    let store = match &cli.command {
        Command::Token { action } => return token(action),
        _ => open_store(&config).await?,
    };

    match cli.command {
        Command::Sync { query, limit, json } => {
            let query = query.unwrap_or_else(|| config.sync.query.clone());
            let limit = limit.unwrap_or(config.sync.limit);
            let provider = connect(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let report = SyncCoordinator::new(store, provider)
                .with_workers(config.sync.workers)
                .with_cancel(cancel)
                .run(&query, limit)
                .await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "total": report.total,
                        "existing": report.existing,
                        "new": report.new,
                        "failed": report.failed.len(),
                    })
                );
            } else {
                println!("{}", report.summary_line());
            }
            if report.cancelled {
                warn!(skipped = report.skipped.len(), "sync interrupted");
            }
        }
        Command::Merge { query, limit } => {
            let query = query.unwrap_or_else(|| config.sync.query.clone());
            let limit = limit.unwrap_or(config.sync.limit);
            let provider = connect(&config).await?;
            let candidates = provider.search(&query, limit).await.context("Search failed")?;
            let report = CandidateMerge::new(store).merge(&candidates).await?;
            println!(
                "Candidates: {}. Created: {}. Unchanged: {}. Drift: {}. Failed: {}",
                candidates.len(),
                report.created.len(),
                report.unchanged,
                report.drift.len(),
                report.failed.len()
            );
        }
        Command::Fill { limit, dry_run } => {
            if dry_run {
                let planned = backfill::pending_ids(&store, limit).await?;
                println!("Would fill {} message(s):", planned.len());
                for id in planned {
                    println!("  {id}");
                }
                return Ok(());
            }
            let report = Backfill::new(store, connect(&config).await?)
                .with_workers(config.sync.workers)
                .with_cancel(cancel_on_ctrl_c())
                .run(limit, false)
                .await?;
            println!(
                "Planned: {}. Populated: {}. Failed: {}. Remaining: {}",
                report.planned.len(),
                report.populated,
                report.failed.len(),
                report.remaining()
            );
        }
        Command::Export { output, range } => {
            let (since, until) = range.bounds();
            let query = ListQuery {
                since,
                until,
                newest_first: true,
                ..ListQuery::default()
            };
            match Exporter::new(store).write_files(&query, &output).await {
                Ok(summary) => {
                    println!("Exported {} message(s)", summary.count);
                    println!("  Created: {}", summary.html_path.display());
                    println!("  Created: {}", summary.txt_path.display());
                }
                Err(ExportError::NotReady { pending }) => {
                    eprintln!("{} message(s) still have pending bodies:", pending.len());
                    for id in pending.iter().take(10) {
                        eprintln!("  - {id}");
                    }
                    bail!("run `gmex fill` before exporting");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::Check => {
            let stats = store.stats().await?;
            println!("Archive: {}", store.root().display());
            println!("  Total emails: {}", stats.total);
            println!("  Bodies populated: {}", stats.populated);
            println!("  Bodies pending: {}", stats.pending);
            if let (Some(earliest), Some(latest)) = (stats.earliest, stats.latest) {
                println!("  Earliest: {}", earliest.to_rfc3339());
                println!("  Latest: {}", latest.to_rfc3339());
            }
        }
        Command::List {
            range,
            limit,
            newest_first,
        } => {
            let (since, until) = range.bounds();
            let query = ListQuery {
                since,
                until,
                limit,
                newest_first,
                ..ListQuery::default()
            };
            let mut listing = store.list(&query).await?;
            while let Some(metadata) = listing.try_next().await? {
                println!(
                    "{}\t{}\t{}",
                    metadata.timestamp.to_rfc3339(),
                    metadata.id,
                    metadata.subject.as_deref().unwrap_or("")
                );
            }
        }
        Command::Attach { id, name } => {
            let id = MessageId::new(id)?;
            let mut payload = Vec::new();
            std::io::stdin()
                .read_to_end(&mut payload)
                .context("Failed to read stdin")?;
            store.attach(&id, &name, &payload).await?;
            println!("Attached {name} to {id}");
        }
        Command::Token { .. } => {}
    }
    Ok(())
}

async fn open_store(config: &Config) -> Result<EmailStore> {
    let store = EmailStore::open(StoreConfig {
        root: config.store_root(),
        io_timeout: config.store.io_timeout(),
    })
    .await
    .context("Failed to open archive")?;
    info!(root = %store.root().display(), "archive opened");
    Ok(store)
}

fn token(action: &TokenAction) -> Result<()> {
    let storage = RingStorage;
    match action {
        TokenAction::Status => {
            if storage.status()? {
                println!("Status: FOUND");
            } else {
                println!("Status: MISSING");
            }
        }
        TokenAction::Import => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read stdin")?;
            if raw.trim().is_empty() {
                bail!("no token data received on stdin");
            }
            storage.import(&raw)?;
            println!("Token imported.");
        }
        TokenAction::Clear => {
            storage.clear()?;
            println!("Token cleared.");
        }
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<GmailProvider> {
    let secret = auth::Authenticator::load_secret(&config.auth.credentials_path).await?;
    let authenticator = auth::Authenticator::authenticate(secret).await?;
    authenticator
        .token(auth::SCOPES)
        .await
        .context("Not authenticated. Run `gmex token import` or complete the browser flow")?;

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native roots")?
        .https_only()
        .enable_http1()
        .build();
    let hub = Gmail::new(hyper::Client::builder().build(connector), authenticator);
    Ok(GmailProvider::new(hub, RetryPolicy::from(&config.provider)))
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight messages");
            trigger.cancel();
        }
    });
    cancel
}
