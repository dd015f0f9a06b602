//! Ledgersync CLI - Command line interface for the offline-first ledger.
//!
//! Records are written to a local cache under the data directory and pushed
//! to the configured remote store (a directory, or an HTTP document API).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use ledgersync_common::{Category, Collection, Record, RecordDraft};
use ledgersync_storage::{create_default_registry, Direction, FileKv, Query};
use ledgersync_sync::{
    views, DeleteOutcome, EditOutcome, SubscriptionChannel, SubscriptionSpec, SyncConfig,
    SyncCoordinator, SyncOutcome,
};

type Coordinator = SyncCoordinator<FileKv>;

#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(about = "Ledgersync - Offline-first ledger with remote sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the local cache and configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Remote backend: "fs" or "http".
    #[arg(long, global = true, default_value = "fs")]
    remote: String,

    /// Base URL of the HTTP remote.
    #[arg(long, global = true)]
    remote_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a record.
    Add {
        /// Target collection (income, expenses, household-expenses, notes,
        /// supplier-invoices, savings).
        #[arg(short, long)]
        collection: Collection,

        #[arg(short, long)]
        amount: f64,

        /// Category name, case-insensitive.
        #[arg(short = 'k', long, default_value = "Other")]
        category: Category,

        /// Date as YYYY-MM-DD or RFC 3339 (default: now).
        #[arg(short, long)]
        date: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        supplier: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List cached records of a collection.
    List {
        #[arg(short, long)]
        collection: Collection,

        /// Only records on or after this date.
        #[arg(long)]
        from: Option<String>,

        /// Only records on or before this date.
        #[arg(long)]
        to: Option<String>,

        /// Print totals after the listing.
        #[arg(long)]
        totals: bool,
    },

    /// Edit a record. Omitted fields keep their current value.
    Edit {
        #[arg(short, long)]
        collection: Collection,

        /// Local record id.
        #[arg(short, long)]
        id: String,

        #[arg(short, long)]
        amount: Option<f64>,

        #[arg(short = 'k', long)]
        category: Option<Category>,

        #[arg(short, long)]
        date: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        supplier: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Delete a record.
    Delete {
        #[arg(short, long)]
        collection: Collection,

        /// Local record id.
        #[arg(short, long)]
        id: String,
    },

    /// Push pending and failed records to the remote store.
    Sync {
        /// Restrict to these collections (default: all).
        #[arg(short, long)]
        collection: Vec<Collection>,
    },

    /// Replace the local cache with the remote contents.
    Pull,

    /// Show sync statistics.
    Stats,

    /// Follow a collection on the remote store until interrupted.
    Watch {
        #[arg(short, long)]
        collection: Collection,

        /// Field to order by.
        #[arg(long)]
        order_by: Option<String>,

        /// Descending order.
        #[arg(long)]
        desc: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let coordinator = open_coordinator(&cli).await?;

    match cli.command {
        Commands::Add {
            collection,
            amount,
            category,
            date,
            description,
            supplier,
            notes,
        } => {
            let date = match date {
                Some(date) => parse_date(&date)?,
                None => Utc::now(),
            };
            let draft = RecordDraft {
                amount,
                date,
                category,
                description,
                supplier,
                notes,
            };
            cmd_add(&coordinator, collection, draft).await
        }

        Commands::List {
            collection,
            from,
            to,
            totals,
        } => cmd_list(&coordinator, collection, from.as_deref(), to.as_deref(), totals).await,

        Commands::Edit {
            collection,
            id,
            amount,
            category,
            date,
            description,
            supplier,
            notes,
        } => {
            let overrides = EditOverrides {
                amount,
                category,
                date: date.as_deref().map(parse_date).transpose()?,
                description,
                supplier,
                notes,
            };
            cmd_edit(&coordinator, collection, &id, overrides).await
        }

        Commands::Delete { collection, id } => cmd_delete(&coordinator, collection, &id).await,

        Commands::Sync { collection } => cmd_sync(&coordinator, collection).await,

        Commands::Pull => cmd_pull(&coordinator).await,

        Commands::Stats => cmd_stats(&coordinator).await,

        Commands::Watch {
            collection,
            order_by,
            desc,
        } => cmd_watch(&coordinator, collection, order_by, desc).await,
    }
}

/// Build the coordinator from the global flags and `config.json`.
async fn open_coordinator(cli: &Cli) -> Result<Coordinator> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No default data directory on this platform, pass --data-dir")?
            .join("ledgersync"),
    };
    debug!("Using data directory {}", data_dir.display());

    let config = SyncConfig::load(data_dir.join("config.json"))
        .await
        .context("Failed to read config.json")?;

    let store = FileKv::new(data_dir.join("cache")).context("Failed to open local cache")?;

    let remote_config = match cli.remote.as_str() {
        "fs" => serde_json::json!({
            "root": data_dir.join("remote")
        }),
        "http" => {
            let url = cli
                .remote_url
                .as_deref()
                .context("--remote-url is required for the http remote")?;
            serde_json::json!({
                "url": url,
                "token": std::env::var("LEDGERSYNC_TOKEN").ok()
            })
        }
        other => anyhow::bail!("Invalid remote '{}'. Use: fs or http", other),
    };

    let registry = create_default_registry()?;
    let remote = registry
        .resolve(&cli.remote, remote_config)
        .context("Failed to open remote store")?;

    Ok(SyncCoordinator::new(remote, std::sync::Arc::new(store), config))
}

/// Parse `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
fn parse_date(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(input) {
        return Ok(date.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", input))?;
    day.and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .context("Invalid date")
}

fn print_record(record: &Record, status: &str) {
    let label = record
        .description
        .as_deref()
        .or(record.supplier.as_deref())
        .unwrap_or("");
    println!(
        "  {:<24} {:>12.2}  {}  {:<12} {:<8} {}",
        record.id,
        record.amount,
        record.date.format("%Y-%m-%d"),
        record.category.as_str(),
        status,
        label
    );
}

/// Add a record and wait for its first push.
async fn cmd_add(coordinator: &Coordinator, collection: Collection, draft: RecordDraft) -> Result<()> {
    info!("Adding record to {}", collection);

    let added = coordinator
        .add_record(collection, draft)
        .await
        .context("Failed to add record")?;

    println!("Record saved: {}", added.id);

    // The process exits right after, so the background push is awaited here
    match added.sync.wait().await? {
        SyncOutcome::Synced { remote_id } => println!("  Synced as {}", remote_id),
        SyncOutcome::Failed { error } => {
            println!("  Not synced yet: {}", error);
            println!("  Run `ledgersync sync` to retry.");
        }
        _ => println!("  Pending, run `ledgersync sync` to push it."),
    }

    Ok(())
}

/// List cached records.
async fn cmd_list(
    coordinator: &Coordinator,
    collection: Collection,
    from: Option<&str>,
    to: Option<&str>,
    totals: bool,
) -> Result<()> {
    let from = from.map(parse_date).transpose()?;
    let to = to.map(parse_date).transpose()?;

    let envelopes: Vec<_> = coordinator
        .envelopes(collection)
        .await
        .into_iter()
        .filter(|e| from.map_or(true, |from| e.record.date >= from))
        .filter(|e| to.map_or(true, |to| e.record.date <= to))
        .collect();

    if envelopes.is_empty() {
        println!("No records in {}.", collection);
        return Ok(());
    }

    println!("Records in {}:", collection);
    for envelope in &envelopes {
        let status = format!("{:?}", envelope.sync_status).to_uppercase();
        print_record(&envelope.record, &status);
    }

    if totals {
        let records: Vec<Record> = envelopes.into_iter().map(|e| e.record).collect();

        println!("\nTotal: {:.2}", views::total(&records));
        println!("By month:");
        for ((year, month), amount) in views::monthly_totals(&records) {
            println!("  {}-{:02}  {:>12.2}", year, month, amount);
        }
        if collection == Collection::SupplierInvoices {
            println!("By supplier:");
            for (supplier, amount) in views::totals_by_supplier(&records) {
                println!("  {:<24} {:>12.2}", supplier, amount);
            }
        }
    }

    Ok(())
}

/// Field overrides for `edit`.
struct EditOverrides {
    amount: Option<f64>,
    category: Option<Category>,
    date: Option<DateTime<Utc>>,
    description: Option<String>,
    supplier: Option<String>,
    notes: Option<String>,
}

/// Edit a record in place.
async fn cmd_edit(
    coordinator: &Coordinator,
    collection: Collection,
    id: &str,
    overrides: EditOverrides,
) -> Result<()> {
    info!("Editing {} record {}", collection, id);

    let current = coordinator
        .read_for_ui(collection)
        .await
        .into_iter()
        .find(|r| r.id == id)
        .with_context(|| format!("No record {} in {}", id, collection))?;

    let draft = RecordDraft {
        amount: overrides.amount.unwrap_or(current.amount),
        date: overrides.date.unwrap_or(current.date),
        category: overrides.category.unwrap_or(current.category),
        description: overrides.description.or(current.description),
        supplier: overrides.supplier.or(current.supplier),
        notes: overrides.notes.or(current.notes),
    };

    let outcome = coordinator
        .edit_record(collection, id, draft)
        .await
        .context("Failed to edit record")?;

    match outcome {
        EditOutcome::Synced => println!("Record updated and synced: {}", id),
        EditOutcome::Deferred => println!("Record updated locally: {} (pending sync)", id),
        EditOutcome::Failed { error } => {
            println!("Record updated locally: {}", id);
            println!("  Remote update failed: {}", error);
        }
    }

    Ok(())
}

/// Delete a record.
async fn cmd_delete(coordinator: &Coordinator, collection: Collection, id: &str) -> Result<()> {
    info!("Deleting {} record {}", collection, id);

    let outcome = coordinator
        .delete_record(collection, id)
        .await
        .context("Failed to delete record")?;

    match outcome {
        DeleteOutcome::LocalOnly | DeleteOutcome::RemoteDeleted => {
            println!("Record deleted: {}", id)
        }
        DeleteOutcome::RemoteFailed { error } => {
            println!("Record deleted locally: {}", id);
            println!("  Remote copy could not be removed: {}", error);
        }
    }

    Ok(())
}

/// Push pending records.
async fn cmd_sync(coordinator: &Coordinator, collections: Vec<Collection>) -> Result<()> {
    let report = if collections.is_empty() {
        coordinator.sync_all_pending().await?
    } else {
        coordinator.sync_pending_in(&collections).await?
    };

    println!("Sync completed in {:?}:", report.duration);
    println!("  Synced:  {}", report.synced);
    println!("  Failed:  {}", report.failed);
    println!("  Skipped: {}", report.skipped);

    Ok(())
}

/// Replace the cache with the remote contents.
async fn cmd_pull(coordinator: &Coordinator) -> Result<()> {
    info!("Pulling all collections from {}", coordinator.remote().name());

    let summary = coordinator
        .pull_all_from_remote()
        .await
        .context("Failed to pull from remote")?;

    println!("Pulled:");
    for (collection, count) in &summary.pulled {
        println!("  {:<20} {}", collection.name(), count);
    }
    for collection in &summary.failed {
        println!("  {:<20} failed, local cache kept", collection.name());
    }

    Ok(())
}

/// Show sync statistics.
async fn cmd_stats(coordinator: &Coordinator) -> Result<()> {
    let statistics = coordinator.sync_statistics().await;

    println!(
        "  {:<20} {:>6} {:>6} {:>8} {:>6}",
        "collection", "total", "synced", "pending", "error"
    );
    for (collection, stats) in &statistics {
        println!(
            "  {:<20} {:>6} {:>6} {:>8} {:>6}",
            collection.name(),
            stats.total,
            stats.synced,
            stats.pending,
            stats.error
        );
    }

    let unsynced: Vec<&str> = statistics
        .iter()
        .filter(|(_, stats)| stats.has_unsynced())
        .map(|(collection, _)| collection.name())
        .collect();
    if !unsynced.is_empty() {
        println!();
        println!(
            "Unsynced records in {}; run `ledgersync sync` to push them",
            unsynced.join(", ")
        );
    }

    Ok(())
}

/// Print the live result set of a collection on every change.
async fn cmd_watch(
    coordinator: &Coordinator,
    collection: Collection,
    order_by: Option<String>,
    desc: bool,
) -> Result<()> {
    let mut query = Query::new(collection);
    if let Some(field) = order_by {
        let direction = if desc { Direction::Desc } else { Direction::Asc };
        query = query.order_by(field, direction);
    }

    let mut subscription =
        SubscriptionChannel::open(coordinator.remote(), SubscriptionSpec::<Record>::new(query));
    println!("Watching {} (Ctrl-C to stop)", collection);

    loop {
        tokio::select! {
            changed = subscription.changed() => {
                changed?;
                let state = subscription.snapshot();
                if state.loading {
                    continue;
                }
                if let Some(error) = &state.error {
                    println!("Error: {}", error);
                    continue;
                }
                println!("{} records:", state.data.len());
                for record in state.data.iter() {
                    print_record(record, "");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                subscription.unsubscribe();
                println!("Stopped.");
                break;
            }
        }
    }

    Ok(())
}
