//! # Harvester CLI (`harvest`)
//!
//! The `harvest` binary drives the harvesting pipeline: database setup,
//! harvest runs, dispatch resumption, promotion, status and resource cache
//! maintenance.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvester.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the database and register configured datasets |
//! | `harvest sources` | List sources and entities with their availability |
//! | `harvest run <dataset>` | Harvest a new version and dispatch it to completion |
//! | `harvest dispatch <dataset>` | Resume the newest unfinished version |
//! | `harvest promote <dataset> <version>` | Point the dataset alias at a version |
//! | `harvest status <dataset>` | Versions, sets, counts and index state |
//! | `harvest resources purge` | Drop expired cached resources |
//! | `harvest resources invalidate <kind>` | Force re-fetching of cached resources |
//! | `harvest delete-version <dataset> <version>` | Delete a non-current version |
//! | `harvest completions <shell>` | Print shell completions |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` to change the
//! filter (default `harvester=info`). Progress lines are controlled with
//! `--progress`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use harvester::config;
use harvester::harvest::{Harvester, RunOptions};
use harvester::progress::ProgressMode;
use harvester::sources::list_sources;
use harvester::status::{dataset_status, print_status};

/// Harvester CLI: harvest metadata from external sources, enrich it and
/// publish versioned search indices.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvester.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvester: metadata harvesting and indexing pipeline",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/harvester.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, human, json or off.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and register configured datasets.
    ///
    /// Safe to run multiple times.
    Init,

    /// List configured sources and entities.
    Sources,

    /// Harvest a dataset into a new version and dispatch it to completion.
    Run {
        /// Dataset name from `[datasets.<name>]`.
        dataset: String,

        /// Ignore the last harvest time and harvest everything.
        #[arg(long)]
        full: bool,

        /// Serve every outbound call from the resource cache.
        #[arg(long)]
        cache_only: bool,

        /// Version label (defaults to the start time).
        #[arg(long)]
        version: Option<String>,
    },

    /// Resume dispatch of the newest unfinished version.
    Dispatch {
        dataset: String,

        /// Serve every outbound call from the resource cache.
        #[arg(long)]
        cache_only: bool,
    },

    /// Promote an indexed version: swap the alias and make it current.
    Promote { dataset: String, version: String },

    /// Show versions, sets, document counts and index state.
    Status {
        dataset: String,

        /// Print JSON instead of tables.
        #[arg(long)]
        json: bool,
    },

    /// Maintain the resource cache.
    Resources {
        #[command(subcommand)]
        action: ResourceAction,
    },

    /// Delete a non-current version and, when unreferenced, its index.
    DeleteVersion { dataset: String, version: String },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Delete cached resources past their purge time.
    Purge {
        /// Only resources of this kind.
        #[arg(long)]
        kind: Option<String>,

        /// Also delete resources fetched more than this many days ago.
        #[arg(long)]
        older_than_days: Option<i64>,
    },

    /// Mark cached resources stale so the next fetch goes out again.
    Invalidate {
        kind: String,

        #[arg(long)]
        uri_prefix: Option<String>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("harvester=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "harvest", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;
    let progress = ProgressMode::from_flag(&cli.progress)?;

    if let Commands::Sources = cli.command {
        let registry = harvester::sources::SourceRegistry::with_builtins();
        let statuses = list_sources(&cfg, &registry);
        if statuses.is_empty() {
            println!("No sources configured.");
            return Ok(());
        }
        println!(
            "{:<20} {:<16} {:<10} {:<10} {:<11} {:<12} PHASES",
            "SOURCE", "ENTITY", "EXTRACTOR", "AVAILABLE", "DELETES", "SET"
        );
        for s in statuses {
            let available = match (s.registered, s.is_available, s.is_manual) {
                (false, _, _) => "UNKNOWN",
                (_, false, _) => "NO",
                (_, _, true) => "MANUAL",
                _ => "YES",
            };
            println!(
                "{:<20} {:<16} {:<10} {:<10} {:<11} {:<12} {}",
                s.source,
                s.entity,
                s.extractor,
                available,
                s.delete_policy.to_string(),
                s.set_specification,
                s.phases.join(",")
            );
        }
        return Ok(());
    }

    let harvester = Harvester::from_config(cfg)
        .await?
        .with_progress(Arc::from(progress.reporter()));

    match cli.command {
        Commands::Init => {
            let datasets = harvester.init().await?;
            println!(
                "Database initialized successfully ({} datasets).",
                datasets.len()
            );
        }
        Commands::Run {
            dataset,
            full,
            cache_only,
            version,
        } => {
            let options = RunOptions {
                full,
                cache_only,
                version,
            };
            let summary = harvester.run(&dataset, &options).await?;
            println!(
                "{} version {}: {} ({} sets, {} documents)",
                dataset, summary.version, summary.state, summary.sets, summary.documents
            );
            for set in &summary.failed_sets {
                println!("  seeding failed: {} (historic documents kept)", set);
            }
        }
        Commands::Dispatch {
            dataset,
            cache_only,
        } => {
            let version = harvester.dispatch(&dataset, cache_only).await?;
            println!("{} version {}: {}", dataset, version.version, version.state);
        }
        Commands::Promote { dataset, version } => {
            let version = harvester.promote(&dataset, &version).await?;
            println!("{} version {} is current.", dataset, version.version);
        }
        Commands::Status { dataset, json } => {
            let status = dataset_status(harvester.store(), &dataset).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Resources { action } => {
            let cache = harvester::resources::ResourceCache::from_config(
                harvester.store().clone(),
                harvester.config(),
            )?;
            match action {
                ResourceAction::Purge {
                    kind,
                    older_than_days,
                } => {
                    let removed = cache
                        .purge(kind.as_deref(), older_than_days.map(chrono::Duration::days))
                        .await?;
                    println!("Purged {} resources.", removed);
                }
                ResourceAction::Invalidate { kind, uri_prefix } => {
                    let invalidated = cache.invalidate(&kind, uri_prefix.as_deref()).await?;
                    println!("Invalidated {} resources.", invalidated);
                }
            }
        }
        Commands::DeleteVersion { dataset, version } => {
            let removed_index = harvester.delete_version(&dataset, &version).await?;
            if removed_index {
                println!("Deleted version {} and its index.", version);
            } else {
                println!("Deleted version {}.", version);
            }
        }
        Commands::Sources | Commands::Completions { .. } => {}
    }

    harvester.store().close().await;
    Ok(())
}
