//! # Listing Harvest CLI (`harvest`)
//!
//! The `harvest` binary drives extraction runs and inspects what they left
//! on disk.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest extract` | Harvest images for one or more properties |
//! | `harvest sources` | List configured sources and their status |
//! | `harvest check-url <url>` | Run a URL through the outbound validator |
//! | `harvest state show` | Completed and failed addresses, backups |
//! | `harvest state backup` | Snapshot the extraction state |
//! | `harvest state restore` | Restore the extraction state from a backup |
//! | `harvest state history` | Recent runs |
//! | `harvest index stats` | Dedup index size and bucket spread |
//! | `harvest index clear` | Empty the dedup index |
//! | `harvest stats` | Images and bytes per property folder |
//!
//! ## Exit codes
//!
//! `0` on success, `1` when any property failed or the command errored,
//! `130` when an extraction was interrupted.
//!
//! ## Examples
//!
//! ```bash
//! # One property, every enabled source
//! harvest extract --address "123 Main St, Springfield IL"
//!
//! # Every property in [properties].path, Zillow and Redfin only
//! harvest extract --all --source zillow --source redfin
//!
//! # Show discovered URLs without downloading anything
//! harvest extract --all --dry-run
//!
//! # Start over, ignoring what earlier runs completed
//! harvest extract --all --fresh
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use listing_harvest::extract_cmd::{self, Selection};
use listing_harvest::models::ImageSource;
use listing_harvest::orchestrator::ExtractOptions;
use listing_harvest::progress::ProgressMode;
use listing_harvest::{config, sources, state_cmd, stats};

/// Listing Harvest CLI: crash-safe listing photo harvester.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Listing Harvest: crash-safe listing photo harvester with perceptual-hash deduplication",
    version,
    long_about = "Listing Harvest collects property listing photos from configured sources, \
    validates every outbound URL, drops near-duplicates with perceptual hashing, and stores \
    the rest under descriptive names. Runs are resumable and state writes are atomic."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`. Storage, safety, orchestrator,
    /// circuit breaker, dedup and source settings are read from this file.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Harvest images for properties.
    ///
    /// Queries each selected source in configured order, downloads new
    /// images, skips near-duplicates and records progress. Properties
    /// completed by an earlier run are skipped unless `--fresh` or
    /// `--no-resume` is given.
    Extract {
        /// Property address. Repeat for several properties.
        #[arg(long = "address", conflicts_with = "all")]
        addresses: Vec<String>,

        /// Process every property listed in `[properties].path`.
        #[arg(long)]
        all: bool,

        /// Restrict to these sources (`zillow`, `redfin`, `realtor`, `mls`,
        /// `assessor`). Repeatable; default is every enabled source.
        #[arg(long = "source")]
        sources: Vec<ImageSource>,

        /// Discard the extraction state before starting.
        #[arg(long)]
        fresh: bool,

        /// Skip properties marked completed by earlier runs (the default).
        #[arg(long, overrides_with = "no_resume")]
        resume: bool,

        /// Reprocess properties even if they are marked completed.
        #[arg(long, overrides_with = "resume")]
        no_resume: bool,

        /// Discover and validate URLs only. Nothing is downloaded or written.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr: `off`, `human` or `json`. Defaults to
        /// `human` when stderr is a terminal.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// List configured sources and their status.
    ///
    /// Shows each source's kind, whether it is enabled, and whether its
    /// manifest or endpoint looks usable, followed by the circuit breaker
    /// and URL safety settings.
    Sources,

    /// Check a URL against the outbound validator.
    ///
    /// Prints whether the URL would be fetched and why not. Exits with
    /// status 1 when it is denied.
    CheckUrl {
        /// The URL to check.
        url: String,
    },

    /// Inspect and repair the extraction state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Inspect or reset the dedup hash index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show storage statistics.
    ///
    /// Counts stored images and bytes per property folder, and summarizes
    /// the metadata files and the last run.
    Stats,
}

/// Extraction state subcommands.
#[derive(Subcommand)]
enum StateAction {
    /// Print completed and failed addresses and the available backups.
    Show,

    /// Write a timestamped copy of the current state.
    Backup,

    /// Replace the state with a backup.
    ///
    /// The current state is saved as a pre-restore backup first, so a
    /// restore can always be undone.
    Restore {
        /// Backup file name (see `state show`). Defaults to the newest
        /// regular backup.
        #[arg(long)]
        name: Option<String>,
    },

    /// Show recent runs, newest first.
    History {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Dedup index subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Print index size, LSH bucket spread and per-source counts.
    Stats,

    /// Remove every hash from the index. Stored images are kept.
    Clear {
        /// Confirm the clear.
        #[arg(long)]
        yes: bool,
    },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "unknown progress mode '{}'. Must be one of: off, human, json",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,listing_harvest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let code = match cli.command {
        Commands::Extract {
            addresses,
            all,
            sources,
            fresh,
            resume: _,
            no_resume,
            dry_run,
            progress,
        } => {
            let selection = if all {
                Selection::All
            } else if addresses.is_empty() {
                anyhow::bail!("pass --address <ADDRESS> or --all");
            } else {
                Selection::Addresses(addresses)
            };
            let opts = ExtractOptions {
                sources,
                resume: !no_resume,
                fresh,
                dry_run,
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            extract_cmd::run_extract(&cfg, selection, opts, mode).await?
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
            0
        }
        Commands::CheckUrl { url } => {
            if sources::run_check_url(&cfg, &url).await? {
                0
            } else {
                extract_cmd::EXIT_FAILED
            }
        }
        Commands::State { action } => {
            match action {
                StateAction::Show => state_cmd::run_state_show(&cfg)?,
                StateAction::Backup => state_cmd::run_state_backup(&cfg)?,
                StateAction::Restore { name } => {
                    state_cmd::run_state_restore(&cfg, name.as_deref())?
                }
                StateAction::History { limit } => state_cmd::run_state_history(&cfg, limit)?,
            }
            0
        }
        Commands::Index { action } => {
            match action {
                IndexAction::Stats => state_cmd::run_index_stats(&cfg)?,
                IndexAction::Clear { yes } => state_cmd::run_index_clear(&cfg, yes)?,
            }
            0
        }
        Commands::Stats => {
            stats::run_stats(&cfg)?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
