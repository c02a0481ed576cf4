//! # pkgsearch CLI
//!
//! ```bash
//! pkgsearch --config ./config/pkgsearch.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pkgsearch init` | Write a starter config and create the data directory |
//! | `pkgsearch build --input <file>` | Build, validate, and publish a snapshot |
//! | `pkgsearch search "<query>"` | Hybrid search over the published snapshot |
//! | `pkgsearch get <id>` | Show one package |
//! | `pkgsearch deps <id>` | Dependencies, dependents, or a dependency path |
//! | `pkgsearch graph` | Dependency graph summary |
//! | `pkgsearch health` | Published generation, coverage, and last failure |
//! | `pkgsearch snapshots` | Snapshot history |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use pkgsearch::config;
use pkgsearch::embedding::create_provider;
use pkgsearch::get::{self, DepsOptions};
use pkgsearch::health;
use pkgsearch::logging::init_logging;
use pkgsearch::pipeline::{run_build, BuildInput};
use pkgsearch::progress::{format_number, ProgressMode};
use pkgsearch::publisher::{Publisher, SnapshotCell};
use pkgsearch::search::{run_search, SearchOptions};
use pkgsearch_core::search::SearchFilters;

/// pkgsearch: incremental indexing and hybrid search for package metadata.
#[derive(Parser)]
#[command(name = "pkgsearch", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pkgsearch.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config (if missing) and create the data directory.
    ///
    /// Idempotent: an existing config file is left untouched.
    Init,

    /// Build a new snapshot generation from a metadata dump and publish it.
    ///
    /// Only packages whose content changed since the published snapshot
    /// are re-embedded. If validation fails the previous snapshot keeps
    /// serving.
    Build {
        /// JSON array or JSON Lines file of package metadata.
        #[arg(long)]
        input: PathBuf,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,

        /// Print the build report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the published snapshot.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip this many results.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Only packages whose license contains this text.
        #[arg(long)]
        license: Option<String>,

        /// Only packages in this category.
        #[arg(long)]
        category: Option<String>,

        /// Include packages marked broken.
        #[arg(long)]
        include_broken: bool,

        /// Exclude packages with unfree licenses.
        #[arg(long)]
        exclude_unfree: bool,

        /// Show per-retriever ranks.
        #[arg(long)]
        explain: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show one package by id, attribute path, or name.
    Get {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Dependency queries for one package.
    Deps {
        id: String,

        /// Packages that depend on this one instead.
        #[arg(long)]
        reverse: bool,

        /// Follow edges transitively.
        #[arg(long)]
        transitive: bool,

        /// Maximum traversal depth (implies --transitive).
        #[arg(long)]
        depth: Option<usize>,

        /// Print the shortest dependency path to this package.
        #[arg(long)]
        path_to: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Summarize the dependency graph of the published snapshot.
    Graph {
        #[arg(long)]
        json: bool,
    },

    /// Published generation, embedding coverage, and last failure.
    Health {
        #[arg(long)]
        json: bool,
    },

    /// List snapshot generations and their states.
    Snapshots {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        if config::write_default_config(&cli.config)? {
            println!("Wrote {}", cli.config.display());
        }
    }

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging.level, cli.verbose);

    match cli.command {
        Commands::Init => {
            let publisher = Publisher::open(&cfg.data, Arc::new(SnapshotCell::new())).await?;
            publisher.catalog().close().await;
            println!("Data directory ready: {}", cfg.data.dir.display());
        }
        Commands::Build {
            input,
            progress,
            json,
        } => {
            let provider = create_provider(&cfg.embedding)?;
            let publisher = Publisher::open(&cfg.data, Arc::new(SnapshotCell::new())).await?;
            let reporter = progress.mode().reporter();
            let result = run_build(
                &cfg,
                &publisher,
                BuildInput::File(&input),
                provider,
                reporter.as_ref(),
            )
            .await;
            publisher.catalog().close().await;
            let report = result?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Published generation {}: {} packages, {} embedded ({} new, {} reused), {} deferred, {} dropped edges",
                    report.generation,
                    format_number(report.counts.package_count),
                    format_number(report.counts.embedded_count),
                    format_number(report.embedding.embedded as u64),
                    format_number(report.embedding.reused as u64),
                    format_number(report.counts.deferred_count),
                    format_number(report.counts.dropped_edge_count),
                );
                for dropped in report.dropped_edges.iter().take(20) {
                    println!("  dropped: {}", dropped);
                }
            }
        }
        Commands::Search {
            query,
            limit,
            offset,
            license,
            category,
            include_broken,
            exclude_unfree,
            explain,
            json,
        } => {
            let options = SearchOptions {
                limit,
                offset,
                filters: SearchFilters {
                    license,
                    category,
                    include_broken,
                    include_unfree: !exclude_unfree,
                },
            };
            run_search(&cfg, &query, options, json, explain).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Deps {
            id,
            reverse,
            transitive,
            depth,
            path_to,
            json,
        } => {
            let options = DepsOptions {
                reverse,
                transitive,
                max_depth: depth,
                path_to,
            };
            get::run_deps(&cfg, &id, &options, json).await?;
        }
        Commands::Graph { json } => {
            get::run_graph(&cfg, json).await?;
        }
        Commands::Health { json } => {
            health::run_health(&cfg, json).await?;
        }
        Commands::Snapshots { json } => {
            health::run_snapshots(&cfg, json).await?;
        }
    }

    Ok(())
}
