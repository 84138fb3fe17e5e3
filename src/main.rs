//! blobshard -- command-line entry point.
//!
//! `resolve` and `list` are one-shot inspection commands.  `worker` drains
//! the replication queue and serves the admin endpoint until it has run its
//! iterations or receives SIGTERM/SIGINT.

use clap::{Parser, Subcommand};
use tracing::info;

use blobshard::listing::{ListOptions, ListingEntry, ListingPage};
use blobshard::storage::backend::ListInclude;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "blobshard",
    version,
    about = "One blob namespace sharded over many storage accounts"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "blobshard.example.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the shard a new blob name is placed on.
    Resolve {
        name: String,
    },
    /// Print one page of the merged listing of a container as JSON.
    List {
        container: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long)]
        delimiter: Option<String>,
        #[arg(long)]
        marker: Option<String>,
        #[arg(long)]
        max_results: Option<u32>,
        /// Include snapshots.
        #[arg(long)]
        snapshots: bool,
    },
    /// Run the replication worker.
    Worker {
        /// Dequeue rounds before exiting.
        #[arg(long, default_value_t = usize::MAX)]
        iterations: usize,
    },
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = blobshard::config::load_config(&cli.config)?;
    init_tracing(&config.logging.level, &config.logging.format);
    info!("Loaded configuration from {}", cli.config);

    if config.observability.metrics {
        blobshard::metrics::init_metrics();
        blobshard::metrics::describe_metrics();
    }

    let admin_bind = config.observability.admin_bind.clone();
    let state = blobshard::build_state(config)?;

    match cli.command {
        Command::Resolve { name } => {
            let index = state.shards.resolve(&name);
            let account = state
                .shards
                .get(index)
                .map(|s| s.account().to_string())
                .unwrap_or_default();
            println!("{index}\t{account}");
        }
        Command::List {
            container,
            prefix,
            delimiter,
            marker,
            max_results,
            snapshots,
        } => {
            let options = ListOptions {
                prefix,
                delimiter,
                marker,
                max_results,
                include: ListInclude {
                    snapshots,
                    metadata: true,
                },
            };
            let page = blobshard::ops::list(&state, &container, &options).await?;
            println!("{}", serde_json::to_string_pretty(&page_json(&page))?);
        }
        Command::Worker { iterations } => {
            let listener = tokio::net::TcpListener::bind(&admin_bind).await?;
            info!("Admin endpoint listening on {}", admin_bind);
            let app = blobshard::server::admin_app(state.clone());
            let admin = tokio::spawn(async move { axum::serve(listener, app).await });

            let worker = state.worker();
            tokio::select! {
                report = worker.run(iterations) => {
                    info!("Worker done: processed={} errors={}", report.processed, report.errors);
                }
                _ = shutdown_signal() => {}
            }
            admin.abort();
        }
    }
    Ok(())
}

fn page_json(page: &ListingPage) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = page
        .entries
        .iter()
        .map(|entry| match entry {
            ListingEntry::Blob(b) => serde_json::json!({
                "name": b.name,
                "snapshot": b.snapshot,
                "shard": b.shard,
                "etag": b.properties.etag,
                "last_modified": b.properties.last_modified.to_rfc3339(),
                "content_length": b.properties.content_length,
                "metadata": b.metadata,
            }),
            ListingEntry::Prefix(p) => serde_json::json!({ "prefix": p }),
        })
        .collect();
    serde_json::json!({
        "entries": entries,
        "next_marker": page.next_marker,
    })
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
