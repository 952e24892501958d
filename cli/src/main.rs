mod commands;
mod config;
mod connectivity;
mod network;
mod server;
mod tls;
mod worker;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_activate, cmd_cache_clear, cmd_cache_list, cmd_cache_show, cmd_install, cmd_records_add,
    cmd_records_list, cmd_records_show, cmd_status, cmd_sync,
};
use crate::config::Config;
use crate::tls::TlsConfig;
use crate::worker::Worker;
use coop_core::cache::CacheStorage;
use coop_core::db::Database;

#[derive(Parser)]
#[command(
    name = "coop",
    version,
    about = "Offline cache and background sync for the farm dashboard",
    long_about = "Sits between the farm dashboard and its origin server. Keeps the app shell \
                  cached so the dashboard opens without a connection, queues records saved \
                  offline and replays them once the origin is reachable again."
)]
struct Cli {
    /// Config file (default: ./coop.yaml, then the user config directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker in front of the origin
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication on the control API (for development/testing)
        #[arg(long)]
        no_auth: bool,
        /// Enable TLS (HTTPS). Generates a self-signed certificate on first use.
        #[arg(long)]
        tls: bool,
        /// Path to TLS certificate file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key file (PEM). Implies --tls.
        #[arg(long, value_name = "PATH")]
        tls_key: Option<PathBuf>,
        /// Extra host name or IP the self-signed certificate should cover (repeatable)
        #[arg(long = "tls-host", value_name = "NAME")]
        tls_hosts: Vec<String>,
    },
    /// Fetch the asset manifest into the current cache bucket
    Install {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Activate the installed cache and delete stale buckets
    Activate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay unsynced records to the origin now
    Sync {
        /// Sync tag to run
        #[arg(default_value = "sync-daily-records")]
        tag: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show worker state, connectivity and unsynced counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and edit records in the local store
    Records {
        #[command(subcommand)]
        command: RecordsCommands,
    },
    /// Inspect and clear cache buckets
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum RecordsCommands {
    /// Save a record (it will be synced later)
    Add {
        /// Collection: cycles, daily-records, inventory
        collection: String,
        /// Record as a JSON object; an id is generated when missing
        data: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records in a collection
    List {
        /// Collection: cycles, daily-records, inventory
        collection: String,
        /// Only records whose indexed field matches (e.g. "cycleId=c1")
        #[arg(short = 'w', long = "where", value_name = "FIELD=VALUE")]
        filter: Option<String>,
        /// Only records not yet synced
        #[arg(long)]
        unsynced: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show {
        /// Collection: cycles, daily-records, inventory
        collection: String,
        /// Record id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cache buckets
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the entries of a bucket
    Show {
        /// Bucket name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a bucket, or all of them
    Clear {
        /// Bucket name
        name: Option<String>,
        /// Delete every bucket
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coop=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn open_worker(config: &Config) -> Result<Worker> {
    let cache = CacheStorage::open(&config.cache_path)?;
    let store = Database::open(&config.db_path)?;
    Worker::new(config.worker.clone(), cache, store)
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
            tls,
            tls_cert,
            tls_key,
            tls_hosts,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            let tls_config = if tls || tls_cert.is_some() || tls_key.is_some() {
                Some(TlsConfig::resolve(
                    &config.data_dir,
                    &bind,
                    tls_cert,
                    tls_key,
                    &tls_hosts,
                )?)
            } else {
                None
            };
            let worker = Arc::new(open_worker(&config)?);
            server::start_server(worker, port, &bind, api_key, tls_config).await
        }
        Commands::Install { json } => cmd_install(&open_worker(&config)?, json).await,
        Commands::Activate { json } => cmd_activate(&open_worker(&config)?, json).await,
        Commands::Sync { tag, json } => cmd_sync(&open_worker(&config)?, &tag, json).await,
        Commands::Status { json } => cmd_status(&open_worker(&config)?, json).await,
        Commands::Records { command } => {
            let db = Database::open(&config.db_path)?;
            match command {
                RecordsCommands::Add {
                    collection,
                    data,
                    json,
                } => cmd_records_add(&db, &collection, &data, json),
                RecordsCommands::List {
                    collection,
                    filter,
                    unsynced,
                    json,
                } => cmd_records_list(&db, &collection, filter.as_deref(), unsynced, json),
                RecordsCommands::Show {
                    collection,
                    id,
                    json,
                } => cmd_records_show(&db, &collection, &id, json),
            }
        }
        Commands::Cache { command } => {
            let cache = CacheStorage::open(&config.cache_path)?;
            match command {
                CacheCommands::List { json } => {
                    cmd_cache_list(&cache, &config.worker.cache_name, json)
                }
                CacheCommands::Show { name, json } => cmd_cache_show(&cache, &name, json),
                CacheCommands::Clear { name, all, json } => {
                    cmd_cache_clear(&cache, name.as_deref(), all, json)
                }
            }
        }
    }
}
