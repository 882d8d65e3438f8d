//! jobsite CLI tool
//!
//! Command-line interface to a jobsite data directory: a `jobsite.toml`, the SQLite document
//! store and the product cache file.
//!
//! ## Commands
//!
//! - `init [--dir]`: Write a default config and create the database
//! - `serve [--config]`: Run the HTTP API until Ctrl-C
//! - `op <json|->`: Execute one command and print the result as JSON
//! - `match --selection <file> <path>...`: Check category paths against a stored selection
//! - `cache show|clear`: Inspect or drop the product cache

use clap::{Parser, Subcommand};
use jobsite_core::{
    cache::ProductCache,
    commands::OpPayload,
    config::{AppConfig, ConfigProvider, TomlConfigProvider, CONFIG_FILE},
    db::DbConnection,
    event::Event,
    hierarchy::{CategoryPath, SelectionDocument},
    http,
    mail::format_date,
    properties::now_millis,
    service::JobsiteService,
    JobsiteError,
};
use std::{
    io::Read,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::channel,
        Arc,
    },
    time::Duration,
};

#[derive(Parser)]
#[command(name = "jobsite")]
#[command(author, version, about = "Collections, estimates and work orders for contractors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a data directory with a default jobsite.toml and an empty database
    Init {
        /// Data directory (default: current directory)
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Company name written to the new config
        #[arg(long)]
        company: Option<String>,

        /// Overwrite an existing jobsite.toml
        #[arg(long)]
        force: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Configuration file; its directory is the data directory (default: ./jobsite.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind, overriding `server.bind` from the config
        #[arg(long)]
        bind: Option<String>,

        /// Print every store and workflow event
        #[arg(short, long)]
        verbose: bool,
    },

    /// Execute one command, given as JSON (`{"op": ...}`) or `-` to read stdin
    Op {
        /// The command payload
        payload: String,

        /// Data directory (default: current directory)
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Report which category paths a stored selection covers
    Match {
        /// JSON file holding a selection, in any supported shape
        #[arg(long)]
        selection: PathBuf,

        /// Paths such as "Electrical / Rough-In / Boxes"
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Inspect or clear the product cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Data directory (default: current directory)
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cache location, size and age
    Show,
    /// Delete the cache file
    Clear,
}

fn load_config(dir: &Path) -> Result<AppConfig, JobsiteError> {
    let provider = TomlConfigProvider::new(dir.join(CONFIG_FILE));
    Ok(provider.get_config()?.rooted(dir))
}

fn runtime() -> Result<tokio::runtime::Runtime, JobsiteError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            dir,
            company,
            force,
        } => {
            std::fs::create_dir_all(&dir)?;
            let provider = TomlConfigProvider::new(dir.join(CONFIG_FILE));
            let mut config = if provider.path().exists() && !force {
                println!("Keeping existing {}", provider.path().display());
                provider.get_config()?
            } else {
                AppConfig::default()
            };
            if let Some(name) = company {
                config.company.name = name;
            }
            provider.set_config(&config)?;

            let rooted = config.rooted(&dir);
            runtime()?.block_on(async {
                let db = DbConnection::open(rooted.store.database.clone()).await?;
                db.0.close().await;
                Ok::<(), JobsiteError>(())
            })?;
            println!("Initialized jobsite data in {}", dir.display());
            println!("  config:   {}", provider.path().display());
            println!("  database: {}", rooted.store.database.display());
            Ok(())
        }

        Commands::Serve {
            config,
            bind,
            verbose,
        } => {
            let config_path = match config {
                Some(path) => path,
                None => std::env::current_dir()?.join(CONFIG_FILE),
            };
            let root_dir = match config_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => std::env::current_dir()?,
            };
            let (tx, rx) = channel::<Event>();
            let event_handle = std::thread::spawn(move || {
                for event in rx {
                    if verbose {
                        println!("[Event] {event:?}");
                    } else {
                        tracing::debug!("[Event] {event:?}");
                    }
                }
            });

            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                println!("\nShutting down...");
                r.store(false, Ordering::SeqCst);
            })?;

            runtime()?.block_on(async move {
                let provider: Arc<dyn ConfigProvider> =
                    Arc::new(TomlConfigProvider::new(config_path));
                let service =
                    Arc::new(JobsiteService::with_provider(root_dir, provider, tx).await?);
                let bind = bind.unwrap_or_else(|| service.config().server.bind.clone());
                let addr: SocketAddr = bind.parse().map_err(|e| {
                    JobsiteError::Validation(format!("invalid bind address '{bind}': {e}"))
                })?;
                println!("Serving on http://{addr}. Press Ctrl-C to stop.");

                let shutdown = async move {
                    while running.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                };
                http::serve(service.clone(), addr, shutdown).await?;
                service.shutdown().await?;
                Ok::<(), JobsiteError>(())
            })?;

            drop(event_handle);
            println!("Shutdown complete");
            Ok(())
        }

        Commands::Op { payload, dir } => {
            let text = if payload == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                payload
            };
            let payload: OpPayload = serde_json::from_str(&text).map_err(JobsiteError::from)?;
            let (tx, _rx) = channel::<Event>();
            let result = runtime()?.block_on(async move {
                let service = JobsiteService::open(dir, tx).await?;
                let result = service.execute(payload.op).await?;
                service.shutdown().await?;
                Ok::<_, JobsiteError>(result)
            })?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }

        Commands::Match { selection, paths } => {
            let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&selection)?)?;
            let document = SelectionDocument::from_value(raw)?;
            if document.is_legacy() {
                println!("Selection uses the legacy flat format");
            }
            let selection = document.into_selection()?;
            for raw_path in paths {
                let path: CategoryPath = raw_path.parse()?;
                let mark = if selection.matches(&path) { "yes" } else { "no " };
                println!("{mark} {path}");
            }
            Ok(())
        }

        Commands::Cache { action, dir } => {
            let config = load_config(&dir)?;
            let mut cache = ProductCache::open(&config.cache.path, config.cache.ttl());
            match action {
                CacheAction::Show => {
                    println!("Product cache: {}", cache.path().display());
                    match cache.saved_at() {
                        Some(saved_at) => {
                            let state = if cache.is_fresh(now_millis()) {
                                "fresh"
                            } else {
                                "stale"
                            };
                            println!(
                                "  {} items, saved {} ({state})",
                                cache.len(),
                                format_date(saved_at)
                            );
                        }
                        None => println!("  empty"),
                    }
                }
                CacheAction::Clear => {
                    cache.invalidate()?;
                    println!("Product cache cleared");
                }
            }
            Ok(())
        }
    }
}
