mod cache;
mod config;
mod connectivity;
mod controller;
mod db;
mod logging;
mod net;
mod query;
mod session;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use cache::{Arbiter, ItemStorage};
use config::Config;
use connectivity::{spawn_probe, ConnectionStatus, ConnectivityMonitor};
use controller::{ControllerSettings, PartitionSet, PartitionStorage, ResourceCacheController};
use db::Database;
use net::HttpNetwork;
use query::QueryOptions;
use session::Session;

#[derive(Parser, Debug)]
#[command(name = "kiosk-cache")]
#[command(about = "Offline-first request cache for a kiosk ordering app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/kiosk-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Application origin, e.g. https://order.example.com
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate, then serve a JSON-lines page session on stdin/stdout
  Run,
  /// List stored partitions
  Partitions,
  /// Delete every partition
  Clear {
    /// Also delete the arbiter items of this namespace
    #[arg(short, long, conflicts_with = "items")]
    namespace: Option<String>,

    /// Also delete every arbiter item
    #[arg(long)]
    items: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config {
      origin: Some(origin),
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.log)?;
  let db = Arc::new(Database::open(config.database.as_deref())?);

  match args.command {
    Command::Run => run(config, db).await,
    Command::Partitions => list_partitions(&config, &db),
    Command::Clear { namespace, items } => clear(&db, namespace.as_deref(), items),
  }
}

async fn run(config: Config, db: Arc<Database>) -> Result<()> {
  let settings = ControllerSettings::from_config(&config)?;
  let network = Arc::new(HttpNetwork::new(
    config.remote_hosts.clone(),
    Config::get_api_key(),
  )?);

  let monitor = ConnectivityMonitor::new(ConnectionStatus::Online);
  let connectivity = monitor.handle();

  let controller = ResourceCacheController::new(settings, Arc::clone(&db), network);
  controller.install().await?;
  controller.activate()?;
  controller.watch_connectivity(connectivity.clone());

  let probe_client = reqwest::Client::builder()
    .timeout(config.probe_interval())
    .build()
    .map_err(|e| eyre!("Failed to build probe client: {}", e))?;
  spawn_probe(
    monitor,
    probe_client,
    config.probe_url()?,
    config.probe_interval(),
  );

  let arbiter = Arbiter::new(db, connectivity).with_fresh_time(config.fresh_time());

  // Single writer for stdout so lines never interleave
  let (tx, mut rx) = mpsc::unbounded_channel::<String>();
  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
      stdout.write_all(line.as_bytes()).await?;
      stdout.write_all(b"\n").await?;
      stdout.flush().await?;
    }
    Ok::<_, std::io::Error>(())
  });

  Session::new(controller, arbiter, QueryOptions::default(), tx)
    .run(BufReader::new(tokio::io::stdin()))
    .await?;

  writer
    .await
    .map_err(|e| eyre!("Output writer panicked: {}", e))?
    .map_err(|e| eyre!("Failed to write page output: {}", e))?;
  Ok(())
}

fn list_partitions(config: &Config, db: &Database) -> Result<()> {
  let current = PartitionSet::new(config.cache_version.clone());
  for name in db.partition_names()? {
    let marker = if current.is_current(&name) { "current" } else { "stale" };
    println!("{:<24} {:>6}  {}", name, db.entry_count(&name)?, marker);
  }
  Ok(())
}

fn clear(db: &Database, namespace: Option<&str>, all_items: bool) -> Result<()> {
  let mut removed = 0;
  for name in db.partition_names()? {
    if db.delete_partition(&name)? {
      removed += 1;
    }
  }
  info!(removed, "partitions deleted");
  println!("Deleted {} partitions", removed);

  if let Some(namespace) = namespace {
    let items = db.clear_namespace(namespace)?;
    println!("Deleted {} items from namespace {}", items, namespace);
  } else if all_items {
    println!("Deleted {} items", db.clear_all()?);
  }
  Ok(())
}
