use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use offsync::cache::CacheStore;
use offsync::config::Config;
use offsync::connectivity::{
  ConnectivityMonitor, HttpProbe, ManualOsSignal, ProbeOutcome, ReachabilityProbe, StaticProbe,
};
use offsync::error::{ErrorCode, GatewayError};
use offsync::gateway::{GatewayOp, MemoryGateway};
use offsync::record::{payload, Record};
use offsync::session::StaticSession;
use offsync::store::SyncedCollectionStore;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-tolerant optimistic synchronization for record collections")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file (rotated daily) instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe the configured endpoints and report connectivity
  Probe {
    /// Keep checking on the configured interval and print each transition
    #[arg(short, long)]
    watch: bool,
  },
  /// Walk through optimistic mutations, rollback and offline reads against an in-memory backend
  Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = offsync::logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Probe { watch } => probe(&config, watch).await,
    Command::Demo => demo(&config).await,
  }
}

async fn probe(config: &Config, watch: bool) -> Result<()> {
  let settings = config.connectivity_settings();
  let probe = Arc::new(HttpProbe::new(settings.probe_timeout)?);

  let outcomes = join_all(settings.endpoints.iter().map(|e| probe.check(e))).await;
  for (endpoint, outcome) in settings.endpoints.iter().zip(outcomes) {
    let label = match outcome {
      ProbeOutcome::Reachable => "reachable",
      ProbeOutcome::Unreachable => "unreachable",
      ProbeOutcome::Inconclusive => "inconclusive",
    };
    println!("{:<14} {}", label, endpoint);
  }

  let monitor = Arc::new(ConnectivityMonitor::new(
    settings,
    probe,
    Arc::new(ManualOsSignal::default()),
  ));
  monitor.check().await;
  println!("connectivity: {}", monitor.state());

  if watch {
    let mut transitions = monitor.subscribe();
    let checker = monitor.spawn_periodic_check();
    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        next = transitions.recv() => match next {
          Ok(state) => println!("connectivity: {}", state),
          Err(_) => break,
        },
      }
    }
    checker.abort();
  }

  Ok(())
}

async fn demo(config: &Config) -> Result<()> {
  let owner = "demo-user";
  let gateway = Arc::new(MemoryGateway::new(config.store.stat_fields.clone()));
  gateway.seed([
    Record::new("p1", owner, payload(json!({"name": "Max", "type": "dog", "status": "available"}))),
    Record::new("p2", owner, payload(json!({"name": "Luna", "type": "cat", "status": "adopted"}))),
  ]);

  // Scripted reachability, so the demo can go offline on cue.
  let probe = Arc::new(StaticProbe::new(ProbeOutcome::Reachable));
  let os = Arc::new(ManualOsSignal::default());
  let monitor = Arc::new(ConnectivityMonitor::new(
    config.connectivity_settings(),
    probe.clone(),
    os.clone(),
  ));
  let cache = Arc::new(CacheStore::new(config.cache_ttl(), monitor.watch()));
  let sweeper = cache.spawn_sweeper(config.sweep_interval());
  let session = Arc::new(StaticSession::signed_in(owner));

  let store = Arc::new(SyncedCollectionStore::new(
    gateway.clone(),
    session,
    monitor.clone(),
    cache.clone(),
    config.retry_policy(),
    config.store_options(),
  ));
  let session_watch = store.spawn_session_watch();

  let loaded = store.load(false).await?;
  println!("loaded {} record(s) from {:?}", loaded.data.len(), loaded.source);
  show(&store);

  let created = store
    .create(payload(json!({"name": "Rex", "type": "dog", "status": "available"})))
    .await?;
  println!("created {}", created.id);
  show(&store);

  let updated = store
    .update(&created.id, payload(json!({"status": "adopted"})))
    .await?;
  println!("updated {}: status={}", updated.id, updated.field_str("status").unwrap_or("-"));
  show(&store);

  gateway.fail_next(
    GatewayOp::Update,
    GatewayError::new(ErrorCode::Validation, "status is not allowed"),
  );
  match store.update("p1", payload(json!({"status": "???"}))).await {
    Ok(_) => return Err(eyre!("scripted failure did not happen")),
    Err(err) => {
      let restored = store.record("p1").map(|r| r.payload);
      println!("update of p1 rejected ({}), restored to {:?}", err, restored);
    }
  }
  show(&store);

  let found = store.search("max").await?;
  println!("search 'max': {} match(es)", found.records.len());

  info!("taking the network down");
  os.set(false);
  probe.set_default(ProbeOutcome::Unreachable);
  monitor.notify_os_offline();

  let offline = store.load(true).await?;
  println!(
    "offline load: {} record(s) from {:?} (cached copy: {})",
    offline.data.len(),
    offline.source,
    offline.is_cached()
  );

  let found = store.search("luna").await?;
  println!("offline search 'luna': {} match(es), partial={}", found.records.len(), found.partial);

  let stats = store.statistics().await?;
  println!(
    "offline statistics: total={} completeness={:?} breakdown={:?}",
    stats.total, stats.completeness, stats.breakdown
  );

  if let Err(err) = store.delete("p2").await {
    println!("delete while offline: {}", err);
  }
  show(&store);

  let cache_stats = cache.stats();
  println!("cache: {} entr(ies)", cache_stats.size);

  session_watch.abort();
  sweeper.abort();
  Ok(())
}

fn show(store: &SyncedCollectionStore) {
  for record in store.current_records() {
    println!(
      "  {:<8} {:<14} {}",
      record.id,
      format!("{:?}", record.status),
      serde_json::Value::Object(record.payload)
    );
  }
}
