//! Wires every component of a session together and owns the background loops.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assets::{AssetNetwork, AssetWorker, CacheStorage, HttpAssetNetwork};
use crate::config::Config;
use crate::prefs::Preferences;
use crate::queue::SubmissionQueue;
use crate::reachability::ReachabilityMonitor;
use crate::reference::ReferenceCache;
use crate::server::{HttpServer, ScoutingServer};
use crate::store::SqliteStore;
use crate::sync::SyncOrchestrator;

const STORE_FILE: &str = "store.db";
const ASSET_FILE: &str = "assets.db";

pub struct SessionContext {
  pub config: Config,
  pub monitor: Arc<ReachabilityMonitor>,
  pub queue: Arc<SubmissionQueue<SqliteStore>>,
  pub reference: Arc<ReferenceCache<SqliteStore>>,
  pub prefs: Preferences<SqliteStore>,
  pub sync: Arc<SyncOrchestrator<SqliteStore>>,
  pub assets: Arc<AssetWorker>,
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl SessionContext {
  /// Open the on-disk stores under the configured data directory.
  pub fn open(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(SqliteStore::open(&data_dir.join(STORE_FILE))?);
    let asset_storage = Arc::new(CacheStorage::open(&data_dir.join(ASSET_FILE))?);

    let timeout = config.tunables.request_timeout();
    let server: Arc<dyn ScoutingServer> = Arc::new(HttpServer::new(&config.server, timeout)?);
    let network: Arc<dyn AssetNetwork> = Arc::new(HttpAssetNetwork::new(&config.server.url, timeout)?);

    debug!(data_dir = %data_dir.display(), "Opened local stores");
    Ok(Self::assemble(config, store, server, asset_storage, network))
  }

  pub fn assemble(
    config: Config,
    store: Arc<SqliteStore>,
    server: Arc<dyn ScoutingServer>,
    asset_storage: Arc<CacheStorage>,
    network: Arc<dyn AssetNetwork>,
  ) -> Self {
    let tunables = &config.tunables;
    let monitor = Arc::new(ReachabilityMonitor::new(
      server.clone(),
      tunables.probe_timeout(),
    ));
    let queue = Arc::new(SubmissionQueue::new(store.clone()).with_retention(tunables.retention()));
    let reference = Arc::new(
      ReferenceCache::new(store.clone(), server.clone(), monitor.subscribe())
        .with_freshness(tunables.freshness()),
    );
    let sync = Arc::new(SyncOrchestrator::new(
      queue.clone(),
      reference.clone(),
      monitor.clone(),
      Preferences::new(store.clone()),
      server,
    ));
    let assets = Arc::new(AssetWorker::new(config.assets.clone(), asset_storage, network));
    let (shutdown, _) = watch::channel(false);

    Self {
      monitor,
      queue,
      reference,
      prefs: Preferences::new(store),
      sync,
      assets,
      shutdown,
      tasks: Vec::new(),
      config,
    }
  }

  /// Start the probe loop and the sync loop.
  pub fn spawn_background(&mut self) {
    let tunables = &self.config.tunables;

    let monitor = self.monitor.clone();
    let interval = tunables.probe_interval();
    let shutdown = self.shutdown.subscribe();
    self
      .tasks
      .push(tokio::spawn(async move { monitor.run(interval, shutdown).await }));

    let sync = self.sync.clone();
    let every = tunables.stale_check_interval();
    let shutdown = self.shutdown.subscribe();
    self
      .tasks
      .push(tokio::spawn(async move { sync.run(every, shutdown).await }));

    info!(server = %self.config.server.url, "Background sync started");
  }

  /// Stop the background loops and wait for them to exit.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    for task in self.tasks {
      if let Err(e) = task.await {
        warn!(error = %e, "Background task ended abnormally");
      }
    }
    debug!("Session closed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::server::fake::FakeServer;
  use crate::sync::SyncEvent;
  use std::time::Duration;

  fn context(server: Arc<FakeServer>) -> SessionContext {
    let config = Config::for_server("http://127.0.0.1:9");
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let asset_storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network: Arc<dyn AssetNetwork> =
      Arc::new(HttpAssetNetwork::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap());
    SessionContext::assemble(config, store, server, asset_storage, network)
  }

  #[tokio::test]
  async fn test_background_loops_drain_queue_on_first_probe() {
    let server = Arc::new(FakeServer::healthy());
    let mut ctx = context(server.clone());
    ctx.queue.enqueue(serde_json::json!({ "team": "254" })).unwrap();

    let mut events = ctx.sync.subscribe();
    ctx.spawn_background();

    let summary = tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        if let Ok(SyncEvent::Flushed(summary)) = events.recv().await {
          return summary;
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(server.saved().len(), 1);
    assert_eq!(ctx.assets.cache_name(), "scout-shell-v1");
    ctx.shutdown().await;
  }
}
