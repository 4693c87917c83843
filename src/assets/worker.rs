//! Asset worker lifecycle and request handling.
//!
//! A worker precaches the app shell under a generation-named cache, then on
//! activation drops every other generation and claims open clients. Once
//! active, every asset request goes through [`AssetWorker::fetch`], which never
//! fails: when neither network nor cache can answer it synthesizes a response.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::AssetConfig;
use crate::error::AssetError;

use super::classify::{classify, Strategy};
use super::network::{AssetNetwork, AssetRequest, AssetResponse};
use super::storage::CacheStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install or activation failed; the worker never controls clients.
  Redundant,
}

impl WorkerState {
  pub fn label(&self) -> &'static str {
    match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    }
  }
}

fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;
  matches!(
    (from, to),
    (Parsed, Installing)
      | (Installing, Installed)
      | (Installed, Activating)
      | (Activating, Activated)
      | (Installing, Redundant)
      | (Installed, Redundant)
      | (Activating, Redundant)
  )
}

/// Messages posted from the worker to its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
  StateChanged(WorkerState),
  /// The worker took control of open clients after activating.
  Claimed { generation: String },
  NetworkLost,
  NetworkRestored,
  Generation(String),
}

/// Messages clients post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
  SkipWaiting,
  GetGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  Cache,
  Network,
  /// The cached offline page stood in for an uncached navigation.
  OfflinePage,
  Synthesized,
}

#[derive(Debug, Clone)]
pub struct Served {
  pub response: AssetResponse,
  pub source: FetchSource,
  pub strategy: Strategy,
}

pub struct AssetWorker {
  config: AssetConfig,
  cache_name: String,
  storage: Arc<CacheStorage>,
  network: Arc<dyn AssetNetwork>,
  state: watch::Sender<WorkerState>,
  messages: broadcast::Sender<WorkerMessage>,
  /// Last observed network outcome, `None` until the first request.
  network_up: Mutex<Option<bool>>,
}

impl AssetWorker {
  pub fn new(config: AssetConfig, storage: Arc<CacheStorage>, network: Arc<dyn AssetNetwork>) -> Self {
    let (state, _) = watch::channel(WorkerState::Parsed);
    let (messages, _) = broadcast::channel(32);
    Self {
      cache_name: config.cache_name(),
      config,
      storage,
      network,
      state,
      messages,
      network_up: Mutex::new(None),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub fn generation(&self) -> &str {
    &self.config.generation
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
    self.messages.subscribe()
  }

  fn post(&self, message: WorkerMessage) {
    // No subscribers is fine.
    let _ = self.messages.send(message);
  }

  fn transition(&self, to: WorkerState) -> Result<(), AssetError> {
    let mut from = to;
    let moved = self.state.send_if_modified(|state| {
      from = *state;
      if is_valid_transition(*state, to) {
        *state = to;
        true
      } else {
        false
      }
    });

    if !moved {
      return Err(AssetError::InvalidTransition {
        from: from.label(),
        to: to.label(),
      });
    }
    debug!(from = from.label(), to = to.label(), "Asset worker state change");
    self.post(WorkerMessage::StateChanged(to));
    Ok(())
  }

  fn fail(&self, err: AssetError) -> AssetError {
    warn!(generation = %self.config.generation, error = %err, "Asset worker is redundant");
    // Only errors if already redundant.
    let _ = self.transition(WorkerState::Redundant);
    err
  }

  /// Precache every shell route into this generation's cache.
  ///
  /// All routes are fetched before anything is written, so a single failure
  /// leaves no partial cache behind and the worker redundant.
  pub async fn install(&self) -> Result<(), AssetError> {
    self.transition(WorkerState::Installing)?;

    let fetches = self.config.shell.iter().map(|route| async move {
      let request = AssetRequest::get(route);
      match self.network.fetch(&request).await {
        Ok(response) if response.status == 200 => Ok((route.clone(), response)),
        Ok(response) => Err(AssetError::InstallFailed {
          url: route.clone(),
          reason: format!("status {}", response.status),
        }),
        Err(e) => Err(AssetError::InstallFailed {
          url: route.clone(),
          reason: e.to_string(),
        }),
      }
    });

    let mut entries = Vec::with_capacity(self.config.shell.len());
    for result in join_all(fetches).await {
      match result {
        Ok(entry) => entries.push(entry),
        Err(e) => return Err(self.fail(e)),
      }
    }

    if let Err(e) = self.storage.put_all(&self.cache_name, &entries) {
      return Err(self.fail(e.into()));
    }

    info!(
      cache = %self.cache_name,
      routes = entries.len(),
      "Precached app shell"
    );
    self.transition(WorkerState::Installed)
  }

  /// Drop every cache except the current generation, then claim clients.
  ///
  /// Returns the names of the deleted caches.
  pub async fn activate(&self) -> Result<Vec<String>, AssetError> {
    self.transition(WorkerState::Activating)?;

    let mut deleted = Vec::new();
    let names = match self.storage.cache_names() {
      Ok(names) => names,
      Err(e) => return Err(self.fail(e.into())),
    };
    for name in names.into_iter().filter(|name| *name != self.cache_name) {
      if let Err(e) = self.storage.delete_cache(&name) {
        return Err(self.fail(e.into()));
      }
      info!(cache = %name, "Deleted old asset cache");
      deleted.push(name);
    }

    self.transition(WorkerState::Activated)?;
    self.post(WorkerMessage::Claimed {
      generation: self.config.generation.clone(),
    });
    Ok(deleted)
  }

  /// Pick up a generation installed by an earlier session.
  ///
  /// Returns false when this generation's cache does not exist yet.
  pub fn resume(&self) -> Result<bool, AssetError> {
    if !self.storage.cache_names()?.contains(&self.cache_name) {
      return Ok(false);
    }
    let moved = self.state.send_if_modified(|state| {
      if *state == WorkerState::Parsed {
        *state = WorkerState::Installed;
        true
      } else {
        false
      }
    });
    if moved {
      debug!(cache = %self.cache_name, "Resumed installed asset cache");
      self.post(WorkerMessage::StateChanged(WorkerState::Installed));
    }
    Ok(moved)
  }

  /// Install and activate without waiting for older clients to close.
  pub async fn start(&self) -> Result<Vec<String>, AssetError> {
    self.install().await?;
    self.activate().await
  }

  pub async fn handle_message(&self, message: ClientMessage) -> Result<Option<WorkerMessage>, AssetError> {
    match message {
      ClientMessage::GetGeneration => Ok(Some(WorkerMessage::Generation(
        self.config.generation.clone(),
      ))),
      ClientMessage::SkipWaiting => {
        if self.state() == WorkerState::Installed {
          self.activate().await?;
        }
        Ok(None)
      }
    }
  }

  /// Answer an asset request. Never fails.
  pub async fn fetch(&self, request: &AssetRequest) -> Served {
    if self.state() != WorkerState::Activated {
      // Not controlling clients yet: plain network passthrough.
      return self.network_only(request, Strategy::NetworkOnly).await;
    }

    match classify(request, &self.config) {
      Strategy::NetworkOnly => self.network_only(request, Strategy::NetworkOnly).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  async fn network_only(&self, request: &AssetRequest, strategy: Strategy) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.note_network(true);
        served(response, FetchSource::Network, strategy)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network-only request failed");
        self.note_network(false);
        served(
          AssetResponse::synthesized(503, "Service unavailable while offline"),
          FetchSource::Synthesized,
          strategy,
        )
      }
    }
  }

  async fn cache_first(&self, request: &AssetRequest) -> Served {
    if let Some(hit) = self.lookup(&request.url) {
      return served(hit, FetchSource::Cache, Strategy::CacheFirst);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.note_network(true);
        self.store(&request.url, &response);
        served(response, FetchSource::Network, Strategy::CacheFirst)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Uncached asset unavailable");
        self.note_network(false);
        served(
          AssetResponse::synthesized(504, "Asset not available offline"),
          FetchSource::Synthesized,
          Strategy::CacheFirst,
        )
      }
    }
  }

  async fn network_first(&self, request: &AssetRequest) -> Served {
    let err = match self.network.fetch(request).await {
      Ok(response) => {
        self.note_network(true);
        self.store(&request.url, &response);
        return served(response, FetchSource::Network, Strategy::NetworkFirst);
      }
      Err(e) => e,
    };

    debug!(url = %request.url, error = %err, "Falling back to cache");
    self.note_network(false);

    if let Some(hit) = self.lookup(&request.url) {
      return served(hit, FetchSource::Cache, Strategy::NetworkFirst);
    }
    if request.navigate {
      if let Some(page) = self.lookup(&self.config.offline_page) {
        return served(page, FetchSource::OfflinePage, Strategy::NetworkFirst);
      }
    }
    served(
      AssetResponse::synthesized(503, "Offline and no cached copy available"),
      FetchSource::Synthesized,
      Strategy::NetworkFirst,
    )
  }

  fn lookup(&self, url: &str) -> Option<AssetResponse> {
    match self.storage.match_url(&self.cache_name, url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %url, error = %e, "Asset cache read failed");
        None
      }
    }
  }

  fn store(&self, url: &str, response: &AssetResponse) {
    if !is_cacheable(response) {
      return;
    }
    if let Err(e) = self.storage.put(&self.cache_name, url, response) {
      warn!(url = %url, error = %e, "Asset cache write failed");
    }
  }

  fn note_network(&self, up: bool) {
    let Ok(mut last) = self.network_up.lock() else {
      return;
    };
    let message = match (*last, up) {
      (Some(false), true) => Some(WorkerMessage::NetworkRestored),
      (Some(false), false) => None,
      (_, false) => Some(WorkerMessage::NetworkLost),
      (_, true) => None,
    };
    *last = Some(up);
    drop(last);

    if let Some(message) = message {
      info!(message = ?message, "Asset worker network change");
      self.post(message);
    }
  }
}

fn served(response: AssetResponse, source: FetchSource, strategy: Strategy) -> Served {
  Served {
    response,
    source,
    strategy,
  }
}

fn is_cacheable(response: &AssetResponse) -> bool {
  response.status == 200
    && !response
      .header("cache-control")
      .is_some_and(|v| v.to_ascii_lowercase().contains("no-store"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TransportError;
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FakeNetwork {
    routes: Mutex<HashMap<String, AssetResponse>>,
    online: AtomicBool,
    requests: Mutex<Vec<String>>,
  }

  impl FakeNetwork {
    fn new(routes: &[&str]) -> Arc<Self> {
      let routes = routes
        .iter()
        .map(|route| (route.to_string(), page(&format!("body of {}", route))))
        .collect();
      Arc::new(Self {
        routes: Mutex::new(routes),
        online: AtomicBool::new(true),
        requests: Mutex::new(Vec::new()),
      })
    }

    fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    fn route(&self, url: &str, response: AssetResponse) {
      self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    fn requests(&self) -> Vec<String> {
      self.requests.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl AssetNetwork for FakeNetwork {
    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, TransportError> {
      self.requests.lock().unwrap().push(request.url.clone());
      if !self.online.load(Ordering::SeqCst) {
        return Err(TransportError::Network("offline".to_string()));
      }
      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(&request.url)
          .cloned()
          .unwrap_or_else(|| AssetResponse::synthesized(404, "not found")),
      )
    }
  }

  fn page(body: &str) -> AssetResponse {
    AssetResponse {
      status: 200,
      headers: vec![("content-type".to_string(), "text/html".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  fn config(generation: &str) -> AssetConfig {
    AssetConfig {
      generation: generation.to_string(),
      ..AssetConfig::default()
    }
  }

  fn shell_network() -> Arc<FakeNetwork> {
    FakeNetwork::new(&AssetConfig::default().shell.iter().map(String::as_str).collect::<Vec<_>>())
  }

  fn worker(generation: &str, storage: &Arc<CacheStorage>, network: &Arc<FakeNetwork>) -> AssetWorker {
    AssetWorker::new(config(generation), storage.clone(), network.clone())
  }

  #[tokio::test]
  async fn test_precached_routes_served_offline() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();
    assert_eq!(w.state(), WorkerState::Activated);

    network.set_online(false);
    let served = w.fetch(&AssetRequest::navigate("/scouting")).await;
    assert_eq!(served.source, FetchSource::Cache);
    assert_eq!(served.response.status, 200);
    assert_eq!(served.response.body, b"body of /scouting");

    let served = w.fetch(&AssetRequest::get("/static/css/app.css")).await;
    assert_eq!(served.source, FetchSource::Cache);
    assert_eq!(served.strategy, Strategy::CacheFirst);
  }

  #[tokio::test]
  async fn test_uncached_navigation_gets_offline_page() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();
    network.set_online(false);

    let served = w.fetch(&AssetRequest::navigate("/scouting/history")).await;
    assert_eq!(served.source, FetchSource::OfflinePage);
    assert_eq!(served.response.body, b"body of /offline");

    let served = w.fetch(&AssetRequest::get("/scouting/api/teams")).await;
    assert_eq!(served.source, FetchSource::Synthesized);
    assert_eq!(served.response.status, 503);

    let served = w.fetch(&AssetRequest::get("/static/img/missing.png")).await;
    assert_eq!(served.source, FetchSource::Synthesized);
    assert_eq!(served.response.status, 504);
  }

  #[tokio::test]
  async fn test_activation_deletes_previous_generation() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();

    let old = worker("v1", &storage, &network);
    old.start().await.unwrap();
    assert_eq!(storage.cache_names().unwrap(), vec!["scout-shell-v1"]);

    let new = worker("v2", &storage, &network);
    let mut messages = new.subscribe();
    new.install().await.unwrap();
    // Old generation survives until the new worker activates.
    assert_eq!(
      storage.cache_names().unwrap(),
      vec!["scout-shell-v1", "scout-shell-v2"]
    );

    let deleted = new.activate().await.unwrap();
    assert_eq!(deleted, vec!["scout-shell-v1"]);
    assert_eq!(storage.cache_names().unwrap(), vec!["scout-shell-v2"]);

    let mut claimed = false;
    while let Ok(message) = messages.try_recv() {
      if message == (WorkerMessage::Claimed { generation: "v2".to_string() }) {
        claimed = true;
      }
    }
    assert!(claimed);
  }

  #[tokio::test]
  async fn test_failed_install_leaves_worker_redundant() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    network.route("/static/js/app.js", AssetResponse::synthesized(500, "boom"));

    let w = worker("v1", &storage, &network);
    let err = w.install().await.unwrap_err();
    assert!(matches!(err, AssetError::InstallFailed { ref url, .. } if url == "/static/js/app.js"));
    assert_eq!(w.state(), WorkerState::Redundant);
    assert!(storage.cache_names().unwrap().is_empty());
    assert!(w.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);
    assert!(matches!(
      w.activate().await,
      Err(AssetError::InvalidTransition { from: "parsed", to: "activating" })
    ));
    assert_eq!(w.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_cache_first_skips_network_on_hit() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();
    let before = network.requests().len();

    let served = w.fetch(&AssetRequest::get("/static/js/app.js")).await;
    assert_eq!(served.source, FetchSource::Cache);
    assert_eq!(network.requests().len(), before);

    network.route("/static/img/logo.svg", page("<svg/>"));
    let served = w.fetch(&AssetRequest::get("/static/img/logo.svg")).await;
    assert_eq!(served.source, FetchSource::Network);
    assert!(storage
      .keys("scout-shell-v1")
      .unwrap()
      .contains(&"/static/img/logo.svg".to_string()));
  }

  #[tokio::test]
  async fn test_network_first_caches_only_ok_responses() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    network.route("/scouting/api/teams", page("[]"));
    network.route(
      "/scouting/api/private",
      AssetResponse {
        headers: vec![("Cache-Control".to_string(), "private, no-store".to_string())],
        ..page("{}")
      },
    );
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();

    w.fetch(&AssetRequest::get("/scouting/api/teams")).await;
    w.fetch(&AssetRequest::get("/scouting/api/private")).await;
    let served = w.fetch(&AssetRequest::get("/scouting/api/missing")).await;
    assert_eq!(served.response.status, 404);

    let keys = storage.keys("scout-shell-v1").unwrap();
    assert!(keys.contains(&"/scouting/api/teams".to_string()));
    assert!(!keys.contains(&"/scouting/api/private".to_string()));
    assert!(!keys.contains(&"/scouting/api/missing".to_string()));

    network.set_online(false);
    let served = w.fetch(&AssetRequest::get("/scouting/api/teams")).await;
    assert_eq!(served.source, FetchSource::Cache);
    assert_eq!(served.response.body, b"[]");
  }

  #[tokio::test]
  async fn test_excluded_paths_never_cached() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    network.route("/admin/users", page("users"));
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();

    let served = w.fetch(&AssetRequest::navigate("/admin/users")).await;
    assert_eq!(served.source, FetchSource::Network);
    assert_eq!(served.strategy, Strategy::NetworkOnly);
    assert!(!storage
      .keys("scout-shell-v1")
      .unwrap()
      .contains(&"/admin/users".to_string()));

    network.set_online(false);
    let served = w.fetch(&AssetRequest::navigate("/admin/users")).await;
    assert_eq!(served.source, FetchSource::Synthesized);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_network_lost_and_restored_posted_once() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);
    w.start().await.unwrap();
    let mut messages = w.subscribe();

    network.set_online(false);
    w.fetch(&AssetRequest::navigate("/")).await;
    w.fetch(&AssetRequest::navigate("/scouting")).await;
    network.set_online(true);
    w.fetch(&AssetRequest::navigate("/")).await;
    w.fetch(&AssetRequest::navigate("/scouting")).await;

    let mut seen = Vec::new();
    while let Ok(message) = messages.try_recv() {
      seen.push(message);
    }
    assert_eq!(
      seen,
      vec![WorkerMessage::NetworkLost, WorkerMessage::NetworkRestored]
    );
  }

  #[tokio::test]
  async fn test_client_messages() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v7", &storage, &network);

    let reply = w.handle_message(ClientMessage::GetGeneration).await.unwrap();
    assert_eq!(reply, Some(WorkerMessage::Generation("v7".to_string())));

    w.install().await.unwrap();
    assert_eq!(w.state(), WorkerState::Installed);
    assert_eq!(w.handle_message(ClientMessage::SkipWaiting).await.unwrap(), None);
    assert_eq!(w.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_resume_picks_up_previous_install() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    worker("v1", &storage, &network).start().await.unwrap();

    let restarted = worker("v1", &storage, &network);
    assert!(restarted.resume().unwrap());
    assert_eq!(restarted.state(), WorkerState::Installed);
    restarted.activate().await.unwrap();

    network.set_online(false);
    let served = restarted.fetch(&AssetRequest::navigate("/")).await;
    assert_eq!(served.source, FetchSource::Cache);

    let fresh = worker("v2", &storage, &network);
    assert!(!fresh.resume().unwrap());
    assert_eq!(fresh.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_inactive_worker_passes_through() {
    let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
    let network = shell_network();
    let w = worker("v1", &storage, &network);

    let served = w.fetch(&AssetRequest::navigate("/scouting")).await;
    assert_eq!(served.source, FetchSource::Network);
    assert!(storage.cache_names().unwrap().is_empty());
  }
}
