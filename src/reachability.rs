//! Server reachability monitor.
//!
//! The network-interface signal is only a hint: it can push the state to
//! `Unreachable` instantly, but only a liveness probe that returns the
//! expected JSON schema can make it `Reachable`. A captive portal answering
//! `200 text/html` therefore never counts as reachable.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::server::api_types::{HealthBody, ProbeResponse};
use crate::server::ScoutingServer;

/// Process-wide view of whether the application server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
  #[default]
  Unknown,
  Reachable,
  Unreachable,
}

impl ConnectivityState {
  pub fn label(&self) -> &'static str {
    match self {
      ConnectivityState::Unknown => "checking",
      ConnectivityState::Reachable => "online",
      ConnectivityState::Unreachable => "offline",
    }
  }
}

/// Coarse network-interface signal from the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
  Online,
  Offline,
}

/// Why a probe was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTrigger {
  Interval,
  VisibilityRegained,
  SaveAttempt,
  NetworkChange,
  Manual,
}

type PendingProbe = Shared<BoxFuture<'static, ConnectivityState>>;

pub struct ReachabilityMonitor {
  server: Arc<dyn ScoutingServer>,
  timeout: Duration,
  state: watch::Sender<ConnectivityState>,
  in_flight: tokio::sync::Mutex<Option<PendingProbe>>,
  trigger_tx: mpsc::UnboundedSender<ProbeTrigger>,
  trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<ProbeTrigger>>>,
}

impl ReachabilityMonitor {
  pub fn new(server: Arc<dyn ScoutingServer>, timeout: Duration) -> Self {
    let (state, _) = watch::channel(ConnectivityState::Unknown);
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    Self {
      server,
      timeout,
      state,
      in_flight: tokio::sync::Mutex::new(None),
      trigger_tx,
      trigger_rx: Mutex::new(Some(trigger_rx)),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  /// Only the authoritative probe result decides whether saving to the server is possible.
  pub fn can_save_to_server(&self) -> bool {
    self.state() == ConnectivityState::Reachable
  }

  /// Probe the liveness endpoint once, without publishing the result.
  pub async fn probe(&self, timeout: Duration) -> ConnectivityState {
    run_probe(self.server.as_ref(), timeout).await
  }

  /// Probe and publish. Concurrent callers share one in-flight request.
  pub async fn refresh(&self) -> ConnectivityState {
    let probe = {
      let mut slot = self.in_flight.lock().await;
      match slot.as_ref() {
        // A finished probe can be left behind by a cancelled caller.
        Some(pending) if pending.peek().is_none() => pending.clone(),
        _ => {
          let server = Arc::clone(&self.server);
          let timeout = self.timeout;
          let pending = async move { run_probe(server.as_ref(), timeout).await }
            .boxed()
            .shared();
          *slot = Some(pending.clone());
          pending
        }
      }
    };

    let result = probe.clone().await;

    {
      let mut slot = self.in_flight.lock().await;
      if slot.as_ref().is_some_and(|p| p.ptr_eq(&probe)) {
        *slot = None;
      }
    }

    self.set_state(result);
    result
  }

  /// Ask the background loop for a probe.
  pub fn trigger(&self, reason: ProbeTrigger) {
    if self.trigger_tx.send(reason).is_err() {
      debug!(?reason, "Probe loop not running, trigger dropped");
    }
  }

  /// Feed a network-interface change into the monitor.
  pub fn on_network_signal(&self, signal: NetworkSignal) {
    match signal {
      NetworkSignal::Offline => {
        self.set_state(ConnectivityState::Unreachable);
        self.trigger(ProbeTrigger::NetworkChange);
      }
      NetworkSignal::Online => self.trigger(ProbeTrigger::NetworkChange),
    }
  }

  /// Probe on a fixed interval and whenever a trigger arrives, until `shutdown` flips.
  pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let triggers = self.trigger_rx.lock().ok().and_then(|mut rx| rx.take());
    let Some(mut triggers) = triggers else {
      warn!("Reachability loop already running");
      return;
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      let reason = tokio::select! {
        _ = ticker.tick() => ProbeTrigger::Interval,
        Some(reason) = triggers.recv() => reason,
        _ = shutdown.changed() => break,
      };

      debug!(?reason, "Probing liveness endpoint");
      let monitor = Arc::clone(&self);
      tokio::spawn(async move {
        monitor.refresh().await;
      });
    }

    debug!("Reachability loop stopped");
  }

  fn set_state(&self, next: ConnectivityState) {
    let changed = self.state.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });
    if changed {
      info!(state = ?next, "Connectivity changed");
    }
  }
}

async fn run_probe(server: &dyn ScoutingServer, timeout: Duration) -> ConnectivityState {
  let outcome = match server.health(timeout).await {
    Ok(response) => validate_probe(&response),
    Err(e) => Err(e),
  };

  match outcome {
    Ok(()) => ConnectivityState::Reachable,
    Err(e) => {
      debug!(error = %e, "Liveness probe failed");
      ConnectivityState::Unreachable
    }
  }
}

/// Accept only a 2xx JSON body carrying a `status` field.
pub fn validate_probe(response: &ProbeResponse) -> Result<(), TransportError> {
  if !(200..300).contains(&response.status) {
    return Err(TransportError::Status(response.status));
  }

  let is_json = response
    .content_type
    .as_deref()
    .and_then(|ct| ct.split(';').next())
    .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
    .unwrap_or(false);
  if !is_json {
    return Err(TransportError::Schema(format!(
      "unexpected content-type {:?}",
      response.content_type
    )));
  }

  let body = serde_json::from_slice::<HealthBody>(&response.body)
    .map_err(|e| TransportError::Schema(e.to_string()))?;
  // A missing field deserializes as null.
  if body.status.is_null() {
    return Err(TransportError::Schema("health body has no status".to_string()));
  }
  Ok(())
}

/// Forward state changes only after they hold still for `settle`.
///
/// The logical state is never delayed; this is for banners and other visuals.
pub fn spawn_banner(
  mut rx: watch::Receiver<ConnectivityState>,
  settle: Duration,
) -> mpsc::UnboundedReceiver<ConnectivityState> {
  let (tx, out) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    let mut shown = *rx.borrow_and_update();
    if tx.send(shown).is_err() {
      return;
    }

    while rx.changed().await.is_ok() {
      loop {
        tokio::select! {
          changed = rx.changed() => {
            if changed.is_err() {
              return;
            }
          }
          _ = tokio::time::sleep(settle) => break,
        }
      }

      let current = *rx.borrow_and_update();
      if current != shown {
        shown = current;
        if tx.send(current).is_err() {
          return;
        }
      }
    }
  });

  out
}
