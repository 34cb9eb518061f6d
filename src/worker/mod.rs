//! The service worker: fetch interception, lifecycle and deferred tasks.

mod classify;
mod lifecycle;
mod sync;

pub use classify::{classify, RequestClass};

use color_eyre::Result;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::{CacheNames, WorkerConfig};
use crate::http::{Method, Request, RequestIdentity, Response};
use crate::network::Network;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, install not started
  Parsed,
  /// Precaching the manifest
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Removing stale partitions
  Activating,
  /// Active and controlling clients
  Activated,
  /// Failed to install, or replaced by a newer worker
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(label)
  }
}

/// Structured messages a client page can post to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerMessage {
  SkipWaiting,
}

impl WorkerMessage {
  /// Wire form, e.g. `{"action":"skipWaiting"}`.
  pub fn to_value(self) -> serde_json::Value {
    match self {
      WorkerMessage::SkipWaiting => serde_json::json!({ "action": "skipWaiting" }),
    }
  }
}

/// One worker instance built from one configuration.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  id: u64,
  config: Arc<WorkerConfig>,
  cache: CacheLayer<S, N>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network,
{
  pub fn new(config: Arc<WorkerConfig>, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let offline_page = RequestIdentity::new(Method::Get, &config.resolve(&config.offline_page)?);
    let cache = CacheLayer::new(storage, network, config.cache_names(), offline_page);

    Ok(Self {
      id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
      config,
      cache,
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
    })
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn names(&self) -> &CacheNames {
    self.cache.names()
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let from = *current;
    debug!(worker = self.id, %from, to = %state, "Worker state change");
    *current = state;
  }

  /// Resolve a request the way the controlling worker would.
  ///
  /// Non-GET requests go straight to the network; API paths use network-first;
  /// everything else stale-while-revalidate.
  pub async fn intercept(&self, request: Request) -> Result<CacheResult<Response>> {
    let class = classify(&request, &self.config.api_prefix);
    debug!(worker = self.id, request = %request.identity(), ?class, "Intercepted");

    match class {
      RequestClass::Ignored => {
        let response = self.cache.network().fetch(request).await?;
        Ok(CacheResult::passthrough(response))
      }
      RequestClass::Api => self.cache.network_first(request).await,
      RequestClass::StaticHtml => self.cache.stale_while_revalidate(request, true).await,
      RequestClass::StaticOther => self.cache.stale_while_revalidate(request, false).await,
    }
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) -> Result<()> {
    self.cache.settle().await
  }
}

impl<S: CacheStorage + 'static, N: Network> fmt::Debug for ServiceWorker<S, N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceWorker")
      .field("id", &self.id)
      .field("names", self.cache.names())
      .field("state", &*self.state.lock().unwrap_or_else(|e| e.into_inner()))
      .finish_non_exhaustive()
  }
}
