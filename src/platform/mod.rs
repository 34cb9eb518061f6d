//! The hosting platform: worker registration, open clients and deferred tasks.

mod clients;
mod sync;

pub use clients::{ClientEvent, Clients};
pub use sync::SyncManager;

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cache::{CacheResult, CacheStorage, RegistrationStore};
use crate::config::WorkerConfig;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::worker::{ServiceWorker, WorkerState};

type Worker<S, N> = Arc<ServiceWorker<S, N>>;

/// Outcome of an update check.
pub enum UpdateCheck<S: CacheStorage, N: Network> {
  /// Nothing controls the scope yet
  Unregistered,
  /// The active worker already runs this build
  UpToDate,
  /// A new worker installed and is waiting for a skip-waiting message
  Waiting(Worker<S, N>),
  /// A new worker installed and took over right away
  Activated(Worker<S, N>),
}

struct Slots<S: CacheStorage, N: Network> {
  installing: Option<Worker<S, N>>,
  waiting: Option<Worker<S, N>>,
  active: Option<Worker<S, N>>,
}

/// A worker registration for one scope.
pub struct Registration<S, N>
where
  S: CacheStorage + RegistrationStore + 'static,
  N: Network,
{
  config: Arc<WorkerConfig>,
  storage: Arc<S>,
  network: Arc<N>,
  slots: Mutex<Slots<S, N>>,
  clients: Clients,
  sync: Option<SyncManager<S>>,
}

impl<S, N> Registration<S, N>
where
  S: CacheStorage + RegistrationStore + 'static,
  N: Network,
{
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    let sync = config
      .background_sync
      .then(|| SyncManager::new(Arc::clone(&storage)));

    Self {
      config: Arc::new(config),
      storage,
      network,
      slots: Mutex::new(Slots {
        installing: None,
        waiting: None,
        active: None,
      }),
      clients: Clients::new(),
      sync,
    }
  }

  fn slots(&self) -> Result<MutexGuard<'_, Slots<S, N>>> {
    self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn config(&self) -> &Arc<WorkerConfig> {
    &self.config
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Deferred task support; `None` when the platform lacks it.
  pub fn sync(&self) -> Option<&SyncManager<S>> {
    self.sync.as_ref()
  }

  pub fn active(&self) -> Option<Worker<S, N>> {
    self.slots().ok().and_then(|slots| slots.active.clone())
  }

  #[cfg(test)]
  pub fn waiting(&self) -> Option<Worker<S, N>> {
    self.slots().ok().and_then(|slots| slots.waiting.clone())
  }

  #[cfg(test)]
  pub fn installing(&self) -> Option<Worker<S, N>> {
    self.slots().ok().and_then(|slots| slots.installing.clone())
  }

  /// Whether some worker (live or recorded by an earlier run) controls the scope.
  pub fn has_controller(&self) -> Result<bool> {
    Ok(self.active().is_some() || self.storage.active_version()?.is_some())
  }

  /// Bring back the worker recorded as active, if it runs the configured build.
  pub fn resume(&self) -> Result<Option<Worker<S, N>>> {
    let tag = self.config.cache_names().build_tag();
    if self.storage.active_version()?.as_deref() != Some(tag.as_str()) {
      return Ok(None);
    }

    let worker = Arc::new(self.spawn_worker(Arc::clone(&self.config))?);
    worker.resume();
    self.slots()?.active = Some(Arc::clone(&worker));
    debug!(worker = worker.id(), build = %tag, "Resumed active worker");

    Ok(Some(worker))
  }

  /// Register the configured build: resume it if it is already active, install it otherwise.
  pub async fn register(&self) -> Result<Worker<S, N>> {
    if let Some(worker) = self.resume()? {
      return Ok(worker);
    }
    self.install(Arc::clone(&self.config)).await
  }

  fn spawn_worker(&self, config: Arc<WorkerConfig>) -> Result<ServiceWorker<S, N>> {
    ServiceWorker::new(config, Arc::clone(&self.storage), Arc::clone(&self.network))
  }

  /// Install a worker for `config` and activate it unless it has to wait.
  ///
  /// It waits only when another worker controls the scope and it did not ask
  /// to skip waiting.
  pub async fn install(&self, config: Arc<WorkerConfig>) -> Result<Worker<S, N>> {
    let worker = Arc::new(self.spawn_worker(config)?);
    self.slots()?.installing = Some(Arc::clone(&worker));

    let installed = worker.install().await;

    {
      let mut slots = self.slots()?;
      if slots.installing.as_ref().is_some_and(|w| w.id() == worker.id()) {
        slots.installing = None;
      }
    }
    installed?;

    if !self.has_controller()? || worker.wants_skip_waiting() {
      self.activate(&worker)?;
    } else {
      info!(worker = worker.id(), "Installed, waiting to activate");
      let replaced = self.slots()?.waiting.replace(Arc::clone(&worker));
      if let Some(replaced) = replaced {
        replaced.set_state(WorkerState::Redundant);
      }
    }

    Ok(worker)
  }

  /// Activate `worker`, retire the previous one and claim every open client.
  pub fn activate(&self, worker: &Worker<S, N>) -> Result<()> {
    let deleted = worker.activate()?;

    let previous = {
      let mut slots = self.slots()?;
      if slots.waiting.as_ref().is_some_and(|w| w.id() == worker.id()) {
        slots.waiting = None;
      }
      slots.active.replace(Arc::clone(worker))
    };
    if let Some(previous) = previous {
      previous.set_state(WorkerState::Redundant);
    }

    self
      .storage
      .set_active_version(&worker.names().build_tag())?;
    let claimed = self.clients.claim(worker.id());

    info!(
      worker = worker.id(),
      deleted = deleted.len(),
      claimed,
      "Worker activated"
    );
    Ok(())
  }

  /// Deliver a client message to `worker`; a skip-waiting request activates a waiting worker.
  pub fn post_message(&self, worker: &Worker<S, N>, data: &serde_json::Value) -> Result<()> {
    worker.handle_message(data);

    let is_waiting = self
      .slots()?
      .waiting
      .as_ref()
      .is_some_and(|w| w.id() == worker.id());

    if is_waiting && worker.wants_skip_waiting() {
      self.activate(worker)?;
    }
    Ok(())
  }

  /// Check for a new build described by `config` and install it if it differs.
  pub async fn update(&self, config: Arc<WorkerConfig>) -> Result<UpdateCheck<S, N>> {
    if !self.has_controller()? {
      return Ok(UpdateCheck::Unregistered);
    }

    let tag = config.cache_names().build_tag();
    let current = match self.active() {
      Some(worker) => Some(worker.names().build_tag()),
      None => self.storage.active_version()?,
    };
    if current.as_deref() == Some(tag.as_str()) {
      debug!(build = %tag, "Already up to date");
      return Ok(UpdateCheck::UpToDate);
    }

    info!(from = ?current, to = %tag, "Update found");
    let worker = self.install(config).await?;

    Ok(match worker.state() {
      WorkerState::Activated => UpdateCheck::Activated(worker),
      _ => UpdateCheck::Waiting(worker),
    })
  }

  /// Issue a request from a page: through the active worker, or straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    match self.active() {
      Some(worker) => worker.intercept(request).await,
      None => {
        let response = self.network.fetch(request).await?;
        Ok(CacheResult::passthrough(response))
      }
    }
  }

  /// Connectivity came back: run pending deferred tasks on the active worker.
  pub async fn connectivity_restored(&self) -> Result<usize> {
    let Some(sync) = &self.sync else {
      return Ok(0);
    };
    let Some(worker) = self.active() else {
      debug!("No active worker to run deferred tasks");
      return Ok(0);
    };

    sync.fire(&worker, &self.clients).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::CacheConfig;
  use crate::http::Method;
  use crate::network::testing::{url, MockNetwork, ORIGIN};
  use crate::worker::WorkerMessage;

  fn config(version: &str, skip_waiting: bool) -> WorkerConfig {
    WorkerConfig {
      origin: ORIGIN.to_string(),
      manifest: vec!["/".to_string(), "/offline.html".to_string()],
      skip_waiting_on_install: skip_waiting,
      cache: CacheConfig {
        static_version: version.to_string(),
        api_version: version.to_string(),
        ..CacheConfig::default()
      },
      ..WorkerConfig::default()
    }
  }

  fn online_network() -> MockNetwork {
    let network = MockNetwork::new();
    network.ok("/", "shell").ok("/offline.html", "offline");
    network
  }

  fn registration(
    config: WorkerConfig,
    network: &MockNetwork,
  ) -> Registration<MemoryStorage, MockNetwork> {
    Registration::new(
      config,
      Arc::new(MemoryStorage::new()),
      Arc::new(network.clone()),
    )
  }

  #[tokio::test]
  async fn test_first_install_activates_and_claims() {
    let network = online_network();
    let registration = registration(config("v1", false), &network);
    let (client, mut rx) = registration.clients().connect(None);

    let worker = registration.register().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(registration.active().unwrap().id(), worker.id());
    assert!(registration.installing().is_none());
    assert_eq!(registration.clients().controller_of(client), Some(worker.id()));
    assert_eq!(
      rx.try_recv().unwrap(),
      ClientEvent::ControllerChange { worker: worker.id() }
    );
    assert_eq!(
      registration.storage().active_version().unwrap().as_deref(),
      Some("aromatna-static-v1+aromatna-api-v1")
    );
  }

  #[tokio::test]
  async fn test_register_resumes_same_build() {
    let network = online_network();
    let storage = Arc::new(MemoryStorage::new());
    let first = Registration::new(config("v1", true), Arc::clone(&storage), Arc::new(network.clone()));
    first.register().await.unwrap();
    let fetches = network.calls().len();

    let second = Registration::new(config("v1", true), storage, Arc::new(network.clone()));
    let worker = second.register().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(network.calls().len(), fetches);
  }

  #[tokio::test]
  async fn test_failed_install_leaves_previous_worker() {
    let network = online_network();
    let registration = registration(config("v1", true), &network);
    let old = registration.register().await.unwrap();

    network.fail("/offline.html");
    assert!(registration.update(Arc::new(config("v2", true))).await.is_err());

    assert_eq!(registration.active().unwrap().id(), old.id());
    assert!(registration.installing().is_none());
    assert!(registration
      .storage()
      .entries("aromatna-static-v2")
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_update_waits_then_skip_waiting_hands_off() {
    let network = online_network();
    let registration = registration(config("v1", false), &network);
    let old = registration.register().await.unwrap();
    let (_, mut rx) = registration.clients().connect(Some(old.id()));

    let check = registration.update(Arc::new(config("v2", false))).await.unwrap();
    let UpdateCheck::Waiting(new) = check else {
      panic!("expected the new worker to wait");
    };
    assert_eq!(new.state(), WorkerState::Installed);
    assert_eq!(registration.active().unwrap().id(), old.id());
    assert!(rx.try_recv().is_err());

    registration
      .post_message(&new, &WorkerMessage::SkipWaiting.to_value())
      .unwrap();

    assert_eq!(registration.active().unwrap().id(), new.id());
    assert!(registration.waiting().is_none());
    assert_eq!(old.state(), WorkerState::Redundant);
    assert_eq!(
      rx.try_recv().unwrap(),
      ClientEvent::ControllerChange { worker: new.id() }
    );
    assert_eq!(
      registration.storage().partition_names().unwrap(),
      vec!["aromatna-static-v2".to_string()]
    );
  }

  #[tokio::test]
  async fn test_update_with_skip_waiting_activates_immediately() {
    let network = online_network();
    let registration = registration(config("v1", true), &network);
    registration.register().await.unwrap();

    let check = registration.update(Arc::new(config("v2", true))).await.unwrap();

    assert!(matches!(check, UpdateCheck::Activated(_)));
  }

  #[tokio::test]
  async fn test_update_up_to_date_and_unregistered() {
    let network = online_network();
    let registration = registration(config("v1", true), &network);

    let check = registration.update(Arc::new(config("v1", true))).await.unwrap();
    assert!(matches!(check, UpdateCheck::Unregistered));

    registration.register().await.unwrap();
    let check = registration.update(Arc::new(config("v1", true))).await.unwrap();
    assert!(matches!(check, UpdateCheck::UpToDate));
  }

  #[tokio::test]
  async fn test_fetch_without_controller_goes_to_network() {
    let network = online_network();
    let registration = registration(config("v1", true), &network);

    let result = registration.fetch(Request::get(url("/"))).await.unwrap();

    assert_eq!(result.source, crate::cache::CacheSource::Passthrough);
    assert!(registration.storage().partition_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_deferred_order_runs_once_when_back_online() {
    let network = online_network();
    network.fail("/api/send-order");
    let registration = registration(config("v1", true), &network);
    registration.register().await.unwrap();
    let (_, mut first) = registration.clients().connect(None);
    let (_, mut second) = registration.clients().connect(None);

    network.set_online(false);
    registration.sync().unwrap().register("send-order").unwrap();
    assert_eq!(
      registration.sync().unwrap().pending().unwrap(),
      vec!["send-order".to_string()]
    );

    network.set_online(true);
    assert_eq!(registration.connectivity_restored().await.unwrap(), 1);
    assert_eq!(registration.connectivity_restored().await.unwrap(), 0);

    assert_eq!(network.call_count(Method::Post, "/api/send-order"), 1);
    assert_eq!(
      first.try_recv().unwrap(),
      ClientEvent::Message("Order sent!".to_string())
    );
    assert_eq!(
      second.try_recv().unwrap(),
      ClientEvent::Message("Order sent!".to_string())
    );
    assert!(registration.sync().unwrap().pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_unavailable_when_disabled() {
    let network = online_network();
    let registration = registration(
      WorkerConfig {
        background_sync: false,
        ..config("v1", true)
      },
      &network,
    );

    assert!(registration.sync().is_none());
    assert_eq!(registration.connectivity_restored().await.unwrap(), 0);
  }
}
