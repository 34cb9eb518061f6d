//! Install and activate steps of a worker.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ServiceWorker, WorkerMessage, WorkerState};
use crate::cache::CacheStorage;
use crate::http::Request;
use crate::network::Network;

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network,
{
  /// Precache the manifest into the static partition.
  ///
  /// All manifest entries are fetched before anything is written; one failed
  /// fetch or non-2xx status fails the whole step and the worker turns redundant.
  pub async fn install(&self) -> Result<()> {
    if self.state() != WorkerState::Parsed {
      return Err(eyre!("Cannot install worker in state {}", self.state()));
    }

    self.set_state(WorkerState::Installing);
    info!(
      worker = self.id,
      partition = %self.names().static_name,
      entries = self.config.manifest.len(),
      "Installing"
    );

    match self.precache().await {
      Ok(()) => {
        self.set_state(WorkerState::Installed);
        if self.config.skip_waiting_on_install {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        warn!(worker = self.id, error = %e, "Install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<()> {
    let requests = self
      .config
      .manifest
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let fetches = requests.into_iter().map(|request| {
      let network = Arc::clone(self.cache.network());
      async move {
        let identity = request.identity();
        let response = network.fetch(request).await?;
        if !response.ok() {
          return Err(eyre!(
            "Precaching {} failed with status {}",
            identity.url,
            response.status
          ));
        }
        Ok((identity, response))
      }
    });

    let entries = try_join_all(fetches).await?;

    let storage = self.cache.storage();
    let partition = &self.names().static_name;
    storage.open(partition)?;
    storage.put_all(partition, entries)?;

    Ok(())
  }

  /// Delete every partition the current build does not name.
  ///
  /// Returns the deleted partition names. Claiming clients is up to the
  /// registration that owns them.
  pub fn activate(&self) -> Result<Vec<String>> {
    if self.state() != WorkerState::Installed {
      return Err(eyre!("Cannot activate worker in state {}", self.state()));
    }

    self.set_state(WorkerState::Activating);

    let storage = self.cache.storage();
    let stale: Vec<String> = storage
      .partition_names()?
      .into_iter()
      .filter(|name| !self.names().is_current(name))
      .collect();

    for name in &stale {
      storage.delete_partition(name)?;
      info!(worker = self.id, partition = %name, "Deleted stale partition");
    }

    self.set_state(WorkerState::Activated);
    Ok(stale)
  }

  /// Mark the worker as running from an earlier activation of the same build.
  pub(crate) fn resume(&self) {
    self.set_state(WorkerState::Activated);
  }

  /// Ask to be activated without waiting for existing clients to go away.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Handle a structured message from a client page; unknown messages are ignored.
  pub fn handle_message(&self, data: &serde_json::Value) {
    match serde_json::from_value::<WorkerMessage>(data.clone()) {
      Ok(WorkerMessage::SkipWaiting) => {
        debug!(worker = self.id, "Skip waiting requested");
        self.skip_waiting();
      }
      Err(_) => debug!(worker = self.id, %data, "Ignoring message"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::{CacheConfig, WorkerConfig};
  use crate::http::Response;
  use crate::network::testing::{MockNetwork, ORIGIN};

  fn config(manifest: &[&str]) -> WorkerConfig {
    WorkerConfig {
      origin: ORIGIN.to_string(),
      manifest: manifest.iter().map(|p| p.to_string()).collect(),
      ..WorkerConfig::default()
    }
  }

  fn worker(
    config: WorkerConfig,
    storage: &Arc<MemoryStorage>,
    network: &MockNetwork,
  ) -> ServiceWorker<MemoryStorage, MockNetwork> {
    ServiceWorker::new(Arc::new(config), Arc::clone(storage), Arc::new(network.clone())).unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let network = MockNetwork::new();
    network.ok("/", "shell").ok("/style.css", "css").ok("/offline.html", "offline");
    let storage = Arc::new(MemoryStorage::new());
    let worker = worker(config(&["/", "/style.css", "/offline.html"]), &storage, &network);

    worker.install().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Installed);
    assert!(worker.wants_skip_waiting());
    let entries = storage.entries("aromatna-static-v2").unwrap();
    assert_eq!(entries.len(), 3);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = MockNetwork::new();
    network.ok("/", "shell").fail("/index.html");
    let storage = Arc::new(MemoryStorage::new());
    let worker = worker(config(&["/", "/index.html"]), &storage, &network);

    assert!(worker.install().await.is_err());

    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(storage.entries("aromatna-static-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let network = MockNetwork::new();
    network.ok("/", "shell").respond("/app.js", Response::new(404, "missing"));
    let storage = Arc::new(MemoryStorage::new());
    let worker = worker(config(&["/", "/app.js"]), &storage, &network);

    assert!(worker.install().await.is_err());
    assert!(storage.match_any(&Request::get(crate::network::testing::url("/")).identity()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_install_without_skip_waiting() {
    let network = MockNetwork::new();
    network.ok("/", "shell");
    let storage = Arc::new(MemoryStorage::new());
    let worker = worker(
      WorkerConfig {
        skip_waiting_on_install: false,
        ..config(&["/"])
      },
      &storage,
      &network,
    );

    worker.install().await.unwrap();
    assert!(!worker.wants_skip_waiting());

    worker.handle_message(&serde_json::json!({ "action": "somethingElse" }));
    assert!(!worker.wants_skip_waiting());

    worker.handle_message(&WorkerMessage::SkipWaiting.to_value());
    assert!(worker.wants_skip_waiting());
  }

  #[tokio::test]
  async fn test_activate_removes_stale_partitions() {
    let network = MockNetwork::new();
    let storage = Arc::new(MemoryStorage::new());
    for name in ["aromatna-static-v1", "aromatna-static-v2", "aromatna-api-v2"] {
      storage.open(name).unwrap();
    }
    let worker = worker(
      WorkerConfig {
        cache: CacheConfig {
          prefix: "aromatna".to_string(),
          static_version: "v2".to_string(),
          api_version: "v2".to_string(),
        },
        ..config(&[])
      },
      &storage,
      &network,
    );
    worker.install().await.unwrap();

    let deleted = worker.activate().unwrap();

    assert_eq!(deleted, vec!["aromatna-static-v1".to_string()]);
    assert_eq!(
      storage.partition_names().unwrap(),
      vec!["aromatna-static-v2".to_string(), "aromatna-api-v2".to_string()]
    );
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_activate_keeps_current_entries() {
    let network = MockNetwork::new();
    network.ok("/", "shell");
    let storage = Arc::new(MemoryStorage::new());
    storage.open("legacy-cache").unwrap();
    let worker = worker(config(&["/"]), &storage, &network);
    worker.install().await.unwrap();

    worker.activate().unwrap();

    assert_eq!(storage.entries("aromatna-static-v2").unwrap().len(), 1);
    assert!(!storage
      .partition_names()
      .unwrap()
      .contains(&"legacy-cache".to_string()));
  }

  #[tokio::test]
  async fn test_activate_requires_installed() {
    let network = MockNetwork::new();
    let storage = Arc::new(MemoryStorage::new());
    let worker = worker(config(&[]), &storage, &network);

    assert!(worker.activate().is_err());
  }
}
