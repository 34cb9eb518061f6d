use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::Clients;
use crate::cache::{CacheStorage, RegistrationStore};
use crate::network::Network;
use crate::worker::ServiceWorker;

/// Platform scheduler for deferred tasks.
///
/// A tag stays registered until its handler completes; a failing handler
/// leaves it pending for the next connectivity signal.
pub struct SyncManager<R: RegistrationStore> {
  store: Arc<R>,
}

impl<R: RegistrationStore> SyncManager<R> {
  pub fn new(store: Arc<R>) -> Self {
    Self { store }
  }

  /// Register a task. Registering a pending tag again is a no-op.
  pub fn register(&self, tag: &str) -> Result<()> {
    if self.store.register_sync_tag(tag)? {
      info!(tag, "Deferred task registered");
    } else {
      info!(tag, "Deferred task already pending");
    }
    Ok(())
  }

  pub fn pending(&self) -> Result<Vec<String>> {
    self.store.sync_tags()
  }

  /// Run every pending task once on `worker`. Returns how many completed.
  pub async fn fire<S, N>(&self, worker: &ServiceWorker<S, N>, clients: &Clients) -> Result<usize>
  where
    S: CacheStorage + 'static,
    N: Network,
  {
    let mut completed = 0;

    for tag in self.pending()? {
      match worker.handle_sync(&tag, clients).await {
        Ok(()) => {
          self.store.remove_sync_tag(&tag)?;
          completed += 1;
        }
        Err(e) => warn!(tag = %tag, error = %e, "Deferred task failed, will retry"),
      }
    }

    Ok(completed)
  }
}
