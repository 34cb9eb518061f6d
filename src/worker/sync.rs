//! Deferred task handler.

use color_eyre::Result;
use tracing::{debug, info};

use super::ServiceWorker;
use crate::cache::CacheStorage;
use crate::http::{Method, Request};
use crate::network::Network;
use crate::platform::Clients;

impl<S, N> ServiceWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network,
{
  /// Run the deferred task `tag`.
  ///
  /// For the order tag: POST the order payload, ignore the outcome, then tell
  /// every open client the order went out. Not deduplicated: a platform retry
  /// submits again.
  pub async fn handle_sync(&self, tag: &str, clients: &Clients) -> Result<()> {
    let order = &self.config.order;
    if tag != order.tag {
      debug!(worker = self.id, tag, "Ignoring unknown sync tag");
      return Ok(());
    }

    let request =
      Request::new(Method::Post, self.config.resolve(&order.endpoint)?).with_json_body(&order.payload)?;

    match self.cache.network().fetch(request).await {
      Ok(response) => info!(worker = self.id, status = response.status, "Order submitted"),
      Err(e) => debug!(worker = self.id, error = %e, "Order submission failed"),
    }

    let notified = clients.post_message(&order.confirmation);
    info!(worker = self.id, notified, "Order confirmation sent to clients");

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::WorkerConfig;
  use crate::network::testing::{MockNetwork, ORIGIN};
  use crate::platform::ClientEvent;
  use std::sync::Arc;

  fn worker(network: &MockNetwork) -> ServiceWorker<MemoryStorage, MockNetwork> {
    ServiceWorker::new(
      Arc::new(WorkerConfig {
        origin: ORIGIN.to_string(),
        ..WorkerConfig::default()
      }),
      Arc::new(MemoryStorage::new()),
      Arc::new(network.clone()),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_order_posts_payload_and_notifies() {
    let network = MockNetwork::new();
    network.ok("/api/send-order", "{}");
    let worker = worker(&network);
    let clients = Clients::new();
    let (_, mut rx) = clients.connect(None);

    worker.handle_sync("send-order", &clients).await.unwrap();

    assert_eq!(network.call_count(Method::Post, "/api/send-order"), 1);
    match rx.try_recv().unwrap() {
      ClientEvent::Message(text) => assert_eq!(text, "Order sent!"),
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_order_failure_still_notifies() {
    let network = MockNetwork::new();
    network.fail("/api/send-order");
    let worker = worker(&network);
    let clients = Clients::new();
    let (_, mut first) = clients.connect(None);
    let (_, mut second) = clients.connect(None);

    worker.handle_sync("send-order", &clients).await.unwrap();

    assert!(matches!(first.try_recv(), Ok(ClientEvent::Message(_))));
    assert!(matches!(second.try_recv(), Ok(ClientEvent::Message(_))));
  }

  #[tokio::test]
  async fn test_unknown_tag_ignored() {
    let network = MockNetwork::new();
    let worker = worker(&network);
    let clients = Clients::new();
    let (_, mut rx) = clients.connect(None);

    worker.handle_sync("refresh-menu", &clients).await.unwrap();

    assert!(network.calls().is_empty());
    assert!(rx.try_recv().is_err());
  }
}
