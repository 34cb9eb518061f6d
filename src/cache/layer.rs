//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStorage};
use crate::config::CacheNames;
use crate::http::{Request, RequestIdentity, Response};
use crate::network::Network;

/// Cache layer that combines the partitions with the network.
///
/// This layer sits between the fetch interceptor and the network client and
/// implements the two strategies: network-first for API data and
/// stale-while-revalidate for static assets.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  names: CacheNames,
  /// Served to HTML requests when cache and network both miss
  offline_page: RequestIdentity,
  /// Refreshes started behind a cache hit
  revalidations: Mutex<JoinSet<()>>,
}

impl<S, N> CacheLayer<S, N>
where
  S: CacheStorage + 'static,
  N: Network,
{
  /// Create a new cache layer over the given storage and network.
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    names: CacheNames,
    offline_page: RequestIdentity,
  ) -> Self {
    Self {
      storage,
      network,
      names,
      offline_page,
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network - on a 2xx reply, store a copy in the API partition
  /// 2. On failure (transport error or non-2xx), serve whatever any partition holds
  /// 3. Nothing cached: reply with an empty JSON array
  pub async fn network_first(&self, request: Request) -> Result<CacheResult<Response>> {
    let identity = request.identity();

    match self.network.fetch(request).await {
      Ok(response) if response.ok() => {
        if let Err(e) = self
          .storage
          .put(&self.names.api_name, &identity, response.clone())
        {
          // The reply is still good even if it could not be kept
          warn!(request = %identity, error = %e, "Failed to cache API response");
        }
        return Ok(CacheResult::from_network(response));
      }
      Ok(response) => {
        debug!(request = %identity, status = response.status, "API error status, falling back");
      }
      Err(e) => {
        debug!(request = %identity, error = %e, "API unreachable, falling back");
      }
    }

    if let Some(cached) = self.storage.match_any(&identity)? {
      return Ok(CacheResult::offline(cached.response, cached.cached_at));
    }

    Ok(CacheResult::fallback(Response::empty_json_array()))
  }

  /// Fetch with stale-while-revalidate strategy.
  ///
  /// A cached entry is returned at once while the network refresh runs in the
  /// background. Without one, the refresh is awaited; if that yields nothing,
  /// HTML requests get the offline page and everything else a 503.
  pub async fn stale_while_revalidate(
    &self,
    request: Request,
    accepts_html: bool,
  ) -> Result<CacheResult<Response>> {
    let identity = request.identity();
    let cached = self
      .storage
      .match_request(&self.names.static_name, &identity)?;

    let refresh = revalidate(
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      self.names.static_name.clone(),
      request,
    );

    if let Some(cached) = cached {
      {
        let mut revalidations = self
          .revalidations
          .lock()
          .map_err(|e| eyre!("Lock poisoned: {}", e))?;
        reap(&mut revalidations);
        revalidations.spawn(async move {
          refresh.await;
        });
      }
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    if let Some(response) = refresh.await {
      return Ok(CacheResult::from_network(response));
    }

    if accepts_html {
      if let Some(page) = self.storage.match_any(&self.offline_page)? {
        return Ok(CacheResult::fallback(page.response));
      }
    }

    Ok(CacheResult::fallback(Response::offline()))
  }

  /// Background refreshes not yet reaped.
  #[cfg(test)]
  fn pending_revalidations(&self) -> usize {
    self.revalidations.lock().map(|set| set.len()).unwrap_or(0)
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) -> Result<()> {
    let mut pending = std::mem::take(
      &mut *self
        .revalidations
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?,
    );

    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "Background revalidation did not complete");
      }
    }

    Ok(())
  }
}

/// Drop refreshes that already finished.
fn reap(revalidations: &mut JoinSet<()>) {
  while let Some(joined) = revalidations.try_join_next() {
    if let Err(e) = joined {
      warn!(error = %e, "Background revalidation did not complete");
    }
  }
}

/// Fetch `request` and keep a copy of exact-200 replies. Transport failure yields `None`.
async fn revalidate<S: CacheStorage, N: Network>(
  storage: Arc<S>,
  network: Arc<N>,
  partition: String,
  request: Request,
) -> Option<Response> {
  let identity = request.identity();

  match network.fetch(request).await {
    Ok(response) => {
      if response.status == 200 {
        if let Err(e) = storage.put(&partition, &identity, response.clone()) {
          warn!(request = %identity, error = %e, "Failed to refresh cached asset");
        }
      }
      Some(response)
    }
    Err(e) => {
      debug!(request = %identity, error = %e, "Revalidation failed");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::cache::CacheSource;
  use crate::config::WorkerConfig;
  use crate::http::Method;
  use crate::network::testing::{url, MockNetwork};

  fn layer(network: &MockNetwork) -> CacheLayer<MemoryStorage, MockNetwork> {
    CacheLayer::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(network.clone()),
      WorkerConfig::default().cache_names(),
      RequestIdentity::new(Method::Get, &url("/offline.html")),
    )
  }

  fn get(path: &str) -> Request {
    Request::get(url(path))
  }

  #[tokio::test]
  async fn test_network_first_caches_success() {
    let network = MockNetwork::new();
    network.respond(
      "/api/menu.json",
      Response::new(200, r#"[{"id":"latte"}]"#).with_header("content-type", "application/json"),
    );
    let layer = layer(&network);

    let result = layer.network_first(get("/api/menu.json")).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), r#"[{"id":"latte"}]"#);
    let stored = layer
      .storage()
      .match_request("aromatna-api-v2", &get("/api/menu.json").identity())
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, result.data.body);
  }

  #[tokio::test]
  async fn test_network_first_serves_cache_when_offline() {
    let network = MockNetwork::new();
    network.ok("/api/menu.json", "[1]");
    let layer = layer(&network);
    layer.network_first(get("/api/menu.json")).await.unwrap();

    network.set_online(false);
    let result = layer.network_first(get("/api/menu.json")).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.text(), "[1]");
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_empty_array_without_cache() {
    let network = MockNetwork::new();
    network.set_online(false);
    let layer = layer(&network);

    let result = layer.network_first(get("/api/menu.json")).await.unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.header("content-type"), Some("application/json"));
    let items: Vec<serde_json::Value> = result.data.parse_json().unwrap();
    assert!(items.is_empty());
  }

  #[tokio::test]
  async fn test_network_first_error_status_is_failure() {
    let network = MockNetwork::new();
    network.respond("/api/menu.json", Response::new(500, "boom"));
    let layer = layer(&network);

    let result = layer.network_first(get("/api/menu.json")).await.unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.text(), "[]");
    assert!(layer.storage().entries("aromatna-api-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_swr_hit_does_not_wait_for_network() {
    let network = MockNetwork::new();
    network.ok("/style.css", "fresh");
    let layer = layer(&network);
    let key = get("/style.css").identity();
    layer
      .storage()
      .put("aromatna-static-v2", &key, Response::new(200, "stale"))
      .unwrap();

    network.hold();
    let result = layer
      .stale_while_revalidate(get("/style.css"), false)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.text(), "stale");

    network.release();
    layer.settle().await.unwrap();

    let refreshed = layer
      .storage()
      .match_request("aromatna-static-v2", &key)
      .unwrap()
      .unwrap();
    assert_eq!(refreshed.response.text(), "fresh");
  }

  #[tokio::test]
  async fn test_finished_revalidations_are_reaped() {
    let network = MockNetwork::new();
    network.ok("/style.css", "fresh");
    let layer = layer(&network);
    layer
      .storage()
      .put("aromatna-static-v2", &get("/style.css").identity(), Response::new(200, "stale"))
      .unwrap();

    for _ in 0..5 {
      layer
        .stale_while_revalidate(get("/style.css"), false)
        .await
        .unwrap();
      for _ in 0..3 {
        tokio::task::yield_now().await;
      }
    }

    assert_eq!(network.call_count(Method::Get, "/style.css"), 5);
    assert!(layer.pending_revalidations() <= 1);
    layer.settle().await.unwrap();
    assert_eq!(layer.pending_revalidations(), 0);
  }

  #[tokio::test]
  async fn test_swr_does_not_cache_non_200() {
    let network = MockNetwork::new();
    network.respond("/missing.png", Response::new(404, "nope"));
    let layer = layer(&network);

    let result = layer
      .stale_while_revalidate(get("/missing.png"), false)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 404);
    assert!(layer.storage().entries("aromatna-static-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_swr_offline_page_for_html() {
    let network = MockNetwork::new();
    network.set_online(false);
    let layer = layer(&network);
    layer
      .storage()
      .put(
        "aromatna-static-v2",
        &get("/offline.html").identity(),
        Response::new(200, "<h1>offline</h1>"),
      )
      .unwrap();

    let page = layer
      .stale_while_revalidate(get("/menu"), true)
      .await
      .unwrap();
    assert_eq!(page.source, CacheSource::Fallback);
    assert_eq!(page.data.text(), "<h1>offline</h1>");

    let image = layer
      .stale_while_revalidate(get("/coffee.jpg"), false)
      .await
      .unwrap();
    assert_eq!(image.data.status, 503);
  }

  #[tokio::test]
  async fn test_swr_503_when_offline_page_missing() {
    let network = MockNetwork::new();
    network.set_online(false);
    let layer = layer(&network);

    let result = layer
      .stale_while_revalidate(get("/"), true)
      .await
      .unwrap();

    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.text(), "Offline");
  }

  #[tokio::test]
  async fn test_swr_repeated_fetch_overwrites_entry() {
    let network = MockNetwork::new();
    network.ok("/app.js", "console.log(1)");
    let layer = layer(&network);

    layer.stale_while_revalidate(get("/app.js"), false).await.unwrap();
    layer.stale_while_revalidate(get("/app.js"), false).await.unwrap();
    layer.settle().await.unwrap();

    let entries = layer.storage().entries("aromatna-static-v2").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.text(), "console.log(1)");
    assert_eq!(network.call_count(Method::Get, "/app.js"), 2);
  }
}
