//! In-memory cache storage, for tests and `--ephemeral` runs.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use super::traits::{CacheStorage, CachedEntry, RegistrationStore};
use crate::http::{RequestIdentity, Response};

/// A single named partition.
#[derive(Debug, Default)]
struct Partition {
  name: String,
  /// request hash -> entry
  entries: BTreeMap<String, CachedEntry>,
}

/// Storage kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  /// Partitions in creation order
  partitions: RwLock<Vec<Partition>>,
  sync_tags: Mutex<Vec<String>>,
  active_version: Mutex<Option<String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn poisoned<E: std::fmt::Display>(e: E) -> color_eyre::Report {
  eyre!("Lock poisoned: {}", e)
}

fn entry(identity: &RequestIdentity, response: Response) -> CachedEntry {
  CachedEntry {
    identity: identity.clone(),
    response,
    cached_at: Utc::now(),
  }
}

fn partition_mut<'a>(partitions: &'a mut Vec<Partition>, name: &str) -> &'a mut Partition {
  let index = match partitions.iter().position(|p| p.name == name) {
    Some(index) => index,
    None => {
      partitions.push(Partition {
        name: name.to_string(),
        entries: BTreeMap::new(),
      });
      partitions.len() - 1
    }
  };
  &mut partitions[index]
}

impl CacheStorage for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let mut partitions = self.partitions.write().map_err(poisoned)?;
    partition_mut(&mut partitions, partition);
    Ok(())
  }

  fn match_request(
    &self,
    partition: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedEntry>> {
    let partitions = self.partitions.read().map_err(poisoned)?;
    Ok(
      partitions
        .iter()
        .find(|p| p.name == partition)
        .and_then(|p| p.entries.get(&identity.cache_hash()))
        .cloned(),
    )
  }

  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<CachedEntry>> {
    let partitions = self.partitions.read().map_err(poisoned)?;
    let hash = identity.cache_hash();
    Ok(
      partitions
        .iter()
        .find_map(|p| p.entries.get(&hash))
        .cloned(),
    )
  }

  fn put(&self, partition: &str, identity: &RequestIdentity, response: Response) -> Result<()> {
    let mut partitions = self.partitions.write().map_err(poisoned)?;
    partition_mut(&mut partitions, partition)
      .entries
      .insert(identity.cache_hash(), entry(identity, response));
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: Vec<(RequestIdentity, Response)>) -> Result<()> {
    // A single write lock makes the batch visible all at once
    let mut partitions = self.partitions.write().map_err(poisoned)?;
    let target = partition_mut(&mut partitions, partition);
    for (identity, response) in entries {
      target
        .entries
        .insert(identity.cache_hash(), entry(&identity, response));
    }
    Ok(())
  }

  fn delete(&self, partition: &str, identity: &RequestIdentity) -> Result<bool> {
    let mut partitions = self.partitions.write().map_err(poisoned)?;
    Ok(
      partitions
        .iter_mut()
        .find(|p| p.name == partition)
        .and_then(|p| p.entries.remove(&identity.cache_hash()))
        .is_some(),
    )
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let partitions = self.partitions.read().map_err(poisoned)?;
    let mut entries: Vec<CachedEntry> = partitions
      .iter()
      .find(|p| p.name == partition)
      .map(|p| p.entries.values().cloned().collect())
      .unwrap_or_default();
    entries.sort_by(|a, b| {
      (a.identity.url.as_str(), a.identity.method.as_str())
        .cmp(&(b.identity.url.as_str(), b.identity.method.as_str()))
    });
    Ok(entries)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let partitions = self.partitions.read().map_err(poisoned)?;
    Ok(partitions.iter().map(|p| p.name.clone()).collect())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut partitions = self.partitions.write().map_err(poisoned)?;
    let before = partitions.len();
    partitions.retain(|p| p.name != partition);
    Ok(partitions.len() != before)
  }
}

impl RegistrationStore for MemoryStorage {
  fn register_sync_tag(&self, tag: &str) -> Result<bool> {
    let mut tags = self.sync_tags.lock().map_err(poisoned)?;
    if tags.iter().any(|t| t == tag) {
      return Ok(false);
    }
    tags.push(tag.to_string());
    Ok(true)
  }

  fn sync_tags(&self) -> Result<Vec<String>> {
    Ok(self.sync_tags.lock().map_err(poisoned)?.clone())
  }

  fn remove_sync_tag(&self, tag: &str) -> Result<()> {
    self.sync_tags.lock().map_err(poisoned)?.retain(|t| t != tag);
    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    Ok(self.active_version.lock().map_err(poisoned)?.clone())
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    *self.active_version.lock().map_err(poisoned)? = Some(version.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use url::Url;

  fn identity(path: &str) -> RequestIdentity {
    let url = Url::parse("https://shop.test").unwrap().join(path).unwrap();
    RequestIdentity::new(Method::Get, &url)
  }

  #[test]
  fn test_partitions_keep_creation_order() {
    let storage = MemoryStorage::new();
    storage.open("b").unwrap();
    storage.put("a", &identity("/"), Response::new(200, "a")).unwrap();
    storage.open("b").unwrap();

    assert_eq!(
      storage.partition_names().unwrap(),
      vec!["b".to_string(), "a".to_string()]
    );
  }

  #[test]
  fn test_put_overwrites_and_match_any() {
    let storage = MemoryStorage::new();
    let key = identity("/style.css");
    storage.put("static", &key, Response::new(200, "v1")).unwrap();
    storage.put("static", &key, Response::new(200, "v2")).unwrap();

    assert_eq!(storage.entries("static").unwrap().len(), 1);
    assert_eq!(storage.match_any(&key).unwrap().unwrap().response.text(), "v2");
    assert!(storage.match_request("api", &key).unwrap().is_none());
  }

  #[test]
  fn test_delete_partition() {
    let storage = MemoryStorage::new();
    storage.put("old", &identity("/"), Response::new(200, "x")).unwrap();

    assert!(storage.delete_partition("old").unwrap());
    assert!(!storage.delete_partition("old").unwrap());
    assert!(storage.match_any(&identity("/")).unwrap().is_none());
  }
}
