//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{RequestIdentity, Response};

/// A stored request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub identity: RequestIdentity,
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Storage is organised in named partitions, each mapping a request identity to
/// the most recently stored response. Single operations are atomic; only
/// `put_all` spans several entries.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Look up an entry in one partition.
  fn match_request(&self, partition: &str, identity: &RequestIdentity)
    -> Result<Option<CachedEntry>>;

  /// Look up an entry across all partitions, oldest partition first.
  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<CachedEntry>>;

  /// Store (or overwrite) an entry, creating the partition on first write.
  fn put(&self, partition: &str, identity: &RequestIdentity, response: Response) -> Result<()>;

  /// Store several entries in one transaction: either all land or none do.
  fn put_all(&self, partition: &str, entries: Vec<(RequestIdentity, Response)>) -> Result<()>;

  /// Remove a single entry. Returns whether it existed.
  fn delete(&self, partition: &str, identity: &RequestIdentity) -> Result<bool>;

  /// All entries of a partition, ordered by URL.
  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>>;

  /// Names of all partitions in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition with all of its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;
}

/// Platform-side registration state that outlives a single worker instance.
pub trait RegistrationStore: Send + Sync {
  /// Register a deferred task tag. Returns `false` if it was already pending.
  fn register_sync_tag(&self, tag: &str) -> Result<bool>;

  /// Pending deferred task tags in registration order.
  fn sync_tags(&self) -> Result<Vec<String>>;

  fn remove_sync_tag(&self, tag: &str) -> Result<()>;

  /// Build tag of the worker currently controlling clients.
  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data served ahead of the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result for a synthesized or offline-page reply.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  /// Create a result for a request the worker does not manage.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache while a background refresh runs
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Nothing usable anywhere, reply synthesized
  Fallback,
  /// Not intercepted, sent straight to the network
  Passthrough,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Offline => "offline",
      CacheSource::Fallback => "fallback",
      CacheSource::Passthrough => "passthrough",
    };
    f.write_str(label)
  }
}
