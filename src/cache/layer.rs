//! Arbiter that decides between cached items and the network.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::storage::{CachedItem, ItemStorage};
use super::traits::{CacheResult, CacheSource};
use crate::connectivity::Connectivity;

/// How long network data stays fresh by default.
pub const DEFAULT_FRESH_TIME: Duration = Duration::from_secs(5 * 60);

/// Whether a fetch may be answered from the cache without trying the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  /// Offline with a cached item: answer from the cache
  #[default]
  Auto,
  /// Always attempt the network, even while offline
  ForceNetwork,
}

/// The only failure an arbiter fetch surfaces.
#[derive(Debug, Clone, Error)]
pub enum ArbiterError {
  #[error(
    "offline and no cached data available for {namespace}/{key}{}",
    cause.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default()
  )]
  OfflineNoCache {
    namespace: String,
    key: String,
    /// The fetch failure, if the network was attempted
    cause: Option<String>,
  },
}

/// Arbiter that wraps data fetches with a namespaced item cache.
///
/// Cloning is cheap; clones share storage and the connectivity flag.
pub struct Arbiter<S: ItemStorage> {
  storage: Arc<S>,
  connectivity: Connectivity,
  /// How long network data is considered fresh
  fresh_time: Duration,
}

impl<S: ItemStorage> Arbiter<S> {
  pub fn new(storage: Arc<S>, connectivity: Connectivity) -> Self {
    Self {
      storage,
      connectivity,
      fresh_time: DEFAULT_FRESH_TIME,
    }
  }

  /// Set the fresh window reported for network data.
  pub fn with_fresh_time(mut self, fresh_time: Duration) -> Self {
    self.fresh_time = fresh_time;
    self
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  #[cfg(test)]
  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Fetch with offline fallback.
  ///
  /// 1. Offline with a cached item - return it, no network
  /// 2. Online (or forced) - run the fetcher and backfill the cache
  /// 3. Fetcher failed - return the cached item if there is one
  /// 4. Nothing usable - `OfflineNoCache`
  pub async fn fetch<T, E, F, Fut>(
    &self,
    namespace: &str,
    key: &str,
    mode: FetchMode,
    fetcher: F,
  ) -> Result<CacheResult<T>, ArbiterError>
  where
    T: Serialize + DeserializeOwned,
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let cached = self.read(namespace, key);
    let status = self.connectivity.status();

    if !status.is_online() && mode == FetchMode::Auto {
      return match cached {
        Some(item) => {
          debug!(namespace, key, "offline, serving cached item");
          Ok(CacheResult::from_cache(
            item.value,
            item.cached_at,
            CacheSource::Offline,
            status,
          ))
        }
        None => Err(ArbiterError::OfflineNoCache {
          namespace: namespace.to_string(),
          key: key.to_string(),
          cause: None,
        }),
      };
    }

    match fetcher().await {
      Ok(data) => {
        let now = Utc::now();
        if let Err(e) = self.storage.set_item(namespace, key, &data, now) {
          warn!(namespace, key, error = %e, "failed to write cached item");
        }
        Ok(CacheResult::from_network(
          data,
          now,
          self.connectivity.status(),
          self.fresh_time,
        ))
      }
      Err(e) => match cached {
        Some(item) => {
          debug!(namespace, key, error = %e, "fetch failed, serving cached item");
          Ok(CacheResult::from_cache(
            item.value,
            item.cached_at,
            CacheSource::Fallback,
            self.connectivity.status(),
          ))
        }
        None => Err(ArbiterError::OfflineNoCache {
          namespace: namespace.to_string(),
          key: key.to_string(),
          cause: Some(e.to_string()),
        }),
      },
    }
  }

  /// Read an item; storage failures count as a miss.
  fn read<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<CachedItem<T>> {
    match self.storage.get_item(namespace, key) {
      Ok(item) => item,
      Err(e) => {
        warn!(namespace, key, error = %e, "cache read failed");
        None
      }
    }
  }
}

impl<S: ItemStorage> Clone for Arbiter<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      connectivity: self.connectivity.clone(),
      fresh_time: self.fresh_time,
    }
  }
}
