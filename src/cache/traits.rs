//! Core types for the arbiter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::connectivity::ConnectionStatus;

/// Result from an arbiter fetch, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (network) or written (cache)
  pub last_updated: DateTime<Utc>,
  /// Connectivity at the time the result was produced
  pub connection_status: ConnectionStatus,
  #[serde(skip)]
  fresh_for: Duration,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(
    data: T,
    fetched_at: DateTime<Utc>,
    connection_status: ConnectionStatus,
    fresh_for: Duration,
  ) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      last_updated: fetched_at,
      connection_status,
      fresh_for,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(
    data: T,
    cached_at: DateTime<Utc>,
    source: CacheSource,
    connection_status: ConnectionStatus,
  ) -> Self {
    Self {
      data,
      source,
      last_updated: cached_at,
      connection_status,
      fresh_for: Duration::ZERO,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }

  /// How long the consuming query may treat this data as fresh.
  ///
  /// Cached data is stale immediately so refetch policies are free to retry.
  pub fn stale_time(&self) -> Duration {
    self.fresh_for
  }
}

/// Indicates where the data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Offline mode - network not attempted, serving cached data
  Offline,
  /// Network attempted and failed, serving cached data
  Fallback,
}
