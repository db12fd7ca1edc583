//! Query bound to an arbiter-backed cache item.
//!
//! `OfflineQuery` forwards its scheduling options to the underlying [`Query`]
//! unchanged, except while offline: then retries and refetch-on-focus are
//! suppressed because the fetch is known to be unreachable.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::layer::{Arbiter, ArbiterError, FetchMode};
use super::storage::ItemStorage;
use super::traits::CacheResult;
use crate::connectivity::{ConnectionStatus, Connectivity};
use crate::query::{Query, QueryOptions};

pub struct OfflineQuery<T> {
  query: Query<CacheResult<T>, ArbiterError>,
  connectivity: Connectivity,
  /// Options as given by the caller, before offline suppression
  options: QueryOptions,
  /// Set by `refresh_data`, consumed by the next fetch
  force: Arc<AtomicBool>,
}

impl<T> OfflineQuery<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Build a query whose every fetch goes through `arbiter` for `(namespace, key)`.
  pub fn new<S, F, Fut, E>(
    arbiter: Arbiter<S>,
    namespace: impl Into<String>,
    key: impl Into<String>,
    options: QueryOptions,
    fetch_fn: F,
  ) -> Self
  where
    S: ItemStorage,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display + Send + 'static,
  {
    let namespace = namespace.into();
    let key = key.into();
    let connectivity = arbiter.connectivity().clone();
    let force = Arc::new(AtomicBool::new(false));
    let fetch_fn = Arc::new(fetch_fn);

    let query = {
      let force = Arc::clone(&force);
      Query::new(move || {
        let arbiter = arbiter.clone();
        let namespace = namespace.clone();
        let key = key.clone();
        let fetch_fn = Arc::clone(&fetch_fn);
        let mode = if force.swap(false, Ordering::SeqCst) {
          FetchMode::ForceNetwork
        } else {
          FetchMode::Auto
        };
        async move { arbiter.fetch(&namespace, &key, mode, || fetch_fn()).await }
      })
      .with_options(options.clone())
    };

    Self {
      query,
      connectivity,
      options,
      force,
    }
  }

  /// The full result of the last successful fetch.
  pub fn result(&self) -> Option<&CacheResult<T>> {
    self.query.data()
  }

  #[allow(dead_code)]
  pub fn data(&self) -> Option<&T> {
    self.result().map(|r| &r.data)
  }

  pub fn error(&self) -> Option<&ArbiterError> {
    self.query.error()
  }

  pub fn is_from_cache(&self) -> bool {
    self.result().is_some_and(CacheResult::is_from_cache)
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.result().map(|r| r.last_updated)
  }

  /// Live connectivity, shared with every other query and the controller.
  pub fn connection_status(&self) -> ConnectionStatus {
    self.connectivity.status()
  }

  pub fn fetch(&mut self) {
    self.apply_connectivity();
    self.query.fetch();
  }

  /// Refetch now, attempting the network even while offline.
  pub fn refresh_data(&mut self) {
    self.apply_connectivity();
    self.force.store(true, Ordering::SeqCst);
    self.query.refetch();
  }

  /// Returns `true` if a refetch was started.
  pub fn on_focus(&mut self) -> bool {
    if !self.connectivity.is_online() {
      return false;
    }
    self.apply_connectivity();
    self.query.on_focus()
  }

  /// Returns `true` if a refetch was started.
  pub fn tick(&mut self) -> bool {
    self.apply_connectivity();
    self.query.tick()
  }

  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let changed = self.query.poll();
    self.apply_stale_time();
    changed
  }

  /// Wait for the pending fetch, if any. Returns `true` if the state changed.
  #[allow(dead_code)]
  pub async fn wait(&mut self) -> bool {
    let changed = self.query.wait().await;
    self.apply_stale_time();
    changed
  }

  fn apply_connectivity(&mut self) {
    let retry = if self.connectivity.is_online() {
      self.options.retry
    } else {
      0
    };
    self.query.set_retry(retry);
  }

  /// Cached data is stale at once; network data for the arbiter's fresh window.
  fn apply_stale_time(&mut self) {
    if let Some(stale_time) = self.query.data().map(CacheResult::stale_time) {
      self.query.set_stale_time(stale_time);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityMonitor;
  use crate::db::Database;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  struct Fixture {
    arbiter: Arbiter<Database>,
    monitor: ConnectivityMonitor,
    calls: Arc<AtomicU32>,
  }

  impl Fixture {
    fn new() -> Self {
      let monitor = ConnectivityMonitor::new(ConnectionStatus::Online);
      let storage = Arc::new(Database::open_in_memory().unwrap());
      Self {
        arbiter: Arbiter::new(storage, monitor.handle()),
        monitor,
        calls: Arc::new(AtomicU32::new(0)),
      }
    }

    /// A menu query whose fetch succeeds with a counter until `fail` is set.
    fn menu(&self, options: QueryOptions, fail: Arc<AtomicBool>) -> OfflineQuery<String> {
      let calls = Arc::clone(&self.calls);
      OfflineQuery::new(
        self.arbiter.clone(),
        "restaurant-42",
        "menu",
        options,
        move || {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          let fail = fail.load(Ordering::SeqCst);
          async move {
            if fail {
              Err("network down".to_string())
            } else {
              Ok(format!("menu v{}", n))
            }
          }
        },
      )
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  fn no_retry() -> QueryOptions {
    QueryOptions {
      retry: 0,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_connectivity_loss_mid_session_serves_cache() {
    let fixture = Fixture::new();
    let mut query = fixture.menu(no_retry(), Arc::default());

    query.fetch();
    query.wait().await;
    assert_eq!(query.data().map(String::as_str), Some("menu v0"));
    assert!(!query.is_from_cache());
    assert_eq!(query.connection_status(), ConnectionStatus::Online);

    fixture.monitor.set_online(false);
    assert_eq!(query.connection_status(), ConnectionStatus::Offline);

    query.refresh_data();
    query.wait().await;
    assert_eq!(fixture.calls(), 2);

    // A plain refetch while offline never reaches the network.
    let mut second = fixture.menu(no_retry(), Arc::default());
    second.fetch();
    second.wait().await;
    assert_eq!(second.data().map(String::as_str), Some("menu v1"));
    assert!(second.is_from_cache());
    assert_eq!(fixture.calls(), 2);
  }

  #[tokio::test]
  async fn test_failing_fetch_with_cache_resolves() {
    let fixture = Fixture::new();
    let ten_minutes_ago = Utc::now() - chrono::Duration::minutes(10);
    fixture
      .arbiter
      .storage()
      .set_item("restaurant-42", "menu", &"cached menu", ten_minutes_ago)
      .unwrap();
    let mut query = fixture.menu(no_retry(), Arc::new(AtomicBool::new(true)));

    query.fetch();
    query.wait().await;

    assert!(query.error().is_none());
    assert_eq!(query.data().map(String::as_str), Some("cached menu"));
    assert!(query.is_from_cache());
    assert_eq!(
      query.last_updated().map(|t| t.timestamp()),
      Some(ten_minutes_ago.timestamp())
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_suppresses_retry_and_focus() {
    let fixture = Fixture::new();
    fixture.monitor.set_online(false);
    let mut query = fixture.menu(
      QueryOptions {
        retry: 3,
        ..Default::default()
      },
      Arc::default(),
    );

    let started = tokio::time::Instant::now();
    query.fetch();
    query.wait().await;

    assert!(matches!(
      query.error(),
      Some(ArbiterError::OfflineNoCache { cause: None, .. })
    ));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(!query.on_focus());
    assert_eq!(fixture.calls(), 0);
  }

  #[tokio::test]
  async fn test_stale_time_follows_source() {
    let fixture = Fixture::new();
    let fail = Arc::new(AtomicBool::new(false));
    let mut query = fixture.menu(no_retry(), Arc::clone(&fail));

    query.fetch();
    query.wait().await;
    assert!(!query.is_from_cache());
    assert!(!query.on_focus());

    fail.store(true, Ordering::SeqCst);
    query.refresh_data();
    query.wait().await;
    assert!(query.is_from_cache());

    // Cached data is stale at once, so focus triggers a refetch.
    assert!(query.on_focus());
    query.wait().await;
    assert_eq!(fixture.calls(), 3);
  }
}
