//! Caching strategies.
//!
//! Every failure is caught here. The worst outcome of any intercepted request
//! is the offline page (HTML requests) or a propagated [`NetworkError`].

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::partition::{PartitionKind, PartitionName};
use super::{Notification, PartitionStorage, ResourceCacheController};
use crate::net::{Network, NetworkError, Request, Response};

/// Served when an HTML request fails and not even the offline page is cached.
const OFFLINE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>";

impl<S: PartitionStorage, N: Network> ResourceCacheController<S, N> {
  /// Shell resources: answer from the partition, fall back to the network.
  pub(super) async fn cache_first(&self, request: Request) -> Result<Response, NetworkError> {
    let shell = self.inner.settings.partitions.name(PartitionKind::AppShell);

    if let Some(cached) = self.lookup(&shell, &request) {
      debug!(url = %request.url, "shell hit");
      return Ok(cached);
    }

    match self.inner.network.fetch(&request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store(&shell, &request, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "shell miss and network failed");
        self.fallback_or(&request, e)
      }
    }
  }

  /// Images and remote data: answer from the partition immediately and
  /// revalidate in the background.
  pub(super) async fn stale_while_revalidate(
    &self,
    kind: PartitionKind,
    request: Request,
  ) -> Result<Response, NetworkError> {
    let partition = self.inner.settings.partitions.name(kind);
    let cached = self.lookup(&partition, &request);
    let forced = request.is_forced();

    // The network fetch is always issued, cached copy or not.
    let revalidation =
      self.spawn_revalidation(partition, request.clone(), cached.is_some() && !forced);

    match cached {
      Some(cached) if !forced => {
        debug!(url = %request.url, "serving cached copy, revalidating");
        Ok(cached)
      }
      Some(cached) => match settle(revalidation).await {
        Ok(response) => Ok(response),
        Err(e) => {
          debug!(url = %request.url, error = %e, "forced refresh failed, serving cached copy");
          Ok(cached)
        }
      },
      None => match settle(revalidation).await {
        Ok(response) => Ok(response),
        Err(e) => self.fallback_or(&request, e),
      },
    }
  }

  /// Detached fetch-then-store. `announce` broadcasts `CACHE_UPDATED` once the
  /// new entry is written, for pages that were handed the stale copy.
  fn spawn_revalidation(
    &self,
    partition: PartitionName,
    request: Request,
    announce: bool,
  ) -> JoinHandle<Result<Response, NetworkError>> {
    let controller = self.clone();
    tokio::spawn(async move {
      let response = controller.inner.network.fetch(&request).await.map_err(|e| {
        debug!(url = %request.url, error = %e, "revalidation failed");
        e
      })?;

      if response.is_ok() && controller.store(&partition, &request, &response) && announce {
        controller.notify(Notification::CacheUpdated {
          url: request.url.to_string(),
        });
      }
      Ok(response)
    })
  }

  /// Read a snapshot; storage failures count as a miss.
  pub(super) fn lookup(&self, partition: &PartitionName, request: &Request) -> Option<Response> {
    match self.inner.storage.match_request(partition, request) {
      Ok(found) => found,
      Err(e) => {
        warn!(%partition, url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Write a stamped copy of `response`. Returns whether the write landed.
  pub(super) fn store(
    &self,
    partition: &PartitionName,
    request: &Request,
    response: &Response,
  ) -> bool {
    match self
      .inner
      .storage
      .put(partition, request, &response.stamped(Utc::now()))
    {
      Ok(()) => true,
      Err(e) => {
        warn!(%partition, url = %request.url, error = %e, "cache write failed");
        false
      }
    }
  }

  fn fallback_or(&self, request: &Request, error: NetworkError) -> Result<Response, NetworkError> {
    if request.wants_html() {
      Ok(self.offline_page())
    } else {
      Err(error)
    }
  }

  /// The pre-cached offline page, or a built-in one if the shell lacks it.
  fn offline_page(&self) -> Response {
    let shell = self.inner.settings.partitions.name(PartitionKind::AppShell);
    let request = Request::get(self.inner.settings.offline_page.clone());
    self
      .lookup(&shell, &request)
      .unwrap_or_else(|| Response::html(503, OFFLINE_HTML))
  }
}

async fn settle(
  handle: JoinHandle<Result<Response, NetworkError>>,
) -> Result<Response, NetworkError> {
  handle
    .await
    .unwrap_or_else(|e| Err(NetworkError::Unreachable(format!("revalidation aborted: {}", e))))
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;
  use crate::net::mock::MockNetwork;
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::time::Instant;

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let harness = Harness::active();
    let target = url("/src/main.tsx");
    harness.network.respond(&target, Response::new(200, "v1"));

    let first = harness.controller.handle_fetch(request(&target)).await.unwrap();
    let second = harness.controller.handle_fetch(request(&target)).await.unwrap();

    assert_eq!(first.body, b"v1");
    assert_eq!(second.body, b"v1");
    assert!(second.cached_at().is_some());
    assert_eq!(harness.network.calls_for(&target), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let harness = Harness::active();
    let target = url("/missing.js");
    harness.network.respond(&target, Response::new(404, "nope"));

    let response = harness.controller.handle_fetch(request(&target)).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(harness.stored(PartitionKind::AppShell, &target).is_none());
  }

  #[tokio::test]
  async fn test_html_failure_serves_cached_offline_page() {
    let harness = Harness::active();
    harness.seed(PartitionKind::AppShell, &url("/offline.html"), "offline!");

    let response = harness
      .controller
      .handle_fetch(request(&url("/orders/17")).accept_html())
      .await
      .unwrap();

    assert_eq!(response.body, b"offline!");
  }

  #[tokio::test]
  async fn test_html_failure_without_offline_page_still_answers() {
    let harness = Harness::active();

    let response = harness
      .controller
      .handle_fetch(request(&url("/checkout")).accept_html())
      .await
      .unwrap();

    assert_eq!(response.status, 503);
    assert!(response.text().contains("offline"));
  }

  #[tokio::test]
  async fn test_non_html_failure_propagates() {
    let harness = Harness::active();
    harness.seed(PartitionKind::AppShell, &url("/offline.html"), "offline!");

    let shell = harness.controller.handle_fetch(request(&url("/app.js"))).await;
    let data = harness
      .controller
      .handle_fetch(request("https://abc.supabase.co/rest/v1/orders"))
      .await;

    assert!(matches!(shell, Err(NetworkError::Unreachable(_))));
    assert!(matches!(data, Err(NetworkError::Unreachable(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_image_served_before_revalidation() {
    let harness = Harness::active();
    let target = url("/menu-image.jpg");
    harness.seed(PartitionKind::ImageCache, &target, "old image");
    harness
      .network
      .respond_after(&target, Duration::from_secs(2), Response::new(200, "new image"));
    let mut notifications = harness.controller.subscribe();

    let started = Instant::now();
    let response = harness.controller.handle_fetch(request(&target)).await.unwrap();
    assert_eq!(response.body, b"old image");
    assert_eq!(started.elapsed(), Duration::ZERO);

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification, Notification::CacheUpdated { url: target.clone() });
    assert!(started.elapsed() >= Duration::from_secs(2));

    // Store happens before the notification.
    let stored = harness.stored(PartitionKind::ImageCache, &target).unwrap();
    assert_eq!(stored.body, b"new image");
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_copy_survives_failed_revalidation() {
    let harness = Harness::active();
    let target = "https://abc.supabase.co/rest/v1/menu_items";
    harness.seed(PartitionKind::AppData, target, "[1,2]");
    harness.network.fail_after(target, Duration::from_secs(1));
    let mut notifications = harness.controller.subscribe();

    let response = harness.controller.handle_fetch(request(target)).await.unwrap();
    assert_eq!(response.body, b"[1,2]");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.network.calls_for(target), 1);
    assert!(notifications.try_recv().is_err());
    assert_eq!(
      harness.stored(PartitionKind::AppData, target).unwrap().body,
      b"[1,2]"
    );
  }

  #[tokio::test]
  async fn test_swr_miss_awaits_and_stores() {
    let harness = Harness::active();
    let target = "https://abc.supabase.co/storage/v1/object/public/menu/42";
    harness.network.respond(target, Response::new(200, "jpeg"));
    let mut notifications = harness.controller.subscribe();

    let response = harness.controller.handle_fetch(request(target)).await.unwrap();

    assert_eq!(response.body, b"jpeg");
    assert!(harness.stored(PartitionKind::ImageCache, target).is_some());
    assert!(notifications.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_swr_miss_html_gets_offline_page() {
    let harness = Harness::active();
    harness.seed(PartitionKind::AppShell, &url("/offline.html"), "offline!");

    let response = harness
      .controller
      .handle_fetch(request("https://abc.supabase.co/rest/v1/menu").accept_html())
      .await
      .unwrap();

    assert_eq!(response.body, b"offline!");
  }

  #[tokio::test]
  async fn test_forced_refresh_waits_for_network() {
    let harness = Harness::active();
    let target = "https://abc.supabase.co/rest/v1/orders";
    harness.seed(PartitionKind::AppData, target, "stale");
    harness.network.respond(target, Response::new(200, "fresh"));

    let response = harness
      .controller
      .handle_fetch(request(target).force_refresh())
      .await
      .unwrap();

    assert_eq!(response.body, b"fresh");
    assert_eq!(
      harness.stored(PartitionKind::AppData, target).unwrap().body,
      b"fresh"
    );
  }

  #[tokio::test]
  async fn test_broken_storage_serves_from_network() {
    let network = Arc::new(MockNetwork::new());
    let controller = active_controller(BrokenPartitions::default(), Arc::clone(&network));
    let shell = url("/src/main.tsx");
    let data = "https://abc.supabase.co/rest/v1/menu_items";
    network
      .respond(&shell, Response::new(200, "console.log(1)"))
      .respond(data, Response::new(200, "[]"));

    for _ in 0..2 {
      let response = controller.handle_fetch(request(&shell)).await.unwrap();
      assert_eq!(response.body, b"console.log(1)");
      let response = controller.handle_fetch(request(data)).await.unwrap();
      assert_eq!(response.body, b"[]");
    }

    // Nothing was stored, so every request went to the network.
    assert_eq!(network.calls_for(&shell), 2);
    assert_eq!(network.calls_for(data), 2);
  }

  #[tokio::test]
  async fn test_broken_storage_html_failure_gets_builtin_offline_page() {
    let controller = active_controller(BrokenPartitions::default(), Arc::new(MockNetwork::new()));

    let response = controller
      .handle_fetch(request(&url("/orders")).accept_html())
      .await
      .unwrap();

    assert_eq!(response.status, 503);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_revalidation_write_is_not_announced() {
    let network = Arc::new(MockNetwork::new());
    let storage = BrokenPartitions {
      stale: Some(Response::new(200, "old image").stamped(Utc::now())),
    };
    let controller = active_controller(storage, Arc::clone(&network));
    let target = url("/menu-image.jpg");
    network.respond_after(&target, Duration::from_secs(1), Response::new(200, "new image"));
    let mut notifications = controller.subscribe();

    let response = controller.handle_fetch(request(&target)).await.unwrap();
    assert_eq!(response.body, b"old image");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(network.calls_for(&target), 1);
    assert!(notifications.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_forced_refresh_falls_back_to_stale() {
    let harness = Harness::active();
    let target = "https://abc.supabase.co/rest/v1/orders";
    harness.seed(PartitionKind::AppData, target, "stale");

    let response = harness
      .controller
      .handle_fetch(request(target).force_refresh())
      .await
      .unwrap();

    assert_eq!(response.body, b"stale");
  }
}
