//! Page <-> controller messages.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PartitionStorage, ResourceCacheController};
use crate::net::{Network, Request};

/// Commands a page can post to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlMessage {
  /// Activate immediately, bypassing the staged rollover
  SkipWaiting,
  /// Delete every partition
  ClearCache,
  /// Re-fetch and re-cache each URL
  ForceRefresh { urls: Vec<String> },
}

/// Broadcast from the controller to every open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
  /// Background revalidation wrote a fresher entry for this URL
  CacheUpdated { url: String },
  /// All partitions were purged
  CacheCleared,
  /// Forced refresh completed for these URLs
  CacheRefreshed { urls: Vec<String> },
  OnlineStatusChange { online: bool },
}

impl<S: PartitionStorage, N: Network> ResourceCacheController<S, N> {
  /// Fire-and-forget delivery; completion is observable only through notifications.
  pub fn post_message(&self, message: ControlMessage) -> JoinHandle<()> {
    let controller = self.clone();
    tokio::spawn(async move { controller.handle_message(message).await })
  }

  pub async fn handle_message(&self, message: ControlMessage) {
    debug!(?message, "control message");
    match message {
      ControlMessage::SkipWaiting => {
        match self.skip_waiting() {
          Ok(Some(report)) => info!(purged = report.purged.len(), "activated on skipWaiting"),
          Ok(None) => debug!("skipWaiting while already active"),
          Err(e) => warn!(error = %e, "skipWaiting ignored"),
        }
      }
      ControlMessage::ClearCache => {
        let cleared = self.clear_partitions();
        info!(cleared, "all partitions cleared");
        self.notify(Notification::CacheCleared);
      }
      ControlMessage::ForceRefresh { urls } => {
        let refreshed = self.force_refresh(&urls).await;
        info!(requested = urls.len(), refreshed = refreshed.len(), "forced refresh done");
        self.notify(Notification::CacheRefreshed { urls: refreshed });
      }
    }
  }

  /// Delete every stored partition, current or not. Returns how many were removed.
  pub fn clear_partitions(&self) -> usize {
    let names = match self.inner.storage.partition_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "failed to enumerate partitions");
        return 0;
      }
    };

    names
      .iter()
      .filter(|name| match self.inner.storage.delete_partition(name) {
        Ok(removed) => removed,
        Err(e) => {
          warn!(partition = %name, error = %e, "failed to delete partition");
          false
        }
      })
      .count()
  }

  /// Fetch each URL from the network and store it in the partition its class
  /// maps to. Returns the URLs whose fresh copy was stored.
  async fn force_refresh(&self, urls: &[String]) -> Vec<String> {
    let origin = self.inner.settings.classifier.origin();
    let refreshes = urls.iter().map(|url| async move {
      let request = match Request::get_relative(origin, url) {
        Ok(request) => request,
        Err(e) => {
          warn!(%url, error = %e, "skipping refresh");
          return None;
        }
      };

      let route = self.inner.settings.classifier.classify(&request);
      let Some(kind) = route.partition() else {
        debug!(%url, "not cacheable, skipping refresh");
        return None;
      };
      let partition = self.inner.settings.partitions.name(kind);

      match self.inner.network.fetch(&request).await {
        Ok(response) if response.is_ok() => self
          .store(&partition, &request, &response)
          .then(|| url.clone()),
        Ok(response) => {
          debug!(%url, status = response.status, "refresh returned non-cacheable status");
          None
        }
        Err(e) => {
          debug!(%url, error = %e, "refresh failed");
          None
        }
      }
    });

    join_all(refreshes).await.into_iter().flatten().collect()
  }
}
