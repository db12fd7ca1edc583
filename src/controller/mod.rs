//! Resource cache controller.
//!
//! Middleware every outbound request of the application is routed through.
//! Each request is classified ([`classify`]) and answered by the caching
//! strategy for its class ([`strategy`]) from one of three versioned
//! partitions ([`partition`]). Pages talk to the controller with
//! [`ControlMessage`]s and hear back through broadcast [`Notification`]s.

mod classify;
mod lifecycle;
mod message;
mod partition;
mod storage;
mod strategy;

pub use classify::{Classifier, Route};
pub use lifecycle::LifecycleState;
pub use message::{ControlMessage, Notification};
pub use partition::{PartitionKind, PartitionSet};
pub use storage::PartitionStorage;

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::net::{Network, NetworkError, Request, Response};

/// Notification backlog kept for slow pages before they start lagging.
const NOTIFICATION_CAPACITY: usize = 64;

/// Static settings of one controller version.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
  pub classifier: Classifier,
  pub partitions: PartitionSet,
  /// Absolute URLs pre-cached into the shell partition at install
  pub manifest: Vec<Url>,
  pub offline_page: Url,
}

impl ControllerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid resource path '{}': {}", path, e))
    };

    let manifest = config
      .shell_manifest
      .iter()
      .map(|path| resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = resolve(&config.offline_page)?;

    Ok(Self {
      classifier: Classifier::new(
        origin.clone(),
        config.remote_hosts.clone(),
        config.api_markers.clone(),
        config.storage_markers.clone(),
        config.image_extensions.clone(),
      ),
      partitions: PartitionSet::new(config.cache_version.clone()),
      manifest,
      offline_page,
    })
  }
}

struct Inner<S, N> {
  settings: ControllerSettings,
  storage: Arc<S>,
  network: Arc<N>,
  state: RwLock<LifecycleState>,
  notifier: broadcast::Sender<Notification>,
}

/// Intercepts requests and serves them from versioned cache partitions.
///
/// Cloning is cheap; clones share partitions, lifecycle state and the
/// notification channel.
pub struct ResourceCacheController<S: PartitionStorage, N: Network> {
  inner: Arc<Inner<S, N>>,
}

impl<S: PartitionStorage, N: Network> ResourceCacheController<S, N> {
  /// Create a controller in the `Installing` state.
  pub fn new(settings: ControllerSettings, storage: Arc<S>, network: Arc<N>) -> Self {
    let (notifier, _rx) = broadcast::channel(NOTIFICATION_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        settings,
        storage,
        network,
        state: RwLock::new(LifecycleState::Installing),
        notifier,
      }),
    }
  }

  pub fn settings(&self) -> &ControllerSettings {
    &self.inner.settings
  }

  pub fn state(&self) -> LifecycleState {
    *self
      .inner
      .state
      .read()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: LifecycleState) {
    *self
      .inner
      .state
      .write()
      .unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Listen for notifications. Only notifications sent after this call are received.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.inner.notifier.subscribe()
  }

  fn notify(&self, notification: Notification) {
    match self.inner.notifier.send(notification) {
      Ok(receivers) => debug!(receivers, "notification sent"),
      Err(broadcast::error::SendError(notification)) => {
        debug!(?notification, "no pages listening")
      }
    }
  }

  /// Serve one outbound request.
  ///
  /// Until the controller is active the previous version still governs pages,
  /// so requests go straight to the network.
  pub async fn handle_fetch(&self, request: Request) -> Result<Response, NetworkError> {
    if self.state() != LifecycleState::Active {
      return self.inner.network.fetch(&request).await;
    }

    let route = self.inner.settings.classifier.classify(&request);
    debug!(url = %request.url, ?route, "intercepted");

    match route {
      Route::Bypass => self.inner.network.fetch(&request).await,
      Route::Shell => self.cache_first(request).await,
      Route::Image => {
        self
          .stale_while_revalidate(PartitionKind::ImageCache, request)
          .await
      }
      Route::RemoteData => {
        self
          .stale_while_revalidate(PartitionKind::AppData, request)
          .await
      }
    }
  }

  /// Relay connectivity transitions to pages as `ONLINE_STATUS_CHANGE`.
  pub fn watch_connectivity(&self, mut connectivity: Connectivity) -> JoinHandle<()> {
    let controller = self.clone();
    tokio::spawn(async move {
      while let Some(status) = connectivity.changed().await {
        controller.notify(Notification::OnlineStatusChange {
          online: status.is_online(),
        });
      }
    })
  }
}

impl<S: PartitionStorage, N: Network> Clone for ResourceCacheController<S, N> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
