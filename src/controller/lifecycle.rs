//! Install/activate lifecycle.
//!
//! Install populates the new version's shell partition without touching any
//! other partition, so a still-running previous version keeps working.
//! Activation purges partitions of other versions and claims all pages.

use futures::future::join_all;
use serde::Serialize;
use std::sync::PoisonError;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::partition::PartitionKind;
use super::{PartitionStorage, ResourceCacheController};
use crate::net::{Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("cannot {action} while {state:?}")]
  InvalidTransition {
    action: &'static str,
    state: LifecycleState,
  },
}

/// Outcome of pre-caching the shell manifest.
#[derive(Debug, Default)]
pub struct InstallReport {
  pub cached: Vec<Url>,
  pub failed: Vec<(Url, String)>,
}

impl InstallReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

#[derive(Debug, Default)]
pub struct ActivationReport {
  /// Stored partitions deleted because they belong to another version
  pub purged: Vec<String>,
}

impl<S: PartitionStorage, N: Network> ResourceCacheController<S, N> {
  /// Pre-cache the shell manifest into this version's shell partition.
  ///
  /// Individual failures are logged and reported; a partial shell is tolerated.
  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    self.expect_state("install", LifecycleState::Installing)?;

    let shell = self.inner.settings.partitions.name(PartitionKind::AppShell);
    if let Err(e) = self.inner.storage.open_partition(&shell) {
      warn!(partition = %shell, error = %e, "failed to open shell partition");
    }

    let fetches = self.inner.settings.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let result = self.inner.network.fetch(&request).await;
      (request, result)
    });

    let mut report = InstallReport::default();
    for (request, result) in join_all(fetches).await {
      let reason = match result {
        Ok(response) if response.is_ok() => {
          if self.store(&shell, &request, &response) {
            report.cached.push(request.url);
            continue;
          }
          "failed to store".to_string()
        }
        Ok(response) => format!("status {}", response.status),
        Err(e) => e.to_string(),
      };
      report.failed.push((request.url, reason));
    }

    if report.is_complete() {
      info!(partition = %shell, resources = report.cached.len(), "shell pre-cached");
    } else {
      for (url, reason) in &report.failed {
        warn!(%url, %reason, "failed to pre-cache shell resource");
      }
      warn!(
        partition = %shell,
        cached = report.cached.len(),
        failed = report.failed.len(),
        "shell pre-cache incomplete"
      );
    }

    self.set_state(LifecycleState::Installed);
    Ok(report)
  }

  /// Purge partitions of other versions and take control of all pages.
  pub fn activate(&self) -> Result<ActivationReport, LifecycleError> {
    self.transition("activate", LifecycleState::Installed, LifecycleState::Activating)?;

    let partitions = &self.inner.settings.partitions;
    let stored = self.inner.storage.partition_names().unwrap_or_else(|e| {
      warn!(error = %e, "failed to enumerate partitions");
      Vec::new()
    });

    let mut report = ActivationReport::default();
    for name in stored.into_iter().filter(|n| !partitions.is_current(n)) {
      match self.inner.storage.delete_partition(&name) {
        Ok(_) => {
          info!(partition = %name, "purged stale partition");
          report.purged.push(name);
        }
        Err(e) => warn!(partition = %name, error = %e, "failed to purge partition"),
      }
    }

    // Claim: from here on every intercepted request is served by this version.
    self.set_state(LifecycleState::Active);
    info!(version = partitions.version(), "controller active, clients claimed");
    Ok(report)
  }

  /// Activate immediately after install, skipping the staged rollover.
  ///
  /// Returns `None` if another activation already claimed the pages.
  pub fn skip_waiting(&self) -> Result<Option<ActivationReport>, LifecycleError> {
    match self.activate() {
      Ok(report) => Ok(Some(report)),
      Err(LifecycleError::InvalidTransition {
        state: LifecycleState::Activating | LifecycleState::Active,
        ..
      }) => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn expect_state(
    &self,
    action: &'static str,
    expected: LifecycleState,
  ) -> Result<(), LifecycleError> {
    let state = self.state();
    if state == expected {
      Ok(())
    } else {
      Err(LifecycleError::InvalidTransition { action, state })
    }
  }

  /// Check the state and switch it under one write guard, so two callers
  /// can never both leave `expected`.
  fn transition(
    &self,
    action: &'static str,
    expected: LifecycleState,
    next: LifecycleState,
  ) -> Result<(), LifecycleError> {
    let mut state = self
      .inner
      .state
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    if *state != expected {
      return Err(LifecycleError::InvalidTransition {
        action,
        state: *state,
      });
    }
    *state = next;
    Ok(())
  }
}
