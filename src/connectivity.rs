//! Process-wide online/offline signal.
//!
//! There is exactly one writer, the [`ConnectivityMonitor`], fed by whatever
//! observes the platform's network state (see [`spawn_probe`]). Every cache
//! component holds a cloned [`Connectivity`] reader, so all of them agree on the
//! current status at any instant.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  Online,
  Offline,
}

impl ConnectionStatus {
  pub fn from_online(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }

  pub fn is_online(self) -> bool {
    self == Self::Online
  }
}

/// The single writer of the connectivity flag.
#[derive(Debug)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<ConnectionStatus>,
}

impl ConnectivityMonitor {
  pub fn new(initial: ConnectionStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  /// A read-only handle observing this monitor.
  pub fn handle(&self) -> Connectivity {
    Connectivity {
      rx: self.tx.subscribe(),
    }
  }

  /// Record a platform transition. Returns `true` if the status actually changed.
  pub fn set(&self, status: ConnectionStatus) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });

    if changed {
      info!(?status, "connectivity changed");
    }
    changed
  }

  pub fn set_online(&self, online: bool) -> bool {
    self.set(ConnectionStatus::from_online(online))
  }
}

/// Shared read-only view of the connectivity flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
  rx: watch::Receiver<ConnectionStatus>,
}

impl Connectivity {
  pub fn status(&self) -> ConnectionStatus {
    *self.rx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status().is_online()
  }

  /// Wait for the next transition. Returns `None` once the monitor is gone.
  pub async fn changed(&mut self) -> Option<ConnectionStatus> {
    self.rx.changed().await.ok()?;
    let status = *self.rx.borrow_and_update();
    Some(status)
  }
}

/// Poll `url` with HEAD requests and feed the result into `monitor`.
///
/// Any HTTP answer counts as online; only transport failures count as offline.
pub fn spawn_probe(
  monitor: ConnectivityMonitor,
  client: reqwest::Client,
  url: Url,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let online = match client.head(url.clone()).send().await {
        Ok(_) => true,
        Err(e) => {
          debug!(error = %e, "connectivity probe failed");
          false
        }
      };
      monitor.set_online(online);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_readers_share_one_flag() {
    let monitor = ConnectivityMonitor::new(ConnectionStatus::Online);
    let a = monitor.handle();
    let b = a.clone();

    assert!(a.is_online() && b.is_online());
    monitor.set_online(false);
    assert_eq!(a.status(), ConnectionStatus::Offline);
    assert_eq!(b.status(), ConnectionStatus::Offline);
  }

  #[test]
  fn test_set_reports_only_transitions() {
    let monitor = ConnectivityMonitor::new(ConnectionStatus::Online);
    assert!(!monitor.set(ConnectionStatus::Online));
    assert!(monitor.set(ConnectionStatus::Offline));
    assert!(!monitor.set(ConnectionStatus::Offline));
  }

  #[tokio::test]
  async fn test_changed_yields_transitions() {
    let monitor = ConnectivityMonitor::new(ConnectionStatus::Online);
    let mut handle = monitor.handle();

    monitor.set_online(false);
    assert_eq!(handle.changed().await, Some(ConnectionStatus::Offline));

    monitor.set_online(true);
    assert_eq!(handle.changed().await, Some(ConnectionStatus::Online));

    drop(monitor);
    assert_eq!(handle.changed().await, None);
  }

  async fn probe_until_changed(initial: ConnectionStatus, url: Url) -> Option<ConnectionStatus> {
    let monitor = ConnectivityMonitor::new(initial);
    let mut handle = monitor.handle();
    let probe = spawn_probe(
      monitor,
      reqwest::Client::new(),
      url,
      Duration::from_millis(20),
    );

    let status = tokio::time::timeout(Duration::from_secs(5), handle.changed())
      .await
      .unwrap();
    probe.abort();
    status
  }

  #[tokio::test]
  async fn test_probe_transport_failure_goes_offline() {
    // Bind then drop to get a local port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("http://{}/health", addr)).unwrap();
    assert_eq!(
      probe_until_changed(ConnectionStatus::Online, url).await,
      Some(ConnectionStatus::Offline)
    );
  }

  #[tokio::test]
  async fn test_probe_any_http_answer_goes_online() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      loop {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        let _ = socket
          .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
          .await;
      }
    });

    let url = Url::parse(&format!("http://{}/health", addr)).unwrap();
    assert_eq!(
      probe_until_changed(ConnectionStatus::Offline, url).await,
      Some(ConnectionStatus::Online)
    );
    server.abort();
  }
}
