//! JSON-lines page session.
//!
//! A page talks to the cache over a line protocol: every input line is one
//! [`PageMessage`], every output line is either a [`SessionEvent`] (tagged
//! `event`) or a controller [`Notification`] (tagged `type`).

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Arbiter, CacheSource, OfflineQuery};
use crate::connectivity::ConnectionStatus;
use crate::controller::{ControlMessage, LifecycleState, Notification, ResourceCacheController};
use crate::db::Database;
use crate::net::{Network, Request};
use crate::query::QueryOptions;

/// How often pending queries are polled and interval refetches checked.
const TICK_RATE: Duration = Duration::from_millis(250);

/// One input line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PageMessage {
  Control(ControlMessage),
  Fetch { fetch: FetchLine },
  Query { query: QueryLine },
  /// The page regained focus
  Focus { focus: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchLine {
  pub url: String,
  /// The page navigates to a document and renders the answer as HTML
  #[serde(default)]
  pub navigate: bool,
  #[serde(default)]
  pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryLine {
  pub namespace: String,
  pub key: String,
  /// JSON endpoint backing the item
  pub url: String,
  /// Attempt the network even while offline
  #[serde(default)]
  pub refresh: bool,
}

/// One output line answering a page message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
  Ready {
    version: String,
    state: LifecycleState,
  },
  Fetch {
    url: String,
    status: u16,
    cached_at: Option<chrono::DateTime<chrono::Utc>>,
    body: String,
  },
  FetchFailed {
    url: String,
    error: String,
  },
  Query {
    namespace: String,
    key: String,
    data: serde_json::Value,
    source: CacheSource,
    from_cache: bool,
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
    connection_status: ConnectionStatus,
  },
  QueryFailed {
    namespace: String,
    key: String,
    error: String,
  },
  Invalid {
    error: String,
  },
}

/// A page session over one controller and one arbiter.
pub struct Session<N: Network> {
  controller: ResourceCacheController<Database, N>,
  arbiter: Arbiter<Database>,
  query_options: QueryOptions,
  queries: HashMap<(String, String), OfflineQuery<serde_json::Value>>,
  out: mpsc::UnboundedSender<String>,
}

impl<N: Network> Session<N> {
  pub fn new(
    controller: ResourceCacheController<Database, N>,
    arbiter: Arbiter<Database>,
    query_options: QueryOptions,
    out: mpsc::UnboundedSender<String>,
  ) -> Self {
    Self {
      controller,
      arbiter,
      query_options,
      queries: HashMap::new(),
      out,
    }
  }

  /// Serve the page until its input closes.
  pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<()> {
    let mut lines = input.lines();
    let mut notifications = self.controller.subscribe();
    let mut ticker = tokio::time::interval(TICK_RATE);

    self.emit(&SessionEvent::Ready {
      version: self.controller.settings().partitions.version().to_string(),
      state: self.controller.state(),
    });

    loop {
      tokio::select! {
        line = lines.next_line() => {
          match line.map_err(|e| eyre!("Failed to read page input: {}", e))? {
            Some(line) => self.handle_line(&line),
            None => break,
          }
        }
        notification = notifications.recv() => match notification {
          Ok(notification) => self.forward(&notification),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "page fell behind on notifications");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
        _ = ticker.tick() => self.tick(),
      }
    }

    info!("page input closed, ending session");
    Ok(())
  }

  pub fn handle_line(&mut self, line: &str) {
    let line = line.trim();
    if line.is_empty() {
      return;
    }

    match serde_json::from_str::<PageMessage>(line) {
      Ok(PageMessage::Control(message)) => {
        self.controller.post_message(message);
      }
      Ok(PageMessage::Fetch { fetch }) => self.fetch(fetch),
      Ok(PageMessage::Query { query }) => self.query(query),
      Ok(PageMessage::Focus { focus }) => {
        if focus {
          for query in self.queries.values_mut() {
            query.on_focus();
          }
        }
      }
      Err(e) => {
        warn!(error = %e, "unrecognized page message");
        self.emit(&SessionEvent::Invalid {
          error: e.to_string(),
        });
      }
    }
  }

  /// Route a page request through the controller; the answer is emitted when it settles.
  fn fetch(&self, line: FetchLine) {
    let origin = self.controller.settings().classifier.origin();
    let mut request = match Request::get_relative(origin, &line.url) {
      Ok(request) => request,
      Err(e) => {
        self.emit(&SessionEvent::FetchFailed {
          url: line.url,
          error: e.to_string(),
        });
        return;
      }
    };
    if line.navigate {
      request = request.accept_html();
    }
    if line.force {
      request = request.force_refresh();
    }

    let controller = self.controller.clone();
    let out = self.out.clone();
    tokio::spawn(async move {
      let event = match controller.handle_fetch(request).await {
        Ok(response) => SessionEvent::Fetch {
          url: line.url,
          status: response.status,
          cached_at: response.cached_at(),
          body: response.text(),
        },
        Err(e) => SessionEvent::FetchFailed {
          url: line.url,
          error: e.to_string(),
        },
      };
      send(&out, &event);
    });
  }

  /// Start (or restart) the arbiter-backed query for `(namespace, key)`.
  fn query(&mut self, line: QueryLine) {
    let id = (line.namespace.clone(), line.key.clone());
    let query = match self.queries.entry(id) {
      std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
      std::collections::hash_map::Entry::Vacant(entry) => {
        let fetch_fn = json_fetcher(self.controller.clone(), line.url.clone());
        entry.insert(OfflineQuery::new(
          self.arbiter.clone(),
          line.namespace,
          line.key,
          self.query_options.clone(),
          fetch_fn,
        ))
      }
    };

    if line.refresh {
      query.refresh_data();
    } else {
      query.fetch();
    }
  }

  /// Poll queries and drive interval refetches.
  fn tick(&mut self) {
    let mut settled = Vec::new();
    for ((namespace, key), query) in self.queries.iter_mut() {
      query.tick();
      if query.poll() {
        if let Some(event) = query_event(namespace, key, query) {
          settled.push(event);
        }
      }
    }
    for event in &settled {
      self.emit(event);
    }
  }

  fn forward(&self, notification: &Notification) {
    match serde_json::to_string(notification) {
      Ok(line) => {
        let _ = self.out.send(line);
      }
      Err(e) => warn!(error = %e, "failed to serialize notification"),
    }
  }

  fn emit(&self, event: &SessionEvent) {
    send(&self.out, event);
  }
}

fn send(out: &mpsc::UnboundedSender<String>, event: &SessionEvent) {
  match serde_json::to_string(event) {
    Ok(line) => {
      // Ignore send errors - the writer is gone once stdout closes
      let _ = out.send(line);
    }
    Err(e) => warn!(error = %e, "failed to serialize session event"),
  }
}

fn query_event(
  namespace: &str,
  key: &str,
  query: &OfflineQuery<serde_json::Value>,
) -> Option<SessionEvent> {
  if let Some(error) = query.error() {
    return Some(SessionEvent::QueryFailed {
      namespace: namespace.to_string(),
      key: key.to_string(),
      error: error.to_string(),
    });
  }

  let result = query.result()?;
  Some(SessionEvent::Query {
    namespace: namespace.to_string(),
    key: key.to_string(),
    data: result.data.clone(),
    source: result.source,
    from_cache: query.is_from_cache(),
    last_updated: query.last_updated(),
    connection_status: query.connection_status(),
  })
}

type JsonFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>;

/// Fetch function of a query: GET `url` through the controller and decode the JSON body.
///
/// The arbiter only calls this when it wants the network, so the request is
/// forced past stale-while-revalidate. A copy the controller answers from one
/// of its partitions is not network data and counts as a failed fetch, which
/// leaves the arbiter to report its own cached item.
fn json_fetcher<N: Network>(
  controller: ResourceCacheController<Database, N>,
  url: String,
) -> impl Fn() -> JsonFuture + Send + Sync + 'static {
  move || -> JsonFuture {
    let controller = controller.clone();
    let url = url.clone();
    Box::pin(async move {
      let origin: &Url = controller.settings().classifier.origin();
      let request = Request::get_relative(origin, &url)
        .map_err(|e| e.to_string())?
        .force_refresh();
      let response = controller
        .handle_fetch(request)
        .await
        .map_err(|e| e.to_string())?;
      if let Some(cached_at) = response.cached_at() {
        debug!(%url, %cached_at, "network unavailable, controller answered from its cache");
        return Err(format!(
          "{} unreachable, only a copy cached at {} was available",
          url, cached_at
        ));
      }
      if !response.is_ok() {
        return Err(format!("{} answered status {}", url, response.status));
      }
      debug!(%url, bytes = response.body.len(), "query data fetched");
      serde_json::from_slice::<serde_json::Value>(&response.body)
        .map_err(|e| format!("invalid JSON from {}: {}", url, e))
    })
  }
}
