//! Async query abstraction for data fetching with scheduling policies.
//!
//! Inspired by TanStack Query, this module provides a `Query<T, E>` type that
//! encapsulates async data fetching, loading states, error handling, and the
//! retry / refetch-on-focus / refetch-on-interval policies configured through
//! [`QueryOptions`].
//!
//! # Example
//!
//! ```ignore
//! let mut query = Query::new(move || async move { load_menu().await })
//!     .with_options(QueryOptions { retry: 2, ..Default::default() });
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() || query.tick() {
//!     // State changed or a refetch started, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T, E = String> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(E),
}

impl<T, E> QueryState<T, E> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&E> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Scheduling policies of a query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  /// Disabled queries never start fetching on their own
  pub enabled: bool,
  /// Extra attempts after a failed fetch
  pub retry: u32,
  /// Pause between attempts
  pub retry_delay: Duration,
  /// Refetch stale data when the consumer regains focus
  pub refetch_on_focus: bool,
  /// Refetch periodically, measured from the last settled fetch
  pub refetch_interval: Option<Duration>,
  /// How long successful data stays fresh
  pub stale_time: Duration,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      retry: 3,
      retry_delay: Duration::from_secs(1),
      refetch_on_focus: true,
      refetch_interval: None,
      stale_time: Duration::from_secs(60),
    }
  }
}

/// A boxed future that returns a Result<T, E>
type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T, E> = Arc<dyn Fn() -> BoxFuture<T, E> + Send + Sync>;

/// Async query for data fetching with state management.
///
/// Query<T, E> encapsulates:
/// - The fetching logic (via a closure)
/// - Loading/success/error states
/// - Async result handling via channels
/// - Retry and refetch scheduling
pub struct Query<T, E = String> {
  state: QueryState<T, E>,
  fetcher: FetcherFn<T, E>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, E>>>,
  fetched_at: Option<Instant>,
  settled_at: Option<Instant>,
  options: QueryOptions,
}

impl<T: Send + 'static, E: Send + 'static> Query<T, E> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It will be called
  /// each time `fetch()` or `refetch()` is invoked, and again for each retry.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Arc::new(move || Box::pin(fetcher())),
      receiver: None,
      fetched_at: None,
      settled_at: None,
      options: QueryOptions::default(),
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  /// Set the stale time for this query.
  ///
  /// After this duration, the data is considered stale and `is_stale()` returns true.
  pub fn set_stale_time(&mut self, duration: Duration) {
    self.options.stale_time = duration;
  }

  pub fn set_retry(&mut self, retry: u32) {
    self.options.retry = retry;
  }

  /// Get the current state of the query.
  #[allow(dead_code)]
  pub fn state(&self) -> &QueryState<T, E> {
    &self.state
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Check if the query is currently loading.
  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// Check if the query failed.
  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// Get the error if the query failed.
  pub fn error(&self) -> Option<&E> {
    self.state.error()
  }

  /// Check if the data is stale (at least stale_time old).
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() >= self.options.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching data if not already loading.
  ///
  /// This is a no-op if the query is already loading or disabled.
  pub fn fetch(&mut self) {
    if self.state.is_loading() || !self.options.enabled {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    // Cancel any pending fetch by dropping the receiver
    self.receiver = None;
    self.start_fetch();
  }

  /// The consumer regained focus: refetch stale data if the policy allows.
  ///
  /// Returns `true` if a refetch was started.
  pub fn on_focus(&mut self) -> bool {
    if !self.options.enabled || !self.options.refetch_on_focus || self.is_loading() {
      return false;
    }
    if self.is_stale() || self.is_error() {
      self.start_fetch();
      return true;
    }
    false
  }

  /// Drive interval refetching. Call this in your event loop tick handler.
  ///
  /// Returns `true` if a refetch was started.
  pub fn tick(&mut self) -> bool {
    let Some(interval) = self.options.refetch_interval else {
      return false;
    };
    if !self.options.enabled || self.is_loading() {
      return false;
    }
    if self.settled_at.is_some_and(|t| t.elapsed() >= interval) {
      self.start_fetch();
      return true;
    }
    false
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    // Try to receive without blocking
    match receiver.try_recv() {
      Ok(result) => self.settle(Some(result)),
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => self.settle(None),
    }
  }

  /// Wait for the pending fetch, if any, to finish.
  ///
  /// Returns `true` if the state changed.
  #[allow(dead_code)]
  pub async fn wait(&mut self) -> bool {
    let result = match &mut self.receiver {
      Some(rx) => rx.recv().await,
      None => return false,
    };
    self.settle(result)
  }

  fn settle(&mut self, result: Option<Result<T, E>>) -> bool {
    self.receiver = None;
    self.settled_at = Some(Instant::now());
    match result {
      Some(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
      }
      Some(Err(error)) => {
        self.state = QueryState::Error(error);
      }
      None => {
        // Sender dropped without sending
        warn!("query task ended without a result");
        self.state = QueryState::Idle;
      }
    }
    true
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let fetcher = Arc::clone(&self.fetcher);
    let retry = self.options.retry;
    let retry_delay = self.options.retry_delay;

    tokio::spawn(async move {
      let mut attempt = 0;
      let result = loop {
        match fetcher().await {
          Ok(data) => break Ok(data),
          Err(_) if attempt < retry => {
            attempt += 1;
            debug!(attempt, retry, "query failed, retrying");
            tokio::time::sleep(retry_delay).await;
          }
          Err(e) => break Err(e),
        }
      };
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

// Query is not Clone because the fetcher is shared and receiver is owned.
// If you need to share a query, wrap it in Arc<Mutex<Query<T, E>>>.

impl<T: std::fmt::Debug, E: std::fmt::Debug> std::fmt::Debug for Query<T, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn no_retry() -> QueryOptions {
    QueryOptions {
      retry: 0,
      ..Default::default()
    }
  }

  fn counting(counter: Arc<AtomicU32>) -> impl Fn() -> BoxFuture<u32, String> + Send + Sync {
    move || {
      let counter = counter.clone();
      Box::pin(async move { Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst)) })
    }
  }

  #[tokio::test]
  async fn test_query_success() {
    let mut query = Query::new(|| async { Ok::<_, String>(vec![1, 2, 3]) });

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(matches!(query.state(), QueryState::Success(_)));
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_query_error() {
    let mut query: Query<i32> =
      Query::new(|| async { Err("Something went wrong".to_string()) }).with_options(no_retry());

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_error());
    assert_eq!(query.error().map(String::as_str), Some("Something went wrong"));
  }

  #[tokio::test]
  async fn test_query_stale() {
    let mut query = Query::new(|| async { Ok::<_, String>(42) }).with_options(QueryOptions {
      stale_time: Duration::ZERO,
      ..Default::default()
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    // With zero stale time, should immediately be stale
    assert!(query.is_stale());
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let mut query = Query::new(|| async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok::<_, String>(42)
    });

    query.fetch();
    assert!(query.is_loading());

    // Second fetch should be no-op
    query.fetch();
    assert!(query.is_loading());
  }

  #[tokio::test]
  async fn test_refetch_cancels_pending() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut query = Query::new(move || {
      let counter = counter_clone.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst))
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Refetch should cancel the first and start a new one
    query.refetch();
    tokio::time::sleep(Duration::from_millis(100)).await;

    query.poll();
    // Only the second fetch should have completed and been received
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn test_disabled_query_does_not_fetch() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = Query::new(counting(counter.clone())).with_options(QueryOptions {
      enabled: false,
      ..Default::default()
    });

    query.fetch();
    assert!(!query.is_loading());
    assert!(!query.on_focus());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    let mut query = Query::new(move || {
      let attempts = attempts_clone.clone();
      async move {
        match attempts.fetch_add(1, Ordering::SeqCst) {
          0 | 1 => Err("flaky".to_string()),
          n => Ok(n),
        }
      }
    })
    .with_options(QueryOptions {
      retry: 3,
      retry_delay: Duration::from_secs(1),
      ..Default::default()
    });

    query.fetch();
    assert!(query.wait().await);
    assert_eq!(query.data(), Some(&2));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_exhausted() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    let mut query: Query<u32> = Query::new(move || {
      attempts_clone.fetch_add(1, Ordering::SeqCst);
      async { Err("down".to_string()) }
    })
    .with_options(QueryOptions {
      retry: 2,
      ..Default::default()
    });

    query.fetch();
    query.wait().await;
    assert!(query.is_error());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_on_focus_refetches_only_stale_data() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = Query::new(counting(counter.clone())).with_options(QueryOptions {
      stale_time: Duration::from_secs(60),
      ..no_retry()
    });

    query.fetch();
    query.wait().await;
    assert!(!query.on_focus());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(query.on_focus());
    query.wait().await;
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_tick_refetches_on_interval() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = Query::new(counting(counter.clone())).with_options(QueryOptions {
      refetch_interval: Some(Duration::from_secs(30)),
      ..no_retry()
    });

    assert!(!query.tick());
    query.fetch();
    query.wait().await;
    assert!(!query.tick());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(query.tick());
    query.wait().await;
    assert_eq!(query.data(), Some(&1));
  }
}
