//! Client cache/network arbiter.
//!
//! This module wraps arbitrary data fetches with a namespaced item cache:
//! - Offline with a cached item: serve it without touching the network
//! - Online: fetch and backfill the cache, falling back to the cached item on failure
//! - Offline (or failed) with nothing cached: a typed `OfflineNoCache` error
//! - Exposes `from cache` / `last updated` signals for the UI via [`OfflineQuery`]

mod layer;
mod offline_query;
mod storage;
mod traits;

pub use layer::Arbiter;
pub use offline_query::OfflineQuery;
pub use storage::ItemStorage;
pub use traits::CacheSource;
