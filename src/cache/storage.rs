//! Namespaced item storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::Database;

/// A single cached item.
#[derive(Debug, Clone)]
pub struct CachedItem<T> {
  /// The cached value
  pub value: T,
  /// When the value was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for namespaced key-value storage backends.
///
/// A `(namespace, key)` pair maps to at most one value.
pub trait ItemStorage: Send + Sync + 'static {
  /// Get the item stored under `(namespace, key)`.
  fn get_item<T: DeserializeOwned>(&self, namespace: &str, key: &str)
    -> Result<Option<CachedItem<T>>>;

  /// Store an item, replacing any previous value.
  fn set_item<T: Serialize>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    cached_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Remove every item of a namespace. Returns how many were removed.
  fn clear_namespace(&self, namespace: &str) -> Result<usize>;

  /// Remove every item. Returns how many were removed.
  fn clear_all(&self) -> Result<usize>;
}

impl ItemStorage for Database {
  fn get_item<T: DeserializeOwned>(
    &self,
    namespace: &str,
    key: &str,
  ) -> Result<Option<CachedItem<T>>> {
    let conn = self.conn()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM app_cache WHERE namespace = ? AND cache_key = ?",
        params![namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}/{}: {}", namespace, key, e))?;

    match row {
      Some((data, cached_at)) => {
        let value =
          serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize item: {}", e))?;
        Ok(Some(CachedItem {
          value,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn set_item<T: Serialize>(
    &self,
    namespace: &str,
    key: &str,
    value: &T,
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize item: {}", e))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO app_cache (namespace, cache_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![namespace, key, data, cached_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store {}/{}: {}", namespace, key, e))?;

    Ok(())
  }

  fn clear_namespace(&self, namespace: &str) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM app_cache WHERE namespace = ?", params![namespace])
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", namespace, e))
  }

  fn clear_all(&self) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM app_cache", [])
      .map_err(|e| eyre!("Failed to clear item cache: {}", e))
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_items_are_scoped_by_namespace() {
    let db = Database::open_in_memory().unwrap();
    let at = Utc::now();
    db.set_item("restaurant-42", "menu", &vec!["soup"], at).unwrap();
    db.set_item("restaurant-7", "menu", &vec!["salad"], at).unwrap();

    let item: CachedItem<Vec<String>> = db.get_item("restaurant-42", "menu").unwrap().unwrap();
    assert_eq!(item.value, vec!["soup"]);
    assert_eq!(item.cached_at.timestamp(), at.timestamp());
    assert!(db
      .get_item::<Vec<String>>("restaurant-42", "orders")
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_set_replaces_previous_value() {
    let db = Database::open_in_memory().unwrap();
    let earlier = Utc::now() - Duration::minutes(10);
    db.set_item("ns", "k", &1, earlier).unwrap();
    db.set_item("ns", "k", &2, Utc::now()).unwrap();

    let item: CachedItem<i32> = db.get_item("ns", "k").unwrap().unwrap();
    assert_eq!(item.value, 2);
    assert!(item.cached_at > earlier);
  }

  #[test]
  fn test_clear() {
    let db = Database::open_in_memory().unwrap();
    let at = Utc::now();
    db.set_item("a", "1", &1, at).unwrap();
    db.set_item("a", "2", &2, at).unwrap();
    db.set_item("b", "1", &3, at).unwrap();

    assert_eq!(db.clear_namespace("a").unwrap(), 2);
    assert_eq!(db.clear_namespace("a").unwrap(), 0);
    assert_eq!(db.clear_all().unwrap(), 1);
    assert!(db.get_item::<i32>("b", "1").unwrap().is_none());
  }

  #[test]
  fn test_undecodable_item_is_an_error() {
    let db = Database::open_in_memory().unwrap();
    db.set_item("ns", "k", &"text", Utc::now()).unwrap();
    assert!(db.get_item::<u64>("ns", "k").is_err());
  }
}
