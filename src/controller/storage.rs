//! Partition storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::partition::PartitionName;
use crate::db::Database;
use crate::net::{Request, Response};

/// Storage for named partitions of request -> response snapshots.
pub trait PartitionStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, partition: &PartitionName) -> Result<()>;

  /// Names of every stored partition, current or not.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Delete a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up the snapshot stored for the exact request.
  fn match_request(&self, partition: &PartitionName, request: &Request)
    -> Result<Option<Response>>;

  /// Store a snapshot, replacing any previous entry for the same request.
  fn put(&self, partition: &PartitionName, request: &Request, response: &Response) -> Result<()>;

  /// Number of entries in a stored partition.
  fn entry_count(&self, name: &str) -> Result<usize>;
}

impl PartitionStorage for Database {
  fn open_partition(&self, partition: &PartitionName) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition.to_string()],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM partition_entries WHERE partition = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(
    &self,
    partition: &PartitionName,
    request: &Request,
  ) -> Result<Option<Response>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM partition_entries
         WHERE partition = ? AND request_key = ?",
        params![partition.to_string(), request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", request.url, partition, e))?;

    match row {
      Some((status, headers, body)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &PartitionName, request: &Request, response: &Response) -> Result<()> {
    let name = partition.to_string();
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;
    tx.execute(
      "INSERT OR REPLACE INTO partition_entries
         (partition, request_key, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        name,
        request.cache_key(),
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM partition_entries WHERE partition = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(usize::try_from(count).unwrap_or_default())
  }
}
