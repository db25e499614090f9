//! Cache store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::{RequestDescriptor, ResponseSnapshot};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response snapshot
  pub response: ResponseSnapshot,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for persistent cache-store backends.
///
/// The store is keyed by (generation label, request descriptor). Operations
/// are atomic per key; `add_all` is atomic per call so a failed install can
/// never leave a partial generation behind.
pub trait CacheStore: Send + Sync + 'static {
  /// Store a batch of precache entries under a generation, all or nothing.
  fn add_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, ResponseSnapshot)],
  ) -> Result<()>;

  /// Store a single response, overwriting any prior entry for the descriptor.
  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &ResponseSnapshot,
  ) -> Result<()>;

  /// Look up a response by descriptor within a generation.
  fn lookup(&self, generation: &str, request: &RequestDescriptor)
    -> Result<Option<CachedResponse>>;

  /// List all generation labels present in the store.
  fn list_generations(&self) -> Result<Vec<String>>;

  /// Delete a whole generation. Returns whether anything was deleted.
  fn delete_generation(&self, generation: &str) -> Result<bool>;
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::from_connection(conn)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("liftlog").join("cache.db"))
  }

  /// Run database migrations for the cache table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
-- Response cache, one row per (generation, request) pair
CREATE TABLE IF NOT EXISTS response_cache (
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_generation
    ON response_cache(generation);
"#;

impl CacheStore for SqliteStore {
  fn add_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, ResponseSnapshot)],
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Transaction rolls back on drop if any insert fails
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      let headers = serde_json::to_vec(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO response_cache
           (generation, request_hash, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          request.cache_hash(),
          request.method.as_str(),
          request.url.as_str(),
          response.status,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store precache entry {}: {}", request.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit precache: {}", e))?;

    Ok(())
  }

  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_vec(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache
           (generation, request_hash, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          request.cache_hash(),
          request.method.as_str(),
          request.url.as_str(),
          response.status,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store response for {}: {}", request.url, e))?;

    Ok(())
  }

  fn lookup(
    &self,
    generation: &str,
    request: &RequestDescriptor,
  ) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM response_cache
         WHERE generation = ? AND request_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String)> = stmt
      .query_row(params![generation, request.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;

        Ok(Some(CachedResponse {
          response: ResponseSnapshot {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT generation FROM response_cache ORDER BY generation")
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let generations: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(generations)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute(
        "DELETE FROM response_cache WHERE generation = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    Ok(deleted > 0)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// HashMap-backed store for tests.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<(String, String), CachedResponse>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn add_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, ResponseSnapshot)],
  ) -> Result<()> {
    let mut map = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    for (request, response) in entries {
      map.insert(
        (generation.to_string(), request.cache_hash()),
        CachedResponse {
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    }

    Ok(())
  }

  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    self.add_all(generation, &[(request.clone(), response.clone())])
  }

  fn lookup(
    &self,
    generation: &str,
    request: &RequestDescriptor,
  ) -> Result<Option<CachedResponse>> {
    let map = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      map
        .get(&(generation.to_string(), request.cache_hash()))
        .cloned(),
    )
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let map = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut generations: Vec<String> = map.keys().map(|(g, _)| g.clone()).collect();
    generations.sort();
    generations.dedup();

    Ok(generations)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut map = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let before = map.len();
    map.retain(|(g, _), _| g != generation);

    Ok(map.len() < before)
  }
}
