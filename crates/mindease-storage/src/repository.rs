//! Repository implementations for SQLite-backed persistence.
//!
//! `OfflineQueueRepository` keeps unsent messages in insertion order and
//! `KvRepository` stores small JSON documents such as voice settings.

use std::sync::Arc;

use rusqlite::OptionalExtension;

use mindease_core::error::MindeaseError;
use mindease_core::types::{OfflineQueueItem, Timestamp};

use crate::db::Database;

/// Repository for the persisted offline send queue.
#[derive(Debug, Clone)]
pub struct OfflineQueueRepository {
    db: Arc<Database>,
}

impl OfflineQueueRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an item to the end of the queue.
    pub fn insert(&self, item: &OfflineQueueItem) -> Result<(), MindeaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO offline_queue (id, message, enqueued_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![item.id, item.message, item.enqueued_at.0, item.retry_count],
            )
            .map_err(|e| MindeaseError::Storage(format!("Failed to enqueue message: {}", e)))?;
            Ok(())
        })
    }

    /// Remove an item. Returns whether a row was deleted.
    pub fn delete(&self, id: &str) -> Result<bool, MindeaseError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM offline_queue WHERE id = ?1", [id])
                .map_err(|e| MindeaseError::Storage(format!("Failed to dequeue message: {}", e)))?;
            Ok(changed > 0)
        })
    }

    /// All items in insertion order.
    pub fn list(&self) -> Result<Vec<OfflineQueueItem>, MindeaseError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, message, enqueued_at, retry_count
                     FROM offline_queue ORDER BY seq ASC",
                )
                .map_err(|e| MindeaseError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(OfflineQueueItem {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        enqueued_at: Timestamp(row.get(2)?),
                        retry_count: row.get(3)?,
                    })
                })
                .map_err(|e| MindeaseError::Storage(e.to_string()))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| MindeaseError::Storage(e.to_string()))
        })
    }

    /// Fetch a single item by id.
    pub fn find(&self, id: &str) -> Result<Option<OfflineQueueItem>, MindeaseError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, message, enqueued_at, retry_count FROM offline_queue WHERE id = ?1",
                [id],
                |row| {
                    Ok(OfflineQueueItem {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        enqueued_at: Timestamp(row.get(2)?),
                        retry_count: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| MindeaseError::Storage(e.to_string()))
        })
    }

    /// Increment the retry counter and return the new value.
    pub fn increment_retry(&self, id: &str) -> Result<Option<u32>, MindeaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE offline_queue SET retry_count = retry_count + 1 WHERE id = ?1",
                [id],
            )
            .map_err(|e| MindeaseError::Storage(format!("Failed to bump retry count: {}", e)))?;

            conn.query_row(
                "SELECT retry_count FROM offline_queue WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| MindeaseError::Storage(e.to_string()))
        })
    }

    pub fn count(&self) -> Result<usize, MindeaseError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
                .map_err(|e| MindeaseError::Storage(e.to_string()))?;
            Ok(count as usize)
        })
    }

    pub fn clear(&self) -> Result<usize, MindeaseError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM offline_queue", [])
                .map_err(|e| MindeaseError::Storage(format!("Failed to clear queue: {}", e)))
        })
    }
}

/// Repository for small string values keyed by name.
#[derive(Debug, Clone)]
pub struct KvRepository {
    db: Arc<Database>,
}

impl KvRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, MindeaseError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| MindeaseError::Storage(e.to_string()))
        })
    }

    /// Insert or replace a value.
    pub fn set(&self, key: &str, value: &str) -> Result<(), MindeaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                [key, value],
            )
            .map_err(|e| MindeaseError::Storage(format!("Failed to store {}: {}", key, e)))?;
            Ok(())
        })
    }

    pub fn delete(&self, key: &str) -> Result<(), MindeaseError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])
                .map_err(|e| MindeaseError::Storage(e.to_string()))?;
            Ok(())
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_repo() -> OfflineQueueRepository {
        OfflineQueueRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn item(id: &str, message: &str, enqueued_at: i64) -> OfflineQueueItem {
        OfflineQueueItem {
            id: id.to_string(),
            message: message.to_string(),
            enqueued_at: Timestamp(enqueued_at),
            retry_count: 0,
        }
    }

    #[test]
    fn test_insert_and_list_preserves_insertion_order() {
        let repo = queue_repo();
        // Later enqueue time inserted first: order follows insertion, not clock.
        repo.insert(&item("b", "second", 200)).unwrap();
        repo.insert(&item("a", "first", 100)).unwrap();

        let items = repo.list().unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_delete() {
        let repo = queue_repo();
        repo.insert(&item("a", "hi", 1)).unwrap();
        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn test_find() {
        let repo = queue_repo();
        repo.insert(&item("a", "hi", 1)).unwrap();
        assert_eq!(repo.find("a").unwrap().unwrap().message, "hi");
        assert!(repo.find("missing").unwrap().is_none());
    }

    #[test]
    fn test_increment_retry() {
        let repo = queue_repo();
        repo.insert(&item("a", "hi", 1)).unwrap();
        assert_eq!(repo.increment_retry("a").unwrap(), Some(1));
        assert_eq!(repo.increment_retry("a").unwrap(), Some(2));
        assert_eq!(repo.increment_retry("missing").unwrap(), None);
        assert_eq!(repo.list().unwrap()[0].retry_count, 2);
    }

    #[test]
    fn test_clear() {
        let repo = queue_repo();
        repo.insert(&item("a", "1", 1)).unwrap();
        repo.insert(&item("b", "2", 2)).unwrap();
        assert_eq!(repo.clear().unwrap(), 2);
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let repo = OfflineQueueRepository::new(Arc::new(Database::new(&path).unwrap()));
            repo.insert(&item("a", "persist me", 1)).unwrap();
        }
        let repo = OfflineQueueRepository::new(Arc::new(Database::new(&path).unwrap()));
        assert_eq!(repo.list().unwrap()[0].message, "persist me");
    }

    #[test]
    fn test_kv_set_get_overwrite_delete() {
        let repo = KvRepository::new(Arc::new(Database::in_memory().unwrap()));
        assert!(repo.get("voice").unwrap().is_none());
        repo.set("voice", "{\"version\":1}").unwrap();
        repo.set("voice", "{\"version\":2}").unwrap();
        assert_eq!(repo.get("voice").unwrap().unwrap(), "{\"version\":2}");
        repo.delete("voice").unwrap();
        assert!(repo.get("voice").unwrap().is_none());
    }
}
