//! Sled-backed audit store
//!
//! Records are keyed by timestamp nanoseconds plus an in-process
//! sequence counter, so a reverse key scan yields newest-first order
//! without a secondary index.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{FabricError, Result};

use super::{matches, AuditStore, OperationLog, QueryOptions};

/// Durable audit store
pub struct SledAuditStore {
    tree: sled::Tree,
    sequence: AtomicU64,
}

impl SledAuditStore {
    /// Open (or create) the audit tree inside `db`.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db
            .open_tree("operation_log")
            .map_err(|e| FabricError::internal(format!("open audit tree: {e}")))?;
        Ok(Self { tree, sequence: AtomicU64::new(0) })
    }

    fn key(&self, log: &OperationLog) -> [u8; 16] {
        let nanos = log
            .timestamp
            .unwrap_or_else(Utc::now)
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX) as u64;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&nanos.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        key
    }
}

#[async_trait]
impl AuditStore for SledAuditStore {
    async fn append(&self, log: OperationLog) -> Result<()> {
        let key = self.key(&log);
        let value =
            bincode::serialize(&log).map_err(|e| FabricError::internal(format!("encode audit: {e}")))?;
        self.tree
            .insert(key, value)
            .map_err(|e| FabricError::internal(format!("append audit: {e}")))?;
        Ok(())
    }

    async fn query(&self, options: &QueryOptions, limit: usize) -> Result<Vec<OperationLog>> {
        let mut operations = Vec::with_capacity(limit.min(256));
        let mut skipped = 0;
        for entry in self.tree.iter().rev() {
            let (_, value) =
                entry.map_err(|e| FabricError::internal(format!("scan audit: {e}")))?;
            let log: OperationLog = bincode::deserialize(&value)
                .map_err(|e| FabricError::internal(format!("decode audit: {e}")))?;
            if !matches(&log, options) {
                continue;
            }
            if skipped < options.offset {
                skipped += 1;
                continue;
            }
            operations.push(log);
            if operations.len() >= limit {
                break;
            }
        }
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;

    fn open_store() -> (tempfile::TempDir, SledAuditStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("audit")).unwrap();
        let store = SledAuditStore::open(&db).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn records_survive_in_newest_first_order() {
        let (_dir, store) = open_store();
        let audit = AuditLog::new(Box::new(store));

        for name in ["one", "two", "three"] {
            audit
                .record_operation(OperationLog::fabric(name, "component", "c1", "create"))
                .await
                .unwrap();
        }

        let page = audit.get_operations(&QueryOptions { limit: 2, ..Default::default() }).await.unwrap();
        assert_eq!(page.operations.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.operations[0].operation, "three");
    }

    #[tokio::test]
    async fn filtered_query_hits_the_recorded_entry() {
        let (_dir, store) = open_store();
        let audit = AuditLog::new(Box::new(store));
        audit
            .record_operation(OperationLog::fabric("deploy_component", "component", "c9", "create"))
            .await
            .unwrap();

        let page = audit
            .get_operations(&QueryOptions {
                resource_id: Some("c9".to_string()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.operations.len(), 1);
        assert_eq!(page.operations[0].resource_id, "c9");
    }
}
