//! Operation audit log
//!
//! Append-only record of coarse operations (deploys, undeploys,
//! provider connects) with a filterable, paged query. Persistence is
//! behind [`AuditStore`]; the node runs the sled realisation, tests
//! run the in-memory one.

mod sled_store;

pub use sled_store::SledAuditStore;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// One audited operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    /// Record identity
    pub id: String,
    /// Acting principal
    pub user: String,
    /// Operation name, e.g. `deploy_component`
    pub operation: String,
    /// Affected resource
    pub resource_id: String,
    /// Kind of the affected resource
    pub resource_type: String,
    /// What happened to it
    pub action: String,
    /// State before, when captured
    pub before: Option<String>,
    /// State after, when captured
    pub after: Option<String>,
    /// Record time; filled at append when absent
    pub timestamp: Option<DateTime<Utc>>,
    /// Origin address of the request
    pub ip: String,
}

impl OperationLog {
    /// Convenience constructor for fabric-internal operations.
    pub fn fabric(operation: &str, resource_type: &str, resource_id: &str, action: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: "fabric".to_string(),
            operation: operation.to_string(),
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            action: action.to_string(),
            before: None,
            after: None,
            timestamp: None,
            ip: "local".to_string(),
        }
    }
}

/// Query filters; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Inclusive lower time bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper time bound
    pub end: Option<DateTime<Utc>>,
    /// Exact user match
    pub user: Option<String>,
    /// Exact operation match
    pub operation: Option<String>,
    /// Exact resource match
    pub resource_id: Option<String>,
    /// Page size
    pub limit: usize,
    /// Records to skip before the page
    pub offset: usize,
}

/// One query result page
#[derive(Debug, Clone)]
pub struct OperationPage {
    /// Matching records, newest first
    pub operations: Vec<OperationLog>,
    /// Whether more records follow this page
    pub has_more: bool,
}

/// Persistence seam of the audit log
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record
    async fn append(&self, log: OperationLog) -> Result<()>;

    /// Matching records newest-first, starting at `offset`, at most
    /// `limit` entries
    async fn query(&self, options: &QueryOptions, limit: usize) -> Result<Vec<OperationLog>>;
}

fn matches(log: &OperationLog, options: &QueryOptions) -> bool {
    if let (Some(ts), Some(start)) = (log.timestamp, options.start) {
        if ts < start {
            return false;
        }
    }
    if let (Some(ts), Some(end)) = (log.timestamp, options.end) {
        if ts > end {
            return false;
        }
    }
    if let Some(user) = &options.user {
        if &log.user != user {
            return false;
        }
    }
    if let Some(operation) = &options.operation {
        if &log.operation != operation {
            return false;
        }
    }
    if let Some(resource) = &options.resource_id {
        if &log.resource_id != resource {
            return false;
        }
    }
    true
}

/// The audit service over a store
pub struct AuditLog {
    store: Box<dyn AuditStore>,
}

impl AuditLog {
    /// Wrap a store
    pub fn new(store: Box<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append a record, stamping the time when the caller left it
    /// unset.
    pub async fn record_operation(&self, mut log: OperationLog) -> Result<()> {
        if log.timestamp.is_none() {
            log.timestamp = Some(Utc::now());
        }
        self.store.append(log).await
    }

    /// Query one page. Fetches `limit + 1` records to infer
    /// `has_more`, then truncates.
    pub async fn get_operations(&self, options: &QueryOptions) -> Result<OperationPage> {
        let limit = if options.limit == 0 { 50 } else { options.limit };
        let mut operations = self.store.query(options, limit + 1).await?;
        let has_more = operations.len() > limit;
        operations.truncate(limit);
        Ok(OperationPage { operations, has_more })
    }
}

/// In-memory store, newest records at the front
#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<VecDeque<OperationLog>>,
}

impl MemoryAuditStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, log: OperationLog) -> Result<()> {
        self.records.write().push_front(log);
        Ok(())
    }

    async fn query(&self, options: &QueryOptions, limit: usize) -> Result<Vec<OperationLog>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|log| matches(log, options))
            .skip(options.offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(operation: &str, user: &str) -> OperationLog {
        OperationLog {
            user: user.to_string(),
            ..OperationLog::fabric(operation, "component", "c1", "create")
        }
    }

    #[tokio::test]
    async fn unset_timestamps_are_filled_at_append() {
        let audit = AuditLog::new(Box::new(MemoryAuditStore::new()));
        audit.record_operation(log("deploy_component", "fabric")).await.unwrap();
        let page = audit.get_operations(&QueryOptions::default()).await.unwrap();
        assert!(page.operations[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn filters_match_within_one_page() {
        let audit = AuditLog::new(Box::new(MemoryAuditStore::new()));
        audit.record_operation(log("deploy_component", "alice")).await.unwrap();
        audit.record_operation(log("undeploy_component", "bob")).await.unwrap();
        audit.record_operation(log("deploy_component", "bob")).await.unwrap();

        let page = audit
            .get_operations(&QueryOptions {
                operation: Some("deploy_component".to_string()),
                user: Some("bob".to_string()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.operations.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn has_more_reflects_the_next_page() {
        let audit = AuditLog::new(Box::new(MemoryAuditStore::new()));
        for i in 0..5 {
            audit.record_operation(log("deploy_component", &format!("u{i}"))).await.unwrap();
        }

        let page = audit
            .get_operations(&QueryOptions { limit: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.operations.len(), 3);
        assert!(page.has_more);

        let rest = audit
            .get_operations(&QueryOptions { limit: 3, offset: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rest.operations.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn newest_records_come_first() {
        let audit = AuditLog::new(Box::new(MemoryAuditStore::new()));
        audit.record_operation(log("first", "u")).await.unwrap();
        audit.record_operation(log("second", "u")).await.unwrap();
        let page = audit.get_operations(&QueryOptions::default()).await.unwrap();
        assert_eq!(page.operations[0].operation, "second");
        assert_eq!(page.operations[1].operation, "first");
    }
}
