//! Local component table
//!
//! One record per component this node committed or delegated, keyed by
//! component ID. Exactly one record exists per committed deployment;
//! the namespaced provider ID says where the component actually runs.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::types::ComponentRecord;

/// The node-local component registry
#[derive(Default)]
pub struct ComponentTable {
    records: RwLock<HashMap<String, ComponentRecord>>,
}

impl ComponentTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn register(&self, record: ComponentRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    /// Remove a record, returning it when present
    pub fn remove(&self, component_id: &str) -> Option<ComponentRecord> {
        self.records.write().remove(component_id)
    }

    /// Copy of one record
    pub fn get(&self, component_id: &str) -> Option<ComponentRecord> {
        self.records.read().get(component_id).cloned()
    }

    /// Copies of all records
    pub fn list(&self) -> Vec<ComponentRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no components are registered
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceInfo;
    use crate::scheduler::types::local_provider_id;
    use chrono::Utc;

    fn record(id: &str) -> ComponentRecord {
        ComponentRecord {
            id: id.to_string(),
            image: "demo:latest".to_string(),
            resource_usage: ResourceInfo::new(1000, 0, 0),
            provider_id: local_provider_id("p1"),
            deployed_at: Utc::now(),
        }
    }

    #[test]
    fn register_get_remove() {
        let table = ComponentTable::new();
        table.register(record("c1"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("c1").unwrap().provider_id, "local.p1");
        assert!(table.remove("c1").is_some());
        assert!(table.remove("c1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn re_registration_replaces() {
        let table = ComponentTable::new();
        table.register(record("c1"));
        let mut updated = record("c1");
        updated.provider_id = "p2@node.b".to_string();
        table.register(updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("c1").unwrap().provider_id, "p2@node.b");
    }
}
