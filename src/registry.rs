//! Thing registry
//!
//! Local store of thing records keyed by id, the per-thing access frequency
//! log, and the type aggregation index recording which descendant directories
//! hold at least one record of a given type.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

use crate::model::ThingRecord;
use crate::types::{DirectoryError, Result};

/// Thing records, frequency log, and type aggregation index for one node
pub struct Registry {
    things: DashMap<String, ThingRecord>,
    /// thing_id -> user_id -> chronological access timestamps
    frequency: DashMap<String, HashMap<String, Vec<DateTime<Utc>>>>,
    /// thing_type -> directory names known to hold that type (duplicate-free)
    type_index: DashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            things: DashMap::new(),
            frequency: DashMap::new(),
            type_index: DashMap::new(),
        }
    }

    /// Insert a record, rejecting duplicate thing ids. Also initializes the
    /// record's frequency log entry.
    pub fn insert(&self, record: ThingRecord) -> Result<()> {
        if self.things.contains_key(&record.thing_id) {
            return Err(DirectoryError::BadRequest(format!(
                "thing '{}' already registered",
                record.thing_id
            )));
        }
        self.frequency
            .entry(record.thing_id.clone())
            .or_default();
        debug!(thing_id = %record.thing_id, thing_type = %record.thing_type, "thing stored");
        self.things.insert(record.thing_id.clone(), record);
        Ok(())
    }

    /// Remove a record, returning it if present. The frequency log entry is
    /// dropped with it.
    pub fn remove(&self, thing_id: &str) -> Option<ThingRecord> {
        self.frequency.remove(thing_id);
        self.things.remove(thing_id).map(|(_, record)| record)
    }

    pub fn get(&self, thing_id: &str) -> Option<ThingRecord> {
        self.things.get(thing_id).map(|r| r.value().clone())
    }

    /// Local records matching the optional type and id filters
    pub fn find(&self, thing_type: Option<&str>, thing_id: Option<&str>) -> Vec<ThingRecord> {
        self.things
            .iter()
            .filter(|entry| thing_type.is_none_or(|t| entry.thing_type == t))
            .filter(|entry| thing_id.is_none_or(|id| entry.thing_id == id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of local records of a type
    pub fn count_of_type(&self, thing_type: &str) -> usize {
        self.things
            .iter()
            .filter(|entry| entry.thing_type == thing_type)
            .count()
    }

    // ------------------------------------------------------------------
    // Frequency log
    // ------------------------------------------------------------------

    /// Append an access timestamp for a user on a thing
    pub fn record_access(&self, thing_id: &str, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        self.frequency
            .entry(thing_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default()
            .push(Utc::now());
    }

    /// Count this user's accesses to a thing at or after `since`.
    /// Timestamps are chronological, so scan from the tail.
    pub fn accesses_since(&self, thing_id: &str, user_id: &str, since: DateTime<Utc>) -> usize {
        let Some(log) = self.frequency.get(thing_id) else {
            return 0;
        };
        let Some(stamps) = log.get(user_id) else {
            return 0;
        };
        stamps.iter().rev().take_while(|t| **t >= since).count()
    }

    // ------------------------------------------------------------------
    // Type aggregation index
    // ------------------------------------------------------------------

    /// Record that `location` holds things of `thing_type`.
    /// Returns true when the entry is new (and should propagate upward).
    pub fn index_add(&self, thing_type: &str, location: &str) -> bool {
        let mut names = self.type_index.entry(thing_type.to_string()).or_default();
        if names.iter().any(|n| n == location) {
            return false;
        }
        names.push(location.to_string());
        true
    }

    /// Remove `location` from a type's entry. Returns true when it was present.
    pub fn index_remove(&self, thing_type: &str, location: &str) -> bool {
        let Some(mut names) = self.type_index.get_mut(thing_type) else {
            return false;
        };
        let before = names.len();
        names.retain(|n| n != location);
        before != names.len()
    }

    /// Directory names known to hold things of `thing_type`
    pub fn locations_for(&self, thing_type: &str) -> Vec<String> {
        self.type_index
            .get(thing_type)
            .map(|names| names.clone())
            .unwrap_or_default()
    }

    /// All indexed directory names, for queries with no type constraint
    pub fn all_indexed_locations(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for entry in self.type_index.iter() {
            for name in entry.value() {
                if !seen.contains(name) {
                    seen.push(name.clone());
                }
            }
        }
        seen
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str, ty: &str) -> ThingRecord {
        ThingRecord::from_description(json!({"thing_id": id, "thing_type": ty}), 0).unwrap()
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let registry = Registry::new();
        registry.insert(record("t1", "sensor")).unwrap();
        assert!(registry.insert(record("t1", "actuator")).is_err());
        assert_eq!(registry.count_of_type("sensor"), 1);
    }

    #[test]
    fn test_find_filters_by_type_and_id() {
        let registry = Registry::new();
        registry.insert(record("t1", "sensor")).unwrap();
        registry.insert(record("t2", "sensor")).unwrap();
        registry.insert(record("t3", "actuator")).unwrap();

        assert_eq!(registry.find(Some("sensor"), None).len(), 2);
        assert_eq!(registry.find(None, Some("t3")).len(), 1);
        assert_eq!(registry.find(Some("sensor"), Some("t3")).len(), 0);
        assert_eq!(registry.find(None, None).len(), 3);
    }

    #[test]
    fn test_accesses_since_counts_recent_only() {
        let registry = Registry::new();
        registry.insert(record("t1", "sensor")).unwrap();

        // plant two old timestamps and two fresh ones
        let old = Utc::now() - Duration::seconds(3600);
        registry
            .frequency
            .entry("t1".to_string())
            .or_default()
            .entry("alice".to_string())
            .or_default()
            .extend([old, old + Duration::seconds(1)]);
        registry.record_access("t1", "alice");
        registry.record_access("t1", "alice");

        let since = Utc::now() - Duration::seconds(60);
        assert_eq!(registry.accesses_since("t1", "alice", since), 2);
        assert_eq!(registry.accesses_since("t1", "bob", since), 0);
        assert_eq!(registry.accesses_since("t9", "alice", since), 0);
    }

    #[test]
    fn test_index_add_is_duplicate_free() {
        let registry = Registry::new();
        assert!(registry.index_add("sensor", "level2"));
        assert!(!registry.index_add("sensor", "level2"));
        assert!(registry.index_add("sensor", "level3"));
        assert_eq!(registry.locations_for("sensor"), vec!["level2", "level3"]);
    }

    #[test]
    fn test_index_remove() {
        let registry = Registry::new();
        registry.index_add("sensor", "level2");
        assert!(registry.index_remove("sensor", "level2"));
        assert!(!registry.index_remove("sensor", "level2"));
        assert!(registry.locations_for("sensor").is_empty());
    }

    #[test]
    fn test_all_indexed_locations_dedups_across_types() {
        let registry = Registry::new();
        registry.index_add("sensor", "level2");
        registry.index_add("actuator", "level2");
        registry.index_add("actuator", "level3");
        let mut all = registry.all_indexed_locations();
        all.sort();
        assert_eq!(all, vec!["level2", "level3"]);
    }
}
