//! Directory topology store and location resolver
//!
//! Holds this node's adjacency (parent and direct children) plus descendant
//! aliases: names reachable through a child mapped to that child's direct
//! name. Resolution returns the next hop toward a target directory.

use dashmap::DashMap;
use tracing::debug;

use crate::config::Args;
use crate::model::{DirectoryLink, Relationship};
use crate::types::Result;

/// Adjacency and descendant-routing hints for one node
pub struct TopologyStore {
    /// This node's own directory name
    node_name: String,
    /// Adjacent links keyed by directory name
    links: DashMap<String, DirectoryLink>,
    /// Descendant aliases: target name -> direct child name
    aliases: DashMap<String, String>,
}

impl TopologyStore {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            links: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    /// Seed topology from startup configuration
    pub fn from_args(args: &Args) -> Result<Self> {
        let store = Self::new(&args.node_name);
        if let Some((name, url)) = args.parent_link()? {
            store.add_link(&name, &url, Relationship::Parent);
        }
        for (name, url) in args.child_links()? {
            store.add_link(&name, &url, Relationship::Child);
        }
        for (target, child) in args.alias_links()? {
            store.add_alias(&target, &child);
        }
        Ok(store)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn add_link(&self, directory_name: &str, url: &str, relationship: Relationship) {
        self.links.insert(
            directory_name.to_string(),
            DirectoryLink {
                directory_name: directory_name.to_string(),
                url: url.to_string(),
                relationship,
            },
        );
    }

    /// Register a descendant alias (append-only in normal operation;
    /// removal is an explicit admin action, see `remove_alias`)
    pub fn add_alias(&self, target_name: &str, child_name: &str) {
        self.aliases
            .insert(target_name.to_string(), child_name.to_string());
    }

    /// Explicitly prune a descendant alias. Returns whether it existed.
    pub fn remove_alias(&self, target_name: &str) -> bool {
        self.aliases.remove(target_name).is_some()
    }

    /// The parent link, if this node has one
    pub fn parent(&self) -> Option<DirectoryLink> {
        self.links
            .iter()
            .find(|entry| entry.relationship == Relationship::Parent)
            .map(|entry| entry.value().clone())
    }

    /// All direct child links
    pub fn children(&self) -> Vec<DirectoryLink> {
        self.links
            .iter()
            .filter(|entry| entry.relationship == Relationship::Child)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All adjacent links (parent and children)
    pub fn adjacent(&self) -> Vec<DirectoryLink> {
        self.links.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Resolve a directory name reachable through this node to a base URL,
    /// following fan-out naming: a direct child by name, or a descendant
    /// alias to that child's URL. Used when rewriting fan-out targets.
    pub fn child_url(&self, name: &str) -> Option<String> {
        if let Some(link) = self.links.get(name) {
            if link.relationship == Relationship::Child {
                return Some(link.url.clone());
            }
        }
        let child_name = self.aliases.get(name)?.value().clone();
        self.links
            .get(&child_name)
            .filter(|link| link.relationship == Relationship::Child)
            .map(|link| link.url.clone())
    }

    /// Next-hop URL toward `location`, first match wins:
    /// 1. exact adjacent link (parent or child)
    /// 2. descendant alias -> the aliased child's URL
    /// 3. any parent present -> ask upward
    /// Returns None when nothing matches (root with no such route).
    pub fn resolve(&self, location: &str) -> Option<String> {
        if let Some(link) = self.links.get(location) {
            debug!(location = %location, url = %link.url, "resolved adjacent directory");
            return Some(link.url.clone());
        }

        if let Some(alias) = self.aliases.get(location) {
            if let Some(link) = self.links.get(alias.value()) {
                debug!(
                    location = %location,
                    via = %alias.value(),
                    url = %link.url,
                    "resolved descendant alias"
                );
                return Some(link.url.clone());
            }
        }

        if let Some(parent) = self.parent() {
            debug!(location = %location, url = %parent.url, "unknown location, asking upward");
            return Some(parent.url);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_parent() -> TopologyStore {
        let store = TopologyStore::new("level1");
        store.add_link("A", "http://a:8080", Relationship::Parent);
        store.add_link("B", "http://b:8080", Relationship::Child);
        store.add_alias("C", "B");
        store
    }

    #[test]
    fn test_resolve_direct_child() {
        let store = store_with_parent();
        assert_eq!(store.resolve("B"), Some("http://b:8080".to_string()));
    }

    #[test]
    fn test_resolve_descendant_alias() {
        let store = store_with_parent();
        assert_eq!(store.resolve("C"), Some("http://b:8080".to_string()));
    }

    #[test]
    fn test_resolve_unknown_falls_back_to_parent() {
        let store = store_with_parent();
        assert_eq!(store.resolve("Z"), Some("http://a:8080".to_string()));
    }

    #[test]
    fn test_resolve_unknown_without_parent_is_absent() {
        let store = TopologyStore::new("root");
        store.add_link("B", "http://b:8080", Relationship::Child);
        assert_eq!(store.resolve("Z"), None);
    }

    #[test]
    fn test_child_url_ignores_parent_links() {
        let store = store_with_parent();
        assert_eq!(store.child_url("A"), None);
        assert_eq!(store.child_url("B"), Some("http://b:8080".to_string()));
        assert_eq!(store.child_url("C"), Some("http://b:8080".to_string()));
    }

    #[test]
    fn test_alias_pruning_is_explicit() {
        let store = store_with_parent();
        assert!(store.remove_alias("C"));
        assert!(!store.remove_alias("C"));
        // pruned alias falls through to the parent hop
        assert_eq!(store.resolve("C"), Some("http://a:8080".to_string()));
    }
}
