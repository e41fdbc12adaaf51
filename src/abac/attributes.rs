//! Per-user attribute namespaces
//!
//! Each user carries two lazily-populated attribute namespaces: user
//! attributes (address, phone, position, ...) and server attributes
//! (temperature, ...). The core reads and writes them only through the
//! `AttributeDirectory` trait; the in-memory implementation stands in for
//! whatever session store the deployment provides.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Which attribute namespace a value lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSpace {
    /// Attributes describing the user (subject side)
    User,
    /// Attributes held by the server (context side)
    Server,
}

/// Session-scoped attribute storage seam
#[async_trait]
pub trait AttributeDirectory: Send + Sync {
    async fn get(&self, user_id: &str, space: AttributeSpace, name: &str) -> Option<Value>;

    async fn set(&self, user_id: &str, space: AttributeSpace, name: &str, value: Value);

    /// All cached attributes of one namespace for a user
    async fn snapshot(&self, user_id: &str, space: AttributeSpace) -> Map<String, Value>;

    /// Drop everything cached for a user
    async fn clear(&self, user_id: &str);
}

#[derive(Default)]
struct UserAttributes {
    user: Map<String, Value>,
    server: Map<String, Value>,
}

impl UserAttributes {
    fn space(&self, space: AttributeSpace) -> &Map<String, Value> {
        match space {
            AttributeSpace::User => &self.user,
            AttributeSpace::Server => &self.server,
        }
    }

    fn space_mut(&mut self, space: AttributeSpace) -> &mut Map<String, Value> {
        match space {
            AttributeSpace::User => &mut self.user,
            AttributeSpace::Server => &mut self.server,
        }
    }
}

/// In-memory attribute directory
pub struct MemoryAttributeDirectory {
    users: DashMap<String, UserAttributes>,
}

impl MemoryAttributeDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }
}

impl Default for MemoryAttributeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttributeDirectory for MemoryAttributeDirectory {
    async fn get(&self, user_id: &str, space: AttributeSpace, name: &str) -> Option<Value> {
        self.users
            .get(user_id)
            .and_then(|attrs| attrs.space(space).get(name).cloned())
            .filter(|v| !v.is_null())
    }

    async fn set(&self, user_id: &str, space: AttributeSpace, name: &str, value: Value) {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .space_mut(space)
            .insert(name.to_string(), value);
    }

    async fn snapshot(&self, user_id: &str, space: AttributeSpace) -> Map<String, Value> {
        self.users
            .get(user_id)
            .map(|attrs| attrs.space(space).clone())
            .unwrap_or_default()
    }

    async fn clear(&self, user_id: &str) {
        self.users.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryAttributeDirectory::new();
        store
            .set("alice", AttributeSpace::User, "position", json!([1.0, 2.0]))
            .await;
        store
            .set("alice", AttributeSpace::Server, "temperature", json!(21))
            .await;

        assert_eq!(
            store.get("alice", AttributeSpace::User, "position").await,
            Some(json!([1.0, 2.0]))
        );
        assert_eq!(store.get("alice", AttributeSpace::User, "temperature").await, None);
        assert_eq!(
            store.get("alice", AttributeSpace::Server, "temperature").await,
            Some(json!(21))
        );
    }

    #[tokio::test]
    async fn test_null_values_read_as_absent() {
        let store = MemoryAttributeDirectory::new();
        store
            .set("alice", AttributeSpace::User, "address", Value::Null)
            .await;
        assert_eq!(store.get("alice", AttributeSpace::User, "address").await, None);
        // but the key still shows up in the snapshot (cached-but-empty)
        assert!(store
            .snapshot("alice", AttributeSpace::User)
            .await
            .contains_key("address"));
    }

    #[tokio::test]
    async fn test_clear_drops_both_namespaces() {
        let store = MemoryAttributeDirectory::new();
        store.set("alice", AttributeSpace::User, "a", json!(1)).await;
        store.set("alice", AttributeSpace::Server, "b", json!(2)).await;
        store.clear("alice").await;
        assert!(store.snapshot("alice", AttributeSpace::User).await.is_empty());
        assert!(store.snapshot("alice", AttributeSpace::Server).await.is_empty());
    }
}
