//! Protocol engine
//!
//! Each operation either runs locally or is forwarded one hop along the tree
//! via the location resolver. Registration surfaces push-up and aggregation
//! failures to the caller, without rolling back steps already performed.
//! Deletion's upstream hops and fan-out reads are best-effort: a failed hop
//! is logged and skipped.

use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::model::ThingRecord;
use crate::registry::Registry;
use crate::topology::TopologyStore;
use crate::types::{DirectoryError, Result};

use super::client::{join_url, PeerClient};
use super::query::QueryScript;
use super::reduce::{compress, reduce, CompressedThing};

/// Parameters of a federated search
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub thing_type: Option<String>,
    pub thing_id: Option<String>,
    pub location: Option<String>,
    pub user: Option<String>,
    /// Iterative resolution: answer a remote location with a redirect
    /// instead of proxying the search
    pub iterative: bool,
}

/// Outcome of a search at this node
#[derive(Debug)]
pub enum SearchOutcome {
    Results(Vec<Value>),
    /// Iterative mode: the client should retry at this URL
    Redirect(String),
}

/// Directory operations of one federation node
pub struct Engine {
    topology: Arc<TopologyStore>,
    registry: Arc<Registry>,
    client: PeerClient,
}

impl Engine {
    pub fn new(topology: Arc<TopologyStore>, registry: Arc<Registry>, client: PeerClient) -> Self {
        Self {
            topology,
            registry,
            client,
        }
    }

    fn node_name(&self) -> &str {
        self.topology.node_name()
    }

    fn is_local(&self, location: Option<&str>) -> bool {
        match location {
            None => true,
            Some(name) => name == self.node_name(),
        }
    }

    /// Next-hop base URL toward a remote location
    fn route(&self, location: &str) -> Result<String> {
        self.topology
            .resolve(location)
            .ok_or_else(|| DirectoryError::NotFound(format!("unknown location '{}'", location)))
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a thing description, locally or at a remote location
    pub async fn register(
        &self,
        description: Value,
        publicity: u32,
        location: Option<&str>,
    ) -> Result<()> {
        if let Some(target) = location.filter(|_| !self.is_local(location)) {
            let base = self.route(target)?;
            let url = join_url(&base, "register");
            let body = json!({"td": description, "location": target, "publicity": publicity});
            return self.client.post_json_ok(&url, &body).await;
        }

        let record = ThingRecord::from_description(description, publicity)?;
        let thing_type = record.thing_type.clone();
        self.registry.insert(record.clone())?;
        info!(
            thing_id = %record.thing_id,
            thing_type = %thing_type,
            publicity,
            "thing registered"
        );

        if record.publicity > 0 {
            self.push_up(&record).await?;
        }
        if self.registry.count_of_type(&thing_type) == 1 {
            self.announce_type_added(&thing_type, self.node_name()).await?;
        }
        Ok(())
    }

    /// Replicate a record one level up with decremented publicity. The parent
    /// registers the copy itself and continues the climb while publicity
    /// remains positive. A failed hop fails the registration; the local
    /// insert stays in place.
    async fn push_up(&self, record: &ThingRecord) -> Result<()> {
        let Some(parent) = self.topology.parent() else {
            return Ok(());
        };
        let mut copy = record.clone();
        copy.publicity = record.publicity - 1;
        let url = join_url(&parent.url, "register");
        let body = json!({
            "td": copy.to_value(),
            "location": parent.directory_name,
            "publicity": copy.publicity,
        });
        self.client.post_json_ok(&url, &body).await
    }

    // ------------------------------------------------------------------
    // Type index propagation
    // ------------------------------------------------------------------

    /// A descendant announced its first thing of a type. Index it and keep
    /// climbing while the entry is new at each level.
    pub async fn apply_type_added(&self, thing_type: &str, origin: &str) {
        if self.registry.index_add(thing_type, origin) {
            if let Err(e) = self.announce_type_added(thing_type, origin).await {
                warn!(thing_type, origin, error = %e, "type index announcement failed");
            }
        }
    }

    /// A descendant announced its last thing of a type is gone
    pub async fn apply_type_removed(&self, thing_type: &str, origin: &str) {
        if self.registry.index_remove(thing_type, origin) {
            self.announce_type_removed(thing_type, origin).await;
        }
    }

    async fn announce_type_added(&self, thing_type: &str, origin: &str) -> Result<()> {
        let Some(parent) = self.topology.parent() else {
            return Ok(());
        };
        let url = join_url(&parent.url, "update_aggregate");
        let body = json!({"thing_type": thing_type, "location": origin});
        self.client.post_json_ok(&url, &body).await
    }

    async fn announce_type_removed(&self, thing_type: &str, origin: &str) {
        let Some(parent) = self.topology.parent() else {
            return;
        };
        let url = format!(
            "{}?{}",
            join_url(&parent.url, "update_aggregate"),
            query_string(&[("thing_type", thing_type), ("location", origin)]),
        );
        match self.client.delete(&url).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                warn!(thing_type, origin, %status, "type index retraction rejected")
            }
            Err(e) => warn!(thing_type, origin, error = %e, "type index retraction failed"),
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Delete a thing, locally or at a remote location
    pub async fn delete(&self, thing_id: &str, location: Option<&str>) -> Result<()> {
        if let Some(target) = location.filter(|_| !self.is_local(location)) {
            let base = self.route(target)?;
            let url = format!(
                "{}?{}",
                join_url(&base, "delete"),
                query_string(&[("thing_id", thing_id), ("location", target)]),
            );
            let status = self.client.delete(&url).await?;
            return match status.as_u16() {
                200..=299 => Ok(()),
                404 => Err(DirectoryError::NotFound(format!(
                    "thing '{}' not found at '{}'",
                    thing_id, target
                ))),
                other => Err(DirectoryError::Upstream(format!(
                    "DELETE at '{}' returned {}",
                    target, other
                ))),
            };
        }

        let record = self
            .registry
            .remove(thing_id)
            .ok_or_else(|| DirectoryError::NotFound(format!("thing '{}' not found", thing_id)))?;
        info!(thing_id, thing_type = %record.thing_type, "thing deleted");

        // a replicated record has copies upward; tell the parent to shed its own
        if record.publicity > 0 {
            if let Some(parent) = self.topology.parent() {
                let url = format!(
                    "{}?{}",
                    join_url(&parent.url, "delete"),
                    query_string(&[("thing_id", thing_id)]),
                );
                match self.client.delete(&url).await {
                    Ok(status) if status.is_success() => {}
                    Ok(status) => warn!(
                        thing_id,
                        parent = %parent.directory_name,
                        %status,
                        "push-up copy deletion rejected"
                    ),
                    Err(e) => warn!(
                        thing_id,
                        parent = %parent.directory_name,
                        error = %e,
                        "push-up copy deletion failed"
                    ),
                }
            }
        }

        if self.registry.count_of_type(&record.thing_type) == 0 {
            self.announce_type_removed(&record.thing_type, self.node_name())
                .await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Federated search: local matches plus a parallel fan-out to every
    /// descendant directory known to hold the requested type. Duplicate ids
    /// from push-up replication are dropped first-seen-wins.
    pub async fn search(&self, params: &SearchParams) -> Result<SearchOutcome> {
        if let Some(target) = params
            .location
            .as_deref()
            .filter(|_| !self.is_local(params.location.as_deref()))
        {
            let base = self.route(target)?;
            let url = format!(
                "{}?{}",
                join_url(&base, "search"),
                self.search_query(params, target),
            );
            if params.iterative {
                return Ok(SearchOutcome::Redirect(url));
            }
            let body = self.client.get_json(&url).await?;
            let results = body.as_array().cloned().unwrap_or_default();
            return Ok(SearchOutcome::Results(results));
        }

        let mut seen: Vec<String> = Vec::new();
        let mut results: Vec<Value> = Vec::new();
        for record in self
            .registry
            .find(params.thing_type.as_deref(), params.thing_id.as_deref())
        {
            if let Some(user) = params.user.as_deref() {
                self.registry.record_access(&record.thing_id, user);
            }
            seen.push(record.thing_id.clone());
            results.push(record.to_value());
        }

        for item in self.children_results(params).await {
            let Some(id) = item.get("thing_id").and_then(Value::as_str) else {
                continue;
            };
            if seen.iter().any(|s| s == id) {
                continue;
            }
            seen.push(id.to_string());
            results.push(item);
        }

        self.enrich(&mut results).await;
        Ok(SearchOutcome::Results(results))
    }

    /// Fan the search out to the indexed descendant directories in parallel.
    /// A hop that cannot be routed or fails is skipped.
    async fn children_results(&self, params: &SearchParams) -> Vec<Value> {
        let locations = match params.thing_type.as_deref() {
            Some(t) => self.registry.locations_for(t),
            None => self.registry.all_indexed_locations(),
        };

        let mut targets: Vec<(String, String)> = Vec::new();
        for location in locations {
            match self.topology.child_url(&location) {
                Some(base) => targets.push((location, base)),
                None => warn!(location = %location, "indexed location has no downward route"),
            }
        }

        let fetches = targets.into_iter().map(|(location, base)| {
            let url = format!(
                "{}?{}",
                join_url(&base, "search"),
                self.search_query(params, &location),
            );
            async move { (base, self.client.get_json(&url).await) }
        });

        let mut merged = Vec::new();
        for (base, response) in join_all(fetches).await {
            match response {
                Ok(Value::Array(items)) => merged.extend(items),
                Ok(other) => warn!(base = %base, body = %other, "search hop returned a non-list"),
                Err(e) => warn!(base = %base, error = %e, "search hop failed, skipping"),
            }
        }
        merged
    }

    /// Best-effort enrichment: a result carrying a `url` property points at
    /// the thing's live description; fetch it and merge in fields the stored
    /// record does not already have. Fetch failures leave the record as-is.
    async fn enrich(&self, results: &mut [Value]) {
        let targets: Vec<(usize, String)> = results
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                Some((i, item.get("url")?.as_str()?.to_string()))
            })
            .collect();

        let fetches = targets
            .into_iter()
            .map(|(i, url)| async move { (i, url.clone(), self.client.get_json(&url).await) });
        for (i, url, response) in join_all(fetches).await {
            match response {
                Ok(Value::Object(extra)) => {
                    if let Some(map) = results[i].as_object_mut() {
                        for (key, value) in extra {
                            map.entry(key).or_insert(value);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(url = %url, error = %e, "url enrichment failed, record left as-is"),
            }
        }
    }

    fn search_query(&self, params: &SearchParams, location: &str) -> String {
        let mut pairs: Vec<(&str, &str)> = vec![("location", location)];
        if let Some(t) = params.thing_type.as_deref() {
            pairs.push(("thing_type", t));
        }
        if let Some(id) = params.thing_id.as_deref() {
            pairs.push(("thing_id", id));
        }
        if let Some(user) = params.user.as_deref() {
            pairs.push(("user", user));
        }
        if params.iterative {
            pairs.push(("iterative", "true"));
        }
        query_string(&pairs)
    }

    // ------------------------------------------------------------------
    // Relocation
    // ------------------------------------------------------------------

    /// Move a thing between directories. Only the source directory executes
    /// the move; every other node forwards toward it. The record is
    /// registered at the destination before the local copy is removed, so a
    /// failure after the registration leaves the record visible twice until
    /// the delete is retried.
    pub async fn relocate(&self, thing_id: &str, from: &str, to: &str) -> Result<()> {
        if from != self.node_name() {
            let base = self.route(from)?;
            let url = join_url(&base, "relocate");
            let body = json!({"thing_id": thing_id, "from": from, "to": to});
            return self.client.post_json_ok(&url, &body).await;
        }

        let record = self
            .registry
            .get(thing_id)
            .ok_or_else(|| DirectoryError::NotFound(format!("thing '{}' not found", thing_id)))?;
        let dest = self.route(to)?;
        let url = join_url(&dest, "register");
        let body = json!({
            "td": record.to_value(),
            "location": to,
            "publicity": record.publicity,
        });
        self.client.post_json_ok(&url, &body).await?;
        info!(thing_id, from, to, "thing relocated");

        self.delete(thing_id, None).await
    }

    // ------------------------------------------------------------------
    // Custom aggregation queries
    // ------------------------------------------------------------------

    /// Run an aggregation query over this node's subtree. Sub-directory hops
    /// return the compressed intermediate list; only the query origin reduces.
    pub async fn custom_query(&self, script: &QueryScript) -> Result<Value> {
        if let Some(target) = script
            .location
            .as_deref()
            .filter(|_| !self.is_local(script.location.as_deref()))
        {
            let base = self.route(target)?;
            let url = format!(
                "{}?data={}",
                join_url(&base, "custom_query"),
                urlencoding::encode(&serde_json::to_string(script)?),
            );
            return self.client.get_json(&url).await;
        }

        let range = script.time_range();
        let mut seen: Vec<String> = Vec::new();
        let mut compressed: Vec<CompressedThing> = Vec::new();
        for record in self.registry.find(Some(&script.thing_type), None) {
            let document = record.to_value();
            if script
                .filter
                .as_ref()
                .is_some_and(|filter| !filter.matches(&document))
            {
                continue;
            }
            if let Some(thing) = compress(
                &self.client,
                &document,
                script.operation,
                script.data.as_deref(),
                range,
            )
            .await
            {
                seen.push(thing.thing_id.clone());
                compressed.push(thing);
            }
        }

        for thing in self.children_query(script).await {
            if seen.iter().any(|s| s == &thing.thing_id) {
                continue;
            }
            seen.push(thing.thing_id.clone());
            compressed.push(thing);
        }

        if script.sub_dir {
            return Ok(serde_json::to_value(&compressed)?);
        }
        Ok(reduce(&compressed, script.operation))
    }

    /// Fan the query out to each direct child whose subtree holds the type.
    /// Children cover their own subtrees recursively, so each child URL is
    /// queried once however many indexed locations route through it.
    async fn children_query(&self, script: &QueryScript) -> Vec<CompressedThing> {
        let child_script = script.for_children();
        let payload = match serde_json::to_string(&child_script) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "query script not serializable for fan-out");
                return Vec::new();
            }
        };
        let encoded = urlencoding::encode(&payload).into_owned();

        let mut targets: Vec<String> = Vec::new();
        for location in self.registry.locations_for(&script.thing_type) {
            match self.topology.child_url(&location) {
                Some(base) if !targets.contains(&base) => targets.push(base),
                Some(_) => {}
                None => warn!(location = %location, "indexed location has no downward route"),
            }
        }

        let fetches = targets.into_iter().map(|base| {
            let url = format!("{}?data={}", join_url(&base, "custom_query"), encoded);
            async move { (base, self.client.get_json(&url).await) }
        });

        let mut merged = Vec::new();
        for (base, response) in join_all(fetches).await {
            match response {
                Ok(body) => match serde_json::from_value::<Vec<CompressedThing>>(body) {
                    Ok(things) => merged.extend(things),
                    Err(e) => warn!(base = %base, error = %e, "query hop returned malformed intermediates"),
                },
                Err(e) => warn!(base = %base, error = %e, "query hop failed, skipping"),
            }
        }
        merged
    }
}

fn query_string(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::query::Operation;
    use crate::model::Relationship;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn engine() -> Engine {
        Engine::new(
            Arc::new(TopologyStore::new("level1")),
            Arc::new(Registry::new()),
            PeerClient::new(1000),
        )
    }

    fn description(id: &str, ty: &str) -> Value {
        json!({"thing_id": id, "thing_type": ty, "title": "x"})
    }

    /// Loopback peer answering every request with `reply`, recording the
    /// (path, body) of each request it served
    async fn spawn_peer(reply: &'static str) -> (String, Arc<Mutex<Vec<(String, String)>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).into_owned();
                        let Some(head_end) = text.find("\r\n\r\n") else {
                            continue;
                        };
                        let head = &text[..head_end];
                        let length = head
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if buf.len() < head_end + 4 + length {
                            continue;
                        }
                        let path = head
                            .lines()
                            .next()
                            .and_then(|l| l.split_whitespace().nth(1))
                            .unwrap_or("")
                            .to_string();
                        let body = text[head_end + 4..head_end + 4 + length].to_string();
                        log.lock().unwrap().push((path, body));
                        let response = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                            reply.len(),
                            reply,
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        return;
                    }
                });
            }
        });
        (base, seen)
    }

    fn engine_with_parent(parent_url: &str) -> Engine {
        let topology = TopologyStore::new("level2");
        topology.add_link("level1", parent_url, Relationship::Parent);
        Engine::new(
            Arc::new(topology),
            Arc::new(Registry::new()),
            PeerClient::new(1000),
        )
    }

    #[tokio::test]
    async fn test_register_and_search_locally() {
        let engine = engine();
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        engine
            .register(description("t2", "actuator"), 0, Some("level1"))
            .await
            .unwrap();

        let params = SearchParams {
            thing_type: Some("sensor".to_string()),
            ..Default::default()
        };
        let SearchOutcome::Results(results) = engine.search(&params).await.unwrap() else {
            panic!("local search must not redirect");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["thing_id"], json!("t1"));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate() {
        let engine = engine();
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        assert!(engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_register_unknown_location_is_not_found() {
        let engine = engine();
        let err = engine
            .register(description("t1", "sensor"), 0, Some("nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_thing_is_not_found() {
        let engine = engine();
        let err = engine.delete("ghost", None).await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let engine = engine();
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        engine.delete("t1", None).await.unwrap();

        let params = SearchParams::default();
        let SearchOutcome::Results(results) = engine.search(&params).await.unwrap() else {
            panic!("local search must not redirect");
        };
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_records_access_for_user() {
        let engine = engine();
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        let params = SearchParams {
            thing_id: Some("t1".to_string()),
            user: Some("alice".to_string()),
            ..Default::default()
        };
        engine.search(&params).await.unwrap();

        let since = chrono::Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(engine.registry.accesses_since("t1", "alice", since), 1);
    }

    #[tokio::test]
    async fn test_register_surfaces_push_up_failure() {
        // nothing listens here; the upstream hop must fail the registration
        let engine = engine_with_parent("http://127.0.0.1:9");
        let result = engine.register(description("t1", "sensor"), 1, None).await;
        assert!(result.is_err());
        // the local insert is not rolled back
        assert!(engine.registry.get("t1").is_some());
    }

    #[tokio::test]
    async fn test_push_up_decrements_publicity() {
        let (parent_url, seen) = spawn_peer("{}").await;
        let engine = engine_with_parent(&parent_url);
        engine
            .register(description("t1", "sensor"), 2, None)
            .await
            .unwrap();

        let calls = seen.lock().unwrap().clone();
        let body = calls
            .iter()
            .find(|(path, _)| path == "/register")
            .map(|(_, body)| body.clone())
            .expect("no push-up hop reached the parent");
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["publicity"], json!(1));
        assert_eq!(body["location"], json!("level1"));
        assert_eq!(body["td"]["thing_id"], json!("t1"));
    }

    #[tokio::test]
    async fn test_push_up_stops_at_zero_publicity() {
        let (parent_url, seen) = spawn_peer("{}").await;
        let engine = engine_with_parent(&parent_url);
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();

        let calls = seen.lock().unwrap().clone();
        assert!(calls.iter().all(|(path, _)| path != "/register"));
        // the first-of-type announcement still climbs
        assert!(calls.iter().any(|(path, _)| path == "/update_aggregate"));
    }

    #[tokio::test]
    async fn test_search_fan_out_dedups_by_thing_id() {
        // the child subtree reports t1 (also held here via push-up) and t2
        let (child_url, _seen) = spawn_peer(
            r#"[{"thing_id":"t1","thing_type":"sensor"},{"thing_id":"t2","thing_type":"sensor"}]"#,
        )
        .await;
        let topology = TopologyStore::new("level1");
        topology.add_link("level2", &child_url, Relationship::Child);
        let engine = Engine::new(
            Arc::new(topology),
            Arc::new(Registry::new()),
            PeerClient::new(1000),
        );
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        engine.registry.index_add("sensor", "level2");

        let params = SearchParams {
            thing_type: Some("sensor".to_string()),
            ..Default::default()
        };
        let SearchOutcome::Results(results) = engine.search(&params).await.unwrap() else {
            panic!("local search must not redirect");
        };
        let ids: Vec<&str> = results
            .iter()
            .filter_map(|r| r["thing_id"].as_str())
            .collect();
        // the locally held copy wins over the child's duplicate
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_relocate_unknown_thing_or_destination() {
        let engine = engine();
        let err = engine.relocate("ghost", "level1", "level2").await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));

        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        let err = engine.relocate("t1", "level1", "nowhere").await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
        // failed relocation leaves the record in place
        assert!(engine.registry.get("t1").is_some());
    }

    #[tokio::test]
    async fn test_custom_query_counts_local_things() {
        let engine = engine();
        engine
            .register(description("t1", "sensor"), 0, None)
            .await
            .unwrap();
        engine
            .register(description("t2", "sensor"), 0, None)
            .await
            .unwrap();

        let script =
            QueryScript::parse(r#"{"operation": "COUNT", "type": "sensor"}"#).unwrap();
        let result = engine.custom_query(&script).await.unwrap();
        assert_eq!(result, json!({"operation": "COUNT", "result": 2}));
    }

    #[tokio::test]
    async fn test_custom_query_sub_dir_returns_compressed_list() {
        let engine = engine();
        engine
            .register(
                json!({
                    "thing_id": "t1",
                    "thing_type": "sensor",
                    "properties": {"temp": [{"data": 5.0, "start": 0.0, "end": 10.0}]}
                }),
                0,
                None,
            )
            .await
            .unwrap();

        let script = QueryScript::parse(
            r#"{"operation": "SUM", "type": "sensor", "data": "properties.temp", "_sub_dir": true}"#,
        )
        .unwrap();
        let result = engine.custom_query(&script).await.unwrap();
        let things: Vec<CompressedThing> = serde_json::from_value(result).unwrap();
        assert_eq!(things.len(), 1);
        assert_eq!(things[0].thing_id, "t1");
        assert_eq!(script.operation, Operation::Sum);
    }

    #[tokio::test]
    async fn test_custom_query_applies_filter() {
        let engine = engine();
        engine
            .register(
                json!({"thing_id": "t1", "thing_type": "sensor", "properties": {"room": "kitchen", "temp": 3.0}}),
                0,
                None,
            )
            .await
            .unwrap();
        engine
            .register(
                json!({"thing_id": "t2", "thing_type": "sensor", "properties": {"room": "attic", "temp": 4.0}}),
                0,
                None,
            )
            .await
            .unwrap();

        let script = QueryScript::parse(
            r#"{"operation": "COUNT", "type": "sensor", "filter": {"properties.room": "kitchen"}}"#,
        )
        .unwrap();
        let result = engine.custom_query(&script).await.unwrap();
        assert_eq!(result["result"], json!(1));
    }
}
