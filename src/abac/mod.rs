//! Attribute-based access control
//!
//! Policies are scoped per directory location. A decision walks three stages:
//! select the policies whose targets cover the request, keep those whose
//! rules all hold against resolved attributes, then let the highest-priority
//! survivor's effect decide. Unknown attributes make a rule fail closed.

pub mod attributes;
pub mod providers;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::abac::attributes::AttributeSpace;
use crate::abac::providers::{attribute_name, resolve, AttributeProvider, EvalContext, Namespace};
use crate::types::{DirectoryError, Result};

/// Policy outcome when the policy is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// One rule condition, tagged by its `condition` field on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition")]
pub enum Condition {
    Eq { value: Value },
    Ne { value: Value },
    Gt { value: f64 },
    Gte { value: f64 },
    Lt { value: f64 },
    Lte { value: f64 },
    In { values: Vec<Value> },
    Exists,
    Any,
}

impl Condition {
    /// Whether a resolved attribute satisfies the condition. A missing
    /// attribute satisfies nothing except `Any`.
    pub fn holds(&self, actual: Option<&Value>) -> bool {
        match self {
            Self::Any => true,
            Self::Exists => actual.is_some(),
            Self::Eq { value } => actual == Some(value),
            Self::Ne { value } => actual.is_some() && actual != Some(value),
            Self::Gt { value } => Self::number(actual).is_some_and(|a| a > *value),
            Self::Gte { value } => Self::number(actual).is_some_and(|a| a >= *value),
            Self::Lt { value } => Self::number(actual).is_some_and(|a| a < *value),
            Self::Lte { value } => Self::number(actual).is_some_and(|a| a <= *value),
            Self::In { values } => actual.is_some_and(|a| values.contains(a)),
        }
    }

    fn number(actual: Option<&Value>) -> Option<f64> {
        actual?.as_f64()
    }
}

/// Attribute-path -> condition pairs for one namespace. Accepts both a single
/// map and a list of maps on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleMap(pub Vec<(String, Condition)>);

impl Serialize for RuleMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (path, condition) in &self.0 {
            map.serialize_entry(path, condition)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RuleMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let maps: Vec<Map<String, Value>> = match raw {
            Value::Object(map) => vec![map],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    other => Err(D::Error::custom(format!(
                        "rule entry must be an object, got {}",
                        other
                    ))),
                })
                .collect::<std::result::Result<_, _>>()?,
            other => {
                return Err(D::Error::custom(format!(
                    "rules must be an object or a list of objects, got {}",
                    other
                )))
            }
        };
        let mut pairs = Vec::new();
        for map in maps {
            for (path, condition) in map {
                let condition =
                    serde_json::from_value(condition).map_err(D::Error::custom)?;
                pairs.push((path, condition));
            }
        }
        Ok(RuleMap(pairs))
    }
}

/// The rules of a policy, one map per namespace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub subject: RuleMap,
    #[serde(default)]
    pub resource: RuleMap,
    #[serde(default)]
    pub action: RuleMap,
    #[serde(default)]
    pub context: RuleMap,
}

impl RuleSet {
    fn namespace(&self, ns: Namespace) -> &RuleMap {
        match ns {
            Namespace::Subject => &self.subject,
            Namespace::Resource => &self.resource,
            Namespace::Action => &self.action,
            Namespace::Context => &self.context,
        }
    }
}

/// Id patterns a policy applies to; `*` is a wildcard segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default = "Patterns::any")]
    pub subject_id: Patterns,
    #[serde(default = "Patterns::any")]
    pub resource_id: Patterns,
    #[serde(default = "Patterns::any")]
    pub action_id: Patterns,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            subject_id: Patterns::any(),
            resource_id: Patterns::any(),
            action_id: Patterns::any(),
        }
    }
}

/// A string-or-list of glob-ish id patterns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Patterns(pub Vec<String>);

impl Patterns {
    pub fn any() -> Self {
        Self(vec!["*".to_string()])
    }

    pub fn matches(&self, id: &str) -> bool {
        self.0.iter().any(|pattern| pattern_matches(pattern, id))
    }
}

impl<'de> Deserialize<'de> for Patterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(one) => Ok(Self(vec![one])),
            Value::Array(items) => {
                let patterns = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        other => Err(D::Error::custom(format!(
                            "target pattern must be a string, got {}",
                            other
                        ))),
                    })
                    .collect::<std::result::Result<_, _>>()?;
                Ok(Self(patterns))
            }
            other => Err(D::Error::custom(format!(
                "target must be a string or list of strings, got {}",
                other
            ))),
        }
    }
}

/// Match an id against a pattern with at most one `*` wildcard
fn pattern_matches(pattern: &str, id: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == id,
        Some((prefix, suffix)) => {
            id.len() >= prefix.len() + suffix.len()
                && id.starts_with(prefix)
                && id.ends_with(suffix)
        }
    }
}

/// A stored access policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub uid: String,
    #[serde(default)]
    pub description: String,
    pub effect: Effect,
    #[serde(default)]
    pub rules: RuleSet,
    #[serde(default)]
    pub targets: Targets,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    /// Build a policy from a submitted document. The server assigns the uid;
    /// a document carrying one is rejected.
    pub fn from_document(document: Value) -> Result<Self> {
        let Value::Object(mut map) = document else {
            return Err(DirectoryError::BadRequest("policy must be an object".to_string()));
        };
        if map.contains_key("uid") {
            return Err(DirectoryError::BadRequest(
                "policy documents must not carry a uid".to_string(),
            ));
        }
        if !map.contains_key("effect") {
            return Err(DirectoryError::BadRequest("policy requires an effect".to_string()));
        }
        map.insert("uid".to_string(), Value::String(Uuid::new_v4().to_string()));
        map.insert(
            "created_at".to_string(),
            serde_json::to_value(Utc::now())?,
        );
        let policy: Policy = serde_json::from_value(Value::Object(map))
            .map_err(|e| DirectoryError::BadRequest(format!("invalid policy: {}", e)))?;
        Ok(policy)
    }
}

/// Per-location policy storage
pub struct PolicyStore {
    by_location: DashMap<String, Vec<Policy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            by_location: DashMap::new(),
        }
    }

    pub fn add(&self, location: &str, policy: Policy) {
        debug!(location, uid = %policy.uid, "policy stored");
        self.by_location
            .entry(location.to_string())
            .or_default()
            .push(policy);
    }

    /// Remove a policy by uid. Returns true when it existed.
    pub fn delete(&self, location: &str, uid: &str) -> bool {
        let Some(mut policies) = self.by_location.get_mut(location) else {
            return false;
        };
        let before = policies.len();
        policies.retain(|p| p.uid != uid);
        before != policies.len()
    }

    /// Policies at a location whose resource target covers the thing
    pub fn for_resource(&self, location: &str, thing_id: &str) -> Vec<Policy> {
        self.by_location
            .get(location)
            .map(|policies| {
                policies
                    .iter()
                    .filter(|p| p.targets.resource_id.matches(thing_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One access request: who wants to do what to which thing
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub subject_id: String,
    pub resource_id: String,
    pub action_id: String,
}

/// Policy decision point
pub struct DecisionEngine {
    providers: Vec<Box<dyn AttributeProvider>>,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self {
            providers: providers::provider_chain(),
        }
    }

    /// Evaluate a request against candidate policies. Default-deny: no
    /// matching policy means no access.
    pub async fn is_allowed(
        &self,
        policies: &[Policy],
        request: &AccessRequest,
        ctx: &EvalContext,
    ) -> bool {
        let mut winner: Option<&Policy> = None;
        for policy in policies {
            if !self.targets_cover(policy, request) {
                continue;
            }
            if !self.rules_hold(policy, ctx).await {
                continue;
            }
            let beats = match winner {
                None => true,
                Some(current) => {
                    policy.priority > current.priority
                        || (policy.priority == current.priority
                            && policy.created_at > current.created_at)
                }
            };
            if beats {
                winner = Some(policy);
            }
        }
        match winner {
            Some(policy) => {
                debug!(uid = %policy.uid, effect = ?policy.effect, "policy decision");
                policy.effect == Effect::Allow
            }
            None => false,
        }
    }

    fn targets_cover(&self, policy: &Policy, request: &AccessRequest) -> bool {
        policy.targets.subject_id.matches(&request.subject_id)
            && policy.targets.resource_id.matches(&request.resource_id)
            && policy.targets.action_id.matches(&request.action_id)
    }

    async fn rules_hold(&self, policy: &Policy, ctx: &EvalContext) -> bool {
        for ns in [
            Namespace::Subject,
            Namespace::Resource,
            Namespace::Action,
            Namespace::Context,
        ] {
            for (path, condition) in &policy.rules.namespace(ns).0 {
                let actual = resolve(&self.providers, ns, path, ctx).await;
                if !condition.holds(actual.as_ref()) {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribute names the candidate policies reference whose cached values are
/// missing. Subject-rule names land in the user scope list, context-rule
/// names in the server scope list. Position is always re-requested since a
/// cached position goes stale.
pub async fn missing_scopes(
    policies: &[Policy],
    ctx: &EvalContext,
) -> (Vec<String>, Vec<String>) {
    let mut user_scopes = Vec::new();
    let mut server_scopes = Vec::new();
    for policy in policies {
        for (path, _) in &policy.rules.subject.0 {
            let name = if path.starts_with("$.geo") {
                "position".to_string()
            } else {
                match attribute_name(path) {
                    Some(name) => name,
                    None => continue,
                }
            };
            let cached = ctx
                .attributes
                .get(&ctx.user_id, AttributeSpace::User, &name)
                .await;
            if (cached.is_none() || name == "position") && !user_scopes.contains(&name) {
                user_scopes.push(name);
            }
        }
        for (path, _) in &policy.rules.context.0 {
            let Some(name) = attribute_name(path) else {
                continue;
            };
            let cached = ctx
                .attributes
                .get(&ctx.user_id, AttributeSpace::Server, &name)
                .await;
            if cached.is_none() && !server_scopes.contains(&name) {
                server_scopes.push(name);
            }
        }
    }
    (user_scopes, server_scopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abac::attributes::MemoryAttributeDirectory;
    use crate::registry::Registry;
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> EvalContext {
        EvalContext {
            user_id: "alice".to_string(),
            thing_id: "t1".to_string(),
            registry: Arc::new(Registry::new()),
            attributes: Arc::new(MemoryAttributeDirectory::new()),
        }
    }

    fn request() -> AccessRequest {
        AccessRequest {
            subject_id: "alice".to_string(),
            resource_id: "t1".to_string(),
            action_id: "get".to_string(),
        }
    }

    fn policy(doc: Value) -> Policy {
        Policy::from_document(doc).unwrap()
    }

    #[test]
    fn test_from_document_assigns_uid_and_rejects_provided_one() {
        let p = policy(json!({"description": "d", "effect": "allow", "priority": 1}));
        assert!(!p.uid.is_empty());
        assert_eq!(p.effect, Effect::Allow);
        assert!(p.targets.subject_id.matches("anyone"));

        assert!(Policy::from_document(json!({"uid": "x", "effect": "allow"})).is_err());
        assert!(Policy::from_document(json!({"description": "no effect"})).is_err());
    }

    #[test]
    fn test_rule_map_accepts_map_or_list() {
        let single: RuleSet = serde_json::from_value(json!({
            "subject": {"$.email": {"condition": "Eq", "value": "a@b"}}
        }))
        .unwrap();
        assert_eq!(single.subject.0.len(), 1);

        let listed: RuleSet = serde_json::from_value(json!({
            "subject": [
                {"$.email": {"condition": "Eq", "value": "a@b"}},
                {"$.level": {"condition": "Exists"}}
            ]
        }))
        .unwrap();
        assert_eq!(listed.subject.0.len(), 2);
    }

    #[test]
    fn test_condition_semantics() {
        let eq = Condition::Eq { value: json!(5) };
        assert!(eq.holds(Some(&json!(5))));
        assert!(!eq.holds(Some(&json!(6))));
        assert!(!eq.holds(None));

        let gte = Condition::Gte { value: 10.0 };
        assert!(gte.holds(Some(&json!(10))));
        assert!(!gte.holds(Some(&json!(9.5))));
        assert!(!gte.holds(Some(&json!("10"))));

        let within = Condition::In { values: vec![json!("a"), json!("b")] };
        assert!(within.holds(Some(&json!("b"))));
        assert!(!within.holds(Some(&json!("c"))));

        assert!(Condition::Any.holds(None));
        assert!(!Condition::Exists.holds(None));
        assert!(Condition::Exists.holds(Some(&json!(null))));
    }

    #[test]
    fn test_target_wildcards() {
        let p = Patterns(vec!["sensor-*".to_string()]);
        assert!(p.matches("sensor-7"));
        assert!(!p.matches("actuator-7"));
        assert!(Patterns::any().matches("anything"));
    }

    #[test]
    fn test_store_scopes_policies_per_location() {
        let store = PolicyStore::new();
        let p = policy(json!({"effect": "allow", "targets": {"resource_id": "t1"}}));
        let uid = p.uid.clone();
        store.add("level1", p);

        assert_eq!(store.for_resource("level1", "t1").len(), 1);
        assert!(store.for_resource("level2", "t1").is_empty());
        assert!(store.for_resource("level1", "t2").is_empty());

        assert!(store.delete("level1", &uid));
        assert!(!store.delete("level1", &uid));
    }

    #[tokio::test]
    async fn test_default_deny_without_matching_policy() {
        let engine = DecisionEngine::new();
        assert!(!engine.is_allowed(&[], &request(), &context()).await);

        let unrelated = policy(json!({"effect": "allow", "targets": {"subject_id": "bob"}}));
        assert!(!engine.is_allowed(&[unrelated], &request(), &context()).await);
    }

    #[tokio::test]
    async fn test_rules_fail_closed_on_unknown_attribute() {
        let engine = DecisionEngine::new();
        let p = policy(json!({
            "effect": "allow",
            "rules": {"subject": {"$.email": {"condition": "Eq", "value": "a@b"}}}
        }));
        assert!(!engine.is_allowed(&[p.clone()], &request(), &context()).await);

        let ctx = context();
        ctx.attributes
            .set("alice", AttributeSpace::User, "email", json!("a@b"))
            .await;
        assert!(engine.is_allowed(&[p], &request(), &ctx).await);
    }

    #[tokio::test]
    async fn test_highest_priority_wins() {
        let engine = DecisionEngine::new();
        let allow = policy(json!({"effect": "allow", "priority": 1}));
        let deny = policy(json!({"effect": "deny", "priority": 5}));
        assert!(!engine.is_allowed(&[allow.clone(), deny.clone()], &request(), &context()).await);
        assert!(!engine.is_allowed(&[deny, allow], &request(), &context()).await);
    }

    #[tokio::test]
    async fn test_priority_tie_newest_wins() {
        let engine = DecisionEngine::new();
        let mut older = policy(json!({"effect": "deny", "priority": 3}));
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = policy(json!({"effect": "allow", "priority": 3}));
        assert!(engine.is_allowed(&[older, newer], &request(), &context()).await);
    }

    #[tokio::test]
    async fn test_missing_scopes_reports_uncached_names() {
        let ctx = context();
        ctx.attributes
            .set("alice", AttributeSpace::User, "email", json!("a@b"))
            .await;
        let p = policy(json!({
            "effect": "allow",
            "rules": {
                "subject": [
                    {"$.email": {"condition": "Exists"}},
                    {"$.address": {"condition": "Exists"}},
                    {"$.geo:0,0 4,0 4,4": {"condition": "Eq", "value": 1}}
                ],
                "context": {"$.temperature": {"condition": "Lt", "value": 30.0}}
            }
        }));
        let (user, server) = missing_scopes(&[p], &ctx).await;
        // email is cached; address missing; position always refreshed
        assert_eq!(user, vec!["address", "position"]);
        assert_eq!(server, vec!["temperature"]);
    }
}
