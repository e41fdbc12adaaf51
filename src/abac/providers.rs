//! Attribute providers
//!
//! Policy rules reference attributes by JSON path. When a rule is evaluated
//! the path is offered to a fixed chain of providers; the first one that
//! returns a value wins. Specialized providers handle computed attributes
//! (current time, recent access counts, geofence membership); the generic
//! provider falls back to the cached attribute namespaces.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::abac::attributes::{AttributeDirectory, AttributeSpace};
use crate::registry::Registry;

/// The four rule namespaces of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Subject,
    Resource,
    Action,
    Context,
}

/// Everything a provider may consult while resolving an attribute
pub struct EvalContext {
    pub user_id: String,
    pub thing_id: String,
    pub registry: Arc<Registry>,
    pub attributes: Arc<dyn AttributeDirectory>,
}

/// One resolver in the attribute chain. Returning `None` passes the path to
/// the next provider.
#[async_trait]
pub trait AttributeProvider: Send + Sync {
    async fn try_resolve(&self, namespace: Namespace, path: &str, ctx: &EvalContext)
        -> Option<Value>;
}

/// The fixed provider chain, most specific first
pub fn provider_chain() -> Vec<Box<dyn AttributeProvider>> {
    vec![
        Box::new(TimestampProvider),
        Box::new(TimespanProvider),
        Box::new(GeofenceProvider),
        Box::new(GenericProvider),
    ]
}

/// Resolve a path through the chain
pub async fn resolve(
    providers: &[Box<dyn AttributeProvider>],
    namespace: Namespace,
    path: &str,
    ctx: &EvalContext,
) -> Option<Value> {
    for provider in providers {
        if let Some(value) = provider.try_resolve(namespace, path, ctx).await {
            return Some(value);
        }
    }
    None
}

/// Resolves `$.timestamp` to the current epoch second
pub struct TimestampProvider;

#[async_trait]
impl AttributeProvider for TimestampProvider {
    async fn try_resolve(&self, _ns: Namespace, path: &str, _ctx: &EvalContext) -> Option<Value> {
        if path != "$.timestamp" {
            return None;
        }
        Some(Value::from(Utc::now().timestamp()))
    }
}

/// Resolves `$.timespan: N` (resource namespace) to the number of times the
/// requesting user accessed the thing within the last N seconds.
pub struct TimespanProvider;

#[async_trait]
impl AttributeProvider for TimespanProvider {
    async fn try_resolve(&self, ns: Namespace, path: &str, ctx: &EvalContext) -> Option<Value> {
        if ns != Namespace::Resource {
            return None;
        }
        let spec = path.strip_prefix("$.timespan")?;
        let seconds: i64 = spec.trim_start_matches(':').trim().parse().ok()?;
        let since = Utc::now() - Duration::seconds(seconds);
        let count = ctx
            .registry
            .accesses_since(&ctx.thing_id, &ctx.user_id, since);
        Some(Value::from(count as u64))
    }
}

/// Resolves `$.geo:x1,y1 x2,y2 ...` (subject namespace) to 1 when the user's
/// cached position lies inside the polygon, 0 otherwise.
pub struct GeofenceProvider;

#[async_trait]
impl AttributeProvider for GeofenceProvider {
    async fn try_resolve(&self, ns: Namespace, path: &str, ctx: &EvalContext) -> Option<Value> {
        if ns != Namespace::Subject {
            return None;
        }
        let spec = path.strip_prefix("$.geo:")?;
        let polygon = parse_polygon_spec(spec)?;
        let position = ctx
            .attributes
            .get(&ctx.user_id, AttributeSpace::User, "position")
            .await?;
        let coords = position.as_array()?;
        let point = [coords.first()?.as_f64()?, coords.get(1)?.as_f64()?];
        Some(Value::from(u8::from(point_in_polygon(point, &polygon))))
    }
}

/// Parse the polygon literal of a geofence path: whitespace-separated
/// `x,y` pairs, optionally wrapped in brackets or parentheses.
fn parse_polygon_spec(spec: &str) -> Option<Vec<[f64; 2]>> {
    let trimmed = spec
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let mut vertices = Vec::new();
    for pair in trimmed.split_whitespace() {
        let (x, y) = pair.split_once(',')?;
        vertices.push([x.trim().parse().ok()?, y.trim().parse().ok()?]);
    }
    if vertices.len() < 3 {
        return None;
    }
    Some(vertices)
}

/// Ray-casting point-in-polygon test. Boundary behavior follows the usual
/// even-odd rule; degenerate polygons (fewer than 3 vertices) contain nothing.
pub fn point_in_polygon(point: [f64; 2], polygon: &[[f64; 2]]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let [px, py] = point;
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Fallback: extract the attribute name from the path and look it up in the
/// user namespace, then the server namespace.
pub struct GenericProvider;

#[async_trait]
impl AttributeProvider for GenericProvider {
    async fn try_resolve(&self, _ns: Namespace, path: &str, ctx: &EvalContext) -> Option<Value> {
        let name = attribute_name(path)?;
        if let Some(value) = ctx
            .attributes
            .get(&ctx.user_id, AttributeSpace::User, &name)
            .await
        {
            return Some(value);
        }
        ctx.attributes
            .get(&ctx.user_id, AttributeSpace::Server, &name)
            .await
    }
}

/// First alphabetic run of a rule path, lowercased (`$.phone_number` ->
/// `phone_number`).
pub fn attribute_name(path: &str) -> Option<String> {
    let start = path.find(|c: char| c.is_ascii_alphabetic() || c == '_')?;
    let rest = &path[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    Some(rest[..end].to_ascii_lowercase())
}
