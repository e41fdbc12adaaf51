//! Directory operations: registration, deletion, relocation, search, and
//! topology administration

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::federation::{SearchOutcome, SearchParams};
use crate::model::Relationship;
use crate::server::http::{
    error_response, json_response, redirect_response, AppState, QueryParams,
};
use crate::types::DirectoryError;

#[derive(Deserialize)]
struct RegisterBody {
    /// The thing description document
    td: Value,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    publicity: Option<u32>,
}

/// POST /register {td, location?, publicity?}
pub async fn register(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: RegisterBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid registration: {}",
                e
            )))
        }
    };
    let publicity = request
        .publicity
        .or_else(|| {
            request
                .td
                .get("publicity")
                .and_then(Value::as_u64)
                .map(|p| p as u32)
        })
        .unwrap_or(0);

    match state
        .engine
        .register(request.td, publicity, request.location.as_deref())
        .await
    {
        Ok(()) => json_response(StatusCode::CREATED, &json!({"status": "registered"})),
        Err(e) => error_response(e),
    }
}

/// DELETE /delete?thing_id=&location=
pub async fn delete(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let Some(id) = params.get("thing_id") else {
        return error_response(DirectoryError::BadRequest(
            "missing thing_id parameter".to_string(),
        ));
    };
    match state.engine.delete(id, params.get("location")).await {
        Ok(()) => json_response(StatusCode::OK, &json!({"status": "deleted"})),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RelocateBody {
    thing_id: String,
    from: String,
    to: String,
}

/// POST /relocate {thing_id, from, to}
pub async fn relocate(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: RelocateBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid relocation: {}",
                e
            )))
        }
    };
    match state
        .engine
        .relocate(&request.thing_id, &request.from, &request.to)
        .await
    {
        Ok(()) => json_response(StatusCode::OK, &json!({"status": "relocated"})),
        Err(e) => error_response(e),
    }
}

/// GET /search?thing_type=&thing_id=&location=&user=&iterative=
pub async fn search(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let search = SearchParams {
        thing_type: params.get("thing_type").map(str::to_string),
        thing_id: params.get("thing_id").map(str::to_string),
        location: params.get("location").map(str::to_string),
        user: params.get("user").map(str::to_string),
        iterative: params.flag("iterative"),
    };
    match state.engine.search(&search).await {
        Ok(SearchOutcome::Results(results)) => {
            json_response(StatusCode::OK, &Value::Array(results))
        }
        Ok(SearchOutcome::Redirect(url)) => redirect_response(&url),
        Err(e) => error_response(e),
    }
}

/// GET /adjacent_directory — this node's parent and children
pub fn adjacent(state: &AppState) -> Response<Full<Bytes>> {
    match serde_json::to_value(state.topology.adjacent()) {
        Ok(links) => json_response(StatusCode::OK, &links),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Deserialize)]
struct AdjacentBody {
    name: String,
    url: String,
    relationship: Relationship,
    /// Descendant names reachable through this directory
    #[serde(default)]
    aliases: Vec<String>,
}

/// POST /adjacent_directory — attach a directory at runtime. A child may
/// announce its descendants, which become aliases for downward routing.
pub fn add_adjacent(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let link: AdjacentBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid adjacent directory: {}",
                e
            )))
        }
    };
    if link.relationship == Relationship::Parent && !link.aliases.is_empty() {
        return error_response(DirectoryError::BadRequest(
            "aliases only apply to child directories".to_string(),
        ));
    }
    state
        .topology
        .add_link(&link.name, &link.url, link.relationship);
    for alias in &link.aliases {
        state.topology.add_alias(alias, &link.name);
    }
    json_response(StatusCode::CREATED, &json!({"status": "linked"}))
}

#[derive(Deserialize)]
struct AliasBody {
    target: String,
    child: String,
}

/// POST /alias — map a descendant name to a direct child
pub fn add_alias(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let alias: AliasBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!("invalid alias: {}", e)))
        }
    };
    if state.topology.child_url(&alias.child).is_none() {
        return error_response(DirectoryError::BadRequest(format!(
            "'{}' is not a known child directory",
            alias.child
        )));
    }
    state.topology.add_alias(&alias.target, &alias.child);
    json_response(StatusCode::CREATED, &json!({"status": "aliased"}))
}

/// DELETE /alias?target= — explicit alias pruning
pub fn remove_alias(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let Some(target) = params.get("target") else {
        return error_response(DirectoryError::BadRequest(
            "missing target parameter".to_string(),
        ));
    };
    if state.topology.remove_alias(target) {
        json_response(StatusCode::OK, &json!({"status": "pruned"}))
    } else {
        error_response(DirectoryError::NotFound(format!("no alias for '{}'", target)))
    }
}
