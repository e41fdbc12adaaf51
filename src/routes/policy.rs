//! Access policy endpoints
//!
//! Policies are managed per location. Decision requests that need attributes
//! the node has not cached are answered with 300 Multiple Choices and the
//! scope lists the client must fetch from its auth provider; the retry
//! carries the attribute values inline.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::abac::attributes::AttributeSpace;
use crate::abac::providers::EvalContext;
use crate::abac::{missing_scopes, AccessRequest, Policy};
use crate::server::http::{error_response, json_response, AppState};
use crate::types::DirectoryError;

#[derive(Deserialize)]
struct PolicyBody {
    /// The policy document; the uid is assigned here
    td: Value,
    #[serde(default)]
    location: Option<String>,
}

/// POST /policy {td, location?}
pub fn add_policy(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: PolicyBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!("invalid policy: {}", e)))
        }
    };
    let policy = match Policy::from_document(request.td) {
        Ok(policy) => policy,
        Err(e) => return error_response(e),
    };
    let uid = policy.uid.clone();
    let location = request
        .location
        .as_deref()
        .unwrap_or(state.topology.node_name());
    state.policies.add(location, policy);
    json_response(StatusCode::CREATED, &json!({"uid": uid}))
}

#[derive(Deserialize)]
struct DeletePolicyBody {
    uid: String,
    #[serde(default)]
    location: Option<String>,
}

/// POST /delete_policy {uid, location?}
pub fn delete_policy(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: DeletePolicyBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid policy deletion: {}",
                e
            )))
        }
    };
    let location = request
        .location
        .as_deref()
        .unwrap_or(state.topology.node_name());
    if state.policies.delete(location, &request.uid) {
        json_response(StatusCode::OK, &json!({"status": "deleted"}))
    } else {
        error_response(DirectoryError::NotFound(format!(
            "no policy '{}'",
            request.uid
        )))
    }
}

#[derive(Deserialize)]
struct DecisionBody {
    thing_id: String,
    /// Requesting user
    subject: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    location: Option<String>,
    /// Attribute values fetched by the client after a 300 answer
    #[serde(default)]
    attributes: Option<SubmittedAttributes>,
}

#[derive(Deserialize)]
struct SubmittedAttributes {
    #[serde(default)]
    user: Map<String, Value>,
    #[serde(default)]
    server: Map<String, Value>,
}

/// POST /policy_decision {thing_id, subject, action?, location?, attributes?}
///
/// Allowed requests answer with the thing itself and count as an access for
/// the timespan providers. Denied requests answer 400 carrying the subject id.
pub async fn decision(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: DecisionBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid decision request: {}",
                e
            )))
        }
    };
    let action = request.action.as_deref().unwrap_or("get");
    let location = request
        .location
        .as_deref()
        .unwrap_or(state.topology.node_name());

    let attributes_provided = request.attributes.is_some();
    if let Some(attrs) = request.attributes {
        for (name, value) in attrs.user {
            state
                .attributes
                .set(&request.subject, AttributeSpace::User, &name, value)
                .await;
        }
        for (name, value) in attrs.server {
            state
                .attributes
                .set(&request.subject, AttributeSpace::Server, &name, value)
                .await;
        }
    }

    let policies = state.policies.for_resource(location, &request.thing_id);
    let ctx = eval_context(state, &request.subject, &request.thing_id);

    // without fresh attributes in hand, ask the client to fetch the ones the
    // candidate policies need
    if !attributes_provided {
        let (user_scopes, server_scopes) = missing_scopes(&policies, &ctx).await;
        if !user_scopes.is_empty() || !server_scopes.is_empty() {
            return json_response(
                StatusCode::MULTIPLE_CHOICES,
                &json!({"user_scopes": user_scopes, "server_scopes": server_scopes}),
            );
        }
    }

    let access = AccessRequest {
        subject_id: request.subject.clone(),
        resource_id: request.thing_id.clone(),
        action_id: action.to_string(),
    };
    if !state.pdp.is_allowed(&policies, &access, &ctx).await {
        return json_response(StatusCode::BAD_REQUEST, &json!({"id": request.subject}));
    }

    state
        .registry
        .record_access(&request.thing_id, &request.subject);
    match state.registry.get(&request.thing_id) {
        Some(record) => json_response(StatusCode::OK, &record.to_value()),
        None => json_response(StatusCode::OK, &json!({"allowed": true})),
    }
}

#[derive(Deserialize)]
struct AttributeAuthBody {
    thing_id: String,
    subject: String,
    #[serde(default)]
    location: Option<String>,
}

/// POST /policy_attribute_auth {thing_id, subject, location?} — the scopes a
/// client would need before a decision can be made
pub async fn attribute_auth(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let request: AttributeAuthBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid attribute auth request: {}",
                e
            )))
        }
    };
    let location = request
        .location
        .as_deref()
        .unwrap_or(state.topology.node_name());
    let policies = state.policies.for_resource(location, &request.thing_id);
    let ctx = eval_context(state, &request.subject, &request.thing_id);

    let (user_scopes, server_scopes) = missing_scopes(&policies, &ctx).await;
    let status = if user_scopes.is_empty() && server_scopes.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::MULTIPLE_CHOICES
    };
    json_response(
        status,
        &json!({"user_scopes": user_scopes, "server_scopes": server_scopes}),
    )
}

fn eval_context(state: &AppState, user: &str, thing_id: &str) -> EvalContext {
    EvalContext {
        user_id: user.to_string(),
        thing_id: thing_id.to_string(),
        registry: Arc::clone(&state.registry),
        attributes: Arc::clone(&state.attributes),
    }
}
