//! Claim token endpoints
//!
//! A directory issues claim tokens only for things it holds locally. The
//! token carries its own public key, so any party can check it, and it can
//! be delivered straight to another party's endpoint.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::server::http::{error_response, json_response, AppState, QueryParams};
use crate::token::{self, ClaimToken};
use crate::types::DirectoryError;

/// GET /claim_token?thing_id=&username=
pub fn issue(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let (Some(id), Some(username)) = (params.get("thing_id"), params.get("username")) else {
        return error_response(DirectoryError::BadRequest(
            "requires thing_id and username parameters".to_string(),
        ));
    };
    if state.registry.get(id).is_none() {
        return error_response(DirectoryError::NotFound(format!("thing '{}' not found", id)));
    }
    match state
        .tokens
        .issue(id, username)
        .and_then(|claim| serde_json::to_value(claim).map_err(Into::into))
    {
        Ok(claim) => json_response(StatusCode::OK, &claim),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SendBody {
    token: ClaimToken,
    url: String,
}

/// POST /claim_token_send — deliver one of our tokens to a remote endpoint
pub async fn send(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let send: SendBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!("invalid send body: {}", e)))
        }
    };
    // only forward tokens this node actually signed
    if send.token.public_key != state.tokens.verifying_key() {
        return error_response(DirectoryError::Unauthorized(
            "token was not issued by this directory".to_string(),
        ));
    }
    if let Err(e) = token::verify(&send.token, state.args.claim_max_age_seconds) {
        return error_response(e);
    }
    match state.client.post_json_ok(&send.url, &send.token).await {
        Ok(()) => json_response(StatusCode::OK, &json!({"status": "sent"})),
        Err(e) => error_response(e),
    }
}

/// POST /claim_token_verify — check a token against the key it carries
pub fn verify(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let claim: ClaimToken = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid claim token: {}",
                e
            )))
        }
    };
    match token::verify(&claim, state.args.claim_max_age_seconds) {
        Ok(()) => json_response(
            StatusCode::OK,
            &json!({
                "valid": true,
                "thing_id": claim.thing_id,
                "username": claim.username,
                "timestamp": claim.timestamp,
            }),
        ),
        Err(e) => error_response(e),
    }
}
