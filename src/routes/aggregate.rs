//! Type index propagation endpoints
//!
//! Children call these on their parent when a directory in their subtree
//! gains its first, or loses its last, thing of a type.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::server::http::{error_response, json_response, AppState, QueryParams};
use crate::types::DirectoryError;

#[derive(Deserialize)]
struct AggregateBody {
    thing_type: String,
    location: String,
}

/// POST /update_aggregate — a descendant now holds things of a type
pub async fn type_added(state: &AppState, body: &Bytes) -> Response<Full<Bytes>> {
    let update: AggregateBody = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(DirectoryError::BadRequest(format!(
                "invalid aggregate update: {}",
                e
            )))
        }
    };
    state
        .engine
        .apply_type_added(&update.thing_type, &update.location)
        .await;
    json_response(StatusCode::OK, &json!({"status": "indexed"}))
}

/// DELETE /update_aggregate?thing_type=&location= — a descendant's last thing
/// of a type is gone
pub async fn type_removed(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let (Some(thing_type), Some(location)) =
        (params.get("thing_type"), params.get("location"))
    else {
        return error_response(DirectoryError::BadRequest(
            "requires thing_type and location parameters".to_string(),
        ));
    };
    state.engine.apply_type_removed(thing_type, location).await;
    json_response(StatusCode::OK, &json!({"status": "unindexed"}))
}
