//! Liveness and version endpoints

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::server::http::{json_response, AppState};

pub fn health(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "healthy": true,
            "directory": state.topology.node_name(),
            "adjacent": state.topology.adjacent().len(),
            "things": state.registry.find(None, None).len(),
        }),
    )
}

pub fn version() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}
