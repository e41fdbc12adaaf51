//! Custom aggregation query endpoint

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use crate::federation::QueryScript;
use crate::server::http::{error_response, json_response, AppState, QueryParams};
use crate::types::DirectoryError;

/// GET /custom_query?data=<json script>
pub async fn custom_query(state: &AppState, params: &QueryParams) -> Response<Full<Bytes>> {
    let Some(raw) = params.get("data") else {
        return error_response(DirectoryError::BadRequest(
            "missing data parameter".to_string(),
        ));
    };
    let script = match QueryScript::parse(raw) {
        Ok(script) => script,
        Err(e) => return error_response(e),
    };
    match state.engine.custom_query(&script).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => error_response(e),
    }
}
