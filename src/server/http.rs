//! HTTP server implementation
//!
//! hyper http1 with TokioIo, one spawned task per connection. All endpoints
//! exchange JSON; routing is a flat method/path match.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::abac::attributes::{AttributeDirectory, MemoryAttributeDirectory};
use crate::abac::{DecisionEngine, PolicyStore};
use crate::config::Args;
use crate::federation::{Engine, PeerClient};
use crate::registry::Registry;
use crate::routes;
use crate::token::TokenIssuer;
use crate::topology::TopologyStore;
use crate::types::{DirectoryError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub topology: Arc<TopologyStore>,
    pub registry: Arc<Registry>,
    pub policies: Arc<PolicyStore>,
    pub attributes: Arc<dyn AttributeDirectory>,
    pub pdp: DecisionEngine,
    pub engine: Engine,
    pub client: PeerClient,
    pub tokens: TokenIssuer,
}

impl AppState {
    pub fn new(args: Args) -> Result<Self> {
        let topology = Arc::new(TopologyStore::from_args(&args)?);
        let registry = Arc::new(Registry::new());
        let client = PeerClient::new(args.request_timeout_ms);
        let engine = Engine::new(
            Arc::clone(&topology),
            Arc::clone(&registry),
            client.clone(),
        );
        Ok(Self {
            args,
            topology,
            registry,
            policies: Arc::new(PolicyStore::new()),
            attributes: Arc::new(MemoryAttributeDirectory::new()),
            pdp: DecisionEngine::new(),
            engine,
            client,
            tokens: TokenIssuer::generate(),
        })
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Arbor listening on {} as directory {}",
        state.args.listen,
        state.topology.node_name()
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let params = QueryParams::parse(req.uri().query());

    debug!("[{}] {} {}", addr, method, path);

    let body = req.collect().await?.to_bytes();

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") => routes::health::health(&state),
        (Method::GET, "/version") => routes::health::version(),

        (Method::POST, "/register") => routes::directory::register(&state, &body).await,
        (Method::DELETE, "/delete") => routes::directory::delete(&state, &params).await,
        (Method::POST, "/relocate") => routes::directory::relocate(&state, &body).await,
        (Method::GET, "/search") => routes::directory::search(&state, &params).await,

        (Method::GET, "/adjacent_directory") => routes::directory::adjacent(&state),
        (Method::POST, "/adjacent_directory") => routes::directory::add_adjacent(&state, &body),
        (Method::POST, "/alias") => routes::directory::add_alias(&state, &body),
        (Method::DELETE, "/alias") => routes::directory::remove_alias(&state, &params),

        (Method::POST, "/update_aggregate") => routes::aggregate::type_added(&state, &body).await,
        (Method::DELETE, "/update_aggregate") => {
            routes::aggregate::type_removed(&state, &params).await
        }

        (Method::GET, "/custom_query") => routes::query::custom_query(&state, &params).await,

        (Method::POST, "/policy") => routes::policy::add_policy(&state, &body),
        (Method::POST, "/delete_policy") => routes::policy::delete_policy(&state, &body),
        (Method::POST, "/policy_decision") => routes::policy::decision(&state, &body).await,
        (Method::POST, "/policy_attribute_auth") => {
            routes::policy::attribute_auth(&state, &body).await
        }

        (Method::GET, "/claim_token") => routes::token_routes::issue(&state, &params),
        (Method::POST, "/claim_token_send") => routes::token_routes::send(&state, &body).await,
        (Method::POST, "/claim_token_verify") => routes::token_routes::verify(&state, &body),

        (Method::OPTIONS, _) => preflight_response(),

        _ => not_found_response(&path),
    };
    Ok(response)
}

/// Decoded query string parameters
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let mut pairs = Vec::new();
        for piece in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = piece.split_once('=').unwrap_or((piece, ""));
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            pairs.push((key.to_string(), value));
        }
        Self(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Boolean flag: present and not explicitly disabled
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v != "false" && v != "0")
    }
}

/// JSON response with an explicit status
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Map a directory error onto its HTTP shape
pub fn error_response(err: DirectoryError) -> Response<Full<Bytes>> {
    let (status, message) = err.into_status_code_and_body();
    json_response(status, &serde_json::json!({"error": message}))
}

/// Redirect for iterative resolution
pub fn redirect_response(url: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header("Location", url)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({"error": "Not Found", "path": path}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_decode() {
        let params = QueryParams::parse(Some("type=sensor&location=level%202&iterative"));
        assert_eq!(params.get("type"), Some("sensor"));
        assert_eq!(params.get("location"), Some("level 2"));
        assert!(params.flag("iterative"));
        assert!(!params.flag("missing"));
    }

    #[test]
    fn test_query_params_flag_disabled() {
        let params = QueryParams::parse(Some("iterative=false"));
        assert!(!params.flag("iterative"));
    }
}
