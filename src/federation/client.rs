//! Outbound peer client
//!
//! One shared reqwest client with a bounded timeout for every node-to-node
//! call. Helpers return `Upstream` errors; fan-out callers downgrade those to
//! skipped hops.

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::types::{DirectoryError, Result};

/// Join an endpoint path onto a peer base URL
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// HTTP client for peer directory calls
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// POST a JSON body, returning the response status
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<StatusCode> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DirectoryError::Upstream(format!("POST {}: {}", url, e)))?;
        Ok(response.status())
    }

    /// POST a JSON body and require a 2xx response
    pub async fn post_json_ok<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let status = self.post_json(url, body).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(DirectoryError::Upstream(format!("POST {} returned {}", url, status)))
        }
    }

    /// GET a URL and parse the JSON body (non-2xx is an upstream error)
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DirectoryError::Upstream(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Upstream(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| DirectoryError::Upstream(format!("GET {}: invalid JSON: {}", url, e)))
    }

    /// DELETE a URL, returning the response status
    pub async fn delete(&self, url: &str) -> Result<StatusCode> {
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| DirectoryError::Upstream(format!("DELETE {}: {}", url, e)))?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(join_url("http://b:8080", "register"), "http://b:8080/register");
        assert_eq!(join_url("http://b:8080/", "/register"), "http://b:8080/register");
    }
}
