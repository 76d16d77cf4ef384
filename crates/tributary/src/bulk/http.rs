//! HTTP client for the index server
//!
//! Speaks the Elasticsearch-compatible REST API: NDJSON `_bulk`, cluster
//! health, index admin and the partial-update calls used by the state store.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{debug, warn};

use super::action::{BulkRequest, BulkResponse};
use super::transport::{BulkTransport, HealthStatus, IndexAdmin};
use crate::error::{Error, Result};
use crate::state::index::StateDocuments;
use crate::types::SensitiveString;

/// Maximum number of state documents returned by one listing
const STATE_LIST_SIZE: usize = 10_000;

/// Connection settings of the index server
#[derive(Debug, Clone)]
pub struct HttpIndexConfig {
    /// Base URL, e.g. `http://localhost:9200`
    pub url: String,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<SensitiveString>,
    /// Timeout of a single request
    pub request_timeout: Duration,
}

impl Default for HttpIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-based index server client
#[derive(Clone)]
pub struct HttpIndexClient {
    client: reqwest::Client,
    base: String,
    username: Option<String>,
    password: Option<SensitiveString>,
}

impl HttpIndexClient {
    /// Build a client
    pub fn new(config: &HttpIndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        let request = self.client.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref().map(|p| p.expose_secret())),
            None => request,
        }
    }
}

impl std::fmt::Debug for HttpIndexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIndexClient")
            .field("base", &self.base)
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

/// Turn a non-success response into an error carrying status and body
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::IndexServer(format!("{}: {}", status, body)))
}

#[async_trait]
impl BulkTransport for HttpIndexClient {
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse> {
        let response = self
            .request(Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(request.body())
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!("bulk request failed: {} {}", status, body)));
        }
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("unreadable bulk response: {}", e)))?;
        BulkResponse::from_json(&body)
    }
}

#[async_trait]
impl IndexAdmin for HttpIndexClient {
    async fn wait_for_health(&self, status: HealthStatus, timeout: Duration) -> Result<()> {
        debug!(%status, timeout_secs = timeout.as_secs(), "waiting for cluster health");
        let response = self
            .request(Method::GET, "_cluster/health")
            .query(&[
                ("wait_for_status", status.to_string()),
                ("timeout", format!("{}s", timeout.as_secs().max(1))),
            ])
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await?;
        let body: JsonValue = check(response).await?.json().await?;

        if body.get("timed_out").and_then(JsonValue::as_bool) == Some(true) {
            let actual = body.get("status").and_then(JsonValue::as_str).unwrap_or("unknown");
            return Err(Error::IndexServer(format!(
                "cluster health {} did not reach {} within {:?}",
                actual, status, timeout
            )));
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self.request(Method::HEAD, index).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(Error::IndexServer(format!("checking index {}: {}", index, s))),
        }
    }

    async fn create_index(
        &self,
        index: &str,
        settings: Option<&JsonValue>,
        mappings: Option<&JsonValue>,
    ) -> Result<()> {
        let mut body = json!({});
        if let Some(settings) = settings {
            body["settings"] = settings.clone();
        }
        if let Some(mappings) = mappings {
            body["mappings"] = mappings.clone();
        }
        let response = self.request(Method::PUT, index).json(&body).send().await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if text.contains("resource_already_exists_exception") {
                warn!(index, "index was created concurrently");
                return Ok(());
            }
            return Err(Error::IndexServer(format!("creating index {}: {}", index, text)));
        }
        check(response).await?;
        Ok(())
    }

    async fn index_settings(&self, index: &str) -> Result<JsonValue> {
        let response = self
            .request(Method::GET, &format!("{}/_settings", index))
            .query(&[("flat_settings", "true")])
            .send()
            .await?;
        let body: JsonValue = check(response).await?.json().await?;
        // Keyed by concrete index name, which differs when `index` is an alias.
        Ok(body
            .as_object()
            .and_then(|m| m.values().next())
            .and_then(|v| v.get("settings"))
            .cloned()
            .unwrap_or_else(|| json!({})))
    }

    async fn update_settings(&self, index: &str, settings: &JsonValue) -> Result<()> {
        let response = self
            .request(Method::PUT, &format!("{}/_settings", index))
            .json(settings)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("{}/_refresh", index))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl StateDocuments for HttpIndexClient {
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<JsonValue>> {
        let response = self
            .request(Method::GET, &format!("{}/_doc/{}", index, id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: JsonValue = check(response).await?.json().await?;
        Ok(body.get("_source").cloned())
    }

    async fn upsert_partial(&self, index: &str, id: &str, patch: &JsonValue) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("{}/_update/{}", index, id))
            .query(&[("refresh", "true")])
            .json(&json!({ "doc": patch, "doc_as_upsert": true }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list_documents(&self, index: &str) -> Result<Vec<JsonValue>> {
        let response = self
            .request(Method::POST, &format!("{}/_search", index))
            .json(&json!({ "size": STATE_LIST_SIZE, "query": { "match_all": {} } }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: JsonValue = check(response).await?.json().await?;
        Ok(body
            .pointer("/hits/hits")
            .and_then(JsonValue::as_array)
            .map(|hits| hits.iter().filter_map(|h| h.get("_source").cloned()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trimmed() {
        let client = HttpIndexClient::new(&HttpIndexConfig {
            url: "http://search:9200/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://search:9200");
    }

    #[test]
    fn test_debug_redacts_password() {
        let client = HttpIndexClient::new(&HttpIndexConfig {
            username: Some("elastic".into()),
            password: Some(SensitiveString::new("changeme")),
            ..Default::default()
        })
        .unwrap();
        let debug = format!("{:?}", client);
        assert!(debug.contains("elastic"));
        assert!(!debug.contains("changeme"));
    }
}
