//! Pinecone vector index queries.

use async_trait::async_trait;
use profsage_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::services::VectorIndex;
use crate::types::Match;

pub const API_VERSION: &str = "2024-07";

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<Match>,
}

#[derive(Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

/// Query client bound to one index and namespace.
pub struct PineconeIndex {
    client: Client,
    api_key: String,
    control_plane: String,
    index_name: String,
    namespace: String,
    host: OnceCell<String>,
}

impl PineconeIndex {
    pub fn new(
        client: Client,
        api_key: &str,
        control_plane: &str,
        index_name: &str,
        namespace: &str,
    ) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            control_plane: control_plane.trim_end_matches('/').to_string(),
            index_name: index_name.to_string(),
            namespace: namespace.to_string(),
            host: OnceCell::new(),
        }
    }

    /// Use a known data-plane host instead of asking the control plane.
    pub fn with_host(self, host: &str) -> Self {
        Self {
            host: OnceCell::new_with(Some(normalize_host(host))),
            ..self
        }
    }

    /// Data-plane base URL, looked up once and cached.
    async fn host(&self) -> Result<&str> {
        let host = self
            .host
            .get_or_try_init(|| self.describe_index())
            .await?;
        Ok(host.as_str())
    }

    async fn describe_index(&self) -> Result<String> {
        let url = format!("{}/indexes/{}", self.control_plane, self.index_name);
        debug!("Resolving Pinecone host for index {}", self.index_name);

        let response = self
            .client
            .get(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| Error::VectorIndex(format!("Describe index failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::VectorIndex(format!("API error {}: {}", status, body)));
        }

        let described: DescribeIndexResponse = response
            .json()
            .await
            .map_err(|e| Error::VectorIndex(format!("Invalid describe response: {}", e)))?;

        let host = normalize_host(&described.host);
        info!("Pinecone index {} served from {}", self.index_name, host);
        Ok(host)
    }
}

/// Control-plane hosts come without a scheme.
fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>> {
        let url = format!("{}/query", self.host().await?);
        debug!(
            "Querying {} (namespace {}) for top {} of {}-dim vector",
            url,
            self.namespace,
            top_k,
            vector.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&json!({
                "namespace": self.namespace,
                "vector": vector,
                "topK": top_k,
                "includeMetadata": true,
            }))
            .send()
            .await
            .map_err(|e| Error::VectorIndex(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::VectorIndex(format!("API error {}: {}", status, body)));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::VectorIndex(format!("Invalid response: {}", e)))?;

        Ok(parsed.matches)
    }
}
