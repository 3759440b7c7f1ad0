//! Service configuration: optional JSON file, then environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PINECONE_CONTROL_PLANE: &str = "https://api.pinecone.io";
pub const DEFAULT_INDEX_NAME: &str = "rag";
pub const DEFAULT_NAMESPACE: &str = "ns1";

/// Per-stage timeouts for the three outbound calls, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_embed_secs")]
    pub embed_secs: u64,
    #[serde(default = "default_query_secs")]
    pub query_secs: u64,
    /// Covers opening the generation stream, not the whole stream.
    #[serde(default = "default_generation_secs")]
    pub generation_secs: u64,
}

fn default_embed_secs() -> u64 {
    10
}
fn default_query_secs() -> u64 {
    10
}
fn default_generation_secs() -> u64 {
    30
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            embed_secs: default_embed_secs(),
            query_secs: default_query_secs(),
            generation_secs: default_generation_secs(),
        }
    }
}

impl Timeouts {
    pub fn embed(&self) -> Duration {
        Duration::from_secs(self.embed_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }
}

/// Top-level ProfSage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfSageConfig {
    /// HTTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default)]
    pub pinecone_api_key: Option<String>,
    /// Data-plane host of the index. Looked up from the control plane when unset.
    #[serde(default)]
    pub pinecone_index_host: Option<String>,
    #[serde(default = "default_control_plane")]
    pub pinecone_control_plane: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_openai_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.into()
}
fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.into()
}
fn default_chat_model() -> String {
    DEFAULT_CHAT_MODEL.into()
}
fn default_control_plane() -> String {
    DEFAULT_PINECONE_CONTROL_PLANE.into()
}
fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.into()
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

impl Default for ProfSageConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            embedding_model: default_embedding_model(),
            chat_model: default_chat_model(),
            pinecone_api_key: None,
            pinecone_index_host: None,
            pinecone_control_plane: default_control_plane(),
            index_name: default_index_name(),
            namespace: default_namespace(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ProfSageConfig {
    /// Load configuration from the process environment, reading the JSON
    /// file named by `PROFSAGE_CONFIG` first when it is set.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("PROFSAGE_CONFIG").ok();
        Self::load(path.as_deref().map(Path::new), |key| std::env::var(key).ok())
    }

    /// Load from an optional JSON file, then apply overrides from `lookup`.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let config: ProfSageConfig = serde_json::from_str(&raw)?;
                info!("Loaded config from {}", path.display());
                config
            }
            None => ProfSageConfig::default(),
        };

        config.apply_overrides(lookup)?;
        config.drop_blank_values();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides. Unset or blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = get("PINECONE_API_KEY") {
            self.pinecone_api_key = Some(v);
        }
        if let Some(v) = get("PORT") {
            self.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.openai_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = get("CHAT_MODEL") {
            self.chat_model = v;
        }
        if let Some(v) = get("PINECONE_INDEX") {
            self.index_name = v;
        }
        if let Some(v) = get("PINECONE_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = get("PINECONE_INDEX_HOST") {
            self.pinecone_index_host = Some(v);
        }
        if let Some(v) = get("PINECONE_CONTROL_PLANE") {
            self.pinecone_control_plane = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("EMBED_TIMEOUT_SECS") {
            self.timeouts.embed_secs = parse_var("EMBED_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("QUERY_TIMEOUT_SECS") {
            self.timeouts.query_secs = parse_var("QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("GENERATION_TIMEOUT_SECS") {
            self.timeouts.generation_secs = parse_var("GENERATION_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Treat empty or whitespace-only keys and hosts as unset, wherever
    /// they came from.
    fn drop_blank_values(&mut self) {
        for slot in [
            &mut self.openai_api_key,
            &mut self.pinecone_api_key,
            &mut self.pinecone_index_host,
        ] {
            if slot.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *slot = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.embed_secs == 0 || t.query_secs == 0 || t.generation_secs == 0 {
            return Err(Error::Config("timeouts must be at least 1 second".into()));
        }
        Ok(())
    }

    /// Names of required credentials that are not configured.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.openai_api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        if self.pinecone_api_key.is_none() {
            missing.push("PINECONE_API_KEY");
        }
        missing
    }

    /// JSON view of the config with API keys masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        for key in ["openai_api_key", "pinecone_api_key"] {
            if let Some(slot) = value.get_mut(key) {
                if let Some(secret) = slot.as_str() {
                    *slot = serde_json::Value::String(mask(secret));
                }
            }
        }
        value
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw)))
}

/// Keep the last four characters of a secret.
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".into();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
