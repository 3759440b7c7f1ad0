//! Chat and retrieval types.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message in conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Stored metadata of a professor record in the index.
///
/// Records are written by an external loader, so every field is optional
/// and scalar values are kept in their text form: `4.5`, `"4.5"` and
/// `"unrated"` are all accepted for `stars`. `null` counts as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchMetadata {
    #[serde(default, deserialize_with = "lenient_text")]
    pub subject: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub stars: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub review: Option<String>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.as_f64().map(|f| f.to_string()).unwrap_or_else(|| n.to_string()),
        }),
        other => Some(other.to_string()),
    })
}

/// One nearest-neighbor hit. `id` is the professor's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub metadata: MatchMetadata,
}

/// A single chunk of a streamed completion. Role-only and finish chunks
/// carry no delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationChunk {
    pub delta: Option<String>,
}

impl GenerationChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
        }
    }

    pub fn empty() -> Self {
        Self { delta: None }
    }
}
