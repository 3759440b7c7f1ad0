//! Error types for ProfSage.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Conversation is empty: at least one message is required")]
    EmptyConversation,

    #[error("Missing credential: {0} is not configured")]
    MissingCredential(&'static str),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Timed out after {millis}ms waiting for {stage}")]
    Timeout { stage: &'static str, millis: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
