//! Narrow interfaces over the three external collaborators.
//!
//! The pipeline only talks to these traits, so tests swap in in-memory
//! fakes and the HTTP clients stay out of the orchestration logic.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use profsage_core::Result;

use crate::types::{ChatMessage, GenerationChunk, Match};

/// Boxed stream of completion chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerationChunk>> + Send>>;

/// Turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Nearest-neighbor lookup over the professor index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` matches with metadata, nearest first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>>;
}

/// Streaming chat completion.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Resolves once the upstream accepted the request. Failures after that
    /// point arrive as `Err` items on the stream.
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<ChunkStream>;
}
