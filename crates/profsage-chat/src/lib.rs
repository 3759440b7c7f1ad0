//! RAG chat service for professor recommendations.
//!
//! The latest user message is embedded (OpenAI), matched against a Pinecone
//! index of professor reviews, spliced into the conversation and sent to a
//! streaming chat completion whose deltas are relayed to the caller.

pub mod openai;
pub mod pinecone;
pub mod pipeline;
pub mod prompt;
pub mod services;
pub mod sse;
pub mod types;

pub use pipeline::RagPipeline;
pub use services::{ChunkStream, Embedder, Generator, VectorIndex};
pub use types::*;
