//! OpenAI embeddings and streaming chat completions.

use async_trait::async_trait;
use profsage_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::services::{ChunkStream, Embedder, Generator};
use crate::sse::{SseDecoder, SseLine};
use crate::types::{ChatMessage, GenerationChunk};

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Embedding client for `POST {base_url}/embeddings`.
#[derive(Clone)]
pub struct OpenAIEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIEmbedder {
    pub fn new(client: Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        debug!("Embedding {} chars with model {}", text.len(), self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "input": text,
                "encoding_format": "float",
            }))
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("API error {}: {}", status, body)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Invalid response: {}", e)))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("Response contained no embedding".into()))
    }
}

/// Streaming chat client for `POST {base_url}/chat/completions`.
#[derive(Clone)]
pub struct OpenAIChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIChat {
    pub fn new(client: Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Generator for OpenAIChat {
    async fn generate(&self, messages: Vec<ChatMessage>) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            "Streaming from {} with model {} ({} messages)",
            url,
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| Error::Generation(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("API error {}: {}", status, body)));
        }

        let mut bytes_stream = Box::pin(response.bytes_stream());

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = bytes_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(Error::Generation(format!("Stream read error: {}", e)));
                        return;
                    }
                };

                for line in decoder.push(&bytes) {
                    match line {
                        SseLine::Done => return,
                        SseLine::Data(data) => match parse_chunk(&data) {
                            Ok(chunk) => yield Ok(chunk),
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        },
                    }
                }
            }

            // Body ended without [DONE]
            if let Some(SseLine::Data(data)) = decoder.finish() {
                match parse_chunk(&data) {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one `data:` payload into a chunk. A non-null `error` field or a
/// payload that is not a completion chunk is an error.
fn parse_chunk(data: &str) -> Result<GenerationChunk> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| Error::Generation(format!("Malformed chunk: {}", e)))?;

    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let msg = err["message"].as_str().unwrap_or("Unknown error");
        warn!("OpenAI stream error: {}", msg);
        return Err(Error::Generation(msg.to_string()));
    }

    let chunk: CompletionChunk = serde_json::from_value(value)
        .map_err(|e| Error::Generation(format!("Malformed chunk: {}", e)))?;

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content);

    Ok(GenerationChunk { delta })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_delta() {
        let chunk = parse_chunk(r#"{"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#).unwrap();
        assert_eq!(chunk, GenerationChunk::text("Hello"));
    }

    #[test]
    fn test_parse_role_only_and_finish_chunks() {
        let role = parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(role.delta, None);

        let finish = parse_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(finish.delta, None);

        let usage = parse_chunk(r#"{"choices":[],"usage":{"total_tokens":12}}"#).unwrap();
        assert_eq!(usage.delta, None);
    }

    #[test]
    fn test_parse_error_payload() {
        let err = parse_chunk(r#"{"error":{"message":"overloaded","type":"server_error"}}"#)
            .unwrap_err();
        match err {
            Error::Generation(msg) => assert_eq!(msg, "overloaded"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_null_error_field_is_content() {
        let chunk =
            parse_chunk(r#"{"choices":[{"delta":{"content":"Hi"}}],"error":null}"#).unwrap();
        assert_eq!(chunk, GenerationChunk::text("Hi"));
    }

    #[test]
    fn test_parse_malformed_payload() {
        assert!(matches!(parse_chunk("{not json"), Err(Error::Generation(_))));
        assert!(matches!(
            parse_chunk(r#"{"choices":"nope"}"#),
            Err(Error::Generation(_))
        ));
    }
}
