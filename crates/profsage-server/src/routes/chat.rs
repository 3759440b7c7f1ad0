//! Chat route — retrieval-augmented answer streamed as plain text.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::Stream;
use profsage_chat::pipeline::DeltaStream;
use profsage_chat::ChatMessage;
use profsage_core::Error;
use tokio_stream::StreamExt;
use tracing::{error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/chat", post(chat))
}

/// POST /api/chat — body is the conversation, oldest message first.
///
/// Retrieval and opening the completion happen before the response starts,
/// so their failures become JSON error responses. Once streaming begins,
/// an upstream failure aborts the body; bytes already sent stay sent.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(messages): Json<Vec<ChatMessage>>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id, turns = messages.len());
    respond(&state, &messages).instrument(span).await
}

async fn respond(state: &AppState, messages: &[ChatMessage]) -> Result<Response, ApiError> {
    if messages.is_empty() {
        return Err(Error::EmptyConversation.into());
    }

    let pipeline = state.pipeline()?;
    let deltas = pipeline.answer(messages).await?;
    info!("Streaming answer");

    let body = Body::from_stream(log_outcome(deltas, Span::current()));
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Pass deltas through unchanged, logging how the stream ended.
fn log_outcome(
    mut deltas: DeltaStream,
    span: Span,
) -> impl Stream<Item = Result<Bytes, Error>> + Send + 'static {
    async_stream::stream! {
        let mut sent = 0usize;
        while let Some(item) = deltas.next().await {
            match item {
                Ok(bytes) => {
                    sent += bytes.len();
                    yield Ok(bytes);
                }
                Err(e) => {
                    error!(parent: &span, "Stream aborted after {} bytes: {}", sent, e);
                    yield Err(e);
                    return;
                }
            }
        }
        info!(parent: &span, "Stream complete ({} bytes)", sent);
    }
}
