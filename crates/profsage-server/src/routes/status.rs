//! Readiness and configuration summary.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use profsage_chat::pipeline::TOP_K;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/chat/status", get(get_status))
}

/// GET /api/chat/status — which upstreams are configured. Never exposes keys.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = &state.config;

    Json(serde_json::json!({
        "ready": state.is_ready(),
        "embeddingConfigured": config.openai_api_key.is_some(),
        "indexConfigured": config.pinecone_api_key.is_some(),
        "embeddingModel": config.embedding_model,
        "chatModel": config.chat_model,
        "indexName": config.index_name,
        "namespace": config.namespace,
        "topK": TOP_K,
    }))
}
