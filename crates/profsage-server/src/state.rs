//! Shared application state.

use profsage_chat::RagPipeline;
use profsage_core::{Error, ProfSageConfig, Result};
use tracing::warn;

/// Shared application state accessible from all route handlers.
///
/// Holds no per-request data: every conversation lives only for the
/// duration of its request.
pub struct AppState {
    pub config: ProfSageConfig,
    pipeline: Option<RagPipeline>,
}

impl AppState {
    /// Build state from configuration. Missing API keys do not prevent
    /// startup; chat requests fail with 503 until they are configured.
    pub fn new(config: ProfSageConfig) -> Result<Self> {
        let pipeline = match RagPipeline::from_config(&config) {
            Ok(p) => Some(p),
            Err(Error::MissingCredential(name)) => {
                warn!("{} is not set; /api/chat will return 503", name);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Self { config, pipeline })
    }

    /// State around an already-wired pipeline.
    pub fn with_pipeline(config: ProfSageConfig, pipeline: RagPipeline) -> Self {
        Self {
            config,
            pipeline: Some(pipeline),
        }
    }

    pub fn pipeline(&self) -> Result<&RagPipeline> {
        match &self.pipeline {
            Some(p) => Ok(p),
            None => Err(Error::MissingCredential(
                self.config
                    .missing_credentials()
                    .first()
                    .copied()
                    .unwrap_or("OPENAI_API_KEY"),
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pipeline.is_some()
    }
}
