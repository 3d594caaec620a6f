//! Model abstraction layer
//!
//! Every concrete model variant implements the [`Llm`] trait, and the
//! rest of the system (runtimes, API handlers, tests) works against
//! `Arc<dyn Llm>`. The trait covers identity, checkpoint preparation,
//! runtime endpoint attachment, and text/chat generation.

pub mod factory;
pub mod gpt4all;
pub mod mock;

pub use factory::{ModelKind, build_model};
pub use gpt4all::Gpt4All;
pub use mock::MockLlm;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::models::metadata::ModelMetadata;

/// Sampling and length parameters for a generation request.
///
/// All fields are optional; unset fields are omitted from the request
/// to the runtime, which then applies its own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(512),
            stop: None,
        }
    }
}

/// A single message in a chat conversation.
///
/// Roles follow the common convention: `system`, `user`, `assistant`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Token accounting reported by the runtime, when available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub content: String,
    /// Identifier of the model that produced the content.
    pub model_id: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Resolved local artifacts for a model: where the snapshot lives,
/// which file a runtime should load, and what the config says about it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub snapshot_dir: PathBuf,
    pub weights: PathBuf,
    pub metadata: Option<ModelMetadata>,
}

/// Capability contract for a model variant.
///
/// Lifecycle methods have default implementations suited to variants
/// that need no local artifacts and no serving process; variants backed
/// by a local checkpoint override them.
#[async_trait]
pub trait Llm: Send + Sync {
    /// The model identifier this variant was constructed with.
    fn model_id(&self) -> &str;

    /// Resolve local artifacts for this model, downloading them if
    /// necessary. `Ok(None)` means the variant has nothing to serve
    /// from disk.
    async fn prepare(&self) -> Result<Option<Checkpoint>, LlmError> {
        Ok(None)
    }

    /// Bind the HTTP endpoint of a serving runtime.
    async fn attach(&self, endpoint: String) {
        let _ = endpoint;
    }

    /// Clear any bound runtime endpoint.
    async fn detach(&self) {}

    /// Whether generation calls can currently be served.
    async fn ready(&self) -> bool {
        true
    }

    /// Generate a completion for a plain text prompt.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError>;

    /// Generate the next assistant message for a conversation.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError>;
}
