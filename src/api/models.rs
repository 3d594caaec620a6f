//! API request and response models

use crate::llm::{ChatMessage, GenerationParams, ModelKind, TokenUsage};
use crate::runtime::{ModelRuntime, RuntimeStatus};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Request to create a new runtime
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRuntimeRequest {
    pub name: String,
    pub model_id: String,

    /// Backend kind; defaults to gpt4all
    #[serde(default)]
    pub kind: Option<ModelKind>,

    /// Port for the runtime
    /// If not provided, auto-allocated from the registry's port range
    #[serde(default)]
    pub port: Option<u16>,

    /// Whether starts may reuse an already cached snapshot (default true)
    #[serde(default)]
    pub use_cache: Option<bool>,

    #[serde(default)]
    pub context_size: Option<u32>,

    #[serde(default)]
    pub gpu_layers: Option<u32>,

    #[serde(default)]
    pub threads: Option<u32>,

    #[serde(default)]
    pub gpu_id: Option<u32>,

    #[serde(default)]
    pub extra_args: Option<Vec<String>>,
}

/// Runtime information response
#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub model_id: String,
    pub kind: ModelKind,
    pub port: u16,
    pub endpoint: String,
    pub status: RuntimeStatus,
    pub pid: Option<u32>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub uptime_secs: Option<u64>,
    pub restarts: u32,
    pub health_check_failures: u32,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub use_cache: bool,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub gpu_id: Option<u32>,
}

impl RuntimeInfo {
    /// Create RuntimeInfo from ModelRuntime
    pub async fn from_runtime(runtime: &ModelRuntime) -> Self {
        let status = *runtime.status.read().await;
        let stats = runtime.stats.read().await;
        let pid = runtime.pid().await;

        let uptime_secs = stats
            .started_at
            .map(|start| (chrono::Utc::now() - start).num_seconds() as u64);

        Self {
            name: runtime.config.name.clone(),
            model_id: runtime.config.model_id.clone(),
            kind: runtime.config.kind,
            port: runtime.config.port,
            endpoint: runtime.endpoint(),
            status,
            pid,
            created_at: runtime.config.created_at,
            uptime_secs,
            restarts: stats.restarts,
            health_check_failures: stats.health_check_failures,
            last_health_check: stats.last_health_check,
            use_cache: runtime.config.use_cache,
            context_size: runtime.config.context_size,
            gpu_layers: runtime.config.gpu_layers,
            gpu_id: runtime.config.gpu_id,
        }
    }
}

/// Request to register a model without downloading it
#[derive(Debug, Serialize, Deserialize)]
pub struct AddModelRequest {
    pub model_id: String,

    /// Whether downloads may reuse an existing cached snapshot (default true)
    #[serde(default)]
    pub use_cache: Option<bool>,
}

/// Request to download a model into the cache
#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadModelRequest {
    pub model_id: String,

    /// Re-download even if a valid snapshot is cached
    #[serde(default)]
    pub force: Option<bool>,
}

/// Request to smoke-test a cached model
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyModelRequest {
    pub model_id: String,
}

/// Request for plain text completion
///
/// `model` names either a runtime or a model id served by one.
/// Sampling parameters are accepted at the top level and passed through.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,

    #[serde(flatten)]
    pub params: GenerationParams,
}

/// Request for a chat completion
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(flatten)]
    pub params: GenerationParams,
}

/// Response for both completion endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Model that produced the content
    pub model: String,
    /// Runtime that served the request
    pub runtime: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub duration_ms: u64,
}

/// Log file response with Python-style slicing
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
    pub start: usize,
    pub end: usize,
    pub total_lines: usize,
}
