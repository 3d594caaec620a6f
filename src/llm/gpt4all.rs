//! GPT4All model backend
//!
//! Serves GGUF checkpoints from the HuggingFace cache through an
//! OpenAI-compatible llama-server endpoint. The struct itself is plain
//! data: constructing one assigns fields and nothing else. Checkpoint
//! resolution happens in [`Llm::prepare`] and network traffic only after
//! [`Llm::attach`] has been called with a live endpoint.

use super::{ChatMessage, Checkpoint, GenerationOutput, GenerationParams, Llm, TokenUsage};
use crate::error::LlmError;
use crate::models::cache::{get_cache_dir, get_model_cache_path_in};
use crate::models::download::download_model_to_cache;
use crate::models::metadata::parse_model_config;
use crate::models::weights::find_weights_file;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Timeout for readiness probes against the backend health route
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A GPT4All-family model served out of process
///
/// `name` is the HuggingFace model ID and is stored exactly as given.
/// `use_cache` controls whether [`Llm::prepare`] may reuse an existing
/// cached snapshot (the default) or must evict and fetch a fresh one.
pub struct Gpt4All {
    name: String,
    use_cache: bool,
    cache_dir: Option<PathBuf>,
    endpoint: RwLock<Option<String>>,
    client: reqwest::Client,
}

impl Gpt4All {
    /// Create a backend for the given model ID
    ///
    /// Does no I/O and cannot fail; the checkpoint is resolved later by
    /// [`Llm::prepare`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            use_cache: true,
            cache_dir: None,
            endpoint: RwLock::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// Override the cached-snapshot reuse preference
    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Resolve checkpoints against an explicit cache root instead of the
    /// ambient HuggingFace cache
    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    /// The model ID this backend was created with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether prepare may reuse a cached snapshot
    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// The explicit cache root, if one was set
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(get_cache_dir)
    }

    async fn endpoint_or_err(&self) -> Result<String, LlmError> {
        let endpoint = self.endpoint.read().await;
        endpoint.clone().ok_or_else(|| LlmError::NotAttached {
            model_id: self.name.clone(),
        })
    }

    async fn post_json<Req, Resp>(&self, url: &str, request: &Req) -> Result<Resp, LlmError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Llm for Gpt4All {
    fn model_id(&self) -> &str {
        &self.name
    }

    /// Resolve the checkpoint this backend will serve
    ///
    /// With `use_cache` set, an existing snapshot that contains a weights
    /// file is reused as-is. Otherwise (or when nothing usable is cached)
    /// the model is fetched from the Hub, evicting the stale copy first
    /// when reuse is disabled.
    async fn prepare(&self) -> Result<Option<Checkpoint>, LlmError> {
        let cache_root = self.cache_root();

        if self.use_cache
            && let Some(snapshot_dir) = get_model_cache_path_in(&cache_root, &self.name)
            && let Some(weights) = find_weights_file(&snapshot_dir)
        {
            tracing::info!(model_id = %self.name, path = %snapshot_dir.display(), "Using cached snapshot");
            let metadata = parse_model_config(&snapshot_dir);
            return Ok(Some(Checkpoint {
                snapshot_dir,
                weights,
                metadata,
            }));
        }

        tracing::info!(model_id = %self.name, use_cache = self.use_cache, "Fetching model from hub");
        let snapshot_dir = download_model_to_cache(&self.name, Some(cache_root), !self.use_cache)
            .await
            .map_err(|e| LlmError::Hub {
                model_id: self.name.clone(),
                message: format!("{:#}", e),
            })?;

        let weights = find_weights_file(&snapshot_dir).ok_or_else(|| LlmError::WeightsNotFound {
            model_id: self.name.clone(),
        })?;

        let metadata = parse_model_config(&snapshot_dir);
        Ok(Some(Checkpoint {
            snapshot_dir,
            weights,
            metadata,
        }))
    }

    async fn attach(&self, endpoint: String) {
        let mut slot = self.endpoint.write().await;
        *slot = Some(endpoint);
    }

    async fn detach(&self) {
        let mut slot = self.endpoint.write().await;
        *slot = None;
    }

    async fn ready(&self) -> bool {
        let Ok(endpoint) = self.endpoint_or_err().await else {
            return false;
        };

        match self
            .client
            .get(format!("{}/health", endpoint))
            .timeout(READY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError> {
        let endpoint = self.endpoint_or_err().await?;

        let request = CompletionRequest {
            model: &self.name,
            prompt,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop.as_deref(),
        };

        let url = format!("{}/v1/completions", endpoint);
        let response: CompletionResponse = self.post_json(&url, &request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Decode("response contained no choices".to_string()))?;

        Ok(GenerationOutput {
            content: choice.text,
            model_id: response.model,
            usage: response.usage.map(Into::into),
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput, LlmError> {
        let endpoint = self.endpoint_or_err().await?;

        let request = ChatRequest {
            model: &self.name,
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop.as_deref(),
        };

        let url = format!("{}/v1/chat/completions", endpoint);
        let response: ChatResponse = self.post_json(&url, &request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Decode("response contained no choices".to_string()))?;

        Ok(GenerationOutput {
            content: choice.message.content,
            model_id: response.model,
            usage: response.usage.map(Into::into),
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}
