//! API request handlers

use super::models::{
    AddModelRequest, ChatRequest, CreateRuntimeRequest, DownloadModelRequest, GenerateRequest,
    GenerationResponse, HealthResponse, LogsResponse, RuntimeInfo, VerifyModelRequest,
};
use super::routes::AppState;
use crate::config::RuntimeConfig;
use crate::error::ApiError;
use crate::models::{ModelEntry, ModelStatus};
use crate::registry::RuntimeEvent;
use crate::runtime::{ModelRuntime, RuntimeStatus};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// Watch a freshly started runtime until it answers health checks
///
/// Runs in the background so the API can return immediately with
/// "starting" status. A runtime that never comes up is marked Failed.
fn spawn_readiness_watch(runtime: Arc<ModelRuntime>) {
    tokio::spawn(async move {
        use crate::health::HealthChecker;

        if let Err(e) = HealthChecker::wait_for_ready(
            &runtime,
            Duration::from_secs(300), // checkpoint download can dominate startup
            Duration::from_millis(500),
        )
        .await
        {
            tracing::error!(
                runtime = %runtime.config.name,
                error = %e,
                "Runtime failed to become ready"
            );
            *runtime.status.write().await = RuntimeStatus::Failed;
        }
    });
}

/// Persist runtime configs without blocking the response
fn spawn_state_save(state: &AppState) {
    let state_manager = state.state_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = state_manager.save().await {
            tracing::error!(error = %e, "Failed to save state");
        }
    });
}

// ============================================================================
// Runtime Handlers
// ============================================================================

/// GET /runtimes - List all runtimes
pub async fn list_runtimes(State(state): State<AppState>) -> Result<Json<Vec<RuntimeInfo>>, ApiError> {
    let runtimes = state.registry.list().await;

    let mut info_list = Vec::new();
    for runtime in runtimes {
        info_list.push(RuntimeInfo::from_runtime(&runtime).await);
    }

    crate::metrics::update_runtime_count(info_list.len());

    Ok(Json(info_list))
}

/// POST /runtimes - Create and start a new runtime
pub async fn create_runtime(
    State(state): State<AppState>,
    Json(req): Json<CreateRuntimeRequest>,
) -> Result<(StatusCode, Json<RuntimeInfo>), ApiError> {
    // Validate gpu_id if provided
    if let Some(gpu_id) = req.gpu_id {
        let gpu_info = crate::gpu::get_or_init();
        if !gpu_info.is_valid_gpu_id(gpu_id) {
            return Err(ApiError::BadRequest(format!(
                "Invalid gpu_id {} ({} GPUs available)",
                gpu_id,
                gpu_info.count()
            )));
        }
    }

    let use_cache = req.use_cache.unwrap_or(true);
    let config = RuntimeConfig {
        name: req.name,
        model_id: req.model_id.clone(),
        kind: req.kind.unwrap_or_default(),
        port: req.port.unwrap_or(0), // 0 signals auto-allocation to registry
        use_cache,
        context_size: req.context_size.unwrap_or(4096),
        gpu_layers: req.gpu_layers.unwrap_or(0),
        threads: req.threads,
        gpu_id: req.gpu_id,
        extra_args: req.extra_args.unwrap_or_default(),
        created_at: Some(chrono::Utc::now()),
    };

    let runtime = state
        .registry
        .add(config)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Track the served model in the model registry
    if !state.model_registry.contains(&req.model_id).await {
        state
            .model_registry
            .add_model_with_options(req.model_id.clone(), use_cache)
            .await;
    }

    runtime
        .start(state.registry.server_binary_path())
        .await
        .map_err(ApiError::Internal)?;

    state
        .registry
        .notify(RuntimeEvent::Started(runtime.config.name.clone()));

    spawn_readiness_watch(runtime.clone());
    spawn_state_save(&state);

    crate::metrics::record_runtime_created(&runtime.config.name, &req.model_id);
    crate::metrics::update_runtime_count(state.registry.count().await);

    let info = RuntimeInfo::from_runtime(&runtime).await;

    Ok((StatusCode::CREATED, Json(info)))
}

/// GET /runtimes/{name} - Get runtime details
pub async fn get_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RuntimeInfo>, ApiError> {
    let runtime = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Runtime '{}' not found", name)))?;

    let info = RuntimeInfo::from_runtime(&runtime).await;

    Ok(Json(info))
}

/// DELETE /runtimes/{name} - Stop and delete a runtime
pub async fn delete_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .remove(&name)
        .await
        .map_err(|_| ApiError::NotFound(format!("Runtime '{}' not found", name)))?;

    spawn_state_save(&state);

    crate::metrics::record_runtime_deleted(&name);
    crate::metrics::update_runtime_count(state.registry.count().await);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /runtimes/{name}/start - Start a stopped runtime
pub async fn start_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RuntimeInfo>, ApiError> {
    let runtime = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Runtime '{}' not found", name)))?;

    runtime
        .start(state.registry.server_binary_path())
        .await
        .map_err(ApiError::Internal)?;

    state.registry.notify(RuntimeEvent::Started(name));

    spawn_readiness_watch(runtime.clone());

    let info = RuntimeInfo::from_runtime(&runtime).await;

    Ok(Json(info))
}

/// POST /runtimes/{name}/stop - Stop a running runtime
pub async fn stop_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RuntimeInfo>, ApiError> {
    let runtime = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Runtime '{}' not found", name)))?;

    runtime.stop().await.map_err(ApiError::Internal)?;

    state.registry.notify(RuntimeEvent::Stopped(name));

    let info = RuntimeInfo::from_runtime(&runtime).await;

    Ok(Json(info))
}

/// POST /runtimes/{name}/restart - Restart a runtime
pub async fn restart_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RuntimeInfo>, ApiError> {
    let runtime = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Runtime '{}' not found", name)))?;

    runtime
        .restart(state.registry.server_binary_path())
        .await
        .map_err(ApiError::Internal)?;

    state.registry.notify(RuntimeEvent::Started(name));

    spawn_readiness_watch(runtime.clone());

    let info = RuntimeInfo::from_runtime(&runtime).await;

    Ok(Json(info))
}

/// Query parameters for log slicing
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

/// GET /runtimes/{name}/logs - Get runtime logs with Python-style slicing
pub async fn get_logs(
    Path(name): Path<String>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    // Use same log directory resolution as spawn
    let log_dir_path =
        std::env::var("LLM_MANAGER_LOG_DIR").unwrap_or_else(|_| "/data/logs".to_string());

    let log_dir = std::path::Path::new(&log_dir_path);

    // Check fallback location if primary doesn't exist
    let log_path = if !log_dir.exists() {
        std::path::Path::new("/tmp/llm-manager/logs").join(format!("{}.log", name))
    } else {
        log_dir.join(format!("{}.log", name))
    };

    if !log_path.exists() {
        return Err(ApiError::NotFound(format!(
            "No logs found for runtime '{}'",
            name
        )));
    }

    let content = tokio::fs::read_to_string(&log_path)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to read log file: {}", e)))?;

    // Count lines first without allocating
    let total_lines = content.lines().count();

    // Python-style slicing [start, end) with negative index support
    let start_idx = params
        .start
        .map(|s| {
            if s < 0 {
                (total_lines as i32 + s).max(0) as usize
            } else {
                (s as usize).min(total_lines)
            }
        })
        .unwrap_or(0);

    let end_idx = params
        .end
        .map(|e| {
            if e < 0 {
                (total_lines as i32 + e).max(0) as usize
            } else {
                (e as usize).min(total_lines)
            }
        })
        .unwrap_or(total_lines);

    // Only allocate strings for the requested slice
    let lines: Vec<String> = if start_idx < end_idx {
        content
            .lines()
            .skip(start_idx)
            .take(end_idx - start_idx)
            .map(String::from)
            .collect()
    } else {
        Vec::new()
    };

    Ok(Json(LogsResponse {
        lines,
        start: start_idx,
        end: end_idx,
        total_lines,
    }))
}

// ============================================================================
// Model Handlers
// ============================================================================

/// GET /models - List all known models with fresh cache info
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    state.model_registry.refresh_all().await;
    Json(state.model_registry.list().await)
}

/// POST /models - Register a model without downloading it
pub async fn add_model(
    State(state): State<AppState>,
    Json(req): Json<AddModelRequest>,
) -> Result<(StatusCode, Json<ModelEntry>), ApiError> {
    if req.model_id.is_empty() {
        return Err(ApiError::BadRequest("model_id cannot be empty".to_string()));
    }
    if state.model_registry.contains(&req.model_id).await {
        return Err(ApiError::Conflict(format!(
            "Model '{}' is already registered",
            req.model_id
        )));
    }

    let entry = state
        .model_registry
        .add_model_with_options(req.model_id, req.use_cache.unwrap_or(true))
        .await;

    Ok((StatusCode::CREATED, Json(entry)))
}

/// GET /models/{model_id} - Get a model entry with fresh cache info
pub async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<ModelEntry>, ApiError> {
    state
        .model_registry
        .get_refreshed(&model_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Model '{}' is not registered", model_id)))
}

/// Query parameters for model removal
#[derive(Debug, Deserialize)]
pub struct RemoveModelQuery {
    /// Also evict the cached snapshot from disk
    #[serde(default)]
    pub purge: bool,
}

/// DELETE /models/{model_id} - Remove a model from the registry
pub async fn remove_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Query(params): Query<RemoveModelQuery>,
) -> Result<StatusCode, ApiError> {
    if state.registry.get_by_model(&model_id).await.is_some() {
        return Err(ApiError::Conflict(format!(
            "Model '{}' is in use by a runtime",
            model_id
        )));
    }

    if !state.model_registry.remove(&model_id).await {
        return Err(ApiError::NotFound(format!(
            "Model '{}' is not registered",
            model_id
        )));
    }

    if params.purge {
        let evicted =
            crate::models::cache::evict_model_in(state.model_registry.cache_dir(), &model_id)
                .map_err(ApiError::Internal)?;
        if evicted {
            tracing::info!(model_id = %model_id, "Evicted cached snapshot");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /models/download - Fetch a model snapshot in the background
///
/// Returns 202 with the entry in "downloading" status; poll GET /models/{id}
/// for completion. Models registered with use_cache = false always fetch a
/// fresh snapshot.
pub async fn download_model(
    State(state): State<AppState>,
    Json(req): Json<DownloadModelRequest>,
) -> Result<(StatusCode, Json<ModelEntry>), ApiError> {
    let model_id = req.model_id;

    let entry = match state.model_registry.get(&model_id).await {
        Some(entry) => entry,
        None => state.model_registry.add_model(model_id.clone()).await,
    };

    if entry.status == ModelStatus::Downloading {
        return Err(ApiError::Conflict(format!(
            "Model '{}' is already downloading",
            model_id
        )));
    }

    let force = req.force.unwrap_or(false) || !entry.use_cache;

    state
        .model_registry
        .set_status(&model_id, ModelStatus::Downloading)
        .await;

    let model_registry = state.model_registry.clone();
    let cache_dir = model_registry.cache_dir().to_path_buf();
    let id = model_id.clone();
    tokio::spawn(async move {
        match crate::models::download_model_to_cache(&id, Some(cache_dir), force).await {
            Ok(path) => {
                tracing::info!(
                    model_id = %id,
                    path = %path.display(),
                    "Model download complete"
                );
                crate::metrics::record_model_download(&id);
                // moves the entry to Downloaded and fills in cache info
                let _ = model_registry.get_refreshed(&id).await;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(model_id = %id, error = %message, "Model download failed");
                model_registry.set_failed(&id, message).await;
            }
        }
    });

    let snapshot = state
        .model_registry
        .get(&model_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Model '{}' is not registered", model_id)))?;

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// POST /models/verify - Smoke-test a cached model in the background
///
/// Loads the weights into a short-lived server process to prove they are
/// servable. Returns 202 with the entry in "loading" status.
pub async fn verify_model(
    State(state): State<AppState>,
    Json(req): Json<VerifyModelRequest>,
) -> Result<(StatusCode, Json<ModelEntry>), ApiError> {
    let model_id = req.model_id;

    let entry = state
        .model_registry
        .get_refreshed(&model_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Model '{}' is not registered", model_id)))?;

    if entry.status == ModelStatus::Loading {
        return Err(ApiError::Conflict(format!(
            "Model '{}' is already being verified",
            model_id
        )));
    }

    let snapshot_dir = entry
        .cache_info
        .as_ref()
        .map(|info| info.path.clone())
        .ok_or_else(|| {
            ApiError::Conflict(format!(
                "Model '{}' has no cached snapshot to verify",
                model_id
            ))
        })?;

    let weights = crate::models::find_weights_file(&snapshot_dir).ok_or_else(|| {
        ApiError::Conflict(format!(
            "No weights file found in snapshot for '{}'",
            model_id
        ))
    })?;

    state
        .model_registry
        .set_status(&model_id, ModelStatus::Loading)
        .await;

    let loader = state.loader.clone();
    let model_registry = state.model_registry.clone();
    let id = model_id.clone();
    tokio::spawn(async move {
        match loader.smoke_test(&id, &weights).await {
            Ok(()) => {
                tracing::info!(model_id = %id, "Model verified");
                model_registry.set_verified(&id).await;
            }
            Err(e) => {
                tracing::warn!(model_id = %id, error = %e, "Model verification failed");
                model_registry.set_failed(&id, e).await;
            }
        }
    });

    let snapshot = state
        .model_registry
        .get(&model_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Model '{}' is not registered", model_id)))?;

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

// ============================================================================
// Inference Handlers
// ============================================================================

/// Resolve a runtime by its name, falling back to the model id it serves
async fn resolve_runtime(state: &AppState, model: &str) -> Result<Arc<ModelRuntime>, ApiError> {
    if let Some(runtime) = state.registry.get(model).await {
        return Ok(runtime);
    }
    state
        .registry
        .get_by_model(model)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No runtime serves '{}'", model)))
}

/// POST /generate - Plain text completion through a runtime
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let runtime = resolve_runtime(&state, &req.model).await?;

    let started = Instant::now();
    let output = runtime.llm.generate(&req.prompt, &req.params).await?;

    crate::metrics::record_generation(runtime.llm.model_id());
    if let Some(usage) = output.usage {
        crate::metrics::record_generated_tokens(runtime.llm.model_id(), usage.total_tokens as u64);
    }

    Ok(Json(GenerationResponse {
        model: output
            .model_id
            .unwrap_or_else(|| runtime.config.model_id.clone()),
        runtime: runtime.config.name.clone(),
        content: output.content,
        usage: output.usage,
        duration_ms: started.elapsed().as_millis() as u64,
    }))
}

/// POST /chat - Chat completion through a runtime
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest(
            "messages cannot be empty".to_string(),
        ));
    }

    let runtime = resolve_runtime(&state, &req.model).await?;

    let started = Instant::now();
    let output = runtime.llm.chat(&req.messages, &req.params).await?;

    crate::metrics::record_generation(runtime.llm.model_id());
    if let Some(usage) = output.usage {
        crate::metrics::record_generated_tokens(runtime.llm.model_id(), usage.total_tokens as u64);
    }

    Ok(Json(GenerationResponse {
        model: output
            .model_id
            .unwrap_or_else(|| runtime.config.model_id.clone()),
        runtime: runtime.config.name.clone(),
        content: output.content,
        usage: output.usage,
        duration_ms: started.elapsed().as_millis() as u64,
    }))
}
