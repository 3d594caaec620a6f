//! Model runtime management and process lifecycle
//!
//! A runtime pairs a named llama-server process with the [`Llm`] backend
//! that talks to it. Starting a runtime resolves the checkpoint through
//! the backend, spawns the server on the configured port and attaches the
//! backend to the resulting endpoint. Mock backends skip the process and
//! are usable immediately.

use crate::config::RuntimeConfig;
use crate::llm::{Checkpoint, Llm, build_model};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning a llama-server process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub runtime_name: String,
    pub binary_path: String,
    pub model_path: PathBuf,
    pub port: u16,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub threads: Option<u32>,
    pub gpu_id: Option<u32>,
    pub extra_args: Vec<String>,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new llama-server process
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle>;

    /// Stop a process gracefully with timeout
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> Result<()>;

    /// Check if process is running
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<std::collections::HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&config.binary_path);

        // Set GPU assignment if specified
        if let Some(gpu_id) = config.gpu_id {
            cmd.env("CUDA_VISIBLE_DEVICES", gpu_id.to_string());
            tracing::debug!(gpu_id = gpu_id, "Setting CUDA_VISIBLE_DEVICES");
        }

        // Build arguments from config
        cmd.arg("-m").arg(&config.model_path);
        cmd.arg("--host").arg("127.0.0.1");
        cmd.arg("--port").arg(config.port.to_string());
        cmd.arg("-c").arg(config.context_size.to_string());
        cmd.arg("-ngl").arg(config.gpu_layers.to_string());

        // Set thread count unless the caller already pinned it
        let has_threads_in_extra_args = config.extra_args.iter().any(|arg| arg == "--threads");

        if !has_threads_in_extra_args && let Some(threads) = config.threads {
            cmd.arg("--threads").arg(threads.to_string());
        }

        // Add extra args
        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        // Setup log file redirection
        // Use env var if set, otherwise try /data/logs, fallback to /tmp/llm-manager/logs
        let log_dir_path =
            std::env::var("LLM_MANAGER_LOG_DIR").unwrap_or_else(|_| "/data/logs".to_string());

        let log_dir = std::path::Path::new(&log_dir_path);

        // Try to create the directory, fall back to /tmp if it fails
        let log_dir = if let Err(e) = std::fs::create_dir_all(log_dir) {
            tracing::warn!(
                error = %e,
                attempted_dir = %log_dir_path,
                "Failed to create log directory, falling back to /tmp/llm-manager/logs"
            );
            let fallback = std::path::Path::new("/tmp/llm-manager/logs");
            std::fs::create_dir_all(fallback).context("Failed to create fallback log directory")?;
            fallback
        } else {
            log_dir
        };

        let log_path = log_dir.join(format!("{}.log", config.runtime_name));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

        let stdout_file = log_file
            .try_clone()
            .context("Failed to clone log file for stdout")?;
        let stderr_file = log_file
            .try_clone()
            .context("Failed to clone log file for stderr")?;

        // Spawn process
        let child = cmd
            .stdout(stdout_file)
            .stderr(stderr_file)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn llama-server process")?;

        let pid = child.id().context("Failed to get PID")?;
        let handle_id = format!("process_{}", pid);

        tracing::info!(
            runtime = %config.runtime_name,
            model_path = %config.model_path.display(),
            port = config.port,
            pid = pid,
            gpu_id = ?config.gpu_id,
            "llama-server process spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes.write().await.insert(handle_id, child);

        Ok(handle)
    }

    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> Result<()> {
        let mut processes = self.processes.write().await;

        if let Some(mut child) = processes.remove(&handle.id) {
            // Try graceful shutdown first (SIGTERM)
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let pid = Pid::from_raw(pid as i32);
                    let _ = kill(pid, Signal::SIGTERM);

                    // Wait for graceful shutdown with timeout
                    tokio::select! {
                        _ = child.wait() => {
                            tracing::info!("Process stopped gracefully");
                        }
                        _ = tokio::time::sleep(timeout) => {
                            tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                            let _ = kill(pid, Signal::SIGKILL);
                            let _ = child.wait().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    // On non-Unix, just kill
                    let _ = child.kill().await;
                }
            }
        }

        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let processes = self.processes.read().await;
        processes.contains_key(&handle.id)
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }
}

// ============================================================================
// Model Runtime with Dependency Injection
// ============================================================================

/// A served model with process, backend and status tracking
pub struct ModelRuntime {
    pub config: RuntimeConfig,
    process_manager: Arc<dyn ProcessManager>,
    process_handle: Arc<RwLock<Option<ProcessHandle>>>,
    /// Backend used to resolve the checkpoint and dispatch generation
    pub llm: Arc<dyn Llm>,
    checkpoint: Arc<RwLock<Option<Checkpoint>>>,
    pub status: Arc<RwLock<RuntimeStatus>>,
    pub stats: Arc<RwLock<RuntimeStats>>,
}

/// Runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Runtime statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeStats {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub restarts: u32,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub health_check_failures: u32,
}

impl ModelRuntime {
    /// Create a new runtime with custom backend and process manager
    pub fn new_with_manager(
        config: RuntimeConfig,
        llm: Arc<dyn Llm>,
        manager: Arc<dyn ProcessManager>,
    ) -> Self {
        Self {
            config,
            process_manager: manager,
            process_handle: Arc::new(RwLock::new(None)),
            llm,
            checkpoint: Arc::new(RwLock::new(None)),
            status: Arc::new(RwLock::new(RuntimeStatus::Stopped)),
            stats: Arc::new(RwLock::new(RuntimeStats::default())),
        }
    }

    /// Create a new runtime with the default system process manager,
    /// building the backend from the runtime config
    pub fn new(config: RuntimeConfig) -> Self {
        let llm = build_model(config.kind, &config.model_id, config.use_cache, None);
        Self::new_with_manager(config, llm, Arc::new(SystemProcessManager::new()))
    }

    /// The local endpoint this runtime serves on
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.config.port)
    }

    /// Start the runtime
    ///
    /// Process-backed kinds resolve their checkpoint, spawn llama-server
    /// and enter `Starting` until the health monitor observes the server.
    /// Processless kinds go straight to `Running`.
    pub async fn start(&self, binary_path: &str) -> Result<()> {
        if self.config.kind.needs_process() {
            let checkpoint = self
                .llm
                .prepare()
                .await?
                .context("Backend produced no checkpoint to serve")?;

            let spawn_config = SpawnConfig {
                runtime_name: self.config.name.clone(),
                binary_path: binary_path.to_string(),
                model_path: checkpoint.weights.clone(),
                port: self.config.port,
                context_size: self.config.context_size,
                gpu_layers: self.config.gpu_layers,
                threads: self.config.threads,
                gpu_id: self.config.gpu_id,
                extra_args: self.config.extra_args.clone(),
            };

            let handle = self.process_manager.spawn(spawn_config).await?;
            let pid = self.process_manager.pid(&handle).await;

            *self.process_handle.write().await = Some(handle);
            *self.checkpoint.write().await = Some(checkpoint);
            *self.status.write().await = RuntimeStatus::Starting;

            tracing::info!(
                runtime = %self.config.name,
                model = %self.config.model_id,
                port = self.config.port,
                pid = ?pid,
                gpu_id = ?self.config.gpu_id,
                "Runtime started"
            );
        } else {
            *self.status.write().await = RuntimeStatus::Running;

            tracing::info!(
                runtime = %self.config.name,
                model = %self.config.model_id,
                kind = %self.config.kind,
                "Processless runtime started"
            );
        }

        self.llm.attach(self.endpoint()).await;

        // Update stats
        let mut stats = self.stats.write().await;
        stats.started_at = Some(chrono::Utc::now());

        Ok(())
    }

    /// Stop the runtime gracefully
    pub async fn stop(&self) -> Result<()> {
        *self.status.write().await = RuntimeStatus::Stopping;

        self.llm.detach().await;

        let mut handle_guard = self.process_handle.write().await;

        if let Some(handle) = handle_guard.take() {
            self.process_manager
                .stop(handle, Duration::from_secs(30))
                .await?;

            tracing::info!(runtime = %self.config.name, "Runtime stopped");
        }

        *self.checkpoint.write().await = None;
        *self.status.write().await = RuntimeStatus::Stopped;
        Ok(())
    }

    /// Restart the runtime
    pub async fn restart(&self, binary_path: &str) -> Result<()> {
        tracing::info!(runtime = %self.config.name, "Restarting runtime");

        self.stop().await?;
        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        self.start(binary_path).await?;

        let mut stats = self.stats.write().await;
        stats.restarts += 1;

        Ok(())
    }

    /// Check if the backing process is still running
    pub async fn is_running(&self) -> bool {
        let handle_guard = self.process_handle.read().await;
        if let Some(handle) = handle_guard.as_ref() {
            self.process_manager.is_running(handle).await
        } else {
            false
        }
    }

    /// Get current PID
    pub async fn pid(&self) -> Option<u32> {
        let handle_guard = self.process_handle.read().await;
        if let Some(handle) = handle_guard.as_ref() {
            self.process_manager.pid(handle).await
        } else {
            None
        }
    }

    /// The checkpoint resolved at the last start, if any
    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.read().await.clone()
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GenerationOutput, GenerationParams, MockLlm, ModelKind};
    use mocks::MockProcessManager;

    /// Backend that resolves a fixed checkpoint without touching the hub
    struct StubBackend {
        id: String,
        weights: PathBuf,
    }

    impl StubBackend {
        fn new(id: &str, weights: &str) -> Self {
            Self {
                id: id.to_string(),
                weights: PathBuf::from(weights),
            }
        }
    }

    #[async_trait]
    impl Llm for StubBackend {
        fn model_id(&self) -> &str {
            &self.id
        }

        async fn prepare(&self) -> Result<Option<Checkpoint>, LlmError> {
            Ok(Some(Checkpoint {
                snapshot_dir: self.weights.parent().unwrap().to_path_buf(),
                weights: self.weights.clone(),
                metadata: None,
            }))
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<GenerationOutput, LlmError> {
            unimplemented!("not used in runtime tests")
        }

        async fn chat(
            &self,
            _messages: &[crate::llm::ChatMessage],
            _params: &GenerationParams,
        ) -> Result<GenerationOutput, LlmError> {
            unimplemented!("not used in runtime tests")
        }
    }

    fn process_runtime(name: &str, port: u16, manager: Arc<MockProcessManager>) -> ModelRuntime {
        let config = RuntimeConfig {
            name: name.to_string(),
            model_id: "org/test-model".to_string(),
            kind: ModelKind::Gpt4All,
            port,
            ..Default::default()
        };
        let llm = Arc::new(StubBackend::new("org/test-model", "/tmp/weights/test.gguf"));
        ModelRuntime::new_with_manager(config, llm, manager)
    }

    #[tokio::test]
    async fn test_runtime_creation() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test", 9999, manager);

        assert_eq!(*runtime.status.read().await, RuntimeStatus::Stopped);
        assert!(!runtime.is_running().await);
        assert!(runtime.checkpoint().await.is_none());
    }

    #[tokio::test]
    async fn test_runtime_start() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test-start", 8080, manager.clone());

        runtime.start("/usr/bin/llama-server").await.unwrap();

        assert_eq!(*runtime.status.read().await, RuntimeStatus::Starting);
        assert!(runtime.is_running().await);
        assert!(runtime.pid().await.is_some());
        assert!(runtime.checkpoint().await.is_some());

        // Verify spawn config
        assert!(
            manager
                .was_spawned_with(std::path::Path::new("/tmp/weights/test.gguf"), 8080)
                .await
        );
    }

    #[tokio::test]
    async fn test_runtime_stop() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test-stop", 8081, manager.clone());

        runtime.start("/usr/bin/llama-server").await.unwrap();
        assert_eq!(manager.process_count().await, 1);

        runtime.stop().await.unwrap();
        assert_eq!(*runtime.status.read().await, RuntimeStatus::Stopped);
        assert!(!runtime.is_running().await);
        assert!(runtime.checkpoint().await.is_none());
        assert_eq!(manager.process_count().await, 0);
    }

    #[tokio::test]
    async fn test_runtime_restart() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test-restart", 8082, manager);

        runtime.start("/usr/bin/llama-server").await.unwrap();
        let initial_pid = runtime.pid().await.unwrap();

        runtime.restart("/usr/bin/llama-server").await.unwrap();
        let new_pid = runtime.pid().await.unwrap();

        assert_ne!(initial_pid, new_pid);
        assert_eq!(runtime.stats.read().await.restarts, 1);
    }

    #[tokio::test]
    async fn test_processless_runtime_runs_without_spawn() {
        let config = RuntimeConfig {
            name: "mock-runtime".to_string(),
            model_id: "mock-model".to_string(),
            kind: ModelKind::Mock,
            port: 8083,
            ..Default::default()
        };

        let manager = Arc::new(MockProcessManager::new());
        let runtime = ModelRuntime::new_with_manager(
            config,
            Arc::new(MockLlm::new("mock-model")),
            manager.clone(),
        );

        runtime.start("/usr/bin/llama-server").await.unwrap();

        assert_eq!(*runtime.status.read().await, RuntimeStatus::Running);
        assert_eq!(manager.process_count().await, 0);
        assert!(runtime.pid().await.is_none());

        // Generation is dispatched straight through the backend
        let output = runtime
            .llm
            .generate("ping", &GenerationParams::default())
            .await
            .unwrap();
        assert!(output.content.contains("ping"));

        runtime.stop().await.unwrap();
        assert_eq!(*runtime.status.read().await, RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_gpu_assignment() {
        let config = RuntimeConfig {
            name: "test-gpu".to_string(),
            model_id: "org/test-model".to_string(),
            kind: ModelKind::Gpt4All,
            port: 9998,
            gpu_id: Some(1),
            ..Default::default()
        };

        let manager = Arc::new(MockProcessManager::new());
        let llm = Arc::new(StubBackend::new("org/test-model", "/tmp/weights/test.gguf"));
        let runtime = ModelRuntime::new_with_manager(config, llm, manager.clone());
        runtime.start("/usr/bin/llama-server").await.unwrap();

        assert_eq!(runtime.config.gpu_id, Some(1));
    }

    #[tokio::test]
    async fn test_process_handle_lifecycle() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test-handle", 8084, manager);

        // Initially no handle
        assert!(runtime.process_handle.read().await.is_none());

        // After start, handle exists
        runtime.start("/usr/bin/llama-server").await.unwrap();
        assert!(runtime.process_handle.read().await.is_some());

        // After stop, handle is removed
        runtime.stop().await.unwrap();
        assert!(runtime.process_handle.read().await.is_none());
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let manager = Arc::new(MockProcessManager::new());
        let runtime = process_runtime("test-stats", 8085, manager);

        // Initially no started_at
        assert!(runtime.stats.read().await.started_at.is_none());

        runtime.start("/usr/bin/llama-server").await.unwrap();

        // After start, started_at is set
        assert!(runtime.stats.read().await.started_at.is_some());

        // Restart increments counter
        runtime.restart("/usr/bin/llama-server").await.unwrap();
        assert_eq!(runtime.stats.read().await.restarts, 1);

        runtime.restart("/usr/bin/llama-server").await.unwrap();
        assert_eq!(runtime.stats.read().await.restarts, 2);
    }

    #[tokio::test]
    async fn test_spawn_config_propagation() {
        let config = RuntimeConfig {
            name: "test-config".to_string(),
            model_id: "org/custom-model".to_string(),
            kind: ModelKind::Gpt4All,
            port: 7777,
            context_size: 4096,
            gpu_layers: 35,
            threads: Some(8),
            gpu_id: Some(2),
            extra_args: vec!["--arg1".to_string(), "--arg2".to_string()],
            ..Default::default()
        };

        let manager = Arc::new(MockProcessManager::new());
        let llm = Arc::new(StubBackend::new(
            "org/custom-model",
            "/tmp/weights/custom.gguf",
        ));
        let runtime = ModelRuntime::new_with_manager(config, llm, manager.clone());

        runtime.start("/custom/path/llama-server").await.unwrap();

        // Verify config was propagated correctly
        let handle = runtime.process_handle.read().await;
        let spawn_config = manager.get_config(handle.as_ref().unwrap()).await.unwrap();

        assert_eq!(spawn_config.binary_path, "/custom/path/llama-server");
        assert_eq!(
            spawn_config.model_path,
            PathBuf::from("/tmp/weights/custom.gguf")
        );
        assert_eq!(spawn_config.port, 7777);
        assert_eq!(spawn_config.context_size, 4096);
        assert_eq!(spawn_config.gpu_layers, 35);
        assert_eq!(spawn_config.threads, Some(8));
        assert_eq!(spawn_config.gpu_id, Some(2));
        assert_eq!(spawn_config.extra_args.len(), 2);
    }

    #[tokio::test]
    async fn test_multiple_runtimes() {
        let manager = Arc::new(MockProcessManager::new());

        let rt1 = process_runtime("rt1", 8001, manager.clone());
        let rt2 = process_runtime("rt2", 8002, manager.clone());

        rt1.start("/usr/bin/llama-server").await.unwrap();
        rt2.start("/usr/bin/llama-server").await.unwrap();

        assert_eq!(manager.process_count().await, 2);

        rt1.stop().await.unwrap();
        assert_eq!(manager.process_count().await, 1);

        rt2.stop().await.unwrap();
        assert_eq!(manager.process_count().await, 0);
    }

    #[test]
    fn test_endpoint_format() {
        let config = RuntimeConfig {
            name: "ep".to_string(),
            port: 9012,
            ..Default::default()
        };
        let runtime = ModelRuntime::new(config);
        assert_eq!(runtime.endpoint(), "http://127.0.0.1:9012");
    }
}
