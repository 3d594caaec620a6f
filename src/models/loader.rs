//! Model loader for smoke testing
//!
//! Provides functionality to load a model into a short-lived inference
//! server, verify the weights parse and the server reaches its main loop,
//! then unload it. This validates that a checkpoint is actually servable.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Configuration for the model loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Path to the llama-server binary
    pub binary_path: String,
    /// Port to use for smoke test instance
    pub smoke_test_port: u16,
    /// Timeout for model loading in seconds
    pub load_timeout_secs: u64,
    /// Context size for the throwaway instance
    pub context_size: u32,
    /// Layers to offload to GPU 0 (0 keeps the load on CPU)
    pub gpu_layers: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            binary_path: "llama-server".to_string(),
            smoke_test_port: 18080, // Use a high port unlikely to conflict
            load_timeout_secs: 300, // 5 minutes for large models
            context_size: 512,      // Minimal for smoke test
            gpu_layers: 0,
        }
    }
}

/// Model loader for smoke testing
///
/// Ensures only one smoke test runs at a time via mutex
pub struct ModelLoader {
    config: LoaderConfig,
    /// Mutex to ensure only one smoke test at a time
    lock: Mutex<()>,
}

impl ModelLoader {
    /// Create a new model loader with default configuration
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
            lock: Mutex::new(()),
        }
    }

    /// Create a new model loader with custom configuration
    pub fn with_config(config: LoaderConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    /// Create a new model loader from manager config
    pub fn from_binary(binary_path: String) -> Self {
        Self {
            config: LoaderConfig {
                binary_path,
                ..Default::default()
            },
            lock: Mutex::new(()),
        }
    }

    /// Perform a smoke test on a downloaded checkpoint
    ///
    /// This will:
    /// 1. Start a llama-server instance with the given weights file
    /// 2. Wait for it to reach its serving loop (model loaded successfully)
    /// 3. Shut down the instance
    ///
    /// Returns Ok(()) if the model loaded successfully, Err with details otherwise.
    pub async fn smoke_test(&self, model_id: &str, weights_path: &Path) -> Result<(), String> {
        // Acquire lock to ensure only one smoke test at a time
        let _guard = self.lock.lock().await;

        tracing::info!(model_id = %model_id, weights = %weights_path.display(), "Starting smoke test");

        let mut child = self.start_server_process(weights_path).await?;

        // Wait for ready or failure
        let result = self.wait_for_ready(&mut child, model_id).await;

        // Always try to kill the process
        tracing::info!(model_id = %model_id, "Stopping smoke test instance");
        let _ = child.kill().await;

        result
    }

    /// Start a llama-server process for the given weights file
    async fn start_server_process(&self, weights_path: &Path) -> Result<Child, String> {
        let mut cmd = Command::new(&self.config.binary_path);

        cmd.arg("-m")
            .arg(weights_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(self.config.smoke_test_port.to_string())
            .arg("-c")
            .arg(self.config.context_size.to_string())
            .arg("-ngl")
            .arg(self.config.gpu_layers.to_string())
            .env("CUDA_VISIBLE_DEVICES", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            binary = %self.config.binary_path,
            weights = %weights_path.display(),
            port = %self.config.smoke_test_port,
            "Spawning llama-server process for smoke test"
        );

        cmd.spawn()
            .map_err(|e| format!("Failed to spawn llama-server process: {}", e))
    }

    /// Wait for the server to become ready or fail
    async fn wait_for_ready(&self, child: &mut Child, model_id: &str) -> Result<(), String> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Failed to capture stderr".to_string())?;

        let mut reader = BufReader::new(stderr).lines();

        let result = timeout(
            Duration::from_secs(self.config.load_timeout_secs),
            self.monitor_output(&mut reader, model_id),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                tracing::info!(model_id = %model_id, "Smoke test passed - model loaded successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(model_id = %model_id, error = %e, "Smoke test failed");
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    model_id = %model_id,
                    timeout_secs = %self.config.load_timeout_secs,
                    "Smoke test timed out"
                );
                Err(format!(
                    "Timeout after {}s waiting for model to load",
                    self.config.load_timeout_secs
                ))
            }
        }
    }

    /// Monitor server output for ready or error indicators
    async fn monitor_output(
        &self,
        reader: &mut tokio::io::Lines<BufReader<tokio::process::ChildStderr>>,
        model_id: &str,
    ) -> Result<(), String> {
        while let Ok(Some(line)) = reader.next_line().await {
            tracing::trace!(model_id = %model_id, line = %line, "llama-server output");

            // llama-server logs "server is listening on ..." once the model
            // is loaded and the serving loop starts
            if line.contains("server is listening")
                || line.contains("HTTP server listening")
                || line.contains("starting the main loop")
            {
                return Ok(());
            }

            // Check for load failures
            if line.contains("failed to load model")
                || line.contains("error loading model")
                || line.contains("error while loading")
            {
                // Capture more context
                let mut error_lines = vec![line.clone()];
                for _ in 0..5 {
                    if let Ok(Some(next_line)) = reader.next_line().await {
                        error_lines.push(next_line);
                    } else {
                        break;
                    }
                }
                return Err(error_lines.join("\n"));
            }

            // Check for out of memory
            if line.contains("out of memory") || line.contains("CUDA error") {
                return Err(format!("Out of GPU memory: {}", line));
            }

            // Check for unsupported weights
            if line.contains("unknown model architecture") || line.contains("unsupported model") {
                return Err(format!("Invalid or unsupported model type: {}", line));
            }
        }

        // If we get here, process exited without success indicator
        Err("llama-server process exited unexpectedly without starting".to_string())
    }
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::new()
    }
}
