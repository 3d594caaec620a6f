//! State persistence for runtime configurations

use crate::config::RuntimeConfig;
use crate::registry::Registry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write state file")?;
        file.sync_all().await.context("Failed to sync state file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp state file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file: {:?}", path))?;

        Ok(Some(content))
    }
}

// ============================================================================
// State Manager with Dependency Injection
// ============================================================================

/// State manager for persisting runtime configurations
pub struct StateManager {
    state_file: PathBuf,
    registry: Arc<Registry>,
    server_binary_path: Arc<str>,
    storage: Arc<dyn StorageBackend>,
    /// Guard to prevent concurrent restore operations
    restore_in_progress: AtomicBool,
}

impl StateManager {
    /// Create a new state manager with custom storage backend
    pub fn new_with_storage(
        state_file: PathBuf,
        registry: Arc<Registry>,
        server_binary_path: String,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            state_file,
            registry,
            server_binary_path: Arc::from(server_binary_path),
            storage,
            restore_in_progress: AtomicBool::new(false),
        }
    }

    /// Create a new state manager with default filesystem storage
    pub fn new(state_file: PathBuf, registry: Arc<Registry>, server_binary_path: String) -> Self {
        Self::new_with_storage(
            state_file,
            registry,
            server_binary_path,
            Arc::new(FileSystemStorage::new()),
        )
    }

    /// Save current state to disk atomically
    pub async fn save(&self) -> Result<()> {
        let runtimes = self.registry.list().await;

        let state = SavedState {
            last_updated: chrono::Utc::now(),
            runtimes: runtimes.iter().map(|r| r.config.clone()).collect(),
        };

        let toml_content =
            toml::to_string_pretty(&state).context("Failed to serialize state to TOML")?;

        self.storage.save(&self.state_file, &toml_content).await?;

        tracing::debug!(
            path = ?self.state_file,
            runtimes = state.runtimes.len(),
            "State saved"
        );

        Ok(())
    }

    /// Load state from disk
    /// FAILS HARD if state file is corrupted - user must fix or delete
    pub async fn load(&self) -> Result<SavedState> {
        let content = self.storage.load(&self.state_file).await?;

        let content = match content {
            Some(c) => c,
            None => {
                tracing::info!("No state file found, starting fresh");
                return Ok(SavedState::default());
            }
        };

        let state: SavedState = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse state file: {:?}. File may be corrupted. \
                Please delete or fix the file manually.",
                self.state_file
            )
        })?;

        tracing::info!(
            runtimes = state.runtimes.len(),
            last_updated = %state.last_updated,
            "State loaded from disk"
        );

        Ok(state)
    }

    /// Restore runtimes from saved state
    ///
    /// This function is guarded against concurrent execution. If a restore is already
    /// in progress, this call will return an error rather than starting a new restore
    /// that could conflict with the in-flight operations.
    ///
    /// Spawned readiness-check tasks are tracked via JoinSet and awaited before
    /// returning, ensuring the restore operation is fully complete.
    pub async fn restore(&self) -> Result<()> {
        self.restore_with_options(true).await
    }

    /// Restore runtimes with configurable readiness wait
    ///
    /// Set `wait_for_ready` to false to skip waiting for runtimes to become ready
    /// (useful for tests where no real server answers health checks).
    pub async fn restore_with_options(&self, wait_for_ready: bool) -> Result<()> {
        // Attempt to acquire the restore guard
        if self
            .restore_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("Restore operation already in progress");
        }

        // Ensure we release the guard on exit (success or failure)
        let _guard = RestoreGuard {
            flag: &self.restore_in_progress,
        };

        let state = self.load().await?;

        if state.runtimes.is_empty() {
            tracing::info!("No runtimes to restore");
            return Ok(());
        }

        tracing::info!(
            runtimes = state.runtimes.len(),
            "Restoring runtimes from state"
        );

        let mut restored = 0;
        let mut failed = 0;
        let mut readiness_tasks: JoinSet<(String, Result<(), anyhow::Error>)> = JoinSet::new();

        for config in state.runtimes {
            match self.registry.add(config.clone()).await {
                Ok(runtime) => {
                    if let Err(e) = runtime.start(&self.server_binary_path).await {
                        tracing::error!(
                            runtime = %config.name,
                            error = %e,
                            "Failed to start restored runtime"
                        );
                        failed += 1;
                    } else {
                        if wait_for_ready && config.kind.needs_process() {
                            // Track background task for readiness check
                            let runtime_clone = runtime.clone();
                            let runtime_name = config.name.clone();
                            readiness_tasks.spawn(async move {
                                use crate::health::HealthChecker;
                                use std::time::Duration;

                                let result = HealthChecker::wait_for_ready(
                                    &runtime_clone,
                                    Duration::from_secs(300),
                                    Duration::from_millis(500),
                                )
                                .await;

                                if let Err(ref e) = result {
                                    tracing::error!(
                                        runtime = %runtime_clone.config.name,
                                        error = %e,
                                        "Restored runtime failed to become ready"
                                    );
                                    *runtime_clone.status.write().await =
                                        crate::runtime::RuntimeStatus::Failed;
                                }

                                (runtime_name, result)
                            });
                        }
                        restored += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        runtime = %config.name,
                        error = %e,
                        "Failed to restore runtime"
                    );
                    failed += 1;
                }
            }
        }

        // Wait for all readiness checks to complete
        let mut readiness_failed = 0;
        while let Some(result) = readiness_tasks.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    tracing::debug!(runtime = %name, "Runtime readiness check completed");
                }
                Ok((name, Err(_))) => {
                    tracing::warn!(runtime = %name, "Runtime readiness check failed");
                    readiness_failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Readiness task panicked");
                    readiness_failed += 1;
                }
            }
        }

        tracing::info!(
            restored = restored,
            failed = failed,
            readiness_failed = readiness_failed,
            "Runtime restoration complete"
        );

        Ok(())
    }
}

/// RAII guard to ensure restore_in_progress flag is cleared on drop
struct RestoreGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedState {
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub runtimes: Vec<RuntimeConfig>,
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
