//! Model registry for tracking known checkpoints and their status

use super::cache::{
    get_cache_dir, get_cache_size_in, get_model_cache_path_in, is_model_cached_in,
    list_cached_models_in,
};
use super::metadata::{ModelMetadata, parse_model_config};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Status of a model in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Model is known but not downloaded
    Available,
    /// Model is currently being downloaded
    Downloading,
    /// Model snapshot is present in the cache
    Downloaded,
    /// Model is currently being loaded (smoke test in progress)
    Loading,
    /// Model has been verified (smoke test passed)
    Verified,
    /// Model failed to load (smoke test failed)
    Failed,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Downloading => write!(f, "downloading"),
            Self::Downloaded => write!(f, "downloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Information about a cached model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Path to the model's snapshot directory
    pub path: PathBuf,
    /// Total size of cached files in bytes
    pub size_bytes: u64,
}

fn default_use_cache() -> bool {
    true
}

/// Entry for a model in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// HuggingFace model ID (e.g., "nomic-ai/gpt4all-falcon")
    pub model_id: String,
    /// Current status
    pub status: ModelStatus,
    /// Whether downloads may reuse an existing cached snapshot
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Cache information if downloaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_info: Option<CacheInfo>,
    /// Metadata from config.json
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ModelMetadata>,
    /// When the model was last verified (smoke test)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    /// Error message if verification failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_error: Option<String>,
    /// When this entry was added to the registry
    pub added_at: DateTime<Utc>,
}

impl ModelEntry {
    /// Create a new model entry
    pub fn new(model_id: String) -> Self {
        Self {
            model_id,
            status: ModelStatus::Available,
            use_cache: true,
            cache_info: None,
            metadata: None,
            last_verified: None,
            verification_error: None,
            added_at: Utc::now(),
        }
    }

    /// Override the cached-snapshot reuse preference
    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Update entry with cache information from the given cache root
    pub fn with_cache_info(mut self, cache_dir: &Path) -> Self {
        if is_model_cached_in(cache_dir, &self.model_id)
            && let Some(path) = get_model_cache_path_in(cache_dir, &self.model_id)
        {
            let size_bytes = get_cache_size_in(cache_dir, &self.model_id).unwrap_or(0);
            self.cache_info = Some(CacheInfo { path, size_bytes });
            self.status = ModelStatus::Downloaded;
        }
        self
    }

    /// Update entry with metadata from config.json
    pub fn with_metadata(mut self) -> Self {
        if let Some(ref cache_info) = self.cache_info {
            self.metadata = parse_model_config(&cache_info.path);
        }
        self
    }

    /// Refresh cache and metadata information
    pub fn refresh(&mut self, cache_dir: &Path) {
        if is_model_cached_in(cache_dir, &self.model_id) {
            if let Some(path) = get_model_cache_path_in(cache_dir, &self.model_id) {
                let size_bytes = get_cache_size_in(cache_dir, &self.model_id).unwrap_or(0);
                self.cache_info = Some(CacheInfo {
                    path: path.clone(),
                    size_bytes,
                });
                self.metadata = parse_model_config(&path);

                // Available -> Downloaded and Downloading -> Downloaded;
                // verification outcomes are left alone
                if self.status == ModelStatus::Available || self.status == ModelStatus::Downloading
                {
                    self.status = ModelStatus::Downloaded;
                }
            }
        } else {
            // Snapshot is gone (evicted or never fetched)
            self.cache_info = None;
            self.metadata = None;
            self.status = ModelStatus::Available;
        }
    }
}

/// Registry for tracking models
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<String, ModelEntry>>>,
    cache_dir: PathBuf,
}

impl ModelRegistry {
    /// Create a new empty registry against the ambient HF cache
    pub fn new() -> Self {
        Self::with_cache_dir(get_cache_dir())
    }

    /// Create a new empty registry against an explicit cache root
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            models: Arc::new(RwLock::new(HashMap::new())),
            cache_dir,
        }
    }

    /// Initialize registry with configured models and discover cached models
    pub async fn init(configured_models: Vec<String>, cache_dir: Option<PathBuf>) -> Self {
        let registry = match cache_dir {
            Some(dir) => Self::with_cache_dir(dir),
            None => Self::new(),
        };

        for model_id in configured_models {
            registry.add_model(model_id).await;
        }

        registry.discover_cached_models().await;

        registry
    }

    /// The cache root this registry inspects
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Add a model to the registry with the default cache preference
    pub async fn add_model(&self, model_id: String) -> ModelEntry {
        self.add_model_with_options(model_id, true).await
    }

    /// Add a model to the registry
    pub async fn add_model_with_options(&self, model_id: String, use_cache: bool) -> ModelEntry {
        let entry = ModelEntry::new(model_id.clone())
            .with_use_cache(use_cache)
            .with_cache_info(&self.cache_dir)
            .with_metadata();

        let mut models = self.models.write().await;
        models.insert(model_id, entry.clone());

        entry
    }

    /// Remove a model entry; returns true when one existed
    pub async fn remove(&self, model_id: &str) -> bool {
        let mut models = self.models.write().await;
        models.remove(model_id).is_some()
    }

    /// Get a model entry by ID
    pub async fn get(&self, model_id: &str) -> Option<ModelEntry> {
        let models = self.models.read().await;
        models.get(model_id).cloned()
    }

    /// Get a model entry, refreshing cache info first
    pub async fn get_refreshed(&self, model_id: &str) -> Option<ModelEntry> {
        let mut models = self.models.write().await;

        if let Some(entry) = models.get_mut(model_id) {
            entry.refresh(&self.cache_dir);
            return Some(entry.clone());
        }

        None
    }

    /// List all models
    pub async fn list(&self) -> Vec<ModelEntry> {
        let models = self.models.read().await;
        let mut entries: Vec<_> = models.values().cloned().collect();
        entries.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        entries
    }

    /// Check if a model is in the registry
    pub async fn contains(&self, model_id: &str) -> bool {
        let models = self.models.read().await;
        models.contains_key(model_id)
    }

    /// Update model status
    pub async fn set_status(&self, model_id: &str, status: ModelStatus) {
        let mut models = self.models.write().await;
        if let Some(entry) = models.get_mut(model_id) {
            entry.status = status;
        }
    }

    /// Mark model as verified
    pub async fn set_verified(&self, model_id: &str) {
        let mut models = self.models.write().await;
        if let Some(entry) = models.get_mut(model_id) {
            entry.status = ModelStatus::Verified;
            entry.last_verified = Some(Utc::now());
            entry.verification_error = None;
        }
    }

    /// Mark model as failed with error message
    pub async fn set_failed(&self, model_id: &str, error: String) {
        let mut models = self.models.write().await;
        if let Some(entry) = models.get_mut(model_id) {
            entry.status = ModelStatus::Failed;
            entry.verification_error = Some(error);
        }
    }

    /// Discover and add cached models not already in registry
    pub async fn discover_cached_models(&self) {
        let cached = list_cached_models_in(&self.cache_dir);

        for model_id in cached {
            if !self.contains(&model_id).await {
                tracing::info!(model_id = %model_id, "Discovered cached model");
                self.add_model(model_id).await;
            }
        }
    }

    /// Refresh cache info for all models
    pub async fn refresh_all(&self) {
        let mut models = self.models.write().await;
        for entry in models.values_mut() {
            entry.refresh(&self.cache_dir);
        }
    }

    /// Get count of models in registry
    pub async fn count(&self) -> usize {
        let models = self.models.read().await;
        models.len()
    }

    /// Get count of downloaded models
    pub async fn downloaded_count(&self) -> usize {
        let models = self.models.read().await;
        models.values().filter(|e| e.cache_info.is_some()).count()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
