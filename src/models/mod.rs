//! Model management module
//!
//! Provides functionality for:
//! - Detecting checkpoints in the HuggingFace cache
//! - Downloading checkpoints from HuggingFace Hub
//! - Discovering weight files inside a snapshot
//! - Parsing model metadata from config.json
//! - Tracking model status (available, downloaded, verified)
//! - Smoke testing model loading

pub mod cache;
pub mod download;
pub mod loader;
pub mod metadata;
pub mod registry;
pub mod weights;

pub use cache::{
    evict_model, get_cache_dir, get_model_cache_path, is_model_cached, list_cached_models,
};
pub use download::{download_model, download_model_to_cache};
pub use loader::{LoaderConfig, ModelLoader};
pub use metadata::{ModelMetadata, parse_model_config};
pub use registry::{CacheInfo, ModelEntry, ModelRegistry, ModelStatus};
pub use weights::{find_weights_file, has_model_files, list_weight_files};
