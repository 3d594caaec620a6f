//! Model download functionality using hf-hub
//!
//! Downloads checkpoint snapshots from the HuggingFace Hub into the
//! standard cache layout using the native Rust hf-hub crate. Weight
//! filenames vary wildly across GGUF repos, so the repo file listing
//! drives selection instead of a fixed name list.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};

use crate::models::cache;
use crate::models::weights::candidate_priority;

/// Support files worth fetching when the repo has them.
const SUPPORT_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.json",
    "merges.txt",
];

/// Download a model from HuggingFace Hub
///
/// # Arguments
/// * `model_id` - The model identifier (e.g., "nomic-ai/gpt4all-falcon")
///
/// # Returns
/// * `Ok(PathBuf)` - Path to the downloaded model's snapshot directory
pub async fn download_model(model_id: &str) -> Result<PathBuf> {
    download_model_to_cache(model_id, None, false).await
}

/// Download a model to a specific cache directory
///
/// # Arguments
/// * `model_id` - The model identifier (e.g., "nomic-ai/gpt4all-falcon")
/// * `cache_dir` - Optional custom cache directory. If None, uses default HF cache.
/// * `force` - Evict any cached copy before downloading.
///
/// # Returns
/// * `Ok(PathBuf)` - Path to the downloaded model's snapshot directory
pub async fn download_model_to_cache(
    model_id: &str,
    cache_dir: Option<PathBuf>,
    force: bool,
) -> Result<PathBuf> {
    tracing::info!(model_id = %model_id, cache_dir = ?cache_dir, force = force, "Starting model download via hf-hub");

    if force {
        let evicted = match &cache_dir {
            Some(dir) => cache::evict_model_in(dir, model_id)?,
            None => cache::evict_model(model_id)?,
        };
        if evicted {
            tracing::info!(model_id = %model_id, "Evicted cached snapshot before re-download");
        }
    }

    let api = match cache_dir {
        Some(dir) => ApiBuilder::new()
            .with_cache_dir(dir)
            .build()
            .context("Failed to create HF API client")?,
        None => Api::new().context("Failed to create HF API client")?,
    };

    let repo = api.model(model_id.to_string());

    let info = repo
        .info()
        .await
        .map_err(|e| anyhow!("Failed to list files for {}: {}", model_id, e))?;
    let filenames: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();

    let mut snapshot_marker: Option<PathBuf> = None;

    for file in SUPPORT_FILES {
        if !filenames.iter().any(|f| f == file) {
            continue;
        }
        tracing::debug!(model_id = %model_id, file = %file, "Downloading support file");
        let path = repo
            .get(file)
            .await
            .map_err(|e| anyhow!("Failed to download {}: {}", file, e))?;
        snapshot_marker.get_or_insert(path);
    }

    let weights = match pick_weight_file(&filenames) {
        Some(name) => Some(name),
        None if filenames.iter().any(|f| f == "model.safetensors.index.json") => {
            let path = download_sharded_weights(&repo, model_id).await?;
            snapshot_marker.get_or_insert(path);
            None
        }
        None => {
            return Err(anyhow!(
                "Repo {} contains no recognized weight files",
                model_id
            ));
        }
    };

    if let Some(name) = weights {
        tracing::info!(model_id = %model_id, file = %name, "Downloading weight file");
        let path = repo
            .get(&name)
            .await
            .map_err(|e| anyhow!("Failed to download {}: {}", name, e))?;
        snapshot_marker.get_or_insert(path);
    }

    // The snapshot directory is the parent of any downloaded file
    snapshot_marker
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .ok_or_else(|| {
            anyhow!(
                "Model downloaded but snapshot path not found for {}",
                model_id
            )
        })
}

/// Choose the single weight file to fetch from a repo listing.
///
/// Best extension class first; within GGUF repos that publish many
/// quantizations, prefer the common q4 variants over pulling the
/// largest file across the wire.
fn pick_weight_file(filenames: &[String]) -> Option<String> {
    let mut candidates: Vec<(usize, usize, &String)> = filenames
        .iter()
        .filter_map(|name| {
            let rank = candidate_priority(name)?;
            Some((rank, quant_preference(name), name))
        })
        .collect();

    candidates.sort();
    candidates.first().map(|(_, _, name)| (*name).clone())
}

fn quant_preference(name: &str) -> usize {
    let lower = name.to_lowercase();
    if lower.contains("q4_k_m") {
        0
    } else if lower.contains("q4_0") {
        1
    } else {
        2
    }
}

/// Download sharded safetensors referenced by the index file.
///
/// Returns the local path of the index file as the snapshot marker.
async fn download_sharded_weights(repo: &ApiRepo, model_id: &str) -> Result<PathBuf> {
    let index_path = repo
        .get("model.safetensors.index.json")
        .await
        .map_err(|e| anyhow!("Failed to get index file: {}", e))?;

    let index_content = tokio::fs::read_to_string(&index_path)
        .await
        .context("Failed to read index file")?;
    let index: serde_json::Value =
        serde_json::from_str(&index_content).context("Failed to parse index file")?;

    let shards: std::collections::BTreeSet<&str> = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .map(|map| map.values().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    if shards.is_empty() {
        return Err(anyhow!("Index file for {} lists no shards", model_id));
    }

    tracing::info!(
        model_id = %model_id,
        shard_count = shards.len(),
        "Downloading sharded weights"
    );

    for shard in shards {
        tracing::debug!(model_id = %model_id, shard = %shard, "Downloading shard");
        repo.get(shard)
            .await
            .map_err(|e| anyhow!("Failed to download shard {}: {}", shard, e))?;
    }

    Ok(index_path)
}
