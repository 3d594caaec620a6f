//! HuggingFace cache detection utilities
//!
//! Detects checkpoints downloaded to the HuggingFace cache directory.
//! Cache structure:
//! ```text
//! ~/.cache/huggingface/hub/
//! ├── models--nomic-ai--gpt4all-falcon/
//! │   ├── snapshots/
//! │   │   └── {revision}/
//! │   │       ├── config.json
//! │   │       └── gpt4all-falcon-q4_0.gguf
//! │   └── refs/
//! │       └── main
//! └── models--TheBloke--Mistral-7B-Instruct-v0.2-GGUF/
//!     └── ...
//! ```
//!
//! A snapshot counts as a usable checkpoint when it contains at least
//! one weight file; GGUF-only repos ship no `config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::weights::has_model_files;

/// Get the HuggingFace cache directory
///
/// Checks in order:
/// 1. `$HF_HOME/hub`
/// 2. `$XDG_CACHE_HOME/huggingface/hub`
/// 3. `~/.cache/huggingface/hub`
pub fn get_cache_dir() -> PathBuf {
    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return PathBuf::from(hf_home).join("hub");
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("huggingface/hub");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache/huggingface/hub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/llm-manager-cache"))
}

/// Convert model ID to cache directory name
///
/// HuggingFace uses `models--{org}--{name}` format
/// e.g., "nomic-ai/gpt4all-falcon" -> "models--nomic-ai--gpt4all-falcon"
pub(crate) fn model_id_to_cache_name(model_id: &str) -> String {
    format!("models--{}", model_id.replace('/', "--"))
}

/// Convert cache directory name back to model ID
///
/// e.g., "models--nomic-ai--gpt4all-falcon" -> "nomic-ai/gpt4all-falcon"
fn cache_name_to_model_id(cache_name: &str) -> Option<String> {
    cache_name
        .strip_prefix("models--")
        .map(|s| s.replacen("--", "/", 1))
}

/// Check if a model has a usable cached snapshot
pub fn is_model_cached(model_id: &str) -> bool {
    is_model_cached_in(&get_cache_dir(), model_id)
}

/// `is_model_cached` against an explicit cache root
pub fn is_model_cached_in(cache_dir: &Path, model_id: &str) -> bool {
    let snapshots_dir = cache_dir
        .join(model_id_to_cache_name(model_id))
        .join("snapshots");
    if !snapshots_dir.exists() {
        return false;
    }

    if let Ok(entries) = std::fs::read_dir(&snapshots_dir) {
        for entry in entries.flatten() {
            if has_model_files(&entry.path()) {
                return true;
            }
        }
    }

    false
}

/// Get the cache path for a model's current snapshot
///
/// Resolves `refs/main` first, then falls back to any snapshot that
/// contains model files.
pub fn get_model_cache_path(model_id: &str) -> Option<PathBuf> {
    get_model_cache_path_in(&get_cache_dir(), model_id)
}

/// `get_model_cache_path` against an explicit cache root
pub fn get_model_cache_path_in(cache_dir: &Path, model_id: &str) -> Option<PathBuf> {
    let model_dir = cache_dir.join(model_id_to_cache_name(model_id));

    let refs_main = model_dir.join("refs/main");
    if refs_main.exists()
        && let Ok(revision) = std::fs::read_to_string(&refs_main)
    {
        let snapshot_path = model_dir.join("snapshots").join(revision.trim());
        if snapshot_path.exists() {
            return Some(snapshot_path);
        }
    }

    let snapshots_dir = model_dir.join("snapshots");
    if let Ok(entries) = std::fs::read_dir(&snapshots_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if has_model_files(&path) {
                return Some(path);
            }
        }
    }

    None
}

/// Get the total size of a cached model in bytes
pub fn get_cache_size(model_id: &str) -> Option<u64> {
    get_cache_size_in(&get_cache_dir(), model_id)
}

/// `get_cache_size` against an explicit cache root
pub fn get_cache_size_in(cache_dir: &Path, model_id: &str) -> Option<u64> {
    let model_dir = cache_dir.join(model_id_to_cache_name(model_id));

    if !model_dir.exists() {
        return None;
    }

    Some(dir_size(&model_dir))
}

/// Recursively calculate directory size
fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}

/// Remove a model's cached repo directory entirely
///
/// Returns `true` when something was removed. Used by forced
/// re-downloads (`use_cache == false`) and the cache-eviction route.
pub fn evict_model(model_id: &str) -> Result<bool> {
    evict_model_in(&get_cache_dir(), model_id)
}

/// `evict_model` against an explicit cache root
pub fn evict_model_in(cache_dir: &Path, model_id: &str) -> Result<bool> {
    let model_dir = cache_dir.join(model_id_to_cache_name(model_id));

    if !model_dir.exists() {
        return Ok(false);
    }

    std::fs::remove_dir_all(&model_dir)
        .with_context(|| format!("Failed to evict cached model at {}", model_dir.display()))?;
    Ok(true)
}

/// List all cached models
///
/// Returns model IDs for all usable checkpoints found in the cache
pub fn list_cached_models() -> Vec<String> {
    list_cached_models_in(&get_cache_dir())
}

/// `list_cached_models` against an explicit cache root
pub fn list_cached_models_in(cache_dir: &Path) -> Vec<String> {
    if !cache_dir.exists() {
        return Vec::new();
    }

    let mut models = Vec::new();

    if let Ok(entries) = std::fs::read_dir(cache_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();

            if !name.starts_with("models--") {
                continue;
            }

            if let Some(model_id) = cache_name_to_model_id(&name)
                && is_model_cached_in(cache_dir, &model_id)
            {
                models.push(model_id);
            }
        }
    }

    models.sort();
    models
}

/// Build a fake cached model under `cache_dir` and return the snapshot
/// path. Shared by unit tests across the models module.
#[cfg(test)]
pub(crate) fn seed_cached_model(
    cache_dir: &Path,
    model_id: &str,
    revision: &str,
    files: &[(&str, &str)],
) -> PathBuf {
    let model_dir = cache_dir.join(model_id_to_cache_name(model_id));
    let snapshot = model_dir.join("snapshots").join(revision);
    std::fs::create_dir_all(&snapshot).unwrap();
    std::fs::create_dir_all(model_dir.join("refs")).unwrap();
    std::fs::write(model_dir.join("refs/main"), revision).unwrap();
    for (name, contents) in files {
        std::fs::write(snapshot.join(name), contents).unwrap();
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_model_id_to_cache_name() {
        assert_eq!(
            model_id_to_cache_name("nomic-ai/gpt4all-falcon"),
            "models--nomic-ai--gpt4all-falcon"
        );
        assert_eq!(
            model_id_to_cache_name("TheBloke/Mistral-7B-Instruct-v0.2-GGUF"),
            "models--TheBloke--Mistral-7B-Instruct-v0.2-GGUF"
        );
    }

    #[test]
    fn test_cache_name_to_model_id() {
        assert_eq!(
            cache_name_to_model_id("models--nomic-ai--gpt4all-falcon"),
            Some("nomic-ai/gpt4all-falcon".to_string())
        );
        assert_eq!(cache_name_to_model_id("not-a-model"), None);
    }

    #[test]
    fn test_roundtrip() {
        let model_id = "nomic-ai/gpt4all-falcon";
        let cache_name = model_id_to_cache_name(model_id);
        let recovered = cache_name_to_model_id(&cache_name);
        assert_eq!(recovered, Some(model_id.to_string()));
    }

    #[test]
    #[serial]
    fn test_get_cache_dir_default() {
        unsafe {
            std::env::remove_var("HF_HOME");
            std::env::remove_var("XDG_CACHE_HOME");
        }

        let cache_dir = get_cache_dir();
        assert!(cache_dir.to_string_lossy().contains("huggingface/hub"));
    }

    #[test]
    #[serial]
    fn test_get_cache_dir_hf_home_wins() {
        unsafe {
            std::env::set_var("HF_HOME", "/opt/hf");
            std::env::set_var("XDG_CACHE_HOME", "/opt/xdg");
        }

        assert_eq!(get_cache_dir(), PathBuf::from("/opt/hf/hub"));

        unsafe {
            std::env::remove_var("HF_HOME");
        }
        assert_eq!(get_cache_dir(), PathBuf::from("/opt/xdg/huggingface/hub"));

        unsafe {
            std::env::remove_var("XDG_CACHE_HOME");
        }
    }

    #[test]
    fn test_is_model_cached_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        assert!(!is_model_cached_in(
            temp.path(),
            "nonexistent-org/nonexistent-model-12345"
        ));
    }

    #[test]
    fn test_is_model_cached_requires_weight_files() {
        let temp = tempfile::tempdir().unwrap();

        // Snapshot with only a config is not a usable checkpoint
        seed_cached_model(temp.path(), "org/cfg-only", "abc123", &[("config.json", "{}")]);
        assert!(!is_model_cached_in(temp.path(), "org/cfg-only"));

        seed_cached_model(
            temp.path(),
            "org/with-weights",
            "abc123",
            &[("model-q4_0.gguf", "GGUF")],
        );
        assert!(is_model_cached_in(temp.path(), "org/with-weights"));
    }

    #[test]
    fn test_get_model_cache_path_via_refs_main() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = seed_cached_model(
            temp.path(),
            "org/model",
            "deadbeef",
            &[("model-q4_0.gguf", "GGUF")],
        );

        assert_eq!(
            get_model_cache_path_in(temp.path(), "org/model"),
            Some(snapshot)
        );
    }

    #[test]
    fn test_get_model_cache_path_falls_back_without_refs() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = seed_cached_model(
            temp.path(),
            "org/model",
            "deadbeef",
            &[("model-q4_0.gguf", "GGUF")],
        );

        // Point refs/main at a revision that is gone
        let model_dir = temp.path().join(model_id_to_cache_name("org/model"));
        std::fs::write(model_dir.join("refs/main"), "missing-revision").unwrap();

        assert_eq!(
            get_model_cache_path_in(temp.path(), "org/model"),
            Some(snapshot)
        );
    }

    #[test]
    fn test_get_model_cache_path_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        assert!(get_model_cache_path_in(temp.path(), "nonexistent-org/model").is_none());
    }

    #[test]
    fn test_get_cache_size_counts_all_files() {
        let temp = tempfile::tempdir().unwrap();
        seed_cached_model(
            temp.path(),
            "org/model",
            "abc",
            &[("model-q4_0.gguf", "12345"), ("config.json", "{}")],
        );

        // 5 bytes weights + 2 bytes config + 3 bytes refs/main content
        let size = get_cache_size_in(temp.path(), "org/model").unwrap();
        assert_eq!(size, 10);
    }

    #[test]
    fn test_get_cache_size_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        assert!(get_cache_size_in(temp.path(), "nonexistent-org/model").is_none());
    }

    #[test]
    fn test_evict_model_removes_repo_dir() {
        let temp = tempfile::tempdir().unwrap();
        seed_cached_model(
            temp.path(),
            "org/model",
            "abc",
            &[("model-q4_0.gguf", "GGUF")],
        );

        assert!(is_model_cached_in(temp.path(), "org/model"));
        assert!(evict_model_in(temp.path(), "org/model").unwrap());
        assert!(!is_model_cached_in(temp.path(), "org/model"));

        // Second eviction is a no-op
        assert!(!evict_model_in(temp.path(), "org/model").unwrap());
    }

    #[test]
    fn test_list_cached_models_sorted_and_filtered() {
        let temp = tempfile::tempdir().unwrap();
        seed_cached_model(
            temp.path(),
            "zeta/model",
            "abc",
            &[("model-q4_0.gguf", "GGUF")],
        );
        seed_cached_model(
            temp.path(),
            "alpha/model",
            "abc",
            &[("model.safetensors", "ST")],
        );
        // Config-only repo must not be listed
        seed_cached_model(temp.path(), "org/cfg-only", "abc", &[("config.json", "{}")]);
        // Stray non-model directory is ignored
        std::fs::create_dir_all(temp.path().join("datasets--org--name")).unwrap();

        let models = list_cached_models_in(temp.path());
        assert_eq!(models, vec!["alpha/model", "zeta/model"]);
    }

    #[test]
    fn test_dir_size_nested_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();

        let subdir = temp_dir.path().join("subdir");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(subdir.join("file1.txt"), "abc").unwrap();
        std::fs::write(temp_dir.path().join("file2.txt"), "defgh").unwrap();

        assert_eq!(dir_size(temp_dir.path()), 8);
    }
}
