//! Weight-file discovery inside cached snapshots
//!
//! Snapshots mix weight files with configs, tokenizers, and READMEs.
//! Selection is deterministic: GGUF beats safetensors beats pytorch
//! `.bin`, larger files beat smaller ones within a class, and names
//! break the remaining ties.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

/// Extensions that can hold weights, in preference order.
const WEIGHT_EXTENSIONS: &[&str] = &["gguf", "safetensors", "bin"];

/// `.bin` files that are training artifacts, not weights.
const NON_WEIGHT_BIN_FILES: &[&str] = &["training_args.bin", "optimizer.bin", "rng_state.bin"];

/// Preference rank for a candidate file name; `None` for non-weight
/// files. Also used to rank remote repo listings before download.
pub(crate) fn candidate_priority(file_name: &str) -> Option<usize> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    let rank = WEIGHT_EXTENSIONS
        .iter()
        .position(|e| ext.eq_ignore_ascii_case(e))?;

    if ext.eq_ignore_ascii_case("bin") && NON_WEIGHT_BIN_FILES.contains(&file_name) {
        return None;
    }

    Some(rank)
}

fn weight_priority(path: &Path) -> Option<usize> {
    candidate_priority(path.file_name()?.to_str()?)
}

/// Whether the directory holds at least one loadable weight file.
pub fn has_model_files(snapshot_dir: &Path) -> bool {
    find_weights_file(snapshot_dir).is_some()
}

/// Pick the weights file a runtime should load from this snapshot.
pub fn find_weights_file(snapshot_dir: &Path) -> Option<PathBuf> {
    list_weight_files(snapshot_dir).into_iter().next()
}

/// All weight candidates in the snapshot, best first.
pub fn list_weight_files(snapshot_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(snapshot_dir) else {
        return Vec::new();
    };

    let mut candidates: Vec<(usize, Reverse<u64>, String, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(rank) = weight_priority(&path) else {
            continue;
        };
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if let Some(name) = name {
            candidates.push((rank, Reverse(size), name, path));
        }
    }

    candidates.sort();
    candidates.into_iter().map(|(_, _, _, path)| path).collect()
}
