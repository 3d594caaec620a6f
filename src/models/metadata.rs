//! Model metadata parsing
//!
//! Parses model configuration from HuggingFace's config.json files to
//! extract architecture type, context length, and size hints. GGUF-only
//! repos ship no config.json; callers must treat metadata as optional.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model metadata extracted from HuggingFace config.json
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ModelMetadata {
    /// Model architecture type (e.g., "llama", "falcon", "gptj")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Hidden size / embedding width
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<u32>,

    /// Maximum context length in tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,

    /// Vocabulary size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u32>,

    /// Number of hidden layers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<u32>,

    /// Number of attention heads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_attention_heads: Option<u32>,
}

/// Raw config.json structure (partial)
#[derive(Debug, Deserialize)]
struct RawConfig {
    model_type: Option<String>,
    hidden_size: Option<u32>,
    max_position_embeddings: Option<u32>,
    vocab_size: Option<u32>,
    num_hidden_layers: Option<u32>,
    num_attention_heads: Option<u32>,
    // GPT-2 style configs use different names
    n_embd: Option<u32>,
    n_positions: Option<u32>,
    n_ctx: Option<u32>,
    n_layer: Option<u32>,
    n_head: Option<u32>,
}

/// Parse model metadata from a snapshot's config.json
///
/// # Arguments
/// * `snapshot_dir` - Path to the model's snapshot directory
///
/// # Returns
/// * `Some(ModelMetadata)` if config.json exists and is valid
/// * `None` if config.json doesn't exist or can't be parsed
pub fn parse_model_config(snapshot_dir: &Path) -> Option<ModelMetadata> {
    let config_path = snapshot_dir.join("config.json");

    if !config_path.exists() {
        return None;
    }

    let content = std::fs::read_to_string(&config_path).ok()?;
    let raw: RawConfig = serde_json::from_str(&content).ok()?;

    Some(ModelMetadata {
        model_type: raw.model_type,
        hidden_size: raw.hidden_size.or(raw.n_embd),
        context_length: raw
            .max_position_embeddings
            .or(raw.n_positions)
            .or(raw.n_ctx),
        vocab_size: raw.vocab_size,
        num_hidden_layers: raw.num_hidden_layers.or(raw.n_layer),
        num_attention_heads: raw.num_attention_heads.or(raw.n_head),
    })
}

/// Estimate number of parameters from model metadata
///
/// Rough transformer estimate: embedding table plus 12 * hidden^2 per
/// layer (attention and FFN blocks).
pub fn estimate_parameters(metadata: &ModelMetadata) -> Option<u64> {
    let hidden = metadata.hidden_size? as u64;
    let layers = metadata.num_hidden_layers? as u64;
    let vocab = metadata.vocab_size? as u64;

    let embedding_params = vocab * hidden;
    let layer_params = layers * 12 * hidden * hidden;

    Some(embedding_params + layer_params)
}
