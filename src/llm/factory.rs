//! Construction of model variants from configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::{Gpt4All, Llm, MockLlm};

/// Which concrete variant backs a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Gpt4All,
    Mock,
}

impl ModelKind {
    /// Whether this variant serves from a local checkpoint and
    /// therefore needs a spawned runtime process.
    pub fn needs_process(self) -> bool {
        matches!(self, ModelKind::Gpt4All)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Gpt4All => write!(f, "gpt4all"),
            ModelKind::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpt4all" => Ok(ModelKind::Gpt4All),
            "mock" => Ok(ModelKind::Mock),
            other => Err(LlmError::UnknownKind(other.to_string())),
        }
    }
}

/// Build a model variant for a runtime.
///
/// `use_cache` and `cache_dir` only matter for checkpoint-backed
/// variants; the mock ignores both.
pub fn build_model(
    kind: ModelKind,
    model_id: &str,
    use_cache: bool,
    cache_dir: Option<PathBuf>,
) -> Arc<dyn Llm> {
    match kind {
        ModelKind::Gpt4All => {
            let mut model = Gpt4All::new(model_id).with_use_cache(use_cache);
            if let Some(dir) = cache_dir {
                model = model.with_cache_dir(dir);
            }
            Arc::new(model)
        }
        ModelKind::Mock => Arc::new(MockLlm::new(model_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!(ModelKind::from_str("gpt4all").unwrap(), ModelKind::Gpt4All);
        assert_eq!(ModelKind::from_str("Gpt4All").unwrap(), ModelKind::Gpt4All);
        assert_eq!(ModelKind::from_str("MOCK").unwrap(), ModelKind::Mock);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let err = ModelKind::from_str("bert").unwrap_err();
        assert!(matches!(err, LlmError::UnknownKind(k) if k == "bert"));
    }

    #[test]
    fn kind_display_matches_serde() {
        let json = serde_json::to_string(&ModelKind::Gpt4All).unwrap();
        assert_eq!(json, format!("\"{}\"", ModelKind::Gpt4All));
        let json = serde_json::to_string(&ModelKind::Mock).unwrap();
        assert_eq!(json, format!("\"{}\"", ModelKind::Mock));
    }

    #[test]
    fn default_kind_is_gpt4all() {
        assert_eq!(ModelKind::default(), ModelKind::Gpt4All);
        assert!(ModelKind::default().needs_process());
        assert!(!ModelKind::Mock.needs_process());
    }

    #[test]
    fn factory_builds_requested_variant() {
        let model = build_model(ModelKind::Gpt4All, "org/model", true, None);
        assert_eq!(model.model_id(), "org/model");

        let model = build_model(ModelKind::Mock, "org/model", false, None);
        assert_eq!(model.model_id(), "org/model");
    }
}
