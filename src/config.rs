//! Configuration structures and loading logic

use crate::llm::ModelKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    pub state_file: PathBuf,
    /// Cache root for model snapshots; None uses the ambient HuggingFace cache
    pub cache_dir: Option<PathBuf>,
    pub health_check_interval_secs: u64,
    pub health_check_initial_delay_secs: u64,
    pub max_failures_before_restart: u32,
    pub graceful_shutdown_timeout_secs: u64,
    pub auto_restore_on_restart: bool,
    pub max_runtimes: Option<usize>,
    /// Port range for runtime auto-allocation, [start, end)
    /// Equal values disable auto-allocation
    pub runtime_port_start: u16,
    pub runtime_port_end: u16,
    /// Model IDs to seed into the model registry at startup
    pub models: Vec<String>,
    pub runtimes: Vec<RuntimeConfig>,

    #[serde(default = "default_server_binary_path")]
    pub server_binary_path: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            state_file: default_state_file(),
            cache_dir: None,
            health_check_interval_secs: default_health_check_interval(),
            health_check_initial_delay_secs: default_health_check_initial_delay(),
            max_failures_before_restart: default_max_failures_before_restart(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
            auto_restore_on_restart: false,
            max_runtimes: None,
            runtime_port_start: default_runtime_port_start(),
            runtime_port_end: default_runtime_port_end(),
            models: Vec::new(),
            runtimes: Vec::new(),
            server_binary_path: default_server_binary_path(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("LLM_MANAGER_API_PORT") {
            config.api_port = port.parse().context("Invalid LLM_MANAGER_API_PORT value")?;
        }
        if let Ok(state_file) = std::env::var("LLM_MANAGER_STATE_FILE") {
            config.state_file = PathBuf::from(state_file);
        }
        if let Ok(cache_dir) = std::env::var("LLM_MANAGER_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(cache_dir));
        }
        if let Ok(interval) = std::env::var("LLM_MANAGER_HEALTH_CHECK_INTERVAL") {
            config.health_check_interval_secs = interval
                .parse()
                .context("Invalid LLM_MANAGER_HEALTH_CHECK_INTERVAL value")?;
        }
        if let Ok(binary_path) = std::env::var("LLAMA_SERVER_PATH") {
            config.server_binary_path = binary_path;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Port range validation
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.runtime_port_start > self.runtime_port_end {
            anyhow::bail!(
                "Runtime port range start {} is above end {}",
                self.runtime_port_start,
                self.runtime_port_end
            );
        }
        if self.runtime_port_start < self.runtime_port_end && self.runtime_port_start < 1024 {
            anyhow::bail!(
                "Runtime port range must start >= 1024 (got {})",
                self.runtime_port_start
            );
        }

        // Check for port conflicts in seeded runtimes
        let mut ports = HashSet::new();
        let mut names = HashSet::new();

        for runtime in &self.runtimes {
            // Port 0 requests automatic allocation at start time
            if runtime.port != 0 {
                if runtime.port < 1024 {
                    anyhow::bail!(
                        "Runtime '{}' port must be >= 1024 (got {})",
                        runtime.name,
                        runtime.port
                    );
                }
                if runtime.port == self.api_port {
                    anyhow::bail!(
                        "Runtime '{}' port {} conflicts with API port",
                        runtime.name,
                        runtime.port
                    );
                }
                if !ports.insert(runtime.port) {
                    anyhow::bail!("Duplicate port {} in runtime configs", runtime.port);
                }
            }

            // Name validation
            if runtime.name.is_empty() {
                anyhow::bail!("Runtime name cannot be empty");
            }
            if runtime.name.contains('/') || runtime.name.contains('\\') {
                anyhow::bail!(
                    "Runtime name '{}' cannot contain path separators",
                    runtime.name
                );
            }
            if !names.insert(&runtime.name) {
                anyhow::bail!("Duplicate runtime name: {}", runtime.name);
            }

            if runtime.model_id.is_empty() {
                anyhow::bail!("Runtime '{}' must name a model_id", runtime.name);
            }
            if runtime.context_size == 0 {
                anyhow::bail!("Runtime '{}' context_size must be > 0", runtime.name);
            }
        }

        // Ensure state file directory exists or can be created
        if let Some(parent) = self.state_file.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create state file directory: {:?}", parent))?;
        }

        Ok(())
    }
}

/// Configuration for a single model runtime
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuntimeConfig {
    pub name: String,
    pub model_id: String,

    /// Backend kind serving this runtime
    #[serde(default)]
    pub kind: ModelKind,

    /// Port to serve on; 0 lets the manager pick a free one
    #[serde(default)]
    pub port: u16,

    /// Whether starts may reuse an already cached snapshot
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Layers to offload to the GPU (0 keeps inference on CPU)
    #[serde(default)]
    pub gpu_layers: u32,

    /// CPU threads for the server; None uses the server default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    /// Optional GPU assignment (sets CUDA_VISIBLE_DEVICES)
    /// If None, all GPUs are visible to this runtime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<u32>,

    /// Additional CLI args to pass to llama-server
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Auto-generated field (not in user config)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            model_id: String::new(),
            kind: ModelKind::default(),
            port: 0,
            use_cache: default_use_cache(),
            context_size: default_context_size(),
            gpu_layers: 0,
            threads: None,
            gpu_id: None,
            extra_args: Vec::new(),
            created_at: None,
        }
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_state_file() -> PathBuf {
    PathBuf::from("/data/llm-manager-state.toml")
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_health_check_initial_delay() -> u64 {
    60
}
fn default_max_failures_before_restart() -> u32 {
    3
}
fn default_graceful_shutdown_timeout() -> u64 {
    30
}
fn default_runtime_port_start() -> u16 {
    8080
}
fn default_runtime_port_end() -> u16 {
    8180
}
fn default_use_cache() -> bool {
    true
}
fn default_context_size() -> u32 {
    4096
}
fn default_server_binary_path() -> String {
    "llama-server".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.health_check_interval_secs, 30);
        assert_eq!(config.server_binary_path, "llama-server");
        assert!(config.cache_dir.is_none());
        assert_eq!(config.runtime_port_start, 8080);
        assert_eq!(config.runtime_port_end, 8180);
        // Note: validate() may fail if /data doesn't exist, which is expected
        // In real usage, state_file is typically overridden to a writable location
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtime_port_start: 9000,
            runtime_port_end: 8000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_equal_port_range_disables_auto_allocation() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtime_port_start: 8080,
            runtime_port_end: 8080,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_runtime_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.kind, ModelKind::Gpt4All);
        assert_eq!(config.port, 0);
        assert!(config.use_cache);
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.gpu_layers, 0);
    }

    #[test]
    fn test_port_validation() {
        let config = ManagerConfig {
            api_port: 500, // Below 1024
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_port_detection() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtimes: vec![
                RuntimeConfig {
                    name: "test1".to_string(),
                    model_id: "org/model1".to_string(),
                    port: 8080,
                    ..Default::default()
                },
                RuntimeConfig {
                    name: "test2".to_string(),
                    model_id: "org/model2".to_string(),
                    port: 8080, // Duplicate
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_ports_do_not_conflict() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtimes: vec![
                RuntimeConfig {
                    name: "auto1".to_string(),
                    model_id: "org/model1".to_string(),
                    port: 0,
                    ..Default::default()
                },
                RuntimeConfig {
                    name: "auto2".to_string(),
                    model_id: "org/model2".to_string(),
                    port: 0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_name_validation() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtimes: vec![RuntimeConfig {
                name: "test/invalid".to_string(), // Contains path separator
                model_id: "org/model1".to_string(),
                port: 8080,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_model_id_rejected() {
        let config = ManagerConfig {
            state_file: PathBuf::from("/tmp/llm-manager-test-state.toml"),
            runtimes: vec![RuntimeConfig {
                name: "no-model".to_string(),
                port: 8080,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_runtime_defaults() {
        let toml_str = r#"
            api_port = 9000
            models = ["nomic-ai/gpt4all-falcon"]

            [[runtimes]]
            name = "mistral"
            model_id = "TheBloke/Mistral-7B-Instruct-v0.2-GGUF"
        "#;

        let config: ManagerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.models, vec!["nomic-ai/gpt4all-falcon".to_string()]);
        assert_eq!(config.runtimes.len(), 1);

        let runtime = &config.runtimes[0];
        assert_eq!(runtime.name, "mistral");
        assert_eq!(runtime.kind, ModelKind::Gpt4All);
        assert_eq!(runtime.port, 0);
        assert!(runtime.use_cache);
        assert_eq!(runtime.context_size, 4096);
    }

    #[test]
    fn test_toml_mock_kind() {
        let toml_str = r#"
            [[runtimes]]
            name = "stub"
            model_id = "stub-model"
            kind = "mock"
            use_cache = false
        "#;

        let config: ManagerConfig = toml::from_str(toml_str).unwrap();
        let runtime = &config.runtimes[0];
        assert_eq!(runtime.kind, ModelKind::Mock);
        assert!(!runtime.use_cache);
    }

    #[test]
    #[serial]
    fn test_env_override_api_port() {
        unsafe {
            std::env::set_var("LLM_MANAGER_API_PORT", "9123");
        }
        let config = ManagerConfig::load(None).unwrap();
        unsafe {
            std::env::remove_var("LLM_MANAGER_API_PORT");
        }
        assert_eq!(config.api_port, 9123);
    }
}
