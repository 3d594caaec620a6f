//! LLM Manager - Local model serving manager
//!
//! A lightweight Rust service that downloads checkpoints from the HuggingFace
//! Hub and serves them through managed llama-server runtimes on a single host.

pub mod api;
pub mod config;
pub mod error;
pub mod gpu;
pub mod health;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod runtime;
pub mod state;

pub use config::{ManagerConfig, RuntimeConfig};
pub use error::{ApiError, LlmError};
pub use health::HealthMonitor;
pub use llm::{Gpt4All, Llm, MockLlm, ModelKind};
pub use models::{ModelEntry, ModelLoader, ModelRegistry, ModelStatus};
pub use registry::{Registry, RuntimeEvent};
pub use runtime::{ModelRuntime, RuntimeStats, RuntimeStatus};
pub use state::StateManager;
