//! Thread-safe runtime registry

use crate::config::RuntimeConfig;
use crate::llm::build_model;
use crate::runtime::{ModelRuntime, SystemProcessManager};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Events that occur during runtime lifecycle
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Runtime was added to registry
    Added(String),
    /// Runtime was removed from registry
    Removed(String),
    /// Runtime was started
    Started(String),
    /// Runtime was stopped
    Stopped(String),
}

/// Thread-safe registry for managing model runtimes
pub struct Registry {
    runtimes: Arc<RwLock<HashMap<String, Arc<ModelRuntime>>>>,
    max_runtimes: Option<usize>,
    server_binary_path: Arc<str>,
    /// Cache root handed to backends; None uses the ambient HuggingFace cache
    cache_dir: Option<PathBuf>,
    next_runtime_port: Arc<RwLock<u16>>,
    /// Port range for auto-allocation [start, end)
    /// If start == end, auto-allocation is disabled
    runtime_port_range: (u16, u16),
    event_tx: broadcast::Sender<RuntimeEvent>,
}

impl Registry {
    /// Create a new registry
    ///
    /// # Arguments
    /// * `max_runtimes` - Maximum number of runtimes allowed
    /// * `server_binary_path` - Path to the llama-server binary
    /// * `runtime_port_start` - Start of port range for auto-allocation
    /// * `runtime_port_end` - End of port range for auto-allocation (exclusive)
    ///
    /// If runtime_port_start == runtime_port_end, auto-allocation is disabled
    pub fn new(
        max_runtimes: Option<usize>,
        server_binary_path: String,
        runtime_port_start: u16,
        runtime_port_end: u16,
    ) -> Self {
        // Create broadcast channel for lifecycle events
        // Capacity of 100 should be sufficient for most use cases
        let (event_tx, _) = broadcast::channel(100);

        Self {
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            max_runtimes,
            server_binary_path: Arc::from(server_binary_path),
            cache_dir: None,
            next_runtime_port: Arc::new(RwLock::new(runtime_port_start)),
            runtime_port_range: (runtime_port_start, runtime_port_end),
            event_tx,
        }
    }

    /// Set the cache root that backends resolve checkpoints against
    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.event_tx.subscribe()
    }

    /// Publish a lifecycle event to subscribers
    pub fn notify(&self, event: RuntimeEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Check if port auto-allocation is enabled
    pub fn is_port_auto_allocation_enabled(&self) -> bool {
        self.runtime_port_range.0 < self.runtime_port_range.1
    }

    /// Add a new runtime to the registry
    /// Returns error if name exists, port conflicts, or max runtimes reached
    ///
    /// If `config.port` is 0, auto-allocates a port from the configured range
    pub async fn add(&self, mut config: RuntimeConfig) -> Result<Arc<ModelRuntime>> {
        let mut runtimes = self.runtimes.write().await;

        // Validate uniqueness
        if runtimes.contains_key(&config.name) {
            anyhow::bail!("Runtime '{}' already exists", config.name);
        }

        // Auto-assign runtime port if not specified (port == 0)
        if config.port == 0 {
            if !self.is_port_auto_allocation_enabled() {
                anyhow::bail!(
                    "Port not specified and auto-allocation is disabled (no port range configured)"
                );
            }

            let mut next_port = self.next_runtime_port.write().await;

            // Collect used ports
            let used_ports: std::collections::HashSet<u16> =
                runtimes.values().map(|r| r.config.port).collect();

            // Find next available port in range, starting from next_port
            // If next_port is past the end of the range, wrap around to start
            let search_start = if *next_port >= self.runtime_port_range.1 {
                self.runtime_port_range.0
            } else {
                *next_port
            };

            let assigned_port = Self::find_free_port_in_range(
                search_start,
                self.runtime_port_range.0,
                self.runtime_port_range.1,
                &used_ports,
            )?;
            config.port = assigned_port;

            // Update next_port for next allocation
            *next_port = assigned_port + 1;

            tracing::info!(port = assigned_port, "Auto-assigned runtime port");
        }

        // Check port conflicts
        for runtime in runtimes.values() {
            if runtime.config.port == config.port {
                anyhow::bail!(
                    "Port {} already in use by runtime '{}'",
                    config.port,
                    runtime.config.name
                );
            }
        }

        // Check max runtimes
        if let Some(max) = self.max_runtimes
            && runtimes.len() >= max
        {
            anyhow::bail!("Maximum runtime count ({}) reached", max);
        }

        let llm = build_model(
            config.kind,
            &config.model_id,
            config.use_cache,
            self.cache_dir.clone(),
        );
        let runtime = Arc::new(ModelRuntime::new_with_manager(
            config,
            llm,
            Arc::new(SystemProcessManager::new()),
        ));
        let runtime_name = runtime.config.name.clone();

        tracing::info!(
            runtime = %runtime_name,
            model = %runtime.config.model_id,
            kind = %runtime.config.kind,
            total_runtimes = runtimes.len() + 1,
            "Runtime added to registry"
        );

        runtimes.insert(runtime_name.clone(), runtime.clone());

        // Notify listeners of the add event
        let _ = self.event_tx.send(RuntimeEvent::Added(runtime_name));

        Ok(runtime)
    }

    /// Get runtime by name
    pub async fn get(&self, name: &str) -> Option<Arc<ModelRuntime>> {
        let runtimes = self.runtimes.read().await;
        runtimes.get(name).cloned()
    }

    /// Find a runtime serving the given model ID
    pub async fn get_by_model(&self, model_id: &str) -> Option<Arc<ModelRuntime>> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .values()
            .find(|r| r.config.model_id == model_id)
            .cloned()
    }

    /// Remove runtime and stop it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut runtimes = self.runtimes.write().await;

        let runtime = runtimes
            .remove(name)
            .with_context(|| format!("Runtime '{}' not found", name))?;

        // Drop write lock before stopping (stop may take time)
        drop(runtimes);

        runtime.stop().await?;

        tracing::info!(runtime = %name, "Runtime removed from registry");

        // Notify listeners of the removal
        let _ = self.event_tx.send(RuntimeEvent::Removed(name.to_string()));

        Ok(())
    }

    /// List all runtimes
    pub async fn list(&self) -> Vec<Arc<ModelRuntime>> {
        let runtimes = self.runtimes.read().await;
        runtimes.values().cloned().collect()
    }

    /// Get runtime count
    pub async fn count(&self) -> usize {
        let runtimes = self.runtimes.read().await;
        runtimes.len()
    }

    /// Stop every runtime, logging failures instead of aborting
    pub async fn stop_all(&self) {
        let runtimes = self.list().await;

        for runtime in runtimes {
            if let Err(e) = runtime.stop().await {
                tracing::error!(
                    runtime = %runtime.config.name,
                    error = %e,
                    "Failed to stop runtime during shutdown"
                );
            }
        }
    }

    /// Get llama-server binary path
    pub fn server_binary_path(&self) -> &str {
        &self.server_binary_path
    }

    /// The cache root handed to backends, if any
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Find next available port in a given range, avoiding already-used ports
    /// Searches from search_start to range_end, then wraps around from range_start
    fn find_free_port_in_range(
        search_start: u16,
        range_start: u16,
        range_end: u16,
        used_ports: &std::collections::HashSet<u16>,
    ) -> Result<u16> {
        // Search from search_start to range_end
        for port in search_start..range_end {
            if !used_ports.contains(&port) && TcpListener::bind(("0.0.0.0", port)).is_ok() {
                return Ok(port);
            }
        }

        // Wrap around: search from range_start to search_start
        for port in range_start..search_start {
            if !used_ports.contains(&port) && TcpListener::bind(("0.0.0.0", port)).is_ok() {
                return Ok(port);
            }
        }

        anyhow::bail!(
            "Could not find free port in range [{}, {})",
            range_start,
            range_end
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelKind;

    /// Find N consecutive free ports starting from a base port.
    /// Returns the start of the range if found.
    fn find_consecutive_free_ports(start: u16, count: u16) -> Option<u16> {
        for base in start..60000 {
            let mut all_free = true;
            for offset in 0..count {
                // Use 0.0.0.0 to match production code in find_free_port_in_range
                if TcpListener::bind(("0.0.0.0", base + offset)).is_err() {
                    all_free = false;
                    break;
                }
            }
            if all_free {
                return Some(base);
            }
        }
        None
    }

    fn test_config(name: &str, port: u16) -> RuntimeConfig {
        RuntimeConfig {
            name: name.to_string(),
            model_id: "org/model".to_string(),
            kind: ModelKind::Mock,
            port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registry_add_and_get() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        let runtime = registry.add(test_config("test", 8080)).await.unwrap();
        assert_eq!(runtime.config.name, "test");
        assert_eq!(registry.count().await, 1);

        let retrieved = registry.get("test").await.unwrap();
        assert_eq!(retrieved.config.name, "test");
    }

    #[tokio::test]
    async fn test_get_by_model() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        let mut config = test_config("by-model", 8091);
        config.model_id = "org/served-model".to_string();
        registry.add(config).await.unwrap();

        let found = registry.get_by_model("org/served-model").await.unwrap();
        assert_eq!(found.config.name, "by-model");
        assert!(registry.get_by_model("org/unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejection() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        registry.add(test_config("test", 8080)).await.unwrap();
        assert!(registry.add(test_config("test", 8081)).await.is_err());
    }

    #[tokio::test]
    async fn test_port_conflict_detection() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        registry.add(test_config("test1", 8080)).await.unwrap();
        assert!(registry.add(test_config("test2", 8080)).await.is_err());
    }

    #[tokio::test]
    async fn test_max_runtimes_limit() {
        let registry = Registry::new(Some(2), "llama-server".to_string(), 8080, 8180);

        for i in 0..2 {
            registry
                .add(test_config(&format!("test{}", i), 8080 + i as u16))
                .await
                .unwrap();
        }

        // Third should fail
        assert!(registry.add(test_config("test3", 8082)).await.is_err());
    }

    #[tokio::test]
    async fn test_port_auto_allocation_basic() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        // Create runtime without specifying port (port = 0)
        let runtime = registry.add(test_config("test", 0)).await.unwrap();
        assert!(runtime.config.port >= 8080 && runtime.config.port < 8180);
    }

    #[tokio::test]
    async fn test_port_auto_allocation_disabled() {
        // Port range with start == end disables auto-allocation
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8080);

        // Should fail since auto-allocation is disabled
        let result = registry.add(test_config("test", 0)).await;
        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("auto-allocation is disabled"));
    }

    #[tokio::test]
    async fn test_port_auto_allocation_sequential() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        // Create 5 runtimes with auto-allocated ports
        let mut ports = Vec::new();
        for i in 0..5 {
            let runtime = registry
                .add(test_config(&format!("test{}", i), 0))
                .await
                .unwrap();
            ports.push(runtime.config.port);
        }

        // All ports should be unique
        let unique_ports: std::collections::HashSet<_> = ports.iter().collect();
        assert_eq!(unique_ports.len(), 5);

        // All ports should be in range
        for port in &ports {
            assert!(*port >= 8080 && *port < 8180);
        }
    }

    #[tokio::test]
    async fn test_port_auto_allocation_create_delete_create() {
        // Use a wide range so we can always find 5 free ports
        let registry = Registry::new(None, "llama-server".to_string(), 18080, 18180);

        // Create 5 runtimes
        for i in 0..5 {
            registry
                .add(test_config(&format!("test{}", i), 0))
                .await
                .unwrap();
        }

        assert_eq!(registry.count().await, 5);

        // Delete 3 runtimes
        registry.remove("test1").await.unwrap();
        registry.remove("test2").await.unwrap();
        registry.remove("test3").await.unwrap();

        assert_eq!(registry.count().await, 2);

        // Create 3 more runtimes - should reuse freed ports
        for i in 5..8 {
            registry
                .add(test_config(&format!("test{}", i), 0))
                .await
                .unwrap();
        }

        assert_eq!(registry.count().await, 5);

        // All runtimes should have unique ports in range
        let runtimes = registry.list().await;
        let ports: std::collections::HashSet<_> =
            runtimes.iter().map(|r| r.config.port).collect();
        assert_eq!(ports.len(), 5);

        for port in ports {
            assert!((18080..18180).contains(&port));
        }
    }

    #[tokio::test]
    async fn test_port_auto_allocation_exhausted() {
        // Find 2 consecutive free ports dynamically
        let base_port = find_consecutive_free_ports(19000, 2).expect("Should find 2 free ports");
        let range_end = base_port + 2;

        let registry = Registry::new(None, "llama-server".to_string(), base_port, range_end);

        // Create 2 runtimes
        for i in 0..2 {
            registry
                .add(test_config(&format!("test{}", i), 0))
                .await
                .unwrap();
        }

        // Third should fail - no ports available
        let result = registry.add(test_config("test_overflow", 0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mixed_auto_and_manual_ports() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        // Create with manual port
        registry.add(test_config("manual1", 8085)).await.unwrap();

        // Create with auto port - should skip 8085
        let runtime2 = registry.add(test_config("auto1", 0)).await.unwrap();
        assert_ne!(runtime2.config.port, 8085);

        // Create with manual port outside range
        registry.add(test_config("manual2", 9000)).await.unwrap();

        assert_eq!(registry.count().await, 3);
    }

    #[tokio::test]
    async fn test_remove_stops_runtime() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);

        let runtime = registry.add(test_config("to-remove", 8099)).await.unwrap();
        runtime.start("llama-server").await.unwrap();

        registry.remove("to-remove").await.unwrap();
        assert_eq!(registry.count().await, 0);
        assert_eq!(
            *runtime.status.read().await,
            crate::runtime::RuntimeStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let registry = Registry::new(None, "llama-server".to_string(), 8080, 8180);
        let mut events = registry.subscribe_events();

        registry.add(test_config("evented", 8111)).await.unwrap();
        registry.remove("evented").await.unwrap();

        match events.recv().await.unwrap() {
            RuntimeEvent::Added(name) => assert_eq!(name, "evented"),
            other => panic!("expected Added event, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            RuntimeEvent::Removed(name) => assert_eq!(name, "evented"),
            other => panic!("expected Removed event, got {:?}", other),
        }
    }
}
