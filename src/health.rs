//! Health monitoring for model runtimes

use crate::registry::Registry;
use crate::runtime::{ModelRuntime, RuntimeStatus};
use std::sync::Arc;
use tokio::time::{Duration, interval, sleep};

/// Health monitor with configurable checks and auto-restart
pub struct HealthMonitor {
    registry: Arc<Registry>,
    check_interval: Duration,
    initial_delay: Duration,
    auto_restart: bool,
    max_failures_before_restart: u32,
    server_binary_path: Arc<str>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        registry: Arc<Registry>,
        check_interval_secs: u64,
        initial_delay_secs: u64,
        max_failures_before_restart: u32,
        auto_restart: bool,
        server_binary_path: String,
    ) -> Self {
        Self {
            registry,
            check_interval: Duration::from_secs(check_interval_secs),
            initial_delay: Duration::from_secs(initial_delay_secs),
            auto_restart,
            max_failures_before_restart,
            server_binary_path: Arc::from(server_binary_path),
        }
    }

    /// Start monitoring loop
    pub async fn run(self: Arc<Self>) {
        // Wait initial delay before first check (gives runtimes time to start)
        tracing::info!(
            delay_secs = self.initial_delay.as_secs(),
            "Waiting before starting health checks"
        );
        sleep(self.initial_delay).await;

        let mut ticker = interval(self.check_interval);

        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            "Health monitoring started"
        );

        loop {
            ticker.tick().await;
            self.check_all_runtimes().await;
        }
    }

    async fn check_all_runtimes(&self) {
        let runtimes = self.registry.list().await;

        for runtime in runtimes {
            // Processless runtimes have no server to probe
            if !runtime.config.kind.needs_process() {
                continue;
            }

            // Stopped runtimes are not monitored
            if *runtime.status.read().await == RuntimeStatus::Stopped {
                continue;
            }

            match self.check_runtime(&runtime).await {
                Ok(()) => {
                    self.handle_success(&runtime).await;
                }
                Err(e) => {
                    tracing::warn!(
                        runtime = %runtime.config.name,
                        error = %e,
                        "Health check failed"
                    );
                    self.handle_failure(&runtime).await;
                }
            }
        }
    }

    async fn check_runtime(&self, runtime: &ModelRuntime) -> anyhow::Result<()> {
        // Check if process is running
        if !runtime.is_running().await {
            anyhow::bail!("Process not running");
        }

        // HTTP health check
        let url = format!("{}/health", runtime.endpoint());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        let response = client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Health check returned status: {}", response.status());
        }

        Ok(())
    }

    async fn handle_success(&self, runtime: &ModelRuntime) {
        // Reset failure count on success
        let mut stats = runtime.stats.write().await;
        stats.health_check_failures = 0;
        stats.last_health_check = Some(chrono::Utc::now());

        // Update status to Running if it was Starting
        let mut status = runtime.status.write().await;
        if *status == RuntimeStatus::Starting {
            tracing::info!(
                runtime = %runtime.config.name,
                "Runtime is now healthy"
            );
            *status = RuntimeStatus::Running;
        }
    }

    async fn handle_failure(&self, runtime: &ModelRuntime) {
        let mut stats = runtime.stats.write().await;
        stats.health_check_failures += 1;
        let failures = stats.health_check_failures;

        crate::metrics::record_health_check_failure(&runtime.config.name);

        tracing::warn!(
            runtime = %runtime.config.name,
            failures = failures,
            max_failures = self.max_failures_before_restart,
            "Runtime health check failed"
        );

        if self.auto_restart && failures >= self.max_failures_before_restart {
            tracing::warn!(
                runtime = %runtime.config.name,
                "Maximum failures reached, attempting restart"
            );

            // Record restart metric
            crate::metrics::record_runtime_restart(&runtime.config.name);

            drop(stats); // Release lock before restart

            if let Err(e) = runtime.restart(&self.server_binary_path).await {
                tracing::error!(
                    runtime = %runtime.config.name,
                    error = %e,
                    "Failed to restart runtime"
                );

                *runtime.status.write().await = RuntimeStatus::Failed;
            }
        }
    }
}

/// One-shot readiness probing for freshly started runtimes
pub struct HealthChecker;

impl HealthChecker {
    /// Poll a runtime's health route until it answers or the timeout elapses
    ///
    /// Marks the runtime `Running` on success. Processless runtimes are
    /// ready by construction and return immediately.
    pub async fn wait_for_ready(
        runtime: &ModelRuntime,
        timeout: Duration,
        poll_interval: Duration,
    ) -> anyhow::Result<()> {
        if !runtime.config.kind.needs_process() {
            return Ok(());
        }

        let url = format!("{}/health", runtime.endpoint());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if !runtime.is_running().await {
                anyhow::bail!("Process exited before becoming ready");
            }

            if let Ok(response) = client.get(&url).send().await
                && response.status().is_success()
            {
                let mut status = runtime.status.write().await;
                if *status == RuntimeStatus::Starting {
                    *status = RuntimeStatus::Running;
                }
                tracing::info!(runtime = %runtime.config.name, "Runtime is ready");
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "Runtime did not become ready within {}s",
                    timeout.as_secs()
                );
            }

            sleep(poll_interval).await;
        }
    }
}
