//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record runtime creation
pub fn record_runtime_created(name: &str, model_id: &str) {
    metrics::counter!("llm_manager_runtimes_created_total",
        "runtime" => name.to_string(),
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record runtime deletion
pub fn record_runtime_deleted(name: &str) {
    metrics::counter!("llm_manager_runtimes_deleted_total",
        "runtime" => name.to_string()
    )
    .increment(1);
}

/// Record health check failure
pub fn record_health_check_failure(name: &str) {
    metrics::counter!("llm_manager_health_check_failures_total",
        "runtime" => name.to_string()
    )
    .increment(1);
}

/// Record runtime restart
pub fn record_runtime_restart(name: &str) {
    metrics::counter!("llm_manager_runtime_restarts_total",
        "runtime" => name.to_string()
    )
    .increment(1);
}

/// Update total runtime count gauge
pub fn update_runtime_count(count: usize) {
    metrics::gauge!("llm_manager_runtimes_count").set(count as f64);
}

/// Record a completed model download
pub fn record_model_download(model_id: &str) {
    metrics::counter!("llm_manager_model_downloads_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a served generation request
pub fn record_generation(model_id: &str) {
    metrics::counter!("llm_manager_generations_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record tokens reported by the backend for a generation
pub fn record_generated_tokens(model_id: &str, total_tokens: u64) {
    metrics::counter!("llm_manager_generated_tokens_total",
        "model" => model_id.to_string()
    )
    .increment(total_tokens);
}
