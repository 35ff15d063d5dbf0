//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the job engine:
//! - Job execution (per job type and outcome)
//! - Reservation terminal transitions
//! - Queue backend claim and heartbeat errors
//! - Retry attempts
//!
//! # Example
//!
//! ```rust,no_run
//! use provisioning_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and keeps the existing recorder.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        // Register all metric descriptions
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        let addr = self.addr;
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(addr = %addr, "Metrics listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Job Metrics
    describe_counter!(
        "jobs_processed_total",
        "Total number of jobs processed, by job type and outcome"
    );
    describe_histogram!(
        "job_duration_seconds",
        "Time taken to execute a job handler"
    );

    // Reservation Metrics
    describe_counter!(
        "reservations_finished_total",
        "Total number of reservations that reached a terminal state"
    );

    // Queue Metrics
    describe_counter!(
        "queue_claim_errors_total",
        "Total number of failed claim attempts"
    );
    describe_counter!(
        "queue_heartbeat_errors_total",
        "Total number of failed lease renewals"
    );

    // Retry Metrics
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their attempts"
    );
}

/// Job metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a processed job.
    ///
    /// `outcome` is one of `success`, `failure`, `timeout`, `panic`, `invalid` or
    /// `interrupted`.
    pub fn record_processed(job_type: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "jobs_processed_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("job_duration_seconds", "job_type" => job_type.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Reservation metrics recorder.
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// Record a terminal transition performed by this process.
    pub fn record_finished(job_type: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "reservations_finished_total",
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a failed claim.
    pub fn record_claim_error(backend: &'static str) {
        counter!("queue_claim_errors_total", "backend" => backend).increment(1);
    }

    /// Record a failed heartbeat.
    pub fn record_heartbeat_error(backend: &'static str) {
        counter!("queue_heartbeat_errors_total", "backend" => backend).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();

        JobMetrics::record_processed("no_operation", "success", Duration::from_millis(10));
        ReservationMetrics::record_finished("no_operation", true);
        QueueMetrics::record_claim_error("memory");

        // If another test initialized the recorder first, handle is None.
        // Metrics are still being recorded.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("jobs_processed_total"));
            assert!(rendered.contains("reservations_finished_total"));
            assert!(rendered.contains("queue_claim_errors_total"));
        }
    }
}
