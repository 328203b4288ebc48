//! Operator metrics
//!
//! Prometheus counters and histograms for volume operations, kept in a
//! crate-owned registry so several orchestrators (tests) never collide.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Metrics recorded by the orchestrator
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    operations: IntCounterVec,
    rollbacks: IntCounterVec,
    duration: HistogramVec,
}

impl OperatorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("fcp_operations_total", "Volume and pool operations by result"),
            &["operation", "result"],
        )
        .map_err(metrics_error)?;
        let rollbacks = IntCounterVec::new(
            Opts::new("fcp_rollbacks_total", "Rollback sequences started after a failed step"),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "fcp_operation_duration_seconds",
                "Duration of volume and pool operations",
            ),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rollbacks.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            rollbacks,
            duration,
        })
    }

    /// Count one finished operation and its duration
    pub fn observe(&self, operation: &str, success: bool, seconds: f64) {
        let result = if success { "success" } else { "error" };
        self.operations
            .with_label_values(&[operation, result])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(seconds);
    }

    pub fn rollback(&self, operation: &str) {
        self.rollbacks.with_label_values(&[operation]).inc();
    }

    pub fn operation_count(&self, operation: &str, result: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, result])
            .get()
    }

    pub fn rollback_count(&self, operation: &str) -> u64 {
        self.rollbacks.with_label_values(&[operation]).get()
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
