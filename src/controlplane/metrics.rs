//! Controller Metrics
//!
//! Prometheus counters and gauges for reconciliation passes, owned by the
//! controller rather than the global default registry.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Result label of a finished pass
pub const PASS_CONVERGED: &str = "converged";
pub const PASS_PROGRESSING: &str = "progressing";
pub const PASS_REJECTED: &str = "rejected";
pub const PASS_FAILED: &str = "failed";

/// Metrics for the reconciliation loop
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    passes: IntCounterVec,
    intents: IntCounterVec,
    rejections: IntCounter,
    workloads: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let passes = IntCounterVec::new(
            Opts::new(
                "elasticsearch_operator_reconcile_passes_total",
                "Reconciliation passes by result",
            ),
            &["result"],
        )
        .map_err(metrics_err)?;
        let intents = IntCounterVec::new(
            Opts::new(
                "elasticsearch_operator_intents_applied_total",
                "Workload intents applied by kind",
            ),
            &["kind"],
        )
        .map_err(metrics_err)?;
        let rejections = IntCounter::new(
            "elasticsearch_operator_quorum_rejections_total",
            "Specs refused by the quorum guard",
        )
        .map_err(metrics_err)?;
        let workloads = IntGaugeVec::new(
            Opts::new(
                "elasticsearch_operator_managed_workloads",
                "Workloads observed per cluster",
            ),
            &["cluster"],
        )
        .map_err(metrics_err)?;

        registry.register(Box::new(passes.clone())).map_err(metrics_err)?;
        registry.register(Box::new(intents.clone())).map_err(metrics_err)?;
        registry.register(Box::new(rejections.clone())).map_err(metrics_err)?;
        registry.register(Box::new(workloads.clone())).map_err(metrics_err)?;

        Ok(Self {
            registry,
            passes,
            intents,
            rejections,
            workloads,
        })
    }

    pub fn record_pass(&self, result: &str) {
        self.passes.with_label_values(&[result]).inc();
    }

    pub fn record_intent(&self, kind: &str) {
        self.intents.with_label_values(&[kind]).inc();
    }

    pub fn record_rejection(&self) {
        self.rejections.inc();
    }

    pub fn set_workloads(&self, cluster: &str, count: usize) {
        self.workloads.with_label_values(&[cluster]).set(count as i64);
    }

    pub fn forget_cluster(&self, cluster: &str) {
        let _ = self.workloads.remove_label_values(&[cluster]);
    }

    pub fn passes(&self, result: &str) -> u64 {
        self.passes.with_label_values(&[result]).get()
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.get()
    }

    /// Text exposition of every metric, with its content type
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
