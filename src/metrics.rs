//! Metrics registry shared by the registrar, resolver and pool.
//!
//! Grounded in the teacher's `prometheus` usage in `operator.rs`
//! (`Metrics::default().register(&registry)`, `ctx.metrics.count_and_measure()`,
//! `ctx.metrics.reconcile_failure(...)`) — the struct definition itself
//! isn't present in the retrieved copy of that repo, so the fields below
//! are this crate's own counters/histogram for the operations spec §7 and
//! §8 name (registration/resolution/pool-acquire outcomes), built with the
//! same `prometheus::Registry`/`register(...)` contract.

use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub errors_total: IntCounterVec,
    pub operation_duration_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            errors_total: IntCounterVec::new(
                opts!("meshcore_errors_total", "Errors by component and kind"),
                &["component", "kind"],
            )
            .expect("valid metric opts"),
            operation_duration_seconds: HistogramVec::new(
                histogram_opts!(
                    "meshcore_operation_duration_seconds",
                    "Latency of registrar/resolver/pool operations"
                ),
                &["component", "operation"],
            )
            .expect("valid metric opts"),
        }
    }
}

impl Metrics {
    /// Registers every collector with `registry`, returning `self` for
    /// chaining (mirrors `Metrics::default().register(&registry)?` at the
    /// teacher's call site).
    pub fn register(self, registry: &Registry) -> crate::Result<Self> {
        registry
            .register(Box::new(self.errors_total.clone()))
            .map_err(|e| Error::Config(format!("metrics registration failed: {e}")))?;
        registry
            .register(Box::new(self.operation_duration_seconds.clone()))
            .map_err(|e| Error::Config(format!("metrics registration failed: {e}")))?;
        Ok(self)
    }

    /// Records an error against `component` (e.g. `"registrar"`, `"pool"`)
    /// using [`Error::metric_label`] as the `kind`.
    pub fn record_error(&self, component: &str, error: &Error) {
        self.errors_total
            .with_label_values(&[component, &error.metric_label()])
            .inc();
    }

    /// Starts a timer that records into `operation_duration_seconds` on
    /// drop (the Rust analogue of the teacher's `count_and_measure`, which
    /// returns an RAII timer guard too).
    pub fn count_and_measure(&self, component: &str, operation: &str) -> prometheus::HistogramTimer {
        self.operation_duration_seconds
            .with_label_values(&[component, operation])
            .start_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_twice_on_distinct_registries_succeeds() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();
        metrics.record_error("registrar", &Error::LeaseLost);
        let families = registry.gather();
        assert!(!families.is_empty());
    }
}
