use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error_type: String,
}

#[derive(Clone)]
pub struct Metrics {
    pub reconcile_runs: Counter,
    pub reconcile_duration: Histogram,
    pub errors: Family<ErrorLabels, Counter>,
    pub namespaces_created: Counter,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("rancher_devops_operator");

        let reconcile_runs = Counter::default();
        registry.register(
            "reconcile_runs",
            "reconciliations started",
            reconcile_runs.clone(),
        );

        let reconcile_duration = Histogram::new([0.1, 0.5, 1., 5., 10., 30.].into_iter());
        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            reconcile_duration.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register("errors", "operator errors by type", errors.clone());

        let namespaces_created = Counter::default();
        registry.register(
            "namespaces_created",
            "namespaces created in Rancher by this operator",
            namespaces_created.clone(),
        );

        Metrics {
            reconcile_runs,
            reconcile_duration,
            errors,
            namespaces_created,
            registry: Arc::new(registry),
        }
    }
}

impl Metrics {
    pub fn error(&self, error_type: &str) {
        self.errors
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile_runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Observes the reconcile duration on drop, so early returns and error
/// paths are measured too
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}
