//! Prometheus instrumentation for admission decisions.

use prometheus::{IntCounterVec, Opts, Registry};

/// Counters for the admission path. One increment per `try_acquire` call,
/// labeled with the resource key and whether the request was limited.
pub struct AdmissionMetrics {
    pub registry: Registry,
    admissions: IntCounterVec,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new(
                "flowgate_admission_total",
                "Admission decisions by resource and outcome",
            ),
            &["service_name", "limited"],
        )
        .unwrap();
        registry.register(Box::new(admissions.clone())).unwrap();

        Self {
            registry,
            admissions,
        }
    }

    pub fn record(&self, resource_key: &str, limited: bool) {
        self.admissions
            .with_label_values(&[resource_key, if limited { "true" } else { "false" }])
            .inc();
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &AdmissionMetrics, resource: &str, limited: &str) -> u64 {
        metrics
            .admissions
            .with_label_values(&[resource, limited])
            .get()
    }

    #[test]
    fn records_by_resource_and_outcome() {
        let metrics = AdmissionMetrics::new();

        metrics.record("search", false);
        metrics.record("search", false);
        metrics.record("search", true);
        metrics.record("checkout", true);

        assert_eq!(counter_value(&metrics, "search", "false"), 2);
        assert_eq!(counter_value(&metrics, "search", "true"), 1);
        assert_eq!(counter_value(&metrics, "checkout", "true"), 1);
        assert_eq!(counter_value(&metrics, "checkout", "false"), 0);
    }

    #[test]
    fn counters_show_up_in_the_registry() {
        let metrics = AdmissionMetrics::new();
        metrics.record("search", false);

        let families = metrics.registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "flowgate_admission_total");
    }
}
