use prometheus_client::{
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

type NamespaceLabels = Vec<(&'static str, String)>;

#[derive(Clone, Debug, Default)]
pub struct StoreMetrics {
    artifacts: Family<NamespaceLabels, Gauge>,
}

impl StoreMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "artifact_index_size",
            "The number of tunnel configuration artifacts known to the store",
            metrics.artifacts.clone(),
        );
        metrics
    }

    pub(crate) fn set_artifacts(&self, namespace: &str, count: usize) {
        let labels = vec![("namespace", namespace.to_string())];
        if count == 0 {
            self.artifacts.remove(&labels);
        } else {
            self.artifacts
                .get_or_create(&labels)
                .set(count.try_into().unwrap_or(i64::MAX));
        }
    }

    #[cfg(test)]
    pub(crate) fn artifacts(&self, namespace: &str) -> i64 {
        self.artifacts
            .get_or_create(&vec![("namespace", namespace.to_string())])
            .get()
    }
}
