use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct SupervisorMetrics {
    pub(crate) started: Counter,
    pub(crate) stopped: Counter,
    pub(crate) crashed: Counter,
    pub(crate) running: Gauge,
}

impl SupervisorMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "instances_started",
            "The number of tunnel agent processes started",
            metrics.started.clone(),
        );
        reg.register(
            "instances_stopped",
            "The number of tunnel agent processes stopped by the supervisor",
            metrics.stopped.clone(),
        );
        reg.register(
            "instances_crashed",
            "The number of tunnel agent processes that exited unexpectedly",
            metrics.crashed.clone(),
        );
        reg.register(
            "tunnels",
            "The number of tunnel agent processes currently running",
            metrics.running.clone(),
        );
        metrics
    }
}
