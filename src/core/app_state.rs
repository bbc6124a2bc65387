use std::sync::Arc;

use crate::core::config::Settings;
use crate::dispatch::Dispatcher;
use crate::features::metrics::{MetricsSampler, MetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsSampler>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl AppState {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        Ok(Self {
            dispatcher: Dispatcher::new(settings)?,
            metrics: Arc::new(MetricsSampler::new()),
        })
    }

    /// One metrics tick: host readings plus the dispatcher's run facts.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let run_state = self.dispatcher.run_state();
        self.metrics.snapshot(
            run_state.is_active(),
            run_state.uptime_seconds(),
            run_state
                .running_sources()
                .iter()
                .map(|k| k.to_string())
                .collect(),
            self.dispatcher.tracker().len(),
            self.dispatcher.posted_total(),
        )
    }
}
