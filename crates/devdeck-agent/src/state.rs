use std::sync::Arc;

use crate::{
    config::AgentConfig, observer_hub::ObserverHub, ports::PortChecker,
    process_table::ProcessProber, reconciler::StatusReconciler, script_runner::ScriptRunner,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub hub: ObserverHub,
    pub runner: ScriptRunner,
    pub prober: ProcessProber,
    pub ports: PortChecker,
    pub reconciler: StatusReconciler,
}

impl AppState {
    pub fn new(config: AgentConfig) -> Self {
        let hub = ObserverHub::new(config.observer_queue);
        let runner = ScriptRunner::new(hub.clone(), config.output_drain);
        let prober = ProcessProber::new(config.probe_timeout);
        let ports = PortChecker::new(prober.clone());
        let reconciler = StatusReconciler::new(runner.clone(), prober.clone(), ports.clone());
        Self {
            config: Arc::new(config),
            hub,
            runner,
            prober,
            ports,
            reconciler,
        }
    }
}
