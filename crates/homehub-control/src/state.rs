use homehub_agent::{IdleScheduler, LifecycleManager, StatusAggregator};

#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
    pub aggregator: StatusAggregator,
    pub scheduler: IdleScheduler,
}

impl AppState {
    pub fn new(manager: LifecycleManager) -> Self {
        Self {
            aggregator: StatusAggregator::new(manager.clone()),
            scheduler: IdleScheduler::new(manager.clone()),
            manager,
        }
    }
}
