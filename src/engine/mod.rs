//! Execution engine.
//!
//! [`Engine`] owns the execution state machine
//! `pending -> running -> {waiting <-> running}* -> completed | failed | cancelled`,
//! the global concurrency ceiling and cooperative cancellation.

mod cancel;
mod concurrency;
mod executor;

pub use cancel::CancelRegistry;
pub use concurrency::{ConcurrencyLimiter, ExecutionPermit};
pub use executor::{Engine, RunMode};

#[cfg(test)]
pub(crate) mod testing {
    //! Engine fixtures shared by trigger, admin and API tests.

    use std::sync::Arc;
    use std::time::Duration;

    use super::Engine;
    use crate::actions::{Action, ActionRegistry, ActionServices, RecordingNotifier};
    use crate::config::{ActionSettings, EngineSettings};
    use crate::storage::{SqliteStorage, WorkflowExecution};

    pub fn engine_with(extra: Vec<Arc<dyn Action>>) -> (Engine, Arc<SqliteStorage>) {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let settings = EngineSettings {
            subworkflow_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let services = Arc::new(
            ActionServices::new(store.clone(), Arc::new(RecordingNotifier::default()))
                .with_settings(ActionSettings::default(), settings),
        );
        let mut registry = ActionRegistry::new();
        for action in extra {
            registry.register(action);
        }
        (Engine::new(registry, services), store)
    }

    pub async fn wait_terminal(engine: &Engine, id: &str) -> WorkflowExecution {
        for _ in 0..500 {
            let execution = engine.get_execution(id).await.unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never finished", id);
    }
}
