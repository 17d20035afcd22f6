//! Cooperative cancellation signals for running executions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Registry of cancellation flags, one per running execution. The engine
/// checks the flag between steps.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    signals: Arc<tokio::sync::Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution and return its cancellation flag.
    pub async fn register(&self, execution_id: &str) -> Arc<AtomicBool> {
        let signal = Arc::new(AtomicBool::new(false));
        self.signals
            .lock()
            .await
            .insert(execution_id.to_string(), signal.clone());
        signal
    }

    /// Flag a running execution. Returns false if it is not registered.
    pub async fn request_cancel(&self, execution_id: &str) -> bool {
        match self.signals.lock().await.get(execution_id) {
            Some(signal) => {
                signal.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn unregister(&self, execution_id: &str) {
        self.signals.lock().await.remove(execution_id);
    }
}
