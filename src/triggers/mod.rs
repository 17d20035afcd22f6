//! Trigger subsystem.
//!
//! Turns entity and domain events, cron schedules, manual calls and inbound
//! webhooks into executions. [`TriggerHub`] owns the subscription index and
//! hands admitted runs to the [`Engine`]; the [`Scheduler`] loop drives cron
//! triggers and resumes due WAITING executions.

mod event;
mod index;
mod manual;
pub(crate) mod scheduler;
mod webhook;

pub use event::{DispatchFailure, DispatchReport};
pub use index::{EventKey, Subscription, SubscriptionIndex};
pub use manual::Caller;
pub use scheduler::{Scheduler, TickReport};
pub use webhook::{verify_signature, WebhookCall, SECRET_HEADER, SIGNATURE_HEADER};

use std::sync::Arc;

use crate::engine::Engine;
use crate::error::Result;

/// Entry point for every trigger source except the scheduler loop.
pub struct TriggerHub {
    engine: Engine,
    index: Arc<SubscriptionIndex>,
}

impl TriggerHub {
    pub fn new(engine: Engine) -> Self {
        let index = Arc::new(SubscriptionIndex::new(engine.store().clone()));
        Self { engine, index }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.index
    }

    /// Rebuild the subscription index. Call after any workflow is created,
    /// updated, activated or deactivated.
    pub async fn refresh(&self) -> Result<usize> {
        self.index.rebuild().await
    }
}
