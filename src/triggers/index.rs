//! Subscription index.
//!
//! Maps event keys per tenant, and webhook paths, to the ACTIVE workflows
//! subscribed to them. Readers share an immutable snapshot; `rebuild` builds
//! a fresh map from the store and swaps the pointer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::{Store, WorkflowFilter};
use crate::workflow::{TriggerConfig, TriggerKind, Workflow, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Entity { entity: String, event: String },
    Domain(String),
}

impl EventKey {
    pub fn entity(entity: &str, event: &str) -> Self {
        EventKey::Entity {
            entity: entity.to_string(),
            event: event.to_string(),
        }
    }

    pub fn domain(event: &str) -> Self {
        EventKey::Domain(event.to_string())
    }
}

/// An ACTIVE workflow listening on a key.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub workflow_id: String,
    pub workflow_name: String,
    pub tenant_id: String,
    pub trigger: TriggerConfig,
}

impl Subscription {
    fn of(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            tenant_id: workflow.tenant_id.clone(),
            trigger: workflow.trigger.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    events: HashMap<String, HashMap<EventKey, Vec<Subscription>>>,
    webhooks: HashMap<String, Subscription>,
}

impl Snapshot {
    fn build(workflows: &[Workflow]) -> Self {
        let mut snapshot = Snapshot::default();
        for workflow in workflows.iter().filter(|w| w.is_active()) {
            let key = match &workflow.trigger.kind {
                TriggerKind::EntityEvent { entity, event } => EventKey::entity(entity, event),
                TriggerKind::DomainEvent { event } => EventKey::domain(event),
                TriggerKind::Webhook { path, .. } => {
                    if let Some(existing) = snapshot.webhooks.get(path) {
                        warn!(
                            path = %path,
                            kept = %existing.workflow_id,
                            ignored = %workflow.id,
                            "Webhook path claimed by more than one workflow"
                        );
                    } else {
                        snapshot
                            .webhooks
                            .insert(path.clone(), Subscription::of(workflow));
                    }
                    continue;
                }
                TriggerKind::Schedule { .. } | TriggerKind::Manual { .. } => continue,
            };
            snapshot
                .events
                .entry(workflow.tenant_id.clone())
                .or_default()
                .entry(key)
                .or_default()
                .push(Subscription::of(workflow));
        }
        snapshot
    }

    fn len(&self) -> usize {
        self.webhooks.len()
            + self
                .events
                .values()
                .flat_map(|keys| keys.values())
                .map(Vec::len)
                .sum::<usize>()
    }
}

pub struct SubscriptionIndex {
    store: Arc<dyn Store>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SubscriptionIndex {
    /// An empty index. Call [`rebuild`](Self::rebuild) to load subscriptions.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Reload every ACTIVE workflow and swap in the new map. Returns the
    /// number of subscriptions.
    pub async fn rebuild(&self) -> Result<usize> {
        let workflows = self
            .store
            .list_workflows(&WorkflowFilter {
                tenant_id: None,
                status: Some(WorkflowStatus::Active),
            })
            .await?;
        let snapshot = Arc::new(Snapshot::build(&workflows));
        let count = snapshot.len();
        *self.snapshot.write().await = snapshot;
        debug!(subscriptions = count, "Subscription index rebuilt");
        Ok(count)
    }

    async fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Subscriptions of `tenant_id` on `key`, in workflow listing order.
    pub async fn lookup(&self, tenant_id: &str, key: &EventKey) -> Vec<Subscription> {
        self.current()
            .await
            .events
            .get(tenant_id)
            .and_then(|keys| keys.get(key))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn lookup_webhook(&self, path: &str) -> Option<Subscription> {
        self.current().await.webhooks.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.current().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
