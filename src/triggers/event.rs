//! Entity and domain event dispatch.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::index::{EventKey, Subscription};
use super::TriggerHub;
use crate::engine::RunMode;
use crate::expr::evaluate;
use crate::metrics;
use crate::storage::ExecutionContext;
use crate::workflow::TriggerType;

/// What happened to each subscribed workflow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    /// Ids of the executions started.
    pub started: Vec<String>,
    /// Workflows whose pre-filter rejected the event.
    pub filtered: Vec<String>,
    pub failed: Vec<DispatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchFailure {
    pub workflow_id: String,
    pub error: String,
}

impl TriggerHub {
    /// Start an execution of every ACTIVE workflow of `tenant_id` subscribed
    /// to `(entity, event)` whose conditions match `{entity: data}`.
    #[instrument(name = "trigger.entity_event", skip(self, data), fields(tenant = %tenant_id))]
    pub async fn handle_event(
        &self,
        entity: &str,
        event: &str,
        data: Value,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> DispatchReport {
        let subscriptions = self
            .index()
            .lookup(tenant_id, &EventKey::entity(entity, event))
            .await;
        let mut payload = serde_json::Map::new();
        payload.insert(entity.to_string(), data);
        let payload = Value::Object(payload);

        let source = format!("{}.{}", entity, event);
        self.dispatch(
            subscriptions,
            TriggerType::EntityEvent,
            &source,
            payload,
            tenant_id,
            user_id,
        )
        .await
    }

    /// Entry point for business modules after a create, update or delete.
    pub async fn emit_entity_event(
        &self,
        entity: &str,
        event: &str,
        data: Value,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> DispatchReport {
        debug!(entity, event, tenant = tenant_id, "Entity event emitted");
        self.handle_event(entity, event, data, tenant_id, user_id)
            .await
    }

    /// Same flow for named domain events. Conditions and variables see
    /// `{event, payload}`.
    #[instrument(name = "trigger.domain_event", skip(self, payload), fields(tenant = %tenant_id))]
    pub async fn emit_domain_event(
        &self,
        event: &str,
        payload: Value,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> DispatchReport {
        let subscriptions = self
            .index()
            .lookup(tenant_id, &EventKey::domain(event))
            .await;
        let data = json!({ "event": event, "payload": payload });
        self.dispatch(
            subscriptions,
            TriggerType::DomainEvent,
            event,
            data,
            tenant_id,
            user_id,
        )
        .await
    }

    async fn dispatch(
        &self,
        subscriptions: Vec<Subscription>,
        trigger_type: TriggerType,
        source: &str,
        data: Value,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let label = trigger_type.to_string();

        for subscription in subscriptions {
            if let Some(conditions) = &subscription.trigger.conditions {
                if !evaluate(conditions, &data) {
                    debug!(workflow = %subscription.workflow_name, "Event filtered by trigger conditions");
                    metrics::record_trigger(&label, "filtered");
                    report.filtered.push(subscription.workflow_id);
                    continue;
                }
            }

            let context = ExecutionContext::new(trigger_type, tenant_id, data.clone())
                .with_source(source)
                .with_user(user_id);
            match self
                .engine()
                .trigger_workflow(&subscription.workflow_id, context, RunMode::Async)
                .await
            {
                Ok(execution) => {
                    metrics::record_trigger(&label, "started");
                    report.started.push(execution.id);
                }
                Err(e) => {
                    warn!(
                        workflow = %subscription.workflow_name,
                        "Failed to start execution for {}: {}",
                        source,
                        e
                    );
                    metrics::record_trigger(&label, "failed");
                    report.failed.push(DispatchFailure {
                        workflow_id: subscription.workflow_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            source,
            started = report.started.len(),
            filtered = report.filtered.len(),
            failed = report.failed.len(),
            "Event dispatched"
        );
        report
    }
}
