//! Delay action.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, Suspension};
use crate::workflow::{NodeAction, WorkflowNode};

/// Sleeps in-task for short delays and suspends the execution for long ones.
pub struct DelayAction;

#[async_trait]
impl Action for DelayAction {
    fn action_type(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Pause the workflow for a duration"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Delay(config) = &node.action else {
            return ActionFailure::validation("delay action received wrong config").into();
        };
        let duration = config.as_duration();

        if duration < ctx.services.settings.short_delay_threshold() {
            debug!("Delay {}: sleeping {}ms", node.id, duration.as_millis());
            tokio::time::sleep(duration).await;
            return ActionOutcome::completed(json!({
                "delayed_ms": duration.as_millis() as u64,
                "suspended": false,
            }));
        }

        let resume_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let Some(resume_at) = resume_at else {
            return ActionFailure::validation("Delay is too long").into();
        };
        debug!("Delay {}: suspending until {}", node.id, resume_at);
        ActionOutcome::Suspended(Suspension {
            waiting_for: format!("delay:{}", node.id),
            resume_at: Some(resume_at),
            data: json!({ "resume_at": resume_at }),
        })
    }

    async fn resume(&self, node: &WorkflowNode, _ctx: &ActionContext, _waiting_for: &str) -> ActionOutcome {
        let delayed_ms = match &node.action {
            NodeAction::Delay(config) => config.as_duration().as_millis() as u64,
            _ => 0,
        };
        ActionOutcome::completed(json!({
            "delayed_ms": delayed_ms,
            "suspended": true,
            "resumed_at": Utc::now(),
        }))
    }
}
