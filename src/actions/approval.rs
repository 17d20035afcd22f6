//! Approval action.
//!
//! Raises an [`ApprovalRequest`], notifies the approvers and suspends the
//! run until a decision arrives or the request expires. Expiry applies the
//! node's policy, so a step never waits indefinitely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::notification::{expand_recipients, Notification};
use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult, Suspension};
use crate::expr::interpolate;
use crate::storage::{ApprovalRequest, ApprovalStatus};
use crate::workflow::{ApprovalConfig, ExpiryPolicy, NodeAction, WorkflowNode};

pub const WAITING_PREFIX: &str = "approval:";

pub struct ApprovalAction;

/// `now + hours`, or None when the offset is not a finite positive span
/// that fits a timestamp.
fn expiry(now: DateTime<Utc>, hours: f64) -> Option<DateTime<Utc>> {
    let millis = hours * 3_600_000.0;
    if !millis.is_finite() || millis <= 0.0 || millis > i64::MAX as f64 {
        return None;
    }
    chrono::Duration::try_milliseconds(millis as i64).and_then(|d| now.checked_add_signed(d))
}

impl ApprovalAction {
    async fn notify(ctx: &ActionContext, recipients: &[String], title: &str, message: &str) {
        for recipient in recipients {
            let notification = Notification {
                tenant_id: ctx.tenant_id.clone(),
                recipient: recipient.clone(),
                channel: "in_app".to_string(),
                title: title.to_string(),
                message: message.to_string(),
                priority: Some("high".to_string()),
                data: json!({ "execution_id": ctx.execution_id }),
            };
            if let Err(e) = ctx.services.notifier.send(&notification).await {
                warn!(recipient = %recipient, "Approval notification failed: {}", e);
            }
        }
    }

    fn decided(config: &ApprovalConfig, request: &ApprovalRequest, approved: bool, auto: bool) -> ActionOutcome {
        let next = if approved {
            config.on_approved.clone()
        } else {
            config.on_rejected.clone()
        };
        ActionResult::new(json!({
            "approval_id": request.id,
            "decision": if approved { "approved" } else { "rejected" },
            "auto": auto,
            "responses": request.responses,
        }))
        .with_next(next)
        .into()
    }

    async fn expire(
        config: &ApprovalConfig,
        mut request: ApprovalRequest,
        ctx: &ActionContext,
    ) -> ActionOutcome {
        request.status = ApprovalStatus::Expired;
        if let Err(e) = ctx.services.store.save_approval(&request).await {
            return ActionFailure::action(format!("Failed to persist approval: {}", e)).into();
        }
        info!(approval = %request.id, policy = ?request.on_timeout, "Approval expired");

        match request.on_timeout {
            ExpiryPolicy::AutoApprove => Self::decided(config, &request, true, true),
            ExpiryPolicy::AutoReject => Self::decided(config, &request, false, true),
            ExpiryPolicy::Escalate => {
                let contacts = expand_recipients(&config.escalate_to, ctx.vars());
                let title = format!("Approval overdue: {}", request.title);
                Self::notify(ctx, &contacts, &title, &request.description).await;
                ActionFailure::timeout(format!("Approval '{}' expired without a decision", request.title))
                    .non_retryable()
                    .with_data(json!({ "approval_id": request.id, "escalated_to": contacts }))
                    .into()
            }
        }
    }
}

#[async_trait]
impl Action for ApprovalAction {
    fn action_type(&self) -> &str {
        "approval"
    }

    fn description(&self) -> &str {
        "Wait for one or all approvers to approve or reject"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Approval(config) = &node.action else {
            return ActionFailure::validation("approval action received wrong config").into();
        };
        let vars = ctx.vars();
        let approvers = expand_recipients(&config.approvers, vars);
        if approvers.is_empty() {
            return ActionFailure::validation("No approvers resolved").into();
        }

        let now = Utc::now();
        let Some(expires_at) = expiry(now, config.timeout_hours) else {
            return ActionFailure::validation(format!(
                "Approval timeout of {} hours is out of range",
                config.timeout_hours
            ))
            .into();
        };
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: ctx.execution_id.clone(),
            node_id: node.id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            title: interpolate(&config.title, vars),
            description: interpolate(&config.description, vars),
            approvers,
            mode: config.mode,
            responses: Vec::new(),
            status: ApprovalStatus::Pending,
            expires_at,
            on_timeout: config.on_timeout,
            created_at: now,
        };
        if let Err(e) = ctx.services.store.save_approval(&request).await {
            return ActionFailure::action(format!("Failed to create approval request: {}", e)).into();
        }

        Self::notify(ctx, &request.approvers, &request.title, &request.description).await;

        ActionOutcome::Suspended(Suspension {
            waiting_for: format!("{}{}", WAITING_PREFIX, request.id),
            resume_at: Some(request.expires_at),
            data: json!({
                "approval_id": request.id,
                "approvers": request.approvers,
                "expires_at": request.expires_at,
            }),
        })
    }

    async fn resume(&self, node: &WorkflowNode, ctx: &ActionContext, waiting_for: &str) -> ActionOutcome {
        let NodeAction::Approval(config) = &node.action else {
            return ActionFailure::validation("approval action received wrong config").into();
        };
        let Some(id) = waiting_for.strip_prefix(WAITING_PREFIX) else {
            return ActionFailure::validation(format!("Not an approval wait: {}", waiting_for)).into();
        };
        let request = match ctx.services.store.get_approval(id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                return ActionFailure::validation(format!("Approval request not found: {}", id)).into()
            }
            Err(e) => return ActionFailure::action(format!("Failed to load approval: {}", e)).into(),
        };

        match request.status {
            ApprovalStatus::Approved => Self::decided(config, &request, true, false),
            ApprovalStatus::Rejected => Self::decided(config, &request, false, false),
            ApprovalStatus::Expired => Self::expire(config, request, ctx).await,
            ApprovalStatus::Pending if Utc::now() >= request.expires_at => {
                Self::expire(config, request, ctx).await
            }
            ApprovalStatus::Pending => ActionOutcome::Suspended(Suspension {
                waiting_for: waiting_for.to_string(),
                resume_at: Some(request.expires_at),
                data: json!({ "approval_id": request.id, "expires_at": request.expires_at }),
            }),
        }
    }
}
