//! Notification action and the `Notifier` collaborator.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::error::Result;
use crate::expr::{interpolate, resolve_value, strip_token, value_to_string};
use crate::workflow::{NodeAction, WorkflowNode};

/// One delivery to one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub tenant_id: String,
    pub recipient: String,
    pub channel: String,
    pub title: String,
    pub message: String,
    pub priority: Option<String>,
    pub data: Value,
}

/// Delivers notifications to users. The host application supplies the
/// real implementation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<()> {
        info!(
            tenant = %n.tenant_id,
            recipient = %n.recipient,
            channel = %n.channel,
            "Notification: {}",
            n.title
        );
        Ok(())
    }
}

/// Expand recipient entries. Entries that are a lone `{{path}}` token
/// resolving to a list contribute every element.
pub(crate) fn expand_recipients(entries: &[String], vars: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |s: String| {
        let s = s.trim().to_string();
        if !s.is_empty() && !s.contains("{{") && !out.contains(&s) {
            out.push(s);
        }
    };
    for entry in entries {
        if strip_token(entry).is_some() {
            match resolve_value(entry, vars) {
                Value::Array(items) => items.iter().map(value_to_string).for_each(&mut push),
                Value::Null => {}
                other => push(value_to_string(&other)),
            }
        } else {
            push(interpolate(entry, vars));
        }
    }
    out
}

pub struct NotificationAction;

#[async_trait]
impl Action for NotificationAction {
    fn action_type(&self) -> &str {
        "notification"
    }

    fn description(&self) -> &str {
        "Send a notification to users on one or more channels"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Notification(config) = &node.action else {
            return ActionFailure::validation("notification action received wrong config").into();
        };
        let vars = ctx.vars();
        let recipients = expand_recipients(&config.recipients, vars);
        if recipients.is_empty() {
            return ActionFailure::validation("No recipients resolved").into();
        }

        let title = interpolate(&config.title, vars);
        let message = interpolate(&config.message, vars);
        let mut delivered = Vec::new();
        let mut failed = Vec::new();

        for recipient in &recipients {
            for channel in &config.channels {
                let notification = Notification {
                    tenant_id: ctx.tenant_id.clone(),
                    recipient: recipient.clone(),
                    channel: channel.clone(),
                    title: title.clone(),
                    message: message.clone(),
                    priority: config.priority.clone(),
                    data: json!({
                        "execution_id": ctx.execution_id,
                        "workflow_id": ctx.workflow_id,
                    }),
                };
                match ctx.services.notifier.send(&notification).await {
                    Ok(()) => delivered.push(json!({"recipient": recipient, "channel": channel})),
                    Err(e) => {
                        warn!(recipient = %recipient, channel = %channel, "Notification failed: {}", e);
                        failed.push(json!({
                            "recipient": recipient,
                            "channel": channel,
                            "error": e.to_string(),
                        }));
                    }
                }
            }
        }

        let data = json!({
            "delivered": delivered.len(),
            "failed": failed.len(),
            "deliveries": delivered,
            "failures": failed,
        });
        if delivered.is_empty() {
            return ActionFailure::action("All notification deliveries failed")
                .with_data(data)
                .into();
        }
        ActionResult::new(data).into()
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<Notification>>,
    /// Recipients whose deliveries fail.
    pub failing: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().unwrap().push(recipient.to_string());
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.failing.lock().unwrap().contains(&notification.recipient) {
            return Err(crate::error::Error::Action("mailbox full".into()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
