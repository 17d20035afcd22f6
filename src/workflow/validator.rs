//! Workflow validation, applied when a definition is saved.

use std::collections::HashSet;

use super::types::{NodeAction, TriggerKind, Workflow, MAX_APPROVAL_TIMEOUT_HOURS, MAX_NODES};
use crate::actions::ActionRegistry;
use crate::error::{Error, Result};
use crate::triggers::scheduler::{parse_cron, parse_timezone};

/// Validate a workflow definition.
///
/// Checks for:
/// - Name and node count limits
/// - Unique node IDs
/// - Every `next`, connection, branch and error route referencing an existing node
/// - Trigger fields (cron expression, timezone, webhook path, parameter names)
/// - Per-action configuration invariants
/// - Extension actions being registered (if registry provided)
pub fn validate_workflow(workflow: &Workflow, registry: Option<&ActionRegistry>) -> Result<()> {
    if workflow.name.trim().is_empty() {
        return Err(Error::Validation("Workflow name is required".into()));
    }

    if workflow.nodes.is_empty() {
        return Err(Error::Validation(
            "Workflow must have at least one node".into(),
        ));
    }
    if workflow.nodes.len() > MAX_NODES {
        return Err(Error::Validation(format!(
            "Workflow has {} nodes, maximum is {}",
            workflow.nodes.len(),
            MAX_NODES
        )));
    }

    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if node.id.trim().is_empty() {
            return Err(Error::Validation("Node ID cannot be empty".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate node ID: {}", node.id)));
        }
    }

    let require = |owner: &str, target: &str, what: &str| -> Result<()> {
        if ids.contains(target) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "{} '{}' references non-existent node '{}'",
                what, owner, target
            )))
        }
    };

    for node in &workflow.nodes {
        if let Some(next) = &node.next {
            require(&node.id, next, "Node")?;
        }
        for target in node.action.referenced_nodes() {
            require(&node.id, target, "Node")?;
        }
        validate_action(&node.id, &node.action, registry)?;
    }

    for conn in &workflow.connections {
        require(&conn.from, &conn.to, "Connection from")?;
        if !ids.contains(conn.from.as_str()) {
            return Err(Error::Validation(format!(
                "Connection starts at non-existent node '{}'",
                conn.from
            )));
        }
    }

    if let Some(target) = &workflow.error_handler.on_failure {
        require("error_handler", target, "Error handler")?;
    }

    validate_trigger(&workflow.trigger.kind)
}

fn validate_trigger(kind: &TriggerKind) -> Result<()> {
    match kind {
        TriggerKind::EntityEvent { entity, event } => {
            if entity.trim().is_empty() || event.trim().is_empty() {
                return Err(Error::Validation(
                    "Entity event trigger requires entity and event".into(),
                ));
            }
        }
        TriggerKind::DomainEvent { event } => {
            if event.trim().is_empty() {
                return Err(Error::Validation("Domain event trigger requires event".into()));
            }
        }
        TriggerKind::Schedule { cron, timezone } => {
            parse_cron(cron)?;
            if let Some(tz) = timezone {
                parse_timezone(tz)?;
            }
        }
        TriggerKind::Webhook { path, secret, .. } => {
            if secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "Webhook trigger '{}' requires a secret",
                    path
                )));
            }
            if path.is_empty()
                || !path
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::Validation(format!(
                    "Webhook path '{}' must be non-empty and contain only alphanumeric characters, hyphens, and underscores",
                    path
                )));
            }
        }
        TriggerKind::Manual { parameters, .. } => {
            let mut names = HashSet::new();
            for param in parameters {
                if param.name.trim().is_empty() {
                    return Err(Error::Validation("Parameter name cannot be empty".into()));
                }
                if !names.insert(param.name.as_str()) {
                    return Err(Error::Validation(format!(
                        "Duplicate parameter: {}",
                        param.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_action(node_id: &str, action: &NodeAction, registry: Option<&ActionRegistry>) -> Result<()> {
    let invalid = |msg: &str| Err(Error::Validation(format!("Node '{}': {}", node_id, msg)));

    match action {
        NodeAction::Notification(c) => {
            if c.recipients.is_empty() {
                return invalid("notification requires at least one recipient");
            }
            if c.channels.is_empty() {
                return invalid("notification requires at least one channel");
            }
        }
        NodeAction::Webhook(c) => {
            if c.url.trim().is_empty() {
                return invalid("webhook requires a url");
            }
            if !matches!(
                c.method.to_ascii_uppercase().as_str(),
                "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD"
            ) {
                return invalid("webhook method must be GET, POST, PUT, PATCH, DELETE or HEAD");
            }
        }
        NodeAction::Delay(c) => {
            if c.duration == 0 {
                return invalid("delay duration must be positive");
            }
        }
        NodeAction::Approval(c) => {
            if c.approvers.is_empty() {
                return invalid("approval requires at least one approver");
            }
            if !(c.timeout_hours > 0.0) {
                return invalid("approval timeout_hours must be positive");
            }
            if c.timeout_hours > MAX_APPROVAL_TIMEOUT_HOURS {
                return invalid(&format!(
                    "approval timeout_hours cannot exceed {}",
                    MAX_APPROVAL_TIMEOUT_HOURS
                ));
            }
        }
        NodeAction::Script(c) => {
            if c.source.trim().is_empty() {
                return invalid("script source cannot be empty");
            }
        }
        NodeAction::SubWorkflow(c) => {
            if c.workflow_id.trim().is_empty() {
                return invalid("sub_workflow requires workflow_id");
            }
        }
        NodeAction::Parallel(c) => {
            if c.branches.is_empty() {
                return invalid("parallel requires at least one branch");
            }
        }
        NodeAction::Loop(c) => {
            if c.max_iterations == 0 {
                return invalid("loop max_iterations must be positive");
            }
            if c.body == node_id {
                return invalid("loop body cannot be the loop node itself");
            }
        }
        NodeAction::Ai(c) => {
            if c.task == super::types::AiTask::Classify && c.labels.is_empty() {
                return invalid("classification requires labels");
            }
        }
        NodeAction::Extension(c) => {
            if let Some(registry) = registry {
                if !registry.has(&c.action) {
                    return invalid(&format!("unknown extension action '{}'", c.action));
                }
            }
        }
        NodeAction::DataMutation(_) | NodeAction::Branch(_) => {}
    }
    Ok(())
}
