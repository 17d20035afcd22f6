//! Workflow YAML parser.

use std::path::Path;

use super::types::Workflow;
use crate::error::{Error, Result};

/// Parse a workflow from a YAML (or JSON) string.
pub fn parse_workflow(yaml: &str) -> Result<Workflow> {
    if yaml.trim().is_empty() {
        return Err(Error::Validation("Empty workflow definition".to_string()));
    }

    let workflow: Workflow = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Validation(format!("Missing required field: {}", field))
        } else {
            Error::Validation(format!("Invalid YAML: {}", msg))
        }
    })?;
    Ok(workflow)
}

/// Parse a workflow from a file path.
pub fn parse_workflow_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeAction, TriggerKind, WorkflowStatus};

    #[test]
    fn test_parse_entity_event_workflow() {
        let yaml = r#"
name: invoice-approval
status: active
tenant_id: acme
trigger:
  type: entity_event
  entity: invoice
  event: created
  conditions:
    mode: all
    rules:
      - field: invoice.total
        operator: greater_than
        value: 1000
nodes:
  - id: approve
    type: approval
    config:
      title: "Approve {{invoice.number}}"
      approvers: [finance-lead]
      timeout_hours: 1
      on_timeout: escalate
      escalate_to: [cfo]
    next: notify
  - id: notify
    type: notification
    config:
      recipients: ["{{invoice.owner_id}}"]
      title: Approved
error_handler:
  retry_count: 2
  escalation_contacts: [ops]
"#;

        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.name, "invoice-approval");
        assert_eq!(workflow.status, WorkflowStatus::Active);
        assert_eq!(workflow.tenant_id, "acme");
        assert!(matches!(
            &workflow.trigger.kind,
            TriggerKind::EntityEvent { entity, event } if entity == "invoice" && event == "created"
        ));
        assert_eq!(workflow.nodes.len(), 2);
        assert!(matches!(workflow.nodes[0].action, NodeAction::Approval(_)));
        assert_eq!(workflow.nodes[0].next.as_deref(), Some("notify"));
        assert_eq!(workflow.error_handler.retry_count, 2);
    }

    #[test]
    fn test_parse_schedule_trigger() {
        let yaml = r#"
name: nightly
trigger:
  type: schedule
  cron: "0 2 * * *"
  timezone: Europe/Berlin
nodes:
  - id: ping
    type: webhook
    config:
      url: https://example.com/hook
"#;
        let workflow = parse_workflow(yaml).unwrap();
        match &workflow.trigger.kind {
            TriggerKind::Schedule { cron, timezone } => {
                assert_eq!(cron, "0 2 * * *");
                assert_eq!(timezone.as_deref(), Some("Europe/Berlin"));
            }
            other => panic!("Expected schedule trigger, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_workflow() {
        let result = parse_workflow("");
        assert!(result
            .unwrap_err()
            .to_string()
            .to_lowercase()
            .contains("empty workflow"));
    }

    #[test]
    fn test_parse_missing_required_field_name() {
        let yaml = r#"
trigger:
  type: manual
nodes: []
"#;
        let result = parse_workflow(yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Missing required field: name"));
    }
}
