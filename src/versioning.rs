//! Workflow version history.
//!
//! Every save appends an immutable snapshot and bumps the live workflow's
//! version. History is bounded; the oldest snapshots are pruned. Rollback
//! copies an old snapshot onto the live workflow and records it as a new
//! version, so history only grows forward.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::config::VersionSettings;
use crate::error::{Error, Result};
use crate::storage::{Store, WorkflowVersion};
use crate::workflow::{EdgeKind, NodeConnection, Workflow};

/// Structural difference between two versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VersionDiff {
    pub from: u32,
    pub to: u32,
    pub nodes_added: Vec<String>,
    pub nodes_removed: Vec<String>,
    pub nodes_changed: Vec<String>,
    pub connections_added: Vec<String>,
    pub connections_removed: Vec<String>,
    pub name_changed: bool,
    pub description_changed: bool,
    pub trigger_changed: bool,
    pub error_handler_changed: bool,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.nodes_added.is_empty()
            && self.nodes_removed.is_empty()
            && self.nodes_changed.is_empty()
            && self.connections_added.is_empty()
            && self.connections_removed.is_empty()
            && !self.name_changed
            && !self.description_changed
            && !self.trigger_changed
            && !self.error_handler_changed
    }
}

fn connection_label(connection: &NodeConnection) -> String {
    let mut label = format!("{} -> {}", connection.from, connection.to);
    if connection.kind == EdgeKind::OnFailure {
        label.push_str(" (on_failure)");
    }
    if connection.condition.is_some() {
        label.push_str(" [conditional]");
    }
    label
}

/// Diff two definitions, `old` to `new`.
pub fn diff_workflows(old: &Workflow, new: &Workflow) -> VersionDiff {
    let mut diff = VersionDiff {
        from: old.version,
        to: new.version,
        name_changed: old.name != new.name,
        description_changed: old.description != new.description,
        trigger_changed: old.trigger != new.trigger,
        error_handler_changed: old.error_handler != new.error_handler,
        ..Default::default()
    };

    for node in &new.nodes {
        match old.get_node(&node.id) {
            None => diff.nodes_added.push(node.id.clone()),
            Some(previous) if previous != node => diff.nodes_changed.push(node.id.clone()),
            Some(_) => {}
        }
    }
    diff.nodes_removed = old
        .nodes
        .iter()
        .filter(|n| new.get_node(&n.id).is_none())
        .map(|n| n.id.clone())
        .collect();

    diff.connections_added = new
        .connections
        .iter()
        .filter(|c| !old.connections.contains(c))
        .map(connection_label)
        .collect();
    diff.connections_removed = old
        .connections
        .iter()
        .filter(|c| !new.connections.contains(c))
        .map(connection_label)
        .collect();

    diff
}

pub struct VersionService {
    store: Arc<dyn Store>,
    settings: VersionSettings,
}

impl VersionService {
    pub fn new(store: Arc<dyn Store>, settings: VersionSettings) -> Self {
        Self { store, settings }
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))
    }

    /// Snapshot `workflow` as its next version and persist both. The live
    /// workflow's `version` is bumped to the new number.
    pub async fn record(
        &self,
        mut workflow: Workflow,
        created_by: Option<&str>,
        note: Option<&str>,
    ) -> Result<WorkflowVersion> {
        let latest = self.store.latest_version_number(&workflow.id).await?;
        let number = latest.map_or(1, |n| n + 1);

        workflow.version = number;
        workflow.metadata.updated_at = Utc::now();
        self.store.save_workflow(&workflow).await?;

        let version = WorkflowVersion {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            version: number,
            snapshot: workflow,
            created_at: Utc::now(),
            created_by: created_by.map(str::to_string),
            note: note.map(str::to_string),
        };
        self.store.save_version(&version).await?;

        let pruned = self
            .store
            .prune_versions(&version.workflow_id, self.settings.max_versions.max(1))
            .await?;
        info!(
            workflow_id = %version.workflow_id,
            version = number,
            pruned,
            "Workflow version saved"
        );
        Ok(version)
    }

    /// Snapshot the stored workflow as a new version.
    pub async fn save_version(
        &self,
        workflow_id: &str,
        created_by: Option<&str>,
        note: Option<&str>,
    ) -> Result<WorkflowVersion> {
        let workflow = self.load_workflow(workflow_id).await?;
        self.record(workflow, created_by, note).await
    }

    /// Newest first.
    pub async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>> {
        self.store.list_versions(workflow_id).await
    }

    pub async fn get_version(&self, workflow_id: &str, version: u32) -> Result<WorkflowVersion> {
        self.store
            .get_version(workflow_id, version)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Workflow {} version {}", workflow_id, version))
            })
    }

    pub async fn compare_versions(&self, workflow_id: &str, from: u32, to: u32) -> Result<VersionDiff> {
        let old = self.get_version(workflow_id, from).await?;
        let new = self.get_version(workflow_id, to).await?;
        Ok(diff_workflows(&old.snapshot, &new.snapshot))
    }

    /// Copy version `target` onto the live workflow and record the result as
    /// a new version. Identity, tenant and lifecycle status stay as they are.
    pub async fn rollback(
        &self,
        workflow_id: &str,
        target: u32,
        created_by: Option<&str>,
    ) -> Result<WorkflowVersion> {
        let live = self.load_workflow(workflow_id).await?;
        let snapshot = self.get_version(workflow_id, target).await?.snapshot;

        let restored = Workflow {
            id: live.id,
            tenant_id: live.tenant_id,
            status: live.status,
            version: live.version,
            last_executed_at: live.last_executed_at,
            metadata: crate::workflow::WorkflowMetadata {
                created_at: live.metadata.created_at,
                ..snapshot.metadata.clone()
            },
            ..snapshot
        };
        let note = format!("Rollback to version {}", target);
        self.record(restored, created_by, Some(&note)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::workflow::{parse_workflow, WorkflowStatus};

    const V1: &str = r#"
id: wf-invoice
name: invoice-approval
status: active
tenant_id: acme
trigger:
  type: entity_event
  entity: invoice
  event: created
nodes:
  - id: check
    type: data_mutation
    config:
      set: { checked: true }
    next: notify
  - id: notify
    type: notification
    config:
      recipients: [finance]
      title: New invoice
"#;

    fn service(max_versions: usize) -> (VersionService, Arc<SqliteStorage>) {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        (
            VersionService::new(store.clone(), VersionSettings { max_versions }),
            store,
        )
    }

    fn edited(mut wf: Workflow) -> Workflow {
        wf.name = "invoice-approval-v2".into();
        wf.nodes.retain(|n| n.id != "notify");
        wf.nodes[0].next = None;
        wf.nodes.push(parse_workflow(V1).unwrap().nodes[1].clone());
        wf.nodes[1].id = "alert".into();
        wf.connections.push(NodeConnection::new("check", "alert"));
        wf
    }

    #[tokio::test]
    async fn test_save_then_rollback_reproduces_structure() {
        let (versions, store) = service(50);
        let original = parse_workflow(V1).unwrap();
        store.save_workflow(&original).await.unwrap();
        let v1 = versions.save_version("wf-invoice", Some("ana"), None).await.unwrap();
        assert_eq!(v1.version, 1);

        let live = store.get_workflow("wf-invoice").await.unwrap().unwrap();
        let v2 = versions.record(edited(live), Some("ana"), Some("rework")).await.unwrap();
        assert_eq!(v2.version, 2);

        let v3 = versions.rollback("wf-invoice", 1, Some("bo")).await.unwrap();
        assert_eq!(v3.version, 3);
        assert_eq!(v3.note.as_deref(), Some("Rollback to version 1"));

        let live = store.get_workflow("wf-invoice").await.unwrap().unwrap();
        assert_eq!(live.version, 3);
        assert_eq!(live.status, WorkflowStatus::Active);
        assert_eq!(live.name, original.name);
        assert_eq!(live.nodes, original.nodes);
        assert_eq!(live.connections, original.connections);
        assert_eq!(live.trigger, original.trigger);
        assert!(diff_workflows(&v1.snapshot, &live).nodes_changed.is_empty());

        let history = versions.list_versions("wf-invoice").await.unwrap();
        let numbers: Vec<u32> = history.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_compare_versions() {
        let (versions, store) = service(50);
        store.save_workflow(&parse_workflow(V1).unwrap()).await.unwrap();
        versions.save_version("wf-invoice", None, None).await.unwrap();
        let live = store.get_workflow("wf-invoice").await.unwrap().unwrap();
        versions.record(edited(live), None, None).await.unwrap();

        let diff = versions.compare_versions("wf-invoice", 1, 2).await.unwrap();
        assert_eq!(diff.from, 1);
        assert_eq!(diff.to, 2);
        assert_eq!(diff.nodes_added, vec!["alert"]);
        assert_eq!(diff.nodes_removed, vec!["notify"]);
        assert_eq!(diff.nodes_changed, vec!["check"]);
        assert_eq!(diff.connections_added, vec!["check -> alert"]);
        assert!(diff.name_changed);
        assert!(!diff.trigger_changed);

        let same = versions.compare_versions("wf-invoice", 2, 2).await.unwrap();
        assert!(same.is_empty());
        assert!(matches!(
            versions.compare_versions("wf-invoice", 1, 9).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (versions, store) = service(3);
        store.save_workflow(&parse_workflow(V1).unwrap()).await.unwrap();
        for _ in 0..5 {
            versions.save_version("wf-invoice", None, None).await.unwrap();
        }
        let history = versions.list_versions("wf-invoice").await.unwrap();
        let numbers: Vec<u32> = history.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![5, 4, 3]);
        assert!(versions.rollback("wf-invoice", 1, None).await.is_err());
    }
}
