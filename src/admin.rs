//! Administrative service.
//!
//! Tenant-scoped operations behind the HTTP API and the CLI: workflow
//! definitions and their lifecycle, executions, approvals, version history
//! and the action catalogue. Every lookup checks that the record belongs to
//! the caller's tenant.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::actions::ActionInfo;
use crate::config::VersionSettings;
use crate::engine::{Engine, RunMode};
use crate::error::{Error, Result};
use crate::storage::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, ExecutionFilter, ExecutionLog,
    WorkflowExecution, WorkflowFilter, WorkflowVersion,
};
use crate::triggers::{Caller, TriggerHub};
use crate::versioning::{VersionDiff, VersionService};
use crate::workflow::{validate_workflow, Workflow, WorkflowStatus};

pub struct AdminService {
    engine: Engine,
    hub: Arc<TriggerHub>,
    versions: VersionService,
}

impl AdminService {
    pub fn new(hub: Arc<TriggerHub>, version_settings: VersionSettings) -> Self {
        let engine = hub.engine().clone();
        let versions = VersionService::new(engine.store().clone(), version_settings);
        Self {
            engine,
            hub,
            versions,
        }
    }

    pub fn hub(&self) -> &Arc<TriggerHub> {
        &self.hub
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    pub async fn list_workflows(
        &self,
        tenant_id: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>> {
        self.engine
            .store()
            .list_workflows(&WorkflowFilter {
                tenant_id: Some(tenant_id.to_string()),
                status,
            })
            .await
    }

    pub async fn get_workflow(&self, tenant_id: &str, id: &str) -> Result<Workflow> {
        let workflow = self
            .engine
            .store()
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", id)))?;
        if workflow.tenant_id != tenant_id {
            return Err(Error::Permission(format!(
                "Workflow {} does not belong to tenant {}",
                id, tenant_id
            )));
        }
        Ok(workflow)
    }

    /// Validate and store a new definition as a DRAFT, recording version 1.
    pub async fn create_workflow(&self, caller: &Caller, mut workflow: Workflow) -> Result<Workflow> {
        if self.engine.store().get_workflow(&workflow.id).await?.is_some() {
            return Err(Error::Validation(format!(
                "Workflow {} already exists",
                workflow.id
            )));
        }
        workflow.tenant_id = caller.tenant_id.clone();
        workflow.status = WorkflowStatus::Draft;
        workflow.last_executed_at = None;
        workflow.metadata.created_by = caller.user_id.clone();
        validate_workflow(&workflow, Some(self.engine.registry()))?;

        let version = self
            .versions
            .record(workflow, caller.user_id.as_deref(), Some("Created"))
            .await?;
        info!(workflow_id = %version.workflow_id, "Workflow created");
        Ok(version.snapshot)
    }

    /// Replace a definition, keeping its identity, tenant, status and
    /// schedule baseline, and record the result as a new version.
    pub async fn update_workflow(
        &self,
        caller: &Caller,
        id: &str,
        mut workflow: Workflow,
    ) -> Result<Workflow> {
        let existing = self.get_workflow(&caller.tenant_id, id).await?;
        workflow.id = existing.id;
        workflow.tenant_id = existing.tenant_id;
        workflow.status = existing.status;
        workflow.last_executed_at = existing.last_executed_at;
        workflow.metadata.created_at = existing.metadata.created_at;
        workflow.metadata.created_by = existing.metadata.created_by;
        validate_workflow(&workflow, Some(self.engine.registry()))?;

        let version = self
            .versions
            .record(workflow, caller.user_id.as_deref(), Some("Updated"))
            .await?;
        self.hub.refresh().await?;
        Ok(version.snapshot)
    }

    /// Move a workflow through draft, active, paused and archived.
    /// Activation re-validates against the current action registry.
    pub async fn set_status(
        &self,
        caller: &Caller,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<Workflow> {
        let mut workflow = self.get_workflow(&caller.tenant_id, id).await?;
        if workflow.status == WorkflowStatus::Archived && status != WorkflowStatus::Archived {
            return Err(Error::InvalidState(format!(
                "Workflow {} is archived",
                id
            )));
        }
        if status == WorkflowStatus::Active {
            validate_workflow(&workflow, Some(self.engine.registry()))?;
        }

        workflow.status = status;
        workflow.metadata.updated_at = chrono::Utc::now();
        self.engine.store().save_workflow(&workflow).await?;
        self.hub.refresh().await?;
        info!(workflow_id = %id, status = %status, "Workflow status changed");
        Ok(workflow)
    }

    pub async fn activate_workflow(&self, caller: &Caller, id: &str) -> Result<Workflow> {
        self.set_status(caller, id, WorkflowStatus::Active).await
    }

    pub async fn pause_workflow(&self, caller: &Caller, id: &str) -> Result<Workflow> {
        self.set_status(caller, id, WorkflowStatus::Paused).await
    }

    pub async fn trigger_workflow(
        &self,
        caller: &Caller,
        id: &str,
        parameters: Value,
        mode: RunMode,
    ) -> Result<WorkflowExecution> {
        self.hub.trigger_manual(id, parameters, caller, mode).await
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Newest first, without steps.
    pub async fn list_executions(
        &self,
        tenant_id: &str,
        mut filter: ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>> {
        filter.tenant_id = Some(tenant_id.to_string());
        self.engine.store().list_executions(&filter).await
    }

    pub async fn get_execution(&self, tenant_id: &str, id: &str) -> Result<WorkflowExecution> {
        let execution = self.engine.get_execution(id).await?;
        if execution.tenant_id != tenant_id {
            return Err(Error::Permission(format!(
                "Execution {} does not belong to tenant {}",
                id, tenant_id
            )));
        }
        Ok(execution)
    }

    pub async fn execution_logs(&self, tenant_id: &str, id: &str) -> Result<Vec<ExecutionLog>> {
        self.get_execution(tenant_id, id).await?;
        self.engine.store().list_logs(id).await
    }

    pub async fn cancel_execution(&self, tenant_id: &str, id: &str) -> Result<WorkflowExecution> {
        self.get_execution(tenant_id, id).await?;
        self.engine.cancel_execution(id).await
    }

    pub async fn retry_execution(&self, tenant_id: &str, id: &str) -> Result<WorkflowExecution> {
        self.get_execution(tenant_id, id).await?;
        self.engine.retry_execution(id).await
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    pub async fn list_approvals(
        &self,
        tenant_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>> {
        self.engine.store().list_approvals(tenant_id, status).await
    }

    pub async fn submit_approval(
        &self,
        caller: &Caller,
        approval_id: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest> {
        let approver = caller
            .user_id
            .as_deref()
            .ok_or_else(|| Error::Permission("Approvals require a user".to_string()))?;
        self.engine
            .submit_approval(approval_id, &caller.tenant_id, approver, decision, comment)
            .await
    }

    // ========================================================================
    // Versions and actions
    // ========================================================================

    pub async fn list_versions(&self, tenant_id: &str, id: &str) -> Result<Vec<WorkflowVersion>> {
        self.get_workflow(tenant_id, id).await?;
        self.versions.list_versions(id).await
    }

    pub async fn compare_versions(
        &self,
        tenant_id: &str,
        id: &str,
        from: u32,
        to: u32,
    ) -> Result<VersionDiff> {
        self.get_workflow(tenant_id, id).await?;
        self.versions.compare_versions(id, from, to).await
    }

    pub async fn rollback(&self, caller: &Caller, id: &str, target: u32) -> Result<WorkflowVersion> {
        self.get_workflow(&caller.tenant_id, id).await?;
        let version = self
            .versions
            .rollback(id, target, caller.user_id.as_deref())
            .await?;
        self.hub.refresh().await?;
        Ok(version)
    }

    pub fn list_actions(&self) -> Vec<ActionInfo> {
        self.engine.registry().list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine_with, wait_terminal};
    use crate::storage::ExecutionStatus;
    use crate::workflow::parse_workflow;
    use serde_json::json;

    const DEFINITION: &str = r#"
id: wf-onboard
name: onboarding
trigger:
  type: manual
nodes:
  - id: greet
    type: data_mutation
    config:
      set:
        greeting: "Welcome {{name}}"
"#;

    fn admin_service() -> AdminService {
        let (engine, _store) = engine_with(vec![]);
        AdminService::new(Arc::new(TriggerHub::new(engine)), VersionSettings::default())
    }

    fn ana() -> Caller {
        Caller::new("acme").with_user("ana")
    }

    #[tokio::test]
    async fn test_create_activate_trigger() {
        let admin = admin_service();
        let created = admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .unwrap();
        assert_eq!(created.status, WorkflowStatus::Draft);
        assert_eq!(created.tenant_id, "acme");
        assert_eq!(created.version, 1);

        let draft_run = admin
            .trigger_workflow(&ana(), "wf-onboard", json!({}), RunMode::Async)
            .await;
        assert!(matches!(draft_run, Err(Error::Validation(_))));

        admin.activate_workflow(&ana(), "wf-onboard").await.unwrap();
        let execution = admin
            .trigger_workflow(&ana(), "wf-onboard", json!({"name": "Bo"}), RunMode::Async)
            .await
            .unwrap();
        let done = wait_terminal(admin.engine(), &execution.id).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.variables["greeting"], "Welcome Bo");

        let listed = admin
            .list_executions("acme", ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!admin.execution_logs("acme", &done.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let admin = admin_service();
        admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            admin.get_workflow("globex", "wf-onboard").await,
            Err(Error::Permission(_))
        ));
        assert!(matches!(
            admin.activate_workflow(&Caller::new("globex"), "wf-onboard").await,
            Err(Error::Permission(_))
        ));
        assert!(admin.list_workflows("globex", None).await.unwrap().is_empty());
        assert_eq!(admin.list_workflows("acme", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_records_versions_and_keeps_status() {
        let admin = admin_service();
        admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .unwrap();
        admin.activate_workflow(&ana(), "wf-onboard").await.unwrap();

        let mut changed = parse_workflow(DEFINITION).unwrap();
        changed.description = "Greets new hires".into();
        let updated = admin
            .update_workflow(&ana(), "wf-onboard", changed)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, WorkflowStatus::Active);

        let diff = admin
            .compare_versions("acme", "wf-onboard", 1, 2)
            .await
            .unwrap();
        assert!(diff.description_changed);

        let rolled = admin.rollback(&ana(), "wf-onboard", 1).await.unwrap();
        assert_eq!(rolled.version, 3);
        let live = admin.get_workflow("acme", "wf-onboard").await.unwrap();
        assert_eq!(live.description, "");
        assert_eq!(live.status, WorkflowStatus::Active);
        assert_eq!(admin.list_versions("acme", "wf-onboard").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let admin = admin_service();
        let mut invalid = parse_workflow(DEFINITION).unwrap();
        invalid.nodes[0].next = Some("ghost".into());
        assert!(matches!(
            admin.create_workflow(&ana(), invalid).await,
            Err(Error::Validation(_))
        ));

        admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .unwrap();
        assert!(admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_archived_cannot_be_reactivated() {
        let admin = admin_service();
        admin
            .create_workflow(&ana(), parse_workflow(DEFINITION).unwrap())
            .await
            .unwrap();
        admin
            .set_status(&ana(), "wf-onboard", WorkflowStatus::Archived)
            .await
            .unwrap();
        assert!(matches!(
            admin.activate_workflow(&ana(), "wf-onboard").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_action_catalogue_includes_control_flow() {
        let admin = admin_service();
        let actions = admin.list_actions();
        assert!(actions.iter().any(|a| a.action_type == "approval"));
        assert!(actions.iter().any(|a| a.action_type == "parallel"));
    }
}
