//! Storage layer for workflows, executions, versions and approvals.
//!
//! The engine talks to persistence only through [`Store`], so tests and
//! embedders can swap the backend. [`SqliteStorage`] is the bundled
//! implementation.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::workflow::Workflow;

/// Persistence collaborator.
///
/// Reads of a single execution observe all writes previously made for it.
#[async_trait]
pub trait Store: Send + Sync {
    // Workflows
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>>;
    async fn delete_workflow(&self, id: &str) -> Result<()>;
    async fn touch_last_executed(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    // Versions
    async fn save_version(&self, version: &WorkflowVersion) -> Result<()>;
    /// Newest first.
    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>>;
    async fn get_version(&self, workflow_id: &str, version: u32) -> Result<Option<WorkflowVersion>>;
    async fn latest_version_number(&self, workflow_id: &str) -> Result<Option<u32>>;
    /// Delete all but the newest `keep` versions, returning how many went.
    async fn prune_versions(&self, workflow_id: &str, keep: usize) -> Result<usize>;

    // Executions
    /// Upsert the execution row and every step it carries.
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;
    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>>;
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>>;
    /// Atomically move an execution from one of `from` to `to`. Returns
    /// false when the execution was not in any of `from`.
    async fn transition_status(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool>;
    /// Ids of WAITING executions whose `resume_at` is at or before `now`.
    async fn due_waiting(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
    async fn save_step(&self, execution_id: &str, step: &ExecutionStep) -> Result<()>;

    // Logs
    async fn append_log(&self, log: &ExecutionLog) -> Result<()>;
    async fn list_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>>;

    // Approvals
    async fn save_approval(&self, approval: &ApprovalRequest) -> Result<()>;
    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>>;
    async fn list_approvals(
        &self,
        tenant_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>>;
}
