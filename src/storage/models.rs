//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{ApprovalMode, ExpiryPolicy, TriggerType, Workflow};

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Waiting)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Immutable seed of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub trigger_type: TriggerType,
    /// Event name, cron expression or webhook path that fired.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    pub tenant_id: String,
    /// Sub-workflow nesting depth, 0 at the root.
    #[serde(default)]
    pub depth: u32,
    /// Workflow ids from the root execution down to the caller.
    #[serde(default)]
    pub call_stack: Vec<String>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub root_execution_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(trigger_type: TriggerType, tenant_id: &str, trigger_data: Value) -> Self {
        Self {
            trigger_type,
            source: None,
            trigger_data,
            user_id: None,
            tenant_id: tenant_id.to_string(),
            depth: 0,
            call_stack: Vec::new(),
            parent_execution_id: None,
            root_execution_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

/// One concrete run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: u32,
    /// Definition as it was when the run was triggered.
    pub snapshot: Workflow,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_node_id: Option<String>,
    /// Total retries performed across all steps.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub waiting_for: Option<String>,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Build a pending execution from a workflow snapshot.
    pub fn new(snapshot: Workflow, context: ExecutionContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: snapshot.id.clone(),
            workflow_name: snapshot.name.clone(),
            workflow_version: snapshot.version,
            tenant_id: context.tenant_id.clone(),
            snapshot,
            status: ExecutionStatus::Pending,
            context,
            steps: Vec::new(),
            variables: Value::Object(Default::default()),
            current_node_id: None,
            error: None,
            error_node_id: None,
            retry_count: 0,
            output: None,
            waiting_for: None,
            resume_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Recorded result of one node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub node_id: String,
    pub node_type: String,
    pub node_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Retries performed, not attempts.
    #[serde(default)]
    pub retry_count: u32,
}

impl ExecutionStep {
    pub fn start(node_id: &str, node_type: &str, node_name: &str, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            node_name: node_name.to_string(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            input,
            output: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Append-only execution log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub execution_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(execution_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id: None,
            level,
            message: message.into(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Immutable snapshot of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: String,
    pub workflow_id: String,
    pub version: u32,
    pub snapshot: Workflow,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Approval request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown approval status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approver: String,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Request raised by an approval step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub tenant_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub approvers: Vec<String>,
    pub mode: ApprovalMode,
    #[serde(default)]
    pub responses: Vec<ApprovalResponse>,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub on_timeout: ExpiryPolicy,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Record a response and recompute the status.
    ///
    /// Any rejection rejects. In `any` mode one approval approves; in `all`
    /// mode every approver must approve.
    pub fn record(&mut self, response: ApprovalResponse) {
        self.responses.retain(|r| r.approver != response.approver);
        self.responses.push(response);

        if self
            .responses
            .iter()
            .any(|r| r.decision == ApprovalDecision::Reject)
        {
            self.status = ApprovalStatus::Rejected;
            return;
        }

        let approved = |who: &String| {
            self.responses
                .iter()
                .any(|r| &r.approver == who && r.decision == ApprovalDecision::Approve)
        };
        let resolved = match self.mode {
            ApprovalMode::Any => !self.responses.is_empty(),
            ApprovalMode::All => self.approvers.iter().all(approved),
        };
        if resolved {
            self.status = ApprovalStatus::Approved;
        }
    }
}

/// Filter for listing workflows.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub tenant_id: Option<String>,
    pub status: Option<crate::workflow::WorkflowStatus>,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub tenant_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: ApprovalMode) -> ApprovalRequest {
        ApprovalRequest {
            id: "ap-1".into(),
            execution_id: "ex-1".into(),
            node_id: "approve".into(),
            tenant_id: "t".into(),
            title: "Sign".into(),
            description: String::new(),
            approvers: vec!["a".into(), "b".into()],
            mode,
            responses: vec![],
            status: ApprovalStatus::Pending,
            expires_at: Utc::now(),
            on_timeout: ExpiryPolicy::AutoReject,
            created_at: Utc::now(),
        }
    }

    fn respond(who: &str, decision: ApprovalDecision) -> ApprovalResponse {
        ApprovalResponse {
            approver: who.into(),
            decision,
            comment: None,
            responded_at: Utc::now(),
        }
    }

    #[test]
    fn test_any_mode_resolves_on_first_approval() {
        let mut req = request(ApprovalMode::Any);
        req.record(respond("a", ApprovalDecision::Approve));
        assert_eq!(req.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_all_mode_needs_everyone() {
        let mut req = request(ApprovalMode::All);
        req.record(respond("a", ApprovalDecision::Approve));
        assert_eq!(req.status, ApprovalStatus::Pending);
        req.record(respond("b", ApprovalDecision::Approve));
        assert_eq!(req.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_rejection_wins() {
        let mut req = request(ApprovalMode::All);
        req.record(respond("a", ApprovalDecision::Approve));
        req.record(respond("b", ApprovalDecision::Reject));
        assert_eq!(req.status, ApprovalStatus::Rejected);
    }

    #[test]
    fn test_status_round_trip() {
        for status in ["pending", "running", "waiting", "completed", "failed", "cancelled"] {
            let parsed: ExecutionStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        assert!(ExecutionStatus::Waiting.is_cancellable());
        assert!(!ExecutionStatus::Completed.is_cancellable());
    }
}
