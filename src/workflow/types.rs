//! Workflow type definitions.
//!
//! A workflow is a trigger plus a graph of nodes. Node configuration is a
//! tagged union over the known action kinds, validated when the workflow is
//! saved rather than when it runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expr::ConditionGroup;

/// Maximum number of nodes in one workflow.
pub const MAX_NODES: usize = 50;

/// Longest an approval may stay open: one year.
pub const MAX_APPROVAL_TIMEOUT_HOURS: f64 = 8_760.0;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: invoice-approval
/// status: active
/// trigger:
///   type: entity_event
///   entity: invoice
///   event: created
///   conditions:
///     rules:
///       - { field: invoice.total, operator: greater_than, value: 1000 }
/// nodes:
///   - id: approve
///     type: approval
///     config:
///       title: "Approve invoice {{invoice.number}}"
///       approvers: [finance-lead]
///       timeout_hours: 24
///       on_timeout: escalate
///     next: notify
///   - id: notify
///     type: notification
///     config:
///       recipients: ["{{invoice.owner_id}}"]
///       title: Invoice approved
///       message: "Invoice {{invoice.number}} was approved"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub status: WorkflowStatus,

    #[serde(default = "default_tenant")]
    pub tenant_id: String,

    pub trigger: TriggerConfig,

    pub nodes: Vec<WorkflowNode>,

    #[serde(default)]
    pub connections: Vec<NodeConnection>,

    #[serde(default)]
    pub error_handler: ErrorHandler,

    #[serde(default)]
    pub metadata: WorkflowMetadata,

    /// Baseline for cron next-fire computation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_version() -> u32 {
    1
}

pub(crate) fn default_tenant() -> String {
    "default".to_string()
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Unknown workflow status: {}", s)),
        }
    }
}

/// Creator, tags and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_by: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// What starts a workflow, plus an optional pre-filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(flatten)]
    pub kind: TriggerKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionGroup>,
}

impl TriggerConfig {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            conditions: None,
        }
    }

    pub fn with_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fired by `emit_entity_event(entity, event, ..)`.
    EntityEvent { entity: String, event: String },
    /// Cron schedule evaluated by the scheduler loop.
    Schedule {
        cron: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Inbound HTTP call on `/webhooks/{path}`.
    Webhook {
        path: String,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        scheme: SignatureScheme,
    },
    /// Explicit call by a user.
    Manual {
        #[serde(default)]
        allowed_roles: Vec<String>,
        #[serde(default)]
        parameters: Vec<ParameterSpec>,
    },
    /// Named application event not tied to an entity mutation.
    DomainEvent { event: String },
}

impl TriggerKind {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerKind::EntityEvent { .. } => TriggerType::EntityEvent,
            TriggerKind::Schedule { .. } => TriggerType::Schedule,
            TriggerKind::Webhook { .. } => TriggerType::Webhook,
            TriggerKind::Manual { .. } => TriggerType::Manual,
            TriggerKind::DomainEvent { .. } => TriggerType::DomainEvent,
        }
    }
}

/// The source class that started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    EntityEvent,
    Schedule,
    Webhook,
    Manual,
    DomainEvent,
    SubWorkflow,
    Retry,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EntityEvent => "entity_event",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
            Self::DomainEvent => "domain_event",
            Self::SubWorkflow => "sub_workflow",
            Self::Retry => "retry",
        };
        write!(f, "{}", s)
    }
}

/// How an inbound webhook proves it knows the secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// Hex HMAC-SHA256 of the raw body in `x-signature`.
    #[default]
    HmacSha256,
    /// Secret sent verbatim in `x-webhook-secret`.
    SharedSecret,
}

/// Declared parameter of a manual trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
    /// Allowed values, empty for no restriction.
    #[serde(default, rename = "enum")]
    pub allowed: Vec<Value>,
}

fn default_param_type() -> String {
    "any".to_string()
}

// ============================================================================
// Nodes
// ============================================================================

/// A node (step) in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub action: NodeAction,

    /// Explicit successor. Takes precedence over connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Overrides `ErrorHandler::retry_count` for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl WorkflowNode {
    pub fn new(id: &str, action: NodeAction) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            action,
            next: None,
            timeout_seconds: None,
            retry_count: None,
        }
    }

    pub fn with_next(mut self, next: &str) -> Self {
        self.next = Some(next.to_string());
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Configuration of a node, tagged by `type` with the body under `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum NodeAction {
    Notification(NotificationConfig),
    Webhook(WebhookConfig),
    Delay(DelayConfig),
    Approval(ApprovalConfig),
    Script(ScriptConfig),
    SubWorkflow(SubWorkflowConfig),
    DataMutation(DataMutationConfig),
    Ai(AiConfig),
    Branch(BranchConfig),
    Parallel(ParallelConfig),
    Loop(LoopConfig),
    /// Dispatched by name to a dynamically registered executor.
    Extension(ExtensionConfig),
}

impl NodeAction {
    /// Registry key used for dispatch.
    pub fn type_key(&self) -> &str {
        match self {
            NodeAction::Notification(_) => "notification",
            NodeAction::Webhook(_) => "webhook",
            NodeAction::Delay(_) => "delay",
            NodeAction::Approval(_) => "approval",
            NodeAction::Script(_) => "script",
            NodeAction::SubWorkflow(_) => "sub_workflow",
            NodeAction::DataMutation(_) => "data_mutation",
            NodeAction::Ai(_) => "ai",
            NodeAction::Branch(_) => "branch",
            NodeAction::Parallel(_) => "parallel",
            NodeAction::Loop(_) => "loop",
            NodeAction::Extension(ext) => &ext.action,
        }
    }

    /// Node ids this action may route to, for reference validation.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        match self {
            NodeAction::Branch(b) => b
                .on_true
                .iter()
                .chain(b.on_false.iter())
                .map(String::as_str)
                .collect(),
            NodeAction::Parallel(p) => p
                .branches
                .iter()
                .chain(p.join.iter())
                .map(String::as_str)
                .collect(),
            NodeAction::Loop(l) => vec![l.body.as_str()],
            NodeAction::Approval(a) => a
                .on_approved
                .iter()
                .chain(a.on_rejected.iter())
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Direct recipient ids or `{{path}}` references to lists.
    pub recipients: Vec<String>,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: Option<String>,
}

fn default_channels() -> Vec<String> {
    vec!["in_app".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Accepted status codes. Empty means any 2xx.
    #[serde(default)]
    pub expected_status: Vec<u16>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration: u64,
    #[serde(default)]
    pub unit: DelayUnit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayConfig {
    pub fn as_duration(&self) -> std::time::Duration {
        let ms = match self.unit {
            DelayUnit::Milliseconds => self.duration,
            DelayUnit::Seconds => self.duration.saturating_mul(1_000),
            DelayUnit::Minutes => self.duration.saturating_mul(60_000),
            DelayUnit::Hours => self.duration.saturating_mul(3_600_000),
            DelayUnit::Days => self.duration.saturating_mul(86_400_000),
        };
        std::time::Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Approver ids or `{{path}}` references to lists.
    pub approvers: Vec<String>,
    #[serde(default)]
    pub mode: ApprovalMode,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    #[serde(default)]
    pub on_timeout: ExpiryPolicy,
    /// Contacts notified when the policy is `escalate`.
    #[serde(default)]
    pub escalate_to: Vec<String>,
    #[serde(default)]
    pub on_approved: Option<String>,
    #[serde(default)]
    pub on_rejected: Option<String>,
}

fn default_timeout_hours() -> f64 {
    24.0
}

/// One-of-N or all-of-N approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Any,
    All,
}

/// What happens when an approval request expires unanswered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    AutoApprove,
    #[default]
    AutoReject,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub source: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Variable receiving the script result.
    #[serde(default)]
    pub output_variable: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    pub workflow_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "default_true")]
    pub wait: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub output_variable: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMutationConfig {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    pub prompt: String,
    #[serde(default)]
    pub task: AiTask,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Fail the step when the call fails instead of completing with `ok: false`.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub output_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiTask {
    #[default]
    Generate,
    Classify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub condition: ConditionGroup,
    #[serde(default)]
    pub on_true: Option<String>,
    #[serde(default)]
    pub on_false: Option<String>,
}

/// Fan-out over branch start nodes. Each branch walks `next` pointers until
/// it reaches `join` or runs out of successors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub branches: Vec<String>,
    #[serde(default)]
    pub join: Option<String>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

/// Runs the `body` sub-graph once per item. The body ends when it runs out
/// of successors or routes back to the loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Template resolving to a list.
    pub items: String,
    pub body: String,
    #[serde(default = "default_item_variable")]
    pub item_variable: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_max_iterations() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

// ============================================================================
// Edges and error handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionGroup>,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl NodeConnection {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
            kind: EdgeKind::Default,
        }
    }

    pub fn on_failure(from: &str, to: &str) -> Self {
        Self {
            kind: EdgeKind::OnFailure,
            ..Self::new(from, to)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Default,
    OnFailure,
}

/// Workflow-wide failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffType,
    /// Node to route to once retries are exhausted.
    #[serde(default)]
    pub on_failure: Option<String>,
    /// Notified when a run fails.
    #[serde(default)]
    pub escalation_contacts: Vec<String>,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffType::default(),
            on_failure: None,
            escalation_contacts: Vec::new(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

impl Workflow {
    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Entry node of the graph.
    pub fn first_node(&self) -> Option<&WorkflowNode> {
        self.nodes.first()
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Connections leaving `node_id` of the given kind, in declaration order.
    pub fn outgoing(&self, node_id: &str, kind: EdgeKind) -> impl Iterator<Item = &NodeConnection> {
        let node_id = node_id.to_string();
        self.connections
            .iter()
            .filter(move |c| c.from == node_id && c.kind == kind)
    }

    /// Distinct action keys used by this workflow.
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.iter().map(|n| n.action.type_key()).collect();
        types.sort();
        types.dedup();
        types
    }
}
