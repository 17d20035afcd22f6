//! Action trait and context types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::notification::Notifier;
use crate::config::{ActionSettings, EngineSettings};
use crate::error::{Error, Result};
use crate::storage::{ExecutionContext, Store, WorkflowExecution};
use crate::workflow::WorkflowNode;

/// Successful action result.
#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    /// Step output
    pub data: Value,
    /// Variables to set on the execution
    pub variables: Map<String, Value>,
    /// Variables to remove from the execution
    pub remove: Vec<String>,
    /// Overrides the node's `next` pointer and edges
    pub next: Option<String>,
}

impl ActionResult {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    pub fn with_next(mut self, next: Option<String>) -> Self {
        self.next = next;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Action,
    Timeout,
    Cycle,
    Validation,
}

/// Structured action failure.
#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub data: Value,
    /// Whether the error handler may retry the step.
    pub retryable: bool,
}

impl ActionFailure {
    fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            data: Value::Null,
            retryable,
        }
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Action, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message, true)
    }

    pub fn cycle(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cycle, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message, false)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Output recorded on the failed step.
    pub fn to_output(&self) -> Value {
        json!({
            "kind": self.kind,
            "message": self.message,
            "data": self.data,
        })
    }

    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::Action => Error::Action(self.message),
            FailureKind::Timeout => Error::Timeout(self.message),
            FailureKind::Cycle => Error::Cycle(self.message),
            FailureKind::Validation => Error::Validation(self.message),
        }
    }
}

/// Suspension of a step until `resume_at` or an external signal.
#[derive(Debug, Clone)]
pub struct Suspension {
    /// `delay:<node>` or `approval:<id>`
    pub waiting_for: String,
    pub resume_at: Option<DateTime<Utc>>,
    pub data: Value,
}

/// What an action did.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Completed(ActionResult),
    Failed(ActionFailure),
    Suspended(Suspension),
}

impl ActionOutcome {
    pub fn completed(data: Value) -> Self {
        ActionOutcome::Completed(ActionResult::new(data))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed(_))
    }
}

impl From<ActionResult> for ActionOutcome {
    fn from(result: ActionResult) -> Self {
        ActionOutcome::Completed(result)
    }
}

impl From<ActionFailure> for ActionOutcome {
    fn from(failure: ActionFailure) -> Self {
        ActionOutcome::Failed(failure)
    }
}

/// Starts child executions for sub-workflow steps.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    /// Start `workflow_id` with `context`. With `wait`, poll until the child
    /// is terminal and return it. A child still unfinished when the timeout
    /// passes is cancelled and reported as `Error::Timeout`.
    async fn launch_child(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
        wait: Option<Duration>,
    ) -> Result<WorkflowExecution>;
}

/// Collaborators shared by every action.
pub struct ActionServices {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub http: reqwest::Client,
    pub settings: ActionSettings,
    pub engine: EngineSettings,
}

impl ActionServices {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            http: reqwest::Client::new(),
            settings: ActionSettings::default(),
            engine: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ActionSettings, engine: EngineSettings) -> Self {
        self.settings = settings;
        self.engine = engine;
        self
    }
}

/// Context passed to an action during execution.
#[derive(Clone)]
pub struct ActionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub node_id: String,
    /// Execution variables as of this step
    pub variables: Value,
    pub context: ExecutionContext,
    /// 1-based attempt number
    pub attempt: u32,
    /// Time left for this attempt, for actions that bound their own waits
    pub time_limit: Option<Duration>,
    pub services: Arc<ActionServices>,
    pub launcher: Option<Arc<dyn WorkflowLauncher>>,
}

impl ActionContext {
    pub fn vars(&self) -> &Value {
        &self.variables
    }
}

/// Trait that all action executors implement.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key, e.g. "webhook" or the name of an extension.
    fn action_type(&self) -> &str;

    fn description(&self) -> &str {
        "A workflow action"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome;

    /// Continue a step that suspended with `waiting_for`.
    async fn resume(
        &self,
        _node: &WorkflowNode,
        _ctx: &ActionContext,
        waiting_for: &str,
    ) -> ActionOutcome {
        ActionOutcome::completed(json!({ "resumed": waiting_for }))
    }
}
