//! Workflow executor.
//!
//! Each execution runs in its own task. The task holds a concurrency permit
//! for one running segment: from `pending -> running` until the run
//! finishes or suspends. A suspended run is persisted as `waiting` with its
//! `waiting_for` key and `resume_at`, and frees its permit. Resumption claims
//! it back atomically (`waiting -> pending`) and starts a new segment.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use super::cancel::CancelRegistry;
use super::concurrency::{ConcurrencyLimiter, ExecutionPermit};
use crate::actions::approval::WAITING_PREFIX;
use crate::actions::notification::expand_recipients;
use crate::actions::{
    Action, ActionContext, ActionFailure, ActionOutcome, ActionRegistry, ActionResult,
    ActionServices, Notification, Suspension, WorkflowLauncher,
};
use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::expr::{evaluate, resolve_value};
use crate::metrics;
use crate::storage::{
    ApprovalDecision, ApprovalRequest, ApprovalResponse, ApprovalStatus, ExecutionContext,
    ExecutionLog, ExecutionStatus, ExecutionStep, LogLevel, StepStatus, Store, WorkflowExecution,
};
use crate::workflow::{
    BackoffType, EdgeKind, ErrorHandler, LoopConfig, NodeAction, ParallelConfig, TriggerType,
    Workflow, WorkflowNode,
};

/// How `trigger_workflow` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Return the `pending` execution immediately.
    Async,
    /// Wait until the run is terminal or `timeout` passes, then return the
    /// latest snapshot. The run itself is left alone on timeout.
    Sync { timeout: Duration },
}

/// The execution engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    registry: ActionRegistry,
    services: Arc<ActionServices>,
    limiter: ConcurrencyLimiter,
    cancels: CancelRegistry,
}

/// Limits shared by every walker of one running segment.
struct RunGuard {
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    /// Set by a failing fail-fast parallel branch to stop its siblings.
    halt: Arc<AtomicBool>,
    steps: Arc<AtomicUsize>,
    max_steps: usize,
}

impl RunGuard {
    fn branch(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            halt: Arc::new(AtomicBool::new(false)),
            steps: self.steps.clone(),
            max_steps: self.max_steps,
        }
    }
}

/// How a walk over part of the graph ended.
enum Walk {
    Done,
    Suspended {
        node_id: String,
        suspension: Suspension,
    },
    Failed {
        node_id: String,
        failure: ActionFailure,
    },
    Cancelled,
    Halted,
}

/// How a single node ended.
enum StepEnd {
    Next(Option<String>),
    Suspended(Suspension),
    Failed(ActionFailure),
}

struct Resume {
    node_id: String,
    waiting_for: String,
}

impl Engine {
    pub fn new(registry: ActionRegistry, services: Arc<ActionServices>) -> Self {
        let limiter = ConcurrencyLimiter::new(services.engine.max_concurrent_executions);
        Self {
            inner: Arc::new(Inner {
                store: services.store.clone(),
                registry,
                services,
                limiter,
                cancels: CancelRegistry::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    pub fn services(&self) -> &Arc<ActionServices> {
        &self.inner.services
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.services.engine
    }

    /// Permits not held by a running segment.
    pub fn available_permits(&self) -> usize {
        self.inner.limiter.available()
    }

    pub async fn get_execution(&self, id: &str) -> Result<WorkflowExecution> {
        self.inner
            .store
            .get_execution(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Execution {}", id)))
    }

    /// Load a workflow and check it may run for `context`.
    async fn admit(&self, workflow_id: &str, context: &ExecutionContext) -> Result<Workflow> {
        let workflow = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;

        if workflow.tenant_id != context.tenant_id {
            return Err(Error::Permission(format!(
                "Workflow {} does not belong to tenant {}",
                workflow_id, context.tenant_id
            )));
        }
        if !workflow.is_active() {
            return Err(Error::Validation(format!(
                "Workflow '{}' is {}, not active",
                workflow.name, workflow.status
            )));
        }
        Ok(workflow)
    }

    /// Copy of `workflow` stamped with its latest saved version number.
    async fn versioned_snapshot(&self, mut workflow: Workflow) -> Result<Workflow> {
        if let Some(latest) = self.inner.store.latest_version_number(&workflow.id).await? {
            workflow.version = latest.max(workflow.version);
        }
        Ok(workflow)
    }

    /// Start a run of an ACTIVE workflow.
    #[instrument(
        name = "execution.trigger",
        skip(self, context),
        fields(
            trigger_type = %context.trigger_type,
            tenant = %context.tenant_id,
        )
    )]
    pub async fn trigger_workflow(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
        mode: RunMode,
    ) -> Result<WorkflowExecution> {
        let workflow = self.admit(workflow_id, &context).await?;
        let snapshot = self.versioned_snapshot(workflow).await?;
        let execution = self.start(snapshot, context, None).await?;
        self.inner
            .store
            .touch_last_executed(workflow_id, execution.created_at)
            .await?;

        match mode {
            RunMode::Async => Ok(execution),
            RunMode::Sync { timeout } => self.wait_for(&execution.id, timeout).await,
        }
    }

    /// Persist a pending execution and spawn its task.
    async fn start(
        &self,
        snapshot: Workflow,
        context: ExecutionContext,
        permit: Option<ExecutionPermit>,
    ) -> Result<WorkflowExecution> {
        if snapshot.first_node().is_none() {
            return Err(Error::Validation(format!(
                "Workflow '{}' has no nodes",
                snapshot.name
            )));
        }

        let mut execution = WorkflowExecution::new(snapshot, context);
        execution.variables = initial_variables(&execution.context);
        self.inner.store.save_execution(&execution).await?;
        self.log(
            &execution.id,
            LogLevel::Info,
            format!("Execution queued ({} trigger)", execution.context.trigger_type),
            None,
        )
        .await;
        info!(
            execution_id = %execution.id,
            workflow = %execution.workflow_name,
            "Execution queued"
        );

        self.spawn_run(execution.clone(), permit, None);
        Ok(execution)
    }

    fn spawn_run(
        &self,
        execution: WorkflowExecution,
        permit: Option<ExecutionPermit>,
        resume: Option<Resume>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let id = execution.id.clone();
            let runner = engine.clone();
            let task = tokio::spawn(async move { runner.run(execution, permit, resume).await });
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(execution_id = %id, "Execution task failed: {}", e),
                Err(e) => engine.fail_crashed(&id, &e.to_string()).await,
            }
        });
    }

    /// Mark an execution whose task panicked as failed.
    async fn fail_crashed(&self, id: &str, reason: &str) {
        error!(execution_id = %id, "Execution task crashed: {}", reason);
        self.inner.cancels.unregister(id).await;

        let mut execution = match self.get_execution(id).await {
            Ok(execution) => execution,
            Err(e) => {
                error!(execution_id = %id, "Could not load crashed execution: {}", e);
                return;
            }
        };
        if execution.status.is_terminal() {
            return;
        }

        let message = format!("Execution task crashed: {}", reason);
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(message.clone());
        execution.error_node_id = execution
            .steps
            .last()
            .map(|step| step.node_id.clone())
            .or_else(|| execution.current_node_id.clone());
        execution.finished_at = Some(Utc::now());
        if let Err(e) = self.inner.store.save_execution(&execution).await {
            error!(execution_id = %id, "Could not record crash: {}", e);
            return;
        }
        metrics::record_execution("failed", &execution.context.trigger_type.to_string());
        self.log(id, LogLevel::Error, message, None).await;
    }

    /// Poll until the execution is terminal or `limit` passes.
    async fn wait_for(&self, id: &str, limit: Duration) -> Result<WorkflowExecution> {
        let deadline = Instant::now() + limit;
        let interval = self.settings().subworkflow_poll_interval();
        loop {
            let execution = self.get_execution(id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            let Some(remaining) = remaining_until(deadline) else {
                debug!(execution_id = %id, "Stopped waiting for execution");
                return Ok(execution);
            };
            sleep(interval.min(remaining)).await;
        }
    }

    /// Cancel a synchronous child the parent stopped waiting for. The child
    /// runs on the parent's slot, so the parent keeps waiting until it stops.
    async fn abandon_child(&self, child_id: &str) {
        warn!(child = %child_id, "Sub-workflow wait timed out, cancelling child");
        if let Err(e) = self.cancel_execution(child_id).await {
            debug!(child = %child_id, "Child not cancelled: {}", e);
        }
        match self.wait_for(child_id, self.settings().max_execution_time()).await {
            Ok(stopped) if stopped.status.is_terminal() => {
                debug!(child = %child_id, status = %stopped.status, "Abandoned child stopped");
            }
            Ok(stopped) => warn!(
                child = %child_id,
                status = %stopped.status,
                "Abandoned child did not stop in time"
            ),
            Err(e) => warn!(child = %child_id, "Failed to observe abandoned child: {}", e),
        }
    }

    #[instrument(
        name = "execution.run",
        skip_all,
        fields(execution_id = %execution.id, workflow = %execution.workflow_name)
    )]
    async fn run(
        &self,
        mut execution: WorkflowExecution,
        permit: Option<ExecutionPermit>,
        resume: Option<Resume>,
    ) -> Result<()> {
        let _permit = match permit {
            Some(permit) => permit,
            None => self.inner.limiter.acquire().await?,
        };

        // Registered before the claim so a cancel that sees `running` finds the flag.
        let cancel = self.inner.cancels.register(&execution.id).await;
        let result = self.run_segment(&mut execution, cancel.clone(), resume).await;
        self.inner.cancels.unregister(&execution.id).await;
        if result.is_ok() {
            self.settle_cancel(&execution, &cancel).await?;
        }
        result
    }

    /// Apply a cancel that arrived while a suspending segment was being saved.
    /// Once the flag is unregistered no new request can land on it, so a set
    /// flag here is the last word.
    async fn settle_cancel(&self, execution: &WorkflowExecution, cancel: &AtomicBool) -> Result<()> {
        if execution.status != ExecutionStatus::Waiting || !cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = self
            .inner
            .store
            .transition_status(&execution.id, &[ExecutionStatus::Waiting], ExecutionStatus::Cancelled)
            .await?;
        if !cancelled {
            return Ok(());
        }
        info!(execution_id = %execution.id, "Execution cancelled");
        self.log(&execution.id, LogLevel::Warn, "Execution cancelled", None)
            .await;
        metrics::record_execution("cancelled", &execution.context.trigger_type.to_string());
        Ok(())
    }

    async fn run_segment(
        &self,
        execution: &mut WorkflowExecution,
        cancel: Arc<AtomicBool>,
        resume: Option<Resume>,
    ) -> Result<()> {
        let claimed = self
            .inner
            .store
            .transition_status(&execution.id, &[ExecutionStatus::Pending], ExecutionStatus::Running)
            .await?;
        if !claimed {
            debug!(execution_id = %execution.id, "Execution no longer pending, skipping");
            return Ok(());
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at.get_or_insert_with(Utc::now);
        execution.waiting_for = None;
        execution.resume_at = None;
        self.inner.store.save_execution(execution).await?;
        self.log(&execution.id, LogLevel::Info, "Execution running", None)
            .await;

        let settings = self.settings();
        let guard = RunGuard {
            deadline: Instant::now() + settings.max_execution_time(),
            cancel,
            halt: Arc::new(AtomicBool::new(false)),
            steps: Arc::new(AtomicUsize::new(execution.steps.len())),
            max_steps: settings.max_steps_per_execution,
        };

        let workflow = execution.snapshot.clone();
        let segment_start = Instant::now();
        let walk = self.drive(&workflow, execution, resume, &guard).await;
        self.finish(&workflow, execution, walk, &guard, segment_start.elapsed())
            .await
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        resume: Option<Resume>,
        guard: &RunGuard,
    ) -> Walk {
        let start = match resume {
            None => workflow.first_node().map(|n| n.id.clone()),
            Some(resume) => {
                let Some(node) = workflow.get_node(&resume.node_id) else {
                    return Walk::Failed {
                        failure: ActionFailure::validation(format!(
                            "Node '{}' not found",
                            resume.node_id
                        )),
                        node_id: resume.node_id,
                    };
                };
                match self
                    .resume_node(workflow, execution, node, &resume.waiting_for)
                    .await
                {
                    StepEnd::Next(next) => next,
                    StepEnd::Suspended(suspension) => {
                        return Walk::Suspended {
                            node_id: node.id.clone(),
                            suspension,
                        }
                    }
                    StepEnd::Failed(failure) => {
                        match route_failure(workflow, execution, node, &failure) {
                            Some(target) => Some(target),
                            None => {
                                return Walk::Failed {
                                    node_id: node.id.clone(),
                                    failure,
                                }
                            }
                        }
                    }
                }
            }
        };
        self.walk(workflow, execution, start, None, guard).await
    }

    /// Follow the graph from `start` until it runs out of successors, reaches
    /// `stop_at`, suspends or fails.
    fn walk<'a>(
        &'a self,
        workflow: &'a Workflow,
        execution: &'a mut WorkflowExecution,
        start: Option<String>,
        stop_at: Option<&'a str>,
        guard: &'a RunGuard,
    ) -> BoxFuture<'a, Walk> {
        Box::pin(async move {
            let mut current = start;
            while let Some(node_id) = current.take() {
                if stop_at == Some(node_id.as_str()) {
                    return Walk::Done;
                }
                if guard.cancel.load(Ordering::SeqCst) {
                    return Walk::Cancelled;
                }
                if guard.halt.load(Ordering::SeqCst) {
                    return Walk::Halted;
                }
                if remaining_until(guard.deadline).is_none() {
                    return Walk::Failed {
                        node_id,
                        failure: run_timeout(self.settings()),
                    };
                }
                if guard.steps.fetch_add(1, Ordering::SeqCst) >= guard.max_steps {
                    return Walk::Failed {
                        node_id,
                        failure: ActionFailure::action(format!(
                            "Execution exceeded {} steps",
                            guard.max_steps
                        ))
                        .non_retryable(),
                    };
                }
                let Some(node) = workflow.get_node(&node_id) else {
                    return Walk::Failed {
                        failure: ActionFailure::validation(format!("Node '{}' not found", node_id)),
                        node_id,
                    };
                };

                execution.current_node_id = Some(node_id.clone());
                current = match self.execute_node(workflow, execution, node, guard).await {
                    StepEnd::Next(next) => next,
                    StepEnd::Suspended(suspension) => {
                        return Walk::Suspended {
                            node_id,
                            suspension,
                        }
                    }
                    StepEnd::Failed(failure) => {
                        match route_failure(workflow, execution, node, &failure) {
                            Some(target) => Some(target),
                            None => return Walk::Failed { node_id, failure },
                        }
                    }
                };
            }
            Walk::Done
        })
    }

    async fn execute_node(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        node: &WorkflowNode,
        guard: &RunGuard,
    ) -> StepEnd {
        match &node.action {
            NodeAction::Parallel(config) => {
                self.run_parallel(workflow, execution, node, config, guard)
                    .await
            }
            NodeAction::Loop(config) => self.run_loop(workflow, execution, node, config, guard).await,
            _ => self.run_action(workflow, execution, node, guard).await,
        }
    }

    #[instrument(
        name = "node.execute",
        skip_all,
        fields(
            node_id = %node.id,
            action = %node.action.type_key(),
            execution_id = %execution.id,
        )
    )]
    async fn run_action(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        node: &WorkflowNode,
        guard: &RunGuard,
    ) -> StepEnd {
        let action_type = node.action.type_key().to_string();
        let index = self.open_step(execution, node).await;

        let Some(action) = self.inner.registry.get(&action_type) else {
            let failure =
                ActionFailure::validation(format!("Unknown action type '{}'", action_type));
            return self
                .settle_step(workflow, execution, index, node, failure.into(), 0)
                .await;
        };

        let started = Instant::now();
        let (outcome, retries) = self
            .dispatch_with_retry(action, &workflow.error_handler, execution, node, guard)
            .await;
        metrics::record_node_dispatch(&action_type, outcome_label(&outcome));
        metrics::record_node_duration(started.elapsed(), &action_type);

        self.settle_step(workflow, execution, index, node, outcome, retries)
            .await
    }

    /// Run the action, retrying retryable failures per the error handler.
    /// Returns the final outcome and the number of retries performed.
    async fn dispatch_with_retry(
        &self,
        action: Arc<dyn Action>,
        handler: &ErrorHandler,
        execution: &WorkflowExecution,
        node: &WorkflowNode,
        guard: &RunGuard,
    ) -> (ActionOutcome, u32) {
        let max_attempts = 1 + node.retry_count.unwrap_or(handler.retry_count);
        let mut ctx = self.action_context(execution, node);
        let mut attempt = 1u32;

        loop {
            ctx.attempt = attempt;
            let Some(remaining) = remaining_until(guard.deadline) else {
                return (run_timeout(self.settings()).into(), attempt - 1);
            };
            let limit = node
                .timeout_seconds
                .map(|secs| Duration::from_secs(secs).min(remaining))
                .unwrap_or(remaining);

            ctx.time_limit = Some(limit);
            // A sub-workflow bounds its own wait so it can cancel the child.
            let outcome = if matches!(node.action, NodeAction::SubWorkflow(_)) {
                action.execute(node, &ctx).await
            } else {
                match timeout(limit, action.execute(node, &ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ActionFailure::timeout(format!(
                        "Node '{}' timed out after {}ms",
                        node.id,
                        limit.as_millis()
                    ))
                    .into(),
                }
            };

            match outcome {
                ActionOutcome::Failed(failure) if failure.retryable && attempt < max_attempts => {
                    let delay = retry_delay(handler, attempt);
                    let fits = remaining_until(guard.deadline).is_some_and(|r| delay < r);
                    if !fits {
                        return (ActionOutcome::Failed(failure), attempt - 1);
                    }

                    warn!(
                        "Node '{}' attempt {}/{} failed: {}. Retrying in {}ms",
                        node.id,
                        attempt,
                        max_attempts,
                        failure.message,
                        delay.as_millis()
                    );
                    self.log(
                        &execution.id,
                        LogLevel::Warn,
                        format!(
                            "Step '{}' attempt {} failed: {}",
                            node.id, attempt, failure.message
                        ),
                        None,
                    )
                    .await;

                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                other => return (other, attempt - 1),
            }
        }
    }

    async fn resume_node(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        node: &WorkflowNode,
        waiting_for: &str,
    ) -> StepEnd {
        let existing = execution
            .steps
            .iter()
            .rposition(|s| s.node_id == node.id && s.status == StepStatus::Running);
        let index = match existing {
            Some(index) => index,
            None => self.open_step(execution, node).await,
        };

        let action_type = node.action.type_key();
        let outcome = match self.inner.registry.get(action_type) {
            Some(action) => {
                let ctx = self.action_context(execution, node);
                action.resume(node, &ctx, waiting_for).await
            }
            None => ActionFailure::validation(format!("Unknown action type '{}'", action_type))
                .into(),
        };
        metrics::record_node_dispatch(action_type, outcome_label(&outcome));
        info!(node_id = %node.id, waiting_for, "Resumed step");

        self.settle_step(workflow, execution, index, node, outcome, 0)
            .await
    }

    /// Run every branch concurrently on its own copy of the variables, then
    /// merge steps and changed variables back in branch order.
    async fn run_parallel(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        node: &WorkflowNode,
        config: &ParallelConfig,
        guard: &RunGuard,
    ) -> StepEnd {
        let index = self.open_step(execution, node).await;
        let base = execution.variables.clone();
        let mut branches: Vec<WorkflowExecution> = config
            .branches
            .iter()
            .map(|_| {
                let mut branch = execution.clone();
                branch.steps.clear();
                branch.retry_count = 0;
                branch
            })
            .collect();

        let branch_guard = &guard.branch();
        let join = config.join.as_deref();
        let fail_fast = config.fail_fast;
        let results = join_all(branches.iter_mut().zip(&config.branches).map(
            |(branch, start)| async move {
                let walk = self
                    .walk(workflow, branch, Some(start.clone()), join, branch_guard)
                    .await;
                if fail_fast && matches!(walk, Walk::Failed { .. } | Walk::Suspended { .. }) {
                    branch_guard.halt.store(true, Ordering::SeqCst);
                }
                walk
            },
        ))
        .await;

        let mut failures = Vec::new();
        for ((branch, start), walk) in branches.into_iter().zip(&config.branches).zip(results) {
            execution.steps.extend(branch.steps);
            execution.retry_count += branch.retry_count;
            merge_variables(&mut execution.variables, &base, branch.variables);
            match walk {
                Walk::Failed { node_id, failure } => failures.push(format!(
                    "branch '{}' failed at '{}': {}",
                    start, node_id, failure.message
                )),
                Walk::Suspended { node_id, .. } => failures.push(format!(
                    "branch '{}' suspended at '{}', which parallel branches do not support",
                    start, node_id
                )),
                Walk::Done | Walk::Cancelled | Walk::Halted => {}
            }
        }

        let outcome = if failures.is_empty() {
            ActionResult::new(json!({
                "branches": config.branches,
                "join": config.join,
            }))
            .with_next(config.join.clone())
            .into()
        } else {
            ActionFailure::action(failures.join("; "))
                .non_retryable()
                .into()
        };
        self.settle_step(workflow, execution, index, node, outcome, 0)
            .await
    }

    /// Run the body once per item, sequentially, on the execution itself.
    async fn run_loop(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        node: &WorkflowNode,
        config: &LoopConfig,
        guard: &RunGuard,
    ) -> StepEnd {
        let index = self.open_step(execution, node).await;
        let items = match resolve_value(&config.items, &execution.variables) {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                let failure = ActionFailure::validation(format!(
                    "Loop items '{}' resolved to {}, expected a list",
                    config.items,
                    crate::workflow::json_type_name(&other)
                ));
                return self
                    .settle_step(workflow, execution, index, node, failure.into(), 0)
                    .await;
            }
        };
        if items.len() > config.max_iterations {
            let failure = ActionFailure::validation(format!(
                "Loop over {} items exceeds max_iterations {}",
                items.len(),
                config.max_iterations
            ));
            return self
                .settle_step(workflow, execution, index, node, failure.into(), 0)
                .await;
        }

        let count = items.len();
        let mut completed = 0usize;
        let mut failure = None;
        for (i, item) in items.into_iter().enumerate() {
            if let Some(vars) = execution.variables.as_object_mut() {
                vars.insert(config.item_variable.clone(), item);
                vars.insert("loop".to_string(), json!({ "index": i, "count": count }));
            }
            let walk = self
                .walk(
                    workflow,
                    execution,
                    Some(config.body.clone()),
                    Some(&node.id),
                    guard,
                )
                .await;
            match walk {
                Walk::Done => completed += 1,
                Walk::Failed {
                    node_id,
                    failure: cause,
                } => {
                    failure = Some(
                        ActionFailure::action(format!(
                            "iteration {} failed at '{}': {}",
                            i, node_id, cause.message
                        ))
                        .non_retryable(),
                    );
                    break;
                }
                Walk::Suspended { node_id, .. } => {
                    failure = Some(ActionFailure::validation(format!(
                        "iteration {} suspended at '{}', which loops do not support",
                        i, node_id
                    )));
                    break;
                }
                Walk::Cancelled | Walk::Halted => break,
            }
        }
        if let Some(vars) = execution.variables.as_object_mut() {
            vars.remove(&config.item_variable);
            vars.remove("loop");
        }

        let outcome = match failure {
            Some(failure) => failure.into(),
            None => ActionOutcome::completed(json!({ "iterations": completed, "count": count })),
        };
        self.settle_step(workflow, execution, index, node, outcome, 0)
            .await
    }

    /// Append a running step for `node` and return its index.
    async fn open_step(&self, execution: &mut WorkflowExecution, node: &WorkflowNode) -> usize {
        let step = ExecutionStep::start(
            &node.id,
            node.action.type_key(),
            node.display_name(),
            node_input(node),
        );
        self.persist_step(&execution.id, &step).await;
        execution.steps.push(step);
        execution.steps.len() - 1
    }

    /// Record an outcome on the step at `index`, apply its effects to the
    /// variables and work out where the walk goes next.
    async fn settle_step(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        index: usize,
        node: &WorkflowNode,
        outcome: ActionOutcome,
        retries: u32,
    ) -> StepEnd {
        execution.retry_count += retries;
        execution.steps[index].retry_count += retries;

        let (end, level, message) = match outcome {
            ActionOutcome::Completed(result) => {
                let step = &mut execution.steps[index];
                step.output = Some(result.data.clone());
                step.finish(StepStatus::Completed);

                let override_next = result.next.clone();
                apply_result(&mut execution.variables, &node.id, result);
                let next = next_node(workflow, node, override_next, &execution.variables);
                let message = format!("Step '{}' completed", node.id);
                (StepEnd::Next(next), LogLevel::Info, message)
            }
            ActionOutcome::Suspended(suspension) => {
                execution.steps[index].output = Some(json!({
                    "waiting_for": suspension.waiting_for,
                    "resume_at": suspension.resume_at,
                    "data": suspension.data,
                }));
                let message = format!("Step '{}' waiting for {}", node.id, suspension.waiting_for);
                (StepEnd::Suspended(suspension), LogLevel::Info, message)
            }
            ActionOutcome::Failed(failure) => {
                let step = &mut execution.steps[index];
                step.error = Some(failure.message.clone());
                step.output = Some(failure.to_output());
                step.finish(StepStatus::Failed);
                let message = format!("Step '{}' failed: {}", node.id, failure.message);
                (StepEnd::Failed(failure), LogLevel::Error, message)
            }
        };

        let step = &execution.steps[index];
        self.persist_step(&execution.id, step).await;
        self.log(&execution.id, level, message, Some(&step.id)).await;
        end
    }

    /// Persist the outcome of a segment.
    async fn finish(
        &self,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        walk: Walk,
        guard: &RunGuard,
        elapsed: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let walk = match walk {
            Walk::Suspended { .. } if guard.cancel.load(Ordering::SeqCst) => Walk::Cancelled,
            other => other,
        };

        match walk {
            Walk::Done | Walk::Halted => {
                execution.status = ExecutionStatus::Completed;
                execution.output = Some(execution_output(execution));
                execution.current_node_id = None;
                execution.finished_at = Some(now);
                self.log(&execution.id, LogLevel::Info, "Execution completed", None)
                    .await;
            }
            Walk::Suspended {
                node_id,
                suspension,
            } => {
                execution.status = ExecutionStatus::Waiting;
                execution.current_node_id = Some(node_id);
                execution.waiting_for = Some(suspension.waiting_for);
                execution.resume_at = suspension.resume_at;
                self.log(&execution.id, LogLevel::Info, "Execution waiting", None)
                    .await;
            }
            Walk::Failed { node_id, failure } => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(failure.message.clone());
                execution.error_node_id = Some(node_id.clone());
                execution.finished_at = Some(now);
                error!(
                    execution_id = %execution.id,
                    node_id = %node_id,
                    "Execution failed: {}",
                    failure.message
                );
                self.log(
                    &execution.id,
                    LogLevel::Error,
                    format!("Execution failed at '{}': {}", node_id, failure.message),
                    None,
                )
                .await;
                self.escalate(workflow, execution).await;
            }
            Walk::Cancelled => {
                execution.status = ExecutionStatus::Cancelled;
                execution.finished_at = Some(now);
                self.log(&execution.id, LogLevel::Warn, "Execution cancelled", None)
                    .await;
            }
        }

        self.inner.store.save_execution(execution).await?;
        let status = execution.status.to_string();
        metrics::record_execution(&status, &execution.context.trigger_type.to_string());
        metrics::record_execution_duration(elapsed, &execution.workflow_name);
        info!(
            execution_id = %execution.id,
            status = %status,
            duration_ms = elapsed.as_millis() as u64,
            "Execution segment finished"
        );
        Ok(())
    }

    /// Notify the workflow's escalation contacts about a failed run.
    async fn escalate(&self, workflow: &Workflow, execution: &WorkflowExecution) {
        let contacts = expand_recipients(
            &workflow.error_handler.escalation_contacts,
            &execution.variables,
        );
        for contact in contacts {
            let notification = Notification {
                tenant_id: execution.tenant_id.clone(),
                recipient: contact,
                channel: "in_app".to_string(),
                title: format!("Workflow '{}' failed", workflow.name),
                message: execution.error.clone().unwrap_or_default(),
                priority: Some("high".to_string()),
                data: json!({
                    "execution_id": execution.id,
                    "node_id": execution.error_node_id,
                }),
            };
            if let Err(e) = self.inner.services.notifier.send(&notification).await {
                warn!(
                    recipient = %notification.recipient,
                    "Failed to send escalation: {}",
                    e
                );
            }
        }
    }

    fn action_context(&self, execution: &WorkflowExecution, node: &WorkflowNode) -> ActionContext {
        ActionContext {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            tenant_id: execution.tenant_id.clone(),
            node_id: node.id.clone(),
            variables: execution.variables.clone(),
            context: execution.context.clone(),
            attempt: 1,
            time_limit: None,
            services: self.inner.services.clone(),
            launcher: Some(Arc::new(self.clone())),
        }
    }

    async fn persist_step(&self, execution_id: &str, step: &ExecutionStep) {
        if let Err(e) = self.inner.store.save_step(execution_id, step).await {
            warn!(execution_id, step = %step.node_id, "Failed to persist step: {}", e);
        }
    }

    async fn log(
        &self,
        execution_id: &str,
        level: LogLevel,
        message: impl Into<String>,
        step_id: Option<&str>,
    ) {
        let mut entry = ExecutionLog::new(execution_id, level, message);
        if let Some(step_id) = step_id {
            entry = entry.with_step(step_id);
        }
        if let Err(e) = self.inner.store.append_log(&entry).await {
            warn!(execution_id, "Failed to append execution log: {}", e);
        }
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Cancel a pending, running or waiting execution. Pending and waiting
    /// runs are cancelled at once; a running one stops before its next step.
    pub async fn cancel_execution(&self, id: &str) -> Result<WorkflowExecution> {
        for _ in 0..3 {
            let execution = self.get_execution(id).await?;
            match execution.status {
                ExecutionStatus::Pending | ExecutionStatus::Waiting => {
                    let cancelled = self
                        .inner
                        .store
                        .transition_status(
                            id,
                            &[ExecutionStatus::Pending, ExecutionStatus::Waiting],
                            ExecutionStatus::Cancelled,
                        )
                        .await?;
                    if cancelled {
                        info!(execution_id = %id, "Execution cancelled");
                        self.log(id, LogLevel::Warn, "Execution cancelled", None)
                            .await;
                        metrics::record_execution(
                            "cancelled",
                            &execution.context.trigger_type.to_string(),
                        );
                        return self.get_execution(id).await;
                    }
                }
                ExecutionStatus::Running => {
                    if self.inner.cancels.request_cancel(id).await {
                        info!(execution_id = %id, "Cancellation requested");
                        self.log(id, LogLevel::Warn, "Cancellation requested", None)
                            .await;
                        return Ok(execution);
                    }
                }
                status => {
                    return Err(Error::InvalidState(format!(
                        "Execution {} is {} and cannot be cancelled",
                        id, status
                    )))
                }
            }
            // The run changed state underneath us; look again.
            sleep(Duration::from_millis(5)).await;
        }
        Err(Error::InvalidState(format!(
            "Execution {} kept changing state while being cancelled",
            id
        )))
    }

    /// Resume a WAITING execution. Concurrent callers race on an atomic
    /// claim, so the execution resumes once.
    pub async fn resume_execution(&self, id: &str) -> Result<WorkflowExecution> {
        let mut execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::Waiting {
            return Err(Error::InvalidState(format!(
                "Execution {} is {}, not waiting",
                id, execution.status
            )));
        }
        let node_id = execution.current_node_id.clone().ok_or_else(|| {
            Error::Internal(format!("Waiting execution {} has no current node", id))
        })?;

        let claimed = self
            .inner
            .store
            .transition_status(id, &[ExecutionStatus::Waiting], ExecutionStatus::Pending)
            .await?;
        if !claimed {
            return Err(Error::InvalidState(format!(
                "Execution {} was already resumed or cancelled",
                id
            )));
        }

        let waiting_for = execution.waiting_for.clone().unwrap_or_default();
        execution.status = ExecutionStatus::Pending;
        self.log(
            id,
            LogLevel::Info,
            format!("Resuming after {}", waiting_for),
            None,
        )
        .await;
        self.spawn_run(
            execution.clone(),
            None,
            Some(Resume {
                node_id,
                waiting_for,
            }),
        );
        Ok(execution)
    }

    /// Start a new run from a failed run's snapshot and context.
    pub async fn retry_execution(&self, id: &str) -> Result<WorkflowExecution> {
        let failed = self.get_execution(id).await?;
        if failed.status != ExecutionStatus::Failed {
            return Err(Error::InvalidState(format!(
                "Execution {} is {}; only failed executions can be retried",
                id, failed.status
            )));
        }

        let mut context = failed.context.clone();
        context.trigger_type = TriggerType::Retry;
        let execution = self.start(failed.snapshot.clone(), context, None).await?;
        self.log(
            &execution.id,
            LogLevel::Info,
            format!("Retry of execution {}", id),
            None,
        )
        .await;
        Ok(execution)
    }

    /// Record an approver's decision and resume the execution once the
    /// request is resolved.
    pub async fn submit_approval(
        &self,
        approval_id: &str,
        tenant_id: &str,
        approver: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest> {
        let mut request = self
            .inner
            .store
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Approval {}", approval_id)))?;

        if request.tenant_id != tenant_id {
            return Err(Error::Permission(format!
                ("Approval {} does not belong to tenant {}", approval_id, tenant_id)));
        }
        if request.status != ApprovalStatus::Pending {
            return Err(Error::InvalidState(format!(
                "Approval {} is already {}",
                approval_id, request.status
            )));
        }
        if request.expires_at <= Utc::now() {
            return Err(Error::InvalidState(format!(
                "Approval {} has expired",
                approval_id
            )));
        }
        if !request.approvers.iter().any(|a| a == approver) {
            return Err(Error::Permission(format!(
                "{} is not an approver of {}",
                approver, approval_id
            )));
        }

        request.record(ApprovalResponse {
            approver: approver.to_string(),
            decision,
            comment,
            responded_at: Utc::now(),
        });
        self.inner.store.save_approval(&request).await?;
        info!(approval = %request.id, approver, status = %request.status, "Approval response recorded");

        if request.status != ApprovalStatus::Pending {
            let waiting_for = format!("{}{}", WAITING_PREFIX, request.id);
            let execution = self.get_execution(&request.execution_id).await?;
            if execution.status == ExecutionStatus::Waiting
                && execution.waiting_for.as_deref() == Some(waiting_for.as_str())
            {
                if let Err(e) = self.resume_execution(&execution.id).await {
                    warn!(execution_id = %execution.id, "Could not resume after approval: {}", e);
                }
            }
        }
        Ok(request)
    }
}

#[async_trait]
impl WorkflowLauncher for Engine {
    async fn launch_child(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
        wait: Option<Duration>,
    ) -> Result<WorkflowExecution> {
        let workflow = self.admit(workflow_id, &context).await?;
        let snapshot = self.versioned_snapshot(workflow).await?;
        match wait {
            None => self.start(snapshot, context, None).await,
            Some(limit) => {
                let child = self
                    .start(snapshot, context, Some(ExecutionPermit::inherited()))
                    .await?;
                let child = self.wait_for(&child.id, limit).await?;
                if child.status.is_terminal() {
                    return Ok(child);
                }
                self.abandon_child(&child.id).await;
                Err(Error::Timeout(format!(
                    "Sub-workflow {} still {} after {}s",
                    child.id,
                    child.status,
                    limit.as_secs()
                )))
            }
        }
    }
}

/// Trigger data keys at the top level, plus `trigger` describing the source.
fn initial_variables(context: &ExecutionContext) -> Value {
    let mut vars = match &context.trigger_data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    vars.insert(
        "trigger".to_string(),
        json!({
            "type": context.trigger_type,
            "source": context.source,
            "user_id": context.user_id,
            "tenant_id": context.tenant_id,
            "data": context.trigger_data,
        }),
    );
    Value::Object(vars)
}

/// The node's configuration as recorded on its step.
fn node_input(node: &WorkflowNode) -> Value {
    serde_json::to_value(&node.action)
        .ok()
        .and_then(|v| v.get("config").cloned())
        .unwrap_or(Value::Null)
}

fn apply_result(variables: &mut Value, node_id: &str, result: ActionResult) {
    if !variables.is_object() {
        *variables = Value::Object(Map::new());
    }
    let Some(vars) = variables.as_object_mut() else {
        return;
    };
    for key in &result.remove {
        vars.remove(key);
    }
    vars.extend(result.variables);

    let steps = vars
        .entry("steps")
        .or_insert_with(|| Value::Object(Map::new()));
    if !steps.is_object() {
        *steps = Value::Object(Map::new());
    }
    if let Some(steps) = steps.as_object_mut() {
        steps.insert(node_id.to_string(), result.data);
    }
}

/// Copy what a parallel branch changed relative to `base` into `target`.
fn merge_variables(target: &mut Value, base: &Value, branch: Value) {
    let Value::Object(branch) = branch else {
        return;
    };
    let Some(target) = target.as_object_mut() else {
        return;
    };
    for (key, value) in branch {
        if key == "steps" {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (target.get_mut("steps"), &value)
            {
                for (node_id, output) in incoming {
                    existing.insert(node_id.clone(), output.clone());
                }
                continue;
            }
        }
        if base.get(&key) != Some(&value) {
            target.insert(key, value);
        }
    }
}

/// Output override first, then the `next` pointer, then the first default
/// edge whose condition holds.
fn next_node(
    workflow: &Workflow,
    node: &WorkflowNode,
    override_next: Option<String>,
    variables: &Value,
) -> Option<String> {
    override_next.or_else(|| node.next.clone()).or_else(|| {
        workflow
            .outgoing(&node.id, EdgeKind::Default)
            .find(|edge| {
                edge.condition
                    .as_ref()
                    .map_or(true, |c| evaluate(c, variables))
            })
            .map(|edge| edge.to.clone())
    })
}

/// Target of an `on_failure` edge or the handler node. Exposes the failure
/// as the `error` variable when routing.
fn route_failure(
    workflow: &Workflow,
    execution: &mut WorkflowExecution,
    node: &WorkflowNode,
    failure: &ActionFailure,
) -> Option<String> {
    let target = workflow
        .outgoing(&node.id, EdgeKind::OnFailure)
        .next()
        .map(|edge| edge.to.clone())
        .or_else(|| {
            workflow
                .error_handler
                .on_failure
                .clone()
                .filter(|handler| handler != &node.id)
        })?;

    if let Some(vars) = execution.variables.as_object_mut() {
        vars.insert(
            "error".to_string(),
            json!({
                "node_id": node.id,
                "kind": failure.kind,
                "message": failure.message,
            }),
        );
    }
    info!(node_id = %node.id, target = %target, "Routing step failure");
    Some(target)
}

/// `variables.output` when set, else the last completed step's output.
fn execution_output(execution: &WorkflowExecution) -> Value {
    execution
        .variables
        .get("output")
        .cloned()
        .or_else(|| {
            execution
                .steps
                .iter()
                .rev()
                .find(|s| s.status == StepStatus::Completed)
                .and_then(|s| s.output.clone())
        })
        .unwrap_or(Value::Null)
}

fn outcome_label(outcome: &ActionOutcome) -> &'static str {
    match outcome {
        ActionOutcome::Completed(_) => "completed",
        ActionOutcome::Failed(_) => "failed",
        ActionOutcome::Suspended(_) => "suspended",
    }
}

fn run_timeout(settings: &EngineSettings) -> ActionFailure {
    ActionFailure::timeout(format!(
        "Execution exceeded {} seconds",
        settings.max_execution_time_seconds
    ))
    .non_retryable()
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}

/// Delay before retry number `attempt` (1-based).
fn retry_delay(handler: &ErrorHandler, attempt: u32) -> Duration {
    let base = handler.retry_delay_ms;
    let ms = match handler.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RecordingNotifier;
    use crate::config::ActionSettings;
    use crate::expr::{ConditionGroup, ConditionRule};
    use crate::storage::{ExecutionFilter, SqliteStorage};
    use crate::workflow::{
        ApprovalConfig, ApprovalMode, DataMutationConfig, DelayConfig, DelayUnit, ExpiryPolicy,
        ExtensionConfig, NodeConnection, SubWorkflowConfig, WebhookConfig,
    };
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    struct Harness {
        engine: Engine,
        store: Arc<SqliteStorage>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(settings: EngineSettings, extra: Vec<Arc<dyn Action>>) -> Harness {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = Arc::new(
            ActionServices::new(store.clone(), notifier.clone())
                .with_settings(ActionSettings::default(), settings),
        );
        let mut registry = ActionRegistry::new();
        for action in extra {
            registry.register(action);
        }
        Harness {
            engine: Engine::new(registry, services),
            store,
            notifier,
        }
    }

    fn harness(extra: Vec<Arc<dyn Action>>) -> Harness {
        let settings = EngineSettings {
            subworkflow_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        harness_with(settings, extra)
    }

    fn workflow(id: &str, nodes: Vec<WorkflowNode>) -> Workflow {
        let mut wf: Workflow = serde_json::from_value(json!({
            "id": id,
            "name": id,
            "status": "active",
            "tenant_id": "acme",
            "trigger": {"type": "manual"},
            "nodes": []
        }))
        .unwrap();
        wf.nodes = nodes;
        wf
    }

    fn set(id: &str, values: Value) -> WorkflowNode {
        WorkflowNode::new(
            id,
            NodeAction::DataMutation(DataMutationConfig {
                set: values.as_object().cloned().unwrap(),
                remove: vec![],
            }),
        )
    }

    fn extension(id: &str, action: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            NodeAction::Extension(ExtensionConfig {
                action: action.into(),
                params: json!({}),
            }),
        )
    }

    fn manual(data: Value) -> ExecutionContext {
        ExecutionContext::new(TriggerType::Manual, "acme", data).with_user(Some("ana"))
    }

    fn sync() -> RunMode {
        RunMode::Sync {
            timeout: Duration::from_secs(5),
        }
    }

    async fn wait_status(engine: &Engine, id: &str, status: ExecutionStatus) -> WorkflowExecution {
        for _ in 0..500 {
            let execution = engine.get_execution(id).await.unwrap();
            if execution.status == status {
                return execution;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never reached {}", id, status);
    }

    /// Fails with a retryable error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Action for Flaky {
        fn action_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ActionFailure::action(format!("attempt {} refused", ctx.attempt)).into()
            } else {
                ActionOutcome::completed(json!({ "attempt": ctx.attempt }))
            }
        }
    }

    /// Blocks until the gate gets permits.
    struct Blocking {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Action for Blocking {
        fn action_type(&self) -> &str {
            "blocking"
        }

        async fn execute(&self, _node: &WorkflowNode, _ctx: &ActionContext) -> ActionOutcome {
            match self.gate.acquire().await {
                Ok(_permit) => ActionOutcome::completed(json!({ "released": true })),
                Err(_) => ActionFailure::action("gate closed").into(),
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Action for Panicking {
        fn action_type(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _node: &WorkflowNode, _ctx: &ActionContext) -> ActionOutcome {
            panic!("action blew up");
        }
    }

    #[tokio::test]
    async fn test_linear_run_records_steps_and_output() {
        let h = harness(vec![]);
        let wf = workflow(
            "wf-linear",
            vec![
                set("total", json!({ "total": "{{invoice.total}}" })).with_next("label"),
                set("label", json!({ "output": "Invoice {{invoice.number}}" })),
            ],
        );
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow(
                "wf-linear",
                manual(json!({"invoice": {"total": 1200, "number": "INV-7"}})),
                sync(),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps.len(), 2);
        assert_eq!(execution.variables["total"], 1200);
        assert_eq!(execution.variables["trigger"]["user_id"], "ana");
        assert_eq!(execution.output, Some(json!("Invoice INV-7")));
        assert!(execution.finished_at.is_some());

        let logs = h.store.list_logs(&execution.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "Execution completed"));
        let stored = h.store.get_workflow("wf-linear").await.unwrap().unwrap();
        assert!(stored.last_executed_at.is_some());
    }

    #[tokio::test]
    async fn test_conditional_edges_pick_first_match() {
        let h = harness(vec![]);
        let mut wf = workflow(
            "wf-edges",
            vec![
                set("start", json!({})),
                set("big", json!({ "route": "big" })),
                set("small", json!({ "route": "small" })),
            ],
        );
        let mut big = NodeConnection::new("start", "big");
        big.condition = Some(ConditionGroup::all(vec![ConditionRule::leaf(
            "amount",
            "greater_than",
            json!(100),
        )]));
        wf.connections = vec![big, NodeConnection::new("start", "small")];
        h.store.save_workflow(&wf).await.unwrap();

        let run = |amount: i64| h.engine.trigger_workflow("wf-edges", manual(json!({"amount": amount})), sync());
        assert_eq!(run(500).await.unwrap().variables["route"], "big");
        assert_eq!(run(5).await.unwrap().variables["route"], "small");
    }

    #[tokio::test]
    async fn test_retry_until_success_records_one_step() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let h = harness(vec![flaky.clone()]);
        let mut wf = workflow("wf-retry", vec![extension("call", "flaky")]);
        wf.error_handler.retry_count = 3;
        wf.error_handler.retry_delay_ms = 1;
        wf.error_handler.backoff = BackoffType::Exponential;
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-retry", manual(json!({})), sync())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps.len(), 1);
        let step = &execution.steps[0];
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.retry_count, 2);
        assert_eq!(step.output, Some(json!({ "attempt": 3 })));
        assert_eq!(execution.retry_count, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_webhook_fails_twice_then_succeeds_within_budget() {
        use axum::{extract::State, http::StatusCode, routing::post, Router};
        use std::collections::HashMap;

        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/flaky",
                post(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let actions = ActionSettings {
            allow_internal_urls: true,
            ..ActionSettings::default()
        };
        let services = Arc::new(
            ActionServices::new(store.clone(), Arc::new(RecordingNotifier::default()))
                .with_settings(actions, EngineSettings::default()),
        );
        let engine = Engine::new(ActionRegistry::new(), services);

        let mut call = WorkflowNode::new(
            "notify-erp",
            NodeAction::Webhook(WebhookConfig {
                url: format!("http://{}/flaky", addr),
                method: "POST".into(),
                headers: HashMap::new(),
                query: HashMap::new(),
                body: Some(json!({"invoice": "{{invoice.id}}"})),
                timeout_seconds: Some(5),
                expected_status: vec![],
            }),
        );
        call.retry_count = Some(2);
        let mut wf = workflow("wf-erp", vec![call]);
        wf.error_handler.retry_delay_ms = 1;
        store.save_workflow(&wf).await.unwrap();

        let execution = engine
            .trigger_workflow("wf-erp", manual(json!({"invoice": {"id": "inv-3"}})), sync())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps.len(), 1);
        assert_eq!(execution.steps[0].status, StepStatus::Completed);
        assert_eq!(execution.steps[0].retry_count, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_run_and_escalate() {
        let flaky = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let h = harness(vec![flaky.clone()]);
        let mut wf = workflow("wf-fail", vec![extension("call", "flaky")]);
        wf.error_handler.retry_count = 1;
        wf.error_handler.retry_delay_ms = 1;
        wf.error_handler.escalation_contacts = vec!["ops-lead".into()];
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-fail", manual(json!({})), sync())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_node_id.as_deref(), Some("call"));
        assert!(execution.error.as_deref().unwrap().contains("refused"));
        assert_eq!(execution.steps[0].retry_count, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ops-lead");
    }

    #[tokio::test]
    async fn test_failure_routes_to_on_failure_edge() {
        let flaky = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let h = harness(vec![flaky]);
        let mut wf = workflow(
            "wf-route",
            vec![
                extension("call", "flaky"),
                set("recover", json!({ "recovered": "{{error.node_id}}" })),
            ],
        );
        wf.connections = vec![NodeConnection::on_failure("call", "recover")];
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-route", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.variables["recovered"], "call");
        assert_eq!(execution.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_queues_without_dropping() {
        let gate = Arc::new(Semaphore::new(0));
        let settings = EngineSettings {
            max_concurrent_executions: 2,
            subworkflow_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let h = harness_with(settings, vec![Arc::new(Blocking { gate: gate.clone() })]);
        h.store
            .save_workflow(&workflow("wf-block", vec![extension("hold", "blocking")]))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let execution = h
                .engine
                .trigger_workflow("wf-block", manual(json!({})), RunMode::Async)
                .await
                .unwrap();
            assert_eq!(execution.status, ExecutionStatus::Pending);
            ids.push(execution.id);
        }

        let count = |status: ExecutionStatus| {
            let store = h.store.clone();
            async move {
                store
                    .list_executions(&ExecutionFilter {
                        status: Some(status),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
                    .len()
            }
        };
        for _ in 0..500 {
            if count(ExecutionStatus::Running).await == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count(ExecutionStatus::Running).await, 2);
        assert_eq!(count(ExecutionStatus::Pending).await, 1);
        assert_eq!(h.engine.available_permits(), 0);

        gate.add_permits(3);
        for id in &ids {
            wait_status(&h.engine, id, ExecutionStatus::Completed).await;
        }
    }

    #[tokio::test]
    async fn test_self_recursive_subworkflow_is_a_cycle() {
        let h = harness(vec![]);
        let wf = workflow(
            "wf-self",
            vec![WorkflowNode::new(
                "again",
                NodeAction::SubWorkflow(SubWorkflowConfig {
                    workflow_id: "wf-self".into(),
                    parameters: Map::new(),
                    wait: true,
                    timeout_seconds: Some(2),
                    output_variable: None,
                }),
            )],
        );
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-self", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("cycle"));
        assert_eq!(execution.steps[0].output.as_ref().unwrap()["kind"], "cycle");

        let all = h
            .store
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_subworkflow_returns_child_output() {
        let h = harness(vec![]);
        h.store
            .save_workflow(&workflow(
                "wf-child",
                vec![set("double", json!({ "output": "{{amount}}-checked" }))],
            ))
            .await
            .unwrap();
        let mut parameters = Map::new();
        parameters.insert("amount".into(), json!("{{invoice.total}}"));
        h.store
            .save_workflow(&workflow(
                "wf-parent",
                vec![WorkflowNode::new(
                    "child",
                    NodeAction::SubWorkflow(SubWorkflowConfig {
                        workflow_id: "wf-child".into(),
                        parameters,
                        wait: true,
                        timeout_seconds: Some(5),
                        output_variable: Some("checked".into()),
                    }),
                )],
            ))
            .await
            .unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-parent", manual(json!({"invoice": {"total": 40}})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.variables["checked"], "40-checked");
    }

    #[tokio::test]
    async fn test_timed_out_sync_child_is_cancelled_not_retried() {
        let gate = Arc::new(Semaphore::new(0));
        let settings = EngineSettings {
            max_concurrent_executions: 1,
            max_execution_time_seconds: 2,
            subworkflow_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let h = harness_with(settings, vec![Arc::new(Blocking { gate })]);
        h.store
            .save_workflow(&workflow("wf-slow-child", vec![extension("hold", "blocking")]))
            .await
            .unwrap();
        let mut parent = workflow(
            "wf-impatient",
            vec![WorkflowNode::new(
                "call",
                NodeAction::SubWorkflow(SubWorkflowConfig {
                    workflow_id: "wf-slow-child".into(),
                    parameters: Map::new(),
                    wait: true,
                    timeout_seconds: Some(1),
                    output_variable: None,
                }),
            )],
        );
        parent.error_handler.retry_count = 2;
        parent.error_handler.retry_delay_ms = 1;
        h.store.save_workflow(&parent).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-impatient", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.steps[0].retry_count, 0);
        assert_eq!(execution.steps[0].output.as_ref().unwrap()["kind"], "timeout");

        let children = h
            .store
            .list_executions(&ExecutionFilter {
                workflow_id: Some("wf-slow-child".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].status.is_terminal());

        for _ in 0..100 {
            if h.engine.available_permits() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.engine.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_panicking_action_fails_the_run() {
        let h = harness(vec![Arc::new(Panicking)]);
        h.store
            .save_workflow(&workflow(
                "wf-crash",
                vec![set("before", json!({ "x": 1 })).with_next("boom"), extension("boom", "panicking")],
            ))
            .await
            .unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-crash", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("crashed"));
        assert!(execution.finished_at.is_some());

        for _ in 0..100 {
            if h.engine.available_permits() == h.engine.settings().max_concurrent_executions {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.engine.available_permits(),
            h.engine.settings().max_concurrent_executions
        );
    }

    fn long_delay(id: &str) -> WorkflowNode {
        WorkflowNode::new(
            id,
            NodeAction::Delay(DelayConfig {
                duration: 1,
                unit: DelayUnit::Hours,
            }),
        )
    }

    #[tokio::test]
    async fn test_long_delay_suspends_and_resumes_once() {
        let h = harness(vec![]);
        h.store
            .save_workflow(&workflow(
                "wf-wait",
                vec![long_delay("wait").with_next("after"), set("after", json!({ "done": true }))],
            ))
            .await
            .unwrap();

        let queued = h
            .engine
            .trigger_workflow("wf-wait", manual(json!({})), RunMode::Async)
            .await
            .unwrap();
        let waiting = wait_status(&h.engine, &queued.id, ExecutionStatus::Waiting).await;
        assert_eq!(waiting.waiting_for.as_deref(), Some("delay:wait"));
        assert!(waiting.resume_at.is_some());
        assert_eq!(waiting.current_node_id.as_deref(), Some("wait"));
        assert_eq!(h.engine.available_permits(), 10);

        h.engine.resume_execution(&queued.id).await.unwrap();
        assert!(matches!(
            h.engine.resume_execution(&queued.id).await,
            Err(Error::InvalidState(_))
        ));

        let done = wait_status(&h.engine, &queued.id, ExecutionStatus::Completed).await;
        assert_eq!(done.steps.len(), 2);
        assert_eq!(done.steps[0].status, StepStatus::Completed);
        assert_eq!(done.variables["done"], true);
    }

    #[tokio::test]
    async fn test_cancel_waiting_and_terminal() {
        let h = harness(vec![]);
        h.store
            .save_workflow(&workflow("wf-cancel", vec![long_delay("wait")]))
            .await
            .unwrap();

        let queued = h
            .engine
            .trigger_workflow("wf-cancel", manual(json!({})), RunMode::Async)
            .await
            .unwrap();
        wait_status(&h.engine, &queued.id, ExecutionStatus::Waiting).await;

        let cancelled = h.engine.cancel_execution(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
        assert!(matches!(
            h.engine.cancel_execution(&queued.id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(h.engine.resume_execution(&queued.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_landing_during_suspend_is_applied() {
        let h = harness(vec![]);
        let wf = workflow("wf-late-cancel", vec![long_delay("wait")]);
        h.store.save_workflow(&wf).await.unwrap();
        let mut execution = WorkflowExecution::new(wf, manual(json!({})));
        execution.status = ExecutionStatus::Waiting;
        execution.waiting_for = Some("delay:wait".into());
        execution.resume_at = Some(Utc::now() + chrono::Duration::hours(1));
        h.store.save_execution(&execution).await.unwrap();

        let untouched = AtomicBool::new(false);
        h.engine.settle_cancel(&execution, &untouched).await.unwrap();
        assert_eq!(
            h.engine.get_execution(&execution.id).await.unwrap().status,
            ExecutionStatus::Waiting
        );

        let requested = AtomicBool::new(true);
        h.engine.settle_cancel(&execution, &requested).await.unwrap();
        let stored = h.engine.get_execution(&execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(stored.finished_at.is_some());
        assert!(h.store.due_waiting(Utc::now() + chrono::Duration::hours(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_stops_before_next_step() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(vec![Arc::new(Blocking { gate: gate.clone() })]);
        h.store
            .save_workflow(&workflow(
                "wf-stop",
                vec![extension("hold", "blocking").with_next("after"), set("after", json!({ "x": 1 }))],
            ))
            .await
            .unwrap();

        let queued = h
            .engine
            .trigger_workflow("wf-stop", manual(json!({})), RunMode::Async)
            .await
            .unwrap();
        wait_status(&h.engine, &queued.id, ExecutionStatus::Running).await;

        let requested = h.engine.cancel_execution(&queued.id).await.unwrap();
        assert_eq!(requested.status, ExecutionStatus::Running);
        gate.add_permits(1);

        let done = wait_status(&h.engine, &queued.id, ExecutionStatus::Cancelled).await;
        assert_eq!(done.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_execution_reuses_snapshot() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let h = harness(vec![flaky]);
        h.store
            .save_workflow(&workflow("wf-again", vec![extension("call", "flaky")]))
            .await
            .unwrap();

        let failed = h
            .engine
            .trigger_workflow("wf-again", manual(json!({"order": 9})), sync())
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(h.engine.retry_execution("missing").await.is_err());

        let retried = h.engine.retry_execution(&failed.id).await.unwrap();
        assert_ne!(retried.id, failed.id);
        assert_eq!(retried.context.trigger_type, TriggerType::Retry);
        let done = wait_status(&h.engine, &retried.id, ExecutionStatus::Completed).await;
        assert_eq!(done.variables["order"], 9);

        assert!(matches!(
            h.engine.retry_execution(&done.id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_approval_decision_resumes_execution() {
        let h = harness(vec![]);
        h.store
            .save_workflow(&workflow(
                "wf-approve",
                vec![
                    WorkflowNode::new(
                        "approve",
                        NodeAction::Approval(ApprovalConfig {
                            title: "Pay {{invoice.number}}".into(),
                            description: String::new(),
                            approvers: vec!["finance-lead".into()],
                            mode: ApprovalMode::Any,
                            timeout_hours: 24.0,
                            on_timeout: ExpiryPolicy::AutoReject,
                            escalate_to: vec![],
                            on_approved: Some("pay".into()),
                            on_rejected: Some("deny".into()),
                        }),
                    ),
                    set("pay", json!({ "paid": true })),
                    set("deny", json!({ "paid": false })),
                ],
            ))
            .await
            .unwrap();

        let queued = h
            .engine
            .trigger_workflow(
                "wf-approve",
                manual(json!({"invoice": {"number": "INV-1"}})),
                RunMode::Async,
            )
            .await
            .unwrap();
        wait_status(&h.engine, &queued.id, ExecutionStatus::Waiting).await;

        let pending = h
            .store
            .list_approvals("acme", Some(ApprovalStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "Pay INV-1");

        let outsider = h
            .engine
            .submit_approval(&pending[0].id, "acme", "mallory", ApprovalDecision::Approve, None)
            .await;
        assert!(matches!(outsider, Err(Error::Permission(_))));

        let decided = h
            .engine
            .submit_approval(
                &pending[0].id,
                "acme",
                "finance-lead",
                ApprovalDecision::Approve,
                Some("ok".into()),
            )
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);

        let done = wait_status(&h.engine, &queued.id, ExecutionStatus::Completed).await;
        assert_eq!(done.variables["paid"], true);
        assert_eq!(done.variables["steps"]["approve"]["decision"], "approved");
        assert!(done.variables.get("deny").is_none());
    }

    #[tokio::test]
    async fn test_parallel_branches_merge_and_join() {
        let h = harness(vec![]);
        let wf = workflow(
            "wf-fan",
            vec![
                WorkflowNode::new(
                    "fan",
                    NodeAction::Parallel(ParallelConfig {
                        branches: vec!["left".into(), "right".into()],
                        join: Some("join".into()),
                        fail_fast: true,
                    }),
                ),
                set("left", json!({ "left": 1 })).with_next("join"),
                set("right", json!({ "right": 2 })).with_next("join"),
                set("join", json!({ "sum": "{{left}}+{{right}}" })),
            ],
        );
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-fan", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.variables["sum"], "1+2");
        assert!(execution.variables["steps"]["left"].is_object());
        assert!(execution.variables["steps"]["right"].is_object());
        let join_steps = execution.steps.iter().filter(|s| s.node_id == "join").count();
        assert_eq!(join_steps, 1);
    }

    #[tokio::test]
    async fn test_loop_runs_body_per_item() {
        let h = harness(vec![]);
        let wf = workflow(
            "wf-loop",
            vec![
                WorkflowNode::new(
                    "each",
                    NodeAction::Loop(LoopConfig {
                        items: "{{lines}}".into(),
                        body: "touch".into(),
                        item_variable: "line".into(),
                        max_iterations: 10,
                    }),
                )
                .with_next("after"),
                set("touch", json!({ "last": "{{line.sku}}" })),
                set("after", json!({ "finished": true })),
            ],
        );
        h.store.save_workflow(&wf).await.unwrap();

        let execution = h
            .engine
            .trigger_workflow(
                "wf-loop",
                manual(json!({"lines": [{"sku": "A"}, {"sku": "B"}, {"sku": "C"}]})),
                sync(),
            )
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.variables["last"], "C");
        assert_eq!(execution.variables["steps"]["each"]["iterations"], 3);
        assert!(execution.variables.get("line").is_none());
        assert_eq!(execution.steps.iter().filter(|s| s.node_id == "touch").count(), 3);
    }

    #[tokio::test]
    async fn test_trigger_rejects_inactive_and_foreign_workflows() {
        let h = harness(vec![]);
        let mut draft = workflow("wf-draft", vec![set("a", json!({}))]);
        draft.status = crate::workflow::WorkflowStatus::Draft;
        h.store.save_workflow(&draft).await.unwrap();

        let inactive = h
            .engine
            .trigger_workflow("wf-draft", manual(json!({})), RunMode::Async)
            .await;
        assert!(matches!(inactive, Err(Error::Validation(_))));

        let foreign = h
            .engine
            .trigger_workflow(
                "wf-draft",
                ExecutionContext::new(TriggerType::Manual, "globex", json!({})),
                RunMode::Async,
            )
            .await;
        assert!(matches!(foreign, Err(Error::Permission(_))));

        let missing = h
            .engine
            .trigger_workflow("nope", manual(json!({})), RunMode::Async)
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let all = h
            .store
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_max_steps_stops_graph_loops() {
        let settings = EngineSettings {
            max_steps_per_execution: 5,
            subworkflow_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let h = harness_with(settings, vec![]);
        h.store
            .save_workflow(&workflow(
                "wf-spin",
                vec![set("a", json!({})).with_next("b"), set("b", json!({})).with_next("a")],
            ))
            .await
            .unwrap();

        let execution = h
            .engine
            .trigger_workflow("wf-spin", manual(json!({})), sync())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("5 steps"));
        assert_eq!(execution.steps.len(), 5);
    }

    #[test]
    fn test_retry_delay_backoff() {
        let mut handler = ErrorHandler {
            retry_delay_ms: 100,
            ..ErrorHandler::default()
        };
        assert_eq!(retry_delay(&handler, 3), Duration::from_millis(100));
        handler.backoff = BackoffType::Linear;
        assert_eq!(retry_delay(&handler, 3), Duration::from_millis(300));
        handler.backoff = BackoffType::Exponential;
        assert_eq!(retry_delay(&handler, 3), Duration::from_millis(400));
        assert!(retry_delay(&handler, u32::MAX) > Duration::ZERO);
    }
}
