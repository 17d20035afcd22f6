//! Sub-workflow action - run another workflow as a step.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::expr::interpolate_value;
use crate::storage::{ExecutionContext, ExecutionStatus};
use crate::workflow::{NodeAction, SubWorkflowConfig, TriggerType, WorkflowNode};

pub struct SubWorkflowAction;

impl SubWorkflowAction {
    /// Reject calls that would exceed the depth limit or re-enter a workflow
    /// already on the call stack.
    fn check_cycle(config: &SubWorkflowConfig, ctx: &ActionContext) -> Option<ActionFailure> {
        let max_depth = ctx.services.engine.max_subworkflow_depth;
        let depth = ctx.context.depth + 1;
        if depth > max_depth {
            return Some(ActionFailure::cycle(format!(
                "Sub-workflow depth {} exceeds maximum of {}",
                depth, max_depth
            )));
        }
        if config.workflow_id == ctx.workflow_id
            || ctx.context.call_stack.iter().any(|id| id == &config.workflow_id)
        {
            let mut chain = ctx.context.call_stack.clone();
            chain.push(ctx.workflow_id.clone());
            chain.push(config.workflow_id.clone());
            return Some(
                ActionFailure::cycle(format!(
                    "Sub-workflow cycle detected: {}",
                    chain.join(" -> ")
                ))
                .with_data(json!({ "call_stack": chain })),
            );
        }
        None
    }

    fn child_context(config: &SubWorkflowConfig, ctx: &ActionContext) -> ExecutionContext {
        let mut data = match ctx.vars() {
            Value::Object(map) => map.clone(),
            _ => Default::default(),
        };
        data.remove("trigger");
        data.remove("steps");
        for (key, value) in &config.parameters {
            data.insert(key.clone(), interpolate_value(value, ctx.vars()));
        }

        let parent = &ctx.context;
        let mut call_stack = parent.call_stack.clone();
        call_stack.push(ctx.workflow_id.clone());

        ExecutionContext {
            trigger_type: TriggerType::SubWorkflow,
            source: Some(ctx.workflow_id.clone()),
            trigger_data: Value::Object(data),
            user_id: parent.user_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            depth: parent.depth + 1,
            call_stack,
            parent_execution_id: Some(ctx.execution_id.clone()),
            root_execution_id: Some(
                parent
                    .root_execution_id
                    .clone()
                    .unwrap_or_else(|| ctx.execution_id.clone()),
            ),
        }
    }
}

#[async_trait]
impl Action for SubWorkflowAction {
    fn action_type(&self) -> &str {
        "sub_workflow"
    }

    fn description(&self) -> &str {
        "Run another workflow, waiting for its output or fire-and-forget"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::SubWorkflow(config) = &node.action else {
            return ActionFailure::validation("sub_workflow action received wrong config").into();
        };
        if let Some(failure) = Self::check_cycle(config, ctx) {
            return failure.into();
        }
        let Some(launcher) = ctx.launcher.as_ref() else {
            return ActionFailure::action("No workflow launcher available").non_retryable().into();
        };

        let child_ctx = Self::child_context(config, ctx);
        let wait = config.wait.then(|| {
            let wait = Duration::from_secs(
                config
                    .timeout_seconds
                    .unwrap_or(ctx.services.engine.sync_wait_timeout_seconds),
            );
            ctx.time_limit.map_or(wait, |limit| wait.min(limit))
        });
        debug!(
            child = %config.workflow_id,
            depth = child_ctx.depth,
            wait = config.wait,
            "Starting sub-workflow"
        );

        let child = match launcher.launch_child(&config.workflow_id, child_ctx, wait).await {
            Ok(child) => child,
            Err(e) => {
                let failure = match e {
                    crate::error::Error::Cycle(msg) => ActionFailure::cycle(msg),
                    crate::error::Error::Timeout(msg) => ActionFailure::timeout(msg).non_retryable(),
                    other => ActionFailure::action(format!("Failed to start sub-workflow: {}", other))
                        .non_retryable(),
                };
                return failure.into();
            }
        };

        if !config.wait {
            return ActionResult::new(json!({
                "execution_id": child.id,
                "status": child.status,
            }))
            .into();
        }

        match child.status {
            ExecutionStatus::Completed => {
                let output = child.output.clone().unwrap_or(Value::Null);
                info!(child = %child.id, "Sub-workflow completed");
                let mut result = ActionResult::new(json!({
                    "execution_id": child.id,
                    "status": child.status,
                    "output": output,
                }));
                if let Some(name) = &config.output_variable {
                    result = result.with_variable(name, output);
                }
                result.into()
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => ActionFailure::action(format!(
                "Sub-workflow {} {}: {}",
                child.id,
                child.status,
                child.error.clone().unwrap_or_default()
            ))
            .with_data(json!({ "execution_id": child.id, "status": child.status }))
            .into(),
            status => ActionFailure::timeout(format!(
                "Sub-workflow {} still {} after {}s",
                child.id,
                status,
                wait.map(|d| d.as_secs()).unwrap_or_default()
            ))
            .with_data(json!({ "execution_id": child.id, "status": status }))
            .non_retryable()
            .into(),
        }
    }
}
