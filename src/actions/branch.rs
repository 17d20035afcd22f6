//! Branch action - route on a condition group.

use async_trait::async_trait;
use serde_json::json;

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::expr::evaluate;
use crate::workflow::{NodeAction, WorkflowNode};

pub struct BranchAction;

#[async_trait]
impl Action for BranchAction {
    fn action_type(&self) -> &str {
        "branch"
    }

    fn description(&self) -> &str {
        "Route to on_true or on_false based on a condition"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Branch(config) = &node.action else {
            return ActionFailure::validation("branch action received wrong config").into();
        };
        let matched = evaluate(&config.condition, ctx.vars());
        let next = if matched {
            config.on_true.clone()
        } else {
            config.on_false.clone()
        };
        ActionResult::new(json!({ "result": matched, "next": next }))
            .with_next(next)
            .into()
    }
}
