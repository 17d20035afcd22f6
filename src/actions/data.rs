//! Data mutation action - assign and remove execution variables.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::expr::interpolate_value;
use crate::workflow::{NodeAction, WorkflowNode};

pub struct DataMutationAction;

#[async_trait]
impl Action for DataMutationAction {
    fn action_type(&self) -> &str {
        "data_mutation"
    }

    fn description(&self) -> &str {
        "Set or remove execution variables"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::DataMutation(config) = &node.action else {
            return ActionFailure::validation("data_mutation action received wrong config").into();
        };

        let mut result = ActionResult::new(Value::Null);
        for (name, value) in &config.set {
            result = result.with_variable(name, interpolate_value(value, ctx.vars()));
        }
        result.remove = config.remove.clone();
        result.data = json!({
            "set": Value::Object(result.variables.clone()),
            "removed": result.remove,
        });
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::types::testing::{context, fixture};
    use crate::workflow::DataMutationConfig;

    #[tokio::test]
    async fn test_set_keeps_types_and_interpolates() {
        let fx = fixture();
        let ctx = context(
            &fx.services,
            "set",
            json!({"invoice": {"total": 10, "lines": [1, 2]}, "name": "Ana"}),
        );
        let node = WorkflowNode::new(
            "set",
            NodeAction::DataMutation(DataMutationConfig {
                set: json!({
                    "total": "{{invoice.total}}",
                    "lines": "{{invoice.lines}}",
                    "greeting": "Hi {{name}}",
                })
                .as_object()
                .cloned()
                .unwrap(),
                remove: vec!["scratch".into()],
            }),
        );

        let ActionOutcome::Completed(result) = DataMutationAction.execute(&node, &ctx).await else {
            panic!("expected completion");
        };
        assert_eq!(result.variables["total"], 10);
        assert_eq!(result.variables["lines"], json!([1, 2]));
        assert_eq!(result.variables["greeting"], "Hi Ana");
        assert_eq!(result.remove, vec!["scratch"]);
    }
}
