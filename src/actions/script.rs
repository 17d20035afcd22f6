//! Script action - sandboxed Rhai evaluation.
//!
//! Scripts see the execution variables as `vars` and may not perform I/O.
//! Operation count, data sizes and wall-clock time are all bounded.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{json, Value};
use tracing::debug;

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::workflow::{NodeAction, WorkflowNode};

const MAX_OPERATIONS: u64 = 1_000_000;
const MAX_STRING_SIZE: usize = 64 * 1024;
const MAX_COLLECTION_SIZE: usize = 10_000;
const MAX_CALL_LEVELS: usize = 32;

/// Build a restricted Rhai engine that stops once `deadline` passes.
fn create_engine(deadline: Instant) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_COLLECTION_SIZE);
    engine.set_max_map_size(MAX_COLLECTION_SIZE);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.set_max_expr_depths(64, 32);
    engine.disable_symbol("eval");
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    engine.register_fn("to_json", |v: Dynamic| -> String {
        rhai::serde::from_dynamic::<Value>(&v)
            .map(|json| json.to_string())
            .unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        serde_json::from_str::<Value>(s)
            .ok()
            .and_then(|v| rhai::serde::to_dynamic(v).ok())
            .unwrap_or(Dynamic::UNIT)
    });

    engine
}

enum ScriptError {
    Timeout,
    Failed(String),
}

fn run_script(source: &str, vars: &Value, limit: Duration) -> Result<Value, ScriptError> {
    let deadline = Instant::now() + limit;
    let engine = create_engine(deadline);
    let mut scope = Scope::new();
    let vars = rhai::serde::to_dynamic(vars).map_err(|e| ScriptError::Failed(e.to_string()))?;
    scope.push_dynamic("vars", vars);

    let result = engine
        .eval_with_scope::<Dynamic>(&mut scope, source)
        .map_err(|e| match *e {
            EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout,
            other => ScriptError::Failed(other.to_string()),
        })?;

    if result.is_unit() {
        return Ok(Value::Null);
    }
    rhai::serde::from_dynamic::<Value>(&result).map_err(|e| ScriptError::Failed(e.to_string()))
}

pub struct ScriptAction;

#[async_trait]
impl Action for ScriptAction {
    fn action_type(&self) -> &str {
        "script"
    }

    fn description(&self) -> &str {
        "Evaluate a sandboxed Rhai script over the execution variables"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Script(config) = &node.action else {
            return ActionFailure::validation("script action received wrong config").into();
        };
        let limit = Duration::from_millis(
            config
                .timeout_ms
                .unwrap_or(ctx.services.settings.script_timeout_ms),
        );
        let source = config.source.clone();
        let vars = ctx.variables.clone();

        debug!("Script {}: {} bytes", node.id, source.len());
        let joined = tokio::task::spawn_blocking(move || run_script(&source, &vars, limit)).await;

        match joined {
            Ok(Ok(value)) => {
                let mut result = ActionResult::new(json!({ "result": value }));
                if let Some(name) = &config.output_variable {
                    result = result.with_variable(name, value);
                }
                result.into()
            }
            Ok(Err(ScriptError::Timeout)) => ActionFailure::timeout(format!(
                "Script exceeded {}ms",
                limit.as_millis()
            ))
            .non_retryable()
            .into(),
            Ok(Err(ScriptError::Failed(msg))) => ActionFailure::action(format!("Script error: {}", msg))
                .non_retryable()
                .into(),
            Err(e) => ActionFailure::action(format!("Script task failed: {}", e))
                .non_retryable()
                .into(),
        }
    }
}
