//! AI action - best-effort text generation or classification.
//!
//! Calls the configured endpoint with `{prompt, task, labels}` and expects
//! `{content}` back. Failures complete with `ok: false` unless the node is
//! marked `required`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::expr::interpolate;
use crate::workflow::{AiConfig, AiTask, NodeAction, WorkflowNode};

#[derive(Debug, Serialize)]
struct AiRequest<'a> {
    prompt: &'a str,
    task: AiTask,
    labels: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    content: String,
}

/// Pick the label the model answered with. Exact matches win over
/// substring matches.
fn match_label(content: &str, labels: &[String]) -> Option<String> {
    let answer = content.trim().trim_matches(|c: char| c == '"' || c == '.').to_lowercase();
    labels
        .iter()
        .find(|l| l.to_lowercase() == answer)
        .or_else(|| labels.iter().find(|l| answer.contains(&l.to_lowercase())))
        .cloned()
}

pub struct AiAction;

impl AiAction {
    async fn call(config: &AiConfig, prompt: &str, ctx: &ActionContext) -> Result<String, String> {
        let settings = &ctx.services.settings;
        let endpoint = settings
            .ai_endpoint
            .as_deref()
            .ok_or_else(|| "No AI endpoint configured".to_string())?;

        debug!("AI action calling {}", endpoint);
        let response = ctx
            .services
            .http
            .post(endpoint)
            .timeout(Duration::from_secs(settings.ai_timeout_seconds))
            .json(&AiRequest {
                prompt,
                task: config.task,
                labels: &config.labels,
            })
            .send()
            .await
            .map_err(|e| format!("AI request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("AI endpoint returned {}", response.status()));
        }
        let body: AiResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse AI response: {}", e))?;
        Ok(body.content)
    }
}

#[async_trait]
impl Action for AiAction {
    fn action_type(&self) -> &str {
        "ai"
    }

    fn description(&self) -> &str {
        "Generate text or classify input with an AI endpoint"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Ai(config) = &node.action else {
            return ActionFailure::validation("ai action received wrong config").into();
        };
        let prompt = interpolate(&config.prompt, ctx.vars());

        let data = match Self::call(config, &prompt, ctx).await {
            Ok(content) => {
                info!("AI action {} answered ({} chars)", node.id, content.len());
                let label = match config.task {
                    AiTask::Classify => match_label(&content, &config.labels),
                    AiTask::Generate => None,
                };
                if config.task == AiTask::Classify && label.is_none() && config.required {
                    return ActionFailure::action(format!(
                        "AI answer '{}' matched no label",
                        content.trim()
                    ))
                    .into();
                }
                json!({ "ok": true, "content": content, "label": label })
            }
            Err(error) if config.required => {
                return ActionFailure::action(error).into();
            }
            Err(error) => {
                warn!("AI action {} degraded: {}", node.id, error);
                json!({ "ok": false, "error": error })
            }
        };

        let mut result = ActionResult::new(data.clone());
        if let Some(name) = &config.output_variable {
            let value = match config.task {
                AiTask::Classify => data.get("label").cloned().unwrap_or(Value::Null),
                AiTask::Generate => data.get("content").cloned().unwrap_or(Value::Null),
            };
            result = result.with_variable(name, value);
        }
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::types::testing::{context, fixture_with};
    use crate::config::ActionSettings;
    use axum::{routing::post, Json, Router};

    fn node(task: AiTask, required: bool) -> WorkflowNode {
        WorkflowNode::new(
            "classify",
            NodeAction::Ai(AiConfig {
                prompt: "Classify: {{ticket.body}}".into(),
                task,
                labels: vec!["billing".into(), "bug".into()],
                required,
                output_variable: Some("category".into()),
            }),
        )
    }

    #[test]
    fn test_match_label() {
        let labels = vec!["billing".to_string(), "bug".to_string()];
        assert_eq!(match_label(" Billing.", &labels).as_deref(), Some("billing"));
        assert_eq!(match_label("I think it is a bug", &labels).as_deref(), Some("bug"));
        assert_eq!(match_label("sales", &labels), None);
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint_fails_soft() {
        let fx = fixture_with(ActionSettings::default());
        let ctx = context(&fx.services, "classify", json!({"ticket": {"body": "refund"}}));
        let ActionOutcome::Completed(result) = AiAction.execute(&node(AiTask::Classify, false), &ctx).await else {
            panic!("expected completion");
        };
        assert_eq!(result.data["ok"], false);
        assert_eq!(result.variables["category"], Value::Null);

        let outcome = AiAction.execute(&node(AiTask::Classify, true), &ctx).await;
        assert!(matches!(outcome, ActionOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_classification_round_trip() {
        let router = Router::new().route(
            "/ai",
            post(|Json(body): Json<Value>| async move {
                let answer = if body["prompt"].as_str().unwrap_or("").contains("refund") {
                    "billing"
                } else {
                    "bug"
                };
                Json(json!({ "content": answer }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut settings = ActionSettings::default();
        settings.ai_endpoint = Some(format!("http://{}/ai", addr));
        let fx = fixture_with(settings);
        let ctx = context(&fx.services, "classify", json!({"ticket": {"body": "refund please"}}));
        let ActionOutcome::Completed(result) = AiAction.execute(&node(AiTask::Classify, true), &ctx).await else {
            panic!("expected completion");
        };
        assert_eq!(result.data["label"], "billing");
        assert_eq!(result.variables["category"], "billing");
    }
}
