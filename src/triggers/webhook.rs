//! Inbound webhook triggers.
//!
//! A path token maps to one ACTIVE workflow. The request is verified
//! against the trigger's secret before anything is persisted:
//!
//! - `hmac_sha256`: hex HMAC-SHA256 of the raw body in `x-signature`,
//!   optionally prefixed with `sha256=`
//! - `shared_secret`: the secret itself in `x-webhook-secret`

use ring::hmac;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use super::TriggerHub;
use crate::engine::RunMode;
use crate::error::{Error, Result};
use crate::expr::evaluate;
use crate::metrics;
use crate::storage::{ExecutionContext, WorkflowExecution};
use crate::workflow::{SignatureScheme, TriggerKind, TriggerType};

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SECRET_HEADER: &str = "x-webhook-secret";

/// The parts of an inbound request that admission looks at.
#[derive(Debug, Clone, Copy)]
pub struct WebhookCall<'a> {
    pub path: &'a str,
    /// Value of `x-signature`.
    pub signature: Option<&'a str>,
    /// Value of `x-webhook-secret`.
    pub secret: Option<&'a str>,
    pub body: &'a [u8],
}

/// Check a call against `secret` under `scheme`. Comparisons are constant
/// time.
pub fn verify_signature(scheme: SignatureScheme, secret: &str, call: &WebhookCall<'_>) -> Result<()> {
    match scheme {
        SignatureScheme::HmacSha256 => {
            let header = call
                .signature
                .ok_or_else(|| Error::Permission(format!("Missing {} header", SIGNATURE_HEADER)))?;
            let hex_signature = header.trim();
            let hex_signature = hex_signature
                .strip_prefix("sha256=")
                .unwrap_or(hex_signature);
            let provided = hex::decode(hex_signature)
                .map_err(|_| Error::Permission("Invalid signature hex encoding".to_string()))?;

            let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
            let computed = hmac::sign(&key, call.body);
            if computed.as_ref().ct_eq(&provided).unwrap_u8() != 1 {
                return Err(Error::Permission("Invalid webhook signature".to_string()));
            }
        }
        SignatureScheme::SharedSecret => {
            let provided = call
                .secret
                .ok_or_else(|| Error::Permission(format!("Missing {} header", SECRET_HEADER)))?;
            if secret.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
                return Err(Error::Permission("Invalid webhook secret".to_string()));
            }
        }
    }
    Ok(())
}

/// JSON bodies are kept as JSON; anything else becomes a string.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

impl TriggerHub {
    /// Verify and admit an inbound webhook. Returns `None` when the
    /// trigger's conditions filtered the payload out.
    #[instrument(name = "trigger.webhook", skip(self, call), fields(path = %call.path))]
    pub async fn handle_webhook(&self, call: WebhookCall<'_>) -> Result<Option<WorkflowExecution>> {
        let subscription = self
            .index()
            .lookup_webhook(call.path)
            .await
            .ok_or_else(|| Error::NotFound(format!("Webhook {}", call.path)))?;

        let TriggerKind::Webhook { secret, scheme, .. } = &subscription.trigger.kind else {
            return Err(Error::Internal(format!(
                "Webhook {} maps to a non-webhook trigger",
                call.path
            )));
        };
        let verified = match secret.as_deref() {
            Some(secret) if !secret.is_empty() => verify_signature(*scheme, secret, &call),
            _ => Err(Error::Permission(format!(
                "Webhook {} has no secret configured",
                call.path
            ))),
        };
        if let Err(e) = verified {
            warn!(workflow = %subscription.workflow_name, "Webhook rejected: {}", e);
            metrics::record_trigger("webhook", "rejected");
            return Err(e);
        }

        let data = json!({
            "payload": parse_body(call.body),
            "webhook": { "path": call.path },
        });
        if let Some(conditions) = &subscription.trigger.conditions {
            if !evaluate(conditions, &data) {
                metrics::record_trigger("webhook", "filtered");
                return Ok(None);
            }
        }

        let context = ExecutionContext::new(TriggerType::Webhook, &subscription.tenant_id, data)
            .with_source(call.path);
        let execution = self
            .engine()
            .trigger_workflow(&subscription.workflow_id, context, RunMode::Async)
            .await?;
        metrics::record_trigger("webhook", "started");
        info!(execution_id = %execution.id, "Webhook accepted");
        Ok(Some(execution))
    }
}
