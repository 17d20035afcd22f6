//! Webhook action - outbound HTTP calls.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::types::{Action, ActionContext, ActionFailure, ActionOutcome, ActionResult};
use crate::expr::{interpolate, interpolate_value};
use crate::workflow::{NodeAction, WorkflowNode};

/// Validate a URL against SSRF attacks.
///
/// Blocks loopback, private and link-local addresses plus internal
/// hostnames unless `allow_internal` is set.
pub(crate) fn validate_url(url: &str, allow_internal: bool) -> std::result::Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("Invalid URL '{}': {}", url, e))?;

    // Only allow http/https schemes
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(format!(
                "Unsupported URL scheme '{}'. Only http and https are allowed.",
                scheme
            ));
        }
    }

    if allow_internal {
        return Ok(());
    }

    let Some(host) = parsed.host_str() else {
        return Err(format!("URL '{}' has no host", url));
    };
    let host_lower = host.to_lowercase();
    let bare = host_lower.trim_start_matches('[').trim_end_matches(']');

    if bare == "localhost" || bare == "0.0.0.0" {
        warn!("Blocked SSRF attempt to localhost: {}", url);
        return Err("Access to localhost is not allowed".to_string());
    }

    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_or_special_ip(&ip) {
            warn!("Blocked SSRF attempt to private IP: {}", url);
            return Err("Access to private or internal IP addresses is not allowed".to_string());
        }
    }

    if bare.ends_with(".local")
        || bare.ends_with(".internal")
        || bare.ends_with(".localhost")
    {
        warn!("Blocked SSRF attempt to internal host: {}", url);
        return Err("Access to internal hostnames is not allowed".to_string());
    }

    Ok(())
}

/// Check if an IP address is private, loopback, or otherwise special.
fn is_private_or_special_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local() // includes the cloud metadata address
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xc0) == 64 // CGNAT
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || ipv6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_or_special_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

fn status_accepted(status: u16, expected: &[u16]) -> bool {
    if expected.is_empty() {
        (200..300).contains(&status)
    } else {
        expected.contains(&status)
    }
}

/// HTTP request action.
pub struct WebhookAction;

#[async_trait]
impl Action for WebhookAction {
    fn action_type(&self) -> &str {
        "webhook"
    }

    fn description(&self) -> &str {
        "Call an external HTTP endpoint"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: &ActionContext) -> ActionOutcome {
        let NodeAction::Webhook(config) = &node.action else {
            return ActionFailure::validation("webhook action received wrong config").into();
        };
        let vars = ctx.vars();
        let settings = &ctx.services.settings;

        let url = interpolate(&config.url, vars);
        if let Err(reason) = validate_url(&url, settings.allow_internal_urls) {
            return ActionFailure::validation(reason)
                .with_data(json!({ "url": url }))
                .into();
        }

        let method = match Method::from_bytes(config.method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return ActionFailure::validation(format!("Unknown HTTP method: {}", config.method))
                    .into()
            }
        };

        let timeout = Duration::from_secs(
            config
                .timeout_seconds
                .unwrap_or(settings.webhook_timeout_seconds),
        );
        let mut request = ctx
            .services
            .http
            .request(method.clone(), &url)
            .timeout(timeout);

        for (key, value) in &config.headers {
            request = request.header(key.as_str(), interpolate(value, vars));
        }
        if !config.query.is_empty() {
            let query: Vec<(String, String)> = config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), interpolate(v, vars)))
                .collect();
            request = request.query(&query);
        }
        if let Some(body) = &config.body {
            request = request.json(&interpolate_value(body, vars));
        }

        debug!("Webhook {} {}", method, url);
        let start = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let data = json!({ "url": url, "method": method.as_str(), "error": e.to_string() });
                let failure = if e.is_timeout() {
                    ActionFailure::timeout(format!("Webhook {} {} timed out", method, url))
                } else {
                    ActionFailure::action(format!("Webhook {} {} failed: {}", method, url, e))
                };
                return failure.with_data(data).into();
            }
        };

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (k, v) in response.headers() {
            headers.insert(
                k.to_string(),
                Value::String(v.to_str().unwrap_or_default().to_string()),
            );
        }
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let duration_ms = start.elapsed().as_millis() as u64;

        let data = json!({
            "status": status,
            "headers": headers,
            "body": body,
            "duration_ms": duration_ms,
        });

        if !status_accepted(status, &config.expected_status) {
            return ActionFailure::action(format!("Webhook {} {} returned {}", method, url, status))
                .with_data(data)
                .into();
        }

        info!("Webhook {} {} -> {} ({}ms)", method, url, status, duration_ms);
        ActionResult::new(data).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::types::testing::{context, fixture, fixture_with};
    use crate::workflow::WebhookConfig;
    use axum::{extract::Query, routing::post, Json, Router};
    use std::collections::HashMap;

    #[test]
    fn test_validate_url_blocks_internal() {
        assert!(validate_url("http://localhost:8080/x", false).is_err());
        assert!(validate_url("http://127.0.0.1/x", false).is_err());
        assert!(validate_url("http://10.1.2.3/x", false).is_err());
        assert!(validate_url("http://169.254.169.254/latest", false).is_err());
        assert!(validate_url("http://[::1]/x", false).is_err());
        assert!(validate_url("http://db.internal/x", false).is_err());
        assert!(validate_url("ftp://example.com/x", false).is_err());
        assert!(validate_url("https://example.com/hook", false).is_ok());
        assert!(validate_url("http://127.0.0.1/x", true).is_ok());
    }

    #[test]
    fn test_status_accepted() {
        assert!(status_accepted(204, &[]));
        assert!(!status_accepted(302, &[]));
        assert!(status_accepted(409, &[200, 409]));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn node(url: String) -> WorkflowNode {
        WorkflowNode::new(
            "call",
            NodeAction::Webhook(WebhookConfig {
                url,
                method: "POST".into(),
                headers: HashMap::from([("x-invoice".to_string(), "{{invoice.id}}".to_string())]),
                query: HashMap::from([("source".to_string(), "{{trigger.type}}".to_string())]),
                body: Some(json!({"id": "{{invoice.id}}", "total": "{{invoice.total}}"})),
                timeout_seconds: Some(5),
                expected_status: vec![],
            }),
        )
    }

    #[tokio::test]
    async fn test_interpolated_request() {
        let router = Router::new().route(
            "/hook",
            post(
                |headers: axum::http::HeaderMap,
                 Query(q): Query<HashMap<String, String>>,
                 Json(body): Json<Value>| async move {
                    Json(json!({
                        "header": headers.get("x-invoice").and_then(|v| v.to_str().ok()),
                        "source": q.get("source"),
                        "body": body,
                    }))
                },
            ),
        );
        let base = serve(router).await;
        let fx = fixture();
        let vars = json!({"invoice": {"id": "inv-9", "total": 250}, "trigger": {"type": "manual"}});
        let ctx = context(&fx.services, "call", vars);

        let outcome = WebhookAction.execute(&node(format!("{}/hook", base)), &ctx).await;
        let ActionOutcome::Completed(result) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(result.data["status"], 200);
        assert_eq!(result.data["body"]["header"], "inv-9");
        assert_eq!(result.data["body"]["source"], "manual");
        assert_eq!(result.data["body"]["body"]["total"], 250);
    }

    #[tokio::test]
    async fn test_error_status_is_retryable_failure() {
        let router = Router::new().route(
            "/hook",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let base = serve(router).await;
        let fx = fixture();
        let ctx = context(&fx.services, "call", json!({}));

        let outcome = WebhookAction.execute(&node(format!("{}/hook", base)), &ctx).await;
        let ActionOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert!(failure.retryable);
        assert_eq!(failure.data["status"], 503);
        assert_eq!(failure.data["body"], "busy");
    }

    #[tokio::test]
    async fn test_blocked_url_is_not_retryable() {
        let fx = fixture_with(crate::config::ActionSettings::default());
        let ctx = context(&fx.services, "call", json!({}));
        let outcome = WebhookAction
            .execute(&node("http://127.0.0.1:9/hook".into()), &ctx)
            .await;
        assert!(matches!(outcome, ActionOutcome::Failed(f) if !f.retryable));
    }
}
