use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::{HttpClient, HttpMethod, HttpRequest, HttpResponse, PortError};
use crate::process::{log_port_call, render, render_value};

/// ```yaml
/// - id: notify_crm
///   type: webhook
///   config:
///     url: "https://hooks.example.com/leads/{{userId}}"
///     method: POST
///     headers:
///       Authorization: "Bearer {{apiToken}}"
///     body:
///       phone: "{{phoneNumber}}"
///       answer: "{{lastUserMessage}}"
///     timeout: 5000
///     retries: 2
///     outputVariable: crmResponse
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNodeConfig {
    #[serde(alias = "endpoint")]
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Extra attempts after a transport failure.
    #[serde(default)]
    pub retries: u32,
    /// Milliseconds, multiplied by the attempt number.
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub output_variable: Option<String>,
}

const DEFAULT_RETRY_DELAY_MS: u64 = 500;

pub struct WebhookExecutor {
    http: Arc<dyn HttpClient>,
    default_timeout: Duration,
}

impl WebhookExecutor {
    pub fn new(http: Arc<dyn HttpClient>, default_timeout: Duration) -> Self {
        Self { http, default_timeout }
    }

    fn request(&self, ctx: &NodeContext, cfg: &WebhookNodeConfig) -> Result<HttpRequest, NodeError> {
        let url = render(ctx, &cfg.url);
        if url.trim().is_empty() {
            return Err(NodeError::InvalidConfig(format!("webhook node `{}` has no url", ctx.node_id())));
        }
        Ok(HttpRequest {
            method: cfg.method,
            url,
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), render(ctx, v)))
                .collect(),
            body: cfg.body.as_ref().map(|b| render_value(ctx, b)),
            timeout: cfg
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
        })
    }

    /// One call, bounded by the request timeout whatever the adapter does.
    async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse, PortError> {
        match tokio::time::timeout(request.timeout, self.http.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(PortError::Timeout(format!(
                "no response from {} within {} ms",
                request.url,
                request.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl NodeExecutor for WebhookExecutor {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[tracing::instrument(name = "webhook_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: WebhookNodeConfig = ctx.config_as()?;
        let request = self.request(ctx, &cfg)?;
        let retry_delay = Duration::from_millis(cfg.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_MS));
        if retry_delay.checked_mul(cfg.retries).is_none() {
            return Err(NodeError::InvalidConfig(format!(
                "webhook node `{}`: retryDelay {:?} x {} retries is out of range",
                ctx.node_id(),
                retry_delay,
                cfg.retries
            )));
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let call_started = Instant::now();
            let result = self.attempt(&request).await;
            log_port_call("http", ctx, result.is_ok(), call_started);
            match result {
                Err(e) if attempts <= cfg.retries => {
                    ctx.log(
                        LogLevel::Warn,
                        format!("{} {} failed (attempt {}): {}", request.method.as_str(), request.url, attempts, e),
                    );
                    tokio::time::sleep(retry_delay * attempts).await;
                }
                other => break other,
            }
        };
        let duration = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(resp) => {
                let success = (200..300).contains(&resp.status);
                let output = json!({
                    "status": resp.status,
                    "statusText": resp.status_text,
                    "data": resp.body,
                    "headers": resp.headers,
                    "duration": duration,
                    "attempts": attempts,
                });
                if !success {
                    ctx.log(LogLevel::Warn, format!("{} answered {}", request.url, resp.status));
                    let error = format!("HTTP {} {}", resp.status, resp.status_text);
                    return Ok(NodeResult::failed(error.trim_end(), output));
                }
                let mut result = NodeResult::ok(output);
                if let Some(var) = cfg.output_variable.as_deref().filter(|v| !v.is_empty()) {
                    result = result.with_variable(var, resp.body);
                }
                Ok(result)
            }
            Err(e) => {
                ctx.log(LogLevel::Error, format!("{} {} failed: {}", request.method.as_str(), request.url, e));
                Ok(NodeResult::failed(
                    e.to_string(),
                    json!({
                        "status": 0,
                        "statusText": "",
                        "error": e.to_string(),
                        "duration": duration,
                        "attempts": attempts,
                    }),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use crate::ports::StubHttpClient;

    fn ctx(config: Value) -> NodeContext {
        let mut ctx = NodeContext::dummy(FlowNode::new("hook", "webhook", config));
        ctx.set_variable("token", json!("s3cr3t"));
        ctx.set_variable("order", json!({"id": 42}));
        ctx
    }

    #[tokio::test]
    async fn resolves_tokens_everywhere_and_stores_response() {
        let http = Arc::new(StubHttpClient::new());
        http.push_response(200, json!({"ok": true})).await;
        let exec = WebhookExecutor::new(http.clone(), Duration::from_secs(30));

        let mut ctx = ctx(json!({
            "url": "https://api.example.com/orders/{{order.id}}",
            "method": "post",
            "headers": {"Authorization": "Bearer {{token}}"},
            "body": {"order": "{order.id}", "items": ["{{missing}}"]},
            "outputVariable": "apiResult"
        }));
        let result = exec.execute(&mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output["status"], 200);
        assert_eq!(result.variables.unwrap()["apiResult"], json!({"ok": true}));
        let sent = http.requests().await.remove(0);
        assert_eq!(sent.url, "https://api.example.com/orders/42");
        assert_eq!(sent.method, HttpMethod::Post);
        assert_eq!(sent.headers["Authorization"], "Bearer s3cr3t");
        assert_eq!(sent.body, Some(json!({"order": "42", "items": ["{{missing}}"]})));
        assert_eq!(sent.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn non_success_status_fails_the_node() {
        let http = Arc::new(StubHttpClient::new());
        http.push_response(503, json!("down")).await;
        let exec = WebhookExecutor::new(http, Duration::from_secs(1));

        let result = exec.execute(&mut ctx(json!({"url": "https://x.test"}))).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.output["status"], 503);
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_with_status_zero() {
        let http = Arc::new(StubHttpClient::new().with_delay(Duration::from_millis(500)));
        http.push_response(200, json!({})).await;
        let exec = WebhookExecutor::new(http, Duration::from_secs(30));

        let result = exec
            .execute(&mut ctx(json!({"url": "https://slow.test", "timeout": 20})))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.output["status"], 0);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn transport_failures_are_retried() {
        let http = Arc::new(StubHttpClient::new());
        http.push_error(PortError::Transport("connection reset".into())).await;
        http.push_response(201, json!({"id": 1})).await;
        let exec = WebhookExecutor::new(http.clone(), Duration::from_secs(1));

        let mut ctx = ctx(json!({"url": "https://flaky.test", "retries": 1, "retryDelay": 0}));
        let result = exec.execute(&mut ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["attempts"], 2);
        assert_eq!(http.requests().await.len(), 2);
        assert_eq!(ctx.logs().len(), 1);
    }

    #[tokio::test]
    async fn oversized_backoff_is_rejected_before_calling() {
        let http = Arc::new(StubHttpClient::new());
        let exec = WebhookExecutor::new(http.clone(), Duration::from_secs(1));

        let mut ctx = ctx(json!({"url": "https://flaky.test", "retries": 3, "retryDelay": u64::MAX}));
        let err = exec.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(ref msg) if msg.contains("out of range")));
        assert!(http.requests().await.is_empty());
    }
}
