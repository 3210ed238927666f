use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::message::{OutboundMessage, ReplyButton};
use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::MessageSender;
use crate::process::{capture_answer, log_port_call, render};
use crate::util::value_to_string;

async fn send(sender: &dyn MessageSender, ctx: &mut NodeContext, message: OutboundMessage) -> Result<(), String> {
    let started = Instant::now();
    let delivery = sender.send(ctx.address(), message).await;
    log_port_call(sender.name(), ctx, delivery.is_ok(), started);
    delivery.map(|_| ()).map_err(|e| {
        ctx.log(LogLevel::Error, format!("prompt delivery failed: {}", e));
        format!("delivery failed: {}", e)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonConfig {
    pub id: String,
    #[serde(alias = "text", alias = "label")]
    pub title: String,
    /// Stored instead of the id when present.
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub next_node_id: Option<String>,
}

/// Quick-reply node: sends the options, waits, then routes on the choice.
///
/// A reply matches a button by id, by title (case-insensitive) or by its
/// 1-based position. The choice is stored under `saveAs` (default
/// `selectedButton`) and the node continues at the button's `nextNodeId`, or
/// along the edge whose handle is the button id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonsNodeConfig {
    #[serde(alias = "text")]
    pub message: String,
    #[serde(alias = "options")]
    pub buttons: Vec<ButtonConfig>,
    pub save_as: Option<String>,
    pub invalid_message: Option<String>,
}

pub struct ButtonsExecutor {
    sender: Arc<dyn MessageSender>,
}

impl ButtonsExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    fn prompt(ctx: &NodeContext, cfg: &ButtonsNodeConfig, prefix: Option<&str>) -> OutboundMessage {
        let text = render(ctx, &cfg.message);
        let text = match prefix {
            Some(p) => format!("{}\n{}", render(ctx, p), text),
            None => text,
        };
        OutboundMessage::Buttons {
            text,
            buttons: cfg
                .buttons
                .iter()
                .map(|b| ReplyButton {
                    id: b.id.clone(),
                    title: render(ctx, &b.title),
                })
                .collect(),
        }
    }

    /// Find the button the reply points at.
    pub fn match_button<'a>(buttons: &'a [ButtonConfig], ctx: &NodeContext) -> Option<&'a ButtonConfig> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(input) = ctx.input() {
            match input {
                Value::Object(map) => {
                    for key in ["buttonId", "id", "title"] {
                        if let Some(v) = map.get(key) {
                            candidates.push(value_to_string(v));
                        }
                    }
                }
                other => candidates.push(value_to_string(other)),
            }
        }
        if let Some(message) = ctx.message() {
            candidates.push(message.to_string());
        }

        candidates.iter().map(|c| c.trim()).find_map(|reply| {
            buttons
                .iter()
                .find(|b| b.id == reply || b.title.eq_ignore_ascii_case(reply))
                .or_else(|| {
                    reply
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| n.checked_sub(1))
                        .and_then(|i| buttons.get(i))
                })
        })
    }
}

#[async_trait]
impl NodeExecutor for ButtonsExecutor {
    fn name(&self) -> &'static str {
        "buttons"
    }

    #[tracing::instrument(name = "buttons_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: ButtonsNodeConfig = ctx.config_as()?;
        if cfg.buttons.is_empty() {
            return Err(NodeError::InvalidConfig(format!("node `{}` has no buttons", ctx.node_id())));
        }

        if !ctx.is_answer() {
            let prompt = Self::prompt(ctx, &cfg, None);
            return Ok(match send(self.sender.as_ref(), ctx, prompt.clone()).await {
                Ok(()) => NodeResult::ok(json!({ "prompt": prompt })).waiting(),
                Err(e) => NodeResult::failed(e, json!({ "prompt": prompt })),
            });
        }

        let Some(button) = Self::match_button(&cfg.buttons, ctx).cloned() else {
            ctx.log(LogLevel::Info, "reply did not match any button, asking again");
            let invalid = cfg
                .invalid_message
                .clone()
                .unwrap_or_else(|| "Por favor elige una de las opciones.".to_string());
            let prompt = Self::prompt(ctx, &cfg, Some(invalid.as_str()));
            return Ok(match send(self.sender.as_ref(), ctx, prompt.clone()).await {
                Ok(()) => NodeResult::ok(json!({ "prompt": prompt, "matched": false })).waiting(),
                Err(e) => NodeResult::failed(e, json!({ "prompt": prompt })),
            });
        };

        let key = cfg.save_as.clone().unwrap_or_else(|| "selectedButton".to_string());
        let value = button.value.clone().unwrap_or_else(|| json!(button.id));
        ctx.set_variable(key.clone(), value.clone());
        ctx.set_variable("selectedButtonTitle", json!(button.title));
        Ok(NodeResult::ok(json!({ "matched": true, "buttonId": button.id, "value": value, "savedAs": key }))
            .with_handle(button.id.clone())
            .with_next_opt(button.next_node_id.clone()))
    }
}

/// Free-form question used for `survey`, `location`, `interactive` and `list` nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptNodeConfig {
    #[serde(alias = "text", alias = "question")]
    pub message: String,
    pub save_as: Option<String>,
}

pub struct PromptExecutor {
    sender: Arc<dyn MessageSender>,
    name: &'static str,
}

impl PromptExecutor {
    pub fn new(sender: Arc<dyn MessageSender>, name: &'static str) -> Self {
        Self { sender, name }
    }
}

#[async_trait]
impl NodeExecutor for PromptExecutor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: PromptNodeConfig = ctx.config_as()?;
        if ctx.is_answer() {
            return Ok(capture_answer(ctx, cfg.save_as.as_deref()));
        }
        let text = render(ctx, &cfg.message);
        if text.trim().is_empty() {
            return Err(NodeError::InvalidConfig(format!("node `{}` has no question", ctx.node_id())));
        }
        Ok(match send(self.sender.as_ref(), ctx, OutboundMessage::text(text.clone())).await {
            Ok(()) => NodeResult::ok(json!({ "text": text })).waiting(),
            Err(e) => NodeResult::failed(e, json!({ "text": text })),
        })
    }
}

/// Waits for a reply and routes on whether it arrived in time.
///
/// The first run records a deadline and waits. On the next message the node
/// continues at `nextNodeId` (handle `reply`) when the deadline has not passed,
/// otherwise at `timeoutNodeId` (handle `timeout`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutNodeConfig {
    #[serde(alias = "timeout")]
    pub seconds: u64,
    pub message: Option<String>,
    pub save_as: Option<String>,
    pub next_node_id: Option<String>,
    pub timeout_node_id: Option<String>,
}

pub struct TimeoutExecutor {
    sender: Arc<dyn MessageSender>,
}

impl TimeoutExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    fn deadline_key(ctx: &NodeContext) -> String {
        format!("_deadline_{}", ctx.node_id())
    }
}

#[async_trait]
impl NodeExecutor for TimeoutExecutor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: TimeoutNodeConfig = ctx.config_as()?;
        let key = Self::deadline_key(ctx);

        if !ctx.is_answer() {
            let deadline = i64::try_from(cfg.seconds)
                .ok()
                .and_then(ChronoDuration::try_seconds)
                .and_then(|wait| Utc::now().checked_add_signed(wait))
                .ok_or_else(|| {
                    NodeError::InvalidConfig(format!(
                        "timeout node `{}`: {} seconds is out of range",
                        ctx.node_id(),
                        cfg.seconds
                    ))
                })?;
            ctx.set_variable(key, json!(deadline.to_rfc3339()));
            if let Some(message) = cfg.message.as_deref() {
                let text = render(ctx, message);
                if let Err(e) = send(self.sender.as_ref(), ctx, OutboundMessage::text(text)).await {
                    return Ok(NodeResult::failed(e, json!({ "deadline": deadline })));
                }
            }
            return Ok(NodeResult::ok(json!({ "deadline": deadline })).waiting());
        }

        let deadline = ctx
            .remove_variable(&key)
            .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|d| d.with_timezone(&Utc));
        let expired = deadline.map(|d| Utc::now() > d).unwrap_or(false);

        if expired {
            ctx.log(LogLevel::Info, "reply arrived after the deadline");
            return Ok(NodeResult::ok(json!({ "timedOut": true, "deadline": deadline }))
                .with_handle("timeout")
                .with_next_opt(cfg.timeout_node_id));
        }
        let mut result = capture_answer(ctx, cfg.save_as.as_deref());
        result.output["timedOut"] = json!(false);
        Ok(result.with_handle("reply").with_next_opt(cfg.next_node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use crate::flow::thread::{ConversationStep, StepStatus};
    use crate::ports::RecordingMessageSender;

    fn buttons_config() -> Value {
        json!({
            "message": "¿Qué necesitas, {{name}}?",
            "buttons": [
                {"id": "sales", "title": "Ventas", "nextNodeId": "sales_flow"},
                {"id": "support", "title": "Soporte"}
            ],
            "saveAs": "department"
        })
    }

    fn answering(node_type: &str, config: Value, message: &str) -> NodeContext {
        let pending = ConversationStep::new("n", node_type, StepStatus::Pending);
        NodeContext::dummy(FlowNode::new("n", node_type, config))
            .with_message(Some(message.to_string()))
            .with_previous_step(Some(pending))
    }

    #[tokio::test]
    async fn buttons_prompt_then_route_on_title() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = ButtonsExecutor::new(sender.clone());

        let mut first = NodeContext::dummy(FlowNode::new("n", "buttons", buttons_config()));
        first.set_variable("name", json!("Ana"));
        let asked = exec.execute(&mut first).await.unwrap();
        assert!(asked.waiting_for_input);
        assert_eq!(sender.texts().await, vec!["¿Qué necesitas, Ana?".to_string()]);

        let mut reply = answering("buttons", buttons_config(), "ventas");
        let routed = exec.execute(&mut reply).await.unwrap();
        assert_eq!(routed.next_node_id.as_deref(), Some("sales_flow"));
        assert_eq!(routed.handle.as_deref(), Some("sales"));
        assert_eq!(reply.get_variable("department"), Some(&json!("sales")));
    }

    #[tokio::test]
    async fn buttons_accept_position_and_reprompt_on_garbage() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = ButtonsExecutor::new(sender.clone());

        let mut by_index = answering("buttons", buttons_config(), "2");
        let routed = exec.execute(&mut by_index).await.unwrap();
        assert_eq!(routed.handle.as_deref(), Some("support"));
        assert!(routed.next_node_id.is_none());

        let mut garbage = answering("buttons", buttons_config(), "pizza");
        let again = exec.execute(&mut garbage).await.unwrap();
        assert!(again.waiting_for_input);
        assert_eq!(again.output["matched"], false);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn structured_input_wins_over_text() {
        let buttons: Vec<ButtonConfig> = serde_json::from_value(buttons_config()["buttons"].clone()).unwrap();
        let ctx = NodeContext::dummy(FlowNode::new("n", "buttons", Value::Null))
            .with_input(Some(json!({"buttonId": "support"})))
            .with_message(Some("Ventas".into()));
        assert_eq!(ButtonsExecutor::match_button(&buttons, &ctx).map(|b| b.id.as_str()), Some("support"));
    }

    #[tokio::test]
    async fn prompt_executor_captures_location_payload() {
        let exec = PromptExecutor::new(Arc::new(RecordingMessageSender::new()), "location");
        let pending = ConversationStep::new("n", "location", StepStatus::Pending);
        let mut ctx = NodeContext::dummy(FlowNode::new("n", "location", json!({"message": "¿Dónde estás?", "saveAs": "where"})))
            .with_input(Some(json!({"latitude": 40.4, "longitude": -3.7})))
            .with_previous_step(Some(pending));
        exec.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.get_variable("where.latitude"), Some(&json!(40.4)));
    }

    #[tokio::test]
    async fn timeout_routes_reply_or_expiry() {
        let exec = TimeoutExecutor::new(Arc::new(RecordingMessageSender::new()));
        let config = json!({"seconds": 60, "nextNodeId": "thanks", "timeoutNodeId": "late"});

        let mut arm = NodeContext::dummy(FlowNode::new("n", "timeout", config.clone()));
        let armed = exec.execute(&mut arm).await.unwrap();
        assert!(armed.waiting_for_input);
        let (vars, _, _) = arm.into_parts();

        let pending = ConversationStep::new("n", "timeout", StepStatus::Pending);
        let mut in_time = NodeContext::new("t", "u", "+1", FlowNode::new("n", "timeout", config.clone()), vars)
            .with_message(Some("aquí".into()))
            .with_previous_step(Some(pending.clone()));
        let result = exec.execute(&mut in_time).await.unwrap();
        assert_eq!(result.next_node_id.as_deref(), Some("thanks"));
        assert_eq!(in_time.get_variable("lastUserMessage"), Some(&json!("aquí")));
        assert!(in_time.get_variable("_deadline_n").is_none());

        let mut late = answering("timeout", config, "perdón");
        late.set_variable("_deadline_n", json!((Utc::now() - ChronoDuration::seconds(5)).to_rfc3339()));
        let result = exec.execute(&mut late).await.unwrap();
        assert_eq!(result.next_node_id.as_deref(), Some("late"));
        assert_eq!(result.handle.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn timeout_beyond_the_calendar_is_a_config_error() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = TimeoutExecutor::new(sender.clone());
        for seconds in [10_000_000_000_000u64, u64::MAX] {
            let config = json!({"seconds": seconds, "message": "¿Sigues ahí?"});
            let mut ctx = NodeContext::dummy(FlowNode::new("n", "timeout", config));
            let err = exec.execute(&mut ctx).await.unwrap_err();
            assert!(matches!(err, NodeError::InvalidConfig(ref msg) if msg.contains("out of range")));
            assert!(ctx.get_variable("_deadline_n").is_none());
        }
        assert!(sender.texts().await.is_empty());
    }
}
