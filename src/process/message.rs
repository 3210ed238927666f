use std::{sync::Arc, time::{Duration, Instant}};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::message::{MediaKind, OutboundMessage};
use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::MessageSender;
use crate::process::{capture_answer, log_port_call, render};
use crate::util::render_tokens;

/// WhatsApp text styling applied after token rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Formatting {
    pub bold: bool,
    pub italic: bool,
    /// Prepended to the text, separated by a space.
    pub emoji: Option<String>,
}

impl Formatting {
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        if self.italic {
            out = format!("_{}_", out);
        }
        if self.bold {
            out = format!("*{}*", out);
        }
        match self.emoji.as_deref().filter(|e| !e.is_empty()) {
            Some(emoji) => format!("{} {}", emoji, out),
            None => out,
        }
    }
}

/// Configuration of a `message` node.
///
/// ```yaml
/// - id: greet
///   type: message
///   config:
///     message: "Hola {{name}}, ¿en qué te ayudo?"
///     typing: true
///     typingDelay: 1200
///     formatting:
///       bold: true
///       emoji: "👋"
/// ```
///
/// With `waitForInput: true` the node becomes a question: the first run sends
/// the text and waits, the next user message is stored under `saveAs`
/// (default `lastUserMessage`) and the flow moves on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageNodeConfig {
    #[serde(alias = "text", alias = "content")]
    pub message: String,
    pub typing: bool,
    /// Milliseconds, capped by the executor's maximum.
    pub typing_delay: u64,
    pub formatting: Formatting,
    pub wait_for_input: bool,
    pub save_as: Option<String>,
}

/// Show the typing indicator, then hold for `delay_ms` (never longer than `max`).
pub(crate) async fn typing_pause(sender: &dyn MessageSender, address: &str, delay_ms: u64, max: Duration) {
    if let Err(e) = sender.send(address, OutboundMessage::Typing).await {
        debug!("typing indicator not delivered: {}", e);
    }
    let delay = Duration::from_millis(delay_ms).min(max);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Send `message`, turning a delivery failure into a failed result instead of an error.
async fn deliver(
    sender: &dyn MessageSender,
    ctx: &mut NodeContext,
    message: OutboundMessage,
    wait_for_input: bool,
) -> NodeResult {
    let preview = message.preview();
    let started = Instant::now();
    let delivery = sender.send(ctx.address(), message.clone()).await;
    log_port_call(sender.name(), ctx, delivery.is_ok(), started);
    match delivery {
        Ok(receipt) => {
            let result = NodeResult::ok(json!({
                "text": preview,
                "message": message,
                "messageId": receipt.message_id,
                "delivered": true,
            }));
            if wait_for_input { result.waiting() } else { result }
        }
        Err(e) => {
            ctx.log(LogLevel::Error, format!("message delivery failed: {}", e));
            NodeResult::failed(
                format!("delivery failed: {}", e),
                json!({ "text": preview, "delivered": false }),
            )
        }
    }
}

pub struct MessageExecutor {
    sender: Arc<dyn MessageSender>,
    max_typing_delay: Duration,
}

impl MessageExecutor {
    pub fn new(sender: Arc<dyn MessageSender>, max_typing_delay: Duration) -> Self {
        Self { sender, max_typing_delay }
    }
}

#[async_trait]
impl NodeExecutor for MessageExecutor {
    fn name(&self) -> &'static str {
        "message"
    }

    #[tracing::instrument(name = "message_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: MessageNodeConfig = ctx.config_as()?;
        if cfg.wait_for_input && ctx.is_answer() {
            return Ok(capture_answer(ctx, cfg.save_as.as_deref()));
        }

        let text = cfg.formatting.apply(&render(ctx, &cfg.message));
        if text.trim().is_empty() {
            return Err(NodeError::InvalidConfig(format!(
                "message node `{}` has no text",
                ctx.node_id()
            )));
        }
        if cfg.typing {
            typing_pause(self.sender.as_ref(), ctx.address(), cfg.typing_delay, self.max_typing_delay).await;
        }
        Ok(deliver(self.sender.as_ref(), ctx, OutboundMessage::text(text), cfg.wait_for_input).await)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancedKind {
    #[default]
    Text,
    Template,
    Media,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn default_language() -> String {
    "es".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    #[serde(rename = "type", alias = "mediaType")]
    pub media_type: MediaKind,
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhancedMessageConfig {
    pub message_type: EnhancedKind,
    #[serde(alias = "text", alias = "content")]
    pub message: String,
    pub template: Option<TemplateConfig>,
    pub media: Option<MediaConfig>,
    pub typing: bool,
    pub typing_delay: u64,
    pub formatting: Formatting,
    pub wait_for_input: bool,
    pub save_as: Option<String>,
}

/// Message node with templates, media and the `now`/`date`/`time`/`userId` tokens.
pub struct EnhancedMessageExecutor {
    sender: Arc<dyn MessageSender>,
    max_typing_delay: Duration,
}

impl EnhancedMessageExecutor {
    pub fn new(sender: Arc<dyn MessageSender>, max_typing_delay: Duration) -> Self {
        Self { sender, max_typing_delay }
    }

    fn render(ctx: &NodeContext, template: &str) -> String {
        let now = Utc::now();
        render_tokens(template, |key| {
            ctx.lookup_string(key).or_else(|| match key {
                "now" => Some(now.to_rfc3339()),
                "date" => Some(now.format("%Y-%m-%d").to_string()),
                "time" => Some(now.format("%H:%M:%S").to_string()),
                "userId" => Some(ctx.user_id().to_string()),
                _ => None,
            })
        })
    }

    fn build(ctx: &NodeContext, cfg: &EnhancedMessageConfig) -> Result<OutboundMessage, NodeError> {
        let missing = |what: &str| {
            NodeError::InvalidConfig(format!("enhanced message `{}` needs a {}", ctx.node_id(), what))
        };
        match cfg.message_type {
            EnhancedKind::Text => {
                let text = cfg.formatting.apply(&Self::render(ctx, &cfg.message));
                if text.trim().is_empty() {
                    return Err(missing("message"));
                }
                Ok(OutboundMessage::text(text))
            }
            EnhancedKind::Template => {
                let template = cfg.template.as_ref().ok_or_else(|| missing("template"))?;
                Ok(OutboundMessage::Template {
                    name: template.name.clone(),
                    language: template.language.clone(),
                    parameters: template.parameters.iter().map(|p| Self::render(ctx, p)).collect(),
                })
            }
            EnhancedKind::Media => {
                let media = cfg.media.as_ref().ok_or_else(|| missing("media block"))?;
                Ok(OutboundMessage::Media {
                    media_type: media.media_type,
                    url: Self::render(ctx, &media.url),
                    caption: media.caption.as_deref().map(|c| Self::render(ctx, c)),
                    filename: media.filename.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for EnhancedMessageExecutor {
    fn name(&self) -> &'static str {
        "enhancedMessage"
    }

    #[tracing::instrument(name = "enhanced_message_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: EnhancedMessageConfig = ctx.config_as()?;
        if cfg.wait_for_input && ctx.is_answer() {
            return Ok(capture_answer(ctx, cfg.save_as.as_deref()));
        }
        let message = Self::build(ctx, &cfg)?;
        if cfg.typing {
            typing_pause(self.sender.as_ref(), ctx.address(), cfg.typing_delay, self.max_typing_delay).await;
        }
        Ok(deliver(self.sender.as_ref(), ctx, message, cfg.wait_for_input).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use crate::flow::thread::{ConversationStep, StepStatus};
    use crate::ports::RecordingMessageSender;
    use serde_json::Value;

    fn ctx(node_type: &str, config: Value) -> NodeContext {
        let mut ctx = NodeContext::dummy(FlowNode::new("n1", node_type, config));
        ctx.set_variable("name", json!("Ana"));
        ctx
    }

    #[tokio::test]
    async fn sends_rendered_and_formatted_text() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = MessageExecutor::new(sender.clone(), Duration::ZERO);
        let mut ctx = ctx(
            "message",
            json!({"message": "Hola {{name}}", "formatting": {"bold": true, "emoji": "👋"}}),
        );

        let result = exec.execute(&mut ctx).await.unwrap();
        assert!(result.success);
        assert!(!result.waiting_for_input);
        assert_eq!(result.output["text"], "👋 *Hola Ana*");
        assert_eq!(sender.texts().await, vec!["👋 *Hola Ana*".to_string()]);
    }

    #[tokio::test]
    async fn delivery_failure_becomes_failed_result() {
        let sender = Arc::new(RecordingMessageSender::failing());
        let exec = MessageExecutor::new(sender, Duration::ZERO);
        let mut ctx = ctx("message", json!({"message": "hi"}));

        let result = exec.execute(&mut ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("delivery failed"));
        assert_eq!(ctx.logs().len(), 1);
    }

    #[tokio::test]
    async fn question_waits_then_captures_answer() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = MessageExecutor::new(sender.clone(), Duration::ZERO);
        let config = json!({"message": "¿Cuántos años tienes?", "waitForInput": true, "saveAs": "age"});

        let mut first = ctx("message", config.clone());
        let asked = exec.execute(&mut first).await.unwrap();
        assert!(asked.waiting_for_input);

        let pending = ConversationStep::new("n1", "message", StepStatus::Pending);
        let mut second = ctx("message", config)
            .with_message(Some("20".into()))
            .with_previous_step(Some(pending));
        let answered = exec.execute(&mut second).await.unwrap();
        assert!(!answered.waiting_for_input);
        assert_eq!(second.get_variable("age"), Some(&json!("20")));
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_invalid_config() {
        let exec = MessageExecutor::new(Arc::new(RecordingMessageSender::new()), Duration::ZERO);
        let mut ctx = ctx("message", json!({}));
        assert!(matches!(exec.execute(&mut ctx).await, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn enhanced_message_knows_builtin_tokens() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = EnhancedMessageExecutor::new(sender.clone(), Duration::ZERO);
        let mut ctx = ctx("enhancedMessage", json!({"message": "{{name}} / {{userId}} / {{date}}"}));

        exec.execute(&mut ctx).await.unwrap();
        let text = sender.texts().await.remove(0);
        assert!(text.starts_with("Ana / user-1 / "));
        assert!(!text.contains("{{date}}"));
    }

    #[tokio::test]
    async fn enhanced_message_sends_templates_and_media() {
        let sender = Arc::new(RecordingMessageSender::new());
        let exec = EnhancedMessageExecutor::new(sender.clone(), Duration::ZERO);

        let mut template = ctx(
            "enhancedMessage",
            json!({"messageType": "template", "template": {"name": "order_update", "parameters": ["{{name}}"]}}),
        );
        exec.execute(&mut template).await.unwrap();

        let mut media = ctx(
            "enhancedMessage",
            json!({"messageType": "media", "media": {"type": "image", "url": "https://cdn.example.com/{name}.png"}}),
        );
        exec.execute(&mut media).await.unwrap();

        let sent = sender.sent().await;
        assert_eq!(
            sent[0].1,
            OutboundMessage::Template {
                name: "order_update".into(),
                language: "es".into(),
                parameters: vec!["Ana".into()],
            }
        );
        assert!(matches!(&sent[1].1, OutboundMessage::Media { url, .. } if url == "https://cdn.example.com/Ana.png"));

        let mut broken = ctx("enhancedMessage", json!({"messageType": "media"}));
        assert!(exec.execute(&mut broken).await.is_err());
    }
}
