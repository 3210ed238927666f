use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::MessageSender;
use crate::process::message::typing_pause;
use crate::process::{render, render_value};
use crate::util::value_to_string;

const DEFAULT_TYPING_MS: u64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingNodeConfig {
    /// Milliseconds.
    #[serde(alias = "duration")]
    pub delay: Option<u64>,
}

/// Shows the typing indicator for a while, then moves on.
pub struct TypingExecutor {
    sender: Arc<dyn MessageSender>,
    max_delay: Duration,
}

impl TypingExecutor {
    pub fn new(sender: Arc<dyn MessageSender>, max_delay: Duration) -> Self {
        Self { sender, max_delay }
    }
}

#[async_trait]
impl NodeExecutor for TypingExecutor {
    fn name(&self) -> &'static str {
        "typing"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: TypingNodeConfig = ctx.config_as()?;
        let delay_ms = cfg.delay.unwrap_or(DEFAULT_TYPING_MS);
        typing_pause(self.sender.as_ref(), ctx.address(), delay_ms, self.max_delay).await;
        let applied = Duration::from_millis(delay_ms).min(self.max_delay);
        Ok(NodeResult::ok(json!({ "delayMs": applied.as_millis() as u64 })))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagAction {
    #[default]
    Add,
    Remove,
    Set,
}

/// ```yaml
/// - id: mark_lead
///   type: tag
///   config:
///     action: add
///     tags: ["lead", "{{campaign}}"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagNodeConfig {
    pub action: TagAction,
    #[serde(alias = "tag")]
    pub tags: Vec<String>,
    pub variable: Option<String>,
}

/// Maintains a de-duplicated list of tags in a thread variable (`tags` by default).
pub struct TagExecutor;

#[async_trait]
impl NodeExecutor for TagExecutor {
    fn name(&self) -> &'static str {
        "tag"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: TagNodeConfig = ctx.config_as()?;
        let variable = cfg.variable.clone().unwrap_or_else(|| "tags".to_string());
        let requested: Vec<String> = cfg
            .tags
            .iter()
            .map(|t| render(ctx, t).trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let mut current: Vec<String> = match (cfg.action, ctx.get_variable(&variable)) {
            (TagAction::Set, _) => Vec::new(),
            (_, Some(Value::Array(items))) => items.iter().map(value_to_string).collect(),
            (_, Some(Value::String(s))) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        };
        match cfg.action {
            TagAction::Add | TagAction::Set => {
                for tag in requested {
                    if !current.contains(&tag) {
                        current.push(tag);
                    }
                }
            }
            TagAction::Remove => current.retain(|t| !requested.contains(t)),
        }

        ctx.set_variable(variable.clone(), json!(current));
        Ok(NodeResult::ok(json!({ "action": cfg.action, "tags": current, "variable": variable })))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerStageNodeConfig {
    pub stage: String,
    pub variable: Option<String>,
}

/// Moves the customer to a pipeline stage and appends the change to `stageHistory`.
pub struct CustomerStageExecutor;

#[async_trait]
impl NodeExecutor for CustomerStageExecutor {
    fn name(&self) -> &'static str {
        "customerStage"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: CustomerStageNodeConfig = ctx.config_as()?;
        let stage = render(ctx, &cfg.stage);
        if stage.trim().is_empty() {
            return Err(NodeError::InvalidConfig(format!("node `{}` has no stage", ctx.node_id())));
        }
        let variable = cfg.variable.unwrap_or_else(|| "customerStage".to_string());
        let previous = ctx.get_variable(&variable).cloned().unwrap_or(Value::Null);
        let changed_at = Utc::now().to_rfc3339();

        let mut history = match ctx.get_variable("stageHistory") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        history.push(json!({ "from": previous, "to": stage, "at": changed_at }));

        ctx.set_variable(variable, json!(stage));
        ctx.set_variable("stageHistory", Value::Array(history));
        ctx.log(LogLevel::Info, format!("customer stage -> {}", stage));
        Ok(NodeResult::ok(json!({ "previousStage": previous, "stage": stage, "changedAt": changed_at })))
    }
}

/// ```yaml
/// - id: handoff
///   type: assignment
///   config:
///     agent: "maria"
///     team: "ventas"
///     variables:
///       handoffReason: "{{lastUserMessage}}"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentNodeConfig {
    pub agent: Option<String>,
    pub team: Option<String>,
    pub variables: Map<String, Value>,
}

/// Hands the conversation to an agent or team and sets templated variables.
pub struct AssignmentExecutor;

#[async_trait]
impl NodeExecutor for AssignmentExecutor {
    fn name(&self) -> &'static str {
        "assignment"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: AssignmentNodeConfig = ctx.config_as()?;
        let mut patch = Map::new();
        for (key, value) in &cfg.variables {
            patch.insert(key.clone(), render_value(ctx, value));
        }
        if let Some(agent) = cfg.agent.as_deref() {
            patch.insert("assignedAgent".into(), json!(render(ctx, agent)));
        }
        if let Some(team) = cfg.team.as_deref() {
            patch.insert("assignedTeam".into(), json!(render(ctx, team)));
        }
        if patch.is_empty() {
            return Err(NodeError::InvalidConfig(format!(
                "assignment node `{}` sets nothing",
                ctx.node_id()
            )));
        }
        patch.insert("assignedAt".into(), json!(Utc::now().to_rfc3339()));
        Ok(NodeResult::ok(Value::Object(patch.clone())).with_variables(patch))
    }
}
