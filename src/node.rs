use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, trace, warn};

use crate::flow::definition::FlowNode;
use crate::flow::thread::{ConversationStep, StepStatus, VariableStore};
use crate::ports::PortError;
use crate::util::value_to_string;

/// Node type tags understood by the built-in executors.
pub mod tags {
    pub const MESSAGE: &str = "message";
    pub const ENHANCED_MESSAGE: &str = "enhancedMessage";
    pub const CONDITION: &str = "condition";
    pub const SMART_CONDITION: &str = "smartCondition";
    pub const ADVANCED_CONDITION: &str = "advancedCondition";
    pub const DATABASE: &str = "database";
    pub const HUBSPOT: &str = "hubspot";
    pub const WEBHOOK: &str = "webhook";
    pub const HTTP_REQUEST: &str = "httpRequest";
    pub const BUTTONS: &str = "buttons";
    pub const SURVEY: &str = "survey";
    pub const LOCATION: &str = "location";
    pub const INTERACTIVE: &str = "interactive";
    pub const LIST: &str = "list";
    pub const TIMEOUT: &str = "timeout";
    pub const TYPING: &str = "typing";
    pub const TAG: &str = "tag";
    pub const CUSTOMER_STAGE: &str = "customerStage";
    pub const ASSIGNMENT: &str = "assignment";
}

/// Node types that always wait for a user reply before they run.
pub const INPUT_REQUIRING_TYPES: &[&str] = &[
    tags::BUTTONS,
    tags::SURVEY,
    tags::LOCATION,
    tags::INTERACTIVE,
    tags::LIST,
];

/// Variable written when an answer node has no `saveAs`.
pub const LAST_USER_MESSAGE: &str = "lastUserMessage";

/// Whether the engine must stop before this node and wait for the next user message.
///
/// Plain message nodes only block when they ask a question (`waitForInput: true`).
pub fn requires_input(node: &FlowNode) -> bool {
    match node.node_type.as_str() {
        tags::MESSAGE | tags::ENHANCED_MESSAGE => node
            .config
            .get("waitForInput")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        other => INPUT_REQUIRING_TYPES.contains(&other),
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError>;
}

impl fmt::Debug for dyn NodeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeExecutor({})", self.name())
    }
}

/// What an executor hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub waiting_for_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variable patch merged into the thread after a successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    /// Edge handle used when no explicit next node was chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl NodeResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, output: Value) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_next(mut self, node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(node_id.into());
        self
    }

    pub fn with_next_opt(mut self, node_id: Option<String>) -> Self {
        if node_id.is_some() {
            self.next_node_id = node_id;
        }
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn waiting(mut self) -> Self {
        self.waiting_for_input = true;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_variables(mut self, patch: Map<String, Value>) -> Self {
        self.variables.get_or_insert_with(Map::new).extend(patch);
        self
    }
}

#[derive(Debug)]
pub enum NodeError {
    InvalidConfig(String),
    MissingVariable(String),
    Port(PortError),
    ExecutionFailed(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidConfig(msg) => write!(f, "Invalid node configuration: {}", msg),
            NodeError::MissingVariable(name) => write!(f, "Missing variable: {}", name),
            NodeError::Port(err) => write!(f, "External call failed: {}", err),
            NodeError::ExecutionFailed(msg) => write!(f, "Processing error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Port(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PortError> for NodeError {
    fn from(err: PortError) -> Self {
        NodeError::Port(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-execution view handed to a node executor.
///
/// The context owns a copy of the thread variables. The engine merges them
/// back only when the executor succeeds, so a failing node leaves the thread
/// untouched.
#[derive(Debug, Clone)]
pub struct NodeContext {
    thread_id: String,
    user_id: String,
    address: String,
    node: FlowNode,
    variables: VariableStore,
    message: Option<String>,
    input: Option<Value>,
    previous_step: Option<ConversationStep>,
    scheduled_next: Option<String>,
    logs: Vec<LogEntry>,
    verbose: bool,
}

impl NodeContext {
    pub fn new(
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        address: impl Into<String>,
        node: FlowNode,
        variables: VariableStore,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            address: address.into(),
            node,
            variables,
            message: None,
            input: None,
            previous_step: None,
            scheduled_next: None,
            logs: Vec::new(),
            verbose: true,
        }
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn with_input(mut self, input: Option<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_previous_step(mut self, step: Option<ConversationStep>) -> Self {
        self.previous_step = step;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The WhatsApp address (phone number) of the conversation partner.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn node(&self) -> &FlowNode {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn previous_step(&self) -> Option<&ConversationStep> {
        self.previous_step.as_ref()
    }

    /// True when this node asked a question on its previous run and the
    /// current message is the reply.
    pub fn is_answer(&self) -> bool {
        self.previous_step
            .as_ref()
            .map(|step| step.node_id == self.node.id && step.status == StepStatus::Pending)
            .unwrap_or(false)
    }

    /// The incoming reply, preferring structured input over the raw text.
    pub fn answer(&self) -> Option<Value> {
        self.input
            .clone()
            .or_else(|| self.message.as_ref().map(|m| Value::String(m.clone())))
    }

    /// Deserialize the node configuration into an executor-specific shape.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        let config = if self.node.config.is_null() {
            Value::Object(Map::new())
        } else {
            self.node.config.clone()
        };
        serde_json::from_value(config).map_err(|e| {
            NodeError::InvalidConfig(format!("node `{}` ({}): {}", self.node.id, self.node.node_type, e))
        })
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.lookup(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.set(key, value);
    }

    pub fn remove_variable(&mut self, key: &str) -> Option<Value> {
        self.variables.remove(key)
    }

    /// String form of a variable for template rendering.
    pub fn lookup_string(&self, key: &str) -> Option<String> {
        self.variables.lookup(key).map(value_to_string)
    }

    /// Ask the engine to continue with `node_id` unless the result names its own next node.
    pub fn schedule_next(&mut self, node_id: impl Into<String>) {
        self.scheduled_next = Some(node_id.into());
    }

    pub fn scheduled_next(&self) -> Option<&str> {
        self.scheduled_next.as_deref()
    }

    /// Emit a log line and attach it to the step this execution produces.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let node_id = self.node.id.as_str();
        let thread_id = self.thread_id.as_str();
        if self.verbose {
            match level {
                LogLevel::Trace => trace!(thread_id, node_id, "{}", message),
                LogLevel::Debug => debug!(thread_id, node_id, "{}", message),
                LogLevel::Info => info!(thread_id, node_id, "{}", message),
                LogLevel::Warn => warn!(thread_id, node_id, "{}", message),
                LogLevel::Error => error!(thread_id, node_id, "{}", message),
            }
        } else {
            trace!(thread_id, node_id, ?level, "{}", message);
        }
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Hand the working copy back to the engine.
    pub fn into_parts(self) -> (VariableStore, Option<String>, Vec<LogEntry>) {
        (self.variables, self.scheduled_next, self.logs)
    }
}

#[cfg(test)]
impl NodeContext {
    pub fn dummy(node: FlowNode) -> Self {
        NodeContext::new("thread-1", "user-1", "+34600000000", node, VariableStore::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_nodes_block_only_when_asking() {
        let plain = FlowNode::new("m1", tags::MESSAGE, json!({"message": "hi"}));
        let asking = FlowNode::new("m2", tags::MESSAGE, json!({"message": "age?", "waitForInput": true}));
        let buttons = FlowNode::new("b1", tags::BUTTONS, json!({}));
        let db = FlowNode::new("d1", tags::DATABASE, json!({}));

        assert!(!requires_input(&plain));
        assert!(requires_input(&asking));
        assert!(requires_input(&buttons));
        assert!(!requires_input(&db));
    }

    #[test]
    fn answer_detection_uses_previous_pending_step() {
        let node = FlowNode::new("ask", tags::MESSAGE, json!({"waitForInput": true}));
        let pending = ConversationStep::new("ask", tags::MESSAGE, StepStatus::Pending);
        let other = ConversationStep::new("other", tags::MESSAGE, StepStatus::Pending);

        let ctx = NodeContext::dummy(node.clone()).with_previous_step(Some(pending));
        assert!(ctx.is_answer());

        let ctx = NodeContext::dummy(node).with_previous_step(Some(other));
        assert!(!ctx.is_answer());
    }

    #[test]
    fn logs_are_collected_even_when_quiet() {
        let node = FlowNode::new("n", tags::TAG, Value::Null);
        let mut ctx = NodeContext::dummy(node).with_verbose(false);
        ctx.log(LogLevel::Info, "hello");
        ctx.set_variable("a", json!(1));
        ctx.schedule_next("next");

        let (vars, next, logs) = ctx.into_parts();
        assert_eq!(vars.get("a"), Some(&json!(1)));
        assert_eq!(next.as_deref(), Some("next"));
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Info);
    }

    #[test]
    fn null_config_parses_as_empty_object() {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Cfg {
            text: String,
        }
        let ctx = NodeContext::dummy(FlowNode::new("n", tags::MESSAGE, Value::Null));
        let cfg: Cfg = ctx.config_as().unwrap();
        assert_eq!(cfg.text, "");
    }

    #[test]
    fn result_builders_merge_variables() {
        let result = NodeResult::ok(json!({}))
            .with_variable("a", json!(1))
            .with_variables(Map::from_iter([("b".to_string(), json!(2))]))
            .with_next_opt(None)
            .with_handle("true");
        let vars = result.variables.unwrap();
        assert_eq!(vars.len(), 2);
        assert!(result.next_node_id.is_none());
        assert_eq!(result.handle.as_deref(), Some("true"));
    }
}
