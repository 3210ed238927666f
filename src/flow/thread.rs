use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::util::lookup_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Paused => "paused",
            ThreadStatus::Completed => "completed",
            ThreadStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Error,
    Skipped,
}

/// Per-thread variables. Reads accept dotted paths (`user.email`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VariableStore(Map<String, Value>);

impl VariableStore {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.0, path)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn merge(&mut self, patch: Map<String, Value>) {
        self.0.extend(patch);
    }

    pub fn all(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for VariableStore {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// What the user sent when a step ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// One record per executed node, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStep {
    pub id: String,
    pub node_id: String,
    pub node_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub input: StepInput,
    #[serde(default)]
    pub output: Value,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ConversationStep {
    pub fn new(node_id: impl Into<String>, node_type: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            node_type: node_type.into(),
            timestamp: Utc::now(),
            input: StepInput::default(),
            output: Value::Null,
            status,
            duration_ms: 0,
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn with_input(mut self, input: StepInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn next_node_id(&self) -> Option<&str> {
        self.metadata.get("nextNodeId").and_then(Value::as_str)
    }
}

/// A single user's conversation through one flow.
///
/// Only the engine changes a thread; everyone else reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationThread {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) address: String,
    pub(crate) status: ThreadStatus,
    pub(crate) current_node_id: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
    #[serde(default)]
    pub(crate) metadata: Map<String, Value>,
    #[serde(default)]
    pub(crate) variables: VariableStore,
    #[serde(default)]
    pub(crate) history: Vec<ConversationStep>,
}

impl ConversationThread {
    pub(crate) fn new(user_id: &str, address: &str, current_node_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            address: address.to_string(),
            status: ThreadStatus::Active,
            current_node_id: current_node_id.to_string(),
            started_at: now,
            last_activity: now,
            metadata: Map::new(),
            variables: VariableStore::new(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }

    pub fn current_node_id(&self) -> &str {
        &self.current_node_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn flow_id(&self) -> Option<&str> {
        self.metadata.get("flowId").and_then(Value::as_str)
    }

    /// The flow version the thread was started on.
    pub fn flow_version(&self) -> Option<u32> {
        self.metadata
            .get("flowVersion")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn history(&self) -> &[ConversationStep] {
        &self.history
    }

    pub fn last_step(&self) -> Option<&ConversationStep> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_round_trips_through_json() {
        let mut thread = ConversationThread::new("u1", "+34600000000", "start");
        thread.metadata.insert("flowId".into(), json!("f1"));
        thread.variables.set("name", json!("Ana"));
        thread.history.push(
            ConversationStep::new("start", "message", StepStatus::Completed)
                .with_output(json!({"text": "hi"}))
                .with_metadata("nextNodeId", json!("end")),
        );

        let text = serde_json::to_string(&thread).unwrap();
        assert!(text.contains("\"currentNodeId\":\"start\""));
        let back: ConversationThread = serde_json::from_str(&text).unwrap();
        assert_eq!(back, thread);
        assert_eq!(back.flow_id(), Some("f1"));
        assert_eq!(back.last_step().and_then(|s| s.next_node_id()), Some("end"));
    }

    #[test]
    fn variable_store_merges_and_reads_paths() {
        let mut vars = VariableStore::new();
        vars.set("user", json!({"email": "a@b.c"}));
        vars.merge(Map::from_iter([("age".to_string(), json!(20))]));
        assert_eq!(vars.lookup("user.email"), Some(&json!("a@b.c")));
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.remove("age"), Some(json!(20)));
        assert!(!vars.contains("age"));
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(serde_json::to_value(ThreadStatus::Completed).unwrap(), json!("completed"));
        assert_eq!(serde_json::to_value(StepStatus::Pending).unwrap(), json!("pending"));
        assert_eq!(ThreadStatus::Error.to_string(), "error");
    }
}
