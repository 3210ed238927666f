use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// A versioned, declarative conversation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Declared variables with optional defaults seeded into every new thread.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<FlowVariable>,
    #[serde(default)]
    pub settings: FlowSettings,
    /// Overrides the "first node without incoming edges" rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<String>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Draft,
    #[default]
    Active,
    Inactive,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Executor-specific configuration, interpreted by the executor registered for `type`.
    #[serde(default, alias = "data")]
    pub config: Value,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
        }
    }

    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.config.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Branch label matched against the handle a node reports (`true`, `false`, a button id).
    #[serde(default, alias = "sourceHandle", alias = "condition", skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowVariable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowSettings {
    /// Conversation timeout in seconds, informational for channel adapters.
    pub timeout: Option<u64>,
    /// Upper bound on nodes executed in one chain; the engine default applies when unset.
    pub max_steps: Option<usize>,
    pub error_handling: ErrorHandling,
    /// When false, node log lines are only emitted at trace level.
    pub logging: bool,
    pub caching: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            max_steps: None,
            error_handling: ErrorHandling::Stop,
            logging: true,
            caching: false,
        }
    }
}

/// What the engine does after a node fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum ErrorHandling {
    /// Mark the thread as errored and stop.
    #[default]
    Stop,
    /// Record the error and continue at `nodeId`.
    #[serde(rename_all = "camelCase")]
    Fallback { node_id: String },
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
            status: FlowStatus::Active,
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            settings: FlowSettings::default(),
            start_node_id: None,
        }
    }

    pub fn add_node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(mut self, source: &str, target: &str, handle: Option<&str>) -> Self {
        self.edges.push(FlowEdge {
            id: Some(format!("{}-{}", source, target)),
            source: source.to_string(),
            target: target.to_string(),
            handle: handle.map(str::to_string),
        });
        self
    }

    pub fn add_variable(mut self, name: &str, default_value: Option<Value>) -> Self {
        self.variables.push(FlowVariable {
            name: name.to_string(),
            default_value,
            description: None,
        });
        self
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_start_node(mut self, node_id: &str) -> Self {
        self.start_node_id = Some(node_id.to_string());
        self
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Resolve where a conversation begins: the caller's choice, then the
    /// definition's own `startNodeId`, then the first node nothing points to.
    pub fn resolve_start_node(&self, requested: Option<&str>) -> Option<&FlowNode> {
        if let Some(id) = requested {
            return self.node(id);
        }
        if let Some(id) = self.start_node_id.as_deref() {
            return self.node(id);
        }
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes.iter().find(|n| !targets.contains(n.id.as_str()))
    }

    /// Pick the outgoing edge of `source`: one carrying `handle` first, then the
    /// first edge without a handle.
    pub fn next_node_for(&self, source: &str, handle: Option<&str>) -> Option<&str> {
        let outgoing = || self.edges.iter().filter(move |e| e.source == source);
        if let Some(handle) = handle {
            if let Some(edge) = outgoing().find(|e| e.handle.as_deref() == Some(handle)) {
                return Some(edge.target.as_str());
            }
        }
        outgoing()
            .find(|e| e.handle.is_none())
            .map(|e| e.target.as_str())
    }

    /// Defaults of declared variables.
    pub fn default_variables(&self) -> Map<String, Value> {
        self.variables
            .iter()
            .filter_map(|v| v.default_value.clone().map(|d| (v.name.clone(), d)))
            .collect()
    }

    /// Structural problems worth reporting before a flow goes live.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                issues.push(format!("duplicate node id `{}`", node.id));
            }
            if node.node_type.trim().is_empty() {
                issues.push(format!("node `{}` has no type", node.id));
            }
        }
        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                issues.push(format!("edge source `{}` is not a node", edge.source));
            }
            if self.node(&edge.target).is_none() {
                issues.push(format!("edge target `{}` is not a node", edge.target));
            }
        }
        if self.resolve_start_node(None).is_none() {
            issues.push("no start node could be resolved".to_string());
        }
        if let ErrorHandling::Fallback { node_id } = &self.settings.error_handling {
            if self.node(node_id).is_none() {
                issues.push(format!("fallback node `{}` is not a node", node_id));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> FlowDefinition {
        FlowDefinition::new("f1", "Sample")
            .add_node(FlowNode::new("check", "condition", json!({})))
            .add_node(FlowNode::new("yes", "message", json!({"message": "yes"})))
            .add_node(FlowNode::new("no", "message", json!({"message": "no"})))
            .add_node(FlowNode::new("bye", "message", json!({"message": "bye"})))
            .add_edge("check", "yes", Some("true"))
            .add_edge("check", "no", Some("false"))
            .add_edge("yes", "bye", None)
    }

    #[test]
    fn start_node_is_first_without_incoming_edges() {
        let flow = sample();
        assert_eq!(flow.resolve_start_node(None).map(|n| n.id.as_str()), Some("check"));
        assert_eq!(flow.resolve_start_node(Some("no")).map(|n| n.id.as_str()), Some("no"));
        assert!(flow.resolve_start_node(Some("missing")).is_none());

        let flow = sample().with_start_node("bye");
        assert_eq!(flow.resolve_start_node(None).map(|n| n.id.as_str()), Some("bye"));
    }

    #[test]
    fn a_cycle_has_no_implicit_start() {
        let flow = FlowDefinition::new("loop", "Loop")
            .add_node(FlowNode::new("a", "message", json!({})))
            .add_node(FlowNode::new("b", "message", json!({})))
            .add_edge("a", "b", None)
            .add_edge("b", "a", None);
        assert!(flow.resolve_start_node(None).is_none());
        assert_eq!(flow.validate(), vec!["no start node could be resolved".to_string()]);
    }

    #[test]
    fn edges_match_handles_then_fall_back() {
        let flow = sample();
        assert_eq!(flow.next_node_for("check", Some("false")), Some("no"));
        assert_eq!(flow.next_node_for("check", None), None);
        assert_eq!(flow.next_node_for("yes", Some("whatever")), Some("bye"));
        assert_eq!(flow.next_node_for("bye", None), None);
    }

    #[test]
    fn parses_camel_case_documents() {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "id": "f",
            "name": "F",
            "nodes": [{"id": "a", "type": "message", "data": {"message": "hi"}}],
            "edges": [{"source": "a", "target": "a", "sourceHandle": "x"}],
            "variables": [{"name": "lang", "defaultValue": "es"}],
            "settings": {"maxSteps": 5, "errorHandling": {"policy": "fallback", "nodeId": "a"}}
        }))
        .unwrap();

        assert_eq!(flow.version, 1);
        assert_eq!(flow.nodes[0].config["message"], "hi");
        assert_eq!(flow.edges[0].handle.as_deref(), Some("x"));
        assert_eq!(flow.settings.max_steps, Some(5));
        assert!(flow.settings.logging);
        assert_eq!(
            flow.settings.error_handling,
            ErrorHandling::Fallback { node_id: "a".into() }
        );
        assert_eq!(flow.default_variables().get("lang"), Some(&json!("es")));
    }

    #[test]
    fn validate_reports_dangling_edges() {
        let flow = sample().add_edge("no", "ghost", None);
        let issues = flow.validate();
        assert_eq!(issues, vec!["edge target `ghost` is not a node".to_string()]);
    }
}
