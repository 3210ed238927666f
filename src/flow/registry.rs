use std::{collections::BTreeMap, fmt, fs, path::Path, sync::Arc};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::flow::definition::FlowDefinition;

/// Registered flow definitions, keyed by flow id and then version.
///
/// Registering a new version never drops the older ones: threads started on
/// an earlier version keep running the graph they started with.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, BTreeMap<u32, Arc<FlowDefinition>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a flow under its `(id, version)`, replacing only that exact version.
    pub fn register_flow(&self, flow: FlowDefinition) -> Arc<FlowDefinition> {
        if flow.resolve_start_node(None).is_none() {
            warn!(flow_id = %flow.id, "flow has no resolvable start node");
        }
        let id = flow.id.clone();
        let flow = Arc::new(flow);
        let replaced = self
            .flows
            .entry(id.clone())
            .or_default()
            .insert(flow.version, flow.clone())
            .is_some();
        if replaced {
            warn!(flow_id = %id, version = flow.version, "flow version re-registered in place");
        }
        info!("Registered flow: {} (v{})", id, flow.version);
        flow
    }

    /// The latest registered version of `id`.
    pub fn get(&self, id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    pub fn get_version(&self, id: &str, version: u32) -> Option<Arc<FlowDefinition>> {
        self.flows
            .get(id)
            .and_then(|versions| versions.get(&version).cloned())
    }

    pub fn versions(&self, id: &str) -> Vec<u32> {
        self.flows
            .get(id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every version of `id`.
    pub fn remove_flow(&self, id: &str) -> bool {
        let removed = self.flows.remove(id).is_some();
        if removed {
            info!("Removed flow: {}", id);
        }
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Register every `.json`, `.yaml` and `.yml` flow in `dir`. Files that
    /// fail to parse are logged and skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, FlowError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| FlowError::IoError(format!("cannot read {}: {}", dir.display(), e)))?;
        let mut loaded = 0;
        for entry in entries {
            let path = entry.map_err(|e| FlowError::IoError(e.to_string()))?.path();
            if FlowFormat::from_path(&path).is_err() {
                continue;
            }
            match Self::load_flow_from_file(&path) {
                Ok(flow) => {
                    self.register_flow(flow);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), "skipping flow file: {}", e),
            }
        }
        Ok(loaded)
    }

    pub fn load_flow_from_file(path: &Path) -> Result<FlowDefinition, FlowError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FlowError::IoError(format!("read error: {}", e)))?;
        match FlowFormat::from_path(path)? {
            FlowFormat::Json => serde_json::from_str(&contents)
                .map_err(|e| FlowError::SerializationError(format!("JSON parse error: {}", e))),
            FlowFormat::Yaml => serde_yaml_bw::from_str(&contents)
                .map_err(|e| FlowError::SerializationError(format!("YAML parse error: {}", e))),
        }
    }

    pub fn save_flow_to_file(path: &Path, flow: &FlowDefinition) -> Result<(), FlowError> {
        let contents = match FlowFormat::from_path(path)? {
            FlowFormat::Json => serde_json::to_string_pretty(flow)
                .map_err(|e| FlowError::SerializationError(format!("{}", e)))?,
            FlowFormat::Yaml => serde_yaml_bw::to_string(flow)
                .map_err(|e| FlowError::SerializationError(format!("{}", e)))?,
        };
        fs::write(path, contents).map_err(|e| FlowError::IoError(format!("{}", e)))
    }
}

enum FlowFormat {
    Json,
    Yaml,
}

impl FlowFormat {
    fn from_path(path: &Path) -> Result<Self, FlowError> {
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "json" => Ok(FlowFormat::Json),
            "yaml" | "yml" => Ok(FlowFormat::Yaml),
            other => Err(FlowError::SerializationError(format!(
                "unsupported extension \"{}\" (expected .json, .yaml or .yml)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    IoError(String),
    SerializationError(String),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::IoError(msg) => write!(f, "I/O error: {}", msg),
            FlowError::SerializationError(msg) => write!(f, "Flow format error: {}", msg),
        }
    }
}

impl std::error::Error for FlowError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use serde_json::json;
    use tempfile::TempDir;

    const YAML_FLOW: &str = r#"
id: welcome
name: Welcome
version: 3
nodes:
  - id: hello
    type: message
    config:
      message: "Hola {{name}}"
edges: []
"#;

    #[test]
    fn new_versions_sit_beside_old_ones() {
        let registry = FlowRegistry::new();
        let mut flow = FlowDefinition::new("f", "F").add_node(FlowNode::new("a", "message", json!({})));
        registry.register_flow(flow.clone());
        flow.version = 2;
        flow.name = "F2".into();
        registry.register_flow(flow.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.versions("f"), vec![1, 2]);
        assert_eq!(registry.get("f").unwrap().version, 2);
        assert_eq!(registry.get_version("f", 1).unwrap().name, "F");
        assert!(registry.get_version("f", 3).is_none());

        flow.name = "F2 bis".into();
        registry.register_flow(flow);
        assert_eq!(registry.versions("f"), vec![1, 2]);
        assert_eq!(registry.get("f").unwrap().name, "F2 bis");

        assert!(registry.remove_flow("f"));
        assert!(registry.get("f").is_none());
        assert!(registry.get_version("f", 1).is_none());
        assert!(registry.versions("f").is_empty());
    }

    #[test]
    fn loads_yaml_and_json_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("welcome.yaml"), YAML_FLOW).unwrap();
        let json_flow = FlowDefinition::new("other", "Other").add_node(FlowNode::new("x", "typing", json!({})));
        FlowRegistry::save_flow_to_file(&dir.path().join("other.json"), &json_flow).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("broken.yml"), "id: [").unwrap();

        let registry = FlowRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(registry.ids(), vec!["other".to_string(), "welcome".to_string()]);
        let welcome = registry.get("welcome").unwrap();
        assert_eq!(welcome.version, 3);
        assert_eq!(welcome.nodes[0].config["message"], "Hola {{name}}");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = FlowRegistry::load_flow_from_file(Path::new("flow.toml")).unwrap_err();
        assert!(matches!(err, FlowError::IoError(_)));
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.toml");
        fs::write(&path, "x").unwrap();
        let err = FlowRegistry::load_flow_from_file(&path).unwrap_err();
        assert!(matches!(err, FlowError::SerializationError(_)));
    }
}
