// src/schema.rs

use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Error};
use schemars::schema_for;
use serde_json::Value;

use crate::flow::{ConversationThread, FlowDefinition};
use crate::node::NodeResult;

pub fn flow_schema() -> Value {
    serde_json::to_value(schema_for!(FlowDefinition)).unwrap_or(Value::Null)
}

/// Write `flow.schema.json`, `thread.schema.json` and `node-result.schema.json`
/// into `out_dir`, returning the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let schemas = [
        ("flow.schema.json", serde_json::to_string_pretty(&schema_for!(FlowDefinition))?),
        ("thread.schema.json", serde_json::to_string_pretty(&schema_for!(ConversationThread))?),
        ("node-result.schema.json", serde_json::to_string_pretty(&schema_for!(NodeResult))?),
    ];

    let mut written = Vec::new();
    for (name, json) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
