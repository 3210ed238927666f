use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::{is_secret, SettingsSource, SETTINGS};
use crate::executor::ExecutorRegistry;
use crate::flow::{ConversationThread, FlowDefinition, FlowEngine, FlowRegistry, ThreadStatus};

/// Problems that would break a flow at runtime, including node types with no executor.
pub fn flow_issues(flow: &FlowDefinition, executors: &ExecutorRegistry) -> Vec<String> {
    let mut issues = flow.validate();
    for node in &flow.nodes {
        if !executors.contains(&node.node_type) {
            issues.push(format!("node `{}` uses unknown type `{}`", node.id, node.node_type));
        }
    }
    issues
}

/// Validate that the provided file is a loadable flow whose nodes can all run.
pub fn validate_flow_file(flow_file: &Path, executors: &ExecutorRegistry) -> Result<FlowDefinition> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }
    let flow = FlowRegistry::load_flow_from_file(flow_file)
        .with_context(|| format!("Invalid flow file: {}", flow_file.display()))?;

    let issues = flow_issues(&flow, executors);
    if !issues.is_empty() {
        for issue in &issues {
            warn!("{}: {}", flow_file.display(), issue);
            eprintln!("  - {}", issue);
        }
        bail!("{} problem(s) in {}", issues.len(), flow_file.display());
    }
    info!("✅ Valid flow `{}` (v{}): {}", flow.id, flow.version, flow_file.display());
    Ok(flow)
}

/// Validate, then copy the flow into `<root>/flows`.
pub fn deploy_flow_file(path: &Path, root: &Path, executors: &ExecutorRegistry) -> Result<PathBuf> {
    validate_flow_file(path, executors)?;
    let dest_folder = root.join("flows");
    fs::create_dir_all(&dest_folder)?;
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let dest = dest_folder.join(file_name);
    fs::copy(path, &dest)
        .with_context(|| format!("Failed to copy {} to {}", path.display(), dest.display()))?;
    info!("Deployed {} to {}", path.display(), dest.display());
    Ok(dest)
}

/// `(tag, executor name)` for every registered executor, sorted by tag.
pub fn list_executors(executors: &ExecutorRegistry) -> Vec<(String, &'static str)> {
    executors
        .tags()
        .into_iter()
        .filter_map(|tag| executors.get(&tag).map(|e| (tag, e.name())))
        .collect()
}

/// Parse `key=value`; the value is read as JSON when it parses, else kept as text.
pub fn parse_var(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got `{}`", raw);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty variable name in `{}`", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_vars(raw: &[String]) -> Result<Map<String, Value>> {
    raw.iter().map(|r| parse_var(r)).collect()
}

/// A setting value fit for the terminal; secrets keep at most their last four characters.
pub fn show_setting(key: &str, value: &str) -> String {
    if !is_secret(key) {
        return value.to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// `(key, shown value)` for every engine setting, `(default)` when unset.
pub async fn settings_report(source: &dyn SettingsSource) -> Vec<(&'static str, String)> {
    let mut report = Vec::with_capacity(SETTINGS.len());
    for (key, _) in SETTINGS {
        let shown = match source.get(key).await {
            Some(value) => show_setting(key, &value),
            None => "(default)".to_string(),
        };
        report.push((key, shown));
    }
    report
}

fn describe(thread: &ConversationThread) -> String {
    format!(
        "[{} | node {} | {} steps]",
        thread.status(),
        thread.current_node_id(),
        thread.history().len()
    )
}

/// Talk to a flow from the terminal until it finishes or stdin closes.
pub async fn run_chat(
    engine: &FlowEngine,
    flow_id: &str,
    user_id: &str,
    address: &str,
    variables: Map<String, Value>,
) -> Result<ConversationThread> {
    let mut thread = engine
        .start_conversation(user_id, address, flow_id, None, Some(variables))
        .await
        .with_context(|| format!("could not start flow `{}`", flow_id))?;
    println!("{}", describe(&thread));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while thread.is_active() {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        thread = engine.process_user_message(thread.id(), line, None).await?;
        println!("{}", describe(&thread));
    }

    match thread.status() {
        ThreadStatus::Error => {
            let reason = thread
                .last_step()
                .and_then(|s| s.error.clone())
                .unwrap_or_default();
            println!("❌ conversation stopped: {}", reason);
        }
        ThreadStatus::Completed => println!("✅ conversation completed"),
        _ => {}
    }
    Ok(thread)
}
