pub mod condition;
pub mod database;
pub mod interaction;
pub mod manager;
pub mod message;
pub mod simple;
pub mod webhook;

use std::time::Instant;

use serde_json::{json, Value};

use crate::node::{NodeContext, NodeResult, LAST_USER_MESSAGE};
use crate::util::{render_tokens, resolve_value};

/// One `request` event per call to an external port.
pub(crate) fn log_port_call(port: &str, ctx: &NodeContext, ok: bool, started: Instant) {
    tracing::info!(
        target: "request",
        port,
        thread_id = ctx.thread_id(),
        node_id = ctx.node_id(),
        ok,
        latency_ms = started.elapsed().as_millis() as u64,
        "port call"
    );
}

/// Render `{{var}}` / `{var}` tokens against the context's variables.
pub(crate) fn render(ctx: &NodeContext, template: &str) -> String {
    render_tokens(template, |key| ctx.lookup_string(key))
}

/// Token-resolve every string inside a JSON document.
pub(crate) fn render_value(ctx: &NodeContext, value: &Value) -> Value {
    resolve_value(value, &|key: &str| ctx.lookup_string(key))
}

/// Store the user's reply under `save_as` (or `lastUserMessage`) and finish the node.
pub(crate) fn capture_answer(ctx: &mut NodeContext, save_as: Option<&str>) -> NodeResult {
    let key = save_as
        .filter(|k| !k.trim().is_empty())
        .unwrap_or(LAST_USER_MESSAGE)
        .to_string();
    let answer = ctx.answer().unwrap_or(Value::Null);
    ctx.set_variable(key.clone(), answer.clone());
    NodeResult::ok(json!({ "answer": answer, "savedAs": key }))
}
