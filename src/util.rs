use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// `{{ name }}` or `{name}`, with dotted paths allowed.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\{([A-Za-z0-9_.\-]+)\}").unwrap()
});

static WHOLE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\{([A-Za-z0-9_.\-]+)\})\s*$").unwrap()
});

/// Replace every token in `template` with the value returned by `lookup`.
/// Tokens `lookup` does not know are left in place.
pub fn render_tokens<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    TOKEN_RE
        .replace_all(template, |caps: &Captures| {
            let key = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(key).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn has_tokens(text: &str) -> bool {
    TOKEN_RE.is_match(text)
}

/// If `text` is nothing but one token, return its key.
pub fn whole_token(text: &str) -> Option<&str> {
    WHOLE_TOKEN_RE
        .captures(text)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str())
}

/// Render tokens inside every string of a JSON document.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => Value::String(render_tokens(s, lookup)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Text form used when a value is substituted into a message.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Look up `path` in `root`. An exact key wins; otherwise the path is split on
/// dots and walked through objects and array indices.
pub fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = root.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Numeric view of a value: numbers as-is, numeric strings parsed, booleans as 0/1.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Missing, null, empty string, false, zero, or an empty collection.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
    }
}
