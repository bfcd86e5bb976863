use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{MessagePayload, Template};

/// Resolve a dotted path (`order.listing.title`) against job data. Arrays
/// accept numeric segments. Anything unresolvable renders as empty.
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Null and composites have no sensible inline form.
        _ => String::new(),
    }
}

/// Substitute every `{{path}}` placeholder in `template`. Unterminated
/// braces pass through unchanged.
pub fn render_string(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let path = after_open[..close].trim();
                if let Some(value) = lookup(data, path) {
                    out.push_str(&render_value(value));
                }
                rest = &after_open[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Pick the best language variant: recipient language, then the configured
/// default, then the first available entry (language maps are ordered, so
/// the last resort is deterministic).
pub fn pick_language<'a>(
    map: &'a BTreeMap<String, String>,
    lang: &str,
    default_lang: &str,
) -> Option<&'a str> {
    map.get(lang)
        .or_else(|| map.get(default_lang))
        .or_else(|| map.values().next())
        .map(|s| s.as_str())
}

/// Render a template's title and body for one recipient. A missing variant
/// renders empty; the caller decides whether an empty message is sendable.
pub fn render_message(
    template: &Template,
    lang: &str,
    default_lang: &str,
    data: &Value,
    action_url: Option<String>,
) -> MessagePayload {
    let title = pick_language(&template.title, lang, default_lang)
        .map(|t| render_string(t, data))
        .unwrap_or_default();
    let body = pick_language(&template.body, lang, default_lang)
        .map(|b| render_string(b, data))
        .unwrap_or_default();
    MessagePayload {
        title,
        body,
        action_url,
    }
}
