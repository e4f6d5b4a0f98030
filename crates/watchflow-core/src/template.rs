//! Template interpolation
//!
//! Any string field of an action or step config may contain
//! `{{path.to.value}}` placeholders. Resolution walks the dotted path in
//! the run context; unresolved placeholders are left literal. Handlers
//! never parse templates themselves.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-\[\]]+)\s*\}\}").expect("valid regex"))
}

/// Walk a dotted path (`a.b.c`, array indices as bare integers) in a value
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Render one string: substitute every resolvable placeholder
///
/// Strings substitute raw (no surrounding quotes); other values render as
/// compact JSON. Placeholders that do not resolve stay literal.
pub fn render(template: &str, context: &Value) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match resolve_path(context, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render every string found anywhere inside a JSON value
pub fn render_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_string_path() {
        let ctx = json!({"extractedData": {"title": "A"}});
        assert_eq!(render("Got {{extractedData.title}}", &ctx), "Got A");
    }

    #[test]
    fn test_render_non_string_as_json() {
        let ctx = json!({"count": 3, "flag": true});
        assert_eq!(render("{{count}}/{{flag}}", &ctx), "3/true");
    }

    #[test]
    fn test_unresolved_placeholder_stays_literal() {
        let ctx = json!({});
        assert_eq!(render("v={{missing.path}}", &ctx), "v={{missing.path}}");
    }

    #[test]
    fn test_array_index_path() {
        let ctx = json!({"items": ["a", "b", "c"]});
        assert_eq!(render("{{items.1}}", &ctx), "b");
    }

    #[test]
    fn test_render_value_recurses() {
        let ctx = json!({"action_notify": {"id": "m7"}});
        let body = json!({"v": "{{action_notify.id}}", "nested": ["{{action_notify.id}}"]});
        let rendered = render_value(&body, &ctx);
        assert_eq!(rendered, json!({"v": "m7", "nested": ["m7"]}));
    }

    #[test]
    fn test_resolve_path_through_array() {
        let ctx = json!({"a": [{"b": 1}]});
        assert_eq!(resolve_path(&ctx, "a.0.b"), Some(&json!(1)));
        assert_eq!(resolve_path(&ctx, "a.1.b"), None);
    }
}
