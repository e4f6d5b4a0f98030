//! Condition evaluation shared by condition steps and conditional actions
//!
//! Two forms are accepted: a structured `{variable, operator, value}`
//! triple, or an `{expression}` string whose templates are rendered
//! before a single binary comparison is parsed out of it.

use serde_json::Value;

use watchflow_core::template;

use crate::error::{EngineError, Result};

/// Operators, longest first so expression parsing is unambiguous
const OPERATORS: [&str; 8] = ["contains", "matches", "==", "!=", "<=", ">=", "<", ">"];

/// Evaluate a condition config against the run context
pub fn evaluate(config: &Value, context: &Value) -> Result<bool> {
    if let Some(expression) = config.get("expression").and_then(Value::as_str) {
        return evaluate_expression(expression, context);
    }

    let variable = config
        .get("variable")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::validation("condition needs expression or variable"))?;
    let operator = config
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("==");
    let expected = config.get("value").cloned().unwrap_or(Value::Null);

    let actual = template::resolve_path(context, variable)
        .cloned()
        .unwrap_or(Value::Null);
    compare(operator, &actual, &expected)
}

/// Evaluate `lhs <op> rhs` with templates already rendered
pub fn evaluate_expression(expression: &str, context: &Value) -> Result<bool> {
    let rendered = template::render(expression, context);
    for op in OPERATORS {
        let token = format!(" {op} ");
        if let Some(idx) = rendered.find(&token) {
            let lhs = parse_operand(rendered[..idx].trim());
            let rhs = parse_operand(rendered[idx + token.len()..].trim());
            return compare(op, &lhs, &rhs);
        }
    }
    Err(EngineError::validation(format!(
        "no operator in condition expression: {expression:?}"
    )))
}

/// Apply one comparison operator
pub fn compare(operator: &str, left: &Value, right: &Value) -> Result<bool> {
    match operator {
        "==" => Ok(loose_eq(left, right)),
        "!=" => Ok(!loose_eq(left, right)),
        "<" | "<=" | ">" | ">=" => {
            let (l, r) = numeric_pair(left, right).ok_or_else(|| {
                EngineError::validation(format!(
                    "ordering comparison needs numbers, got {left} and {right}"
                ))
            })?;
            Ok(match operator {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                _ => l >= r,
            })
        }
        "contains" => Ok(contains(left, right)),
        "matches" => {
            let pattern = as_string(right);
            let re = regex::Regex::new(&pattern)
                .map_err(|e| EngineError::validation(format!("bad pattern {pattern:?}: {e}")))?;
            Ok(re.is_match(&as_string(left)))
        }
        other => Err(EngineError::validation(format!(
            "unknown condition operator: {other}"
        ))),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // "2" == 2 and similar cross-type comparisons
    match numeric_pair(left, right) {
        Some((l, r)) => l == r,
        None => as_string(left) == as_string(right),
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => s.contains(&as_string(right)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        Value::Object(map) => map.contains_key(&as_string(right)),
        _ => false,
    }
}

fn numeric_pair(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((as_number(left)?, as_number(right)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_operand(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str(raw) {
        return value;
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::String(unquoted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_operators() {
        let ctx = json!({"count": 5, "name": "alpha", "tags": ["a", "b"]});

        let check = |op: &str, var: &str, value: Value| {
            evaluate(&json!({"variable": var, "operator": op, "value": value}), &ctx)
                .expect("should evaluate")
        };

        assert!(check("==", "count", json!(5)));
        assert!(check("!=", "count", json!(6)));
        assert!(check("<", "count", json!(10)));
        assert!(check("<=", "count", json!(5)));
        assert!(check(">", "count", json!(1)));
        assert!(check(">=", "count", json!(5)));
        assert!(check("contains", "name", json!("alph")));
        assert!(check("contains", "tags", json!("b")));
        assert!(check("matches", "name", json!("^al.*a$")));
    }

    #[test]
    fn test_loose_equality_across_types() {
        assert!(compare("==", &json!("2"), &json!(2)).expect("evaluate"));
        assert!(compare("!=", &json!("x"), &json!(2)).expect("evaluate"));
    }

    #[test]
    fn test_expression_with_templates() {
        let ctx = json!({"extractedData": {"price": 42}});
        assert!(
            evaluate_expression("{{extractedData.price}} > 40", &ctx).expect("should evaluate")
        );
        assert!(
            !evaluate_expression("{{extractedData.price}} > 50", &ctx).expect("should evaluate")
        );
    }

    #[test]
    fn test_expression_string_comparison() {
        let ctx = json!({"status": "open"});
        assert!(evaluate_expression("{{status}} == open", &ctx).expect("should evaluate"));
    }

    #[test]
    fn test_missing_variable_resolves_null() {
        let ctx = json!({});
        let result = evaluate(
            &json!({"variable": "missing", "operator": "==", "value": null}),
            &ctx,
        )
        .expect("should evaluate");
        assert!(result);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let ctx = json!({});
        assert!(evaluate(&json!({}), &ctx).is_err());
        assert!(evaluate_expression("no operator here", &ctx).is_err());
        assert!(compare("<", &json!("abc"), &json!(1)).is_err());
        assert!(compare("~=", &json!(1), &json!(1)).is_err());
    }
}
