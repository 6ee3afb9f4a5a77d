//! Guard expression evaluation.
//!
//! Guards are single-operator expressions over template-resolved operands:
//! `{{ctx.partySize}} > 8`, `{{tool.ok}} == true`, `{{ctx.a}} && {{ctx.b}}`.
//! The literal `else` is always true. An expression with no operator
//! evaluates by truthiness of its resolved value. There is no precedence;
//! compound conditions must be authored as separate guards.

use crate::template::{resolve_str, TemplateEnv};
use serde_json::Value;

const OPERATORS: [&str; 8] = [">=", "<=", "==", "!=", "&&", "||", ">", "<"];

/// Evaluate a guard expression against the context and an optional tool
/// result environment.
pub fn evaluate(expr: &str, ctx: &Value, tool: Option<&Value>) -> bool {
    let trimmed = expr.trim();
    if trimmed == "else" {
        return true;
    }

    let env = TemplateEnv {
        ctx: Some(ctx),
        slot: None,
        tool,
    };

    match split_on_operator(trimmed) {
        Some((lhs, op, rhs)) => {
            let left = resolve_str(lhs.trim(), &env);
            let right = resolve_str(rhs.trim(), &env);
            apply(op, &left, &right)
        }
        None => truthy(&resolve_str(trimmed, &env)),
    }
}

/// Find the first operator occurrence, scanning left to right. Two-character
/// operators are matched before their one-character prefixes.
fn split_on_operator(expr: &str) -> Option<(&str, &str, &str)> {
    let bytes = expr.as_bytes();
    for i in 0..bytes.len() {
        for op in OPERATORS {
            if expr[i..].starts_with(op) {
                return Some((&expr[..i], op, &expr[i + op.len()..]));
            }
        }
    }
    None
}

fn apply(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "&&" => truthy(left) && truthy(right),
        "||" => truthy(left) || truthy(right),
        _ => compare(op, left, right),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    // Numeric ordering when both sides are numbers, string ordering otherwise.
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            ">=" => l >= r,
            "<=" => l <= r,
            ">" => l > r,
            "<" => l < r,
            "==" => (l - r).abs() < f64::EPSILON,
            "!=" => (l - r).abs() >= f64::EPSILON,
            _ => false,
        };
    }

    let l = as_text(left);
    let r = as_text(right);
    match op {
        ">=" => l >= r,
        "<=" => l <= r,
        ">" => l > r,
        "<" => l < r,
        "==" => l == r,
        "!=" => l != r,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
