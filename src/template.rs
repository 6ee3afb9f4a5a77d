//! Template interpolation over strings and nested structures.
//!
//! Flow authors reference session data with `{{ctx.path}}`, `{{slot.path}}`
//! and `{{tool.path}}` placeholders inside action text, guard expressions
//! and tool argument templates. Resolution substitutes every placeholder,
//! then leniently re-types the result: an exact JSON literal parses as that
//! literal, a pure integer or decimal string coerces to a number, anything
//! else stays a string.

use crate::paths::get_path;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

/// Lookup environments for one resolution pass. Absent environments resolve
/// their placeholders to the empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEnv<'a> {
    pub ctx: Option<&'a Value>,
    pub slot: Option<&'a Value>,
    pub tool: Option<&'a Value>,
}

impl<'a> TemplateEnv<'a> {
    pub fn with_ctx(ctx: &'a Value) -> Self {
        Self {
            ctx: Some(ctx),
            ..Self::default()
        }
    }

    fn root(&self, name: &str) -> Option<&'a Value> {
        match name {
            "ctx" => self.ctx,
            "slot" => self.slot,
            "tool" => self.tool,
            _ => None,
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(ctx|slot|tool)\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Resolve a single template string to a value.
pub fn resolve_str(input: &str, env: &TemplateEnv) -> Value {
    let replaced = placeholder_re().replace_all(input, |caps: &Captures| {
        match env.root(&caps[1]).and_then(|root| get_path(root, &caps[2])) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    coerce_scalar(&replaced)
}

/// Resolve a template value of any shape. Strings are interpolated, arrays
/// and objects recurse, everything else passes through.
pub fn resolve_value(input: &Value, env: &TemplateEnv) -> Value {
    match input {
        Value::String(s) => resolve_str(s, env),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a resolved value as presentation text (for `say`/`ask` events).
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn coerce_scalar(s: &str) -> Value {
    if let Ok(parsed) = serde_json::from_str::<Value>(s) {
        return parsed;
    }
    if is_integer(s) {
        if let Ok(n) = s.parse::<i64>() {
            return Value::from(n);
        }
    }
    if is_decimal(s) {
        if let Ok(n) = s.parse::<f64>() {
            return Value::from(n);
        }
    }
    Value::String(s.to_string())
}

fn is_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_decimal(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    let Some((int, frac)) = body.split_once('.') else {
        return false;
    };
    !int.is_empty()
        && !frac.is_empty()
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}
