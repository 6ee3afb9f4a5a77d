//! Dotted-path access into JSON values.
//!
//! The session context is a nested `serde_json::Value` tree addressed by
//! dotted paths (`contact.phone`). Lookups walk objects only; any other
//! value type terminates the walk.

use serde_json::{Map, Value};

/// Look up `path` inside `root`. Returns `None` when any segment is missing
/// or a non-object is hit before the last segment.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set `path` inside `root` to `value`, creating intermediate objects as
/// needed. Non-object intermediates are replaced.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            ensure_object(root).insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = ensure_object(root)
                .entry(head.to_string())
                .or_insert(Value::Null);
            set_path(child, rest, value);
        }
    }
}

/// Deep-merge `patch` into `dst`. Objects merge key-by-key recursively;
/// everything else overwrites.
pub fn deep_merge(dst: &mut Value, patch: &Value) {
    match (dst, patch) {
        (Value::Object(dst_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match dst_map.get_mut(key) {
                    Some(slot) if slot.is_object() && patch_value.is_object() => {
                        deep_merge(slot, patch_value);
                    }
                    _ => {
                        dst_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (dst, patch) => *dst = patch.clone(),
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_nested() {
        let v = json!({"contact": {"phone": "555-1234"}});
        assert_eq!(get_path(&v, "contact.phone"), Some(&json!("555-1234")));
        assert_eq!(get_path(&v, "contact.email"), None);
        assert_eq!(get_path(&v, "contact.phone.digits"), None);
    }

    #[test]
    fn set_creates_intermediates() {
        let mut v = json!({});
        set_path(&mut v, "contact.name", json!("John Doe"));
        set_path(&mut v, "contact.phone", json!("555-1234"));
        set_path(&mut v, "partySize", json!(4));
        assert_eq!(
            v,
            json!({
                "contact": {"name": "John Doe", "phone": "555-1234"},
                "partySize": 4
            })
        );
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let mut v = json!({"contact": "nope"});
        set_path(&mut v, "contact.name", json!("Jane"));
        assert_eq!(v, json!({"contact": {"name": "Jane"}}));
    }

    #[test]
    fn merge_is_recursive() {
        let mut dst = json!({"contact": {"name": "John"}, "partySize": 2});
        deep_merge(&mut dst, &json!({"contact": {"phone": "555"}, "partySize": 4}));
        assert_eq!(
            dst,
            json!({"contact": {"name": "John", "phone": "555"}, "partySize": 4})
        );
    }

    #[test]
    fn merge_overwrites_mismatched_shapes() {
        let mut dst = json!({"a": {"b": 1}});
        deep_merge(&mut dst, &json!({"a": [1, 2]}));
        assert_eq!(dst, json!({"a": [1, 2]}));
    }
}
