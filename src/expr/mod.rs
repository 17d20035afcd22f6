//! Expression helpers shared by triggers, edges and action executors.
//!
//! - [`condition`] evaluates boolean condition trees.
//! - [`interpolate`] substitutes `{{path}}` tokens in strings.

pub mod condition;
pub mod interpolate;

pub use condition::{evaluate, evaluate_value, ConditionGroup, ConditionLeaf, ConditionRule, GroupMode, Operator};
pub use interpolate::{interpolate, interpolate_value, resolve_value, value_to_string};

use serde_json::Value;

pub(crate) static NULL: Value = Value::Null;

/// Resolve a dotted path (`invoice.lines.0.amount`, `items[2]`) through
/// nested objects and arrays. A path with no segments resolves to nothing.
pub fn get_path_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.trim().replace('[', ".").replace(']', "");
    let mut segments = normalized.split('.').filter(|s| !s.is_empty()).peekable();
    segments.peek()?;
    let mut current = root;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Strip surrounding `{{ }}` from a single-token expression.
pub(crate) fn strip_token(expr: &str) -> Option<&str> {
    let trimmed = expr.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.len() >= 4 {
        let inner = &trimmed[2..trimmed.len() - 2];
        if inner.contains("{{") || inner.contains("}}") {
            return None;
        }
        Some(inner.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_value() {
        let root = json!({"invoice": {"lines": [{"amount": 10}, {"amount": 20}]}});
        assert_eq!(get_path_value(&root, "invoice.lines.1.amount"), Some(&json!(20)));
        assert_eq!(get_path_value(&root, "invoice.lines[0].amount"), Some(&json!(10)));
        assert_eq!(get_path_value(&root, "invoice.missing"), None);
        assert_eq!(get_path_value(&root, "invoice.lines.9"), None);
        assert_eq!(get_path_value(&root, ""), None);
        assert_eq!(get_path_value(&root, " . "), None);
    }

    #[test]
    fn test_strip_token() {
        assert_eq!(strip_token("{{ user.id }}"), Some("user.id"));
        assert_eq!(strip_token("{{a}} and {{b}}"), None);
        assert_eq!(strip_token("plain"), None);
        assert_eq!(strip_token("{{}}"), Some(""));
    }
}
