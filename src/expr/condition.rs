//! Condition evaluator.
//!
//! A condition is a recursive tree of groups and leaves. Evaluation is total:
//! missing fields resolve to null, and unknown operators, malformed rules and
//! type mismatches all evaluate to `false`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{get_path_value, strip_token, NULL};

/// How a group combines its rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    #[default]
    All,
    Any,
    None,
}

/// A group of rules combined by [`GroupMode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub mode: GroupMode,
    pub rules: Vec<ConditionRule>,
}

/// One rule inside a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionRule {
    Group(ConditionGroup),
    Leaf(ConditionLeaf),
    /// Anything that is neither a group nor a leaf. Always false.
    Malformed(Value),
}

/// A single comparison `field <operator> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLeaf {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    IsEmpty,
    IsNotEmpty,
    InList,
    Unknown(String),
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Operator::Equals,
            "not_equals" | "ne" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "greater_than" | "gt" => Operator::GreaterThan,
            "less_than" | "lt" => Operator::LessThan,
            "greater_than_or_equal" | "gte" => Operator::GreaterThanOrEqual,
            "less_than_or_equal" | "lte" => Operator::LessThanOrEqual,
            "is_empty" => Operator::IsEmpty,
            "is_not_empty" => Operator::IsNotEmpty,
            "in_list" | "in" => Operator::InList,
            _ => Operator::Unknown(raw),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Equals => "equals".to_string(),
            Operator::NotEquals => "not_equals".to_string(),
            Operator::Contains => "contains".to_string(),
            Operator::GreaterThan => "greater_than".to_string(),
            Operator::LessThan => "less_than".to_string(),
            Operator::GreaterThanOrEqual => "greater_than_or_equal".to_string(),
            Operator::LessThanOrEqual => "less_than_or_equal".to_string(),
            Operator::IsEmpty => "is_empty".to_string(),
            Operator::IsNotEmpty => "is_not_empty".to_string(),
            Operator::InList => "in_list".to_string(),
            Operator::Unknown(raw) => raw,
        }
    }
}

impl ConditionGroup {
    pub fn all(rules: Vec<ConditionRule>) -> Self {
        Self {
            mode: GroupMode::All,
            rules,
        }
    }

    pub fn any(rules: Vec<ConditionRule>) -> Self {
        Self {
            mode: GroupMode::Any,
            rules,
        }
    }
}

impl ConditionRule {
    pub fn leaf(field: &str, operator: &str, value: Value) -> Self {
        ConditionRule::Leaf(ConditionLeaf {
            field: field.to_string(),
            operator: Operator::from(operator.to_string()),
            value,
        })
    }
}

/// Evaluate a condition group against a context.
///
/// An empty rule list is true for every mode.
pub fn evaluate(group: &ConditionGroup, context: &Value) -> bool {
    if group.rules.is_empty() {
        return true;
    }
    let mut results = group.rules.iter().map(|rule| evaluate_rule(rule, context));
    match group.mode {
        GroupMode::All => results.all(|r| r),
        GroupMode::Any => results.any(|r| r),
        GroupMode::None => !results.any(|r| r),
    }
}

/// Evaluate a raw JSON condition tree. Anything that does not parse as a
/// group is false.
pub fn evaluate_value(raw: &Value, context: &Value) -> bool {
    match serde_json::from_value::<ConditionGroup>(raw.clone()) {
        Ok(group) => evaluate(&group, context),
        Err(_) => false,
    }
}

fn evaluate_rule(rule: &ConditionRule, context: &Value) -> bool {
    match rule {
        ConditionRule::Group(group) => evaluate(group, context),
        ConditionRule::Leaf(leaf) => evaluate_leaf(leaf, context),
        ConditionRule::Malformed(raw) => {
            tracing::debug!(rule = %raw, "Malformed condition rule evaluates to false");
            false
        }
    }
}

fn evaluate_leaf(leaf: &ConditionLeaf, context: &Value) -> bool {
    let field = strip_token(&leaf.field).unwrap_or(leaf.field.trim());
    let left = get_path_value(context, field).unwrap_or(&NULL);
    let right = resolve_operand(&leaf.value, context);

    match &leaf.operator {
        Operator::Equals => loose_eq(left, right),
        Operator::NotEquals => !loose_eq(left, right),
        Operator::Contains => contains(left, right),
        Operator::GreaterThan => compare(left, right) == Some(Ordering::Greater),
        Operator::LessThan => compare(left, right) == Some(Ordering::Less),
        Operator::GreaterThanOrEqual => {
            matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal))
        }
        Operator::LessThanOrEqual => {
            matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
        }
        Operator::IsEmpty => is_empty(left),
        Operator::IsNotEmpty => !is_empty(left),
        Operator::InList => in_list(left, right),
        Operator::Unknown(op) => {
            tracing::debug!(operator = %op, "Unknown condition operator evaluates to false");
            false
        }
    }
}

/// A lone `{{path}}` operand compares against the context value.
fn resolve_operand<'a>(value: &'a Value, context: &'a Value) -> &'a Value {
    if let Value::String(s) = value {
        if let Some(path) = strip_token(s) {
            return get_path_value(context, path).unwrap_or(&NULL);
        }
    }
    value
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    let numeric_involved = left.is_number() || right.is_number();
    if numeric_involved {
        if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
            return l == r;
        }
    }
    match (left, right) {
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => false,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => match right {
            Value::String(needle) => s.contains(needle.as_str()),
            Value::Number(n) => s.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        Value::Object(map) => right.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn in_list(left: &Value, right: &Value) -> bool {
    match right {
        Value::Array(items) => items.iter().any(|item| loose_eq(left, item)),
        Value::String(list) => {
            let needle = match left {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return false,
            };
            list.split(',').any(|item| item.trim() == needle)
        }
        _ => false,
    }
}
