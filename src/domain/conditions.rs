//! Segment condition trees.
//!
//! A tree is a conjunction of groups and each group is a disjunction of
//! leaf conditions: `(a OR b) AND (c) AND (d OR e)`. The JSON shape is the
//! nested array `[[{..}, {..}], [{..}], ...]`.

use crate::domain::model::Contact;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "like")]
    Contains,
    #[serde(rename = "not like")]
    NotContains,
    #[serde(rename = "starts with")]
    StartsWith,
    #[serde(rename = "ends with")]
    EndsWith,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "before")]
    DateBefore,
    #[serde(rename = "after")]
    DateAfter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(alias = "op")]
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Missing or null attributes never match, negated operators included.
    pub fn matches(&self, contact: &Contact) -> bool {
        let actual = match attribute(contact, &self.field) {
            Some(value) if !value.is_null() => value,
            _ => return false,
        };
        let expected = &self.value;

        match self.operator {
            Operator::Equals => values_equal(&actual, expected),
            Operator::NotEquals => !values_equal(&actual, expected),
            Operator::Contains => text_test(&actual, expected, |a, e| a.contains(e)),
            Operator::NotContains => text_test(&actual, expected, |a, e| !a.contains(e)),
            Operator::StartsWith => text_test(&actual, expected, |a, e| a.starts_with(e)),
            Operator::EndsWith => text_test(&actual, expected, |a, e| a.ends_with(e)),
            Operator::GreaterThan => number_test(&actual, expected, |a, e| a > e),
            Operator::LessThan => number_test(&actual, expected, |a, e| a < e),
            Operator::GreaterOrEqual => number_test(&actual, expected, |a, e| a >= e),
            Operator::LessOrEqual => number_test(&actual, expected, |a, e| a <= e),
            Operator::DateBefore => date_test(&actual, expected, |a, e| a < e),
            Operator::DateAfter => date_test(&actual, expected, |a, e| a > e),
        }
    }
}

/// Conditions OR'd together. Order is kept so persisted trees compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AndGroup {
    pub conditions: Vec<Condition>,
}

impl AndGroup {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn matches(&self, contact: &Contact) -> bool {
        self.conditions.iter().any(|c| c.matches(contact))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionTree {
    pub groups: Vec<AndGroup>,
}

impl ConditionTree {
    pub fn new(groups: Vec<AndGroup>) -> Self {
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.conditions.is_empty())
    }

    /// Every non-empty group must match. Empty groups are left over from
    /// editing and carry no constraint.
    pub fn evaluate(&self, contact: &Contact) -> bool {
        self.groups
            .iter()
            .filter(|g| !g.conditions.is_empty())
            .all(|g| g.matches(contact))
    }
}

pub fn evaluate(conditions: &ConditionTree, contact: &Contact) -> bool {
    conditions.evaluate(contact)
}

fn attribute(contact: &Contact, field: &str) -> Option<Value> {
    match field {
        "email" => Some(Value::String(contact.email.clone())),
        _ => contact.field_data.get(field).cloned(),
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(|ts| DateTime::from_timestamp(ts, 0)),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Value::Number(_), Value::Number(_)) = (actual, expected) {
        return as_number(actual) == as_number(expected);
    }
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => a == e,
        _ => false,
    }
}

fn text_test(actual: &Value, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => test(&a, &e),
        _ => false,
    }
}

fn number_test(actual: &Value, expected: &Value, test: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(e)) => test(a, e),
        _ => false,
    }
}

fn date_test(
    actual: &Value,
    expected: &Value,
    test: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) -> bool {
    match (as_date(actual), as_date(expected)) {
        (Some(a), Some(e)) => test(a, e),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact(fields: Value) -> Contact {
        let field_data = fields
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Contact {
            id: 1,
            email: "someone@example.com".to_string(),
            field_data,
            ..Default::default()
        }
    }

    fn age_and_country() -> ConditionTree {
        serde_json::from_value(json!([
            [{"field": "age", "op": ">", "value": 18}],
            [
                {"field": "country", "op": "=", "value": "US"},
                {"field": "country", "op": "=", "value": "CA"}
            ]
        ]))
        .unwrap()
    }

    #[test]
    fn test_and_of_ors() {
        let tree = age_and_country();
        assert!(tree.evaluate(&contact(json!({"age": 20, "country": "CA"}))));
        assert!(!tree.evaluate(&contact(json!({"age": 15, "country": "US"}))));
        assert!(!tree.evaluate(&contact(json!({"age": 30, "country": "MX"}))));
    }

    #[test]
    fn test_missing_field_is_false() {
        let tree = age_and_country();
        assert!(!tree.evaluate(&contact(json!({"country": "US"}))));

        let negated = Condition::new("age", Operator::NotEquals, 18);
        assert!(!negated.matches(&contact(json!({}))));
        assert!(!negated.matches(&contact(json!({"age": null}))));
    }

    #[test]
    fn test_or_order_does_not_change_result() {
        let a = Condition::new("country", Operator::Equals, "US");
        let b = Condition::new("country", Operator::Equals, "CA");
        let forward = ConditionTree::new(vec![AndGroup::new(vec![a.clone(), b.clone()])]);
        let reverse = ConditionTree::new(vec![AndGroup::new(vec![b, a])]);
        let c = contact(json!({"country": "ca"}));

        assert_eq!(forward.evaluate(&c), reverse.evaluate(&c));
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_text_operators() {
        let c = contact(json!({"company": "Acme Widgets"}));
        assert!(Condition::new("company", Operator::Contains, "widget").matches(&c));
        assert!(Condition::new("company", Operator::StartsWith, "acme").matches(&c));
        assert!(Condition::new("company", Operator::EndsWith, "gets").matches(&c));
        assert!(Condition::new("company", Operator::NotContains, "gadget").matches(&c));
        assert!(Condition::new("email", Operator::EndsWith, "@example.com").matches(&c));
    }

    #[test]
    fn test_numeric_strings_compare_as_numbers() {
        let c = contact(json!({"score": "42"}));
        assert!(Condition::new("score", Operator::GreaterOrEqual, 42).matches(&c));
        assert!(Condition::new("score", Operator::LessThan, "100").matches(&c));
        assert!(!Condition::new("score", Operator::GreaterThan, "abc").matches(&c));
    }

    #[test]
    fn test_date_operators() {
        let c = contact(json!({"joined": "2024-03-01"}));
        assert!(Condition::new("joined", Operator::DateBefore, "2024-03-02T00:00:00Z").matches(&c));
        assert!(Condition::new("joined", Operator::DateAfter, "2024-02-28").matches(&c));
        assert!(!Condition::new("joined", Operator::DateAfter, "not a date").matches(&c));
    }

    #[test]
    fn test_empty_tree_and_groups() {
        let c = contact(json!({}));
        assert!(ConditionTree::default().evaluate(&c));

        let tree: ConditionTree = serde_json::from_value(json!([[]])).unwrap();
        assert!(tree.is_empty());
        assert!(tree.evaluate(&c));
    }

    #[test]
    fn test_serialized_shape_is_nested_arrays() {
        let tree = ConditionTree::new(vec![AndGroup::new(vec![Condition::new(
            "age",
            Operator::GreaterThan,
            18,
        )])]);
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            value,
            json!([[{"field": "age", "operator": ">", "value": 18}]])
        );
    }
}
