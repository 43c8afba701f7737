// Workflow Conditions - Predicate trees evaluated against fact payloads
//
// Trigger and step conditions are parsed once, when a workflow is saved, into a
// small expression tree. Evaluation is pure and never fails: a field that is
// missing or has the wrong type simply does not match.

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::str::FromStr;

/// Comparison applied to a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    // Equality
    Equals,
    NotEquals,

    // String operations
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,

    // Numeric comparisons
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,

    // Array operations
    In,
    NotIn,

    // Null checks
    IsNull,
    IsNotNull,

    // Boolean
    IsTrue,
    IsFalse,
}

impl ConditionOperator {
    /// Accepts snake_case, PascalCase and the usual symbolic aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();

        let op = match normalized.as_str() {
            "equals" | "eq" | "==" | "=" => Self::Equals,
            "notequals" | "ne" | "!=" | "<>" => Self::NotEquals,
            "contains" => Self::Contains,
            "notcontains" => Self::NotContains,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "regex" | "matches" => Self::Regex,
            "greaterthan" | "gt" | ">" => Self::GreaterThan,
            "greaterthanorequals" | "gte" | ">=" => Self::GreaterThanOrEquals,
            "lessthan" | "lt" | "<" => Self::LessThan,
            "lessthanorequals" | "lte" | "<=" => Self::LessThanOrEquals,
            "in" => Self::In,
            "notin" => Self::NotIn,
            "isnull" | "isempty" => Self::IsNull,
            "isnotnull" | "isnotempty" => Self::IsNotNull,
            "istrue" => Self::IsTrue,
            "isfalse" => Self::IsFalse,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanOrEquals => "greater_than_or_equals",
            Self::LessThan => "less_than",
            Self::LessThanOrEquals => "less_than_or_equals",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
            Self::IsTrue => "is_true",
            Self::IsFalse => "is_false",
        }
    }

    fn needs_value(&self) -> bool {
        !matches!(
            self,
            Self::IsNull | Self::IsNotNull | Self::IsTrue | Self::IsFalse
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("conditions are not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("malformed condition: {0}")]
    Malformed(String),
}

/// A single field comparison
#[derive(Debug, Clone)]
pub struct FieldCondition {
    /// Field path, dot notation for nested fields (`customer.tier`, `products.0.quantity`)
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    pattern: Option<Regex>,
}

impl PartialEq for FieldCondition {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.value == other.value
    }
}

impl FieldCondition {
    pub fn new(
        field: &str,
        operator: ConditionOperator,
        value: Value,
    ) -> Result<Self, ConditionError> {
        if field.trim().is_empty() {
            return Err(ConditionError::Malformed("field name is empty".to_string()));
        }
        if operator.needs_value() && value.is_null() {
            return Err(ConditionError::Malformed(format!(
                "operator '{}' on '{}' requires a value",
                operator.as_str(),
                field
            )));
        }

        let pattern = match operator {
            ConditionOperator::Regex => {
                let raw = value.as_str().ok_or_else(|| {
                    ConditionError::Malformed(format!("regex on '{}' must be a string", field))
                })?;
                Some(Regex::new(raw).map_err(|e| ConditionError::InvalidRegex {
                    pattern: raw.to_string(),
                    reason: e.to_string(),
                })?)
            }
            ConditionOperator::In | ConditionOperator::NotIn if !value.is_array() => {
                return Err(ConditionError::Malformed(format!(
                    "operator '{}' on '{}' requires an array",
                    operator.as_str(),
                    field
                )));
            }
            _ => None,
        };

        Ok(Self {
            field: field.trim().to_string(),
            operator,
            value,
            pattern,
        })
    }

    fn evaluate(&self, context: &Value) -> bool {
        let field_value = lookup_path(context, &self.field).filter(|v| !v.is_null());

        match self.operator {
            ConditionOperator::Equals => field_value.is_some_and(|v| loose_eq(v, &self.value)),
            ConditionOperator::NotEquals => !field_value.is_some_and(|v| loose_eq(v, &self.value)),
            ConditionOperator::Contains => field_value.is_some_and(|v| contains(v, &self.value)),
            ConditionOperator::NotContains => !field_value.is_some_and(|v| contains(v, &self.value)),
            ConditionOperator::StartsWith => string_pair(field_value, &self.value)
                .is_some_and(|(s, p)| s.starts_with(&p)),
            ConditionOperator::EndsWith => string_pair(field_value, &self.value)
                .is_some_and(|(s, p)| s.ends_with(&p)),
            ConditionOperator::Regex => match (field_value.and_then(Value::as_str), &self.pattern) {
                (Some(s), Some(re)) => re.is_match(s),
                _ => false,
            },
            ConditionOperator::GreaterThan => compare(field_value, &self.value, |o| o.is_gt()),
            ConditionOperator::GreaterThanOrEquals => compare(field_value, &self.value, |o| o.is_ge()),
            ConditionOperator::LessThan => compare(field_value, &self.value, |o| o.is_lt()),
            ConditionOperator::LessThanOrEquals => compare(field_value, &self.value, |o| o.is_le()),
            ConditionOperator::In => field_value.is_some_and(|v| in_list(v, &self.value)),
            ConditionOperator::NotIn => !field_value.is_some_and(|v| in_list(v, &self.value)),
            ConditionOperator::IsNull => field_value.is_none(),
            ConditionOperator::IsNotNull => field_value.is_some(),
            ConditionOperator::IsTrue => field_value.and_then(as_bool) == Some(true),
            ConditionOperator::IsFalse => field_value.and_then(as_bool) == Some(false),
        }
    }
}

/// Parsed predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// No conditions: always matches
    Always,
    Field(FieldCondition),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Parse the stored text form. Blank text means "no conditions".
    pub fn parse_str(raw: &str) -> Result<Self, ConditionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::Always);
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ConditionError::InvalidJson(e.to_string()))?;
        Self::parse_value(&value)
    }

    /// Parse either the tree form (`{"and": [...]}`, `{"not": {...}}`,
    /// `{"field", "operator", "value"}`) or the condition-group form produced by
    /// the workflow designer (`{"logicalOperator": "AND", "conditions": [...], "groups": [...]}`).
    pub fn parse_value(value: &Value) -> Result<Self, ConditionError> {
        match value {
            Value::Null => Ok(Self::Always),
            Value::Array(items) => Self::combine(items, Self::And),
            Value::Object(map) if map.is_empty() => Ok(Self::Always),
            Value::Object(map) => {
                if let Some(items) = map.get("and").or_else(|| map.get("all")) {
                    return Self::combine(expect_array(items, "and")?, Self::And);
                }
                if let Some(items) = map.get("or").or_else(|| map.get("any")) {
                    return Self::combine(expect_array(items, "or")?, Self::Or);
                }
                if let Some(inner) = map.get("not") {
                    return Ok(Self::Not(Box::new(Self::parse_value(inner)?)));
                }
                if let Some(field) = map.get("field") {
                    return Self::parse_leaf(field, map.get("operator"), map.get("value"));
                }
                if let Some(logic) = map.get("logicalOperator").or_else(|| map.get("logic")) {
                    return Self::parse_group(logic, map.get("conditions"), map.get("groups"));
                }
                Err(ConditionError::Malformed(format!(
                    "unrecognized condition object: {}",
                    value
                )))
            }
            other => Err(ConditionError::Malformed(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    fn parse_leaf(
        field: &Value,
        operator: Option<&Value>,
        value: Option<&Value>,
    ) -> Result<Self, ConditionError> {
        let field = field
            .as_str()
            .ok_or_else(|| ConditionError::Malformed("field must be a string".to_string()))?;
        let raw_op = operator
            .and_then(Value::as_str)
            .ok_or_else(|| ConditionError::Malformed(format!("missing operator for '{}'", field)))?;
        let op = ConditionOperator::parse(raw_op)
            .ok_or_else(|| ConditionError::UnknownOperator(raw_op.to_string()))?;
        let value = value.cloned().unwrap_or(Value::Null);
        Self::field(field, op, value)
    }

    fn parse_group(
        logic: &Value,
        conditions: Option<&Value>,
        groups: Option<&Value>,
    ) -> Result<Self, ConditionError> {
        let logic = logic
            .as_str()
            .ok_or_else(|| ConditionError::Malformed("logical operator must be a string".to_string()))?;

        let mut children = Vec::new();
        for key in [conditions, groups].into_iter().flatten() {
            for child in expect_array(key, "conditions")? {
                children.push(Self::parse_value(child)?);
            }
        }
        if children.is_empty() {
            return Ok(Self::Always);
        }

        match logic.to_ascii_uppercase().as_str() {
            "AND" => Ok(Self::And(children)),
            "OR" => Ok(Self::Or(children)),
            other => Err(ConditionError::Malformed(format!(
                "unknown logical operator '{}'",
                other
            ))),
        }
    }

    fn combine(
        items: &[Value],
        make: fn(Vec<Predicate>) -> Predicate,
    ) -> Result<Self, ConditionError> {
        let children = items
            .iter()
            .map(Self::parse_value)
            .collect::<Result<Vec<_>, _>>()?;
        if children.is_empty() {
            return Ok(Self::Always);
        }
        Ok(make(children))
    }

    /// Evaluate against a JSON context. Pure, never panics.
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Self::Always => true,
            Self::Field(condition) => condition.evaluate(context),
            Self::And(children) => children.iter().all(|c| c.evaluate(context)),
            Self::Or(children) => children.iter().any(|c| c.evaluate(context)),
            Self::Not(inner) => !inner.evaluate(context),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }

    /// Canonical tree form, used for storage.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Always => Value::Null,
            Self::Field(c) => json!({
                "field": c.field,
                "operator": c.operator.as_str(),
                "value": c.value,
            }),
            Self::And(children) => json!({ "and": children.iter().map(Self::to_value).collect::<Vec<_>>() }),
            Self::Or(children) => json!({ "or": children.iter().map(Self::to_value).collect::<Vec<_>>() }),
            Self::Not(inner) => json!({ "not": inner.to_value() }),
        }
    }

    pub fn field(field: &str, operator: ConditionOperator, value: Value) -> Result<Self, ConditionError> {
        FieldCondition::new(field, operator, value).map(Self::Field)
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Predicate::parse_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Conditions as held by a stored definition.
///
/// Definitions are validated on save, but rows written by older versions or by
/// hand may no longer parse. Those are kept as `Malformed` so evaluation can
/// fail closed instead of refusing to load the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConditionSet {
    Valid { predicate: Predicate },
    Malformed { raw: String, reason: String },
}

impl ConditionSet {
    /// Strict parse used by create/update paths.
    pub fn parse(raw: &str) -> Result<Self, ConditionError> {
        Predicate::parse_str(raw).map(|predicate| Self::Valid { predicate })
    }

    /// Lenient parse used when loading stored definitions.
    pub fn load(raw: &str) -> Self {
        match Predicate::parse_str(raw) {
            Ok(predicate) => Self::Valid { predicate },
            Err(e) => Self::Malformed {
                raw: raw.to_string(),
                reason: e.to_string(),
            },
        }
    }

    pub fn always() -> Self {
        Self::Valid {
            predicate: Predicate::Always,
        }
    }

    pub fn predicate(&self) -> Result<&Predicate, &str> {
        match self {
            Self::Valid { predicate } => Ok(predicate),
            Self::Malformed { reason, .. } => Err(reason.as_str()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Valid { predicate } if predicate.is_always())
    }

    /// Text form written to storage. Malformed conditions are written back untouched.
    pub fn to_storage(&self) -> String {
        match self {
            Self::Valid { predicate } if predicate.is_always() => String::new(),
            Self::Valid { predicate } => predicate.to_value().to_string(),
            Self::Malformed { raw, .. } => raw.clone(),
        }
    }
}

impl From<Predicate> for ConditionSet {
    fn from(predicate: Predicate) -> Self {
        Self::Valid { predicate }
    }
}

/// Resolve a dot-separated path; numeric segments index into arrays.
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn expect_array<'a>(value: &'a Value, key: &str) -> Result<&'a [Value], ConditionError> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ConditionError::Malformed(format!("'{}' must be an array", key)))
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Equality that treats `"1500.00"` and `1500` as the same amount.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            matches!((as_decimal(left), as_decimal(right)), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            as_bool(left).is_some() && as_bool(left) == as_bool(right)
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(p)) => s.to_lowercase().contains(&p.to_lowercase()),
        (Value::Array(items), _) => items.iter().any(|item| loose_eq(item, needle)),
        _ => false,
    }
}

fn in_list(value: &Value, list: &Value) -> bool {
    list.as_array()
        .is_some_and(|items| items.iter().any(|item| loose_eq(value, item)))
}

fn string_pair(value: Option<&Value>, pattern: &Value) -> Option<(String, String)> {
    match (value?.as_str(), pattern.as_str()) {
        (Some(s), Some(p)) => Some((s.to_lowercase(), p.to_lowercase())),
        _ => None,
    }
}

fn compare(value: Option<&Value>, target: &Value, check: fn(std::cmp::Ordering) -> bool) -> bool {
    match (value.and_then(as_decimal), as_decimal(target)) {
        (Some(a), Some(b)) => check(a.cmp(&b)),
        _ => false,
    }
}
