//! Property predicates attached to a filter

use crate::error::{ResolverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOperator {
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsSet,
    IsNotSet,
    IsDateExact,
    IsDateBefore,
    IsDateAfter,
}

impl PropertyOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyOperator::Exact => "exact",
            PropertyOperator::IsNot => "is_not",
            PropertyOperator::Icontains => "icontains",
            PropertyOperator::NotIcontains => "not_icontains",
            PropertyOperator::Regex => "regex",
            PropertyOperator::NotRegex => "not_regex",
            PropertyOperator::Gt => "gt",
            PropertyOperator::Gte => "gte",
            PropertyOperator::Lt => "lt",
            PropertyOperator::Lte => "lte",
            PropertyOperator::IsSet => "is_set",
            PropertyOperator::IsNotSet => "is_not_set",
            PropertyOperator::IsDateExact => "is_date_exact",
            PropertyOperator::IsDateBefore => "is_date_before",
            PropertyOperator::IsDateAfter => "is_date_after",
        }
    }

    pub fn requires_value(self) -> bool {
        !matches!(self, PropertyOperator::IsSet | PropertyOperator::IsNotSet)
    }
}

impl FromStr for PropertyOperator {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "exact" => PropertyOperator::Exact,
            "is_not" => PropertyOperator::IsNot,
            "icontains" => PropertyOperator::Icontains,
            "not_icontains" => PropertyOperator::NotIcontains,
            "regex" => PropertyOperator::Regex,
            "not_regex" => PropertyOperator::NotRegex,
            "gt" => PropertyOperator::Gt,
            "gte" => PropertyOperator::Gte,
            "lt" => PropertyOperator::Lt,
            "lte" => PropertyOperator::Lte,
            "is_set" => PropertyOperator::IsSet,
            "is_not_set" => PropertyOperator::IsNotSet,
            "is_date_exact" => PropertyOperator::IsDateExact,
            "is_date_before" => PropertyOperator::IsDateBefore,
            "is_date_after" => PropertyOperator::IsDateAfter,
            other => return Err(ResolverError::UnsupportedOperator(other.to_string())),
        })
    }
}

impl fmt::Display for PropertyOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which property bag a predicate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Person,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyPredicate {
    pub key: String,
    pub value: Value,
    pub operator: PropertyOperator,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
}

impl PropertyPredicate {
    pub fn new(key: impl Into<String>, value: Value, operator: PropertyOperator) -> Self {
        Self {
            key: key.into(),
            value,
            operator,
            property_type: PropertyType::Person,
        }
    }

    pub fn of_type(mut self, property_type: PropertyType) -> Self {
        self.property_type = property_type;
        self
    }

    /// Parse `{key, value, operator, type}`.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let obj = raw.as_object().ok_or_else(|| {
            ResolverError::validation("Invalid property", format!("Expected object, got {}", raw))
        })?;
        let key = obj
            .get("key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ResolverError::validation("Invalid property", "Property key is required"))?;
        let operator = match obj.get("operator").and_then(Value::as_str) {
            Some(op) => op.parse()?,
            None => PropertyOperator::Exact,
        };
        let property_type = match obj.get("type").and_then(Value::as_str) {
            None | Some("person") => PropertyType::Person,
            Some("event") => PropertyType::Event,
            Some(other) => {
                return Err(ResolverError::validation(
                    "Invalid property",
                    format!("Unsupported property type '{}'", other),
                ))
            }
        };
        let value = obj.get("value").cloned().unwrap_or(Value::Null);
        if operator.requires_value() && value.is_null() {
            return Err(ResolverError::validation(
                "Invalid property",
                format!("Property '{}' needs a value for operator '{}'", key, operator),
            ));
        }
        Ok(Self {
            key: key.to_string(),
            value,
            operator,
            property_type,
        })
    }

    /// Parse either the list form or the legacy `{"key__operator": value}` form.
    pub fn parse_list(raw: &Value) -> Result<Vec<Self>> {
        match raw {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items.iter().map(Self::from_json).collect(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    let (key, operator) = match k.rsplit_once("__") {
                        Some((key, op)) => (key, op.parse()?),
                        None => (k.as_str(), PropertyOperator::Exact),
                    };
                    Ok(Self::new(key, v.clone(), operator))
                })
                .collect(),
            other => Err(ResolverError::validation(
                "Invalid properties",
                format!("Expected list of properties, got {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_operator_is_unsupported() {
        let raw = json!([{"key": "email", "value": "x", "operator": "sounds_like"}]);
        assert!(matches!(
            PropertyPredicate::parse_list(&raw),
            Err(ResolverError::UnsupportedOperator(op)) if op == "sounds_like"
        ));
    }

    #[test]
    fn test_legacy_dict_form() {
        let raw = json!({"email__icontains": "posthog", "plan": "pro"});
        let preds = PropertyPredicate::parse_list(&raw).unwrap();
        assert_eq!(preds.len(), 2);
        let email = preds.iter().find(|p| p.key == "email").unwrap();
        assert_eq!(email.operator, PropertyOperator::Icontains);
        let plan = preds.iter().find(|p| p.key == "plan").unwrap();
        assert_eq!(plan.operator, PropertyOperator::Exact);
    }

    #[test]
    fn test_is_set_needs_no_value() {
        let raw = json!({"key": "email", "operator": "is_set"});
        let pred = PropertyPredicate::from_json(&raw).unwrap();
        assert_eq!(pred.operator, PropertyOperator::IsSet);

        let raw = json!({"key": "email", "operator": "exact"});
        assert!(PropertyPredicate::from_json(&raw).is_err());
    }
}
