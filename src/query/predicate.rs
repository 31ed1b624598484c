//! Property predicates compiled to ClickHouse conditions over a JSON
//! properties column.

use crate::error::{ResolverError, Result};
use crate::filter::{PropertyOperator, PropertyPredicate, PropertyType};
use crate::query::builder::QueryBuilder;
use serde_json::Value;

/// Columns holding the two property bags in the current query.
#[derive(Debug, Clone, Copy)]
pub struct PropertyColumns<'a> {
    pub person: &'a str,
    pub event: Option<&'a str>,
}

/// Render a predicate value the way it is stored after JSON string extraction.
fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_number(pred: &PropertyPredicate) -> Result<f64> {
    let number = match &pred.value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| {
        ResolverError::validation(
            "Invalid property",
            format!(
                "Operator '{}' on '{}' needs a numeric value",
                pred.operator, pred.key
            ),
        )
    })
}

/// Compile one predicate against `column`.
pub fn compile_predicate(pred: &PropertyPredicate, column: &str, b: &mut QueryBuilder) -> Result<String> {
    let key = b.bind(pred.key.as_str());
    let extracted = format!("JSONExtractString({}, {})", column, key);

    let sql = match pred.operator {
        PropertyOperator::Exact | PropertyOperator::IsNot => {
            let negate = pred.operator == PropertyOperator::IsNot;
            match &pred.value {
                Value::Array(items) => {
                    let values = b.bind(items.iter().map(value_as_string).collect::<Vec<_>>());
                    let op = if negate { "NOT IN" } else { "IN" };
                    format!("{} {} {}", extracted, op, values)
                }
                scalar => {
                    let value = b.bind(value_as_string(scalar));
                    let op = if negate { "!=" } else { "=" };
                    format!("{} {} {}", extracted, op, value)
                }
            }
        }
        PropertyOperator::Icontains | PropertyOperator::NotIcontains => {
            let pattern = b.bind(format!("%{}%", value_as_string(&pred.value)));
            let func = if pred.operator == PropertyOperator::Icontains {
                "ilike"
            } else {
                "notILike"
            };
            format!("{}({}, {})", func, extracted, pattern)
        }
        PropertyOperator::Regex | PropertyOperator::NotRegex => {
            let pattern = b.bind(value_as_string(&pred.value));
            let sql = format!("match({}, {})", extracted, pattern);
            if pred.operator == PropertyOperator::NotRegex {
                format!("NOT {}", sql)
            } else {
                sql
            }
        }
        PropertyOperator::Gt | PropertyOperator::Gte | PropertyOperator::Lt | PropertyOperator::Lte => {
            let value = b.bind(value_as_number(pred)?);
            let op = match pred.operator {
                PropertyOperator::Gt => ">",
                PropertyOperator::Gte => ">=",
                PropertyOperator::Lt => "<",
                _ => "<=",
            };
            format!("toFloat64OrNull({}) {} {}", extracted, op, value)
        }
        PropertyOperator::IsSet => format!("JSONHas({}, {})", column, key),
        PropertyOperator::IsNotSet => format!("NOT JSONHas({}, {})", column, key),
        PropertyOperator::IsDateExact | PropertyOperator::IsDateBefore | PropertyOperator::IsDateAfter => {
            let value = b.bind(value_as_string(&pred.value));
            let stored = format!("parseDateTimeBestEffortOrNull({})", extracted);
            let wanted = format!("parseDateTimeBestEffortOrNull({})", value);
            match pred.operator {
                PropertyOperator::IsDateExact => format!("toDate({}) = toDate({})", stored, wanted),
                PropertyOperator::IsDateBefore => format!("{} < {}", stored, wanted),
                _ => format!("{} > {}", stored, wanted),
            }
        }
    };
    Ok(sql)
}

/// AND together every predicate, routing each to the bag it reads.
/// Event predicates fail validation where no event column is in scope.
pub fn compile_predicates(
    preds: &[PropertyPredicate],
    columns: PropertyColumns<'_>,
    b: &mut QueryBuilder,
) -> Result<Vec<String>> {
    preds
        .iter()
        .map(|pred| {
            let column = match pred.property_type {
                PropertyType::Person => columns.person,
                PropertyType::Event => columns.event.ok_or_else(|| {
                    ResolverError::validation(
                        "Invalid property",
                        format!("Event property '{}' cannot filter this list", pred.key),
                    )
                })?,
            };
            compile_predicate(pred, column, b)
        })
        .collect()
}

/// Join conditions with `AND`, or `1 = 1` when there are none.
pub fn and_all(conditions: &[String]) -> String {
    if conditions.is_empty() {
        "1 = 1".to_string()
    } else {
        conditions.join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::SqlParam;
    use serde_json::json;

    #[test]
    fn test_exact_list_binds_array() {
        let mut b = QueryBuilder::new();
        let pred = PropertyPredicate::new("plan", json!(["pro", "team"]), PropertyOperator::Exact);
        let sql = compile_predicate(&pred, "person_props", &mut b).unwrap();
        assert_eq!(sql, "JSONExtractString(person_props, {p0:String}) IN {p1:Array(String)}");

        let plan = b.finish(sql, 1);
        assert_eq!(
            plan.params.get("p1"),
            Some(&SqlParam::StringArray(vec!["pro".into(), "team".into()]))
        );
    }

    #[test]
    fn test_numeric_operator_needs_number() {
        let mut b = QueryBuilder::new();
        let pred = PropertyPredicate::new("age", json!("old"), PropertyOperator::Gt);
        assert!(compile_predicate(&pred, "person_props", &mut b).is_err());

        let pred = PropertyPredicate::new("age", json!("30"), PropertyOperator::Gte);
        let sql = compile_predicate(&pred, "person_props", &mut b).unwrap();
        assert!(sql.contains(">= {"));
    }

    #[test]
    fn test_event_predicate_without_event_column() {
        let mut b = QueryBuilder::new();
        let pred = PropertyPredicate::new("$browser", json!("Chrome"), PropertyOperator::Exact)
            .of_type(PropertyType::Event);
        let columns = PropertyColumns {
            person: "person_props",
            event: None,
        };
        assert!(compile_predicates(&[pred], columns, &mut b).is_err());
    }

    #[test]
    fn test_literals_never_inlined() {
        let mut b = QueryBuilder::new();
        let pred = PropertyPredicate::new("email", json!("x'); DROP TABLE person; --"), PropertyOperator::Icontains);
        let sql = compile_predicate(&pred, "person_props", &mut b).unwrap();
        assert!(!sql.contains("DROP"));
    }
}
