//! Aggregation pipeline to a single SELECT.
//!
//! Supported stages: `$match`, `$group`, `$project`, `$sort`, `$limit` and
//! `$skip`. Clauses are emitted in SQL order whatever the stage order.

use serde_json::{Map, Value};
use tracing::debug;

use super::builder::{quote_identifier, Statement, StatementBuilder};
use super::predicate::PredicateCompiler;
use super::query::Query;
use crate::error::{AdapterError, AdapterResult};

/// Date part extraction operators usable in a `$group` key
const DATE_PARTS: [(&str, &str); 12] = [
    ("$dayOfMonth", "DAY"),
    ("$dayOfWeek", "DOW"),
    ("$dayOfYear", "DOY"),
    ("$isoDayOfWeek", "ISODOW"),
    ("$isoWeekYear", "ISOYEAR"),
    ("$hour", "HOUR"),
    ("$minute", "MINUTE"),
    ("$second", "SECOND"),
    ("$millisecond", "MILLISECONDS"),
    ("$month", "MONTH"),
    ("$week", "WEEK"),
    ("$year", "YEAR"),
];

/// A compiled pipeline and what is needed to shape its rows
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePlan {
    pub statement: Statement,
    /// Aliases of a multi-column group key, folded back into `objectId`
    pub group_aliases: Vec<String>,
    /// Field holding a `COUNT(*)` accumulator
    pub count_field: Option<String>,
}

#[derive(Default)]
struct Clauses {
    columns: Vec<String>,
    group_by: Vec<String>,
    filters: Vec<String>,
    order_by: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    group_aliases: Vec<String>,
    count_field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AggregationCompiler {
    predicates: PredicateCompiler,
}

/// `$field` reference to a column name
pub fn aggregate_field(reference: &str) -> String {
    match reference {
        "$_created_at" => "createdAt".to_string(),
        "$_updated_at" => "updatedAt".to_string(),
        other => other.strip_prefix('$').unwrap_or(other).to_string(),
    }
}

fn output_field(name: &str) -> &str {
    if name == "_id" {
        "objectId"
    } else {
        name
    }
}

impl AggregationCompiler {
    pub fn new(predicates: PredicateCompiler) -> Self {
        Self { predicates }
    }

    pub fn compile(&self, table: &str, pipeline: &[Value]) -> AdapterResult<AggregatePlan> {
        let mut b = StatementBuilder::new();
        let mut clauses = Clauses::default();

        for stage in pipeline {
            let stage = stage
                .as_object()
                .ok_or_else(|| AdapterError::InvalidQuery(format!("bad pipeline stage: {}", stage)))?;
            for (name, spec) in stage {
                match name.as_str() {
                    "$group" => self.group(spec, &mut clauses)?,
                    "$project" => project(spec, &mut clauses)?,
                    "$match" => self.filter(spec, &mut b, &mut clauses)?,
                    "$limit" => clauses.limit = Some(bind_count("$limit", spec, &mut b)?),
                    "$skip" => clauses.offset = Some(bind_count("$skip", spec, &mut b)?),
                    "$sort" => clauses.order_by = Some(sort(spec)?),
                    other => {
                        return Err(AdapterError::UnsupportedOperation(format!(
                            "unsupported aggregation stage: {}",
                            other
                        )))
                    }
                }
            }
        }

        let columns = if clauses.columns.is_empty() {
            "*".to_string()
        } else {
            clauses.columns.join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", columns, quote_identifier(table));
        if !clauses.filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", clauses.filters.join(" AND ")));
        }
        if !clauses.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", clauses.group_by.join(", ")));
        }
        if let Some(order_by) = &clauses.order_by {
            sql.push_str(&format!(" ORDER BY {}", order_by));
        }
        if let Some(limit) = &clauses.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = &clauses.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        debug!(table = %table, sql = %sql, "Compiled aggregation");
        Ok(AggregatePlan {
            statement: Statement::new(sql, b.into_params()),
            group_aliases: clauses.group_aliases,
            count_field: clauses.count_field,
        })
    }

    fn group(&self, spec: &Value, clauses: &mut Clauses) -> AdapterResult<()> {
        let spec = spec
            .as_object()
            .ok_or_else(|| AdapterError::InvalidQuery("$group must be an object".to_string()))?;

        for (field, value) in spec {
            if value.is_null() {
                continue;
            }
            if field == "_id" {
                group_key(value, clauses)?;
                continue;
            }
            let accumulators = value.as_object().ok_or_else(|| {
                AdapterError::InvalidQuery(format!("bad accumulator for '{}': {}", field, value))
            })?;
            for (operator, source) in accumulators {
                let alias = quote_identifier(field);
                let column = match operator.as_str() {
                    "$sum" => match source.as_str() {
                        Some(reference) => format!(
                            "SUM({}) AS {}",
                            quote_identifier(&aggregate_field(reference)),
                            alias
                        ),
                        None => {
                            clauses.count_field = Some(field.clone());
                            format!("COUNT(*) AS {}", alias)
                        }
                    },
                    "$max" | "$min" | "$avg" => {
                        let reference = source.as_str().ok_or_else(|| {
                            AdapterError::InvalidQuery(format!("{} expects a field reference", operator))
                        })?;
                        let function = operator.trim_start_matches('$').to_uppercase();
                        format!(
                            "{}({}) AS {}",
                            function,
                            quote_identifier(&aggregate_field(reference)),
                            alias
                        )
                    }
                    other => {
                        return Err(AdapterError::UnsupportedOperation(format!(
                            "unsupported accumulator: {}",
                            other
                        )))
                    }
                };
                clauses.columns.push(column);
            }
        }
        Ok(())
    }

    fn filter(&self, spec: &Value, b: &mut StatementBuilder, clauses: &mut Clauses) -> AdapterResult<()> {
        let query = Query::parse(&rename_id(spec))?;
        let clause = self.predicates.compile_into(&query, b)?;
        if !clause.is_empty() {
            clauses.filters.push(format!("({})", clause.pattern));
        }
        Ok(())
    }
}

/// `_id` refers to `objectId`, at any depth of `$or`/`$and`/`$nor`
fn rename_id(spec: &Value) -> Value {
    match spec {
        Value::Object(obj) => {
            let renamed: Map<String, Value> = obj
                .iter()
                .map(|(k, v)| {
                    let v = match k.as_str() {
                        "$or" | "$and" | "$nor" => match v {
                            Value::Array(items) => Value::Array(items.iter().map(rename_id).collect()),
                            other => other.clone(),
                        },
                        _ => v.clone(),
                    };
                    (output_field(k).to_string(), v)
                })
                .collect();
            Value::Object(renamed)
        }
        other => other.clone(),
    }
}

fn group_key(value: &Value, clauses: &mut Clauses) -> AdapterResult<()> {
    match value {
        Value::String(reference) if !reference.is_empty() => {
            let column = quote_identifier(&aggregate_field(reference));
            clauses.columns.push(format!("{} AS \"objectId\"", column));
            clauses.group_by.push(column);
            Ok(())
        }
        Value::Object(aliases) if !aliases.is_empty() => {
            for (alias, source) in aliases {
                let expr = match source {
                    Value::String(reference) if !reference.is_empty() => {
                        quote_identifier(&aggregate_field(reference))
                    }
                    Value::Object(op) => {
                        let (operator, reference) = op.iter().next().ok_or_else(|| {
                            AdapterError::InvalidQuery(format!("bad group key '{}'", alias))
                        })?;
                        let part = DATE_PARTS
                            .iter()
                            .find(|(name, _)| *name == operator.as_str())
                            .map(|(_, part)| *part)
                            .ok_or_else(|| {
                                AdapterError::UnsupportedOperation(format!(
                                    "unsupported group key operator: {}",
                                    operator
                                ))
                            })?;
                        let reference = reference.as_str().ok_or_else(|| {
                            AdapterError::InvalidQuery(format!("{} expects a field reference", operator))
                        })?;
                        format!(
                            "EXTRACT({} FROM {} AT TIME ZONE 'UTC')::integer",
                            part,
                            quote_identifier(&aggregate_field(reference))
                        )
                    }
                    other => {
                        return Err(AdapterError::InvalidQuery(format!(
                            "bad group key '{}': {}",
                            alias, other
                        )))
                    }
                };
                clauses.columns.push(format!("{} AS {}", expr, quote_identifier(alias)));
                if !clauses.group_by.contains(&expr) {
                    clauses.group_by.push(expr);
                }
                clauses.group_aliases.push(alias.clone());
            }
            Ok(())
        }
        _ => Err(AdapterError::InvalidQuery(format!("bad $group _id: {}", value))),
    }
}

fn project(spec: &Value, clauses: &mut Clauses) -> AdapterResult<()> {
    let spec = spec
        .as_object()
        .ok_or_else(|| AdapterError::InvalidQuery("$project must be an object".to_string()))?;
    for (field, value) in spec {
        if matches!(value, Value::Bool(true)) || value.as_i64() == Some(1) {
            clauses.columns.push(quote_identifier(output_field(field)));
        }
    }
    Ok(())
}

fn sort(spec: &Value) -> AdapterResult<String> {
    let spec = spec
        .as_object()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AdapterError::InvalidQuery("$sort must be a non-empty object".to_string()))?;
    let keys: Vec<String> = spec
        .iter()
        .map(|(field, direction)| {
            let direction = if direction.as_i64() == Some(1) { "ASC" } else { "DESC" };
            format!("{} {}", quote_identifier(output_field(field)), direction)
        })
        .collect();
    Ok(keys.join(", "))
}

fn bind_count(stage: &str, spec: &Value, b: &mut StatementBuilder) -> AdapterResult<String> {
    let count = spec
        .as_i64()
        .filter(|n| *n >= 0)
        .ok_or_else(|| AdapterError::InvalidQuery(format!("{} must be a non-negative integer", stage)))?;
    Ok(b.bind("?", vec![count.into()])?.sql)
}

/// Shape marshalled rows into aggregation results
pub fn finalize_results(plan: &AggregatePlan, rows: Vec<Map<String, Value>>) -> Vec<Value> {
    rows.into_iter()
        .map(|mut row| {
            if !plan.group_aliases.is_empty() {
                let key: Map<String, Value> = plan
                    .group_aliases
                    .iter()
                    .map(|alias| (alias.clone(), row.remove(alias).unwrap_or(Value::Null)))
                    .collect();
                row.insert("objectId".to_string(), Value::Object(key));
            } else if !row.contains_key("objectId") {
                row.insert("objectId".to_string(), Value::Null);
            }
            if let Some(field) = &plan.count_field {
                if let Some(count) = row.get(field).and_then(count_value) {
                    row.insert(field.clone(), Value::from(count));
                }
            }
            Value::Object(row)
        })
        .collect()
}

fn count_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{FieldType, Schema};
    use crate::storage::SqlValue;
    use serde_json::json;

    fn compiler() -> AggregationCompiler {
        let schema = Schema::new("Sale")
            .with_field("amount", FieldType::Number)
            .with_field("region", FieldType::String);
        AggregationCompiler::new(PredicateCompiler::new(&schema))
    }

    #[test]
    fn test_group_by_field_with_count() {
        let plan = compiler()
            .compile(
                "Sale",
                &[
                    json!({"$match": {"amount": {"$gt": 10}}}),
                    json!({"$group": {"_id": "$region", "total": {"$sum": "$amount"}, "n": {"$sum": 1}}}),
                    json!({"$sort": {"total": -1}}),
                    json!({"$limit": 5}),
                ],
            )
            .unwrap();
        assert_eq!(
            plan.statement.sql,
            "SELECT \"region\" AS \"objectId\", COUNT(*) AS \"n\", SUM(\"amount\") AS \"total\" FROM \"Sale\" WHERE (\"amount\" > $1) GROUP BY \"region\" ORDER BY \"total\" DESC LIMIT $2"
        );
        assert_eq!(plan.statement.params, vec![SqlValue::Int(10), SqlValue::Int(5)]);
        assert_eq!(plan.count_field.as_deref(), Some("n"));
    }

    #[test]
    fn test_group_by_date_parts() {
        let plan = compiler()
            .compile(
                "Sale",
                &[json!({"$group": {
                    "_id": {"day": {"$dayOfMonth": "$_created_at"}, "region": "$region"},
                    "best": {"$max": "$amount"}
                }})],
            )
            .unwrap();
        assert_eq!(
            plan.statement.sql,
            "SELECT EXTRACT(DAY FROM \"createdAt\" AT TIME ZONE 'UTC')::integer AS \"day\", \"region\" AS \"region\", MAX(\"amount\") AS \"best\" FROM \"Sale\" GROUP BY EXTRACT(DAY FROM \"createdAt\" AT TIME ZONE 'UTC')::integer, \"region\""
        );
        assert_eq!(plan.group_aliases, vec!["day".to_string(), "region".to_string()]);
    }

    #[test]
    fn test_match_maps_id() {
        let plan = compiler()
            .compile("Sale", &[json!({"$match": {"_id": "abc"}}), json!({"$project": {"amount": 1}})])
            .unwrap();
        assert_eq!(
            plan.statement.sql,
            "SELECT \"amount\" FROM \"Sale\" WHERE (\"objectId\" = $1)"
        );
    }

    #[test]
    fn test_skip_comes_after_limit() {
        let plan = compiler()
            .compile("Sale", &[json!({"$skip": 2}), json!({"$limit": 3})])
            .unwrap();
        assert_eq!(plan.statement.sql, "SELECT * FROM \"Sale\" LIMIT $2 OFFSET $1");
        assert_eq!(plan.statement.params, vec![SqlValue::Int(2), SqlValue::Int(3)]);
    }

    #[test]
    fn test_unknown_stage() {
        let err = compiler().compile("Sale", &[json!({"$lookup": {}})]).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_finalize_results() {
        let plan = AggregatePlan {
            statement: Statement::raw("SELECT 1"),
            group_aliases: vec!["day".to_string()],
            count_field: Some("n".to_string()),
        };
        let row = json!({"day": 4, "n": "7"}).as_object().cloned().unwrap();
        let results = finalize_results(&plan, vec![row]);
        assert_eq!(results, vec![json!({"objectId": {"day": 4}, "n": 7})]);

        let plain = AggregatePlan {
            group_aliases: Vec::new(),
            count_field: None,
            ..plan
        };
        let results = finalize_results(&plain, vec![Map::new()]);
        assert_eq!(results, vec![json!({"objectId": null})]);
    }
}
