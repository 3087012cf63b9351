//! Complete DML statements for one class.
//!
//! Each planner assembles a single statement on one [`StatementBuilder`], so
//! the placeholders of every clause share one numbering.

use serde_json::{Map, Value};
use tracing::debug;

use super::builder::{json_path, quote_identifier, Statement, StatementBuilder};
use super::ddl::table_fields;
use super::mutation::MutationCompiler;
use super::predicate::{PredicateCompiler, WhereClause};
use super::query::Query;
use super::update::Update;
use crate::error::{AdapterError, AdapterResult};
use crate::storage::codec;
use crate::storage::geo;
use crate::storage::schema::{FieldType, Schema, READ_PERMISSIONS, WRITE_PERMISSIONS};
use crate::storage::value::Row;
use crate::storage::SqlValue;

const AUTH_DATA_PREFIX: &str = "_auth_data_";

/// Alias of the `$score` projection
pub const SCORE_COLUMN: &str = "score";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// `1` sorts ascending, anything else descending
    pub fn from_value(value: &Value) -> Self {
        if value.as_i64() == Some(1) {
            SortDirection::Ascending
        } else {
            SortDirection::Descending
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// Options of a find
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub sort: Vec<(String, SortDirection)>,
    /// Projected fields; `None` selects every column
    pub keys: Option<Vec<String>>,
    pub case_insensitive: bool,
    pub explain: bool,
}

impl FindOptions {
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

// ==================== Insert ====================

/// `INSERT INTO <class> (...) VALUES (...)` for one document
pub fn insert(schema: &Schema, object: &Map<String, Value>) -> AdapterResult<Statement> {
    validate_keys(object, false)?;

    let fields = table_fields(schema);
    let mut columns: Vec<(String, Value)> = Vec::with_capacity(object.len());
    let mut auth_data = Map::new();

    for (name, value) in object {
        if let Some(provider) = name.strip_prefix(AUTH_DATA_PREFIX) {
            auth_data.insert(provider.to_string(), value.clone());
            continue;
        }
        if matches!(schema.field(name), Some(FieldType::Relation { .. })) {
            continue;
        }
        columns.push((name.clone(), value.clone()));
    }
    if !auth_data.is_empty() {
        columns.retain(|(name, _)| name != "authData");
        columns.push(("authData".to_string(), Value::Object(auth_data)));
    }
    if columns.is_empty() {
        return Err(AdapterError::InvalidQuery("object has no columns to insert".to_string()));
    }

    let mut b = StatementBuilder::new();
    let mut names = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for (name, value) in &columns {
        let encoded = codec::to_storage(name, fields.get(name), value)?;
        let (template, params) = value_placeholder(encoded);
        names.push(quote_identifier(name));
        values.push(b.bind(&template, params)?.sql);
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(&schema.class_name),
        names.join(", "),
        values.join(", ")
    );
    debug!(class = %schema.class_name, sql = %sql, "Planned insert");
    Ok(Statement::new(sql, b.into_params()))
}

/// Placeholder and parameters for an encoded column value
fn value_placeholder(value: SqlValue) -> (String, Vec<SqlValue>) {
    match value {
        SqlValue::Point(p) => ("POINT(?, ?)".to_string(), vec![SqlValue::Float(p.x), SqlValue::Float(p.y)]),
        SqlValue::Polygon(points) => (
            "?::polygon".to_string(),
            vec![SqlValue::Text(geo::polygon_literal(&points))],
        ),
        SqlValue::Json(v) => ("?::jsonb".to_string(), vec![SqlValue::Json(v)]),
        SqlValue::TextArray(items) => ("?::text[]".to_string(), vec![SqlValue::TextArray(items)]),
        other => ("?".to_string(), vec![other]),
    }
}

/// Nested object keys may not contain `$` or `.`
fn validate_keys(object: &Map<String, Value>, nested: bool) -> AdapterResult<()> {
    for (key, value) in object {
        if nested && (key.contains('$') || key.contains('.')) {
            return Err(AdapterError::InvalidQuery(format!(
                "Nested keys should not contain the '$' or '.' characters: {}",
                key
            )));
        }
        if let Value::Object(child) = value {
            if codec::type_tag(value).is_none() {
                validate_keys(child, true)?;
            }
        }
    }
    Ok(())
}

// ==================== Find ====================

/// `SELECT ... FROM <class> WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
pub fn find(predicates: &PredicateCompiler, query: &Value, options: &FindOptions) -> AdapterResult<Statement> {
    let query = Query::parse(query)?;
    let mut b = StatementBuilder::new();

    let columns = projection(predicates, &query, options.keys.as_deref(), &mut b)?;
    let clause = predicates.compile_into(&query, &mut b)?;

    let mut sql = format!(
        "SELECT {} FROM {}{}",
        columns,
        quote_identifier(predicates.class_name()),
        clause.sql()
    );
    let order = order_by(&clause, &options.sort);
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(limit) = options.limit {
        let bound = b.bind(" LIMIT ?", vec![SqlValue::Int(clamp(limit))])?;
        sql.push_str(&bound.sql);
    }
    if let Some(skip) = options.skip {
        let bound = b.bind(" OFFSET ?", vec![SqlValue::Int(clamp(skip))])?;
        sql.push_str(&bound.sql);
    }
    if options.explain {
        sql = format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", sql);
    }

    debug!(class = %predicates.class_name(), sql = %sql, "Planned find");
    Ok(Statement::new(sql, b.into_params()))
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Column list of a find. `ACL` selects the permission arrays; relation
/// and undeclared keys are dropped.
fn projection(
    predicates: &PredicateCompiler,
    query: &Query,
    keys: Option<&[String]>,
    b: &mut StatementBuilder,
) -> AdapterResult<String> {
    let keys = match keys {
        Some(keys) => keys,
        None => return Ok("*".to_string()),
    };
    let fields = table_fields(predicates.schema());
    let mut columns: Vec<String> = Vec::with_capacity(keys.len());

    for key in keys {
        match key.as_str() {
            "ACL" => {
                columns.push(quote_identifier(READ_PERMISSIONS));
                columns.push(quote_identifier(WRITE_PERMISSIONS));
            }
            "$score" => {
                let (field, search) = query.text_search().ok_or_else(|| {
                    AdapterError::InvalidQuery("$score requires a $text query".to_string())
                })?;
                let language = search
                    .language
                    .clone()
                    .unwrap_or_else(|| predicates.default_text_language().to_string());
                let bound = b.bind(
                    &format!(
                        "ts_rank_cd(to_tsvector(?::regconfig, {}), to_tsquery(?::regconfig, ?), 32) AS {}",
                        quote_identifier(field),
                        quote_identifier(SCORE_COLUMN)
                    ),
                    vec![
                        SqlValue::Text(language.clone()),
                        SqlValue::Text(language),
                        SqlValue::Text(search.term.clone()),
                    ],
                )?;
                columns.push(bound.sql);
            }
            name if fields.contains_key(name) => columns.push(quote_identifier(name)),
            name => debug!(field = %name, "Dropping unknown projection key"),
        }
    }

    columns.dedup();
    if columns.is_empty() {
        Ok("*".to_string())
    } else {
        Ok(columns.join(", "))
    }
}

/// Query-implied orderings first, then the requested sort keys
fn order_by(clause: &WhereClause, sort: &[(String, SortDirection)]) -> Vec<String> {
    let mut order = clause.sorts.clone();
    for (field, direction) in sort {
        let column = match field.as_str() {
            "$score" => quote_identifier(SCORE_COLUMN),
            "_created_at" => quote_identifier("createdAt"),
            "_updated_at" => quote_identifier("updatedAt"),
            name if name.contains('.') => json_path(name),
            name => quote_identifier(name),
        };
        order.push(format!("{} {}", column, direction.sql()));
    }
    order
}

// ==================== Update / delete ====================

/// `UPDATE <class> SET ... WHERE ... RETURNING *`
pub fn update(predicates: &PredicateCompiler, query: &Value, update: &Value) -> AdapterResult<Statement> {
    let update = Update::parse(update)?;
    let query = Query::parse(query)?;
    let mut b = StatementBuilder::new();

    let set_clause = MutationCompiler::new(predicates.schema()).compile_into(&update, &mut b)?;
    let clause = predicates.compile_into(&query, &mut b)?;

    let sql = format!(
        "UPDATE {} SET {}{} RETURNING *",
        quote_identifier(predicates.class_name()),
        set_clause,
        clause.sql()
    );
    debug!(class = %predicates.class_name(), sql = %sql, "Planned update");
    Ok(Statement::new(sql, b.into_params()))
}

/// Delete matching rows, selecting how many were deleted
pub fn delete(predicates: &PredicateCompiler, query: &Value) -> AdapterResult<Statement> {
    let query = Query::parse(query)?;
    let mut b = StatementBuilder::new();
    let clause = predicates.compile_into(&query, &mut b)?;
    let pattern = if clause.is_empty() {
        "TRUE".to_string()
    } else {
        clause.pattern
    };
    Ok(Statement::new(
        format!(
            "WITH deleted AS (DELETE FROM {} WHERE {} RETURNING *) SELECT count(*) FROM deleted",
            quote_identifier(predicates.class_name()),
            pattern
        ),
        b.into_params(),
    ))
}

// ==================== Count / distinct ====================

pub fn count(predicates: &PredicateCompiler, query: &Value) -> AdapterResult<Statement> {
    let query = Query::parse(query)?;
    let mut b = StatementBuilder::new();
    let clause = predicates.compile_into(&query, &mut b)?;
    Ok(Statement::new(
        format!(
            "SELECT count(*) FROM {}{}",
            quote_identifier(predicates.class_name()),
            clause.sql()
        ),
        b.into_params(),
    ))
}

/// Row estimate from the catalog; `-1` or no row when never analyzed
pub fn estimated_count(class_name: &str) -> Statement {
    Statement::new(
        "SELECT reltuples AS approximate_row_count FROM pg_class WHERE relname = $1",
        vec![SqlValue::from(class_name)],
    )
}

/// A distinct query and how to decode its single result column
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctPlan {
    pub statement: Statement,
    pub column: String,
    field_type: Option<FieldType>,
    elements: bool,
}

pub fn distinct(predicates: &PredicateCompiler, query: &Value, field: &str) -> AdapterResult<DistinctPlan> {
    let query = Query::parse(query)?;
    let schema = predicates.schema();
    let root = field.split('.').next().unwrap_or(field);
    let field_type = if field.contains('.') {
        None
    } else {
        schema.field(root).cloned()
    };
    let elements = field_type.as_ref().map_or(false, FieldType::is_array);

    let expression = match &field_type {
        _ if field.contains('.') => json_path(field),
        Some(t) if t.is_text_array() => format!("jsonb_array_elements(to_jsonb({}))", quote_identifier(field)),
        Some(t) if t.is_array() => format!("jsonb_array_elements({})", quote_identifier(field)),
        _ => quote_identifier(field),
    };

    let mut b = StatementBuilder::new();
    let clause = predicates.compile_into(&query, &mut b)?;
    let sql = format!(
        "SELECT DISTINCT {} AS {} FROM {}{}",
        expression,
        quote_identifier(field),
        quote_identifier(predicates.class_name()),
        clause.sql()
    );
    debug!(class = %predicates.class_name(), sql = %sql, "Planned distinct");
    Ok(DistinctPlan {
        statement: Statement::new(sql, b.into_params()),
        column: field.to_string(),
        field_type,
        elements,
    })
}

/// Decode the rows of a distinct query, dropping nulls
pub fn distinct_values(plan: &DistinctPlan, rows: Vec<Row>) -> AdapterResult<Vec<Value>> {
    let mut values = Vec::with_capacity(rows.len());
    for mut row in rows {
        let raw = match row.remove(&plan.column) {
            Some(raw) if !raw.is_null() => raw,
            _ => continue,
        };
        let value = match &plan.field_type {
            Some(field_type) if !plan.elements => codec::from_storage(field_type, raw)?,
            _ => codec::raw_to_value(raw),
        };
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}
