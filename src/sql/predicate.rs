//! Query to WHERE-clause compiler.
//!
//! Every field of a [`Query`] is compiled into one or more predicate
//! fragments joined with `AND`. Placeholders and parameters are produced
//! together through a shared [`StatementBuilder`], including inside nested
//! `$or`/`$and`/`$nor` sub-queries, so that statement parameters always line
//! up with the `$N` markers of the pattern.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::builder::{json_path, json_text_path, quote_identifier, StatementBuilder};
use super::query::{Clause, Comparator, Condition, Literal, Operator, Query, TextSearch};
use super::{regex, relative_time};
use crate::error::{AdapterError, AdapterResult};
use crate::storage::codec::{self, type_tag};
use crate::storage::geo::{self, GeoPoint, EARTH_RADIUS_M};
use crate::storage::schema::{to_storage_schema, FieldType, Schema};
use crate::storage::SqlValue;

/// Bound in place of a boolean compared against a Number column, since a
/// boolean cannot be cast. It is a value no stored number is expected to hold.
const NUMBER_MISMATCH_SENTINEL: f64 = 9_223_372_036_854_775_808.0;

pub const DEFAULT_TEXT_LANGUAGE: &str = "english";

/// Result of compiling a query on its own
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    pub pattern: String,
    pub parameters: Vec<SqlValue>,
    /// Ordering expressions implied by the query (`$nearSphere`)
    pub sorts: Vec<String>,
}

/// Pattern produced into a caller-owned builder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    pub pattern: String,
    pub sorts: Vec<String>,
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// ` WHERE <pattern>`, or nothing for an empty query
    pub fn sql(&self) -> String {
        if self.pattern.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.pattern)
        }
    }
}

/// Compiles queries against one class schema
#[derive(Debug, Clone)]
pub struct PredicateCompiler {
    schema: Schema,
    case_insensitive: bool,
    text_language: String,
    now: Option<DateTime<Utc>>,
}

/// The field a condition applies to
struct Target<'a> {
    name: &'a str,
    field_type: Option<&'a FieldType>,
}

impl Target<'_> {
    fn is_dotted(&self) -> bool {
        self.name.contains('.')
    }

    fn is_array(&self) -> bool {
        self.field_type.map_or(false, FieldType::is_array)
    }

    fn is_text_array(&self) -> bool {
        self.field_type.map_or(false, FieldType::is_text_array)
    }

    /// Column reference; dotted paths read the final key as text
    fn column(&self) -> String {
        if self.is_dotted() {
            json_text_path(self.name)
        } else {
            quote_identifier(self.name)
        }
    }

    /// Column as a jsonb array, for the `array_*` helper functions
    fn array_column(&self) -> String {
        if self.is_text_array() {
            format!("to_jsonb({})", self.column())
        } else {
            self.column()
        }
    }
}

impl PredicateCompiler {
    pub fn new(schema: &Schema) -> Self {
        Self {
            schema: to_storage_schema(schema),
            case_insensitive: false,
            text_language: DEFAULT_TEXT_LANGUAGE.to_string(),
            now: None,
        }
    }

    /// Compare string equality with `LOWER()` on both sides
    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    /// Language used by `$text` when the query names none
    pub fn text_language(mut self, language: impl Into<String>) -> Self {
        self.text_language = language.into();
        self
    }

    /// Reference instant for `$relativeTime`; defaults to the current time
    pub fn now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn class_name(&self) -> &str {
        &self.schema.class_name
    }

    /// Language used by `$text` searches that name none
    pub fn default_text_language(&self) -> &str {
        &self.text_language
    }

    /// Compile a query document with placeholders numbered from `start_index`
    pub fn compile(&self, query: &Value, start_index: usize) -> AdapterResult<CompiledPredicate> {
        let query = Query::parse(query)?;
        let mut builder = StatementBuilder::starting_at(start_index);
        let clause = self.compile_into(&query, &mut builder)?;
        debug!(
            class = %self.schema.class_name,
            pattern = %clause.pattern,
            params = builder.params().len(),
            "Compiled predicate"
        );
        Ok(CompiledPredicate {
            pattern: clause.pattern,
            parameters: builder.into_params(),
            sorts: clause.sorts,
        })
    }

    /// Compile a parsed query, binding its parameters into `builder`
    pub fn compile_into(&self, query: &Query, builder: &mut StatementBuilder) -> AdapterResult<WhereClause> {
        let mut sorts = Vec::new();
        let pattern = self.compile_query(query, builder, &mut sorts)?;
        Ok(WhereClause { pattern, sorts })
    }

    fn compile_query(
        &self,
        query: &Query,
        b: &mut StatementBuilder,
        sorts: &mut Vec<String>,
    ) -> AdapterResult<String> {
        let mut patterns = Vec::with_capacity(query.clauses.len());

        for clause in &query.clauses {
            match clause {
                Clause::Field { name, condition } => {
                    let target = Target {
                        name: name.as_str(),
                        field_type: self.schema.field(name),
                    };
                    if self.skips_missing_field(&target, condition) {
                        continue;
                    }
                    let fragments = self.compile_field(&target, condition, b, sorts)?;
                    if fragments.is_empty() {
                        return Err(AdapterError::UnsupportedOperation(format!(
                            "Postgres doesn't support this query type yet for field '{}'",
                            name
                        )));
                    }
                    patterns.extend(fragments);
                }
                Clause::Or(subs) => patterns.push(self.compile_group(subs, " OR ", b, sorts)?),
                Clause::And(subs) => patterns.push(self.compile_group(subs, " AND ", b, sorts)?),
                Clause::Nor(subs) => {
                    let group = self.compile_group(subs, " OR ", b, sorts)?;
                    patterns.push(format!("NOT {}", group));
                }
            }
        }

        Ok(patterns.join(" AND "))
    }

    fn compile_group(
        &self,
        subs: &[Query],
        joiner: &str,
        b: &mut StatementBuilder,
        sorts: &mut Vec<String>,
    ) -> AdapterResult<String> {
        let mut parts = Vec::with_capacity(subs.len());
        for sub in subs {
            let pattern = self.compile_query(sub, b, sorts)?;
            parts.push(if pattern.is_empty() {
                "TRUE".to_string()
            } else {
                pattern
            });
        }
        Ok(format!("({})", parts.join(joiner)))
    }

    /// An undeclared column cannot exist, so `$exists: false` on it is
    /// trivially satisfied. The whole clause is dropped, sibling operators
    /// on the same field included.
    fn skips_missing_field(&self, target: &Target, condition: &Condition) -> bool {
        if target.is_dotted() || target.field_type.is_some() {
            return false;
        }
        matches!(condition, Condition::Operators(ops) if ops.contains(&Operator::Exists(false)))
    }

    fn compile_field(
        &self,
        target: &Target,
        condition: &Condition,
        b: &mut StatementBuilder,
        sorts: &mut Vec<String>,
    ) -> AdapterResult<Vec<String>> {
        let column = target.column();
        let fragment = match condition {
            Condition::Null => b.fragment(&format!("{} IS NULL", column))?,
            Condition::Literal(literal) => self.equality(target, &literal_value(literal), b)?,
            Condition::Pointer(pointer) => {
                if target.is_array() {
                    b.bind(
                        &format!("array_contains({}, ?::jsonb)", target.array_column()),
                        vec![SqlValue::Json(Value::Array(vec![pointer.clone()]))],
                    )?
                    .sql
                } else {
                    b.bind(
                        &format!("{} = ?", column),
                        vec![SqlValue::Text(codec::pointer_id(pointer)?)],
                    )?
                    .sql
                }
            }
            Condition::Date(ts) => b.bind(&format!("{} = ?", column), vec![SqlValue::Timestamp(*ts)])?.sql,
            Condition::GeoPoint(point) => {
                b.bind(
                    &format!("{} ~= POINT(?, ?)", column),
                    vec![SqlValue::Float(point.longitude), SqlValue::Float(point.latitude)],
                )?
                .sql
            }
            Condition::Polygon(polygon) => {
                let coordinates = polygon
                    .get("coordinates")
                    .ok_or_else(|| AdapterError::Geometry(format!("Polygon requires coordinates: {}", polygon)))?;
                let ring = geo::close_ring(&geo::coordinates_from_value(coordinates)?)?;
                b.bind(
                    &format!("{} ~= ?::polygon", column),
                    vec![SqlValue::Text(geo::polygon_literal(&ring))],
                )?
                .sql
            }
            Condition::Operators(ops) => {
                let mut fragments = Vec::new();
                for op in ops {
                    if let Some(fragment) = self.compile_operator(target, op, b, sorts)? {
                        fragments.push(fragment);
                    }
                }
                return Ok(fragments);
            }
        };
        Ok(vec![fragment])
    }

    fn compile_operator(
        &self,
        target: &Target,
        op: &Operator,
        b: &mut StatementBuilder,
        sorts: &mut Vec<String>,
    ) -> AdapterResult<Option<String>> {
        let column = target.column();
        let fragment = match op {
            Operator::Ne(value) => self.not_equal(target, value, b)?,
            Operator::Eq(Value::Null) => b.fragment(&format!("{} IS NULL", column))?,
            Operator::Eq(value) => self.equality(target, value, b)?,
            Operator::In(items) => return self.membership(target, items, false, b),
            Operator::Nin(items) => return self.membership(target, items, true, b),
            Operator::All(items) => return self.contains_all(target, items, b),
            Operator::Exists(true) => b.fragment(&format!("{} IS NOT NULL", column))?,
            Operator::Exists(false) => b.fragment(&format!("{} IS NULL", column))?,
            Operator::ContainedBy(items) => {
                b.bind(
                    &format!("{} <@ ?::jsonb", target.array_column()),
                    vec![SqlValue::Json(Value::Array(items.clone()))],
                )?
                .sql
            }
            Operator::Text(search) => self.text_search(target, search, b)?,
            Operator::NearSphere { point, max_distance } => {
                let distance = format!("ST_DistanceSphere({}::geometry, POINT(?, ?)::geometry)", column);
                let mut params = vec![SqlValue::Float(point.longitude), SqlValue::Float(point.latitude)];
                let template = match max_distance {
                    Some(radians) => {
                        params.push(SqlValue::Float(radians * EARTH_RADIUS_M));
                        format!("{} <= ?", distance)
                    }
                    None => format!("{} IS NOT NULL", distance),
                };
                let bound = b.bind(&template, params)?;
                sorts.push(format!(
                    "ST_DistanceSphere({}::geometry, POINT({}, {})::geometry) ASC",
                    column,
                    bound.placeholder(0),
                    bound.placeholder(1)
                ));
                bound.sql
            }
            Operator::CenterSphere { point, radius } => {
                b.bind(
                    &format!(
                        "ST_DistanceSphere({}::geometry, POINT(?, ?)::geometry) <= ?",
                        column
                    ),
                    vec![
                        SqlValue::Float(point.longitude),
                        SqlValue::Float(point.latitude),
                        SqlValue::Float(radius * EARTH_RADIUS_M),
                    ],
                )?
                .sql
            }
            Operator::WithinBox {
                south_west,
                north_east,
            } => {
                b.bind(
                    &format!("{}::point <@ ?::box", column),
                    vec![SqlValue::Text(geo::box_literal(south_west, north_east))],
                )?
                .sql
            }
            Operator::WithinPolygon(points) => {
                let ring: Vec<_> = points.iter().map(GeoPoint::to_point).collect();
                b.bind(
                    &format!("{}::point <@ ?::polygon", column),
                    vec![SqlValue::Text(geo::polygon_literal(&ring))],
                )?
                .sql
            }
            Operator::IntersectsPoint(point) => {
                b.bind(
                    &format!("{}::polygon @> ?::point", column),
                    vec![SqlValue::Text(geo::point_literal(point))],
                )?
                .sql
            }
            Operator::Regex { pattern, options } => {
                let operator = if options.contains('i') { "~*" } else { "~" };
                let pattern = if options.contains('x') {
                    regex::remove_whitespace(pattern)
                } else {
                    pattern.clone()
                };
                b.bind(
                    &format!("{} {} ?", column, operator),
                    vec![SqlValue::Text(regex::process_regex_pattern(&pattern))],
                )?
                .sql
            }
            Operator::Compare(comparator, value) => self.comparison(target, *comparator, value, b)?,
        };
        Ok(Some(fragment))
    }

    // ==================== Equality ====================

    fn equality(&self, target: &Target, value: &Value, b: &mut StatementBuilder) -> AdapterResult<String> {
        reject_relative_time(value)?;

        if target.is_dotted() {
            let (expr, param) = dotted_operand(target.name, value)?;
            return Ok(b.bind(&format!("{} = ?", expr), vec![param])?.sql);
        }

        let column = target.column();

        if target.is_array() && !value.is_array() {
            let bound = b.bind(
                &format!("array_contains({}, ?::jsonb)", target.array_column()),
                vec![SqlValue::Json(Value::Array(vec![value.clone()]))],
            )?;
            return Ok(bound.sql);
        }

        if let (Value::Bool(_), Some(FieldType::Number)) = (value, target.field_type) {
            let bound = b.bind(
                &format!("{} = ?", column),
                vec![SqlValue::Float(NUMBER_MISMATCH_SENTINEL)],
            )?;
            return Ok(bound.sql);
        }

        if let (Value::String(s), true) = (value, self.case_insensitive) {
            let bound = b.bind(
                &format!("LOWER({}) = LOWER(?)", column),
                vec![SqlValue::Text(s.clone())],
            )?;
            return Ok(bound.sql);
        }

        let param = encode_operand(target, value)?;
        Ok(b.bind(&format!("{} = ?", column), vec![param])?.sql)
    }

    fn not_equal(&self, target: &Target, value: &Value, b: &mut StatementBuilder) -> AdapterResult<String> {
        reject_relative_time(value)?;

        if target.is_array() {
            let bound = b.bind(
                &format!("NOT array_contains({}, ?::jsonb)", target.array_column()),
                vec![SqlValue::Json(Value::Array(vec![value.clone()]))],
            )?;
            return Ok(bound.sql);
        }

        let column = target.column();
        if value.is_null() {
            return b.fragment(&format!("{} IS NOT NULL", column));
        }

        if type_tag(value) == Some("GeoPoint") {
            let point = GeoPoint::from_value(value)?;
            let bound = b.bind(
                &format!("({col} <> POINT(?, ?) OR {col} IS NULL)", col = column),
                vec![SqlValue::Float(point.longitude), SqlValue::Float(point.latitude)],
            )?;
            return Ok(bound.sql);
        }

        let (expr, param) = if target.is_dotted() {
            dotted_operand(target.name, value)?
        } else {
            (column, encode_operand(target, value)?)
        };
        Ok(b
            .bind(&format!("({expr} <> ? OR {expr} IS NULL)", expr = expr), vec![param])?
            .sql)
    }

    // ==================== Membership ====================

    fn membership(
        &self,
        target: &Target,
        items: &[Value],
        negated: bool,
        b: &mut StatementBuilder,
    ) -> AdapterResult<Option<String>> {
        if target.is_dotted() {
            if negated {
                return Ok(None);
            }
            let bound = b.bind(
                &format!("({})::jsonb @> ?::jsonb", json_path(target.name)),
                vec![SqlValue::Json(Value::Array(items.to_vec()))],
            )?;
            return Ok(Some(bound.sql));
        }

        let column = target.column();

        if target.is_text_array() && !negated {
            let allow_null = items.iter().any(Value::is_null);
            let values: Vec<SqlValue> = items
                .iter()
                .filter(|v| !v.is_null())
                .map(codec::infer_storage)
                .collect::<AdapterResult<_>>()?;
            if values.is_empty() {
                return Ok(Some(b.fragment(&format!("{} IS NULL", column))?));
            }
            let template = if allow_null {
                format!(
                    "({col} IS NULL OR {col} && ARRAY[{m}])",
                    col = column,
                    m = markers(values.len())
                )
            } else {
                format!("{} && ARRAY[{}]", column, markers(values.len()))
            };
            return Ok(Some(b.bind(&template, values)?.sql));
        }

        let flattened: Vec<Value> = items
            .iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner.clone(),
                other => vec![other.clone()],
            })
            .collect();

        if flattened.is_empty() {
            let fragment = if negated {
                "TRUE".to_string()
            } else {
                b.fragment(&format!("{} IS NULL", column))?
            };
            return Ok(Some(fragment));
        }

        if target.is_array() {
            let not = if negated { "NOT " } else { "" };
            let bound = b.bind(
                &format!("{}array_contains({}, ?::jsonb)", not, target.array_column()),
                vec![SqlValue::Json(Value::Array(flattened))],
            )?;
            return Ok(Some(bound.sql));
        }

        let allow_null = flattened.iter().any(Value::is_null);
        let values: Vec<SqlValue> = flattened
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| encode_operand(target, v))
            .collect::<AdapterResult<_>>()?;

        let template = match (values.is_empty(), negated, allow_null) {
            (true, false, _) => format!("{} IS NULL", column),
            (true, true, _) => format!("{} IS NOT NULL", column),
            (false, false, false) => format!("{} IN ({})", column, markers(values.len())),
            (false, false, true) => format!(
                "({col} IS NULL OR {col} IN ({m}))",
                col = column,
                m = markers(values.len())
            ),
            (false, true, false) => format!("{} NOT IN ({})", column, markers(values.len())),
            (false, true, true) => format!(
                "({col} IS NOT NULL AND {col} NOT IN ({m}))",
                col = column,
                m = markers(values.len())
            ),
        };
        Ok(Some(b.bind(&template, values)?.sql))
    }

    fn contains_all(
        &self,
        target: &Target,
        items: &[Value],
        b: &mut StatementBuilder,
    ) -> AdapterResult<Option<String>> {
        if target.is_array() {
            let (function, values) = if regex::is_any_value_starts_with_regex(items) {
                ("array_contains_all_regex", regex::starts_with_patterns(items)?)
            } else {
                ("array_contains_all", items.to_vec())
            };
            let bound = b.bind(
                &format!("{}({}, ?::jsonb)", function, target.array_column()),
                vec![SqlValue::Json(Value::Array(values))],
            )?;
            return Ok(Some(bound.sql));
        }

        match items {
            [single] => {
                let bound = b.bind(
                    &format!("{} = ?", target.column()),
                    vec![SqlValue::Text(codec::pointer_id(single)?)],
                )?;
                Ok(Some(bound.sql))
            }
            _ => Ok(None),
        }
    }

    // ==================== Search and comparison ====================

    fn text_search(&self, target: &Target, search: &TextSearch, b: &mut StatementBuilder) -> AdapterResult<String> {
        let language = search
            .language
            .clone()
            .unwrap_or_else(|| self.text_language.clone());
        let bound = b.bind(
            &format!("to_tsvector(?::regconfig, {}) @@ to_tsquery(?::regconfig, ?)", target.column()),
            vec![
                SqlValue::Text(language.clone()),
                SqlValue::Text(language),
                SqlValue::Text(search.term.clone()),
            ],
        )?;
        Ok(bound.sql)
    }

    fn comparison(
        &self,
        target: &Target,
        comparator: Comparator,
        value: &Value,
        b: &mut StatementBuilder,
    ) -> AdapterResult<String> {
        let (expr, param) = if let Some(relative) = value.get("$relativeTime") {
            if target.field_type != Some(&FieldType::Date) {
                return Err(AdapterError::InvalidQuery(
                    "$relativeTime can only be used with Date field".to_string(),
                ));
            }
            let text = relative
                .as_str()
                .ok_or_else(|| AdapterError::InvalidQuery(format!("bad $relativeTime value: {}", relative)))?;
            let resolved = relative_time::resolve(text, self.now.unwrap_or_else(Utc::now))?;
            (target.column(), SqlValue::Timestamp(resolved))
        } else if target.is_dotted() {
            dotted_operand(target.name, value)?
        } else {
            (target.column(), encode_operand(target, value)?)
        };

        Ok(b.bind(&format!("{} {} ?", expr, comparator.sql()), vec![param])?.sql)
    }
}

fn markers(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::String(s) => Value::String(s.clone()),
        Literal::Number(n) => Value::Number(n.clone()),
        Literal::Bool(b) => Value::Bool(*b),
    }
}

fn reject_relative_time(value: &Value) -> AdapterResult<()> {
    if value.get("$relativeTime").is_some() {
        return Err(AdapterError::InvalidQuery(
            "$relativeTime can only be used with the $lt, $lte, $gt, and $gte operators".to_string(),
        ));
    }
    Ok(())
}

/// Parameter for a value compared against a declared column
fn encode_operand(target: &Target, value: &Value) -> AdapterResult<SqlValue> {
    match target.field_type {
        Some(FieldType::Date) if value.is_string() => codec::date_from_value(value).map(SqlValue::Timestamp),
        Some(FieldType::Pointer { .. }) if !value.is_null() => codec::pointer_id(value).map(SqlValue::Text),
        _ => codec::infer_storage(value),
    }
}

/// Expression and parameter for a comparison on a dotted path. The text
/// extracted by `->>` is cast when the operand is a number or a boolean.
fn dotted_operand(path: &str, value: &Value) -> AdapterResult<(String, SqlValue)> {
    let text = json_text_path(path);
    Ok(match value {
        Value::Number(n) => (
            format!("CAST(({}) AS double precision)", text),
            SqlValue::from_number(n),
        ),
        Value::Bool(flag) => (format!("CAST(({}) AS boolean)", text), SqlValue::Bool(*flag)),
        Value::String(s) => (text, SqlValue::Text(s.clone())),
        _ if type_tag(value) == Some("Date") => {
            let ts = codec::date_from_value(value)?;
            (text, SqlValue::Text(codec::format_iso(&ts)))
        }
        _ if type_tag(value) == Some("Pointer") => (text, SqlValue::Text(codec::pointer_id(value)?)),
        other => (text, SqlValue::Text(other.to_string())),
    })
}
