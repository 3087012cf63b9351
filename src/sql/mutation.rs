//! Update document to SET-clause compiler.

use serde_json::Value;
use tracing::debug;

use super::builder::{quote_identifier, quote_literal, Bound, StatementBuilder};
use super::update::{FieldUpdate, ObjectPatch, Update};
use crate::error::{AdapterError, AdapterResult};
use crate::storage::codec::{self, type_tag};
use crate::storage::geo::{self, GeoPoint};
use crate::storage::schema::{to_storage_schema, FieldType, Schema};
use crate::storage::SqlValue;

/// Timestamp columns every class carries
const SYSTEM_DATE_FIELDS: [&str; 2] = ["createdAt", "updatedAt"];

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMutation {
    pub set_clause: String,
    pub parameters: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
pub struct MutationCompiler {
    schema: Schema,
}

impl MutationCompiler {
    pub fn new(schema: &Schema) -> Self {
        Self {
            schema: to_storage_schema(schema),
        }
    }

    pub fn compile(&self, update: &Value, start_index: usize) -> AdapterResult<CompiledMutation> {
        let update = Update::parse(update)?;
        let mut builder = StatementBuilder::starting_at(start_index);
        let set_clause = self.compile_into(&update, &mut builder)?;
        debug!(class = %self.schema.class_name, set = %set_clause, "Compiled mutation");
        Ok(CompiledMutation {
            set_clause,
            parameters: builder.into_params(),
        })
    }

    /// Assignments of `update`, comma separated, binding into `builder`
    pub fn compile_into(&self, update: &Update, b: &mut StatementBuilder) -> AdapterResult<String> {
        let mut assignments = Vec::with_capacity(update.fields.len());
        for (name, field_update) in &update.fields {
            if let Some(assignment) = self.assignment(name, field_update, b)? {
                assignments.push(assignment);
            }
        }
        if assignments.is_empty() {
            return Err(AdapterError::InvalidQuery("update has no assignable fields".to_string()));
        }
        Ok(assignments.join(", "))
    }

    fn assignment(
        &self,
        name: &str,
        field_update: &FieldUpdate,
        b: &mut StatementBuilder,
    ) -> AdapterResult<Option<String>> {
        let column = quote_identifier(name);
        let field_type = self.schema.field(name);

        let bound = match field_update {
            FieldUpdate::Unset => b.bind(&format!("{} = NULL", column), Vec::new())?,
            FieldUpdate::Increment(amount) => b.bind(
                &format!("{col} = COALESCE({col}, 0) + ?", col = column),
                vec![SqlValue::from_number(amount)],
            )?,
            FieldUpdate::Add(objects) => array_operation("array_add", &column, field_type, objects, b)?,
            FieldUpdate::Remove(objects) => array_operation("array_remove", &column, field_type, objects, b)?,
            FieldUpdate::AddUnique(objects) => {
                array_operation("array_add_unique", &column, field_type, objects, b)?
            }
            FieldUpdate::AuthData(entries) => {
                let mut expr = column.clone();
                let mut params = Vec::with_capacity(entries.len() * 2);
                for (provider, value) in entries {
                    expr = format!(
                        "json_object_set_key(COALESCE({}, '{{}}'::jsonb), ?::text, ?::jsonb)::jsonb",
                        expr
                    );
                    params.push(SqlValue::Text(provider.clone()));
                    params.push(value.clone().map(SqlValue::Json).unwrap_or(SqlValue::Null));
                }
                b.bind(&format!("{} = {}", column, expr), params)?
            }
            FieldUpdate::Patch(patch) => {
                if !matches!(field_type, Some(FieldType::Object)) {
                    return Err(unsupported(name, "partial update on a non-Object field"));
                }
                object_patch(&column, patch, b)?
            }
            FieldUpdate::Set(value) => return self.replacement(name, &column, field_type, value, b),
        };
        Ok(Some(bound.sql))
    }

    fn replacement(
        &self,
        name: &str,
        column: &str,
        field_type: Option<&FieldType>,
        value: &Value,
        b: &mut StatementBuilder,
    ) -> AdapterResult<Option<String>> {
        let is_date = matches!(field_type, Some(FieldType::Date)) || SYSTEM_DATE_FIELDS.contains(&name);

        let bound = match (type_tag(value), value) {
            (Some("Relation"), _) => return Ok(None),
            (Some("GeoPoint"), _) => {
                let point = GeoPoint::from_value(value)?;
                b.bind(
                    &format!("{} = POINT(?, ?)", column),
                    vec![SqlValue::Float(point.longitude), SqlValue::Float(point.latitude)],
                )?
            }
            (Some("Polygon"), _) => {
                let coordinates = value
                    .get("coordinates")
                    .ok_or_else(|| AdapterError::Geometry(format!("Polygon requires coordinates: {}", value)))?;
                let ring = geo::close_ring(&geo::coordinates_from_value(coordinates)?)?;
                b.bind(
                    &format!("{} = ?::polygon", column),
                    vec![SqlValue::Text(geo::polygon_literal(&ring))],
                )?
            }
            (Some("Date"), _) | (None, Value::String(_)) if is_date => b.bind(
                &format!("{} = ?", column),
                vec![SqlValue::Timestamp(codec::date_from_value(value)?)],
            )?,
            (Some("Pointer" | "File" | "Date"), _) | (None, Value::String(_) | Value::Bool(_) | Value::Number(_)) => {
                b.bind(&format!("{} = ?", column), vec![codec::infer_storage(value)?])?
            }
            (_, Value::Array(_)) => match field_type {
                Some(t @ FieldType::Array { .. }) if t.is_text_array() => b.bind(
                    &format!("{} = ?::text[]", column),
                    vec![codec::to_storage(name, Some(t), value)?],
                )?,
                Some(FieldType::Array { .. }) => {
                    b.bind(&format!("{} = ?::jsonb", column), vec![SqlValue::Json(value.clone())])?
                }
                _ => return Err(unsupported(name, "array assignment to a non-Array field")),
            },
            (_, Value::Object(_)) => match field_type {
                Some(FieldType::Object | FieldType::Bytes) => {
                    b.bind(&format!("{} = ?::jsonb", column), vec![SqlValue::Json(value.clone())])?
                }
                _ => return Err(unsupported(name, &value.to_string())),
            },
            _ => return Err(unsupported(name, &value.to_string())),
        };
        Ok(Some(bound.sql))
    }
}

fn unsupported(name: &str, what: &str) -> AdapterError {
    AdapterError::UnsupportedOperation(format!(
        "Postgres doesn't support update of '{}' ({}) yet",
        name, what
    ))
}

/// `array_add`/`array_remove`/`array_add_unique` over the stored array.
/// Native text arrays are converted to jsonb and back.
fn array_operation(
    function: &str,
    column: &str,
    field_type: Option<&FieldType>,
    objects: &[Value],
    b: &mut StatementBuilder,
) -> AdapterResult<Bound> {
    let param = vec![SqlValue::Json(Value::Array(objects.to_vec()))];
    if field_type.map_or(false, FieldType::is_text_array) {
        return b.bind(
            &format!(
                "{col} = ARRAY(SELECT jsonb_array_elements_text({f}(COALESCE(to_jsonb({col}), '[]'::jsonb), ?::jsonb)))",
                col = column,
                f = function
            ),
            param,
        );
    }
    b.bind(
        &format!(
            "{col} = {f}(COALESCE({col}, '[]'::jsonb), ?::jsonb)",
            col = column,
            f = function
        ),
        param,
    )
}

/// Deleted keys are removed first, then per-key increments and the new
/// values are merged on top.
fn object_patch(
    column: &str,
    patch: &ObjectPatch,
    b: &mut StatementBuilder,
) -> AdapterResult<Bound> {
    let mut expr = if patch.merge {
        format!("COALESCE({}, '{{}}'::jsonb)", column)
    } else {
        "'{}'::jsonb".to_string()
    };
    let mut params = Vec::new();

    for key in &patch.deletes {
        expr.push_str(" - ?::text");
        params.push(SqlValue::Text(key.clone()));
    }
    for (key, amount) in &patch.increments {
        expr.push_str(&format!(
            " || jsonb_build_object(?::text, COALESCE({}->>{}, '0')::double precision + ?)",
            column,
            quote_literal(key)
        ));
        params.push(SqlValue::Text(key.clone()));
        params.push(SqlValue::from_number(amount));
    }
    expr.push_str(" || ?::jsonb");
    params.push(SqlValue::Json(Value::Object(patch.values.clone())));

    b.bind(&format!("{} = ({})", column, expr), params)
}
