//! Value codec between the document model and storage values.
//!
//! Documents use tagged objects for the non-JSON types
//! (`{"__type": "Date", "iso": ..}`, `{"__type": "Pointer", ..}`, ...);
//! storage uses native column values.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};

use super::geo::{self, GeoPoint};
use super::schema::{FieldType, READ_PERMISSIONS, WRITE_PERMISSIONS};
use super::value::{json_number, SqlValue};
use crate::error::{AdapterError, AdapterResult};

/// `__type` tag of a document value, if any
pub fn type_tag(value: &Value) -> Option<&str> {
    value.get("__type").and_then(Value::as_str)
}

pub fn is_permission_field(name: &str) -> bool {
    name == READ_PERMISSIONS || name == WRITE_PERMISSIONS
}

// ==================== Dates ====================

/// Parse an ISO-8601 timestamp into a naive UTC timestamp
pub fn parse_iso(iso: &str) -> AdapterResult<NaiveDateTime> {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|_| AdapterError::InvalidQuery(format!("invalid date: {}", iso)))
}

/// ISO-8601 with millisecond precision and a `Z` suffix
pub fn format_iso(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn date_value(ts: &NaiveDateTime) -> Value {
    json!({"__type": "Date", "iso": format_iso(ts)})
}

/// Timestamp from either `{__type: "Date", iso}` or a bare ISO string
pub fn date_from_value(value: &Value) -> AdapterResult<NaiveDateTime> {
    match value {
        Value::String(iso) => parse_iso(iso),
        Value::Object(obj) if type_tag(value) == Some("Date") => obj
            .get("iso")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::InvalidQuery(format!("invalid date: {}", value)))
            .and_then(parse_iso),
        _ => Err(AdapterError::InvalidQuery(format!("invalid date: {}", value))),
    }
}

// ==================== Document -> storage ====================

/// Encode a document value for a declared field.
///
/// `field_type` is `None` for fields the schema does not declare; the value's
/// own shape then decides the encoding.
pub fn to_storage(field_name: &str, field_type: Option<&FieldType>, value: &Value) -> AdapterResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    if is_permission_field(field_name) {
        return text_array(field_name, value);
    }

    let field_type = match field_type {
        Some(t) => t,
        None => return infer_storage(value),
    };

    match field_type {
        FieldType::Date => date_from_value(value).map(SqlValue::Timestamp),
        FieldType::Pointer { .. } => pointer_id(value).map(SqlValue::Text),
        FieldType::GeoPoint => GeoPoint::from_value(value).map(|p| SqlValue::Point(p.to_point())),
        FieldType::Polygon => polygon(value),
        FieldType::File => file_name(value).map(SqlValue::Text),
        FieldType::Array { .. } if field_type.is_text_array() => text_array(field_name, value),
        FieldType::Array { .. } | FieldType::Object | FieldType::Bytes => Ok(SqlValue::Json(value.clone())),
        FieldType::Relation { .. } => Err(AdapterError::UnsupportedOperation(format!(
            "field '{}' is a relation and has no column",
            field_name
        ))),
        FieldType::String | FieldType::Number | FieldType::Boolean => Ok(SqlValue::from_json(value)),
    }
}

/// Encoding for values without a declared type
pub fn infer_storage(value: &Value) -> AdapterResult<SqlValue> {
    match type_tag(value) {
        Some("Date") => date_from_value(value).map(SqlValue::Timestamp),
        Some("Pointer") => pointer_id(value).map(SqlValue::Text),
        Some("GeoPoint") => GeoPoint::from_value(value).map(|p| SqlValue::Point(p.to_point())),
        Some("Polygon") => polygon(value),
        Some("File") => file_name(value).map(SqlValue::Text),
        _ => Ok(SqlValue::from_json(value)),
    }
}

pub fn pointer_id(value: &Value) -> AdapterResult<String> {
    match value {
        Value::String(id) => Ok(id.clone()),
        Value::Object(obj) => obj
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::InvalidQuery(format!("invalid pointer: {}", value))),
        _ => Err(AdapterError::InvalidQuery(format!("invalid pointer: {}", value))),
    }
}

fn file_name(value: &Value) -> AdapterResult<String> {
    match value {
        Value::String(name) => Ok(name.clone()),
        _ => value
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::InvalidQuery(format!("invalid file: {}", value))),
    }
}

fn polygon(value: &Value) -> AdapterResult<SqlValue> {
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| AdapterError::Geometry(format!("Polygon requires coordinates: {}", value)))?;
    let coordinates = geo::coordinates_from_value(coordinates)?;
    geo::close_ring(&coordinates).map(SqlValue::Polygon)
}

fn text_array(field_name: &str, value: &Value) -> AdapterResult<SqlValue> {
    let items = value.as_array().ok_or_else(|| {
        AdapterError::InvalidQuery(format!("field '{}' expects an array of strings", field_name))
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                AdapterError::InvalidQuery(format!(
                    "field '{}' expects an array of strings, got {}",
                    field_name, item
                ))
            })
        })
        .collect::<AdapterResult<Vec<_>>>()
        .map(SqlValue::TextArray)
}

// ==================== Storage -> document ====================

/// Decode a stored column value for a declared field
pub fn from_storage(field_type: &FieldType, raw: SqlValue) -> AdapterResult<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }

    match (field_type, raw) {
        (FieldType::Date, SqlValue::Timestamp(ts)) => Ok(date_value(&ts)),
        (FieldType::Date, SqlValue::Text(iso)) => parse_iso(&iso).map(|ts| date_value(&ts)),
        (FieldType::Pointer { target_class }, SqlValue::Text(id)) => Ok(json!({
            "__type": "Pointer",
            "className": target_class,
            "objectId": id,
        })),
        (FieldType::GeoPoint, SqlValue::Point(p)) => Ok(GeoPoint::from_point(&p).to_value()),
        (FieldType::Polygon, SqlValue::Polygon(points)) => Ok(json!({
            "__type": "Polygon",
            "coordinates": geo::open_ring(&points),
        })),
        (FieldType::File, SqlValue::Text(name)) => Ok(json!({"__type": "File", "name": name})),
        (FieldType::Relation { target_class }, _) => Ok(relation_value(target_class)),
        (FieldType::Object | FieldType::Bytes | FieldType::Array { .. }, SqlValue::Text(text)) => {
            Ok(serde_json::from_str(&text)?)
        }
        (_, raw) => Ok(raw_to_value(raw)),
    }
}

pub fn relation_value(target_class: &str) -> Value {
    json!({"__type": "Relation", "className": target_class})
}

/// Schema-less decoding. Timestamps always surface as dates.
pub fn raw_to_value(raw: SqlValue) -> Value {
    match raw {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Bool(b),
        SqlValue::Int(i) => Value::from(i),
        SqlValue::Float(f) => json_number(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::TextArray(items) => Value::Array(items.into_iter().map(Value::String).collect()),
        SqlValue::Json(v) => v,
        SqlValue::Timestamp(ts) => date_value(&ts),
        SqlValue::Point(p) => GeoPoint::from_point(&p).to_value(),
        SqlValue::Polygon(points) => {
            let mut obj = Map::new();
            obj.insert("__type".to_string(), Value::from("Polygon"));
            obj.insert("coordinates".to_string(), json!(geo::open_ring(&points)));
            Value::Object(obj)
        }
    }
}
