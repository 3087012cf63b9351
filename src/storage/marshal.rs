//! Result rows to documents.
//!
//! Columns holding NULL are dropped from the document instead of being kept
//! as explicit nulls, so a response never contains a null-valued field.

use serde_json::{Map, Value};

use super::codec;
use super::schema::{FieldType, Schema};
use super::value::Row;
use crate::error::AdapterResult;

/// Convert a result row into a document using the declared field types
pub fn row_to_document(schema: &Schema, row: Row) -> AdapterResult<Map<String, Value>> {
    let mut doc = Map::new();

    for (column, raw) in row {
        if raw.is_null() {
            continue;
        }
        let value = match schema.field(&column) {
            Some(field_type) => codec::from_storage(field_type, raw)?,
            None => codec::raw_to_value(raw),
        };
        if !value.is_null() {
            doc.insert(column, value);
        }
    }

    for (name, field_type) in schema.relation_fields() {
        if let FieldType::Relation { target_class } = field_type {
            doc.insert(name.clone(), codec::relation_value(target_class));
        }
    }

    Ok(doc)
}

/// Convert many rows, preserving order
pub fn rows_to_documents(schema: &Schema, rows: Vec<Row>) -> AdapterResult<Vec<Map<String, Value>>> {
    rows.into_iter().map(|row| row_to_document(schema, row)).collect()
}
