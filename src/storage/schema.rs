//! Class schema model
//!
//! A schema describes the fields of one class and how each maps onto a
//! relational column. The schema document itself is persisted in the
//! metadata table so that document-level types (Pointer vs. a plain string
//! column, Relation fields that have no column at all) survive restarts.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::{AdapterError, AdapterResult};

/// Read permission column injected into every class
pub const READ_PERMISSIONS: &str = "_rperm";
/// Write permission column injected into every class
pub const WRITE_PERMISSIONS: &str = "_wperm";

/// Column type used for object identifiers and pointers
pub const ID_COLUMN_TYPE: &str = "varchar(120)";

/// Abstract field type of a schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Bytes,
    File,
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    GeoPoint,
    Polygon,
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<Box<FieldType>>,
    },
}

impl FieldType {
    pub fn array_of(contents: FieldType) -> Self {
        FieldType::Array {
            contents: Some(Box::new(contents)),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array { .. })
    }

    /// Arrays of strings are stored as a native text array
    pub fn is_text_array(&self) -> bool {
        matches!(self, FieldType::Array { contents: Some(c) } if **c == FieldType::String)
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::Relation { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::Object => "Object",
            FieldType::Bytes => "Bytes",
            FieldType::File => "File",
            FieldType::Pointer { .. } => "Pointer",
            FieldType::Relation { .. } => "Relation",
            FieldType::GeoPoint => "GeoPoint",
            FieldType::Polygon => "Polygon",
            FieldType::Array { .. } => "Array",
        }
    }
}

/// Relational column type for a field type.
///
/// Relations are materialized as join tables and have no column.
pub fn column_type(field_type: &FieldType) -> AdapterResult<&'static str> {
    Ok(match field_type {
        FieldType::String => "text",
        FieldType::Date => "timestamp",
        FieldType::Object => "jsonb",
        FieldType::File => "text",
        FieldType::Boolean => "boolean",
        FieldType::Pointer { .. } => ID_COLUMN_TYPE,
        FieldType::Number => "double precision",
        FieldType::GeoPoint => "point",
        FieldType::Bytes => "jsonb",
        FieldType::Polygon => "polygon",
        FieldType::Array { .. } if field_type.is_text_array() => "text[]",
        FieldType::Array { .. } => "jsonb",
        FieldType::Relation { target_class } => {
            return Err(AdapterError::InvalidSchema(format!(
                "Relation<{}> fields are stored in join tables, not columns",
                target_class
            )))
        }
    })
}

/// Per-class schema descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_level_permissions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<BTreeMap<String, Map<String, Value>>>,
}

impl Schema {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// Relation fields, which live in `_Join:<field>:<class>` tables
    pub fn relation_fields(&self) -> impl Iterator<Item = (&String, &FieldType)> {
        self.fields.iter().filter(|(_, t)| t.is_relation())
    }

    /// Fields that are materialized as columns
    pub fn column_fields(&self) -> impl Iterator<Item = (&String, &FieldType)> {
        self.fields.iter().filter(|(_, t)| !t.is_relation())
    }
}

/// Schema as seen by the storage layer: the permission arrays (and the
/// password hash for `_User`) are added. Returns a new schema; the input
/// is left untouched.
pub fn to_storage_schema(schema: &Schema) -> Schema {
    let mut augmented = schema.clone();
    augmented
        .fields
        .insert(READ_PERMISSIONS.to_string(), FieldType::array_of(FieldType::String));
    augmented
        .fields
        .insert(WRITE_PERMISSIONS.to_string(), FieldType::array_of(FieldType::String));
    if schema.class_name == "_User" {
        augmented
            .fields
            .insert("_hashed_password".to_string(), FieldType::String);
    }
    augmented
}

/// Schema as returned to callers: storage-only fields are removed and
/// class-level permissions default to public access.
pub fn to_document_schema(schema: &Schema) -> Schema {
    let mut public = schema.clone();
    public.fields.remove(READ_PERMISSIONS);
    public.fields.remove(WRITE_PERMISSIONS);
    if schema.class_name == "_User" {
        public.fields.remove("_hashed_password");
    }

    let mut clps = default_class_level_permissions();
    if let (Some(defaults), Some(Value::Object(given))) =
        (clps.as_object_mut(), schema.class_level_permissions.as_ref())
    {
        for (k, v) in given {
            defaults.insert(k.clone(), v.clone());
        }
    }
    public.class_level_permissions = Some(clps);

    if public.indexes.as_ref().map_or(true, BTreeMap::is_empty) {
        public.indexes = None;
    }
    public
}

pub fn default_class_level_permissions() -> Value {
    json!({
        "find": {"*": true},
        "get": {"*": true},
        "count": {"*": true},
        "create": {"*": true},
        "update": {"*": true},
        "delete": {"*": true},
        "addField": {"*": true},
        "protectedFields": {"*": []},
    })
}

/// Name of the join table backing a Relation field
pub fn join_table_name(class_name: &str, field_name: &str) -> String {
    format!("_Join:{}:{}", field_name, class_name)
}
