//! DDL and schema metadata statements.

use serde_json::Value;
use std::collections::BTreeMap;

use super::builder::{quote_identifier, Statement};
use crate::error::AdapterResult;
use crate::storage::schema::{column_type, join_table_name, to_storage_schema, FieldType, Schema};
use crate::storage::SqlValue;

/// Internal tables dropped together with every class
pub const SYSTEM_CLASSES: [&str; 8] = [
    "_PushStatus",
    "_JobStatus",
    "_JobSchedule",
    "_Hooks",
    "_GlobalConfig",
    "_GraphQLConfig",
    "_Audience",
    "_Idempotency",
];

/// Columns every class table carries, whatever its schema declares
fn default_fields() -> [(&'static str, FieldType); 3] {
    [
        ("objectId", FieldType::String),
        ("createdAt", FieldType::Date),
        ("updatedAt", FieldType::Date),
    ]
}

/// Bookkeeping columns of the `_User` class
fn user_fields() -> [(&'static str, FieldType); 8] {
    [
        ("_email_verify_token_expires_at", FieldType::Date),
        ("_email_verify_token", FieldType::String),
        ("_account_lockout_expires_at", FieldType::Date),
        ("_failed_login_count", FieldType::Number),
        ("_perishable_token", FieldType::String),
        ("_perishable_token_expires_at", FieldType::Date),
        ("_password_changed_at", FieldType::Date),
        ("_password_history", FieldType::Array { contents: None }),
    ]
}

/// Fields materialized as columns of a class table
pub fn table_fields(schema: &Schema) -> BTreeMap<String, FieldType> {
    let storage = to_storage_schema(schema);
    let mut fields: BTreeMap<String, FieldType> = storage
        .column_fields()
        .map(|(name, t)| (name.clone(), t.clone()))
        .collect();
    for (name, t) in default_fields() {
        fields.entry(name.to_string()).or_insert(t);
    }
    if schema.class_name == "_User" {
        for (name, t) in user_fields() {
            fields.entry(name.to_string()).or_insert(t);
        }
    }
    fields
}

/// Builds DDL for a given metadata table and identifier width
#[derive(Debug, Clone)]
pub struct Ddl {
    schema_table: String,
    id_width: usize,
}

impl Ddl {
    pub fn new(schema_table: impl Into<String>, id_width: usize) -> Self {
        Self {
            schema_table: schema_table.into(),
            id_width,
        }
    }

    pub fn schema_table(&self) -> &str {
        &self.schema_table
    }

    fn id_type(&self) -> String {
        format!("varchar({})", self.id_width)
    }

    // ==================== Tables ====================

    pub fn create_schema_table(&self) -> Statement {
        Statement::raw(format!(
            "CREATE TABLE IF NOT EXISTS {} (\"className\" {id}, \"schema\" jsonb, \"isParseClass\" bool, PRIMARY KEY (\"className\"))",
            quote_identifier(&self.schema_table),
            id = self.id_type()
        ))
    }

    pub fn create_table(&self, schema: &Schema) -> AdapterResult<Statement> {
        let mut columns = Vec::new();
        for (name, field_type) in table_fields(schema) {
            columns.push(format!("{} {}", quote_identifier(&name), self.field_column_type(&name, &field_type)?));
            if name == "objectId" {
                columns.push(format!("PRIMARY KEY ({})", quote_identifier(&name)));
            }
        }
        Ok(Statement::raw(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&schema.class_name),
            columns.join(", ")
        )))
    }

    pub fn create_join_table(&self, class_name: &str, field_name: &str) -> Statement {
        Statement::raw(format!(
            "CREATE TABLE IF NOT EXISTS {} (\"relatedId\" {id}, \"owningId\" {id}, PRIMARY KEY (\"relatedId\", \"owningId\"))",
            quote_identifier(&join_table_name(class_name, field_name)),
            id = self.id_type()
        ))
    }

    pub fn drop_table(&self, table: &str) -> Statement {
        Statement::raw(format!("DROP TABLE IF EXISTS {}", quote_identifier(table)))
    }

    pub fn add_column(&self, class_name: &str, field_name: &str, field_type: &FieldType) -> AdapterResult<Statement> {
        Ok(Statement::raw(format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            quote_identifier(class_name),
            quote_identifier(field_name),
            self.field_column_type(field_name, field_type)?
        )))
    }

    /// The object identifier is a bounded varchar like pointers
    fn field_column_type(&self, field_name: &str, field_type: &FieldType) -> AdapterResult<String> {
        if field_name == "objectId" {
            return Ok(self.id_type());
        }
        Ok(column_type(field_type)?.to_string())
    }

    pub fn drop_columns(&self, class_name: &str, field_names: &[String]) -> Option<Statement> {
        if field_names.is_empty() {
            return None;
        }
        let drops: Vec<String> = field_names
            .iter()
            .map(|f| format!("DROP COLUMN IF EXISTS {}", quote_identifier(f)))
            .collect();
        Some(Statement::raw(format!(
            "ALTER TABLE {} {}",
            quote_identifier(class_name),
            drops.join(", ")
        )))
    }

    pub fn table_columns(&self, class_name: &str) -> Statement {
        Statement::new(
            "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
            vec![SqlValue::from(class_name)],
        )
    }

    // ==================== Indexes ====================

    pub fn create_index(&self, class_name: &str, index_name: &str, field_names: &[String]) -> Statement {
        let columns: Vec<String> = field_names.iter().map(|f| quote_identifier(f)).collect();
        Statement::raw(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(index_name),
            quote_identifier(class_name),
            columns.join(", ")
        ))
    }

    /// Index on the given fields; the case insensitive variant indexes
    /// `lower(field)` for prefix matching.
    pub fn ensure_index(
        &self,
        class_name: &str,
        index_name: &str,
        field_names: &[String],
        case_insensitive: bool,
    ) -> Statement {
        let columns: Vec<String> = field_names
            .iter()
            .map(|f| {
                if case_insensitive {
                    format!("lower({}) varchar_pattern_ops", quote_identifier(f))
                } else {
                    quote_identifier(f)
                }
            })
            .collect();
        Statement::raw(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(index_name),
            quote_identifier(class_name),
            columns.join(", ")
        ))
    }

    pub fn drop_index(&self, index_name: &str) -> Statement {
        Statement::raw(format!("DROP INDEX IF EXISTS {}", quote_identifier(index_name)))
    }

    pub fn list_indexes(&self, class_name: &str) -> Statement {
        Statement::new(
            "SELECT indexname, indexdef FROM pg_indexes WHERE tablename = $1",
            vec![SqlValue::from(class_name)],
        )
    }

    pub fn add_unique_constraint(&self, class_name: &str, field_names: &[String]) -> Statement {
        let columns: Vec<String> = field_names.iter().map(|f| quote_identifier(f)).collect();
        Statement::raw(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            quote_identifier(class_name),
            quote_identifier(&unique_constraint_name(class_name, field_names)),
            columns.join(", ")
        ))
    }

    // ==================== Metadata ====================

    /// Metadata row insert; an existing row for the class is kept
    pub fn insert_schema(&self, schema: &Schema) -> AdapterResult<Statement> {
        Ok(Statement::new(
            format!(
                "INSERT INTO {} (\"className\", \"schema\", \"isParseClass\") VALUES ($1, $2::jsonb, true) ON CONFLICT (\"className\") DO NOTHING",
                quote_identifier(&self.schema_table)
            ),
            vec![
                SqlValue::from(schema.class_name.as_str()),
                SqlValue::Json(serde_json::to_value(schema)?),
            ],
        ))
    }

    pub fn select_schema(&self, class_name: &str) -> Statement {
        Statement::new(
            format!(
                "SELECT \"schema\" FROM {} WHERE \"className\" = $1",
                quote_identifier(&self.schema_table)
            ),
            vec![SqlValue::from(class_name)],
        )
    }

    pub fn select_all_schemas(&self) -> Statement {
        Statement::raw(format!(
            "SELECT \"className\", \"schema\" FROM {}",
            quote_identifier(&self.schema_table)
        ))
    }

    pub fn class_exists(&self, class_name: &str) -> Statement {
        Statement::new(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1) AS \"exists\"",
            vec![SqlValue::from(class_name)],
        )
    }

    /// Rows only when the field is already declared in the metadata row
    pub fn select_declared_field(&self, class_name: &str, field_name: &str) -> Statement {
        Statement::new(
            format!(
                "SELECT \"schema\" FROM {} WHERE \"className\" = $1 AND (\"schema\"::jsonb->'fields'->$2) IS NOT NULL",
                quote_identifier(&self.schema_table)
            ),
            vec![SqlValue::from(class_name), SqlValue::from(field_name)],
        )
    }

    /// Set `schema.<path>` of a metadata row
    pub fn set_schema_path(&self, class_name: &str, path: &[&str], value: Value) -> Statement {
        let path = format!("{{{}}}", path.join(","));
        Statement::new(
            format!(
                "UPDATE {} SET \"schema\" = jsonb_set(\"schema\", $1::text[], $2::jsonb) WHERE \"className\" = $3",
                quote_identifier(&self.schema_table)
            ),
            vec![SqlValue::Text(path), SqlValue::Json(value), SqlValue::from(class_name)],
        )
    }

    pub fn update_schema(&self, schema: &Schema) -> AdapterResult<Statement> {
        Ok(Statement::new(
            format!(
                "UPDATE {} SET \"schema\" = $1::jsonb WHERE \"className\" = $2",
                quote_identifier(&self.schema_table)
            ),
            vec![
                SqlValue::Json(serde_json::to_value(schema)?),
                SqlValue::from(schema.class_name.as_str()),
            ],
        ))
    }

    pub fn delete_schema(&self, class_name: &str) -> Statement {
        Statement::new(
            format!(
                "DELETE FROM {} WHERE \"className\" = $1",
                quote_identifier(&self.schema_table)
            ),
            vec![SqlValue::from(class_name)],
        )
    }
}

/// `<class>_unique_<sorted fields>`
pub fn unique_constraint_name(class_name: &str, field_names: &[String]) -> String {
    let mut sorted = field_names.to_vec();
    sorted.sort();
    format!("{}_unique_{}", class_name, sorted.join("_"))
}

/// Default name of an index created by `ensure_index`
pub fn default_index_name(field_names: &[String]) -> String {
    let mut sorted = field_names.to_vec();
    sorted.sort();
    format!("pgdoc_default_{}", sorted.join("_"))
}
