//! Index management.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{PostgresAdapter, SqlExecutor};
use crate::error::{AdapterError, AdapterResult, SqlState};
use crate::sql::ddl::{default_index_name, unique_constraint_name};
use crate::storage::schema::{FieldType, Schema};
use crate::storage::SqlValue;

/// Index to create: a name and the indexed fields, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Index as reported by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

fn is_delete(spec: &Value) -> bool {
    spec.get("__op").and_then(Value::as_str) == Some("Delete")
}

impl<E: SqlExecutor> PostgresAdapter<E> {
    pub async fn create_indexes(&self, class_name: &str, indexes: &[IndexSpec]) -> AdapterResult<()> {
        let mut tx = self.begin().await?;
        let mut outcome = Ok(());
        for index in indexes {
            let statement = self.ddl.create_index(class_name, &index.name, &index.fields);
            if let Err(err) = tx.execute(&statement).await {
                outcome = Err(err.into());
                break;
            }
        }
        tx.finish(outcome).await
    }

    pub async fn drop_indexes(&self, class_name: &str, names: &[String]) -> AdapterResult<()> {
        let mut tx = self.begin().await?;
        let mut outcome = Ok(());
        for name in names {
            if let Err(err) = tx.execute(&self.ddl.drop_index(name)).await {
                outcome = Err(err.into());
                break;
            }
        }
        tx.finish(outcome).await?;
        debug!(class = %class_name, indexes = ?names, "Dropped indexes");
        Ok(())
    }

    pub async fn get_indexes(&self, class_name: &str) -> AdapterResult<Vec<IndexInfo>> {
        let rows = self.query(&self.ddl.list_indexes(class_name)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get("indexname").and_then(SqlValue::as_str)?;
                let definition = row.get("indexdef").and_then(SqlValue::as_str).unwrap_or_default();
                Some(IndexInfo {
                    name: name.to_string(),
                    definition: definition.to_string(),
                })
            })
            .collect())
    }

    /// Apply index changes given in schema form.
    ///
    /// `submitted` maps index names to `{field: 1, ...}` or to
    /// `{"__op": "Delete"}`. Returns the resulting index map, which is also
    /// persisted in the metadata row.
    pub async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: &BTreeMap<String, Map<String, Value>>,
        fields: &BTreeMap<String, FieldType>,
    ) -> AdapterResult<BTreeMap<String, Map<String, Value>>> {
        let mut indexes = existing.clone();
        if indexes.is_empty() {
            let mut id = Map::new();
            id.insert("_id".to_string(), json!(1));
            indexes.insert("_id_".to_string(), id);
        }

        let mut inserted = Vec::new();
        let mut deleted = Vec::new();
        for (name, spec) in submitted {
            let exists = indexes.contains_key(name);
            if exists && !is_delete(spec) {
                return Err(AdapterError::InvalidQuery(format!(
                    "Index {} exists, cannot update.",
                    name
                )));
            }
            if !exists && is_delete(spec) {
                return Err(AdapterError::InvalidQuery(format!(
                    "Index {} does not exist, cannot delete.",
                    name
                )));
            }

            if is_delete(spec) {
                deleted.push(name.clone());
                indexes.remove(name);
                continue;
            }

            let keys = spec.as_object().ok_or_else(|| {
                AdapterError::InvalidQuery(format!("Index {} must map fields to a direction", name))
            })?;
            for key in keys.keys() {
                if !fields.contains_key(key) {
                    return Err(AdapterError::InvalidQuery(format!(
                        "Field {} does not exist, cannot add index.",
                        key
                    )));
                }
            }
            inserted.push(IndexSpec::new(name.clone(), keys.keys().cloned()));
            indexes.insert(name.clone(), keys.clone());
        }

        let mut tx = self.begin().await?;
        let outcome = async {
            for index in &inserted {
                tx.execute(&self.ddl.create_index(class_name, &index.name, &index.fields))
                    .await?;
            }
            for name in &deleted {
                tx.execute(&self.ddl.drop_index(name)).await?;
            }
            tx.execute(&self.ddl.set_schema_path(
                class_name,
                &["indexes"],
                serde_json::to_value(&indexes)?,
            ))
            .await?;
            Ok::<(), AdapterError>(())
        }
        .await;
        tx.finish(outcome).await?;
        debug!(
            class = %class_name,
            inserted = inserted.len(),
            deleted = deleted.len(),
            "Updated indexes"
        );
        Ok(indexes)
    }

    /// Create an index unless it exists. Returns the index name.
    pub async fn ensure_index(
        &self,
        class_name: &str,
        field_names: &[String],
        index_name: Option<&str>,
        case_insensitive: bool,
    ) -> AdapterResult<String> {
        let name = index_name
            .map(str::to_string)
            .unwrap_or_else(|| default_index_name(field_names));
        let statement = self
            .ddl
            .ensure_index(class_name, &name, field_names, case_insensitive);
        match self.execute(&statement).await {
            Ok(_) => Ok(name),
            Err(err) if err.has_code(SqlState::DUPLICATE_TABLE) && err.root().message.contains(&name) => {
                debug!(class = %class_name, index = %name, "Index already exists");
                Ok(name)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enforce uniqueness over `field_names`. Existing duplicates fail
    /// with `DuplicateValue`; an existing constraint is accepted.
    pub async fn ensure_uniqueness(
        &self,
        class_name: &str,
        schema: &Schema,
        field_names: &[String],
    ) -> AdapterResult<()> {
        for field in field_names {
            if schema.field(field).is_none() && !matches!(field.as_str(), "objectId" | "createdAt" | "updatedAt") {
                return Err(AdapterError::InvalidQuery(format!(
                    "Field {} does not exist, cannot enforce uniqueness.",
                    field
                )));
            }
        }

        let constraint = unique_constraint_name(class_name, field_names);
        match self
            .execute(&self.ddl.add_unique_constraint(class_name, field_names))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_schema_race() => {
                warn!(class = %class_name, constraint = %constraint, "Unique constraint already exists");
                Ok(())
            }
            Err(err) if err.is_unique_violation() => Err(AdapterError::DuplicateValue {
                field: field_names.first().cloned(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}
