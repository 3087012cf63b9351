//! Class lifecycle: tables, join tables, columns and the metadata table.
//!
//! Concurrent requests evolving the same class are expected. Every DDL
//! statement tolerates "already exists" failures from a racing request;
//! any other failure aborts the enclosing transaction and is reported as
//! the first statement error.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{json_column, named, PostgresAdapter, SqlExecutor, Transaction};
use crate::error::{AdapterError, AdapterResult, EngineError};
use crate::sql::ddl::{table_fields, SYSTEM_CLASSES};
use crate::sql::functions::helper_functions;
use crate::storage::schema::{join_table_name, to_document_schema, FieldType, Schema};
use crate::storage::{Row, SqlValue};

/// Races between concurrent `CREATE TABLE`s may also surface as a unique
/// violation on the engine's type catalog.
fn benign_create(err: &EngineError) -> bool {
    err.is_schema_race() || err.is_unique_violation()
}

impl<E: SqlExecutor> PostgresAdapter<E> {
    /// Create the metadata table and install the SQL helper functions
    pub async fn perform_initialization(&self) -> AdapterResult<()> {
        self.ensure_schema_table().await?;

        let mut tx = self.begin().await?;
        let mut outcome = Ok(());
        for (name, statement) in helper_functions() {
            debug!(function = %name, "Installing helper function");
            if let Err(err) = tx.execute(&statement).await {
                outcome = Err(err.into());
                break;
            }
        }
        tx.finish(outcome).await?;
        info!(schema_table = %self.config.schema_table, "Adapter initialized");
        Ok(())
    }

    async fn ensure_schema_table(&self) -> AdapterResult<()> {
        match self.execute(&self.ddl.create_schema_table()).await {
            Ok(_) => Ok(()),
            Err(err) if benign_create(&err) => {
                warn!(error = %err, "Metadata table created concurrently");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create the table, join tables and metadata row of a class. Safe to
    /// call concurrently for the same class.
    pub async fn create_class(&self, class_name: &str, schema: &Schema) -> AdapterResult<Schema> {
        let schema = named(class_name, schema);
        let mut tx = self.begin().await?;
        let outcome = self.create_class_in(&mut tx, &schema).await;
        tx.finish(outcome).await?;
        info!(class = %class_name, "Created class");
        Ok(to_document_schema(&schema))
    }

    async fn create_class_in(&self, tx: &mut Transaction, schema: &Schema) -> AdapterResult<()> {
        self.create_table_in(tx, schema).await?;
        tx.execute(&self.ddl.insert_schema(schema)?).await?;
        Ok(())
    }

    async fn create_table_in(&self, tx: &mut Transaction, schema: &Schema) -> AdapterResult<()> {
        tx.execute_absorbing(&self.ddl.create_table(schema)?, benign_create)
            .await?;
        for (field_name, _) in schema.relation_fields() {
            tx.execute_absorbing(
                &self.ddl.create_join_table(&schema.class_name, field_name),
                benign_create,
            )
            .await?;
        }
        Ok(())
    }

    /// Add a column (or join table) and declare the field in the metadata
    /// row. Both steps are no-ops when already done.
    pub async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> AdapterResult<()> {
        let mut tx = self.begin().await?;
        let outcome = self
            .add_field_in(&mut tx, class_name, field_name, field_type)
            .await;
        tx.finish(outcome).await
    }

    async fn add_field_in(
        &self,
        tx: &mut Transaction,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> AdapterResult<()> {
        if field_type.is_relation() {
            tx.execute_absorbing(&self.ddl.create_join_table(class_name, field_name), benign_create)
                .await?;
        } else {
            let statement = self.ddl.add_column(class_name, field_name, field_type)?;
            let applied = tx
                .execute_absorbing(&statement, |err| err.is_schema_race() || err.is_missing_table())
                .await?;
            if !applied && !self.table_exists_in(tx, class_name).await? {
                debug!(class = %class_name, field = %field_name, "Creating missing table for new field");
                let schema = Schema::new(class_name).with_field(field_name, field_type.clone());
                self.create_class_in(tx, &schema).await?;
            }
        }

        let declared = tx
            .query(&self.ddl.select_declared_field(class_name, field_name))
            .await?;
        if declared.is_empty() {
            tx.execute(&self.ddl.set_schema_path(
                class_name,
                &["fields", field_name],
                serde_json::to_value(field_type)?,
            ))
            .await?;
        }
        Ok(())
    }

    async fn table_exists_in(&self, tx: &mut Transaction, class_name: &str) -> AdapterResult<bool> {
        let rows = tx.query(&self.ddl.class_exists(class_name)).await?;
        Ok(exists_flag(&rows))
    }

    /// Replace the declared options of a field
    pub async fn update_field_options(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> AdapterResult<()> {
        self.execute(&self.ddl.set_schema_path(
            class_name,
            &["fields", field_name],
            serde_json::to_value(field_type)?,
        ))
        .await?;
        Ok(())
    }

    /// Remove fields from the metadata row and drop their columns.
    ///
    /// Relation fields only lose their declaration.
    pub async fn delete_fields(
        &self,
        class_name: &str,
        schema: &Schema,
        field_names: &[String],
    ) -> AdapterResult<()> {
        let mut remaining = named(class_name, schema);
        let mut columns = Vec::new();
        for name in field_names {
            match remaining.fields.remove(name) {
                Some(field_type) if !field_type.is_relation() => columns.push(name.clone()),
                Some(_) => {}
                None => columns.push(name.clone()),
            }
        }

        let mut tx = self.begin().await?;
        let outcome = async {
            tx.execute(&self.ddl.update_schema(&remaining)?).await?;
            if let Some(statement) = self.ddl.drop_columns(class_name, &columns) {
                tx.execute(&statement).await?;
            }
            Ok::<(), AdapterError>(())
        }
        .await;
        tx.finish(outcome).await?;
        debug!(class = %class_name, fields = ?field_names, "Deleted fields");
        Ok(())
    }

    pub async fn set_class_level_permissions(&self, class_name: &str, permissions: &Value) -> AdapterResult<()> {
        self.ensure_schema_table().await?;
        self.execute(&self.ddl.set_schema_path(
            class_name,
            &["classLevelPermissions"],
            permissions.clone(),
        ))
        .await?;
        Ok(())
    }

    pub async fn class_exists(&self, class_name: &str) -> AdapterResult<bool> {
        let rows = self.query(&self.ddl.class_exists(class_name)).await?;
        Ok(exists_flag(&rows))
    }

    /// Stored schema of a class, as returned to callers
    pub async fn get_class(&self, class_name: &str) -> AdapterResult<Schema> {
        let rows = self.query(&self.ddl.select_schema(class_name)).await?;
        let row = rows
            .first()
            .ok_or_else(|| AdapterError::ClassNotFound(class_name.to_string()))?;
        let stored = json_column(row, "schema")?
            .ok_or_else(|| AdapterError::ClassNotFound(class_name.to_string()))?;
        Ok(to_document_schema(&parse_schema(class_name, stored)?))
    }

    pub async fn get_all_classes(&self) -> AdapterResult<Vec<Schema>> {
        self.ensure_schema_table().await?;
        let rows = self.query(&self.ddl.select_all_schemas()).await?;
        let mut schemas = Vec::with_capacity(rows.len());
        for row in &rows {
            let class_name = row
                .get("className")
                .and_then(SqlValue::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(stored) = json_column(row, "schema")? {
                schemas.push(to_document_schema(&parse_schema(&class_name, stored)?));
            }
        }
        Ok(schemas)
    }

    /// Drop the table of a class and its metadata row
    pub async fn delete_class(&self, class_name: &str) -> AdapterResult<()> {
        let mut tx = self.begin().await?;
        let outcome = async {
            tx.execute(&self.ddl.drop_table(class_name)).await?;
            tx.execute(&self.ddl.delete_schema(class_name)).await?;
            Ok::<(), AdapterError>(())
        }
        .await;
        tx.finish(outcome).await?;
        info!(class = %class_name, "Deleted class");
        Ok(())
    }

    /// Drop every class table, join table, internal table and the
    /// metadata table itself
    pub async fn delete_all_classes(&self) -> AdapterResult<()> {
        let rows = match self.query(&self.ddl.select_all_schemas()).await {
            Ok(rows) => rows,
            Err(err) if err.is_missing_table() => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut tables: Vec<String> = vec![self.ddl.schema_table().to_string()];
        tables.extend(SYSTEM_CLASSES.iter().map(|c| c.to_string()));
        for row in &rows {
            let class_name = match row.get("className").and_then(SqlValue::as_str) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if let Some(stored) = json_column(row, "schema")? {
                let schema = parse_schema(&class_name, stored)?;
                tables.extend(
                    schema
                        .relation_fields()
                        .map(|(field, _)| join_table_name(&class_name, field)),
                );
            }
            tables.push(class_name);
        }

        let mut tx = self.begin().await?;
        let mut outcome = Ok(());
        for table in &tables {
            if let Err(err) = tx.execute(&self.ddl.drop_table(table)).await {
                outcome = Err(err.into());
                break;
            }
        }
        tx.finish(outcome).await?;
        info!(tables = tables.len(), "Deleted all classes");
        Ok(())
    }

    /// Add every declared field the table is missing
    pub async fn schema_upgrade(&self, class_name: &str, schema: &Schema) -> AdapterResult<()> {
        let rows = self.query(&self.ddl.table_columns(class_name)).await?;
        let columns: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("column_name").and_then(SqlValue::as_str))
            .collect();

        let schema = named(class_name, schema);
        let mut missing: Vec<(String, FieldType)> = schema
            .relation_fields()
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect();
        missing.extend(
            table_fields(&schema)
                .into_iter()
                .filter(|(name, _)| !columns.contains(&name.as_str())),
        );

        for (field_name, field_type) in missing {
            debug!(class = %class_name, field = %field_name, "Upgrading schema");
            self.add_field_if_not_exists(class_name, &field_name, &field_type)
                .await?;
        }
        Ok(())
    }
}

fn exists_flag(rows: &[Row]) -> bool {
    rows.first()
        .and_then(|row| row.get("exists"))
        .map_or(false, |v| matches!(v, SqlValue::Bool(true)))
}

fn parse_schema(class_name: &str, stored: Value) -> AdapterResult<Schema> {
    let mut schema: Schema = serde_json::from_value(stored)
        .map_err(|e| AdapterError::InvalidSchema(format!("class '{}': {}", class_name, e)))?;
    if schema.class_name.is_empty() {
        schema.class_name = class_name.to_string();
    }
    Ok(schema)
}
