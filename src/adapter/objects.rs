//! Object operations: create, find, update, delete, count, distinct and
//! aggregate.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{int_column, named, PostgresAdapter, SqlExecutor};
use crate::error::{AdapterError, AdapterResult};
use crate::sql::aggregate::{finalize_results, AggregationCompiler};
use crate::sql::statements::{self, FindOptions};
use crate::storage::codec;
use crate::storage::marshal::rows_to_documents;
use crate::storage::schema::{to_storage_schema, Schema};
use crate::storage::{Row, SqlValue};

/// Every column of a row decoded without a schema
fn raw_row(row: Row) -> Map<String, Value> {
    row.into_iter()
        .map(|(column, raw)| (column, codec::raw_to_value(raw)))
        .collect()
}

fn as_object(value: &Value) -> AdapterResult<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| AdapterError::InvalidQuery(format!("expected an object, got {}", value)))
}

impl<E: SqlExecutor> PostgresAdapter<E> {
    /// Insert one object. A unique violation surfaces as `DuplicateValue`.
    pub async fn create_object(&self, class_name: &str, schema: &Schema, object: &Value) -> AdapterResult<Value> {
        let schema = named(class_name, schema);
        let statement = statements::insert(&schema, as_object(object)?)?;
        self.execute(&statement).await?;
        Ok(object.clone())
    }

    /// Matching objects as documents, or the raw plan rows when
    /// `options.explain` is set
    pub async fn find(
        &self,
        class_name: &str,
        schema: &Schema,
        query: &Value,
        options: &FindOptions,
    ) -> AdapterResult<Vec<Value>> {
        let predicates = self.predicates(class_name, schema, options.case_insensitive);
        let statement = statements::find(&predicates, query, options)?;
        let rows = match self.query(&statement).await {
            Ok(rows) => rows,
            Err(err) if err.is_missing_table() => {
                debug!(class = %class_name, "Find on missing table");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        if options.explain {
            return Ok(rows.into_iter().map(|row| Value::Object(raw_row(row))).collect());
        }
        let documents = rows_to_documents(predicates.schema(), rows)?;
        Ok(documents.into_iter().map(Value::Object).collect())
    }

    /// Number of matching objects. Unfiltered counts may come from the
    /// catalog estimate.
    pub async fn count(&self, class_name: &str, schema: &Schema, query: &Value) -> AdapterResult<u64> {
        let unfiltered = query.as_object().map_or(true, Map::is_empty);
        if unfiltered && self.config.estimate_count {
            if let Some(estimate) = self.estimated_count(class_name).await? {
                return Ok(estimate);
            }
        }

        let predicates = self.predicates(class_name, schema, false);
        let statement = statements::count(&predicates, query)?;
        match self.query(&statement).await {
            Ok(rows) => Ok(rows
                .first()
                .and_then(|row| int_column(row, "count"))
                .map_or(0, |n| n.max(0) as u64)),
            Err(err) if err.is_missing_table() => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Catalog estimate; `None` when the table was never analyzed
    async fn estimated_count(&self, class_name: &str) -> AdapterResult<Option<u64>> {
        let rows = self.query(&statements::estimated_count(class_name)).await?;
        let estimate = rows
            .first()
            .and_then(|row| row.get("approximate_row_count"))
            .and_then(SqlValue::as_f64);
        Ok(match estimate {
            Some(n) if n >= 0.0 => Some(n as u64),
            _ => None,
        })
    }

    /// Distinct values of a field among matching objects
    pub async fn distinct(
        &self,
        class_name: &str,
        schema: &Schema,
        query: &Value,
        field_name: &str,
    ) -> AdapterResult<Vec<Value>> {
        let predicates = self.predicates(class_name, schema, false);
        let plan = statements::distinct(&predicates, query, field_name)?;
        match self.query(&plan.statement).await {
            Ok(rows) => statements::distinct_values(&plan, rows),
            Err(err) if err.is_missing_column() || err.is_missing_table() => {
                debug!(class = %class_name, field = %field_name, "Distinct on missing column");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply an update to every matching object, returning the updated
    /// documents
    pub async fn update_objects_by_query(
        &self,
        class_name: &str,
        schema: &Schema,
        query: &Value,
        update: &Value,
    ) -> AdapterResult<Vec<Value>> {
        let predicates = self.predicates(class_name, schema, false);
        let statement = statements::update(&predicates, query, update)?;
        let rows = self.query(&statement).await?;
        let documents = rows_to_documents(predicates.schema(), rows)?;
        Ok(documents.into_iter().map(Value::Object).collect())
    }

    /// Update matching objects and return the first one
    pub async fn find_one_and_update(
        &self,
        class_name: &str,
        schema: &Schema,
        query: &Value,
        update: &Value,
    ) -> AdapterResult<Option<Value>> {
        let mut updated = self
            .update_objects_by_query(class_name, schema, query, update)
            .await?;
        if updated.is_empty() {
            return Ok(None);
        }
        Ok(Some(updated.swap_remove(0)))
    }

    /// Create the object made of `query` and `update`, or update the
    /// existing one when it collides with a unique value
    pub async fn upsert_one_object(
        &self,
        class_name: &str,
        schema: &Schema,
        query: &Value,
        update: &Value,
    ) -> AdapterResult<Option<Value>> {
        let mut object = as_object(query)?.clone();
        for (key, value) in as_object(update)? {
            object.insert(key.clone(), value.clone());
        }
        match self
            .create_object(class_name, schema, &Value::Object(object))
            .await
        {
            Ok(created) => Ok(Some(created)),
            Err(AdapterError::DuplicateValue { field }) => {
                debug!(class = %class_name, field = ?field, "Upsert collided, updating");
                self.find_one_and_update(class_name, schema, query, update)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Delete matching objects, returning how many were deleted.
    /// Deleting nothing is `ObjectNotFound`; a missing table deletes 0.
    pub async fn delete_objects_by_query(&self, class_name: &str, schema: &Schema, query: &Value) -> AdapterResult<u64> {
        let predicates = self.predicates(class_name, schema, false);
        let statement = statements::delete(&predicates, query)?;
        let rows = match self.query(&statement).await {
            Ok(rows) => rows,
            Err(err) if err.is_missing_table() => {
                warn!(class = %class_name, "Delete on missing table");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let deleted = rows
            .first()
            .and_then(|row| int_column(row, "count"))
            .unwrap_or(0);
        if deleted == 0 {
            return Err(AdapterError::ObjectNotFound);
        }
        Ok(deleted as u64)
    }

    /// Run an aggregation pipeline
    pub async fn aggregate(&self, class_name: &str, schema: &Schema, pipeline: &[Value]) -> AdapterResult<Vec<Value>> {
        let predicates = self.predicates(class_name, schema, false);
        let plan = AggregationCompiler::new(predicates).compile(class_name, pipeline)?;
        let rows = match self.query(&plan.statement).await {
            Ok(rows) => rows,
            Err(err) if err.is_missing_table() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let storage = to_storage_schema(&named(class_name, schema));
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            let mut doc = Map::new();
            for (column, raw) in row {
                let value = match storage.field(&column) {
                    Some(field_type) => codec::from_storage(field_type, raw)?,
                    None => codec::raw_to_value(raw),
                };
                doc.insert(column, value);
            }
            decoded.push(doc);
        }
        Ok(finalize_results(&plan, decoded))
    }
}
