//! Document operations on a PostgreSQL backend.
//!
//! [`PostgresAdapter`] is the surface the request layer calls: it compiles
//! queries and updates into statements, runs them through a [`SqlExecutor`]
//! and turns result rows back into documents. Its operations are split
//! across `schema` (class lifecycle), `objects` (CRUD, count, distinct,
//! aggregate) and `indexes`.

pub mod executor;
mod indexes;
mod objects;
mod schema;

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub use executor::{SqlExecutor, SqlTransaction, Transaction};
pub use indexes::{IndexInfo, IndexSpec};

use crate::config::AdapterConfig;
use crate::error::{AdapterError, AdapterResult, EngineError};
use crate::sql::{Ddl, PredicateCompiler, Statement};
use crate::storage::schema::Schema;
use crate::storage::{Row, SqlValue};

pub struct PostgresAdapter<E: SqlExecutor> {
    executor: Arc<E>,
    config: AdapterConfig,
    ddl: Ddl,
}

impl<E: SqlExecutor> Clone for PostgresAdapter<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            config: self.config.clone(),
            ddl: self.ddl.clone(),
        }
    }
}

impl<E: SqlExecutor> PostgresAdapter<E> {
    pub fn new(executor: E, config: AdapterConfig) -> Self {
        Self::with_shared(Arc::new(executor), config)
    }

    pub fn with_shared(executor: Arc<E>, config: AdapterConfig) -> Self {
        let ddl = Ddl::new(config.schema_table.clone(), config.join_id_width);
        Self {
            executor,
            config,
            ddl,
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Predicate compiler for a class, honoring the configured text language
    fn predicates(&self, class_name: &str, schema: &Schema, case_insensitive: bool) -> PredicateCompiler {
        PredicateCompiler::new(&named(class_name, schema))
            .case_insensitive(case_insensitive)
            .text_language(self.config.text_search_language.clone())
    }

    fn trace(&self, statement: &Statement) {
        if self.config.log_statements {
            debug!(sql = %statement.sql, params = statement.params.len(), "Executing statement");
        }
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        self.trace(statement);
        self.executor.query(statement).await
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, EngineError> {
        self.trace(statement);
        self.executor.execute(statement).await
    }

    async fn begin(&self) -> AdapterResult<Transaction> {
        Transaction::begin(self.executor.as_ref()).await
    }
}

/// Copy of `schema` carrying `class_name`
fn named(class_name: &str, schema: &Schema) -> Schema {
    let mut schema = schema.clone();
    schema.class_name = class_name.to_string();
    schema
}

/// A JSON column value, whether the driver decoded it or not
fn json_column(row: &Row, column: &str) -> AdapterResult<Option<Value>> {
    match row.get(column) {
        Some(SqlValue::Json(value)) => Ok(Some(value.clone())),
        Some(SqlValue::Text(text)) => Ok(Some(serde_json::from_str(text)?)),
        Some(SqlValue::Null) | None => Ok(None),
        Some(other) => Err(AdapterError::Internal(format!(
            "column '{}' holds {:?}, expected json",
            column, other
        ))),
    }
}

fn int_column(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(SqlValue::as_i64)
}
