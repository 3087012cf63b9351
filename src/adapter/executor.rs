//! Statement execution boundary.
//!
//! The adapter never talks to a connection directly: a driver implements
//! [`SqlExecutor`] and reports failures as [`EngineError`] carrying the
//! SQLSTATE code, which the adapter classifies in one place.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterResult, EngineError};
use crate::sql::Statement;
use crate::storage::Row;

/// Runs statements against the relational engine
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement and return its rows
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, EngineError>;

    /// Run a statement and return the number of affected rows
    async fn execute(&self, statement: &Statement) -> Result<u64, EngineError>;

    /// Open a transaction on a dedicated connection
    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, EngineError>;
}

/// An open transaction
#[async_trait]
pub trait SqlTransaction: Send {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, EngineError>;

    async fn execute(&mut self, statement: &Statement) -> Result<u64, EngineError>;

    async fn commit(self: Box<Self>) -> Result<(), EngineError>;

    async fn rollback(self: Box<Self>) -> Result<(), EngineError>;
}

/// Transaction that remembers the first statement failure.
///
/// Once a statement fails the engine rejects every later statement with an
/// "aborted transaction" error; [`Transaction::finish`] surfaces the
/// original failure instead.
pub struct Transaction {
    inner: Box<dyn SqlTransaction>,
    first_error: Option<EngineError>,
    savepoints: usize,
}

impl Transaction {
    pub async fn begin<E: SqlExecutor + ?Sized>(executor: &E) -> AdapterResult<Self> {
        let inner = executor.begin().await?;
        Ok(Self {
            inner,
            first_error: None,
            savepoints: 0,
        })
    }

    pub async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        let result = self.inner.query(statement).await;
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<u64, EngineError> {
        let result = self.inner.execute(statement).await;
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    /// Run a statement under a savepoint. Failures accepted by `benign` are
    /// rolled back to the savepoint and absorbed; returns whether the
    /// statement took effect.
    pub async fn execute_absorbing(
        &mut self,
        statement: &Statement,
        benign: fn(&EngineError) -> bool,
    ) -> Result<bool, EngineError> {
        self.savepoints += 1;
        let name = format!("pgdoc_sp_{}", self.savepoints);
        self.execute(&Statement::raw(format!("SAVEPOINT {}", name))).await?;

        match self.inner.execute(statement).await {
            Ok(_) => {
                self.execute(&Statement::raw(format!("RELEASE SAVEPOINT {}", name)))
                    .await?;
                Ok(true)
            }
            Err(err) if benign(&err) => {
                warn!(error = %err, "Absorbed concurrent schema change");
                self.execute(&Statement::raw(format!("ROLLBACK TO SAVEPOINT {}", name)))
                    .await?;
                Ok(false)
            }
            Err(err) => {
                self.record(&err);
                Err(err)
            }
        }
    }

    fn record(&mut self, err: &EngineError) {
        if self.first_error.is_none() {
            self.first_error = Some(err.clone());
        }
    }

    /// Commit when `outcome` succeeded, roll back otherwise
    pub async fn finish<T>(self, outcome: AdapterResult<T>) -> AdapterResult<T> {
        match outcome {
            Ok(value) => {
                self.inner.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "Rolling back transaction");
                if let Err(rollback) = self.inner.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                match self.first_error {
                    Some(first) => Err(AdapterError::from(first)),
                    None => Err(err),
                }
            }
        }
    }
}
