//! Common test utilities for adapter tests
//!
//! Provides a recording executor that:
//! - Logs every statement, including transaction control
//! - Answers statements from scripted replies matched by SQL substring
//! - Rejects statements after a failure inside a transaction, the way the
//!   engine does, until the transaction rolls back to a savepoint

#![allow(dead_code)]

use async_trait::async_trait;
use pgdoc::{EngineError, Row, SqlExecutor, SqlState, SqlTransaction, SqlValue, Statement};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub enum Reply {
    Rows(Vec<Row>),
    Fail(EngineError),
}

struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    log: Vec<Statement>,
    rules: Vec<Rule>,
}

#[derive(Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<Mutex<State>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, pattern: &str, reply: Reply, remaining: Option<usize>) {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
    }

    /// Answer every statement containing `pattern` with `rows`
    pub fn reply(&self, pattern: &str, rows: Vec<Row>) {
        self.add_rule(pattern, Reply::Rows(rows), None);
    }

    /// Fail the next statement containing `pattern`
    pub fn fail_once(&self, pattern: &str, err: EngineError) {
        self.add_rule(pattern, Reply::Fail(err), Some(1));
    }

    /// Fail every statement containing `pattern`
    pub fn fail(&self, pattern: &str, err: EngineError) {
        self.add_rule(pattern, Reply::Fail(err), None);
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    /// Statements containing `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<Statement> {
        self.statements()
            .into_iter()
            .filter(|s| s.sql.contains(pattern))
            .collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        !self.matching(pattern).is_empty()
    }

    fn log(&self, statement: Statement) {
        self.state.lock().unwrap().log.push(statement);
    }

    fn run(&self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(statement.clone());

        // Later rules take precedence
        for rule in state.rules.iter_mut().rev() {
            if rule.remaining == Some(0) || !statement.sql.contains(&rule.pattern) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return match &rule.reply {
                Reply::Rows(rows) => Ok(rows.clone()),
                Reply::Fail(err) => Err(err.clone()),
            };
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        self.run(statement)
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, EngineError> {
        self.run(statement).map(|rows| rows.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, EngineError> {
        self.log(Statement::raw("BEGIN"));
        Ok(Box::new(RecordingTransaction {
            executor: self.clone(),
            failure: None,
        }))
    }
}

pub struct RecordingTransaction {
    executor: RecordingExecutor,
    failure: Option<EngineError>,
}

impl RecordingTransaction {
    fn run(&mut self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        if statement.sql.starts_with("ROLLBACK TO SAVEPOINT") {
            self.failure = None;
            return self.executor.run(statement);
        }
        if let Some(first) = &self.failure {
            self.executor.log(statement.clone());
            return Err(EngineError::with_code(
                SqlState::IN_FAILED_TRANSACTION,
                "current transaction is aborted, commands ignored until end of transaction block",
            )
            .caused_by(first.clone()));
        }
        let result = self.executor.run(statement);
        if let Err(err) = &result {
            self.failure = Some(err.clone());
        }
        result
    }
}

#[async_trait]
impl SqlTransaction for RecordingTransaction {
    async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, EngineError> {
        self.run(statement)
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, EngineError> {
        self.run(statement).map(|rows| rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        self.executor.log(Statement::raw("COMMIT"));
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        self.executor.log(Statement::raw("ROLLBACK"));
        Ok(())
    }
}

/// Build a result row from column/value pairs
pub fn row(columns: &[(&str, SqlValue)]) -> Row {
    columns
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Numbers of every `$N` placeholder outside quoted text
pub fn placeholders(sql: &str) -> Vec<usize> {
    let mut found = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '"') | (None, '\'') => quote = Some(c),
            (Some(q), _) if q == c => quote = None,
            (None, '$') => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                if let Ok(n) = digits.parse() {
                    found.push(n);
                }
            }
            _ => {}
        }
    }
    found
}
