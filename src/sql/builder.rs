//! Parameterized statement assembly.
//!
//! Fragments are written with `?` markers. [`StatementBuilder::bind`] turns
//! every marker into the next `$N` position and appends the matching
//! parameters in the same call, so the parameter list always lines up with
//! the placeholders of the produced SQL.

use serde::Serialize;

use crate::error::{AdapterError, AdapterResult};
use crate::storage::SqlValue;

/// A complete statement ready for execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

/// A rendered fragment and the positions it bound
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub sql: String,
    pub positions: Vec<usize>,
}

impl Bound {
    /// `$N` marker for the i-th parameter bound by this fragment
    pub fn placeholder(&self, i: usize) -> String {
        self.positions
            .get(i)
            .map(|p| format!("${}", p))
            .unwrap_or_default()
    }
}

/// Accumulates parameters while fragments are rendered
#[derive(Debug, Clone, Default)]
pub struct StatementBuilder {
    params: Vec<SqlValue>,
    first_index: usize,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start numbering placeholders at `first_index` (1-based)
    pub fn starting_at(first_index: usize) -> Self {
        Self {
            params: Vec::new(),
            first_index: first_index.max(1),
        }
    }

    /// Position the next bound parameter will take
    pub fn next_index(&self) -> usize {
        self.first_index + self.params.len()
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }

    /// Render `template`, replacing each `?` outside quotes with the next
    /// placeholder and binding `params` in order. The number of markers
    /// must equal the number of parameters.
    pub fn bind(&mut self, template: &str, params: Vec<SqlValue>) -> AdapterResult<Bound> {
        let markers = count_markers(template);
        if markers != params.len() {
            return Err(AdapterError::Internal(format!(
                "fragment '{}' has {} placeholders but {} parameters",
                template,
                markers,
                params.len()
            )));
        }

        let mut sql = String::with_capacity(template.len() + markers * 3);
        let mut positions = Vec::with_capacity(markers);
        let mut next = self.next_index();
        let mut quote: Option<char> = None;

        for c in template.chars() {
            match (quote, c) {
                (None, '"') | (None, '\'') => {
                    quote = Some(c);
                    sql.push(c);
                }
                (Some(q), _) if q == c => {
                    quote = None;
                    sql.push(c);
                }
                (None, '?') => {
                    sql.push('$');
                    sql.push_str(&next.to_string());
                    positions.push(next);
                    next += 1;
                }
                _ => sql.push(c),
            }
        }

        self.params.extend(params);
        Ok(Bound { sql, positions })
    }

    /// Render a fragment that takes no parameters
    pub fn fragment(&mut self, template: &str) -> AdapterResult<String> {
        self.bind(template, Vec::new()).map(|b| b.sql)
    }
}

fn count_markers(template: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut count = 0;
    for c in template.chars() {
        match (quote, c) {
            (None, '"') | (None, '\'') => quote = Some(c),
            (Some(q), _) if q == c => quote = None,
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"a"->'b'->'c'` for the path `a.b.c` (jsonb result)
pub fn json_path(field: &str) -> String {
    let mut parts = field.split('.');
    let mut path = quote_identifier(parts.next().unwrap_or_default());
    for part in parts {
        path.push_str("->");
        path.push_str(&quote_literal(part));
    }
    path
}

/// `"a"->'b'->>'c'` for the path `a.b.c` (text result)
pub fn json_text_path(field: &str) -> String {
    match field.rsplit_once('.') {
        Some((parent, last)) => format!("{}->>{}", json_path(parent), quote_literal(last)),
        None => quote_identifier(field),
    }
}
