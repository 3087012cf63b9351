use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("A duplicate value for a field with unique values was provided")]
    DuplicateValue { field: Option<String> },

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Object not found")]
    ObjectNotFound,

    #[error("Class '{0}' does not exist")]
    ClassNotFound(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

impl AdapterError {
    /// Numeric error code reported to clients
    pub fn code(&self) -> u16 {
        match self {
            AdapterError::InvalidQuery(_) => 102,
            AdapterError::UnsupportedOperation(_) => 119,
            AdapterError::Geometry(_) => 107,
            AdapterError::DuplicateValue { .. } => 137,
            AdapterError::ObjectNotFound => 101,
            AdapterError::ClassNotFound(_) => 103,
            AdapterError::InvalidSchema(_) => 255,
            AdapterError::Json(_) => 107,
            AdapterError::SchemaConflict(_) | AdapterError::Internal(_) => 1,
        }
    }

    /// Whether the failure was caused by the request rather than the server
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            AdapterError::Internal(_) | AdapterError::SchemaConflict(_) | AdapterError::InvalidSchema(_)
        )
    }
}

impl serde::Serialize for AdapterError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

// ==================== Engine errors ====================

/// SQLSTATE codes the adapter knows how to interpret
pub struct SqlState;

impl SqlState {
    pub const UNDEFINED_TABLE: &'static str = "42P01";
    pub const DUPLICATE_TABLE: &'static str = "42P07";
    pub const DUPLICATE_COLUMN: &'static str = "42701";
    pub const UNDEFINED_COLUMN: &'static str = "42703";
    pub const DUPLICATE_OBJECT: &'static str = "42710";
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const IN_FAILED_TRANSACTION: &'static str = "25P02";
}

/// Error reported by the statement execution boundary.
///
/// `cause` carries the error that aborted an enclosing transaction, so the
/// failure the caller sees is the first one and not the abort wrapper.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct EngineError {
    pub code: Option<String>,
    pub message: String,
    pub constraint: Option<String>,
    pub detail: Option<String>,
    pub cause: Option<Box<EngineError>>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            constraint: None,
            detail: None,
            cause: None,
        }
    }

    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.to_string()),
            ..Self::new(message)
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn caused_by(mut self, cause: EngineError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The innermost error in the cause chain
    pub fn root(&self) -> &EngineError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.root().code.as_deref() == Some(code)
    }

    /// "Already exists" failures raised by racing DDL statements
    pub fn is_schema_race(&self) -> bool {
        self.has_code(SqlState::DUPLICATE_TABLE)
            || self.has_code(SqlState::DUPLICATE_COLUMN)
            || self.has_code(SqlState::DUPLICATE_OBJECT)
    }

    pub fn is_missing_table(&self) -> bool {
        self.has_code(SqlState::UNDEFINED_TABLE)
    }

    pub fn is_missing_column(&self) -> bool {
        self.has_code(SqlState::UNDEFINED_COLUMN)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.has_code(SqlState::UNIQUE_VIOLATION)
    }
}

static UNIQUE_CONSTRAINT_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"unique_([a-zA-Z]+)").expect("valid constraint pattern"));

/// Field name encoded in a `<class>_unique_<field>` constraint name
pub fn duplicated_field(constraint: &str) -> Option<String> {
    UNIQUE_CONSTRAINT_FIELD
        .captures(constraint)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

impl From<EngineError> for AdapterError {
    fn from(err: EngineError) -> Self {
        let root = err.root().clone();
        if root.is_unique_violation() {
            let field = root.constraint.as_deref().and_then(duplicated_field);
            return AdapterError::DuplicateValue { field };
        }
        if root.is_schema_race() {
            return AdapterError::SchemaConflict(root.message);
        }
        tracing::error!(code = ?root.code, "Storage engine failure: {}", root.message);
        AdapterError::Internal(root.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AdapterError::InvalidQuery("bad $in value".to_string());
        assert_eq!(err.to_string(), "Invalid query: bad $in value");

        let err = AdapterError::UnsupportedOperation("$where".to_string());
        assert_eq!(err.to_string(), "Operation not supported: $where");

        let err = AdapterError::DuplicateValue { field: None };
        assert_eq!(
            err.to_string(),
            "A duplicate value for a field with unique values was provided"
        );

        let err = AdapterError::ClassNotFound("GameScore".to_string());
        assert_eq!(err.to_string(), "Class 'GameScore' does not exist");
    }

    #[test]
    fn test_unique_violation_maps_to_duplicate_value() {
        let engine = EngineError::with_code(SqlState::UNIQUE_VIOLATION, "duplicate key")
            .with_constraint("_User_unique_email");
        match AdapterError::from(engine) {
            AdapterError::DuplicateValue { field } => assert_eq!(field.as_deref(), Some("email")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_abort_wrapper_is_unwrapped() {
        let first = EngineError::with_code(SqlState::DUPLICATE_COLUMN, "column exists");
        let wrapper = EngineError::with_code(SqlState::IN_FAILED_TRANSACTION, "transaction aborted")
            .caused_by(first.clone());
        assert_eq!(wrapper.root(), &first);
        assert!(matches!(
            AdapterError::from(wrapper),
            AdapterError::SchemaConflict(msg) if msg == "column exists"
        ));
    }

    #[test]
    fn test_other_engine_errors_are_internal() {
        let err = AdapterError::from(EngineError::with_code("57014", "canceling statement"));
        assert!(matches!(err, AdapterError::Internal(_)));
        assert!(!err.is_client_error());
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn test_client_error_codes() {
        assert_eq!(AdapterError::ObjectNotFound.code(), 101);
        assert!(AdapterError::InvalidQuery("x".to_string()).is_client_error());
        assert!(AdapterError::Geometry("x".to_string()).is_client_error());
    }
}
