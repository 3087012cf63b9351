pub mod adapter;
pub mod config;
pub mod error;
pub mod sql;
pub mod storage;

pub use adapter::{IndexInfo, IndexSpec, PostgresAdapter, SqlExecutor, SqlTransaction};
pub use config::AdapterConfig;
pub use error::{AdapterError, AdapterResult, EngineError, SqlState};
pub use sql::{CompiledMutation, CompiledPredicate, FindOptions, MutationCompiler, PredicateCompiler, SortDirection, Statement};
pub use storage::{FieldType, GeoPoint, Point, Row, Schema, SqlValue};
