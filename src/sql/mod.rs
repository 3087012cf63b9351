pub mod aggregate;
pub mod builder;
pub mod ddl;
pub mod functions;
pub mod mutation;
pub mod predicate;
pub mod query;
pub mod regex;
pub mod relative_time;
pub mod statements;
pub mod update;

pub use aggregate::{AggregatePlan, AggregationCompiler};
pub use builder::{quote_identifier, Statement, StatementBuilder};
pub use ddl::Ddl;
pub use mutation::{CompiledMutation, MutationCompiler};
pub use predicate::{CompiledPredicate, PredicateCompiler, WhereClause};
pub use query::Query;
pub use statements::{FindOptions, SortDirection};
pub use update::Update;
