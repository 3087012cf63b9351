//! End-to-end compiler scenarios
//!
//! Small documents with known SQL output, run through the public compiler
//! API the way the adapter uses it.

use pgdoc::sql::statements;
use pgdoc::{AdapterError, FieldType, MutationCompiler, PredicateCompiler, Schema, SqlValue};
use regex::Regex;
use serde_json::json;

fn person() -> Schema {
    Schema::new("Person")
        .with_field("name", FieldType::String)
        .with_field("age", FieldType::Number)
        .with_field("score", FieldType::Number)
        .with_field("active", FieldType::Boolean)
}

fn compile(query: serde_json::Value) -> pgdoc::CompiledPredicate {
    PredicateCompiler::new(&person()).compile(&query, 1).unwrap()
}

#[test]
fn test_age_range() {
    let c = compile(json!({"age": {"$gte": 18, "$lt": 30}}));
    assert_eq!(c.pattern, "\"age\" >= $1 AND \"age\" < $2");
    assert_eq!(c.parameters, vec![SqlValue::Int(18), SqlValue::Int(30)]);
}

#[test]
fn test_increment() {
    let update = json!({"score": {"__op": "Increment", "amount": 5}});
    let m = MutationCompiler::new(&person()).compile(&update, 1).unwrap();
    assert_eq!(m.set_clause, "\"score\" = COALESCE(\"score\", 0) + $1");
    assert_eq!(m.parameters, vec![SqlValue::Int(5)]);
}

#[test]
fn test_literal_regex_prefix_is_anchored() {
    let c = compile(json!({"name": {"$regex": "^\\Qhello\\E"}}));
    assert_eq!(c.pattern, "\"name\" ~ $1");
    assert_eq!(c.parameters, vec![SqlValue::from("^hello")]);

    let pattern = match &c.parameters[0] {
        SqlValue::Text(p) => Regex::new(p).unwrap(),
        other => panic!("unexpected param: {:?}", other),
    };
    assert!(pattern.is_match("hello world"));
    assert!(!pattern.is_match("say hello"));
}

#[test]
fn test_quoted_metacharacters_match_literally() {
    let c = compile(json!({"name": {"$regex": "^\\Qa.b*\\E"}}));
    let pattern = match &c.parameters[0] {
        SqlValue::Text(p) => Regex::new(p).unwrap(),
        other => panic!("unexpected param: {:?}", other),
    };
    assert!(pattern.is_match("a.b*c"));
    assert!(!pattern.is_match("axbbb"));
}

#[test]
fn test_empty_in_and_nin() {
    assert_eq!(compile(json!({"name": {"$in": []}})).pattern, "\"name\" IS NULL");
    assert_eq!(compile(json!({"name": {"$nin": []}})).pattern, "TRUE");
}

#[test]
fn test_exists_partitions_rows() {
    let present = compile(json!({"age": {"$exists": true}}));
    let absent = compile(json!({"age": {"$exists": false}}));
    assert_eq!(present.pattern, "\"age\" IS NOT NULL");
    assert_eq!(absent.pattern, "\"age\" IS NULL");
    assert!(present.parameters.is_empty());
    assert!(absent.parameters.is_empty());
}

#[test]
fn test_literal_equality_binds_one_parameter() {
    for (query, param) in [
        (json!({"name": "ann"}), SqlValue::from("ann")),
        (json!({"age": 41}), SqlValue::Int(41)),
        (json!({"score": 2.5}), SqlValue::Float(2.5)),
        (json!({"active": false}), SqlValue::Bool(false)),
    ] {
        let c = compile(query.clone());
        assert_eq!(c.parameters, vec![param], "for {}", query);
        assert!(c.pattern.ends_with("= $1"), "for {}: {}", query, c.pattern);
    }
}

#[test]
fn test_compiling_leaves_schema_untouched() {
    let schema = person();
    let before = schema.clone();
    PredicateCompiler::new(&schema)
        .compile(&json!({"_rperm": {"$in": [null, "*"]}}), 1)
        .unwrap();
    assert_eq!(schema, before);
    assert!(schema.field("_rperm").is_none());
}

#[test]
fn test_update_continues_numbering_into_where() {
    let compiler = PredicateCompiler::new(&person());
    let statement = statements::update(
        &compiler,
        &json!({"age": {"$gte": 18}}),
        &json!({"score": {"__op": "Increment", "amount": 5}}),
    )
    .unwrap();
    assert_eq!(
        statement.sql,
        "UPDATE \"Person\" SET \"score\" = COALESCE(\"score\", 0) + $1 WHERE \"age\" >= $2 RETURNING *"
    );
    assert_eq!(statement.params, vec![SqlValue::Int(5), SqlValue::Int(18)]);
}

#[test]
fn test_malformed_queries_are_rejected() {
    let compiler = PredicateCompiler::new(&person());
    assert!(matches!(
        compiler.compile(&json!({"name": {"$in": "ann"}}), 1),
        Err(AdapterError::InvalidQuery(_))
    ));
    assert!(matches!(
        compiler.compile(&json!({"name": {"$where": "1 = 1"}}), 1),
        Err(AdapterError::UnsupportedOperation(_))
    ));
    assert!(matches!(
        compiler.compile(&json!({"$where": "1 = 1"}), 1),
        Err(AdapterError::UnsupportedOperation(_))
    ));
}
