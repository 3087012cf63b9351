//! Placeholder alignment tests
//!
//! Every `$N` in a compiled statement must refer to exactly one bound
//! parameter, in order, however deeply the query nests. These tests build
//! nested `$or` / `$and` / `$nor` trees over a mix of operators and check
//! the numbering of the resulting SQL.

mod common;

use common::placeholders;
use pgdoc::sql::statements;
use pgdoc::{FieldType, FindOptions, PredicateCompiler, Schema, SortDirection};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

fn schema() -> Schema {
    Schema::new("Player")
        .with_field("name", FieldType::String)
        .with_field("age", FieldType::Number)
        .with_field("born", FieldType::Date)
        .with_field("tags", FieldType::Array { contents: None })
        .with_field("labels", FieldType::array_of(FieldType::String))
        .with_field("location", FieldType::GeoPoint)
        .with_field("profile", FieldType::Object)
        .with_field(
            "team",
            FieldType::Pointer {
                target_class: "Team".to_string(),
            },
        )
}

fn leaf(seed: usize) -> Value {
    match seed % 16 {
        0 => json!({"age": {"$gte": seed, "$lt": seed + 10}}),
        1 => json!({"name": {"$in": ["a", null, "b"]}}),
        2 => json!({"tags": "x"}),
        3 => json!({"name": {"$regex": "^\\Qa$b\\E", "$options": "i"}}),
        4 => json!({"name": {"$ne": "z"}}),
        5 => json!({"profile.city": "Paris"}),
        6 => json!({"location": {
            "$nearSphere": {"__type": "GeoPoint", "latitude": 40.0, "longitude": -30.0},
            "$maxDistance": 0.1
        }}),
        7 => json!({"team": {"__type": "Pointer", "className": "Team", "objectId": format!("t{}", seed)}}),
        8 => json!({"age": {"$exists": true}}),
        9 => json!({"tags": {"$all": ["a", "b"]}}),
        10 => json!({"name": {"$nin": ["q", "r"]}}),
        11 => json!({"born": {"$gt": {"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"}}}),
        12 => json!({"labels": {"$in": [null, "x", "y"]}}),
        13 => json!({"name": {"$text": {"$search": {"$term": "hello"}}}}),
        14 => json!({"location": {"$geoWithin": {"$centerSphere": [[2.0, 1.0], 0.1]}}}),
        _ => json!({"profile.stats.score": {"$gt": seed}}),
    }
}

/// A group operator over two subtrees, next to a leaf condition
fn tree(depth: usize, seed: usize) -> Value {
    if depth == 0 {
        return leaf(seed);
    }
    let op = ["$or", "$and", "$nor"][seed % 3];
    let mut node = Map::new();
    node.insert(
        op.to_string(),
        json!([tree(depth - 1, seed * 3 + 1), tree(depth - 1, seed * 3 + 2)]),
    );
    if let Value::Object(extra) = leaf(seed + 5) {
        node.extend(extra);
    }
    Value::Object(node)
}

fn assert_sequential(sql: &str, start: usize, count: usize) {
    let mut found = placeholders(sql);
    found.sort_unstable();
    let expected: Vec<usize> = (start..start + count).collect();
    assert_eq!(found, expected, "misnumbered placeholders in {}", sql);
}

// ============================================================================
// Predicates
// ============================================================================

#[test]
fn test_nested_predicates_number_every_parameter_once() {
    let compiler = PredicateCompiler::new(&schema());
    for depth in 0..=5 {
        for seed in 0..16 {
            let query = tree(depth, seed);
            let compiled = compiler.compile(&query, 1).unwrap();
            assert_sequential(&compiled.pattern, 1, compiled.parameters.len());
        }
    }
}

#[test]
fn test_start_index_shifts_every_placeholder() {
    let compiler = PredicateCompiler::new(&schema());
    for seed in 0..16 {
        let query = tree(3, seed);
        let compiled = compiler.compile(&query, 7).unwrap();
        assert_sequential(&compiled.pattern, 7, compiled.parameters.len());
    }
}

#[test]
fn test_sort_expressions_reuse_bound_placeholders() {
    let compiler = PredicateCompiler::new(&schema());
    let compiled = compiler.compile(&tree(2, 6), 1).unwrap();
    for sort in &compiled.sorts {
        for n in placeholders(sort) {
            assert!(n >= 1 && n <= compiled.parameters.len(), "{} out of range in {}", n, sort);
        }
    }
}

// ============================================================================
// Full statements
// ============================================================================

#[test]
fn test_find_statement_numbers_projection_filter_and_paging() {
    let compiler = PredicateCompiler::new(&schema());
    for seed in 0..16 {
        let mut query = tree(4, seed);
        if let Value::Object(map) = &mut query {
            map.insert(
                "name".to_string(),
                json!({"$text": {"$search": {"$term": "rust"}}}),
            );
        }
        let options = FindOptions::default()
            .keys(["name", "$score"])
            .sort_by("age", SortDirection::Descending)
            .limit(10)
            .skip(5);

        let statement = statements::find(&compiler, &query, &options).unwrap();
        let distinct: BTreeSet<usize> = placeholders(&statement.sql).into_iter().collect();
        let expected: BTreeSet<usize> = (1..=statement.params.len()).collect();
        assert_eq!(distinct, expected, "misnumbered placeholders in {}", statement.sql);
    }
}

#[test]
fn test_update_statement_numbers_set_before_where() {
    let compiler = PredicateCompiler::new(&schema());
    let update = json!({
        "age": {"__op": "Increment", "amount": 1},
        "labels": {"__op": "AddUnique", "objects": ["new"]},
        "profile.visits": {"__op": "Increment", "amount": 2},
        "name": "renamed"
    });
    for seed in 0..16 {
        let statement = statements::update(&compiler, &tree(3, seed), &update).unwrap();
        assert_sequential(&statement.sql, 1, statement.params.len());
    }
}

#[test]
fn test_count_and_delete_statements() {
    let compiler = PredicateCompiler::new(&schema());
    let query = tree(5, 4);

    let count = statements::count(&compiler, &query).unwrap();
    assert_sequential(&count.sql, 1, count.params.len());

    let delete = statements::delete(&compiler, &query).unwrap();
    assert_sequential(&delete.sql, 1, delete.params.len());
}
