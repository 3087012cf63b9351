//! Class lifecycle tests
//!
//! Drives the schema operations of the adapter through a recording executor:
//! - Table, join table and metadata row creation
//! - Races between concurrent requests evolving the same class
//! - Reporting of the first failing statement of an aborted transaction

mod common;

use common::{row, RecordingExecutor};
use pgdoc::{AdapterConfig, AdapterError, EngineError, FieldType, PostgresAdapter, Schema, SqlState, SqlValue};
use serde_json::json;

fn adapter() -> (PostgresAdapter<RecordingExecutor>, RecordingExecutor) {
    let executor = RecordingExecutor::new();
    (PostgresAdapter::new(executor.clone(), AdapterConfig::default()), executor)
}

fn team() -> Schema {
    Schema::new("Team")
        .with_field("name", FieldType::String)
        .with_field(
            "members",
            FieldType::Relation {
                target_class: "_User".to_string(),
            },
        )
}

// ============================================================================
// create_class
// ============================================================================

#[tokio::test]
async fn test_create_class_creates_tables_and_metadata() {
    let (adapter, executor) = adapter();

    let created = adapter.create_class("Team", &team()).await.unwrap();
    assert_eq!(created.class_name, "Team");
    assert!(created.fields.contains_key("name"));
    assert!(created.fields.contains_key("members"));
    assert!(!created.fields.contains_key("_rperm"));

    let log = executor.sql_log();
    assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
    assert!(executor.ran("CREATE TABLE IF NOT EXISTS \"Team\""));
    assert!(executor.ran("CREATE TABLE IF NOT EXISTS \"_Join:members:Team\""));

    let inserts = executor.matching("INSERT INTO \"_SCHEMA\"");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].params[0], SqlValue::from("Team"));
}

#[tokio::test]
async fn test_create_class_absorbs_concurrent_creation() {
    let (adapter, executor) = adapter();
    executor.fail_once(
        "CREATE TABLE IF NOT EXISTS \"Team\"",
        EngineError::with_code(
            SqlState::UNIQUE_VIOLATION,
            "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"",
        ),
    );

    adapter.create_class("Team", &team()).await.unwrap();

    let log = executor.sql_log();
    assert!(log.iter().any(|sql| sql.starts_with("ROLLBACK TO SAVEPOINT")));
    assert!(executor.ran("INSERT INTO \"_SCHEMA\""));
    assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn test_concurrent_create_class_both_succeed() {
    let (adapter, executor) = adapter();
    let schema = team();
    executor.fail_once(
        "CREATE TABLE IF NOT EXISTS \"_Join:members:Team\"",
        EngineError::with_code(SqlState::DUPLICATE_TABLE, "relation \"_Join:members:Team\" already exists"),
    );

    let (first, second) = tokio::join!(
        adapter.create_class("Team", &schema),
        adapter.create_class("Team", &schema)
    );
    assert_eq!(first.unwrap(), second.unwrap());

    let inserts = executor.matching("INSERT INTO \"_SCHEMA\"");
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].params, inserts[1].params);
}

#[tokio::test]
async fn test_create_class_reports_the_first_error() {
    let (adapter, executor) = adapter();
    executor.fail_once(
        "CREATE TABLE IF NOT EXISTS \"_Join",
        EngineError::with_code("42501", "permission denied for schema public"),
    );

    let err = adapter.create_class("Team", &team()).await.unwrap_err();
    match err {
        AdapterError::Internal(message) => assert!(message.contains("permission denied")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!executor.ran("INSERT INTO \"_SCHEMA\""));
    assert_eq!(executor.sql_log().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn test_create_class_uses_configured_metadata_table() {
    let executor = RecordingExecutor::new();
    let config = AdapterConfig {
        schema_table: "_Meta".to_string(),
        ..AdapterConfig::default()
    };
    let adapter = PostgresAdapter::new(executor.clone(), config);

    adapter.create_class("Team", &team()).await.unwrap();
    assert!(executor.ran("INSERT INTO \"_Meta\""));
    assert!(!executor.ran("\"_SCHEMA\""));
}

// ============================================================================
// Fields
// ============================================================================

#[tokio::test]
async fn test_add_field_declares_new_field() {
    let (adapter, executor) = adapter();

    adapter
        .add_field_if_not_exists("Team", "logo", &FieldType::File)
        .await
        .unwrap();

    assert!(executor.ran("ALTER TABLE \"Team\" ADD COLUMN IF NOT EXISTS \"logo\" text"));
    let declarations = executor.matching("jsonb_set");
    assert_eq!(declarations.len(), 1);
    assert_eq!(
        declarations[0].params,
        vec![
            SqlValue::from("{fields,logo}"),
            SqlValue::Json(json!({"type": "File"})),
            SqlValue::from("Team"),
        ]
    );
    assert_eq!(executor.sql_log().last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn test_add_field_skips_declared_field() {
    let (adapter, executor) = adapter();
    executor.reply(
        "IS NOT NULL",
        vec![row(&[("schema", SqlValue::Json(json!({"fields": {"logo": {"type": "File"}}})))])],
    );

    adapter
        .add_field_if_not_exists("Team", "logo", &FieldType::File)
        .await
        .unwrap();

    assert!(!executor.ran("jsonb_set"));
}

#[tokio::test]
async fn test_add_field_creates_missing_table() {
    let (adapter, executor) = adapter();
    executor.fail_once(
        "ADD COLUMN",
        EngineError::with_code(SqlState::UNDEFINED_TABLE, "relation \"Team\" does not exist"),
    );

    adapter
        .add_field_if_not_exists("Team", "logo", &FieldType::File)
        .await
        .unwrap();

    let creates = executor.matching("CREATE TABLE IF NOT EXISTS \"Team\"");
    assert_eq!(creates.len(), 1);
    assert!(creates[0].sql.contains("\"logo\" text"));
    assert!(executor.ran("INSERT INTO \"_SCHEMA\""));
    assert!(executor.ran("jsonb_set"));
    assert_eq!(executor.sql_log().last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn test_add_relation_field_creates_join_table() {
    let (adapter, executor) = adapter();

    adapter
        .add_field_if_not_exists(
            "Team",
            "owners",
            &FieldType::Relation {
                target_class: "_User".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(executor.ran("CREATE TABLE IF NOT EXISTS \"_Join:owners:Team\""));
    assert!(!executor.ran("ADD COLUMN"));
    assert!(executor.ran("jsonb_set"));
}

#[tokio::test]
async fn test_delete_fields_drops_columns_but_not_relations() {
    let (adapter, executor) = adapter();
    let fields = vec!["name".to_string(), "members".to_string()];

    adapter.delete_fields("Team", &team(), &fields).await.unwrap();

    let updates = executor.matching("UPDATE \"_SCHEMA\" SET \"schema\" = $1::jsonb");
    assert_eq!(updates.len(), 1);
    match &updates[0].params[0] {
        SqlValue::Json(stored) => assert_eq!(stored["fields"], json!({})),
        other => panic!("unexpected param: {:?}", other),
    }
    let drops = executor.matching("DROP COLUMN");
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].sql, "ALTER TABLE \"Team\" DROP COLUMN IF EXISTS \"name\"");
}

#[tokio::test]
async fn test_schema_upgrade_adds_only_missing_columns() {
    let (adapter, executor) = adapter();
    let columns = ["objectId", "createdAt", "updatedAt", "_rperm", "_wperm", "name"];
    executor.reply(
        "information_schema.columns",
        columns
            .iter()
            .map(|c| row(&[("column_name", SqlValue::from(*c))]))
            .collect(),
    );

    let schema = Schema::new("Team")
        .with_field("name", FieldType::String)
        .with_field("score", FieldType::Number);
    adapter.schema_upgrade("Team", &schema).await.unwrap();

    assert!(executor.ran("ADD COLUMN IF NOT EXISTS \"score\" double precision"));
    assert!(!executor.ran("ADD COLUMN IF NOT EXISTS \"name\""));
}

// ============================================================================
// Reading and dropping classes
// ============================================================================

#[tokio::test]
async fn test_get_class_not_found() {
    let (adapter, _) = adapter();
    let err = adapter.get_class("Missing").await.unwrap_err();
    assert!(matches!(err, AdapterError::ClassNotFound(name) if name == "Missing"));
}

#[tokio::test]
async fn test_get_class_returns_document_schema() {
    let (adapter, executor) = adapter();
    executor.reply(
        "SELECT \"schema\" FROM \"_SCHEMA\"",
        vec![row(&[(
            "schema",
            SqlValue::Json(json!({
                "className": "Team",
                "fields": {
                    "name": {"type": "String"},
                    "_rperm": {"type": "Array", "contents": {"type": "String"}}
                }
            })),
        )])],
    );

    let schema = adapter.get_class("Team").await.unwrap();
    assert_eq!(schema.fields.len(), 1);
    assert_eq!(schema.field("name"), Some(&FieldType::String));
    assert_eq!(
        schema.class_level_permissions.unwrap()["find"],
        json!({"*": true})
    );
}

#[tokio::test]
async fn test_get_all_classes() {
    let (adapter, executor) = adapter();
    executor.reply(
        "SELECT \"className\", \"schema\"",
        vec![
            row(&[
                ("className", SqlValue::from("Team")),
                ("schema", SqlValue::Json(json!({"fields": {"name": {"type": "String"}}}))),
            ]),
            row(&[
                ("className", SqlValue::from("Post")),
                ("schema", SqlValue::Text("{\"className\": \"Post\", \"fields\": {}}".to_string())),
            ]),
        ],
    );

    let classes = adapter.get_all_classes().await.unwrap();
    let names: Vec<&str> = classes.iter().map(|s| s.class_name.as_str()).collect();
    assert_eq!(names, vec!["Team", "Post"]);
}

#[tokio::test]
async fn test_class_exists() {
    let (adapter, executor) = adapter();
    assert!(!adapter.class_exists("Team").await.unwrap());

    executor.reply("SELECT EXISTS", vec![row(&[("exists", SqlValue::Bool(true))])]);
    assert!(adapter.class_exists("Team").await.unwrap());
}

#[tokio::test]
async fn test_delete_class() {
    let (adapter, executor) = adapter();
    adapter.delete_class("Team").await.unwrap();

    assert!(executor.ran("DROP TABLE IF EXISTS \"Team\""));
    let deletes = executor.matching("DELETE FROM \"_SCHEMA\"");
    assert_eq!(deletes[0].params, vec![SqlValue::from("Team")]);
}

#[tokio::test]
async fn test_delete_all_classes_drops_join_tables() {
    let (adapter, executor) = adapter();
    executor.reply(
        "SELECT \"className\", \"schema\"",
        vec![row(&[
            ("className", SqlValue::from("Team")),
            (
                "schema",
                SqlValue::Json(json!({"fields": {"members": {"type": "Relation", "targetClass": "_User"}}})),
            ),
        ])],
    );

    adapter.delete_all_classes().await.unwrap();

    for table in ["_SCHEMA", "_PushStatus", "Team", "_Join:members:Team"] {
        assert!(
            executor.ran(&format!("DROP TABLE IF EXISTS \"{}\"", table)),
            "{} was not dropped",
            table
        );
    }
}

#[tokio::test]
async fn test_delete_all_classes_without_metadata_table() {
    let (adapter, executor) = adapter();
    executor.fail(
        "SELECT \"className\", \"schema\"",
        EngineError::with_code(SqlState::UNDEFINED_TABLE, "relation \"_SCHEMA\" does not exist"),
    );

    adapter.delete_all_classes().await.unwrap();
    assert!(executor.ran("DROP TABLE IF EXISTS \"_SCHEMA\""));
}

// ============================================================================
// Initialization and permissions
// ============================================================================

#[tokio::test]
async fn test_perform_initialization_installs_functions() {
    let (adapter, executor) = adapter();
    executor.fail_once(
        "CREATE TABLE IF NOT EXISTS \"_SCHEMA\"",
        EngineError::with_code(SqlState::DUPLICATE_TABLE, "relation \"_SCHEMA\" already exists"),
    );

    adapter.perform_initialization().await.unwrap();

    assert_eq!(executor.matching("CREATE OR REPLACE FUNCTION").len(), 7);
    assert_eq!(executor.sql_log().last().map(String::as_str), Some("COMMIT"));
}

#[tokio::test]
async fn test_set_class_level_permissions() {
    let (adapter, executor) = adapter();
    let permissions = json!({"find": {"role:admin": true}});

    adapter
        .set_class_level_permissions("Team", &permissions)
        .await
        .unwrap();

    let updates = executor.matching("jsonb_set");
    assert_eq!(updates[0].params[0], SqlValue::from("{classLevelPermissions}"));
    assert_eq!(updates[0].params[1], SqlValue::Json(permissions));
}
