//! Typed representation of an update document.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::error::{AdapterError, AdapterResult};

const AUTH_DATA: &str = "authData";
const AUTH_DATA_PREFIX: &str = "_auth_data_";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Replace the value
    Set(Value),
    /// `null` or `{"__op": "Delete"}`
    Unset,
    Increment(Number),
    Add(Vec<Value>),
    Remove(Vec<Value>),
    AddUnique(Vec<Value>),
    /// Provider entries of `authData`; `None` removes the provider
    AuthData(Vec<(String, Option<Value>)>),
    /// Partial update of an Object column
    Patch(ObjectPatch),
}

/// Partial object update assembled from dotted keys (`profile.city`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    /// Merge into the stored object instead of replacing it
    pub merge: bool,
    pub deletes: Vec<String>,
    pub increments: Vec<(String, Number)>,
    pub values: Map<String, Value>,
}

/// An update document, one entry per affected column
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub fields: BTreeMap<String, FieldUpdate>,
}

impl Update {
    pub fn parse(value: &Value) -> AdapterResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| AdapterError::InvalidQuery(format!("update must be an object: {}", value)))?;

        let mut update = Update::default();
        let mut auth: Vec<(String, Option<Value>)> = Vec::new();

        for (key, value) in obj {
            if let Some(provider) = key.strip_prefix(AUTH_DATA_PREFIX) {
                auth.push((provider.to_string(), auth_value(value)));
                continue;
            }

            if key == AUTH_DATA {
                if let Value::Object(providers) = value {
                    for (provider, v) in providers {
                        auth.push((provider.clone(), auth_value(v)));
                    }
                    continue;
                }
            }

            match key.split_once('.') {
                Some((first, rest)) => update.patch_entry(first, rest, value)?,
                None => {
                    let field = FieldUpdate::parse(value)?;
                    if let (Some(FieldUpdate::Patch(patch)), FieldUpdate::Set(Value::Object(values))) =
                        (update.fields.get_mut(key), &field)
                    {
                        patch.merge = false;
                        for (k, v) in values {
                            patch.values.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                        continue;
                    }
                    update.fields.insert(key.clone(), field);
                }
            }
        }

        if !auth.is_empty() {
            update.fields.insert(AUTH_DATA.to_string(), FieldUpdate::AuthData(auth));
        }
        Ok(update)
    }

    fn patch_entry(&mut self, field: &str, path: &str, value: &Value) -> AdapterResult<()> {
        let entry = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| {
                FieldUpdate::Patch(ObjectPatch {
                    merge: true,
                    ..Default::default()
                })
            });

        // A whole-object value for the same field replaces the stored object
        if let FieldUpdate::Set(Value::Object(values)) = entry {
            let values = std::mem::take(values);
            *entry = FieldUpdate::Patch(ObjectPatch {
                values,
                ..Default::default()
            });
        }

        let patch = match entry {
            FieldUpdate::Patch(patch) => patch,
            _ => {
                return Err(AdapterError::InvalidQuery(format!(
                    "conflicting updates for field '{}'",
                    field
                )))
            }
        };

        let nested = path.contains('.');
        match op_name(value) {
            Some("Increment") if !nested => {
                patch.increments.push((path.to_string(), increment_amount(value)?));
            }
            Some("Delete") if !nested => patch.deletes.push(path.to_string()),
            Some(op) => {
                return Err(AdapterError::UnsupportedOperation(format!(
                    "{} on nested key '{}.{}' is not supported",
                    op, field, path
                )))
            }
            None => insert_path(&mut patch.values, path, value.clone()),
        }
        Ok(())
    }
}

impl FieldUpdate {
    pub fn parse(value: &Value) -> AdapterResult<Self> {
        if value.is_null() {
            return Ok(FieldUpdate::Unset);
        }
        let op = match op_name(value) {
            Some(op) => op,
            None => return Ok(FieldUpdate::Set(value.clone())),
        };
        match op {
            "Increment" => increment_amount(value).map(FieldUpdate::Increment),
            "Add" => objects(value).map(FieldUpdate::Add),
            "Remove" => objects(value).map(FieldUpdate::Remove),
            "AddUnique" => objects(value).map(FieldUpdate::AddUnique),
            "Delete" => Ok(FieldUpdate::Unset),
            other => Err(AdapterError::UnsupportedOperation(format!(
                "Postgres doesn't support update operation {} yet",
                other
            ))),
        }
    }
}

fn op_name(value: &Value) -> Option<&str> {
    value.get("__op").and_then(Value::as_str)
}

fn increment_amount(value: &Value) -> AdapterResult<Number> {
    match value.get("amount") {
        Some(Value::Number(n)) => Ok(n.clone()),
        _ => Err(AdapterError::InvalidQuery(
            "Increment amount must be a number".to_string(),
        )),
    }
}

fn objects(value: &Value) -> AdapterResult<Vec<Value>> {
    value
        .get("objects")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| AdapterError::InvalidQuery("objects to add must be an array".to_string()))
}

fn auth_value(value: &Value) -> Option<Value> {
    if value.is_null() || op_name(value) == Some("Delete") {
        None
    } else {
        Some(value.clone())
    }
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operations() {
        let update = Update::parse(&json!({
            "score": {"__op": "Increment", "amount": 5},
            "tags": {"__op": "AddUnique", "objects": ["a"]},
            "gone": {"__op": "Delete"},
            "name": "x",
            "nothing": null
        }))
        .unwrap();
        assert_eq!(update.fields["score"], FieldUpdate::Increment(5.into()));
        assert_eq!(update.fields["tags"], FieldUpdate::AddUnique(vec![json!("a")]));
        assert_eq!(update.fields["gone"], FieldUpdate::Unset);
        assert_eq!(update.fields["nothing"], FieldUpdate::Unset);
        assert_eq!(update.fields["name"], FieldUpdate::Set(json!("x")));
    }

    #[test]
    fn test_auth_data_is_folded() {
        let update = Update::parse(&json!({
            "_auth_data_facebook": {"id": "1"},
            "_auth_data_twitter": {"__op": "Delete"}
        }))
        .unwrap();
        assert_eq!(update.fields.len(), 1);
        assert_eq!(
            update.fields["authData"],
            FieldUpdate::AuthData(vec![
                ("facebook".to_string(), Some(json!({"id": "1"}))),
                ("twitter".to_string(), None),
            ])
        );
    }

    #[test]
    fn test_dotted_keys_become_patch() {
        let update = Update::parse(&json!({
            "profile.city": "Paris",
            "profile.visits": {"__op": "Increment", "amount": 1},
            "profile.old": {"__op": "Delete"},
            "profile.geo.lat": 1
        }))
        .unwrap();
        match &update.fields["profile"] {
            FieldUpdate::Patch(patch) => {
                assert!(patch.merge);
                assert_eq!(patch.deletes, vec!["old".to_string()]);
                assert_eq!(patch.increments, vec![("visits".to_string(), 1.into())]);
                assert_eq!(
                    Value::Object(patch.values.clone()),
                    json!({"city": "Paris", "geo": {"lat": 1}})
                );
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_object_value_with_dotted_keys_replaces() {
        let update = Update::parse(&json!({
            "profile": {"city": "Paris", "zip": "75001"},
            "profile.city": "Lyon"
        }))
        .unwrap();
        match &update.fields["profile"] {
            FieldUpdate::Patch(patch) => {
                assert!(!patch.merge);
                assert_eq!(
                    Value::Object(patch.values.clone()),
                    json!({"city": "Lyon", "zip": "75001"})
                );
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_op() {
        let err = Update::parse(&json!({"a": {"__op": "Batch", "ops": []}})).unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_bad_increment() {
        let err = Update::parse(&json!({"a": {"__op": "Increment", "amount": "1"}})).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidQuery(_)));
    }
}
