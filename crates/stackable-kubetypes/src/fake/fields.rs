//! JSON plumbing for the in-memory store: field paths, merging and field ownership.
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

/// The keys leading from the object root to a leaf field.
pub(super) type FieldPath = Vec<String>;

/// The leaf fields owned by each field manager.
pub(super) type Managers = BTreeMap<String, BTreeSet<FieldPath>>;

/// Metadata maintained by the store itself. Nobody owns these fields.
const IDENTITY_FIELDS: &[&str] = &[
    "name",
    "namespace",
    "generateName",
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
];

/// Fields copied from the stored object onto every replacement of it.
const CARRIED_FIELDS: &[&str] = &[
    "name",
    "namespace",
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct FieldConflict {
    pub manager: String,
    pub path: FieldPath,
}

/// Returns the paths of all leaf fields which can be owned by a field manager.
///
/// Arrays are leaves, so they are always owned as a whole.
pub(super) fn managed_paths(object: &Value) -> BTreeSet<FieldPath> {
    let mut paths = BTreeSet::new();
    let Value::Object(root) = object else {
        return paths;
    };

    for (key, value) in root {
        match key.as_str() {
            "apiVersion" | "kind" => {}
            "metadata" => {
                let Value::Object(metadata) = value else {
                    continue;
                };
                for (field, value) in metadata {
                    if !IDENTITY_FIELDS.contains(&field.as_str()) {
                        collect(value, &mut vec!["metadata".to_owned(), field.clone()], &mut paths);
                    }
                }
            }
            _ => collect(value, &mut vec![key.clone()], &mut paths),
        }
    }

    paths
}

fn collect(value: &Value, path: &mut FieldPath, paths: &mut BTreeSet<FieldPath>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                path.push(key.clone());
                collect(value, path, paths);
                path.pop();
            }
        }
        _ => {
            paths.insert(path.clone());
        }
    }
}

pub(super) fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |value, key| value.get(key))
}

/// Removes the field at `path`. Missing fields are ignored.
pub(super) fn remove(value: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    if let Some(Value::Object(parent)) = parents
        .iter()
        .try_fold(value, |value, key| value.get_mut(key))
    {
        parent.remove(last);
    }
}

/// Deep-merges `patch` into `target`. Objects are merged key by key, anything else (including
/// arrays) replaces the target value.
pub(super) fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Drops the `$`-prefixed directives of a strategic merge patch, leaving a plain merge patch.
pub(super) fn strip_directives(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with('$'))
                .map(|(key, value)| (key, strip_directives(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_directives).collect()),
        other => other,
    }
}

/// Finds the fields `payload` would change that are owned by managers other than `applier`.
pub(super) fn conflicts(
    managers: &Managers,
    applier: &str,
    current: &Value,
    payload: &Value,
    applied: &BTreeSet<FieldPath>,
) -> Vec<FieldConflict> {
    managers
        .iter()
        .filter(|(manager, _)| manager.as_str() != applier)
        .flat_map(|(manager, owned)| {
            owned
                .intersection(applied)
                .filter(|path| lookup(current, path) != lookup(payload, path))
                .map(move |path| FieldConflict {
                    manager: manager.clone(),
                    path: path.clone(),
                })
        })
        .collect()
}

pub(super) fn describe_conflicts(conflicts: &[FieldConflict]) -> String {
    let fields = conflicts
        .iter()
        .map(|conflict| {
            format!(
                "conflict with {manager:?}: .{path}",
                manager = conflict.manager,
                path = conflict.path.join(".")
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!("apply failed with {} conflicts: {fields}", conflicts.len())
}

/// Moves ownership of every field changed between `before` and `after` to `manager`.
///
/// Without a manager only fields which no longer exist are dropped from the ownership records.
pub(super) fn record_update(
    managers: &mut Managers,
    manager: Option<&str>,
    before: Option<&Value>,
    after: &Value,
) {
    if let Some(manager) = manager {
        let after_paths = managed_paths(after);
        let changed: BTreeSet<FieldPath> = match before {
            None => after_paths,
            Some(before) => managed_paths(before)
                .union(&after_paths)
                .filter(|path| lookup(before, path) != lookup(after, path))
                .cloned()
                .collect(),
        };

        for (other, owned) in managers.iter_mut() {
            if other != manager {
                owned.retain(|path| !changed.contains(path));
            }
        }
        managers
            .entry(manager.to_owned())
            .or_default()
            .extend(changed);
    }

    prune(managers, after);
}

/// Forgets ownership of fields which do not exist in `object`, and managers without fields.
pub(super) fn prune(managers: &mut Managers, object: &Value) {
    for owned in managers.values_mut() {
        owned.retain(|path| lookup(object, path).is_some_and(|value| !value.is_null()));
    }
    managers.retain(|_, owned| !owned.is_empty());
}

pub(super) fn metadata_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object.get("metadata")?.get(field)?.as_str()
}

pub(super) fn set_metadata(object: &mut Value, field: &str, value: Value) {
    if let Value::Object(root) = object {
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert(field.to_owned(), value);
        }
    }
}

pub(super) fn remove_metadata(object: &mut Value, field: &str) {
    if let Some(Value::Object(metadata)) = object.get_mut("metadata") {
        metadata.remove(field);
    }
}

pub(super) fn labels(object: &Value) -> BTreeMap<String, String> {
    let Some(Value::Object(labels)) = object.get("metadata").and_then(|m| m.get("labels")) else {
        return BTreeMap::new();
    };

    labels
        .iter()
        .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_owned())))
        .collect()
}

pub(super) fn is_status(path: &[String]) -> bool {
    path.first().is_some_and(|key| key == "status")
}

pub(super) fn status(object: &Value) -> Option<Value> {
    object.get("status").cloned()
}

pub(super) fn set_status(object: &mut Value, status: Option<Value>) {
    if let Value::Object(root) = object {
        match status {
            Some(status) => root.insert("status".to_owned(), status),
            None => root.remove("status"),
        };
    }
}

/// Copies the store maintained metadata of `current` onto its replacement `next`.
pub(super) fn carry_identity(next: &mut Value, current: &Value) {
    for field in CARRIED_FIELDS {
        match current.get("metadata").and_then(|m| m.get(*field)) {
            Some(value) => set_metadata(next, field, value.clone()),
            None => remove_metadata(next, field),
        }
    }
    remove_metadata(next, "managedFields");
}

/// Increments the generation of `next` if anything outside of metadata and status changed.
pub(super) fn bump_generation(next: &mut Value, current: &Value) {
    if spec(next) == spec(current) {
        return;
    }

    let generation = current
        .get("metadata")
        .and_then(|m| m.get("generation"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    set_metadata(next, "generation", Value::from(generation + 1));
}

fn spec(object: &Value) -> Map<String, Value> {
    match object {
        Value::Object(root) => root
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "metadata" | "status"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        _ => Map::new(),
    }
}
