/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/patch.rs
*
* The merge-patch accumulator handlers write into during a reconciliation
* cycle (spec §3, §4.7) and its conversion to an RFC 6902 JSON Patch for
* admission responses (§4.10), where the wire format requires `add` /
* `replace` / `remove` operations against the *original* object rather than
* a merge document.
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde_json::{json, Map, Value};

/// Accumulates a JSON merge patch (RFC 7396) across metadata/status/spec
/// over the course of one handler-runner cycle. `null` at any key means
/// "remove this field" per merge-patch semantics.
#[derive(Debug, Clone, Default)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Patch(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sets a dotted/slash-free path of object keys to `value`, creating
    /// intermediate objects as needed. Used for `status.kopf.progress.<id>`
    /// style nested writes.
    pub fn set_path(&mut self, path: &[&str], value: Value) {
        fn set_recursive(map: &mut Map<String, Value>, path: &[&str], value: Value) {
            if path.len() == 1 {
                map.insert(path[0].to_string(), value);
                return;
            }
            let entry = map
                .entry(path[0].to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            set_recursive(entry.as_object_mut().unwrap(), &path[1..], value);
        }
        if path.is_empty() {
            return;
        }
        set_recursive(&mut self.0, path, value);
    }

    pub fn remove_path(&mut self, path: &[&str]) {
        self.set_path(path, Value::Null);
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn merge(&mut self, other: &Patch) {
        fn merge_maps(into: &mut Map<String, Value>, from: &Map<String, Value>) {
            for (k, v) in from {
                match (into.get_mut(k), v) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        merge_maps(existing, incoming);
                    }
                    _ => {
                        into.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        merge_maps(&mut self.0, &other.0);
    }

    /// Serializes as `application/merge-patch+json` body bytes for the API
    /// client's PATCH calls.
    pub fn to_merge_patch_json(&self) -> Value {
        self.as_value()
    }

    /// Converts this merge patch into an RFC 6902 JSON Patch relative to
    /// `original`, the shape the admission response wire format requires
    /// (spec §4.10, §8 scenario 5). Only fields actually present in the
    /// merge patch produce an operation; `null` leaves produce `remove`.
    pub fn to_json_patch(&self, original: &Value) -> Vec<Value> {
        let mut ops = Vec::new();
        collect_ops(&mut ops, &[], &self.0, original);
        ops
    }
}

fn collect_ops(ops: &mut Vec<Value>, path: &[String], patch: &Map<String, Value>, original: &Value) {
    for (key, value) in patch {
        let mut full_path = path.to_vec();
        full_path.push(key.clone());
        let pointer = format!("/{}", full_path.join("/"));
        let existing = original.pointer(&pointer);
        match value {
            Value::Null => {
                if existing.is_some() {
                    ops.push(json!({"op": "remove", "path": pointer}));
                }
            }
            Value::Object(nested) if existing.map(Value::is_object).unwrap_or(false) => {
                collect_ops(ops, &full_path, nested, original);
            }
            _ => {
                let op = if existing.is_some() { "replace" } else { "add" };
                ops.push(json!({"op": op, "path": pointer, "value": value}));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_path_builds_nested_structure() {
        let mut p = Patch::new();
        p.set_path(&["status", "kopf", "progress", "h1", "retries"], json!(1));
        assert_eq!(
            p.as_value().pointer("/status/kopf/progress/h1/retries"),
            Some(&json!(1))
        );
    }

    #[test]
    fn merge_combines_nested_patches() {
        let mut a = Patch::new();
        a.set_path(&["status", "a"], json!(1));
        let mut b = Patch::new();
        b.set_path(&["status", "b"], json!(2));
        a.merge(&b);
        assert_eq!(a.as_value().pointer("/status/a"), Some(&json!(1)));
        assert_eq!(a.as_value().pointer("/status/b"), Some(&json!(2)));
    }

    #[test]
    fn json_patch_replace_for_existing_field() {
        let original = json!({"xyz": 1});
        let mut patch = Patch::new();
        patch.set_path(&["xyz"], json!(123));
        let ops = patch.to_json_patch(&original);
        assert_eq!(ops, vec![json!({"op": "replace", "path": "/xyz", "value": 123})]);
    }

    #[test]
    fn json_patch_add_for_new_field() {
        let original = json!({});
        let mut patch = Patch::new();
        patch.set_path(&["xyz"], json!(123));
        let ops = patch.to_json_patch(&original);
        assert_eq!(ops, vec![json!({"op": "add", "path": "/xyz", "value": 123})]);
    }

    #[test]
    fn json_patch_remove_for_null_on_existing() {
        let original = json!({"xyz": 1});
        let mut patch = Patch::new();
        patch.remove_path(&["xyz"]);
        let ops = patch.to_json_patch(&original);
        assert_eq!(ops, vec![json!({"op": "remove", "path": "/xyz"})]);
    }
}
