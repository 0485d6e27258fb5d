/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/diff.rs
*
* Structural diffing between two JSON bodies (spec §4.4, §8). A diff is a
* flat sequence of (operation, path, old, new) items over object fields;
* arrays and scalars are compared as opaque atomic values (a changed array
* element produces one CHANGE at the array's own path, not per-element
* diffs) since Kubernetes objects rarely benefit from positional array
* diffing and the source framework treats them the same way.
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOperation {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffItem {
    pub op: DiffOperation,
    pub path: Vec<String>,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// An ordered collection of [`DiffItem`]s. Ordered only in the sense of
/// "produced in key-sorted traversal order"; no semantic meaning attaches to
/// position beyond that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff(pub Vec<DiffItem>);

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiffItem> {
        self.0.iter()
    }

    /// Re-scopes a diff computed at the root to one rooted at `path`.
    ///
    /// Three cases (§9 law "reduce is a homomorphism"):
    /// - an item entirely outside `path` is dropped;
    /// - an item whose path starts with `path` has that prefix stripped;
    /// - an item whose path is a strict *prefix* of `path` (the change
    ///   happened above the point we care about) is re-resolved: we look up
    ///   `path` inside both `old`/`new` at that item and, if the values
    ///   differ, emit a single CHANGE at the empty (root) path; identical
    ///   values produce no item at all.
    pub fn reduce(&self, path: &[&str]) -> Diff {
        let mut out = Vec::new();
        for item in &self.0 {
            if item.path.len() >= path.len() && item.path[..path.len()] == path_as_vec(path)[..] {
                out.push(DiffItem {
                    op: item.op,
                    path: item.path[path.len()..].to_vec(),
                    old: item.old.clone(),
                    new: item.new.clone(),
                });
            } else if path.len() > item.path.len() && path_as_vec(path)[..item.path.len()] == item.path[..] {
                let sub_path = &path[item.path.len()..];
                let resolved_old = item.old.as_ref().and_then(|v| resolve(v, sub_path));
                let resolved_new = item.new.as_ref().and_then(|v| resolve(v, sub_path));
                if resolved_old != resolved_new {
                    out.push(DiffItem {
                        op: DiffOperation::Change,
                        path: vec![],
                        old: resolved_old,
                        new: resolved_new,
                    });
                }
            }
        }
        Diff(out)
    }
}

fn path_as_vec(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| s.to_string()).collect()
}

fn resolve(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Computes the structural diff between `old` and `new`, recursing through
/// JSON objects (`Value::Object`) and treating everything else (arrays,
/// scalars, `null`) as an atomic leaf.
pub fn diff(old: &Value, new: &Value) -> Diff {
    let mut items = Vec::new();
    diff_into(&mut items, &mut Vec::new(), old, new);
    Diff(items)
}

fn diff_into(out: &mut Vec<DiffItem>, path: &mut Vec<String>, old: &Value, new: &Value) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: std::collections::BTreeSet<&String> = old_map.keys().collect();
            keys.extend(new_map.keys());
            for key in keys {
                path.push(key.clone());
                match (old_map.get(key), new_map.get(key)) {
                    (Some(o), Some(n)) => diff_into(out, path, o, n),
                    (Some(o), None) => out.push(DiffItem {
                        op: DiffOperation::Remove,
                        path: path.clone(),
                        old: Some(o.clone()),
                        new: None,
                    }),
                    (None, Some(n)) => out.push(DiffItem {
                        op: DiffOperation::Add,
                        path: path.clone(),
                        old: None,
                        new: Some(n.clone()),
                    }),
                    (None, None) => unreachable!("key came from one of the two maps"),
                }
                path.pop();
            }
        }
        _ => {
            if old != new {
                out.push(DiffItem {
                    op: DiffOperation::Change,
                    path: path.clone(),
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_add_change_remove() {
        let old = json!({"spec": {"a": 1, "b": 2}});
        let new = json!({"spec": {"a": 5, "c": 3}});
        let d = diff(&old, &new);
        let ops: Vec<_> = d.iter().map(|i| (i.op, i.path.clone())).collect();
        assert!(ops.contains(&(DiffOperation::Change, vec!["spec".into(), "a".into()])));
        assert!(ops.contains(&(DiffOperation::Remove, vec!["spec".into(), "b".into()])));
        assert!(ops.contains(&(DiffOperation::Add, vec!["spec".into(), "c".into()])));
    }

    #[test]
    fn no_diff_for_identical_bodies() {
        let body = json!({"spec": {"a": [1, 2, 3]}});
        assert!(diff(&body, &body).is_empty());
    }

    #[test]
    fn reduce_truncates_prefix() {
        let old = json!({"spec": {"field": "a"}});
        let new = json!({"spec": {"field": "b"}});
        let d = diff(&old, &new);
        let reduced = d.reduce(&["spec"]);
        assert_eq!(reduced.0.len(), 1);
        assert_eq!(reduced.0[0].path, vec!["field".to_string()]);
    }

    #[test]
    fn reduce_resolves_when_path_is_deeper_than_the_change() {
        let old = json!({"spec": {"a": 1}});
        let new = json!({"spec": {"a": 2}});
        let d = diff(&old, &new);
        let reduced = d.reduce(&["spec", "a"]);
        assert_eq!(reduced.0.len(), 1);
        assert_eq!(reduced.0[0].path, Vec::<String>::new());
        assert_eq!(reduced.0[0].old, Some(json!(1)));
        assert_eq!(reduced.0[0].new, Some(json!(2)));
    }

    #[test]
    fn reduce_is_homomorphism_over_resolved_subvalues() {
        let old = json!({"spec": {"nested": {"x": 1, "y": 9}}});
        let new = json!({"spec": {"nested": {"x": 2, "y": 9}}});
        let whole = diff(&old, &new).reduce(&["spec"]);
        let direct = diff(old.get("spec").unwrap(), new.get("spec").unwrap());
        assert_eq!(whole, direct);
    }
}
