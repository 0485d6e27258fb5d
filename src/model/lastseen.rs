/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/lastseen.rs
*
* The last-seen annotation (spec §3, §6): a JSON snapshot of a sanitized
* body, stored under `kopf.zalando.org/last-handled-configuration`, used to
* compute a stable digest and to diff against the current body.
*
* Sanitization strips the fields that change on every apply regardless of
* user intent (uid, resourceVersion, creationTimestamp, ...) plus the
* framework's own progress subtree (`status.kopf`), but — unlike the cruder
* "delete the entire status object" behavior of older reference snapshots —
* leaves the rest of `status` untouched, so handlers can diff against
* status fields other operators or subresource writers maintain.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::Value;

pub const LAST_SEEN_ANNOTATION: &str = "kopf.zalando.org/last-handled-configuration";
const KUBECTL_LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// A content-addressed identifier of a sanitized body. Two bodies with the
/// same digest are, for the purposes of progress tracking, "the same
/// configuration" (§3, §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(pub String);

impl Digest {
    pub fn of(value: &Value) -> Self {
        let canonical = serde_json::to_string(value).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Digest(format!("{:016x}", hasher.finish()))
    }
}

/// Returns a sanitized copy of `body` with all system-managed metadata
/// fields and the framework's own progress subtree removed. Idempotent:
/// `sanitize(sanitize(b)) == sanitize(b)` (§8 Laws), since every field it
/// strips is already absent after the first pass.
pub fn sanitize(body: &Value) -> Value {
    let mut out = body.clone();
    if let Some(metadata) = out.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "uid",
            "resourceVersion",
            "creationTimestamp",
            "deletionTimestamp",
            "selfLink",
            "finalizers",
            "generation",
        ] {
            metadata.remove(field);
        }
        if let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove(LAST_SEEN_ANNOTATION);
            annotations.remove(KUBECTL_LAST_APPLIED_ANNOTATION);
            if annotations.is_empty() {
                metadata.remove("annotations");
            }
        }
    }
    if let Some(status) = out.get_mut("status").and_then(Value::as_object_mut) {
        status.remove("kopf");
        if status.is_empty() {
            if let Some(map) = out.as_object_mut() {
                map.remove("status");
            }
        }
    }
    out
}

/// The value to store in the last-seen annotation: the sanitized body,
/// serialized to a JSON string (the annotation is itself a string-valued
/// field, so the sanitized structure is nested one level deeper as text).
pub fn refresh_last_seen_state(body: &Value) -> String {
    serde_json::to_string(&sanitize(body)).unwrap_or_default()
}

/// Parses a previously-stored last-seen annotation value back into a body,
/// for diffing against the current sanitized body. Returns `Value::Null`
/// when absent (an object handled for the first time has no prior state,
/// which diffs as "everything added").
pub fn parse_last_seen(body: &Value) -> Value {
    body.pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_SEEN_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_strips_system_metadata_but_keeps_other_status() {
        let body = json!({
            "metadata": {
                "name": "x",
                "uid": "u1",
                "resourceVersion": "123",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "finalizers": ["f"],
                "annotations": {
                    LAST_SEEN_ANNOTATION: "{}",
                    "other": "keep-me"
                }
            },
            "status": {
                "kopf": {"progress": {}},
                "phase": "Running"
            },
            "spec": {"field": "a"}
        });
        let sanitized = sanitize(&body);
        assert_eq!(sanitized.pointer("/metadata/uid"), None);
        assert_eq!(sanitized.pointer("/metadata/resourceVersion"), None);
        assert_eq!(
            sanitized.pointer("/metadata/annotations/other"),
            Some(&json!("keep-me"))
        );
        assert_eq!(sanitized.pointer("/status/kopf"), None);
        assert_eq!(sanitized.pointer("/status/phase"), Some(&json!("Running")));
        assert_eq!(sanitized.pointer("/spec/field"), Some(&json!("a")));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let body = json!({"metadata": {"uid": "u1", "name": "x"}, "status": {"kopf": {}}});
        let once = sanitize(&body);
        let twice = sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn digest_stable_across_equivalent_values() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(Digest::of(&a), Digest::of(&b));
    }

    #[test]
    fn digest_changes_when_body_changes() {
        let a = json!({"spec": {"field": "a"}});
        let b = json!({"spec": {"field": "b"}});
        assert_ne!(Digest::of(&a), Digest::of(&b));
    }
}
