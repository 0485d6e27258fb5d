/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/object_id.rs
*
* Object identity (spec §3). Ordinarily `metadata.uid`; when a watched body
* lacks one (synthetic "initial content" events built from a list response
* do carry it, but hand-rolled test fixtures and some aggregated resources
* do not) a stable key is synthesized from (kind, apiVersion, name,
* namespace, creationTimestamp).
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde_json::Value;
use std::fmt;

/// Key used by the per-object multiplexer (C6) to route events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    /// Extracts or synthesizes the identity for one raw body.
    pub fn from_body(body: &Value) -> Self {
        if let Some(uid) = body.pointer("/metadata/uid").and_then(Value::as_str) {
            return ObjectId(uid.to_string());
        }
        let kind = body.get("kind").and_then(Value::as_str).unwrap_or("");
        let api_version = body.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        let name = body.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("");
        let namespace = body.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("");
        let created = body
            .pointer("/metadata/creationTimestamp")
            .and_then(Value::as_str)
            .unwrap_or("");
        ObjectId(format!("{kind}//{api_version}//{name}//{namespace}//{created}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_uid_when_present() {
        let body = json!({"metadata": {"uid": "u1", "name": "x"}});
        assert_eq!(ObjectId::from_body(&body).as_str(), "u1");
    }

    #[test]
    fn synthesizes_stable_key_without_uid() {
        let body = json!({
            "kind": "Widget",
            "apiVersion": "example.com/v1",
            "metadata": {"name": "a", "namespace": "ns1", "creationTimestamp": "2024-01-01T00:00:00Z"}
        });
        let id = ObjectId::from_body(&body);
        assert_eq!(id.as_str(), "Widget//example.com/v1//a//ns1//2024-01-01T00:00:00Z");
    }

    #[test]
    fn synthesized_keys_differ_by_any_component() {
        let a = json!({"kind": "W", "apiVersion": "v1", "metadata": {"name": "a", "namespace": "ns1", "creationTimestamp": "t1"}});
        let b = json!({"kind": "W", "apiVersion": "v1", "metadata": {"name": "a", "namespace": "ns2", "creationTimestamp": "t1"}});
        assert_ne!(ObjectId::from_body(&a), ObjectId::from_body(&b));
    }
}
