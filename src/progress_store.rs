/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/progress_store.rs
*
* The progress store (C4, spec §4.4): pure functions over (body, patch,
* handler_id, now) that update the merge-patch accumulator. Everything here
* is side-effect-free with respect to the cluster — the handler runner (C7)
* is the one that actually PATCHes the object with the accumulated result.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::lastseen::Digest;
use crate::model::patch::Patch;
use crate::model::progress::{Marker, ProgressRecord};

fn progress_path(handler_id: &str) -> [String; 4] {
    ["status".into(), "kopf".into(), "progress".into(), handler_id.into()]
}

fn read_progress(body: &Value, handler_id: &str) -> ProgressRecord {
    let pointer = format!("/status/kopf/progress/{handler_id}");
    ProgressRecord::from_value(body.pointer(&pointer))
}

fn path_refs(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

/// Records that a handler attempt has begun: `started` is written only
/// when absent (spec §4.4).
pub fn mark_started(body: &Value, patch: &mut Patch, handler_id: &str, now: DateTime<Utc>) {
    let mut record = read_progress(body, handler_id);
    if record.started.is_none() {
        record.started = Some(now);
        write_record(patch, handler_id, &record);
    }
}

/// Records a successful terminal outcome: `stopped`, `success=digest`, and
/// clears `message`. Optionally merges a per-handler result shallowly into
/// `status.<handler_id>`.
pub fn store_success(body: &Value, patch: &mut Patch, handler_id: &str, now: DateTime<Utc>, digest: &Digest, result: Option<Value>) {
    let mut record = read_progress(body, handler_id);
    record.retries += 1;
    record.stopped = Some(now);
    record.success = Some(Marker::Digest(digest.0.clone()));
    record.failure = None;
    record.message = None;
    write_record(patch, handler_id, &record);
    if let Some(result_value) = result {
        merge_result(body, patch, handler_id, result_value);
    }
}

/// Records a terminal failure (no further retries): `stopped`,
/// `failure=digest`, `message`.
pub fn store_failure(body: &Value, patch: &mut Patch, handler_id: &str, now: DateTime<Utc>, digest: &Digest, message: &str) {
    let mut record = read_progress(body, handler_id);
    record.retries += 1;
    record.stopped = Some(now);
    record.failure = Some(Marker::Digest(digest.0.clone()));
    record.message = Some(message.to_string());
    write_record(patch, handler_id, &record);
}

/// Records a retryable failure: increments `retries`, sets `delayed = now +
/// delay`, records `message`, but leaves `success`/`failure`/`stopped`
/// untouched since the handler hasn't terminated.
pub fn store_retry(body: &Value, patch: &mut Patch, handler_id: &str, now: DateTime<Utc>, delay: chrono::Duration, message: &str) {
    let mut record = read_progress(body, handler_id);
    record.retries += 1;
    record.delayed = Some(now + delay);
    record.message = Some(message.to_string());
    write_record(patch, handler_id, &record);
}

fn write_record(patch: &mut Patch, handler_id: &str, record: &ProgressRecord) {
    let path = progress_path(handler_id);
    patch.set_path(&path_refs(&path), record.to_value());
}

fn merge_result(body: &Value, patch: &mut Patch, handler_id: &str, result: Value) {
    match result {
        Value::Object(map) => {
            for (key, value) in map {
                let existing = body.pointer(&format!("/status/{handler_id}/{key}"));
                match (existing, &value) {
                    (Some(Value::Object(existing_map)), Value::Object(incoming_map)) => {
                        let mut merged = existing_map.clone();
                        for (k, v) in incoming_map {
                            merged.insert(k.clone(), v.clone());
                        }
                        patch.set_path(&["status", handler_id, &key], Value::Object(merged));
                    }
                    _ => patch.set_path(&["status", handler_id, &key], value),
                }
            }
        }
        scalar => patch.set_path(&["status", handler_id], scalar),
    }
}

/// Nulls the entire progress subtree once every handler on the object has
/// terminated (§4.4 `purge_progress`).
pub fn purge_progress(patch: &mut Patch) {
    patch.remove_path(&["status", "kopf", "progress"]);
}

/// Whether every tracked handler in `handler_ids` is finished against the
/// current digest — the precondition for purging progress and refreshing
/// the last-seen annotation.
pub fn all_finished(body: &Value, handler_ids: &[&str], digest: &Digest) -> bool {
    handler_ids
        .iter()
        .all(|id| read_progress(body, id).is_finished(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn started_written_only_once() {
        let body = json!({});
        let mut patch = Patch::new();
        let t1 = Utc::now();
        mark_started(&body, &mut patch, "h1", t1);
        let patched_once = patch.as_value();
        let mut body2 = body.clone();
        crate::model::patch::Patch::new(); // no-op, keeps import alive for readability
        // merge patched_once into body2 to simulate persistence
        body2["status"] = patched_once["status"].clone();
        let mut patch2 = Patch::new();
        mark_started(&body2, &mut patch2, "h1", t1 + chrono::Duration::seconds(5));
        assert!(patch2.is_empty());
    }

    #[test]
    fn store_success_sets_digest_and_clears_message() {
        let body = json!({"status": {"kopf": {"progress": {"h1": {"message": "oops", "retries": 1}}}}});
        let mut patch = Patch::new();
        let digest = Digest("abc".into());
        store_success(&body, &mut patch, "h1", Utc::now(), &digest, None);
        let value = patch.as_value();
        assert_eq!(
            value.pointer("/status/kopf/progress/h1/success"),
            Some(&json!("abc"))
        );
        assert_eq!(value.pointer("/status/kopf/progress/h1/message"), Some(&json!(null)));
    }

    #[test]
    fn store_retry_sets_delayed_in_future() {
        let body = json!({});
        let mut patch = Patch::new();
        let now = Utc::now();
        store_retry(&body, &mut patch, "h1", now, chrono::Duration::seconds(5), "try again");
        let value = patch.as_value();
        let delayed_str = value
            .pointer("/status/kopf/progress/h1/delayed")
            .and_then(Value::as_str)
            .unwrap();
        let delayed: DateTime<Utc> = delayed_str.parse().unwrap();
        assert!(delayed > now);
    }

    #[test]
    fn all_finished_true_when_every_handler_matches_digest() {
        let digest = Digest("abc".into());
        let body = json!({"status": {"kopf": {"progress": {
            "h1": {"success": "abc"},
            "h2": {"failure": "abc"}
        }}}});
        assert!(all_finished(&body, &["h1", "h2"], &digest));
        assert!(!all_finished(&body, &["h1", "h3"], &digest));
    }
}
