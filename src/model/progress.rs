/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/progress.rs
*
* The per-handler progress record (spec §3, §4.4): started/stopped/delayed/
* retries/success/failure/message, stored under
* `status.kopf.progress.<handler_id>`. This module holds the pure data type
* and the state-transition predicates; the mutating "patch the object"
* operations that use these live in src/progress_store.rs (C4) since they
* need access to the merge-patch accumulator and the clock.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lastseen::Digest;

/// A terminal success/failure marker: either a literal `true` (the original
/// framework's shorthand for "succeeded, digest not tracked") or a digest
/// that must match the current body for the marker to still be valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    Bool(bool),
    Digest(String),
}

impl Marker {
    pub fn is_valid_for(&self, current: &Digest) -> bool {
        match self {
            Marker::Bool(b) => *b,
            Marker::Digest(d) => d == &current.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub delayed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: u32,
    pub success: Option<Marker>,
    pub failure: Option<Marker>,
    pub message: Option<String>,
}

/// Where a handler currently stands relative to the object's current body
/// digest (spec §3: "A handler is *finished* when its success or failure
/// digest matches the current body digest ...; *sleeping* when not finished
/// and `delayed > now`; *awakened* when neither.").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Finished,
    Sleeping,
    Awakened,
}

impl ProgressRecord {
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_finished(&self, current_digest: &Digest) -> bool {
        self.success
            .as_ref()
            .map(|m| m.is_valid_for(current_digest))
            .unwrap_or(false)
            || self
                .failure
                .as_ref()
                .map(|m| m.is_valid_for(current_digest))
                .unwrap_or(false)
    }

    pub fn state(&self, current_digest: &Digest, now: DateTime<Utc>) -> HandlerState {
        if self.is_finished(current_digest) {
            HandlerState::Finished
        } else if self.delayed.map(|d| d > now).unwrap_or(false) {
            HandlerState::Sleeping
        } else {
            HandlerState::Awakened
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn finished_iff_marker_matches_digest() {
        let digest = Digest("abc".into());
        let mut rec = ProgressRecord::default();
        rec.success = Some(Marker::Digest("abc".into()));
        assert!(rec.is_finished(&digest));
        rec.success = Some(Marker::Digest("different".into()));
        assert!(!rec.is_finished(&digest));
    }

    #[test]
    fn bool_true_marker_is_always_finished() {
        let digest = Digest("abc".into());
        let mut rec = ProgressRecord::default();
        rec.success = Some(Marker::Bool(true));
        assert!(rec.is_finished(&digest));
    }

    #[test]
    fn sleeping_when_delayed_in_future() {
        let digest = Digest("abc".into());
        let now = Utc::now();
        let rec = ProgressRecord {
            delayed: Some(now + Duration::seconds(30)),
            ..Default::default()
        };
        assert_eq!(rec.state(&digest, now), HandlerState::Sleeping);
    }

    #[test]
    fn awakened_when_neither_finished_nor_sleeping() {
        let digest = Digest("abc".into());
        let now = Utc::now();
        let rec = ProgressRecord::default();
        assert_eq!(rec.state(&digest, now), HandlerState::Awakened);
    }
}
