/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/runner.rs
*
* The handler runner (C7, spec §4.7): for one incoming event on one object,
* computes the digest/diff, asks a lifecycle strategy which handlers to run
* this cycle, applies each handler's static filters, invokes the survivors,
* and folds their outcomes into a single merge-patch cycle. Implements
* [`crate::queueing::EventProcessor`] so it plugs directly into the
* per-object worker pool (C6).
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{instrument, warn};

use crate::client::ApiClient;
use crate::model::diff::{diff, Diff};
use crate::model::lastseen::{parse_last_seen, refresh_last_seen_state, sanitize, Digest, LAST_SEEN_ANNOTATION};
use crate::model::patch::Patch;
use crate::model::progress::HandlerState;
use crate::progress_store;
use crate::queueing::{EventProcessor, ProcessorInput, QueueingError};
use crate::telemetry::HANDLER_OUTCOMES_TOTAL;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Permanent(String),
    #[error("{message} (retry in {delay:?})")]
    Temporary { delay: Duration, message: String },
    /// Admission-specific outcome carrying a response code (spec §4.10):
    /// rejects the review with this message and HTTP-ish status code rather
    /// than scheduling a retry. Outside admission, the runner treats it the
    /// same as [`HandlerError::Permanent`].
    #[error("{message} (code {code})")]
    Admission { message: String, code: u16 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything a handler needs for one invocation: the object's current body,
/// the structural diff scoped to its own field filter (or the whole object
/// when unfiltered), a per-cycle scratch value shared across handlers on
/// this object ("memo"), the merge-patch accumulator, and any static
/// registration-time parameters.
pub struct Cause<'a> {
    pub body: &'a Value,
    pub diff: &'a Diff,
    pub memo: &'a mut Map<String, Value>,
    pub patch: &'a mut Patch,
    pub params: &'a Value,
    /// Free-form messages a handler wants surfaced to the caller. Only the
    /// admission server (C10) reads these back out; reconciliation cycles
    /// discard them along with the rest of the per-cycle scratch state.
    pub warnings: &'a mut Vec<String>,
}

/// A single label/annotation match predicate (spec §4.7: "exact-match /
/// `PRESENT` / `ABSENT` / callable predicates").
#[derive(Clone)]
pub enum LabelPredicate {
    Present,
    Absent,
    Equals(String),
    Custom(Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>),
}

impl fmt::Debug for LabelPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelPredicate::Present => write!(f, "Present"),
            LabelPredicate::Absent => write!(f, "Absent"),
            LabelPredicate::Equals(v) => write!(f, "Equals({v:?})"),
            LabelPredicate::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl LabelPredicate {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            LabelPredicate::Present => value.is_some(),
            LabelPredicate::Absent => value.is_none(),
            LabelPredicate::Equals(expected) => value == Some(expected.as_str()),
            LabelPredicate::Custom(f) => f(value),
        }
    }
}

/// Static filters applied before a selected handler is invoked.
#[derive(Debug, Clone, Default)]
pub struct HandlerFilter {
    /// If set, the handler only runs when the diff touches this field path.
    pub field: Option<Vec<String>>,
    pub labels: HashMap<String, LabelPredicate>,
    pub annotations: HashMap<String, LabelPredicate>,
}

fn metadata_lookup<'a>(body: &'a Value, bucket: &str, key: &str) -> Option<&'a str> {
    body.pointer(&format!("/metadata/{bucket}/{key}")).and_then(Value::as_str)
}

pub(crate) fn filter_passes(filter: &HandlerFilter, body: &Value, diff: &Diff) -> bool {
    if let Some(field) = &filter.field {
        let path: Vec<&str> = field.iter().map(String::as_str).collect();
        if diff.reduce(&path).is_empty() {
            return false;
        }
    }
    for (key, predicate) in &filter.labels {
        if !predicate.matches(metadata_lookup(body, "labels", key)) {
            return false;
        }
    }
    for (key, predicate) in &filter.annotations {
        if !predicate.matches(metadata_lookup(body, "annotations", key)) {
            return false;
        }
    }
    true
}

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn id(&self) -> &str;

    fn filter(&self) -> HandlerFilter {
        HandlerFilter::default()
    }

    async fn call(&self, cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError>;
}

/// Picks which of the currently-awakened handlers run this cycle (spec
/// §4.7: all_at_once / one_by_one / asap / randomized / shuffled).
pub trait LifecycleStrategy: Send + Sync {
    /// `awakened` is `(handler_id, retries)` pairs in registration order.
    /// Returns the subset (and order) to invoke this cycle.
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String>;
}

pub struct AllAtOnce;
impl LifecycleStrategy for AllAtOnce {
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String> {
        awakened.iter().map(|(id, _)| id.clone()).collect()
    }
}

pub struct OneByOne;
impl LifecycleStrategy for OneByOne {
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String> {
        awakened.first().map(|(id, _)| vec![id.clone()]).unwrap_or_default()
    }
}

/// Runs the least-retried awakened handler, ties broken by registration
/// order, approximating "give every handler its fair turn to catch up".
pub struct Asap;
impl LifecycleStrategy for Asap {
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String> {
        awakened
            .iter()
            .min_by_key(|(_, retries)| *retries)
            .map(|(id, _)| vec![id.clone()])
            .unwrap_or_default()
    }
}

/// All handlers run, but in a freshly-shuffled order every cycle.
pub struct Randomized;
impl LifecycleStrategy for Randomized {
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String> {
        let mut ids: Vec<String> = awakened.iter().map(|(id, _)| id.clone()).collect();
        ids.shuffle(&mut rand::thread_rng());
        ids
    }
}

/// All handlers run, in a single order chosen once and reused thereafter.
pub struct Shuffled {
    order: std::sync::Mutex<Option<Vec<String>>>,
}

impl Default for Shuffled {
    fn default() -> Self {
        Shuffled { order: std::sync::Mutex::new(None) }
    }
}

impl LifecycleStrategy for Shuffled {
    fn select(&self, awakened: &[(String, u32)]) -> Vec<String> {
        let mut guard = self.order.lock().unwrap();
        let known: Vec<String> = awakened.iter().map(|(id, _)| id.clone()).collect();
        let order = guard.get_or_insert_with(|| {
            let mut ids = known.clone();
            ids.shuffle(&mut rand::thread_rng());
            ids
        });
        let mut result: Vec<String> = order.iter().filter(|id| known.contains(id)).cloned().collect();
        for id in &known {
            if !result.contains(id) {
                result.push(id.clone());
            }
        }
        result
    }
}

/// Ties a set of handlers, a lifecycle strategy, and an API client into one
/// [`EventProcessor`] for a single registered resource.
pub struct HandlerRunner {
    handlers: Vec<Arc<dyn Handler>>,
    lifecycle: Arc<dyn LifecycleStrategy>,
    client: Arc<ApiClient>,
    params: Value,
}

impl HandlerRunner {
    pub fn new(handlers: Vec<Arc<dyn Handler>>, lifecycle: Arc<dyn LifecycleStrategy>, client: Arc<ApiClient>) -> Self {
        HandlerRunner { handlers, lifecycle, client, params: Value::Null }
    }

    fn handler_ids(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.id()).collect()
    }

    #[instrument(skip_all, fields(handler_count = self.handlers.len()))]
    async fn run_cycle(
        &self,
        resource: &crate::model::resource::Resource,
        namespace: Option<&str>,
        body: &Value,
        stream_pressure: &Arc<Notify>,
    ) -> Result<(), QueueingError> {
        let now = Utc::now();
        let sanitized = sanitize(body);
        let digest = Digest::of(&sanitized);
        let previous = parse_last_seen(body);
        let full_diff = diff(&previous, &sanitized);

        let mut awakened = Vec::new();
        for handler in &self.handlers {
            let pointer = format!("/status/kopf/progress/{}", handler.id());
            let record = crate::model::progress::ProgressRecord::from_value(body.pointer(&pointer));
            match record.state(&digest, now) {
                HandlerState::Finished | HandlerState::Sleeping => continue,
                HandlerState::Awakened => awakened.push((handler.id().to_string(), record.retries)),
            }
        }
        let selected_ids = self.lifecycle.select(&awakened);

        let mut combined_patch = Patch::new();
        let mut memo = Map::new();
        for handler in &self.handlers {
            if !selected_ids.iter().any(|id| id == handler.id()) {
                continue;
            }
            let filter = handler.filter();
            let scoped_diff = match &filter.field {
                Some(field) => {
                    let path: Vec<&str> = field.iter().map(String::as_str).collect();
                    full_diff.reduce(&path)
                }
                None => full_diff.clone(),
            };
            if !filter_passes(&filter, body, &full_diff) {
                continue;
            }

            progress_store::mark_started(body, &mut combined_patch, handler.id(), now);

            let mut handler_patch = Patch::new();
            let mut discarded_warnings = Vec::new();
            let outcome = {
                let mut cause = Cause {
                    body,
                    diff: &scoped_diff,
                    memo: &mut memo,
                    patch: &mut handler_patch,
                    params: &self.params,
                    warnings: &mut discarded_warnings,
                };
                handler.call(&mut cause).await
            };

            match outcome {
                Ok(result) => {
                    HANDLER_OUTCOMES_TOTAL.with_label_values(&[handler.id(), "success"]).inc();
                    progress_store::store_success(body, &mut combined_patch, handler.id(), now, &digest, result);
                    self.client
                        .post_event(body, "HandlerSucceeded", &format!("Handler {} succeeded", handler.id()), "Normal")
                        .await;
                }
                Err(HandlerError::Permanent(message)) => {
                    HANDLER_OUTCOMES_TOTAL.with_label_values(&[handler.id(), "failure"]).inc();
                    progress_store::store_failure(body, &mut combined_patch, handler.id(), now, &digest, &message);
                    self.client
                        .post_event(body, "HandlerFailed", &format!("Handler {} failed: {message}", handler.id()), "Warning")
                        .await;
                }
                Err(HandlerError::Temporary { delay, message }) => {
                    HANDLER_OUTCOMES_TOTAL.with_label_values(&[handler.id(), "retry"]).inc();
                    let chrono_delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
                    progress_store::store_retry(body, &mut combined_patch, handler.id(), now, chrono_delay, &message);
                    wake_stream_after(stream_pressure.clone(), delay);
                }
                Err(HandlerError::Admission { message, .. }) => {
                    HANDLER_OUTCOMES_TOTAL.with_label_values(&[handler.id(), "failure"]).inc();
                    progress_store::store_failure(body, &mut combined_patch, handler.id(), now, &digest, &message);
                }
                Err(HandlerError::Other(err)) => {
                    HANDLER_OUTCOMES_TOTAL.with_label_values(&[handler.id(), "retry"]).inc();
                    warn!(handler = handler.id(), error = %err, "handler raised an unclassified error, scheduling a default retry");
                    let chrono_delay = chrono::Duration::from_std(DEFAULT_RETRY_DELAY).unwrap();
                    progress_store::store_retry(body, &mut combined_patch, handler.id(), now, chrono_delay, &err.to_string());
                    wake_stream_after(stream_pressure.clone(), DEFAULT_RETRY_DELAY);
                }
            }
            combined_patch.merge(&handler_patch);
        }

        if combined_patch.is_empty() && selected_ids.is_empty() {
            return Ok(());
        }

        let handler_ids = self.handler_ids();
        if progress_store::all_finished(body, &handler_ids, &digest) {
            progress_store::purge_progress(&mut combined_patch);
            combined_patch.set_path(
                &["metadata", "annotations", LAST_SEEN_ANNOTATION],
                Value::String(refresh_last_seen_state(body)),
            );
        }

        if combined_patch.is_empty() {
            return Ok(());
        }

        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        self.client
            .patch(resource, namespace, &name, &combined_patch.to_merge_patch_json())
            .await
            .map_err(|err| QueueingError::WorkerFailed(format!("failed to patch object after handler cycle: {err}")))?;
        Ok(())
    }
}

/// Schedules a wake-up of `pressure` after `delay`, so the worker's idle
/// wait (bounded by the much longer `idle_timeout`) doesn't sit out a
/// handler-scheduled retry that's due sooner.
fn wake_stream_after(pressure: Arc<Notify>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        pressure.notify_waiters();
    });
}

#[async_trait::async_trait]
impl EventProcessor for HandlerRunner {
    async fn process(&self, input: ProcessorInput) -> Result<(), QueueingError> {
        if !input.resource_indexed {
            if let Some(toggle) = &input.operator_indexed {
                toggle.wait_for(false).await;
            }
        }
        self.run_cycle(&input.resource, input.namespace.as_deref(), &input.event.object, &input.stream_pressure)
            .await
    }
}

/// Maps resources to the handlers registered against them (via a
/// [`crate::model::resource::Selector`]), so the orchestrator (C9) can build
/// one [`HandlerRunner`] per watched resource without each call site
/// re-deriving the selector match itself.
pub struct HandlerRegistry {
    entries: Vec<(crate::model::resource::Selector, Arc<dyn Handler>)>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry { entries: Vec::new() }
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, selector: crate::model::resource::Selector, handler: Arc<dyn Handler>) {
        self.entries.push((selector, handler));
    }

    pub fn handlers_for(&self, resource: &crate::model::resource::Resource) -> Vec<Arc<dyn Handler>> {
        self.entries
            .iter()
            .filter(|(selector, _)| selector.matches(resource))
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Whether any handler is registered against `resource`. A handler cycle
    /// always ends in a patch (progress tracking, last-seen annotation, or
    /// the handler's own result), so this doubles as "does this resource
    /// need patch" for discovery's ambiguity resolution.
    pub fn has_handlers(&self, resource: &crate::model::resource::Resource) -> bool {
        self.entries.iter().any(|(selector, _)| selector.matches(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysSucceeds;
    #[async_trait::async_trait]
    impl Handler for AlwaysSucceeds {
        fn id(&self) -> &str {
            "h1"
        }
        async fn call(&self, _cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    #[test]
    fn all_at_once_returns_every_awakened_id() {
        let strategy = AllAtOnce;
        let awakened = vec![("a".to_string(), 0), ("b".to_string(), 2)];
        assert_eq!(strategy.select(&awakened), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn one_by_one_returns_first_only() {
        let strategy = OneByOne;
        let awakened = vec![("a".to_string(), 0), ("b".to_string(), 2)];
        assert_eq!(strategy.select(&awakened), vec!["a".to_string()]);
    }

    #[test]
    fn asap_picks_least_retried() {
        let strategy = Asap;
        let awakened = vec![("a".to_string(), 5), ("b".to_string(), 1)];
        assert_eq!(strategy.select(&awakened), vec!["b".to_string()]);
    }

    #[test]
    fn shuffled_order_is_stable_across_calls() {
        let strategy = Shuffled::default();
        let awakened = vec![("a".to_string(), 0), ("b".to_string(), 0), ("c".to_string(), 0)];
        let first = strategy.select(&awakened);
        let second = strategy.select(&awakened);
        assert_eq!(first, second);
    }

    #[test]
    fn field_filter_blocks_unrelated_changes() {
        let filter = HandlerFilter {
            field: Some(vec!["spec".into(), "replicas".into()]),
            ..Default::default()
        };
        let old = json!({"spec": {"replicas": 1, "image": "a"}});
        let new = json!({"spec": {"replicas": 1, "image": "b"}});
        let d = diff(&old, &new);
        assert!(!filter_passes(&filter, &new, &d));
    }

    #[test]
    fn label_predicate_present_requires_a_value() {
        let mut filter = HandlerFilter::default();
        filter.labels.insert("team".to_string(), LabelPredicate::Present);
        let body_with = json!({"metadata": {"labels": {"team": "x"}}});
        let body_without = json!({"metadata": {"labels": {}}});
        let empty_diff = Diff::default();
        assert!(filter_passes(&filter, &body_with, &empty_diff));
        assert!(!filter_passes(&filter, &body_without, &empty_diff));
    }
}
