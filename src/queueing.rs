/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/queueing.rs
*
* The per-object multiplexer and worker pool (C6, spec §4.6). Consumes the
* watch-stream engine's message channel and fans events into one queue per
* `(Resource, UID)` object key, each served by its own long-lived worker
* task. A bounded semaphore caps how many of those workers may run at once;
* the first worker error is latched and propagated as a fatal error for the
* whole multiplexer, matching the "one bad apple cancels the batch" pool
* policy described for this component.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tracing::{instrument, warn};

use crate::client::RawEvent;
use crate::model::object_id::ObjectId;
use crate::model::resource::Resource;
use crate::primitives::{Toggle, ToggleSet};
use crate::settings::BatchingSettings;
use crate::telemetry::QUEUE_DEPTH;
use crate::watching::WatchMessage;

#[derive(Debug, Error)]
pub enum QueueingError {
    #[error("worker for object failed: {0}")]
    WorkerFailed(String),
    #[error("worker task panicked: {0}")]
    Panicked(String),
}

/// What a worker hands the registered processor for one coalesced batch.
pub struct ProcessorInput {
    pub resource: Resource,
    pub namespace: Option<String>,
    pub event: RawEvent,
    pub resource_indexed: bool,
    pub stream_pressure: Arc<Notify>,
    /// The operator-wide "still indexing" toggle (spec §4.6 step 3):
    /// `Some` and on while at least one indexable resource's initial
    /// listing hasn't completed yet. `None` when the orchestrator isn't
    /// tracking indexing readiness at all (scanning disabled).
    pub operator_indexed: Option<Arc<Toggle>>,
}

/// The handler-runner seam (C7 implements this). Kept as a trait so the
/// multiplexer itself can be unit-tested with a trivial stand-in.
#[async_trait::async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, input: ProcessorInput) -> Result<(), QueueingError>;
}

enum QueueItem {
    Event(RawEvent),
    Eos,
}

struct ObjectStream {
    backlog: Mutex<VecDeque<QueueItem>>,
    pressure: Arc<Notify>,
}

impl ObjectStream {
    fn new() -> Arc<Self> {
        Arc::new(ObjectStream {
            backlog: Mutex::new(VecDeque::new()),
            pressure: Arc::new(Notify::new()),
        })
    }

    async fn push(&self, item: QueueItem) {
        self.backlog.lock().await.push_back(item);
        self.pressure.notify_waiters();
    }
}

/// The result of one [`next_batch`] call.
enum BatchOutcome {
    /// A coalesced item is ready to process.
    Item(QueueItem),
    /// The stream's pressure signal fired but nothing new is in the
    /// backlog — a handler-scheduled wake-up (spec §4.6 step 3's
    /// `stream_pressure`), not a delivered event. The worker should
    /// reprocess whatever it last processed rather than treat this as a
    /// fresh event or as end-of-stream.
    Recheck,
}

/// Drains a stream's coalesced batch: waits up to `idle_timeout` for the
/// first event, then keeps only the latest arrival within `batch_window`,
/// matching the worker lifecycle described in spec §4.6.
async fn next_batch(stream: &ObjectStream, idle_timeout: Duration, batch_window: Duration) -> Option<BatchOutcome> {
    let first = {
        let notified = stream.pressure.notified();
        let existing = stream.backlog.lock().await.pop_front();
        match existing {
            Some(item) => item,
            None => {
                tokio::select! {
                    _ = notified => match stream.backlog.lock().await.pop_front() {
                        Some(item) => item,
                        None => return Some(BatchOutcome::Recheck),
                    },
                    _ = tokio::time::sleep(idle_timeout) => return None,
                }
            }
        }
    };
    if matches!(first, QueueItem::Eos) {
        return Some(BatchOutcome::Item(QueueItem::Eos));
    }
    let mut latest = first;
    let deadline = Instant::now() + batch_window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let notified = stream.pressure.notified();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => break,
            _ = notified => {
                let mut saw_eos = false;
                while let Some(item) = stream.backlog.lock().await.pop_front() {
                    match item {
                        QueueItem::Eos => {
                            saw_eos = true;
                            break;
                        }
                        newer => latest = newer,
                    }
                }
                if saw_eos {
                    break;
                }
            }
        }
    }
    Some(BatchOutcome::Item(latest))
}

/// Consumes `receiver` (the output of [`crate::watching::infinite_watch`])
/// and fans events into per-object workers until the channel closes or a
/// worker reports a fatal error.
#[instrument(skip_all, fields(resource = %resource, namespace = namespace.as_deref().unwrap_or("*")))]
pub async fn run_multiplexer(
    mut receiver: mpsc::UnboundedReceiver<WatchMessage>,
    resource: Resource,
    namespace: Option<String>,
    processor: Arc<dyn EventProcessor>,
    resource_indexed: bool,
    operator_indexed: Option<Arc<Toggle>>,
    indexing_set: Arc<ToggleSet>,
    settings: BatchingSettings,
) -> Result<(), QueueingError> {
    let streams: Arc<Mutex<HashMap<ObjectId, Arc<ObjectStream>>>> = Arc::new(Mutex::new(HashMap::new()));
    let semaphore = Arc::new(Semaphore::new(settings.worker_limit));
    let (fatal_tx, mut fatal_rx) = watch::channel::<Option<String>>(None);

    loop {
        tokio::select! {
            biased;
            _ = fatal_rx.changed() => {
                if let Some(message) = fatal_rx.borrow().clone() {
                    drain_all(&streams, settings.exit_timeout).await;
                    return Err(QueueingError::WorkerFailed(message));
                }
            }
            message = receiver.recv() => {
                match message {
                    None => {
                        drain_all(&streams, settings.exit_timeout).await;
                        return Ok(());
                    }
                    Some(WatchMessage::Listed) => {
                        if resource_indexed {
                            if let Some(toggle) = &operator_indexed {
                                toggle.turn_off().await;
                                indexing_set.refresh().await;
                            }
                        }
                    }
                    Some(WatchMessage::Event(event)) => {
                        let key = ObjectId::from_body(&event.object);
                        let (stream, is_new) = {
                            let mut guard = streams.lock().await;
                            let is_new = !guard.contains_key(&key);
                            let stream = guard.entry(key.clone()).or_insert_with(ObjectStream::new).clone();
                            (stream, is_new)
                        };
                        stream.push(QueueItem::Event(event)).await;
                        if is_new {
                            QUEUE_DEPTH.with_label_values(&[&resource.to_string()]).set(streams.lock().await.len() as i64);
                            spawn_worker(
                                key,
                                stream,
                                streams.clone(),
                                semaphore.clone(),
                                processor.clone(),
                                resource.clone(),
                                namespace.clone(),
                                resource_indexed,
                                operator_indexed.clone(),
                                settings.clone(),
                                fatal_tx.clone(),
                            );
                        }
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    key: ObjectId,
    stream: Arc<ObjectStream>,
    streams: Arc<Mutex<HashMap<ObjectId, Arc<ObjectStream>>>>,
    semaphore: Arc<Semaphore>,
    processor: Arc<dyn EventProcessor>,
    resource: Resource,
    namespace: Option<String>,
    resource_indexed: bool,
    operator_indexed: Option<Arc<Toggle>>,
    settings: BatchingSettings,
    fatal_tx: watch::Sender<Option<String>>,
) {
    tokio::spawn(async move {
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let mut last_event: Option<RawEvent> = None;
        loop {
            let event = match next_batch(&stream, settings.idle_timeout, settings.batch_window).await {
                None => {
                    streams.lock().await.remove(&key);
                    QUEUE_DEPTH.with_label_values(&[&resource.to_string()]).set(streams.lock().await.len() as i64);
                    break;
                }
                Some(BatchOutcome::Item(QueueItem::Eos)) => {
                    streams.lock().await.remove(&key);
                    QUEUE_DEPTH.with_label_values(&[&resource.to_string()]).set(streams.lock().await.len() as i64);
                    break;
                }
                Some(BatchOutcome::Item(QueueItem::Event(event))) => {
                    last_event = Some(event.clone());
                    event
                }
                Some(BatchOutcome::Recheck) => match &last_event {
                    Some(event) => event.clone(),
                    None => continue,
                },
            };
            let input = ProcessorInput {
                resource: resource.clone(),
                namespace: namespace.clone(),
                event,
                resource_indexed,
                stream_pressure: stream.pressure.clone(),
                operator_indexed: operator_indexed.clone(),
            };
            if let Err(err) = processor.process(input).await {
                warn!(object = %key, error = %err, "worker failed, cancelling multiplexer");
                let _ = fatal_tx.send(Some(err.to_string()));
                streams.lock().await.remove(&key);
                QUEUE_DEPTH.with_label_values(&[&resource.to_string()]).set(streams.lock().await.len() as i64);
                break;
            }
        }
        drop(permit);
    });
}

/// Pushes an EOS marker into every live stream and waits up to
/// `exit_timeout` for them to drain naturally, warning about any that don't.
async fn drain_all(streams: &Arc<Mutex<HashMap<ObjectId, Arc<ObjectStream>>>>, exit_timeout: Duration) {
    let snapshot: Vec<Arc<ObjectStream>> = {
        let guard = streams.lock().await;
        guard.values().cloned().collect()
    };
    for stream in &snapshot {
        stream.push(QueueItem::Eos).await;
    }
    let deadline = Instant::now() + exit_timeout;
    while Instant::now() < deadline {
        if streams.lock().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let remaining = streams.lock().await.len();
    if remaining > 0 {
        warn!(remaining, "multiplexer shutdown timed out with undrained streams");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RawEventType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl EventProcessor for CountingProcessor {
        async fn process(&self, _input: ProcessorInput) -> Result<(), QueueingError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_resource() -> Resource {
        Resource {
            group: "".into(),
            version: "v1".into(),
            plural: "pods".into(),
            singular: "pod".into(),
            kind: "Pod".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into()],
            namespaced: true,
            preferred: true,
        }
    }

    #[tokio::test]
    async fn delivers_single_event_to_processor() {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor { count: count.clone() });
        let mut settings = BatchingSettings::default();
        settings.idle_timeout = Duration::from_millis(100);
        settings.batch_window = Duration::from_millis(10);

        let handle = tokio::spawn(run_multiplexer(rx, test_resource(), None, processor, false, None, ToggleSet::new(crate::primitives::ToggleSetMode::Any), settings));

        tx.send(WatchMessage::Event(RawEvent {
            event_type: RawEventType::Added,
            object: json!({"metadata": {"uid": "u1"}}),
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coalesces_rapid_events_on_same_object() {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(CountingProcessor { count: count.clone() });
        let mut settings = BatchingSettings::default();
        settings.idle_timeout = Duration::from_millis(300);
        settings.batch_window = Duration::from_millis(80);

        let handle = tokio::spawn(run_multiplexer(rx, test_resource(), None, processor, false, None, ToggleSet::new(crate::primitives::ToggleSetMode::Any), settings));
        for i in 0..5 {
            tx.send(WatchMessage::Event(RawEvent {
                event_type: RawEventType::Modified,
                object: json!({"metadata": {"uid": "u1", "resourceVersion": i.to_string()}}),
            }))
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
