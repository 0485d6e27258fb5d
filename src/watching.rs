/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/watching.rs
*
* The watch-stream engine (C5, spec §4.5): an infinite list-then-watch loop
* per (resource, namespace) that resumes across disconnects, restarts on a
* `410 Gone` resume token without re-listing, and blocks entirely while the
* global pause toggle set is on. Results are pushed onto an unbounded
* channel rather than returned as a `Stream` value, since the consumer (C6)
* needs to select over this alongside its own per-object queues.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::client::{ApiClient, ApiError, RawEvent, RawEventType};
use crate::model::resource::Resource;
use crate::primitives::ToggleSet;
use crate::settings::WatchingSettings;
use crate::telemetry::{WATCH_EVENTS_TOTAL, WATCH_RESTARTS_TOTAL};

fn event_type_label(event_type: &RawEventType) -> &'static str {
    match event_type {
        RawEventType::Synthetic => "synthetic",
        RawEventType::Added => "added",
        RawEventType::Modified => "modified",
        RawEventType::Deleted => "deleted",
        RawEventType::Error => "error",
    }
}

#[derive(Debug, Error)]
pub enum WatchingError {
    #[error("api error in watch stream: {0}")]
    Api(#[from] ApiError),
    #[error("watch stream fatal error: {0}")]
    Fatal(String),
}

/// One message out of [`infinite_watch`]: either a normal/synthetic event or
/// the `LISTED` bookmark marking the list→watch boundary.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(RawEvent),
    Listed,
}

fn resource_version_of(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn is_gone(object: &Value) -> bool {
    object.get("code").and_then(Value::as_u64) == Some(410)
}

/// Runs the list-then-watch loop forever, pushing [`WatchMessage`]s onto
/// `sender`. Returns only on a fatal (non-410) stream error or when the
/// receiving end is dropped.
#[instrument(skip(client, paused, sender), fields(resource = %resource, namespace = namespace.as_deref().unwrap_or("*")))]
pub async fn infinite_watch(
    client: Arc<ApiClient>,
    resource: Resource,
    namespace: Option<String>,
    paused: Arc<ToggleSet>,
    settings: WatchingSettings,
    sender: mpsc::UnboundedSender<WatchMessage>,
) -> Result<(), WatchingError> {
    let mut skip_pause_check = false;
    loop {
        if !skip_pause_check {
            paused.wait_for(false).await;
        }
        skip_pause_check = false;

        let listing = client.list(&resource, namespace.as_deref()).await?;
        for item in &listing.items {
            WATCH_EVENTS_TOTAL.with_label_values(&[&resource.to_string(), "synthetic"]).inc();
            let message = WatchMessage::Event(RawEvent {
                event_type: RawEventType::Synthetic,
                object: item.clone(),
            });
            if sender.send(message).is_err() {
                return Ok(());
            }
        }
        if sender.send(WatchMessage::Listed).is_err() {
            return Ok(());
        }

        let mut resource_version = listing.resource_version;
        'watching: loop {
            let stream = match client.watch(&resource, namespace.as_deref(), &resource_version).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "failed to open watch, backing off");
                    WATCH_RESTARTS_TOTAL.with_label_values(&[&resource.to_string()]).inc();
                    tokio::time::sleep(settings.reconnect_backoff).await;
                    continue 'watching;
                }
            };
            futures::pin_mut!(stream);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = paused.wait_for(true) => {
                        info!("pause requested, closing watch stream gracefully");
                        break 'watching;
                    }
                    item = stream.next() => item,
                };
                match next {
                    Some(Ok(event)) => match event.event_type {
                        RawEventType::Error => {
                            if is_gone(&event.object) {
                                info!("resume token expired (410 Gone), relisting without re-checking pause");
                                skip_pause_check = true;
                                break 'watching;
                            }
                            let message = event
                                .object
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unspecified watch error")
                                .to_string();
                            return Err(WatchingError::Fatal(message));
                        }
                        RawEventType::Synthetic => unreachable!("synthetic events never arrive over the wire"),
                        RawEventType::Added | RawEventType::Modified | RawEventType::Deleted => {
                            WATCH_EVENTS_TOTAL
                                .with_label_values(&[&resource.to_string(), event_type_label(&event.event_type)])
                                .inc();
                            if let Some(rv) = resource_version_of(&event.object) {
                                resource_version = rv;
                            }
                            if sender.send(WatchMessage::Event(event)).is_err() {
                                return Ok(());
                            }
                        }
                    },
                    Some(Err(err)) => {
                        warn!(error = %err, "watch stream read error, reconnecting with same resource version");
                        WATCH_RESTARTS_TOTAL.with_label_values(&[&resource.to_string()]).inc();
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                    None => {
                        WATCH_RESTARTS_TOTAL.with_label_values(&[&resource.to_string()]).inc();
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Convenience wrapper that spawns [`infinite_watch`] as its own task and
/// returns the handle plus the receiving end of its message channel.
pub fn spawn_watch(
    client: Arc<ApiClient>,
    resource: Resource,
    namespace: Option<String>,
    paused: Arc<ToggleSet>,
    settings: WatchingSettings,
) -> (tokio::task::JoinHandle<Result<(), WatchingError>>, mpsc::UnboundedReceiver<WatchMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(infinite_watch(client, resource, namespace, paused, settings, tx));
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn is_gone_detects_410_code() {
        assert!(is_gone(&json!({"code": 410})));
        assert!(!is_gone(&json!({"code": 500})));
        assert!(!is_gone(&json!({})));
    }

    #[test]
    fn resource_version_extracted_from_metadata() {
        let obj = json!({"metadata": {"resourceVersion": "42"}});
        assert_eq!(resource_version_of(&obj), Some("42".to_string()));
        assert_eq!(resource_version_of(&json!({})), None);
    }
}
