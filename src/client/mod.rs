/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/client/mod.rs
*
* The API client (C2, spec §4.2): a thin, authenticated HTTP layer over the
* Kubernetes REST surface. Deliberately built on `reqwest` directly rather
* than wrapping `kube::Client`, because the credentials vault (C1) manages
* several independently-rotated connection configs and a single
* `kube::Client` cannot be swapped mid-request the way `reauthenticated`
* calls need.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod errors;
pub mod stream;

pub use errors::ApiError;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::model::credentials::VaultKey;
use crate::model::resource::Resource;
use crate::settings::WatchingSettings;
use crate::vault::Vault;
use std::sync::Arc;

const MAX_EVENT_MESSAGE_LEN: usize = 1024;

/// The result of a list call: the decoded items plus the `resourceVersion`
/// the caller should resume watching from.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<Value>,
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventType {
    /// A synthetic event manufactured from an initial list response: "initial
    /// content, no cause" (spec §4.5). Never appears on the wire.
    Synthetic,
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: RawEventType,
    pub object: Value,
}

pub struct ApiClient {
    http: reqwest::Client,
    vault: Arc<Vault>,
    watching: WatchingSettings,
}

impl ApiClient {
    pub fn new(vault: Arc<Vault>, watching: WatchingSettings) -> Self {
        ApiClient {
            http: reqwest::Client::builder()
                .danger_accept_invalid_certs(false)
                .build()
                .expect("reqwest client builds with default TLS config"),
            vault,
            watching,
        }
    }

    fn auth_header(info: &crate::model::credentials::ConnectionInfo) -> Option<(&'static str, String)> {
        if let Some(token) = &info.token {
            return Some(("authorization", format!("Bearer {token}")));
        }
        if let (Some(user), Some(pass)) = (&info.username, &info.password) {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            return Some(("authorization", format!("Basic {encoded}")));
        }
        None
    }

    /// Runs `op` against each vault-selected credential in turn; on an
    /// [`ApiError::Unauthorized`] response, invalidates the key that was
    /// used and retries with the next selection. Propagates the last error
    /// if the vault is exhausted (§4.1, §4.2 "reauthenticated request").
    async fn reauthenticated<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: Fn(String, crate::model::credentials::ConnectionInfo) -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        loop {
            let (key, info) = self.vault.select().await;
            let server = info.server.clone();
            match op(server, info).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unauthorized() => {
                    let invalidate_result = self
                        .vault
                        .invalidate(&key, Some(crate::vault::VaultError::AccessError(err.to_string())))
                        .await;
                    if invalidate_result.is_err() {
                        return Err(err);
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self), fields(resource = %resource, namespace = namespace.unwrap_or("*")))]
    pub async fn list(&self, resource: &Resource, namespace: Option<&str>) -> Result<ListResult, ApiError> {
        self.reauthenticated(|server, info| {
            let url = format!("{server}{}", resource.get_url(namespace));
            let client = self.http.clone();
            let auth = Self::auth_header(&info);
            async move {
                let mut req = client.get(&url);
                if let Some((name, value)) = auth {
                    req = req.header(name, value);
                }
                let response = req.send().await?;
                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    let body: Option<Value> = response.json().await.ok();
                    return Err(ApiError::from_response(status, body.as_ref()));
                }
                let body: Value = response.json().await?;
                let resource_version = body
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                    .unwrap_or("0")
                    .to_string();
                let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
                Ok(ListResult { items, resource_version })
            }
        })
        .await
    }

    /// Opens the watch byte stream since `resource_version`. Returns a
    /// stream of decoded [`RawEvent`]s; the caller (C5) is responsible for
    /// resuming after disconnects and for the `ERROR 410` restart rule.
    #[instrument(skip(self), fields(resource = %resource, namespace = namespace.unwrap_or("*")))]
    pub async fn watch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<impl futures::Stream<Item = Result<RawEvent, ApiError>>, ApiError> {
        let (key, info) = self.vault.select().await;
        let server = info.server.clone();
        let auth = Self::auth_header(&info);
        let timeout_secs = self.watching.server_timeout.as_secs();
        let url = format!(
            "{server}{}?watch=true&resourceVersion={resource_version}&timeoutSeconds={timeout_secs}",
            resource.get_url(namespace)
        );
        let mut req = self.http.get(&url).timeout(self.watching.client_timeout);
        if let Some((name, value)) = auth {
            req = req.header(name, value);
        }
        let response = req.send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: Option<Value> = response.json().await.ok();
            let err = ApiError::from_response(status, body.as_ref());
            if err.is_unauthorized() {
                let _ = self
                    .vault
                    .invalidate(&key, Some(crate::vault::VaultError::AccessError(err.to_string())))
                    .await;
            }
            return Err(err);
        }
        let mut decoder = stream::JsonLineDecoder::new();
        let byte_stream = response.bytes_stream();
        let events = byte_stream.flat_map(move |chunk| {
            let decoded: Vec<Result<RawEvent, ApiError>> = match chunk {
                Ok(bytes) => decoder
                    .feed(bytes)
                    .into_iter()
                    .filter_map(|parsed| match parsed {
                        Ok(value) => decode_watch_line(value),
                        Err(err) => Some(Err(ApiError::Generic {
                            status: 0,
                            message: format!("malformed watch line: {err}"),
                        })),
                    })
                    .collect(),
                Err(err) => vec![Err(ApiError::Transport(err))],
            };
            futures::stream::iter(decoded)
        });
        Ok(events)
    }

    #[instrument(skip(self, merge_patch), fields(resource = %resource, namespace, name))]
    pub async fn patch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Value, ApiError> {
        self.reauthenticated(|server, info| {
            let url = format!("{server}{}", resource.get_object_url(namespace, name));
            let client = self.http.clone();
            let auth = Self::auth_header(&info);
            let body = merge_patch.clone();
            async move {
                let mut req = client
                    .patch(&url)
                    .header("content-type", "application/merge-patch+json")
                    .json(&body);
                if let Some((name, value)) = auth {
                    req = req.header(name, value);
                }
                let response = req.send().await?;
                let status = response.status().as_u16();
                let parsed: Value = response.json().await.unwrap_or(Value::Null);
                if !(200..300).contains(&status) {
                    return Err(ApiError::from_response(status, Some(&parsed)));
                }
                Ok(parsed)
            }
        })
        .await
    }

    #[instrument(skip(self, body), fields(resource = %resource, namespace = namespace.unwrap_or("*")))]
    pub async fn create(&self, resource: &Resource, namespace: Option<&str>, body: &Value) -> Result<Value, ApiError> {
        self.reauthenticated(|server, info| {
            let url = format!("{server}{}", resource.get_url(namespace));
            let client = self.http.clone();
            let auth = Self::auth_header(&info);
            let payload = body.clone();
            async move {
                let mut req = client.post(&url).json(&payload);
                if let Some((name, value)) = auth {
                    req = req.header(name, value);
                }
                let response = req.send().await?;
                let status = response.status().as_u16();
                let parsed: Value = response.json().await.unwrap_or(Value::Null);
                if !(200..300).contains(&status) {
                    return Err(ApiError::from_response(status, Some(&parsed)));
                }
                Ok(parsed)
            }
        })
        .await
    }

    /// Fetches an arbitrary discovery document (`/api`, `/apis`, `/api/{v}`,
    /// `/apis/{g}/{v}`) as raw JSON. Used only by the discovery layer (C3),
    /// which has no single `Resource` to address these endpoints by.
    #[instrument(skip(self))]
    pub async fn get_raw(&self, path: &str) -> Result<Value, ApiError> {
        self.reauthenticated(|server, info| {
            let url = format!("{server}{path}");
            let client = self.http.clone();
            let auth = Self::auth_header(&info);
            async move {
                let mut req = client.get(&url);
                if let Some((name, value)) = auth {
                    req = req.header(name, value);
                }
                let response = req.send().await?;
                let status = response.status().as_u16();
                let body: Value = response.json().await.unwrap_or(Value::Null);
                if !(200..300).contains(&status) {
                    return Err(ApiError::from_response(status, Some(&body)));
                }
                Ok(body)
            }
        })
        .await
    }

    /// Returns the CA bundle of whichever connection config the vault
    /// currently hands out, for cluster-flavor sniffing (§4.10's tunnel
    /// auto-detection) rather than request authentication.
    pub async fn serving_ca(&self) -> Option<Vec<u8>> {
        let (_, info) = self.vault.select().await;
        info.ca_data
    }

    /// Posts a Kubernetes Event for `involved_object`, truncating overlong
    /// messages and skipping involved objects that are themselves `Event`s
    /// to avoid an explosion loop (§4.2). API errors here are logged and
    /// swallowed: event posting is a non-critical side channel.
    pub async fn post_event(&self, involved_object: &Value, reason: &str, message: &str, type_: &str) {
        if involved_object.get("kind").and_then(Value::as_str) == Some("Event") {
            return;
        }
        let truncated = truncate_event_message(message);
        let body = json!({
            "apiVersion": "v1",
            "kind": "Event",
            "involvedObject": involved_object,
            "reason": reason,
            "message": truncated,
            "type": type_,
            "source": {"component": "operon"},
        });
        let events_resource = Resource {
            group: "".into(),
            version: "v1".into(),
            plural: "events".into(),
            singular: "event".into(),
            kind: "Event".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["create".into()],
            namespaced: true,
            preferred: true,
        };
        let namespace = involved_object.pointer("/metadata/namespace").and_then(Value::as_str);
        if let Err(err) = self.create(&events_resource, namespace, &body).await {
            warn!(error = %err, "failed to post event, continuing");
        }
    }
}

fn truncate_event_message(message: &str) -> String {
    if message.chars().count() <= MAX_EVENT_MESSAGE_LEN {
        return message.to_string();
    }
    let half = (MAX_EVENT_MESSAGE_LEN - 3) / 2;
    let chars: Vec<char> = message.chars().collect();
    let prefix: String = chars[..half].iter().collect();
    let suffix: String = chars[chars.len() - half..].iter().collect();
    format!("{prefix}...{suffix}")
}

/// Decodes one watch line. Returns `None` for an unrecognized `type` (spec
/// §4.5 step 4: "log and skip" without touching the connection) rather than
/// an `Err`, since an `Err` here would make the caller tear down and reopen
/// the watch stream as if the connection itself had failed.
fn decode_watch_line(value: Value) -> Option<Result<RawEvent, ApiError>> {
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    let object = value.get("object").cloned().unwrap_or(Value::Null);
    match event_type {
        "ADDED" => Some(Ok(RawEvent { event_type: RawEventType::Added, object })),
        "MODIFIED" => Some(Ok(RawEvent { event_type: RawEventType::Modified, object })),
        "DELETED" => Some(Ok(RawEvent { event_type: RawEventType::Deleted, object })),
        "ERROR" => Some(Ok(RawEvent { event_type: RawEventType::Error, object })),
        other => {
            warn!(event_type = other, "skipping unrecognized watch event type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_preserves_prefix_and_suffix() {
        let long = "a".repeat(2000);
        let truncated = truncate_event_message(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("..."));
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('a'));
    }

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_event_message("short"), "short");
    }

    #[test]
    fn decodes_known_event_types() {
        let event = decode_watch_line(json!({"type": "ADDED", "object": {"a": 1}})).unwrap().unwrap();
        assert!(matches!(event.event_type, RawEventType::Added));
    }

    #[test]
    fn unrecognized_event_type_is_skipped_without_an_error() {
        let decoded = decode_watch_line(json!({"type": "BOOKMARK", "object": {}}));
        assert!(decoded.is_none());
    }
}
