/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/peering.rs
*
* Peering (C8, spec §4.8): coordinates multiple operator instances sharing a
* cluster so only one processes each object at a time. Built from two
* independent tasks per (peering resource, namespace) — a keepalive that
* writes this instance's own entry, and a processor that reacts to the
* shared peering object's watch stream and drives the global pause toggle.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::client::ApiClient;
use crate::model::patch::Patch;
use crate::model::peer::PeerRecord;
use crate::model::resource::Resource;
use crate::primitives::{Toggle, ToggleSet};
use crate::settings::PeeringSettings;
use crate::telemetry::PEERING_CONFLICTS;

#[derive(Debug, Error)]
pub enum PeeringError {
    #[error("failed to touch own peering entry: {0}")]
    TouchFailed(String),
}

/// This instance's identity within a peering object: `POD_ID` if set, else
/// a synthesized `user@host/timestamp/rand` string (spec §4.8).
pub fn own_identity(pod_id_env: &str) -> String {
    if let Ok(pod_id) = std::env::var(pod_id_env) {
        if !pod_id.is_empty() {
            return pod_id;
        }
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = hostname();
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let rnd: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{user}@{host}/{timestamp}/{rnd}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn parse_peers(body: &Value) -> HashMap<String, PeerRecord> {
    let mut peers = HashMap::new();
    if let Some(status) = body.get("status").and_then(Value::as_object) {
        for (identity, value) in status {
            if let Ok(record) = serde_json::from_value::<PeerRecord>(value.clone()) {
                peers.insert(identity.clone(), record);
            }
        }
    }
    peers
}

/// Runs the keepalive loop: every `lifetime - rand(5..10)` seconds, writes
/// this instance's own peer entry; on cancellation, writes a `lifetime: 0`
/// tombstone so peers notice promptly instead of waiting out the deadline.
#[instrument(skip(client, settings), fields(identity, resource = %resource))]
pub async fn run_keepalive(
    client: Arc<ApiClient>,
    resource: Resource,
    namespace: Option<String>,
    identity: String,
    settings: PeeringSettings,
) {
    loop {
        let record = PeerRecord {
            priority: settings.priority,
            lifetime: settings.lifetime,
            lastseen: Utc::now(),
        };
        if let Err(err) = touch(&client, &resource, namespace.as_deref(), &identity, &record).await {
            warn!(error = %err, "failed to refresh peering entry");
        }
        let jitter = rand::thread_rng().gen_range(5..10);
        let sleep_secs = (settings.lifetime - jitter).max(1) as u64;
        tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
    }
}

/// Writes (or tombstones, via a `lifetime: 0` record) this instance's own
/// peer entry.
pub async fn touch(
    client: &ApiClient,
    resource: &Resource,
    namespace: Option<&str>,
    identity: &str,
    record: &PeerRecord,
) -> Result<(), PeeringError> {
    let mut patch = Patch::new();
    patch.set_path(&["status", identity], serde_json::to_value(record).unwrap_or(Value::Null));
    let peering_name = "default";
    client
        .patch(resource, namespace, peering_name, &patch.to_merge_patch_json())
        .await
        .map_err(|err| PeeringError::TouchFailed(err.to_string()))?;
    Ok(())
}

/// Removes this instance's own entry (graceful shutdown).
pub async fn clean(client: &ApiClient, resource: &Resource, namespace: Option<&str>, identity: &str) {
    let mut patch = Patch::new();
    patch.remove_path(&["status", identity]);
    let _ = client.patch(resource, namespace, "default", &patch.to_merge_patch_json()).await;
}

/// The outcome of partitioning one watch snapshot of the peering object
/// relative to this instance's own priority.
#[derive(Debug, Default)]
pub struct PartitionResult {
    pub higher_priority: Vec<String>,
    pub same_priority: Vec<String>,
    pub lower_priority: Vec<String>,
    pub dead: Vec<String>,
}

fn partition(peers: &HashMap<String, PeerRecord>, own_identity: &str, own_priority: i32, now: chrono::DateTime<Utc>) -> PartitionResult {
    let mut result = PartitionResult::default();
    for (identity, record) in peers {
        if identity == own_identity {
            continue;
        }
        if record.is_dead(now) {
            result.dead.push(identity.clone());
            continue;
        }
        match record.priority.cmp(&own_priority) {
            std::cmp::Ordering::Greater => result.higher_priority.push(identity.clone()),
            std::cmp::Ordering::Equal => result.same_priority.push(identity.clone()),
            std::cmp::Ordering::Less => result.lower_priority.push(identity.clone()),
        }
    }
    result
}

/// Applies one snapshot of the peering object's body to the global pause
/// toggle and (when `autoclean`) patches dead peers out. This is the side
/// effect described in spec §4.8:
/// - higher-priority peers present → pause;
/// - only same-priority peers present → pause, with a warning (the source
///   framework treats tied priority as undefined leadership and refuses to
///   guess a tiebreaker rather than silently picking one by identity hash);
/// - neither → unpause.
#[instrument(skip(client, pause, body), fields(identity = identity))]
pub async fn apply_peering_snapshot(
    client: &ApiClient,
    resource: &Resource,
    namespace: Option<&str>,
    body: &Value,
    identity: &str,
    own_priority: i32,
    autoclean: bool,
    pause: &Arc<Toggle>,
) -> PartitionResult {
    let now = Utc::now();
    let peers = parse_peers(body);
    let partitioned = partition(&peers, identity, own_priority, now);

    if autoclean && !partitioned.dead.is_empty() {
        let mut patch = Patch::new();
        for dead_identity in &partitioned.dead {
            patch.remove_path(&["status", dead_identity]);
        }
        if let Err(err) = client
            .patch(resource, namespace, "default", &patch.to_merge_patch_json())
            .await
        {
            warn!(error = %err, "failed to clean up dead peering entries");
        }
    }

    if !partitioned.higher_priority.is_empty() {
        PEERING_CONFLICTS.with_label_values(&["higher_priority"]).inc();
        pause.turn_on().await;
    } else if !partitioned.same_priority.is_empty() {
        PEERING_CONFLICTS.with_label_values(&["same_priority"]).inc();
        warn!(peers = ?partitioned.same_priority, "other operator instances at the same priority are present; pausing with undefined leadership");
        pause.turn_on().await;
    } else {
        pause.turn_off().await;
    }
    partitioned
}

/// Registers (or reuses) a "peering missing" pause toggle: pre-activated
/// when peering is mandatory but no peering resource exists in the cluster
/// yet (spec §4.8, §4.9).
pub async fn make_peering_missing_toggle(pause_set: &Arc<ToggleSet>, mandatory: bool) -> Arc<Toggle> {
    pause_set.make_toggle(mandatory, Some("peering-missing".to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peering_resource() -> Resource {
        Resource {
            group: "zalando.org".into(),
            version: "v1".into(),
            plural: "kopfpeerings".into(),
            singular: "kopfpeering".into(),
            kind: "KopfPeering".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into(), "patch".into()],
            namespaced: false,
            preferred: true,
        }
    }

    #[test]
    fn partitions_peers_by_priority_excluding_self() {
        let now = Utc::now();
        let mut peers = HashMap::new();
        peers.insert(
            "self".to_string(),
            PeerRecord { priority: 5, lifetime: 60, lastseen: now },
        );
        peers.insert(
            "higher".to_string(),
            PeerRecord { priority: 10, lifetime: 60, lastseen: now },
        );
        peers.insert(
            "dead".to_string(),
            PeerRecord { priority: 0, lifetime: 0, lastseen: now },
        );
        let result = partition(&peers, "self", 5, now);
        assert_eq!(result.higher_priority, vec!["higher".to_string()]);
        assert_eq!(result.dead, vec!["dead".to_string()]);
        assert!(result.same_priority.is_empty());
    }

    #[tokio::test]
    async fn same_priority_peer_still_pauses() {
        let now = Utc::now();
        let mut peers = HashMap::new();
        peers.insert(
            "rival".to_string(),
            PeerRecord { priority: 0, lifetime: 60, lastseen: now },
        );
        let result = partition(&peers, "self", 0, now);
        assert_eq!(result.same_priority, vec!["rival".to_string()]);
    }

    #[test]
    fn identity_falls_back_to_synthesized_form_when_env_unset() {
        std::env::remove_var("PEERING_TEST_POD_ID");
        let identity = own_identity("PEERING_TEST_POD_ID");
        assert!(identity.contains('@'));
        assert!(identity.contains('/'));
    }

    #[test]
    fn identity_prefers_pod_id_env_var() {
        std::env::set_var("PEERING_TEST_POD_ID_2", "pod-abc");
        assert_eq!(own_identity("PEERING_TEST_POD_ID_2"), "pod-abc");
        std::env::remove_var("PEERING_TEST_POD_ID_2");
    }

    #[test]
    fn peering_resource_descriptor_is_cluster_scoped() {
        assert!(!peering_resource().namespaced);
    }
}
