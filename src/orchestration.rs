/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/orchestration.rs
*
* The orchestrator (C9, spec §4.9): the single loop that reconciles the
* running set of watcher/peering tasks against the current insights
* snapshot on every revision. Terminates tasks for keys no longer required,
* then spawns peering tasks, then watcher tasks, matching the ordering the
* reference design calls out explicitly (terminate before spawn, peerings
* before watchers) to avoid a flash of "everything paused" during topology
* changes.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::client::ApiClient;
use crate::discovery::InsightsHolder;
use crate::model::insights::NamespaceSlot;
use crate::model::resource::Resource;
use crate::peering;
use crate::primitives::{Toggle, ToggleSet, ToggleSetMode};
use crate::queueing::run_multiplexer;
use crate::runner::{HandlerRegistry, HandlerRunner, LifecycleStrategy};
use crate::settings::Settings;
use crate::watching::spawn_watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchKey(Resource, NamespaceSlot);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PeeringKey(NamespaceSlot);

struct WatchTask {
    handle: JoinHandle<()>,
    indexed_toggle: Option<Arc<Toggle>>,
}

struct PeeringTask {
    keepalive: JoinHandle<()>,
    processor: JoinHandle<()>,
    conflict_toggle: Arc<Toggle>,
}

/// Owns the live task set and the two cross-cutting toggle sets: `pause`
/// (ANY — on while any peering conflict or "peering missing" condition is
/// active) and `indexing_blocked` (ANY — on while any indexable resource's
/// initial listing hasn't completed yet).
pub struct Orchestrator {
    insights: Arc<InsightsHolder>,
    client: Arc<ApiClient>,
    settings: Settings,
    registry: Arc<HandlerRegistry>,
    lifecycle: Arc<dyn LifecycleStrategy>,
    pause: Arc<ToggleSet>,
    indexing_blocked: Arc<ToggleSet>,
    peering_resource: Resource,
    watch_tasks: HashMap<WatchKey, WatchTask>,
    peering_tasks: HashMap<PeeringKey, PeeringTask>,
    identity: String,
}

impl Orchestrator {
    pub fn new(
        insights: Arc<InsightsHolder>,
        client: Arc<ApiClient>,
        settings: Settings,
        registry: Arc<HandlerRegistry>,
        lifecycle: Arc<dyn LifecycleStrategy>,
    ) -> Self {
        let identity = peering::own_identity(&settings.process.pod_id_env);
        let peering_resource = Resource {
            group: "zalando.org".into(),
            version: "v1".into(),
            plural: format!("{}s", settings.peering.name.to_lowercase()),
            singular: settings.peering.name.to_lowercase(),
            kind: "KopfPeering".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into(), "patch".into()],
            namespaced: settings.peering.namespaced && !settings.peering.clusterwide,
            preferred: true,
        };
        Orchestrator {
            insights,
            client,
            settings,
            registry,
            lifecycle,
            pause: ToggleSet::new(ToggleSetMode::Any),
            indexing_blocked: ToggleSet::new(ToggleSetMode::Any),
            peering_resource,
            watch_tasks: HashMap::new(),
            peering_tasks: HashMap::new(),
            identity,
        }
    }

    pub fn pause_set(&self) -> Arc<ToggleSet> {
        self.pause.clone()
    }

    pub fn readiness_blocker(&self) -> Arc<ToggleSet> {
        self.indexing_blocked.clone()
    }

    fn required_peering_keys(&self, namespaces: &std::collections::BTreeSet<NamespaceSlot>) -> Vec<PeeringKey> {
        if self.settings.peering.standalone {
            return Vec::new();
        }
        if self.settings.peering.clusterwide || !self.settings.peering.namespaced {
            return vec![PeeringKey(None)];
        }
        namespaces.iter().cloned().map(PeeringKey).collect()
    }

    /// Runs forever, reconciling on every insights revision.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        loop {
            let insights = self.insights.wait_for_revision().await;
            if !insights.is_ready() {
                continue;
            }
            self.reconcile(&insights).await;
        }
    }

    #[instrument(skip_all)]
    async fn reconcile(&mut self, insights: &crate::model::insights::Insights) {
        let required_watches: std::collections::HashSet<WatchKey> = insights
            .required_watch_keys()
            .into_iter()
            .map(|(r, ns)| WatchKey(r, ns))
            .collect();
        let required_peerings: std::collections::HashSet<PeeringKey> =
            self.required_peering_keys(&insights.namespaces).into_iter().collect();

        self.terminate_redundant_watches(&required_watches).await;
        self.terminate_redundant_peerings(&required_peerings).await;
        self.spawn_missing_peerings(&required_peerings).await;

        // Blocks readiness for the duration of the spawn pass so a topology
        // change doesn't flash "ready" between terminating old watchers and
        // the new ones picking up their initial listing (§4.9 step 4).
        let orchestration_blocker = self.indexing_blocked.make_toggle(true, Some("orchestration-blocker".into())).await;
        self.spawn_missing_watches(&required_watches, insights).await;
        self.indexing_blocked.drop_toggle(&orchestration_blocker).await;
    }

    async fn terminate_redundant_watches(&mut self, required: &std::collections::HashSet<WatchKey>) {
        let stale: Vec<WatchKey> = self.watch_tasks.keys().filter(|k| !required.contains(k)).cloned().collect();
        for key in stale {
            if let Some(task) = self.watch_tasks.remove(&key) {
                task.handle.abort();
                if let Some(toggle) = task.indexed_toggle {
                    self.indexing_blocked.drop_toggle(&toggle).await;
                }
                info!(resource = %key.0, namespace = ?key.1, "terminated watcher no longer required");
            }
        }
    }

    async fn terminate_redundant_peerings(&mut self, required: &std::collections::HashSet<PeeringKey>) {
        let stale: Vec<PeeringKey> = self.peering_tasks.keys().filter(|k| !required.contains(k)).cloned().collect();
        for key in stale {
            if let Some(task) = self.peering_tasks.remove(&key) {
                task.keepalive.abort();
                task.processor.abort();
                self.pause.drop_toggle(&task.conflict_toggle).await;
                info!(namespace = ?key.0, "terminated peering task no longer required");
            }
        }
    }

    async fn spawn_missing_peerings(&mut self, required: &std::collections::HashSet<PeeringKey>) {
        for key in required {
            if self.peering_tasks.contains_key(key) {
                continue;
            }
            let conflict_toggle = self
                .pause
                .make_toggle(self.settings.peering.mandatory, Some(format!("peering-conflict-{:?}", key.0)))
                .await;
            let namespace = key.0.clone();

            let keepalive = tokio::spawn(peering::run_keepalive(
                self.client.clone(),
                self.peering_resource.clone(),
                namespace.clone(),
                self.identity.clone(),
                self.settings.peering.clone(),
            ));

            let processor = self.spawn_peering_processor(namespace.clone(), conflict_toggle.clone());

            self.peering_tasks.insert(key.clone(), PeeringTask { keepalive, processor, conflict_toggle });
            info!(namespace = ?key.0, "spawned peering task");
        }
    }

    fn spawn_peering_processor(&self, namespace: NamespaceSlot, conflict_toggle: Arc<Toggle>) -> JoinHandle<()> {
        let client = self.client.clone();
        let resource = self.peering_resource.clone();
        let identity = self.identity.clone();
        let priority = self.settings.peering.priority;
        let pause_set = self.pause.clone();
        let watching_settings = self.settings.watching.clone();
        let never_paused = ToggleSet::new(ToggleSetMode::Any);
        tokio::spawn(async move {
            let (handle, mut rx) = spawn_watch(client.clone(), resource.clone(), namespace.clone(), never_paused, watching_settings);
            while let Some(message) = rx.recv().await {
                if let crate::watching::WatchMessage::Event(event) = message {
                    peering::apply_peering_snapshot(
                        &client,
                        &resource,
                        namespace.as_deref(),
                        &event.object,
                        &identity,
                        priority,
                        true,
                        &conflict_toggle,
                    )
                    .await;
                    pause_set.refresh().await;
                }
            }
            handle.abort();
        })
    }

    async fn spawn_missing_watches(&mut self, required: &std::collections::HashSet<WatchKey>, insights: &crate::model::insights::Insights) {
        for key in required {
            if self.watch_tasks.contains_key(key) {
                continue;
            }
            let WatchKey(resource, namespace) = key.clone();
            let indexable = insights.indexable.contains(&resource);
            let indexed_toggle = if indexable {
                Some(self.indexing_blocked.make_toggle(true, Some(format!("indexing-{resource}"))).await)
            } else {
                None
            };

            let handlers = self.registry.handlers_for(&resource);
            let runner: Arc<dyn crate::queueing::EventProcessor> =
                Arc::new(HandlerRunner::new(handlers, self.lifecycle.clone(), self.client.clone()));

            let (watch_handle, rx) = spawn_watch(
                self.client.clone(),
                resource.clone(),
                namespace.clone(),
                self.pause.clone(),
                self.settings.watching.clone(),
            );
            let mux_handle = tokio::spawn(run_multiplexer(
                rx,
                resource.clone(),
                namespace.clone(),
                runner,
                indexable,
                indexed_toggle.clone(),
                self.indexing_blocked.clone(),
                self.settings.batching.clone(),
            ));
            let combined = tokio::spawn(async move {
                let _ = mux_handle.await;
                watch_handle.abort();
            });

            self.watch_tasks.insert(key.clone(), WatchTask { handle: combined, indexed_toggle });
            info!(resource = %resource, namespace = ?namespace, "spawned watcher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peering_key_hashes_by_namespace() {
        let a = PeeringKey(Some("x".to_string()));
        let b = PeeringKey(Some("x".to_string()));
        assert_eq!(a, b);
    }
}
