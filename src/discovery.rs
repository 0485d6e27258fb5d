/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/discovery.rs
*
* Discovery / Insights (C3, spec §4.3). Two long-running tasks — a resource
* observer and a namespace observer — publish a shared [`Insights`]
* snapshot and notify a single condition on every revision. Ambiguity
* resolution (specific selectors matching more than one resource) resolves
* to the core/v1 candidate when present, else drops the match with a
* warning, per spec §3/§4.3 rather than the cruder "always drop ambiguous
* matches" behavior of older reference snapshots.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{info, instrument, warn};

use crate::client::{ApiClient, ApiError, RawEventType};
use crate::model::insights::Insights;
use crate::model::namespace::NamespacePattern;
use crate::model::resource::{resolve_ambiguity, Resource, Selector};
use crate::settings::WatchingSettings;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("forbidden to scan cluster resources: {0}")]
    Forbidden(String),
    #[error("api error during discovery: {0}")]
    Api(String),
}

/// The mutable holder for the shared insights snapshot: a single
/// reader-writer lock guarding the data plus a `Notify` that fires on every
/// revision. Only the discovery tasks in this module write to it; everyone
/// else only reads.
pub struct InsightsHolder {
    state: RwLock<Insights>,
    revised: Arc<Notify>,
}

impl InsightsHolder {
    pub fn new() -> Arc<Self> {
        Arc::new(InsightsHolder {
            state: RwLock::new(Insights::default()),
            revised: Arc::new(Notify::new()),
        })
    }

    pub fn revised_signal(&self) -> Arc<Notify> {
        self.revised.clone()
    }

    pub async fn snapshot(&self) -> Insights {
        self.state.read().await.clone()
    }

    pub async fn wait_for_revision(&self) -> Insights {
        let notified = self.revised.notified();
        notified.await;
        self.snapshot().await
    }

    async fn mutate(&self, f: impl FnOnce(&mut Insights)) {
        {
            let mut guard = self.state.write().await;
            f(&mut guard);
        }
        self.revised.notify_waiters();
    }
}

/// Scans the live API surface. In a full deployment this issues `GET /api`
/// and `GET /apis` against the cluster; the trait seam lets discovery be
/// unit-tested against a fixed resource catalogue without a live server.
#[async_trait::async_trait]
pub trait ResourceCatalogSource: Send + Sync {
    async fn scan_group(&self, group: Option<&str>) -> Result<Vec<Resource>, DiscoveryError>;

    /// Concurrently enumerates every group via `GET /apis` and scans each
    /// one, plus the core group (§4.3 step 1: "no registered selector ->
    /// scan all groups" rather than just the core group).
    async fn scan_all_groups(&self) -> Result<Vec<Resource>, DiscoveryError>;
}

/// The live [`ResourceCatalogSource`]: `GET /api/v1` for the core group,
/// `GET /apis/{group}` (to find the preferred version) then
/// `GET /apis/{group}/{version}` for everything else.
pub struct ApiDiscoverySource {
    client: Arc<ApiClient>,
}

impl ApiDiscoverySource {
    pub fn new(client: Arc<ApiClient>) -> Arc<Self> {
        Arc::new(ApiDiscoverySource { client })
    }

    async fn scan_core(&self) -> Result<Vec<Resource>, DiscoveryError> {
        let body = self.client.get_raw("/api/v1").await.map_err(map_discovery_err)?;
        Ok(parse_resource_list("", "v1", &body))
    }

    async fn scan_named_group(&self, group: &str) -> Result<Vec<Resource>, DiscoveryError> {
        let group_doc = self.client.get_raw(&format!("/apis/{group}")).await.map_err(map_discovery_err)?;
        let version = group_doc
            .pointer("/preferredVersion/version")
            .and_then(Value::as_str)
            .or_else(|| group_doc.pointer("/versions/0/version").and_then(Value::as_str))
            .ok_or_else(|| DiscoveryError::Api(format!("group {group} advertises no versions")))?
            .to_string();
        let body = self
            .client
            .get_raw(&format!("/apis/{group}/{version}"))
            .await
            .map_err(map_discovery_err)?;
        Ok(parse_resource_list(group, &version, &body))
    }

    /// Lists every group name the cluster advertises via the `APIGroupList`
    /// document at `GET /apis`.
    async fn list_group_names(&self) -> Result<Vec<String>, DiscoveryError> {
        let body = self.client.get_raw("/apis").await.map_err(map_discovery_err)?;
        let names = body
            .get("groups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

#[async_trait::async_trait]
impl ResourceCatalogSource for ApiDiscoverySource {
    async fn scan_group(&self, group: Option<&str>) -> Result<Vec<Resource>, DiscoveryError> {
        match group {
            None => self.scan_core().await,
            Some(g) => self.scan_named_group(g).await,
        }
    }

    async fn scan_all_groups(&self) -> Result<Vec<Resource>, DiscoveryError> {
        let group_names = self.list_group_names().await?;
        let core_future = self.scan_core();
        let group_futures = group_names.iter().map(|g| self.scan_named_group(g));
        let (core_result, group_results) = futures::future::join(core_future, futures::future::join_all(group_futures)).await;
        let mut all = core_result?;
        for result in group_results {
            match result {
                Ok(resources) => all.extend(resources),
                Err(DiscoveryError::Forbidden(msg)) => {
                    warn!(error = %msg, "forbidden scanning one API group, skipping it");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(all)
    }
}

fn map_discovery_err(err: ApiError) -> DiscoveryError {
    match err {
        ApiError::Forbidden { message } => DiscoveryError::Forbidden(message),
        other => DiscoveryError::Api(other.to_string()),
    }
}

/// Parses one `APIResourceList` document into [`Resource`]s, folding
/// subresource entries (`"pods/status"`) into their owner's `subresources`
/// rather than producing a resource of their own.
fn parse_resource_list(group: &str, version: &str, body: &Value) -> Vec<Resource> {
    let Some(items) = body.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| {
            !item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .contains('/')
        })
        .map(|item| {
            let plural = item.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let singular = item
                .get("singularName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| plural.trim_end_matches('s').to_string());
            let kind = item.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
            let string_list = |key: &str| -> Vec<String> {
                item.get(key)
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default()
            };
            let subresources = items
                .iter()
                .filter_map(|sub| sub.get("name").and_then(Value::as_str))
                .filter(|name| name.starts_with(&format!("{plural}/")))
                .map(|name| name.rsplit('/').next().unwrap_or_default().to_string())
                .collect();
            Resource {
                group: group.to_string(),
                version: version.to_string(),
                plural,
                singular,
                kind,
                short_names: string_list("shortNames"),
                categories: string_list("categories"),
                subresources,
                verbs: string_list("verbs"),
                namespaced: item.get("namespaced").and_then(Value::as_bool).unwrap_or(false),
                preferred: true,
            }
        })
        .collect()
}

/// Runs the initial resource scan and publishes it into `insights`,
/// filtered to the groups referenced by `selectors` (or everything when
/// `selectors` is empty — §4.3 "filtered by the groups that appear in any
/// registered selector (or all groups when None)").
#[instrument(skip_all)]
pub async fn run_resource_observer(
    insights: Arc<InsightsHolder>,
    source: Arc<dyn ResourceCatalogSource>,
    selectors: Vec<Selector>,
    scanning_disabled: bool,
    needs_patch: Arc<dyn Fn(&Resource) -> bool + Send + Sync>,
) -> Result<(), DiscoveryError> {
    if scanning_disabled {
        insights.mutate(|i| i.ready_resources = true).await;
        return Ok(());
    }
    let mut all = BTreeSet::new();
    if selectors.is_empty() {
        match source.scan_all_groups().await {
            Ok(resources) => all.extend(resources),
            Err(DiscoveryError::Forbidden(msg)) => {
                warn!(error = %msg, "forbidden scanning resources, degrading to static namespace list");
                insights.mutate(|i| i.ready_resources = true).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    } else {
        let mut gs: BTreeSet<Option<String>> = selectors.iter().map(|s| s.group.clone()).collect();
        gs.insert(None);
        for group in &gs {
            match source.scan_group(group.as_deref()).await {
                Ok(resources) => all.extend(resources),
                Err(DiscoveryError::Forbidden(msg)) => {
                    warn!(error = %msg, "forbidden scanning resources, degrading to static namespace list");
                    insights.mutate(|i| i.ready_resources = true).await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
    let filtered = filter_and_resolve(&all, &selectors, needs_patch.as_ref());
    insights
        .mutate(|i| {
            let indexable: BTreeSet<Resource> = filtered
                .iter()
                .filter(|r| r.supports_watch_and_list())
                .cloned()
                .collect();
            i.resources = filtered;
            i.indexable = indexable;
            i.ready_resources = true;
        })
        .await;
    Ok(())
}

/// Whether `resource` should survive filtering: it must support list+watch,
/// and if some registered handler needs to patch it, it must support patch
/// too (§4.3 ambiguity resolution: "non-patchable resources are dropped only
/// when at least one registered handler needs patching").
fn passes_capability_check(resource: &Resource, needs_patch: &(dyn Fn(&Resource) -> bool + Send + Sync)) -> bool {
    resource.supports_watch_and_list() && (resource.supports_patch() || !needs_patch(resource))
}

fn filter_and_resolve(
    all: &BTreeSet<Resource>,
    selectors: &[Selector],
    needs_patch: &(dyn Fn(&Resource) -> bool + Send + Sync),
) -> BTreeSet<Resource> {
    if selectors.is_empty() {
        return all.iter().filter(|r| passes_capability_check(r, needs_patch)).cloned().collect();
    }
    let mut out = BTreeSet::new();
    for selector in selectors {
        let matches: BTreeSet<Resource> = all.iter().filter(|r| selector.matches(r)).cloned().collect();
        if selector.is_specific() && matches.len() > 1 {
            match resolve_ambiguity(&matches) {
                Some(resolved) => {
                    out.insert(resolved);
                }
                None => {
                    warn!(?selector, "ambiguous selector with no core/v1 candidate, dropping");
                }
            }
            continue;
        }
        for candidate in matches {
            if !passes_capability_check(&candidate, needs_patch) {
                warn!(resource = %candidate, "resource lacks required list/watch/patch verbs, dropping");
                continue;
            }
            out.insert(candidate);
        }
    }
    out
}

/// Rescans a single group and replaces only that group's slice of
/// `insights.resources`, leaving every other group untouched (§4.3: "atomically
/// replace that group's slice... all other groups untouched").
#[instrument(skip_all, fields(group))]
pub async fn rescan_group(
    insights: Arc<InsightsHolder>,
    source: Arc<dyn ResourceCatalogSource>,
    group: &str,
    selectors: &[Selector],
    needs_patch: &(dyn Fn(&Resource) -> bool + Send + Sync),
) -> Result<(), DiscoveryError> {
    let fresh = source.scan_group(Some(group)).await?;
    let fresh_set: BTreeSet<Resource> = fresh.into_iter().collect();
    let filtered = filter_and_resolve(&fresh_set, selectors, needs_patch);
    insights
        .mutate(|i| {
            i.resources.retain(|r| r.group != group);
            i.resources.extend(filtered.iter().cloned());
            i.indexable.retain(|r| r.group != group);
            i.indexable
                .extend(filtered.iter().filter(|r| r.supports_watch_and_list()).cloned());
        })
        .await;
    Ok(())
}

/// Runs the initial namespace scan and publishes it.
#[instrument(skip_all)]
pub async fn seed_namespaces(insights: Arc<InsightsHolder>, all_namespace_names: Vec<String>, pattern: &NamespacePattern) {
    let matched: BTreeSet<Option<String>> = all_namespace_names
        .into_iter()
        .filter(|n| pattern.matches(n))
        .map(Some)
        .collect();
    insights
        .mutate(|i| {
            i.namespaces = matched;
            i.ready_namespaces = true;
        })
        .await;
}

/// Applies one namespace watch event (§4.3): removed on delete/deletionTimestamp,
/// added when its name matches the configured pattern.
pub async fn apply_namespace_event(insights: Arc<InsightsHolder>, name: &str, deleted: bool, pattern: &NamespacePattern) {
    insights
        .mutate(|i| {
            if deleted {
                i.namespaces.remove(&Some(name.to_string()));
            } else if pattern.matches(name) {
                i.namespaces.insert(Some(name.to_string()));
            } else {
                i.namespaces.remove(&Some(name.to_string()));
            }
        })
        .await;
}

/// Degraded mode when discovery is forbidden or disabled: the exact
/// namespace names named by the pattern become the namespace set, and no
/// watch is attempted (§4.3).
pub async fn seed_namespaces_degraded(insights: Arc<InsightsHolder>, pattern: &NamespacePattern) {
    let literal: BTreeSet<Option<String>> = pattern.literal_names().into_iter().map(Some).collect();
    insights
        .mutate(|i| {
            i.namespaces = literal;
            i.ready_namespaces = true;
        })
        .await;
}

fn crd_resource() -> Resource {
    Resource {
        group: "apiextensions.k8s.io".into(),
        version: "v1".into(),
        plural: "customresourcedefinitions".into(),
        singular: "customresourcedefinition".into(),
        kind: "CustomResourceDefinition".into(),
        short_names: vec!["crd".into(), "crds".into()],
        categories: vec![],
        subresources: vec!["status".into()],
        verbs: vec!["list".into(), "watch".into()],
        namespaced: false,
        preferred: true,
    }
}

/// Runs forever, rescanning a single affected group whenever its
/// `CustomResourceDefinition` changes (§4.3), rather than rebuilding the
/// whole resource catalogue on every CRD edit. The initial `LISTED`
/// bookmark itself is not a rescan trigger: [`run_resource_observer`]
/// already did that full scan.
#[instrument(skip_all)]
pub async fn run_crd_observer(
    client: Arc<ApiClient>,
    insights: Arc<InsightsHolder>,
    source: Arc<dyn ResourceCatalogSource>,
    selectors: Vec<Selector>,
    settings: WatchingSettings,
    needs_patch: Arc<dyn Fn(&Resource) -> bool + Send + Sync>,
) {
    let resource = crd_resource();
    loop {
        let listing = match client.list(&resource, None).await {
            Ok(listing) => listing,
            Err(ApiError::Forbidden { .. }) => {
                // No permission to watch CRDs at all: the initial resource
                // scan already ran once and will simply never be refreshed.
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to list CustomResourceDefinitions, retrying");
                tokio::time::sleep(settings.reconnect_backoff).await;
                continue;
            }
        };
        let mut resource_version = listing.resource_version;
        'watching: loop {
            let stream = match client.watch(&resource, None, &resource_version).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "failed to open CRD watch, backing off");
                    tokio::time::sleep(settings.reconnect_backoff).await;
                    continue 'watching;
                }
            };
            futures::pin_mut!(stream);
            loop {
                match stream.next().await {
                    Some(Ok(event)) => match event.event_type {
                        RawEventType::Error => {
                            if event.object.get("code").and_then(Value::as_u64) == Some(410) {
                                info!("CRD resume token expired (410 Gone), relisting");
                                break 'watching;
                            }
                            warn!("CRD watch stream error, relisting");
                            break 'watching;
                        }
                        RawEventType::Synthetic => unreachable!("synthetic events never arrive over the wire"),
                        RawEventType::Added | RawEventType::Modified | RawEventType::Deleted => {
                            if let Some(rv) = event
                                .object
                                .pointer("/metadata/resourceVersion")
                                .and_then(Value::as_str)
                            {
                                resource_version = rv.to_string();
                            }
                            if let Some(group) = event.object.pointer("/spec/group").and_then(Value::as_str) {
                                if let Err(err) =
                                    rescan_group(insights.clone(), source.clone(), group, &selectors, needs_patch.as_ref()).await
                                {
                                    warn!(error = %err, group, "failed to rescan group after CRD change");
                                }
                            }
                        }
                    },
                    Some(Err(err)) => {
                        warn!(error = %err, "CRD watch read error, reconnecting with same resource version");
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                    None => {
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                }
            }
        }
    }
}

fn namespace_resource() -> Resource {
    Resource {
        group: "".into(),
        version: "v1".into(),
        plural: "namespaces".into(),
        singular: "namespace".into(),
        kind: "Namespace".into(),
        short_names: vec!["ns".into()],
        categories: vec![],
        subresources: vec!["status".into(), "finalize".into()],
        verbs: vec!["list".into(), "watch".into()],
        namespaced: false,
        preferred: true,
    }
}

/// Runs forever, keeping `insights.namespaces` in sync with the cluster's
/// `Namespace` objects (§4.3). Lists once to seed, then watches; a `403`
/// on the initial list degrades to the static pattern-literal set rather
/// than failing the whole reactor, same as [`run_resource_observer`]'s
/// degraded path.
#[instrument(skip_all)]
pub async fn run_namespace_observer(
    client: Arc<ApiClient>,
    insights: Arc<InsightsHolder>,
    pattern: NamespacePattern,
    settings: WatchingSettings,
) {
    let resource = namespace_resource();
    loop {
        let listing = match client.list(&resource, None).await {
            Ok(listing) => listing,
            Err(ApiError::Forbidden { message }) => {
                warn!(error = %message, "forbidden to watch namespaces, degrading to static pattern list");
                seed_namespaces_degraded(insights.clone(), &pattern).await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to list namespaces, retrying");
                tokio::time::sleep(settings.reconnect_backoff).await;
                continue;
            }
        };
        let names: Vec<String> = listing
            .items
            .iter()
            .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str).map(str::to_string))
            .collect();
        seed_namespaces(insights.clone(), names, &pattern).await;

        let mut resource_version = listing.resource_version;
        'watching: loop {
            let stream = match client.watch(&resource, None, &resource_version).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "failed to open namespace watch, backing off");
                    tokio::time::sleep(settings.reconnect_backoff).await;
                    continue 'watching;
                }
            };
            futures::pin_mut!(stream);
            loop {
                match stream.next().await {
                    Some(Ok(event)) => match event.event_type {
                        RawEventType::Error => {
                            if event.object.get("code").and_then(Value::as_u64) == Some(410) {
                                info!("namespace resume token expired (410 Gone), relisting");
                                break 'watching;
                            }
                            warn!(
                                message = event.object.get("message").and_then(Value::as_str).unwrap_or(""),
                                "namespace watch stream error, relisting"
                            );
                            break 'watching;
                        }
                        RawEventType::Synthetic => unreachable!("synthetic events never arrive over the wire"),
                        RawEventType::Added | RawEventType::Modified | RawEventType::Deleted => {
                            if let Some(rv) = event
                                .object
                                .pointer("/metadata/resourceVersion")
                                .and_then(Value::as_str)
                            {
                                resource_version = rv.to_string();
                            }
                            if let Some(name) = event.object.pointer("/metadata/name").and_then(Value::as_str) {
                                let deleted = matches!(event.event_type, RawEventType::Deleted)
                                    || event.object.pointer("/metadata/deletionTimestamp").is_some();
                                apply_namespace_event(insights.clone(), name, deleted, &pattern).await;
                            }
                        }
                    },
                    Some(Err(err)) => {
                        warn!(error = %err, "namespace watch read error, reconnecting with same resource version");
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                    None => {
                        tokio::time::sleep(settings.reconnect_backoff).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resource::SelectorKind;

    fn resource(group: &str, kind: &str) -> Resource {
        Resource {
            group: group.into(),
            version: "v1".into(),
            plural: format!("{}s", kind.to_lowercase()),
            singular: kind.to_lowercase(),
            kind: kind.into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into()],
            namespaced: true,
            preferred: true,
        }
    }

    #[tokio::test]
    async fn insights_holder_notifies_on_mutation() {
        let holder = InsightsHolder::new();
        let holder2 = holder.clone();
        let handle = tokio::spawn(async move { holder2.wait_for_revision().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        holder.mutate(|i| i.ready_resources = true).await;
        let snapshot = tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.ready_resources);
    }

    #[test]
    fn filter_and_resolve_prefers_core_on_ambiguity() {
        let mut all = BTreeSet::new();
        all.insert(resource("", "Pod"));
        all.insert(resource("metrics.k8s.io", "Pod"));
        let selectors = vec![Selector {
            group: None,
            version: None,
            kind: SelectorKind::Kind("Pod".into()),
        }];
        let resolved = filter_and_resolve(&all, &selectors, &|_| false);
        assert_eq!(resolved.len(), 1);
        assert!(resolved.iter().next().unwrap().is_core());
    }

    #[test]
    fn filter_and_resolve_drops_non_watchable() {
        let mut all = BTreeSet::new();
        let mut no_watch = resource("example.com", "Frozen");
        no_watch.verbs = vec!["get".into()];
        all.insert(no_watch);
        let resolved = filter_and_resolve(&all, &[], &|_| false);
        assert!(resolved.is_empty());
    }

    #[test]
    fn filter_and_resolve_drops_non_patchable_only_when_needed() {
        let mut all = BTreeSet::new();
        let mut no_patch = resource("example.com", "Frozen");
        no_patch.verbs = vec!["list".into(), "watch".into()];
        all.insert(no_patch.clone());

        let kept = filter_and_resolve(&all, &[], &|_| false);
        assert_eq!(kept.len(), 1);

        let dropped = filter_and_resolve(&all, &[], &|_| true);
        assert!(dropped.is_empty());
    }

    #[test]
    fn parse_resource_list_folds_subresources_into_owner() {
        let body = serde_json::json!({
            "resources": [
                {"name": "pods", "singularName": "pod", "kind": "Pod", "namespaced": true, "verbs": ["list", "watch"]},
                {"name": "pods/status", "kind": "Pod", "namespaced": true, "verbs": ["get", "patch"]},
            ]
        });
        let parsed = parse_resource_list("", "v1", &body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].subresources, vec!["status".to_string()]);
    }

    #[test]
    fn parse_resource_list_defaults_singular_from_plural() {
        let body = serde_json::json!({
            "resources": [
                {"name": "widgets", "kind": "Widget", "namespaced": true, "verbs": ["list", "watch"]},
            ]
        });
        let parsed = parse_resource_list("example.com", "v1", &body);
        assert_eq!(parsed[0].singular, "widget");
    }
}
