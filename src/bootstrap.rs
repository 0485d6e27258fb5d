/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/bootstrap.rs
*
* The composition root (C13, spec §1A, §4.9). Builds every shared resource
* (vault, API client, insights holder), spawns the discovery, orchestrator,
* metrics, and optional admission tasks, and waits on whichever one exits
* first — matching the embedding operator's own `main.rs` `tokio::join!`
* shape, except that here any single task finishing (normally or not) is
* itself the fatal condition: besides the one-shot initial resource scan,
* every task this function spawns is meant to run for the lifetime of the
* process.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinError;
use tracing::{error, info};

use crate::admission::{self, AdmissionRegistry};
use crate::client::ApiClient;
use crate::discovery::{self, ApiDiscoverySource, InsightsHolder, ResourceCatalogSource};
use crate::errors::ReactorError;
use crate::kubeconfig;
use crate::model::namespace::NamespacePattern;
use crate::model::resource::Selector;
use crate::orchestration::Orchestrator;
use crate::runner::{HandlerRegistry, LifecycleStrategy};
use crate::settings::Settings;
use crate::telemetry;
use crate::vault::Vault;

/// Everything an embedding binary supplies about *what* to watch and *how*
/// to expose itself, as opposed to `Settings` (the tuning knobs) and
/// `HandlerRegistry` (the handler bindings themselves).
pub struct ReactorClient {
    /// Restricts discovery to these selectors' groups (empty means "every
    /// group", spec §4.3).
    pub selectors: Vec<Selector>,
    pub namespaces: NamespacePattern,
    pub lifecycle: Arc<dyn LifecycleStrategy>,
    /// When set, the admission webhook server (C10) runs alongside the
    /// reactor's core loop.
    pub admission: Option<Arc<AdmissionRegistry>>,
    pub metrics_addr: SocketAddr,
}

fn exit_error(name: &'static str, result: Result<(), JoinError>) -> ReactorError {
    match result {
        Ok(()) => ReactorError::Discovery(format!("{name} task exited unexpectedly")),
        Err(join_err) => ReactorError::TaskJoin(join_err),
    }
}

/// Runs the reactor until a fatal error occurs, matching every module named
/// in the functional sections and layering the ambient engineering stack
/// (logging, metrics) around it.
pub async fn run(settings: Settings, registry: Arc<HandlerRegistry>, client: ReactorClient) -> Result<(), ReactorError> {
    if let Err(err) = telemetry::init_logging(&settings.logging) {
        // A subscriber may already be installed by an embedding test harness;
        // this is not fatal to the reactor itself.
        eprintln!("logging already initialized: {err}");
    }

    let metrics_registry =
        Arc::new(telemetry::create_and_register_metrics().expect("the reactor's fixed metric set registers without name collisions"));

    let vault = Vault::new();
    kubeconfig::populate_vault_from_environment(&vault)
        .await
        .map_err(|err| ReactorError::Discovery(err.to_string()))?;

    let api_client = Arc::new(ApiClient::new(vault.clone(), settings.watching.clone()));
    let insights = InsightsHolder::new();
    let discovery_source: Arc<dyn ResourceCatalogSource> = ApiDiscoverySource::new(api_client.clone());

    let patch_registry = registry.clone();
    let needs_patch: Arc<dyn Fn(&crate::model::resource::Resource) -> bool + Send + Sync> =
        Arc::new(move |resource| patch_registry.has_handlers(resource));

    let resource_observer = tokio::spawn(discovery::run_resource_observer(
        insights.clone(),
        discovery_source.clone(),
        client.selectors.clone(),
        settings.scanning.disabled,
        needs_patch.clone(),
    ));
    let namespace_observer = tokio::spawn(discovery::run_namespace_observer(
        api_client.clone(),
        insights.clone(),
        client.namespaces.clone(),
        settings.watching.clone(),
    ));
    let crd_observer = tokio::spawn(discovery::run_crd_observer(
        api_client.clone(),
        insights.clone(),
        discovery_source.clone(),
        client.selectors.clone(),
        settings.watching.clone(),
        needs_patch.clone(),
    ));

    let mut orchestrator = Orchestrator::new(insights.clone(), api_client.clone(), settings.clone(), registry, client.lifecycle.clone());
    let readiness = orchestrator.readiness_blocker();
    let orchestrator_handle = tokio::spawn(async move {
        orchestrator.run().await;
    });

    let metrics_handle = tokio::spawn(telemetry::run_metrics_server(metrics_registry, client.metrics_addr));

    let mut admission_handle = if let Some(admission_registry) = client.admission {
        let admission_settings = settings.admission.clone();
        let admission_insights = insights.clone();
        let tunnel_kind = admission_settings.tunnel;
        let ngrok_authtoken = admission_settings.ngrok_authtoken.clone();
        let tunnel_client = api_client.clone();
        Some(tokio::spawn(async move {
            // The webhook server waits for readiness before accepting
            // traffic (§4.9): otherwise a mutating webhook could run before
            // the resource catalogue it depends on has finished indexing.
            readiness.wait_for(false).await;
            let tunnel = crate::tunnel::resolve_tunnel(tunnel_kind, ngrok_authtoken, &tunnel_client).await;
            admission::run_admission_server(admission_settings, admission_registry, admission_insights, tunnel).await
        }))
    } else {
        None
    };

    info!("reactor started");

    let outcome = tokio::select! {
        res = resource_observer => match res {
            Ok(Ok(())) => Err(ReactorError::Discovery("initial resource scan exited before the orchestrator could use it".to_string())),
            Ok(Err(err)) => Err(ReactorError::Discovery(err.to_string())),
            Err(join_err) => Err(ReactorError::TaskJoin(join_err)),
        },
        res = namespace_observer => Err(exit_error("namespace observer", res)),
        res = crd_observer => Err(exit_error("CRD observer", res)),
        res = orchestrator_handle => Err(exit_error("orchestrator", res)),
        res = metrics_handle => Err(exit_error("metrics server", res)),
        res = admission_join(admission_handle.as_mut()) => res,
    };

    if let Err(err) = &outcome {
        error!(error = %err, "reactor shutting down after fatal error");
    }
    vault.close().await;
    outcome
}

/// Awaits the admission server task if one was spawned, or never resolves
/// otherwise — letting `tokio::select!` treat "no admission server
/// configured" the same as "still running".
async fn admission_join(handle: Option<&mut tokio::task::JoinHandle<Result<(), crate::admission::AdmissionError>>>) -> Result<(), ReactorError> {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(())) => Err(ReactorError::Admission("admission server exited unexpectedly".to_string())),
            Ok(Err(err)) => Err(ReactorError::Admission(err.to_string())),
            Err(join_err) => Err(ReactorError::TaskJoin(join_err)),
        },
        None => std::future::pending().await,
    }
}
