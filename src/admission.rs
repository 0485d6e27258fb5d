/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/admission.rs
*
* The admission webhook server (C10, spec §4.10). A `warp` HTTPS endpoint
* that decodes `admission.k8s.io/v1` (and v1beta1) AdmissionReview bodies,
* dispatches to the validating/mutating handlers registered against the
* reviewed resource, and assembles the response. Handlers here reuse the
* same [`crate::runner::Handler`] trait reconciliation cycles run, but the
* lifecycle is always all-at-once and nothing is ever written back to
* `status.kopf.progress`: the outcome lives entirely in the one HTTP
* response, matching the embedding operator's existing webhook server in
* controllers/autoheal_controller.rs (warp route plus a shared, `Arc`-held
* context) generalized to TLS and to the AdmissionReview wire shape instead
* of a bespoke Alertmanager payload. Optionally published through one of
* `crate::tunnel`'s `WebhookTunnel` implementations instead of bound
* straight to a routable address.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};
use warp::Filter;

use crate::model::diff::diff;
use crate::model::insights::Insights;
use crate::model::patch::Patch;
use crate::model::resource::{Resource, Selector};
use crate::runner::{filter_passes, Cause, Handler, HandlerError};
use crate::settings::AdmissionSettings;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to generate a self-signed certificate: {0}")]
    CertGeneration(String),
    #[error("failed to read caller-provided TLS material: {0}")]
    TlsMaterial(String),
    #[error("no usable bind address could be determined")]
    NoBindAddress,
    #[error("failed to publish the webhook endpoint through a tunnel: {0}")]
    Tunnel(String),
}

/// Which kind of review a registration answers: validating handlers can
/// only refuse, mutating handlers may also write into the patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    Validating,
    Mutating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    fn parse(raw: &str) -> Option<Operation> {
        match raw {
            "CREATE" => Some(Operation::Create),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            "CONNECT" => Some(Operation::Connect),
            _ => None,
        }
    }
}

/// One admission handler registration: a resource selector, an optional
/// restriction to specific operations (empty = any), and an id/reason hint
/// used to disambiguate overlapping registrations (spec §4.10).
pub struct AdmissionRegistration {
    pub selector: Selector,
    pub kind: AdmissionKind,
    pub operations: Vec<Operation>,
    pub id: String,
    pub reason: Option<String>,
    pub handler: Arc<dyn Handler>,
}

impl AdmissionRegistration {
    fn applies(&self, resource: &Resource, operation: Operation) -> bool {
        if !self.selector.matches(resource) {
            return false;
        }
        let operation_matches = self.operations.is_empty() || self.operations.contains(&operation);
        if !operation_matches {
            return false;
        }
        // Mutation handlers never fire on DELETE unless they explicitly
        // opted in, even when registered with an otherwise-unrestricted
        // operation list (spec §4.10).
        if self.kind == AdmissionKind::Mutating
            && operation == Operation::Delete
            && !self.operations.contains(&Operation::Delete)
        {
            return false;
        }
        true
    }
}

#[derive(Default)]
pub struct AdmissionRegistry {
    entries: Vec<AdmissionRegistration>,
}

impl AdmissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: AdmissionRegistration) {
        self.entries.push(registration);
    }

    fn handlers_for(
        &self,
        resource: &Resource,
        operation: Operation,
        id_hint: Option<&str>,
        reason_hint: Option<&str>,
    ) -> Vec<&AdmissionRegistration> {
        self.entries
            .iter()
            .filter(|e| e.applies(resource, operation))
            .filter(|e| id_hint.map_or(true, |id| e.id == id))
            .filter(|e| reason_hint.map_or(true, |r| e.reason.as_deref() == Some(r)))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupVersionResource {
    group: String,
    version: String,
    resource: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionRequestBody {
    uid: String,
    resource: GroupVersionResource,
    operation: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    object: Option<Value>,
    #[serde(default)]
    old_object: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReviewRequest {
    api_version: String,
    kind: String,
    request: AdmissionRequestBody,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct AdmissionResponseBody {
    uid: String,
    allowed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "patchType")]
    patch_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
struct AdmissionStatus {
    message: String,
    code: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionReviewResponse {
    api_version: String,
    kind: String,
    response: AdmissionResponseBody,
}

fn reject(api_version: &str, uid: &str, message: &str, code: u16) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: api_version.to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponseBody {
            uid: uid.to_string(),
            allowed: false,
            status: Some(AdmissionStatus { message: message.to_string(), code }),
            ..Default::default()
        },
    }
}

/// Ranks the four admission-relevant error categories for the "most
/// specific wins" tie-break rule (spec §4.10): `AdmissionError > Permanent >
/// Temporary > Exception`. Lower rank wins; equal rank keeps the first one
/// seen.
fn error_rank(err: &HandlerError) -> u8 {
    match err {
        HandlerError::Admission { .. } => 0,
        HandlerError::Permanent(_) => 1,
        HandlerError::Temporary { .. } => 2,
        HandlerError::Other(_) => 3,
    }
}

fn error_status(err: &HandlerError) -> AdmissionStatus {
    match err {
        HandlerError::Admission { message, code } => AdmissionStatus { message: message.clone(), code: *code },
        other => AdmissionStatus { message: other.to_string(), code: 500 },
    }
}

/// Runs every applicable handler against one reviewed object, folding their
/// outcomes into a response. Never touches `status.kopf.progress`: this is
/// the one place `HandlerRunner`'s progress bookkeeping deliberately does
/// not apply (spec §4.7, §4.10).
#[instrument(skip(registry, object, old_object), fields(resource = %resource, operation = ?operation))]
async fn evaluate(
    registry: &AdmissionRegistry,
    resource: &Resource,
    operation: Operation,
    object: &Value,
    old_object: &Value,
) -> (Patch, Vec<String>, Option<HandlerError>) {
    let registrations = registry.handlers_for(resource, operation, None, None);
    let current = if operation == Operation::Delete { old_object } else { object };
    let full_diff = diff(old_object, object);

    let mut combined_patch = Patch::new();
    let mut warnings = Vec::new();
    let mut worst: Option<HandlerError> = None;
    let mut memo = serde_json::Map::new();

    for registration in registrations {
        let filter = registration.handler.filter();
        let scoped_diff = match &filter.field {
            Some(field) => {
                let path: Vec<&str> = field.iter().map(String::as_str).collect();
                full_diff.reduce(&path)
            }
            None => full_diff.clone(),
        };
        if !filter_passes(&filter, current, &full_diff) {
            continue;
        }

        let mut handler_patch = Patch::new();
        let outcome = {
            let mut cause = Cause {
                body: current,
                diff: &scoped_diff,
                memo: &mut memo,
                patch: &mut handler_patch,
                params: &Value::Null,
                warnings: &mut warnings,
            };
            registration.handler.call(&mut cause).await
        };

        match outcome {
            Ok(_) => {
                if registration.kind == AdmissionKind::Mutating {
                    combined_patch.merge(&handler_patch);
                }
            }
            Err(err) => {
                warn!(handler = registration.id, error = %err, "admission handler refused the review");
                let replace = match &worst {
                    None => true,
                    Some(existing) => error_rank(&err) < error_rank(existing),
                };
                if replace {
                    worst = Some(err);
                }
            }
        }
    }

    (combined_patch, warnings, worst)
}

fn lookup_resource(insights: &Insights, gvr: &GroupVersionResource) -> Result<Resource, (u16, String)> {
    let matches: Vec<&Resource> = insights
        .resources
        .iter()
        .filter(|r| r.group == gvr.group && r.version == gvr.version && r.plural == gvr.resource)
        .collect();
    match matches.len() {
        0 => Err((404, format!("unknown resource {}/{} {}", gvr.group, gvr.version, gvr.resource))),
        1 => Ok(matches[0].clone()),
        _ => Err((409, format!("ambiguous resource {}/{} {}", gvr.group, gvr.version, gvr.resource))),
    }
}

#[instrument(skip_all, fields(uid = %review.request.uid, namespace = review.request.namespace.as_deref().unwrap_or("*"), name = review.request.name.as_deref().unwrap_or("")))]
async fn handle_review(
    review: AdmissionReviewRequest,
    registry: Arc<AdmissionRegistry>,
    insights: Arc<crate::discovery::InsightsHolder>,
) -> AdmissionReviewResponse {
    let request = &review.request;
    let operation = match Operation::parse(&request.operation) {
        Some(op) => op,
        None => return reject(&review.api_version, &request.uid, "missing or unrecognized operation", 400),
    };

    let snapshot = insights.snapshot().await;
    let resource = match lookup_resource(&snapshot, &request.resource) {
        Ok(resource) => resource,
        Err((code, message)) => return reject(&review.api_version, &request.uid, &message, code),
    };

    let object = request.object.clone().unwrap_or(Value::Null);
    let old_object = request.old_object.clone().unwrap_or(Value::Null);
    if operation != Operation::Delete && object.is_null() {
        return reject(&review.api_version, &request.uid, "admission request carried no object", 400);
    }

    let (patch, warnings, worst) = evaluate(&registry, &resource, operation, &object, &old_object).await;

    let mut response = AdmissionResponseBody {
        uid: request.uid.clone(),
        allowed: worst.is_none(),
        warnings,
        ..Default::default()
    };
    if let Some(err) = &worst {
        response.status = Some(error_status(err));
    }
    if !patch.is_empty() && worst.is_none() {
        let ops = patch.to_json_patch(&object);
        if !ops.is_empty() {
            let encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&ops).unwrap_or_default());
            response.patch = Some(encoded);
            response.patch_type = Some("JSONPatch".to_string());
        }
    }

    AdmissionReviewResponse {
        api_version: review.api_version,
        kind: review.kind,
        response,
    }
}

fn with_registry(
    registry: Arc<AdmissionRegistry>,
) -> impl Filter<Extract = (Arc<AdmissionRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

fn with_insights(
    insights: Arc<crate::discovery::InsightsHolder>,
) -> impl Filter<Extract = (Arc<crate::discovery::InsightsHolder>,), Error = Infallible> + Clone {
    warp::any().map(move || insights.clone())
}

const MAGIC_BIND_ADDRESSES: &[&str] = &["0.0.0.0", "::"];

/// Chooses the self-signed certificate's SANs (spec §4.10): `host`, the
/// bind address, and any caller-supplied extras, with magic "all
/// interfaces" addresses filtered out since they are not valid SANs.
fn build_san_list(host: Option<&str>, addr: Option<IpAddr>, extra_sans: &[String]) -> Vec<String> {
    let mut sans = Vec::new();
    if let Some(host) = host {
        if !MAGIC_BIND_ADDRESSES.contains(&host) {
            sans.push(host.to_string());
        }
    }
    if let Some(addr) = addr {
        let addr_str = addr.to_string();
        if !MAGIC_BIND_ADDRESSES.contains(&addr_str.as_str()) {
            sans.push(addr_str);
        }
    }
    for extra in extra_sans {
        if !MAGIC_BIND_ADDRESSES.contains(&extra.as_str()) {
            sans.push(extra.clone());
        }
    }
    sans
}

/// Picks the self-signed certificate's common name: the first non-IP
/// hostname among the SANs, falling back to the first SAN at all (spec
/// §4.10: "a non-IP common name when available").
fn pick_common_name(sans: &[String]) -> String {
    sans.iter()
        .find(|s| s.parse::<IpAddr>().is_err())
        .or_else(|| sans.first())
        .cloned()
        .unwrap_or_else(|| "operon-admission".to_string())
}

fn generate_self_signed(sans: &[String]) -> Result<(String, String), AdmissionError> {
    let common_name = pick_common_name(sans);
    let mut params = rcgen::CertificateParams::new(sans.to_vec());
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let cert = rcgen::Certificate::from_params(params).map_err(|err| AdmissionError::CertGeneration(err.to_string()))?;
    let cert_pem = cert.serialize_pem().map_err(|err| AdmissionError::CertGeneration(err.to_string()))?;
    let key_pem = cert.serialize_private_key_pem();
    Ok((cert_pem, key_pem))
}

/// Resolves the bind socket: the configured host/port, or all interfaces
/// plus an OS-assigned free port when either is unset (spec §4.10).
fn resolve_bind_addr(settings: &AdmissionSettings) -> SocketAddr {
    let ip: IpAddr = settings
        .listen_host
        .as_deref()
        .and_then(|h| h.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, settings.listen_port.unwrap_or(0))
}

/// Runs the admission webhook server until cancelled. Building the route
/// and choosing a TLS strategy happens once at startup; the server then
/// blocks forever serving requests.
#[instrument(skip_all)]
pub async fn run_admission_server(
    settings: AdmissionSettings,
    registry: Arc<AdmissionRegistry>,
    insights: Arc<crate::discovery::InsightsHolder>,
    tunnel: Option<Arc<dyn crate::tunnel::WebhookTunnel>>,
) -> Result<(), AdmissionError> {
    let configured_path = settings.listen_path.trim_matches('/').to_string();

    let review_route = warp::post()
        .and(warp::path::full())
        .and(warp::body::json())
        .and(with_registry(registry))
        .and(with_insights(insights))
        .and_then(move |full: warp::path::FullPath, review: AdmissionReviewRequest, registry: Arc<AdmissionRegistry>, insights: Arc<crate::discovery::InsightsHolder>| {
            let configured_path = configured_path.clone();
            async move {
                if full.as_str().trim_matches('/') != configured_path {
                    return Err(warp::reject::not_found());
                }
                let response = handle_review(review, registry, insights).await;
                Ok(warp::reply::json(&response))
            }
        });

    let bind_addr = resolve_bind_addr(&settings);

    let mut insecure = settings.insecure;
    let mut tunnel_host: Option<String> = None;
    if let Some(tunnel) = &tunnel {
        let endpoint = tunnel.acquire(bind_addr).await?;
        info!(host = %endpoint.host, "admission webhook published through a tunnel");
        insecure = insecure || endpoint.insecure;
        tunnel_host = Some(endpoint.host);
    }

    if insecure {
        info!(%bind_addr, host = ?tunnel_host, "starting admission webhook server over plain HTTP (insecure mode)");
        warp::serve(review_route).run(bind_addr).await;
        return Ok(());
    }

    let (cert_pem, key_pem) = match (&settings.cert_path, &settings.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read_to_string(cert_path).map_err(|err| AdmissionError::TlsMaterial(err.to_string()))?;
            let key = std::fs::read_to_string(key_path).map_err(|err| AdmissionError::TlsMaterial(err.to_string()))?;
            (cert, key)
        }
        _ => {
            let host = tunnel_host.as_deref().or(settings.listen_host.as_deref());
            let sans = build_san_list(host, Some(bind_addr.ip()), &settings.extra_sans);
            generate_self_signed(&sans)?
        }
    };

    info!(%bind_addr, "starting admission webhook server over TLS");
    let mut server = warp::serve(review_route).tls().cert(cert_pem.as_bytes()).key(key_pem.as_bytes());
    if let Some(ca_path) = &settings.client_ca_path {
        let ca = std::fs::read(ca_path).map_err(|err| AdmissionError::TlsMaterial(err.to_string()))?;
        server = server.client_auth_required(&ca);
    }
    server.run(bind_addr).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysAllows;
    #[async_trait]
    impl Handler for AlwaysAllows {
        fn id(&self) -> &str {
            "allow"
        }
        async fn call(&self, _cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    struct AlwaysRejects {
        message: &'static str,
        code: u16,
    }
    #[async_trait]
    impl Handler for AlwaysRejects {
        fn id(&self) -> &str {
            "reject"
        }
        async fn call(&self, _cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError> {
            Err(HandlerError::Admission { message: self.message.to_string(), code: self.code })
        }
    }

    struct MutatesLabel;
    #[async_trait]
    impl Handler for MutatesLabel {
        fn id(&self) -> &str {
            "mutate"
        }
        async fn call(&self, cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError> {
            cause.patch.set_path(&["metadata", "labels", "touched"], json!("yes"));
            Ok(None)
        }
    }

    fn widget() -> Resource {
        Resource {
            group: "example.com".into(),
            version: "v1".into(),
            plural: "widgets".into(),
            singular: "widget".into(),
            kind: "Widget".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into()],
            namespaced: true,
            preferred: true,
        }
    }

    fn everything_selector() -> Selector {
        Selector::everything()
    }

    #[tokio::test]
    async fn allowed_when_no_handler_objects() {
        let mut registry = AdmissionRegistry::new();
        registry.register(AdmissionRegistration {
            selector: everything_selector(),
            kind: AdmissionKind::Validating,
            operations: vec![],
            id: "allow".into(),
            reason: None,
            handler: Arc::new(AlwaysAllows),
        });
        let object = json!({"metadata": {"name": "x"}});
        let (patch, _warnings, worst) = evaluate(&registry, &widget(), Operation::Create, &object, &Value::Null).await;
        assert!(worst.is_none());
        assert!(patch.is_empty());
    }

    #[tokio::test]
    async fn admission_error_outranks_permanent_error() {
        let mut registry = AdmissionRegistry::new();
        registry.register(AdmissionRegistration {
            selector: everything_selector(),
            kind: AdmissionKind::Validating,
            operations: vec![],
            id: "err1".into(),
            reason: None,
            handler: Arc::new(RejectsPermanent),
        });
        registry.register(AdmissionRegistration {
            selector: everything_selector(),
            kind: AdmissionKind::Validating,
            operations: vec![],
            id: "err2".into(),
            reason: None,
            handler: Arc::new(AlwaysRejects { message: "err2", code: 418 }),
        });
        let object = json!({"metadata": {"name": "x"}});
        let (_patch, _warnings, worst) = evaluate(&registry, &widget(), Operation::Create, &object, &Value::Null).await;
        let worst = worst.expect("an error was recorded");
        let status = error_status(&worst);
        assert_eq!(status.message, "err2");
        assert_eq!(status.code, 418);
    }

    struct RejectsPermanent;
    #[async_trait]
    impl Handler for RejectsPermanent {
        fn id(&self) -> &str {
            "permanent"
        }
        async fn call(&self, _cause: &mut Cause<'_>) -> Result<Option<Value>, HandlerError> {
            Err(HandlerError::Other(anyhow::anyhow!("err1")))
        }
    }

    #[tokio::test]
    async fn mutating_handler_patch_is_collected() {
        let mut registry = AdmissionRegistry::new();
        registry.register(AdmissionRegistration {
            selector: everything_selector(),
            kind: AdmissionKind::Mutating,
            operations: vec![],
            id: "mutate".into(),
            reason: None,
            handler: Arc::new(MutatesLabel),
        });
        let object = json!({"metadata": {"name": "x"}});
        let (patch, _warnings, worst) = evaluate(&registry, &widget(), Operation::Create, &object, &Value::Null).await;
        assert!(worst.is_none());
        assert!(!patch.is_empty());
    }

    #[tokio::test]
    async fn mutating_handler_excluded_from_delete_by_default() {
        let mut registry = AdmissionRegistry::new();
        registry.register(AdmissionRegistration {
            selector: everything_selector(),
            kind: AdmissionKind::Mutating,
            operations: vec![],
            id: "mutate".into(),
            reason: None,
            handler: Arc::new(MutatesLabel),
        });
        let old_object = json!({"metadata": {"name": "x"}});
        let (patch, _warnings, worst) = evaluate(&registry, &widget(), Operation::Delete, &Value::Null, &old_object).await;
        assert!(worst.is_none());
        assert!(patch.is_empty());
    }

    #[test]
    fn san_list_filters_magic_addresses() {
        let sans = build_san_list(Some("0.0.0.0"), Some("10.0.0.5".parse().unwrap()), &["extra.example.com".to_string()]);
        assert_eq!(sans, vec!["10.0.0.5".to_string(), "extra.example.com".to_string()]);
    }

    #[test]
    fn common_name_prefers_non_ip_hostname() {
        let sans = vec!["10.0.0.5".to_string(), "webhook.example.com".to_string()];
        assert_eq!(pick_common_name(&sans), "webhook.example.com");
    }

    #[test]
    fn lookup_resource_reports_unknown_for_no_match() {
        let insights = Insights::default();
        let gvr = GroupVersionResource { group: "example.com".into(), version: "v1".into(), resource: "widgets".into() };
        let err = lookup_resource(&insights, &gvr).unwrap_err();
        assert_eq!(err.0, 404);
    }

    #[test]
    fn lookup_resource_reports_ambiguous_for_duplicate_gvr() {
        let mut insights = Insights::default();
        insights.resources.insert(widget());
        let mut conflicting = widget();
        conflicting.namespaced = false;
        insights.resources.insert(conflicting);
        let gvr = GroupVersionResource { group: "example.com".into(), version: "v1".into(), resource: "widgets".into() };
        let err = lookup_resource(&insights, &gvr).unwrap_err();
        assert_eq!(err.0, 409);
    }

    #[test]
    fn lookup_resource_finds_unique_match() {
        let mut insights = Insights::default();
        insights.resources.insert(widget());
        let gvr = GroupVersionResource { group: "example.com".into(), version: "v1".into(), resource: "widgets".into() };
        assert!(lookup_resource(&insights, &gvr).is_ok());
    }
}
