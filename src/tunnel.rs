/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/tunnel.rs
*
* Webhook tunnels (part of C10, spec §4.10): optional wrappers that publish
* the admission server's local endpoint under an externally-reachable
* hostname, for clusters that cannot route straight to a developer's
* machine. `K3dTunnel`/`MinikubeTunnel` need no network logic at all — k3d
* and minikube already forward `host.k3d.internal`/`host.minikube.internal`
* to the host transparently, so "tunneling" is just reporting that hostname
* in the cert SANs/CN instead of the bind address. `NgrokTunnel` is the one
* case that does real work, opening an ngrok HTTP tunnel and forwarding it
* at the local bind port.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::admission::AdmissionError;
use crate::client::ApiClient;
use crate::settings::TunnelKind;

/// What a tunnel hands back once it has published the local server.
pub struct TunnelEndpoint {
    /// The hostname clients (the API server) should reach the webhook at.
    pub host: String,
    /// Whether the local server must run in plain-HTTP mode because the
    /// tunnel itself terminates TLS (ngrok's free tier does; k3d/minikube's
    /// host forwarding does not).
    pub insecure: bool,
}

/// Publishes a local endpoint under an external hostname. Object-safe so the
/// admission bootstrap can hold whichever tunnel was configured behind one
/// `Arc<dyn WebhookTunnel>` without matching on the concrete kind again.
#[async_trait]
pub trait WebhookTunnel: Send + Sync {
    async fn acquire(&self, local_addr: SocketAddr) -> Result<TunnelEndpoint, AdmissionError>;
}

/// k3d forwards `host.k3d.internal` to the machine running the cluster;
/// nothing on this side needs to open a connection for it.
pub struct K3dTunnel;

#[async_trait]
impl WebhookTunnel for K3dTunnel {
    async fn acquire(&self, _local_addr: SocketAddr) -> Result<TunnelEndpoint, AdmissionError> {
        Ok(TunnelEndpoint { host: "host.k3d.internal".to_string(), insecure: false })
    }
}

/// Same idea for minikube's `host.minikube.internal`.
pub struct MinikubeTunnel;

#[async_trait]
impl WebhookTunnel for MinikubeTunnel {
    async fn acquire(&self, _local_addr: SocketAddr) -> Result<TunnelEndpoint, AdmissionError> {
        Ok(TunnelEndpoint { host: "host.minikube.internal".to_string(), insecure: false })
    }
}

/// Opens an ngrok HTTP tunnel forwarding to the local bind port. Requires a
/// concrete (non-ephemeral) `listen_port`, since the tunnel has to be told
/// which port to forward before the caller can know an OS-assigned one.
pub struct NgrokTunnel {
    pub authtoken: Option<String>,
}

#[async_trait]
impl WebhookTunnel for NgrokTunnel {
    async fn acquire(&self, local_addr: SocketAddr) -> Result<TunnelEndpoint, AdmissionError> {
        if local_addr.port() == 0 {
            return Err(AdmissionError::NoBindAddress);
        }

        let mut builder = ngrok::Session::builder();
        if let Some(token) = &self.authtoken {
            builder = builder.authtoken(token);
        } else {
            builder = builder.authtoken_from_env();
        }
        let session = builder.connect().await.map_err(|err| AdmissionError::Tunnel(err.to_string()))?;

        let forward_to = format!("localhost:{}", local_addr.port());
        let tunnel = session
            .http_endpoint()
            .listen_and_forward(forward_to.parse().map_err(|_| AdmissionError::NoBindAddress)?)
            .await
            .map_err(|err| AdmissionError::Tunnel(err.to_string()))?;

        // ngrok's free tier proxies plain HTTP to the agent, not HTTPS, so
        // the local server has to serve this endpoint unencrypted.
        Ok(TunnelEndpoint { host: tunnel.url().to_string(), insecure: true })
    }
}

/// Which kind of local cluster the API server looks like, for auto-picking
/// a tunnel (spec §4.10: "Cluster auto-detection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    K3d,
    Minikube,
    Unknown,
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Inspects `/version`'s `gitVersion` for k3s's `+k3s` build-metadata suffix
/// first (the reliable signal), then falls back to a byte-level scan of the
/// API server's serving CA for the `minikube`/`minikubeCA`/`k3s` substrings
/// their self-signed CAs carry in the subject CN. A full X.509 parse isn't
/// worth a new dependency just for this: CN values are ASCII PrintableString
/// or UTF8String fields, so they appear as contiguous bytes in the DER
/// regardless of where the CA was decoded from.
#[instrument(skip(client))]
pub async fn detect_cluster_kind(client: &ApiClient) -> ClusterKind {
    if let Ok(body) = client.get_raw("/version").await {
        let git_version = body.get("gitVersion").and_then(Value::as_str).unwrap_or("");
        if git_version.contains("+k3s") {
            return ClusterKind::K3d;
        }
    }

    match client.serving_ca().await {
        Some(ca) if contains_subsequence(&ca, b"minikube") => ClusterKind::Minikube,
        Some(ca) if contains_subsequence(&ca, b"k3s") => ClusterKind::K3d,
        _ => ClusterKind::Unknown,
    }
}

/// Builds whichever tunnel `settings.tunnel` names, running cluster
/// detection only for `Auto`. Returns `None` for `TunnelKind::None` and for
/// `Auto` when detection comes back `Unknown` and no ngrok token is
/// configured to fall back to.
pub async fn resolve_tunnel(
    tunnel: TunnelKind,
    ngrok_authtoken: Option<String>,
    client: &ApiClient,
) -> Option<std::sync::Arc<dyn WebhookTunnel>> {
    match tunnel {
        TunnelKind::None => None,
        TunnelKind::K3d => Some(std::sync::Arc::new(K3dTunnel)),
        TunnelKind::Minikube => Some(std::sync::Arc::new(MinikubeTunnel)),
        TunnelKind::Ngrok => Some(std::sync::Arc::new(NgrokTunnel { authtoken: ngrok_authtoken })),
        TunnelKind::Auto => match detect_cluster_kind(client).await {
            ClusterKind::K3d => Some(std::sync::Arc::new(K3dTunnel)),
            ClusterKind::Minikube => Some(std::sync::Arc::new(MinikubeTunnel)),
            ClusterKind::Unknown => ngrok_authtoken.map(|token| std::sync::Arc::new(NgrokTunnel { authtoken: Some(token) }) as std::sync::Arc<dyn WebhookTunnel>),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsequence_search_finds_embedded_needle() {
        let haystack = b"CN=k3s-server-ca,O=k3s";
        assert!(contains_subsequence(haystack, b"k3s"));
        assert!(!contains_subsequence(haystack, b"minikube"));
    }

    #[tokio::test]
    async fn k3d_and_minikube_tunnels_ignore_the_local_port() {
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let k3d = K3dTunnel.acquire(addr).await.unwrap();
        assert_eq!(k3d.host, "host.k3d.internal");
        assert!(!k3d.insecure);

        let minikube = MinikubeTunnel.acquire(addr).await.unwrap();
        assert_eq!(minikube.host, "host.minikube.internal");
        assert!(!minikube.insecure);
    }

    #[tokio::test]
    async fn ngrok_tunnel_rejects_an_ephemeral_port() {
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let err = NgrokTunnel { authtoken: None }.acquire(addr).await.unwrap_err();
        assert!(matches!(err, AdmissionError::NoBindAddress));
    }
}
