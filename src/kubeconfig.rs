/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/kubeconfig.rs
*
* Resolves this process's own Kubernetes connection configuration at
* startup and seeds the credentials vault (C1) with it (spec §3, §4.1: "the
* kubeconfig path consumed by the API client's own bootstrap"). Reuses
* `kube::Config::infer()` for the actual `$KUBECONFIG` / `~/.kube/config` /
* in-cluster service-account resolution rather than hand-rolling kubeconfig
* YAML parsing, since that resolution order is already exactly what the
* `kube` crate (already a dependency, for its typed object metadata) does
* for its own client.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use kube::config::AuthInfo;
use kube::Config as KubeConfig;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::instrument;

use crate::model::credentials::{ConnectionInfo, VaultKey};
use crate::vault::Vault;

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("failed to resolve a Kubernetes client configuration: {0}")]
    Infer(#[from] kube::config::InferConfigError),
}

/// Resolves the ambient Kubernetes connection config and shapes it into the
/// single `ConnectionInfo` the vault expects. Exec-plugin and
/// auth-provider credential plugins are not evaluated; only their static
/// token/certificate fields (if kubeconfig carries one directly) are read.
#[instrument]
pub async fn resolve_connection_info() -> Result<(VaultKey, ConnectionInfo), KubeconfigError> {
    let config = KubeConfig::infer().await?;
    let auth = &config.auth_info;
    let info = ConnectionInfo {
        server: config.cluster_url.to_string(),
        ca_path: None,
        ca_data: config.root_cert.as_ref().and_then(|certs| certs.first().cloned()),
        insecure: config.accept_invalid_certs,
        username: auth.username.clone(),
        password: auth.password.as_ref().map(|secret| secret.expose_secret().to_string()),
        scheme: None,
        token: resolve_token(auth),
        certificate_path: auth.client_certificate.clone(),
        certificate_data: decode_pem_field(auth.client_certificate_data.as_deref()),
        private_key_path: auth.client_key.clone(),
        private_key_data: decode_pem_field(auth.client_key_data.as_deref()),
        default_namespace: Some(config.default_namespace.clone()),
        priority: 0,
    };
    Ok((VaultKey::from("kubeconfig"), info))
}

fn resolve_token(auth: &AuthInfo) -> Option<String> {
    if let Some(token) = &auth.token {
        return Some(token.expose_secret().to_string());
    }
    if let Some(path) = &auth.token_file {
        return std::fs::read_to_string(path).ok().map(|contents| contents.trim().to_string());
    }
    None
}

fn decode_pem_field(data: Option<&str>) -> Option<Vec<u8>> {
    data.and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
}

/// Resolves the ambient connection config and loads it into `vault`. Called
/// once by the composition root at startup; re-authentication after that
/// point is the vault's own `invalidate`/`populate` dance, not this
/// function's concern.
pub async fn populate_vault_from_environment(vault: &Arc<Vault>) -> Result<(), KubeconfigError> {
    let (key, info) = resolve_connection_info().await?;
    let mut items = HashMap::new();
    items.insert(key, info);
    vault.populate(items).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_pem_field_rejects_non_base64() {
        assert!(decode_pem_field(Some("not base64!!")).is_none());
    }

    #[test]
    fn decode_pem_field_passes_through_valid_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"cert-bytes");
        assert_eq!(decode_pem_field(Some(&encoded)), Some(b"cert-bytes".to_vec()));
    }
}
