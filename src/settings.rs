/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/settings.rs
*
* The Settings aggregate (spec §6, §1A "Configuration"). A single value
* assembled by the embedding binary and threaded by reference through every
* component; there is no implicit process-wide configuration besides the
* two environment variables read at startup (POD_ID and the kubeconfig
* path, both consumed at the edges rather than looked up mid-flight).
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatchingSettings {
    pub server_timeout: Duration,
    pub client_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for WatchingSettings {
    fn default() -> Self {
        WatchingSettings {
            server_timeout: Duration::from_secs(290),
            client_timeout: Duration::from_secs(295),
            connect_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchingSettings {
    pub worker_limit: usize,
    pub idle_timeout: Duration,
    pub batch_window: Duration,
    pub exit_timeout: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        BatchingSettings {
            worker_limit: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            batch_window: Duration::from_millis(100),
            exit_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeeringSettings {
    pub name: String,
    pub mandatory: bool,
    pub standalone: bool,
    pub clusterwide: bool,
    pub namespaced: bool,
    pub priority: i32,
    pub lifetime: i64,
    pub stealth: bool,
}

impl Default for PeeringSettings {
    fn default() -> Self {
        PeeringSettings {
            name: "default".to_string(),
            mandatory: false,
            standalone: false,
            clusterwide: false,
            namespaced: true,
            priority: 0,
            lifetime: 60,
            stealth: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanningSettings {
    pub disabled: bool,
}

/// Which external-hostname wrapper (if any) publishes the webhook endpoint
/// (spec §4.10 "Tunnels"). `Auto` inspects the cluster before picking one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelKind {
    #[default]
    None,
    K3d,
    Minikube,
    Ngrok,
    Auto,
}

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub managed: Option<String>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub listen_path: String,
    pub insecure: bool,
    pub extra_sans: Vec<String>,
    /// Caller-provided certificate/key PEM paths (spec §4.10 option a).
    /// When both are set, these are used verbatim instead of generating a
    /// self-signed certificate.
    pub cert_path: Option<std::path::PathBuf>,
    pub key_path: Option<std::path::PathBuf>,
    /// Trust store for optional mutual TLS (spec §4.10 `verify_mode`).
    pub client_ca_path: Option<std::path::PathBuf>,
    pub tunnel: TunnelKind,
    /// Only consulted when `tunnel` resolves to `Ngrok`; `None` uses
    /// whatever `NGROK_AUTHTOKEN`/config file the ngrok agent already has.
    pub ngrok_authtoken: Option<String>,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        AdmissionSettings {
            managed: None,
            listen_host: None,
            listen_port: None,
            listen_path: "/".to_string(),
            insecure: false,
            extra_sans: Vec::new(),
            cert_path: None,
            key_path: None,
            client_ca_path: None,
            tunnel: TunnelKind::default(),
            ngrok_authtoken: None,
        }
    }
}

/// Ambient (§1A): the only non-functional knob this crate exposes itself;
/// everything else about logging setup is the embedding binary's call.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub verbosity: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            verbosity: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub pod_id_env: String,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        ProcessSettings {
            pod_id_env: "POD_ID".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub watching: WatchingSettings,
    pub batching: BatchingSettings,
    pub peering: PeeringSettings,
    pub scanning: ScanningSettings,
    pub admission: AdmissionSettings,
    pub logging: LoggingSettings,
    pub process: ProcessSettings,
}
