/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/credentials.rs
*
* Credential items (spec §3, §4.1): one authenticated connection config.
* `VaultKey` identifies the login source that produced an item (so the
* vault can replace all items from one source on re-auth without touching
* items other sources contributed); the vault logic that round-robins and
* invalidates these lives in src/vault.rs.
*
* SPDX-License-Identifier: Apache-2.0
*/

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VaultKey(pub String);

impl From<&str> for VaultKey {
    fn from(s: &str) -> Self {
        VaultKey(s.to_string())
    }
}

/// One authenticated connection configuration (spec §3). Priorities group
/// items for round-robin selection: the vault always restricts itself to
/// the current highest-priority subset before picking at random among it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub server: String,
    pub ca_path: Option<String>,
    pub ca_data: Option<Vec<u8>>,
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub scheme: Option<String>,
    pub token: Option<String>,
    pub certificate_path: Option<String>,
    pub certificate_data: Option<Vec<u8>>,
    pub private_key_path: Option<String>,
    pub private_key_data: Option<Vec<u8>>,
    pub default_namespace: Option<String>,
    pub priority: i32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            server: String::new(),
            ca_path: None,
            ca_data: None,
            insecure: false,
            username: None,
            password: None,
            scheme: None,
            token: None,
            certificate_path: None,
            certificate_data: None,
            private_key_path: None,
            private_key_data: None,
            default_namespace: None,
            priority: 0,
        }
    }
}
