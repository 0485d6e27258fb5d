/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/vault.rs
*
* The credentials vault (C1, spec §4.1). A keyed collection of connection
* configs with round-robin selection biased by priority, grounded directly
* on the reference `Vault` class: a bounded per-key invalidation history
* (length <= 3) avoids re-accepting a config that was just proven bad, a
* single mutex serializes all mutation, and a `ready` toggle lets the rest
* of the reactor block until at least one credential exists.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::credentials::{ConnectionInfo, VaultKey};
use crate::primitives::Toggle;
use crate::telemetry::VAULT_INVALIDATIONS_TOTAL;

const MAX_INVALID_HISTORY: usize = 3;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no credentials are available and none were supplied to invalidate()")]
    LoginError,
    #[error("credentials were rejected by the cluster: {0}")]
    AccessError(String),
}

/// A cached derivative of a connection config (an HTTP client, a TLS
/// context, ...), created at most once per `(item, purpose)` pair and torn
/// down when that item is invalidated or the vault shuts down.
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self);
}

type CacheKey = (VaultKey, &'static str);

struct VaultState {
    current: HashMap<VaultKey, ConnectionInfo>,
    invalid: HashMap<VaultKey, Vec<ConnectionInfo>>,
    caches: HashMap<CacheKey, Arc<dyn Any + Send + Sync>>,
    closeables: HashMap<CacheKey, Arc<dyn Closeable>>,
}

/// The credentials vault. Cloned handles share the same underlying state
/// (`Arc` internally), matching the single-vault-per-operator topology.
pub struct Vault {
    state: Mutex<VaultState>,
    ready: Arc<Toggle>,
}

impl Vault {
    pub fn new() -> Arc<Self> {
        Arc::new(Vault {
            state: Mutex::new(VaultState {
                current: HashMap::new(),
                invalid: HashMap::new(),
                caches: HashMap::new(),
                closeables: HashMap::new(),
            }),
            ready: Toggle::new(false),
        })
    }

    pub fn ready(&self) -> Arc<Toggle> {
        self.ready.clone()
    }

    pub async fn wait_ready(&self) {
        self.ready.wait_for(true).await;
    }

    /// Merges in newly authenticated configs, skipping any that equal a
    /// previously-invalidated entry for the same key (so a stale re-auth
    /// result can't resurrect a config the vault just proved bad).
    pub async fn populate(&self, items: HashMap<VaultKey, ConnectionInfo>) {
        let mut state = self.state.lock().await;
        for (key, info) in items {
            let previously_invalid = state
                .invalid
                .get(&key)
                .map(|history| history.contains(&info))
                .unwrap_or(false);
            if previously_invalid {
                continue;
            }
            state.current.insert(key, info);
        }
        let has_any = !state.current.is_empty();
        drop(state);
        if has_any {
            self.ready.turn_on().await;
        }
    }

    /// Removes `key`'s current entry, pushes it onto the bounded invalid
    /// history, and releases its cached derivatives. If nothing is left in
    /// the vault, lowers readiness; callers that hold `exc` (the error that
    /// triggered the invalidation) get it back so they can propagate it if
    /// re-authentication (driven externally, by re-calling `populate`)
    /// never arrives — modeled here as returning the error immediately
    /// rather than blocking, since this crate has no single global
    /// re-auth task to await (spec §4.1 "block until refilled").
    pub async fn invalidate(&self, key: &VaultKey, exc: Option<VaultError>) -> Result<(), VaultError> {
        VAULT_INVALIDATIONS_TOTAL.inc();
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock().await;
            if let Some(info) = state.current.remove(key) {
                let history = state.invalid.entry(key.clone()).or_default();
                history.push(info);
                let overflow = history.len().saturating_sub(MAX_INVALID_HISTORY);
                if overflow > 0 {
                    history.drain(0..overflow);
                }
            }
            let stale_keys: Vec<CacheKey> = state
                .caches
                .keys()
                .filter(|(k, _)| k == key)
                .cloned()
                .collect();
            for cache_key in stale_keys {
                state.caches.remove(&cache_key);
                if let Some(closeable) = state.closeables.remove(&cache_key) {
                    to_close.push(closeable);
                }
            }
            if state.current.is_empty() {
                drop(state);
                self.ready.turn_off().await;
            }
        }
        for closeable in to_close {
            closeable.close().await;
        }
        if self.is_empty().await {
            return Err(exc.unwrap_or(VaultError::LoginError));
        }
        Ok(())
    }

    async fn is_empty(&self) -> bool {
        self.state.lock().await.current.is_empty()
    }

    /// Selects one `(key, info)` pair, restricted to the current
    /// highest-priority subset and chosen uniformly at random within it.
    /// Blocks until the vault is ready if it currently holds nothing.
    pub async fn select(&self) -> (VaultKey, ConnectionInfo) {
        loop {
            self.wait_ready().await;
            let state = self.state.lock().await;
            if state.current.is_empty() {
                continue;
            }
            let max_priority = state.current.values().map(|i| i.priority).max().unwrap();
            let candidates: Vec<(&VaultKey, &ConnectionInfo)> = state
                .current
                .iter()
                .filter(|(_, info)| info.priority == max_priority)
                .collect();
            let mut rng = rand::thread_rng();
            let (key, info) = candidates.choose(&mut rng).expect("non-empty by construction");
            return ((*key).clone(), (*info).clone());
        }
    }

    /// Returns a cached derivative for `(key, purpose)`, creating it with
    /// `factory` at most once. `factory` receives the current
    /// `ConnectionInfo` for the key.
    pub async fn extended<T, F>(&self, key: &VaultKey, purpose: &'static str, factory: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&ConnectionInfo) -> Arc<T>,
    {
        let mut state = self.state.lock().await;
        let info = state.current.get(key)?.clone();
        let cache_key = (key.clone(), purpose);
        if let Some(existing) = state.caches.get(&cache_key) {
            return existing.clone().downcast::<T>().ok();
        }
        let value = factory(&info);
        state.caches.insert(cache_key, value.clone());
        Some(value)
    }

    /// Registers a closeable so the vault's shutdown/invalidation path can
    /// tear it down alongside the plain cached value stored via
    /// [`Self::extended`].
    pub async fn register_closeable(&self, key: &VaultKey, purpose: &'static str, closeable: Arc<dyn Closeable>) {
        let mut state = self.state.lock().await;
        state.closeables.insert((key.clone(), purpose), closeable);
    }

    /// Flushes every cached derivative, closing each one. Called on vault
    /// shutdown.
    pub async fn close(&self) {
        let closeables: Vec<Arc<dyn Closeable>> = {
            let mut state = self.state.lock().await;
            state.caches.clear();
            state.closeables.drain().map(|(_, v)| v).collect()
        };
        for closeable in closeables {
            closeable.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(priority: i32) -> ConnectionInfo {
        ConnectionInfo {
            server: "https://example".into(),
            priority,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn populate_makes_vault_ready() {
        let vault = Vault::new();
        assert!(vault.ready.is_off().await);
        let mut items = HashMap::new();
        items.insert(VaultKey::from("a"), info(0));
        vault.populate(items).await;
        assert!(vault.ready.is_on().await);
    }

    #[tokio::test]
    async fn select_picks_highest_priority_subset() {
        let vault = Vault::new();
        let mut items = HashMap::new();
        items.insert(VaultKey::from("low"), info(0));
        items.insert(VaultKey::from("high"), info(10));
        vault.populate(items).await;
        for _ in 0..10 {
            let (key, _) = vault.select().await;
            assert_eq!(key, VaultKey::from("high"));
        }
    }

    #[tokio::test]
    async fn invalidate_drops_readiness_when_empty() {
        let vault = Vault::new();
        let mut items = HashMap::new();
        items.insert(VaultKey::from("only"), info(0));
        vault.populate(items).await;
        let result = vault.invalidate(&VaultKey::from("only"), None).await;
        assert!(matches!(result, Err(VaultError::LoginError)));
        assert!(vault.ready.is_off().await);
    }

    #[tokio::test]
    async fn invalidated_entry_is_not_repopulated() {
        let vault = Vault::new();
        let key = VaultKey::from("flaky");
        let mut items = HashMap::new();
        items.insert(key.clone(), info(0));
        vault.populate(items.clone()).await;
        let _ = vault.invalidate(&key, None).await;
        vault.populate(items).await;
        assert!(vault.ready.is_off().await);
    }

    #[tokio::test]
    async fn invalid_history_is_bounded() {
        let vault = Vault::new();
        let key = VaultKey::from("churn");
        for p in 0..5 {
            let mut items = HashMap::new();
            items.insert(key.clone(), info(p));
            vault.populate(items).await;
            let _ = vault.invalidate(&key, None).await;
        }
        let state = vault.state.lock().await;
        assert!(state.invalid.get(&key).unwrap().len() <= MAX_INVALID_HISTORY);
    }
}
