/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/primitives.rs
*
* Cross-task synchronization primitives shared by every long-running part of
* the reactor: bi-directional toggles, toggle sets (any/all composition), a
* single-value container, and a condition chain that cascades notifications
* from one condition into another.
*
* None of these are plain bools/channels: each one needs both directions of
* waiting (wait for on, wait for off) and edge-triggered notification so that
* a consumer blocked on `wait_for(false)` wakes exactly when the composite
* state actually flips, not on every child mutation.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

static NEXT_TOGGLE_ID: AtomicU64 = AtomicU64::new(1);

/// A boolean flag with async waiters on both edges.
///
/// Turning the toggle on or off notifies everyone waiting for that specific
/// value; waiters for the other value keep sleeping.
#[derive(Debug)]
pub struct Toggle {
    id: u64,
    name: Option<String>,
    state: Mutex<bool>,
    on_notify: Notify,
    off_notify: Notify,
}

impl Toggle {
    pub fn new(initial: bool) -> Arc<Self> {
        Self::named(initial, None)
    }

    pub fn named(initial: bool, name: Option<String>) -> Arc<Self> {
        Arc::new(Toggle {
            id: NEXT_TOGGLE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            state: Mutex::new(initial),
            on_notify: Notify::new(),
            off_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub async fn is_on(&self) -> bool {
        *self.state.lock().await
    }

    pub async fn is_off(&self) -> bool {
        !self.is_on().await
    }

    pub async fn turn_on(&self) {
        let mut guard = self.state.lock().await;
        if !*guard {
            *guard = true;
            self.on_notify.notify_waiters();
        }
    }

    pub async fn turn_off(&self) {
        let mut guard = self.state.lock().await;
        if *guard {
            *guard = false;
            self.off_notify.notify_waiters();
        }
    }

    /// Blocks until the toggle reaches `value`. Returns immediately if it is
    /// already there.
    pub async fn wait_for(&self, value: bool) {
        loop {
            let notified_on = self.on_notify.notified();
            let notified_off = self.off_notify.notified();
            {
                let guard = self.state.lock().await;
                if *guard == value {
                    return;
                }
            }
            if value {
                notified_on.await;
            } else {
                notified_off.await;
            }
        }
    }
}

impl PartialEq for Toggle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Toggle {}

impl std::hash::Hash for Toggle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Composition mode of a [`ToggleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleSetMode {
    /// Composite is on iff at least one child is on (the reactor's pause set).
    Any,
    /// Composite is on iff every child is on (the reactor's readiness set,
    /// used inverted: "ready" is modeled as all-off).
    All,
}

struct ToggleSetInner {
    children: HashMap<u64, Arc<Toggle>>,
    composite: bool,
}

/// A dynamic collection of [`Toggle`]s whose membership changes at runtime
/// (one child per watched resource, per peering key, ...), exposing a single
/// composite toggle over them.
pub struct ToggleSet {
    mode: ToggleSetMode,
    inner: Mutex<ToggleSetInner>,
    composite_on: Notify,
    composite_off: Notify,
}

impl ToggleSet {
    pub fn new(mode: ToggleSetMode) -> Arc<Self> {
        let composite = match mode {
            ToggleSetMode::Any => false,
            ToggleSetMode::All => true,
        };
        Arc::new(ToggleSet {
            mode,
            inner: Mutex::new(ToggleSetInner {
                children: HashMap::new(),
                composite,
            }),
            composite_on: Notify::new(),
            composite_off: Notify::new(),
        })
    }

    fn recompute(mode: ToggleSetMode, children: &HashMap<u64, Arc<Toggle>>, states: &HashMap<u64, bool>) -> bool {
        match mode {
            ToggleSetMode::Any => children.keys().any(|id| states.get(id).copied().unwrap_or(false)),
            ToggleSetMode::All => children.keys().all(|id| states.get(id).copied().unwrap_or(false)),
        }
    }

    /// Adds a new child toggle with the given initial value and returns it.
    /// The caller mutates the child directly; call [`Self::refresh`] after
    /// every mutation to propagate to the composite.
    pub async fn make_toggle(self: &Arc<Self>, initial: bool, name: Option<String>) -> Arc<Toggle> {
        let toggle = Toggle::named(initial, name);
        {
            let mut guard = self.inner.lock().await;
            guard.children.insert(toggle.id(), toggle.clone());
        }
        self.refresh().await;
        toggle
    }

    pub async fn drop_toggle(self: &Arc<Self>, toggle: &Arc<Toggle>) {
        {
            let mut guard = self.inner.lock().await;
            guard.children.remove(&toggle.id());
        }
        self.refresh().await;
    }

    /// Recomputes the composite from the current children's live state and
    /// notifies waiters only on an actual edge.
    pub async fn refresh(self: &Arc<Self>) {
        let mut states = HashMap::new();
        let ids: Vec<(u64, Arc<Toggle>)> = {
            let guard = self.inner.lock().await;
            guard.children.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        for (id, toggle) in &ids {
            states.insert(*id, toggle.is_on().await);
        }
        let mut guard = self.inner.lock().await;
        let new_composite = Self::recompute(self.mode, &guard.children, &states);
        if new_composite != guard.composite {
            guard.composite = new_composite;
            if new_composite {
                self.composite_on.notify_waiters();
            } else {
                self.composite_off.notify_waiters();
            }
        }
    }

    pub async fn is_on(&self) -> bool {
        self.inner.lock().await.composite
    }

    pub async fn wait_for(self: &Arc<Self>, value: bool) {
        loop {
            let notified_on = self.composite_on.notified();
            let notified_off = self.composite_off.notified();
            {
                let guard = self.inner.lock().await;
                if guard.composite == value {
                    return;
                }
            }
            if value {
                notified_on.await;
            } else {
                notified_off.await;
            }
        }
    }
}

/// A zero-or-one value slot with change notification, used to publish the
/// current (resources, namespaces) snapshot and similar "latest value wins"
/// state between a single writer and many readers.
pub struct Container<T> {
    inner: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Container<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Container {
            inner: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    pub async fn set(&self, value: T) {
        let mut guard = self.inner.lock().await;
        *guard = Some(value);
        self.notify.notify_waiters();
    }

    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        *guard = None;
    }

    /// Returns the current value immediately, or `None` if empty (mirrors
    /// the source's `get_nowait`, minus the raised exception: callers here
    /// already expect an `Option`).
    pub async fn get_nowait(&self) -> Option<T> {
        self.inner.lock().await.clone()
    }

    /// Blocks until a value is present, then returns a clone of it.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.inner.lock().await.clone() {
                return v;
            }
            notified.await;
        }
    }

    /// Blocks until the value changes from whatever it is now, then returns
    /// the new value. Used by `as_changed`-style consumers that want to
    /// react to every revision rather than just the first one.
    pub async fn wait_for_change(&self) -> T {
        let notified = self.notify.notified();
        notified.await;
        // Another writer could have raced us between the notify firing and
        // the read below; that is fine, the reader always gets *a* post-edge
        // value, matching the "at least once per change" guarantee.
        loop {
            if let Some(v) = self.inner.lock().await.clone() {
                return v;
            }
        }
    }
}

/// Chains a source [`Notify`] into a target one: every time the source is
/// notified, the target is notified too. Used to cascade the insights
/// "revised" signal into the orchestrator's own wakeups without giving the
/// orchestrator a direct reference to the insights internals.
pub fn condition_chain(source: Arc<Notify>, target: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            source.notified().await;
            target.notify_waiters();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn toggle_wait_for_returns_immediately_when_already_set() {
        let t = Toggle::new(true);
        tokio::time::timeout(Duration::from_millis(50), t.wait_for(true))
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn toggle_wakes_waiter_on_turn_on() {
        let t = Toggle::new(false);
        let t2 = t.clone();
        let handle = tokio::spawn(async move { t2.wait_for(true).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.turn_on().await;
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter should have woken")
            .unwrap();
    }

    #[tokio::test]
    async fn toggle_set_any_is_on_iff_one_child_on() {
        let set = ToggleSet::new(ToggleSetMode::Any);
        assert!(!set.is_on().await);
        let a = set.make_toggle(false, Some("a".into())).await;
        let b = set.make_toggle(false, Some("b".into())).await;
        assert!(!set.is_on().await);
        a.turn_on().await;
        set.refresh().await;
        assert!(set.is_on().await);
        a.turn_off().await;
        set.refresh().await;
        assert!(!set.is_on().await);
        b.turn_on().await;
        set.refresh().await;
        assert!(set.is_on().await);
    }

    #[tokio::test]
    async fn toggle_set_all_starts_on_when_empty() {
        let set = ToggleSet::new(ToggleSetMode::All);
        assert!(set.is_on().await);
        let a = set.make_toggle(false, None).await;
        assert!(!set.is_on().await);
        a.turn_on().await;
        set.refresh().await;
        assert!(set.is_on().await);
    }

    #[tokio::test]
    async fn container_wait_blocks_until_set() {
        let c: Arc<Container<i32>> = Container::new();
        let c2 = c.clone();
        let handle = tokio::spawn(async move { c2.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.set(42).await;
        let v = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, 42);
    }
}
