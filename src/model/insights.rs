/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/insights.rs
*
* The insights snapshot (spec §3): the live picture of which resources and
* namespaces the operator must serve. This module holds the plain,
* clonable snapshot type; the mutable holder that publishes revisions of it
* under a single condition lives in src/discovery.rs (C3), which is the
* only component allowed to write it.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::{BTreeMap, BTreeSet};

use super::resource::{Resource, Selector};

/// `None` represents "cluster-scoped" / "no namespace filtering configured"
/// in the same slot a real namespace name would occupy, matching the
/// source's `namespaces: set<Namespace|None>` (§3).
pub type NamespaceSlot = Option<String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Insights {
    pub resources: BTreeSet<Resource>,
    pub indexable: BTreeSet<Resource>,
    pub namespaces: BTreeSet<NamespaceSlot>,
    pub backbone: BTreeMap<SelectorKey, Resource>,
    pub ready_resources: bool,
    pub ready_namespaces: bool,
}

/// `Selector` does not implement `Ord` (its `SelectorKind` carries
/// arbitrary strings per variant, which is fine for equality/hash but would
/// need an arbitrary variant ordering to sort); `SelectorKey` gives the
/// backbone map a total order without forcing that choice onto `Selector`
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SelectorKey(pub String);

impl From<&Selector> for SelectorKey {
    fn from(selector: &Selector) -> Self {
        SelectorKey(format!("{:?}", selector))
    }
}

impl Insights {
    pub fn is_ready(&self) -> bool {
        self.ready_resources && self.ready_namespaces
    }

    /// All `(resource, namespace)` task keys the orchestrator (C9) must
    /// maintain watchers for: resources not namespaced are always paired
    /// with `None` regardless of the configured namespace set.
    pub fn required_watch_keys(&self) -> Vec<(Resource, NamespaceSlot)> {
        let mut keys = Vec::new();
        for resource in &self.resources {
            if resource.namespaced {
                for ns in &self.namespaces {
                    keys.push((resource.clone(), ns.clone()));
                }
            } else {
                keys.push((resource.clone(), None));
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resource::Resource;

    fn widget(namespaced: bool) -> Resource {
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
            namespaced,
            preferred: true,
        }
    }

    #[test]
    fn namespaced_resource_pairs_with_every_namespace() {
        let mut insights = Insights::default();
        insights.resources.insert(widget(true));
        insights.namespaces.insert(Some("a".into()));
        insights.namespaces.insert(Some("b".into()));
        let keys = insights.required_watch_keys();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn cluster_scoped_resource_always_pairs_with_none() {
        let mut insights = Insights::default();
        insights.resources.insert(widget(false));
        insights.namespaces.insert(Some("a".into()));
        let keys = insights.required_watch_keys();
        assert_eq!(keys, vec![(widget(false), None)]);
    }

    #[test]
    fn ready_iff_both_flags_set() {
        let mut insights = Insights::default();
        assert!(!insights.is_ready());
        insights.ready_resources = true;
        assert!(!insights.is_ready());
        insights.ready_namespaces = true;
        assert!(insights.is_ready());
    }
}
