/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/resource.rs
*
* Resource descriptors and selectors (spec §3). A Resource is the immutable,
* fully-discovered shape of one API endpoint family; a Selector is the
* partial, possibly-fuzzy description a handler registration or the
* discovery layer uses to find one. The URL-building algorithm mirrors the
* REST layout every Kubernetes API group follows: `/api/v1/...` for the core
* group, `/apis/{group}/{version}/...` otherwise, with a `namespaces/{ns}/`
* segment inserted for namespaced resources when a namespace is supplied.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeSet;
use std::fmt;

/// The events resources are special-cased by the EVERYTHING selector (§3):
/// excluded unless named explicitly.
const EVENTS_PLURALS: &[&str] = &["events"];
const EVENTS_GROUPS: &[&str] = &["events.k8s.io"];

/// An immutable, fully-discovered API resource descriptor.
///
/// Identity is `(group, version, plural)`; the remaining fields are
/// metadata discovery fills in once the descriptor is built.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub singular: String,
    pub kind: String,
    pub short_names: Vec<String>,
    pub categories: Vec<String>,
    pub subresources: Vec<String>,
    pub verbs: Vec<String>,
    pub namespaced: bool,
    pub preferred: bool,
}

impl Resource {
    pub fn is_core(&self) -> bool {
        self.group.is_empty()
    }

    pub fn api_version(&self) -> String {
        if self.is_core() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn supports_watch_and_list(&self) -> bool {
        self.verbs.iter().any(|v| v == "watch") && self.verbs.iter().any(|v| v == "list")
    }

    pub fn supports_patch(&self) -> bool {
        self.verbs.iter().any(|v| v == "patch")
    }

    pub fn has_status_subresource(&self) -> bool {
        self.subresources.iter().any(|s| s == "status")
    }

    fn group_version_base(&self) -> String {
        if self.is_core() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    /// The collection URL for this resource, optionally scoped to a
    /// namespace. Passing `None` on a namespaced resource produces the
    /// cluster-wide "all namespaces" listing URL, which the Kubernetes API
    /// accepts for list/watch (but not for create/patch of a single item).
    pub fn get_url(&self, namespace: Option<&str>) -> String {
        let base = self.group_version_base();
        match (self.namespaced, namespace) {
            (true, Some(ns)) => format!("{base}/namespaces/{ns}/{}", self.plural),
            _ => format!("{base}/{}", self.plural),
        }
    }

    /// The single-object URL, `get_url(namespace)` plus the object name.
    pub fn get_object_url(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.get_url(namespace), name)
    }

    /// URL for the bare group/version discovery document (used by C3 to
    /// fetch the resource listing for one API version).
    pub fn group_version_discovery_url(group: &str, version: &str) -> String {
        if group.is_empty() {
            format!("/api/{version}")
        } else {
            format!("/apis/{group}/{version}")
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_core() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// The single "which object type" component of a [`Selector`]. Exactly one
/// of these (or [`SelectorKind::Everything`]) may be set at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectorKind {
    Kind(String),
    Plural(String),
    Singular(String),
    ShortName(String),
    Category(String),
    AnyName(String),
    Everything,
}

impl SelectorKind {
    pub fn is_specific(&self) -> bool {
        !matches!(self, SelectorKind::Everything | SelectorKind::Category(_))
    }
}

/// A partial, possibly-fuzzy resource specifier, as used by handler
/// registration and by the discovery layer's backbone lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: SelectorKind,
}

impl Selector {
    pub fn everything() -> Self {
        Selector {
            group: None,
            version: None,
            kind: SelectorKind::Everything,
        }
    }

    pub fn is_specific(&self) -> bool {
        self.kind.is_specific()
    }

    fn group_matches(&self, resource: &Resource) -> bool {
        self.group.as_deref().map_or(true, |g| g == resource.group)
    }

    fn version_matches(&self, resource: &Resource) -> bool {
        self.version.as_deref().map_or(true, |v| v == resource.version)
    }

    fn excludes_events_by_default(&self, resource: &Resource) -> bool {
        matches!(self.kind, SelectorKind::Everything)
            && (EVENTS_PLURALS.contains(&resource.plural.as_str())
                || EVENTS_GROUPS.contains(&resource.group.as_str()))
    }

    /// Whether `resource` is one of the candidates this selector could mean.
    /// Ambiguity (more than one match for a *specific* selector) is resolved
    /// by the discovery layer, not here (§4.3: core/v1 wins).
    pub fn matches(&self, resource: &Resource) -> bool {
        if !self.group_matches(resource) || !self.version_matches(resource) {
            return false;
        }
        if self.excludes_events_by_default(resource) {
            return false;
        }
        match &self.kind {
            SelectorKind::Everything => true,
            SelectorKind::Kind(k) => k == &resource.kind,
            SelectorKind::Plural(p) => p == &resource.plural,
            SelectorKind::Singular(s) => s == &resource.singular,
            SelectorKind::ShortName(s) => resource.short_names.iter().any(|sn| sn == s),
            SelectorKind::Category(c) => resource.categories.iter().any(|cat| cat == c),
            SelectorKind::AnyName(name) => {
                &resource.kind == name
                    || &resource.plural == name
                    || &resource.singular == name
                    || resource.short_names.iter().any(|sn| sn == name)
            }
        }
    }
}

/// Resolves ambiguity among multiple matches for a *specific* selector: if
/// one of the candidates is a core/v1 resource, it wins; otherwise the
/// match set is ambiguous and the caller must drop it with a warning
/// (§4.3, §8 Laws: "specific selector on a set containing core/v1 + others
/// → yields only core/v1").
pub fn resolve_ambiguity(candidates: &BTreeSet<Resource>) -> Option<Resource> {
    if candidates.len() <= 1 {
        return candidates.iter().next().cloned();
    }
    candidates.iter().find(|r| r.is_core()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_pod() -> Resource {
        Resource {
            group: "".into(),
            version: "v1".into(),
            plural: "pods".into(),
            singular: "pod".into(),
            kind: "Pod".into(),
            short_names: vec!["po".into()],
            categories: vec!["all".into()],
            subresources: vec!["status".into()],
            verbs: vec!["list".into(), "watch".into(), "patch".into()],
            namespaced: true,
            preferred: true,
        }
    }

    fn custom_widget() -> Resource {
        Resource {
            group: "example.com".into(),
            version: "v1".into(),
            plural: "pods".into(),
            singular: "pod".into(),
            kind: "Pod".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into()],
            namespaced: true,
            preferred: false,
        }
    }

    #[test]
    fn get_url_core_namespaced() {
        let r = core_pod();
        assert_eq!(r.get_url(Some("default")), "/api/v1/namespaces/default/pods");
        assert_eq!(r.get_url(None), "/api/v1/pods");
    }

    #[test]
    fn get_url_group_namespaced() {
        let r = custom_widget();
        assert_eq!(
            r.get_url(Some("default")),
            "/apis/example.com/v1/namespaces/default/pods"
        );
    }

    #[test]
    fn selector_matches_specific_kind() {
        let sel = Selector {
            group: None,
            version: None,
            kind: SelectorKind::Kind("Pod".into()),
        };
        assert!(sel.matches(&core_pod()));
        assert!(sel.matches(&custom_widget()));
    }

    #[test]
    fn ambiguity_resolves_to_core() {
        let mut set = BTreeSet::new();
        set.insert(custom_widget());
        set.insert(core_pod());
        let resolved = resolve_ambiguity(&set).unwrap();
        assert!(resolved.is_core());
    }

    #[test]
    fn ambiguity_none_when_no_core_candidate() {
        let mut set = BTreeSet::new();
        let mut other = custom_widget();
        other.group = "other.example.com".into();
        set.insert(custom_widget());
        set.insert(other);
        assert!(resolve_ambiguity(&set).is_none());
    }

    #[test]
    fn everything_excludes_events_unless_named() {
        let events = Resource {
            group: "".into(),
            version: "v1".into(),
            plural: "events".into(),
            singular: "event".into(),
            kind: "Event".into(),
            short_names: vec![],
            categories: vec![],
            subresources: vec![],
            verbs: vec!["list".into(), "watch".into()],
            namespaced: true,
            preferred: true,
        };
        assert!(!Selector::everything().matches(&events));
        let named = Selector {
            group: None,
            version: None,
            kind: SelectorKind::Kind("Event".into()),
        };
        assert!(named.matches(&events));
    }
}
