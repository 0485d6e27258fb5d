/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/mod.rs
*
* The reactor's data model: resource descriptors and selectors, namespace
* patterns, object identity, the progress record, the last-seen annotation,
* diffs, merge patches, peer records, and credential items. These are plain
* data types and pure functions; the components that hold mutable state over
* them (the vault, the progress store, insights) live one level up in
* src/.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod credentials;
pub mod diff;
pub mod insights;
pub mod lastseen;
pub mod namespace;
pub mod object_id;
pub mod patch;
pub mod peer;
pub mod progress;
pub mod resource;

pub use credentials::ConnectionInfo;
pub use diff::{Diff, DiffItem, DiffOperation};
pub use insights::Insights;
pub use namespace::NamespacePattern;
pub use object_id::ObjectId;
pub use patch::Patch;
pub use peer::PeerRecord;
pub use progress::ProgressRecord;
pub use resource::{Resource, Selector};
