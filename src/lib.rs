/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* The reactor crate: a Kubernetes operator framework built around a
* watch-stream engine, a per-object queue multiplexer, a handler runner,
* and the supporting cast (discovery, peering, credentials, admission,
* telemetry) needed to run all of that as one long-lived process. The
* composition root in `bootstrap::run` is the one place these modules are
* wired together; everything else is usable independently for testing.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod admission;
pub mod bootstrap;
pub mod client;
pub mod discovery;
pub mod errors;
pub mod kubeconfig;
pub mod model;
pub mod orchestration;
pub mod peering;
pub mod primitives;
pub mod progress_store;
pub mod queueing;
pub mod runner;
pub mod settings;
pub mod telemetry;
pub mod tunnel;
pub mod vault;
pub mod watching;

pub use bootstrap::{run, ReactorClient};
pub use errors::ReactorError;
pub use settings::Settings;
