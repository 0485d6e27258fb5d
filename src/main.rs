/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/main.rs
*
* The `operond` binary: a thin composition-root caller around the reactor
* library. Embedding an actual operator means forking this file (or writing
* a new one against the same `operon` library crate) to register real
* handlers; this default binary runs the reactor with no handlers bound,
* which is enough to exercise discovery, peering, and the metrics endpoint
* on their own.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::SocketAddr;
use std::sync::Arc;

use operon::model::namespace::NamespacePattern;
use operon::runner::{AllAtOnce, HandlerRegistry};
use operon::settings::Settings;
use operon::{ReactorClient, ReactorError};

#[tokio::main]
async fn main() {
    let settings = Settings::default();
    let namespaces = NamespacePattern::parse(&std::env::var("REACTOR_NAMESPACES").unwrap_or_else(|_| "*".to_string()));
    let metrics_addr: SocketAddr = std::env::var("REACTOR_METRICS_ADDR")
        .ok()
        .and_then(|addr| addr.parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 9090).into());

    let registry = Arc::new(HandlerRegistry::new());
    let client = ReactorClient {
        selectors: Vec::new(),
        namespaces,
        lifecycle: Arc::new(AllAtOnce),
        admission: None,
        metrics_addr,
    };

    if let Err(err) = operon::run(settings, registry, client).await {
        report_fatal(&err);
        std::process::exit(1);
    }
}

fn report_fatal(err: &ReactorError) {
    eprintln!("operond: fatal error: {err}");
}
