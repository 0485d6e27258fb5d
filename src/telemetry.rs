/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/telemetry.rs
*
* Logging and metrics (ambient, ungoverned by any single spec section): a
* `tracing-subscriber` registry for structured logs and a Prometheus
* `Registry` of the counters/gauges the rest of the reactor increments.
* Metrics are declared once via `lazy_static!` and registered into a fresh
* `Registry` rather than the implicit global one, the same split the
* embedding operator's own `metrics.rs`/`main.rs` use.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::net::SocketAddr;
use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter, IntCounterVec,
    IntGaugeVec, Registry, TextEncoder,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;

use crate::settings::LoggingSettings;

lazy_static! {
    /// Incremented each time a watch stream (C5) has to reconnect, labeled
    /// by the resource it was watching.
    pub static ref WATCH_RESTARTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reactor_watch_restarts_total",
        "Total number of watch-stream reconnects, by resource.",
        &["resource"]
    )
    .unwrap();

    /// Every event a watch stream delivers (including synthetic ones from
    /// the initial listing), labeled by resource and event type.
    pub static ref WATCH_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reactor_watch_events_total",
        "Total number of watch events observed, by resource and event type.",
        &["resource", "type"]
    )
    .unwrap();

    /// Current number of distinct objects with a live per-object worker
    /// queue, labeled by resource.
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "reactor_queue_depth",
        "Current number of per-object queues held open by the multiplexer, by resource.",
        &["resource"]
    )
    .unwrap();

    /// Every handler invocation's outcome, labeled by handler id and
    /// outcome (`success`, `retry`, `failure`).
    pub static ref HANDLER_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reactor_handler_outcomes_total",
        "Total handler invocation outcomes, by handler id and outcome.",
        &["handler", "outcome"]
    )
    .unwrap();

    /// Peering conflicts observed, labeled by the kind of conflict
    /// (`higher_priority`, `same_priority`).
    pub static ref PEERING_CONFLICTS: IntCounterVec = register_int_counter_vec!(
        "reactor_peering_conflicts",
        "Total peering conflicts observed, by kind.",
        &["kind"]
    )
    .unwrap();

    /// Total credential invalidations across every vault key.
    pub static ref VAULT_INVALIDATIONS_TOTAL: IntCounter = register_int_counter!(opts!(
        "reactor_vault_invalidations_total",
        "Total number of credential invalidations performed by the vault."
    ))
    .unwrap();
}

/// Builds a fresh registry and registers every metric declared above. Meant
/// to be called once at startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let registry = Registry::new();
    registry.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;
    registry.register(Box::new(WATCH_EVENTS_TOTAL.clone()))?;
    registry.register(Box::new(QUEUE_DEPTH.clone()))?;
    registry.register(Box::new(HANDLER_OUTCOMES_TOTAL.clone()))?;
    registry.register(Box::new(PEERING_CONFLICTS.clone()))?;
    registry.register(Box::new(VAULT_INVALIDATIONS_TOTAL.clone()))?;
    Ok(registry)
}

/// Installs the process-wide `tracing` subscriber. The only place in this
/// crate allowed to touch global logging state; every other module only
/// calls the `tracing` macros.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.verbosity.clone()));
    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()
}

async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, std::convert::Infallible> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .expect("metric families always encode to the Prometheus text format");
    let body = String::from_utf8(buffer).expect("Prometheus text encoding is always valid UTF-8");
    Ok(warp::reply::with_header(body, "Content-Type", encoder.format_type().to_string()))
}

/// Runs the `/metrics` HTTP server forever.
pub async fn run_metrics_server(registry: Arc<Registry>, bind_addr: SocketAddr) {
    let route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || registry.clone()))
        .and_then(metrics_handler);
    info!(%bind_addr, "starting metrics server");
    warp::serve(route).run(bind_addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_conflict() {
        create_and_register_metrics().expect("metric set registers cleanly");
    }

    #[test]
    fn counters_are_shared_across_registrations() {
        WATCH_RESTARTS_TOTAL.with_label_values(&["pods"]).inc();
        assert!(WATCH_RESTARTS_TOTAL.with_label_values(&["pods"]).get() >= 1);
    }
}
