/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/errors.rs
*
* The top-level fatal error type (spec §7, §1A). Each component exposes its
* own thiserror enum for the errors it can recover from locally; this
* aggregate is the only error type that crosses the `tokio::join!` boundary
* in the composition root (src/bootstrap.rs), matching the propagation
* policy: per-object errors never reach here, only invariant-corrupting
* ones (vault exhaustion, worker-pool fatal propagation, discovery
* failures, watch-stream fatal errors).
*
* SPDX-License-Identifier: Apache-2.0
*/

use thiserror::Error;

use crate::client::ApiError;
use crate::queueing::QueueingError;
use crate::vault::VaultError;
use crate::watching::WatchingError;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("credentials vault exhausted: {0}")]
    Vault(#[from] VaultError),

    #[error("api client error: {0}")]
    Api(#[from] ApiError),

    #[error("watch stream fatal error: {0}")]
    Watching(#[from] WatchingError),

    #[error("worker pool fatal error: {0}")]
    Queueing(#[from] QueueingError),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("admission server failed: {0}")]
    Admission(String),

    #[error("a reactor task panicked or was aborted: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
