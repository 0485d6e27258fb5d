/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/client/errors.rs
*
* API error mapping (C2, spec §4.2, §7): HTTP 4xx/5xx responses carrying a
* Kubernetes `Status` body are mapped to a typed taxonomy; anything else
* (non-JSON, non-`Status` bodies) collapses to `Generic` with only the HTTP
* status fields, mirroring `check_response()` in the reference client.
*
* SPDX-License-Identifier: Apache-2.0
*/

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("401 Unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("403 Forbidden: {message}")]
    Forbidden { message: String },
    #[error("404 Not Found: {message}")]
    NotFound { message: String },
    #[error("409 Conflict: {message}")]
    Conflict { message: String },
    #[error("Kubernetes API error (HTTP {status}): {message}")]
    Generic { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Builds the typed error from an HTTP status and a (possibly absent or
    /// malformed) Kubernetes `Status` response body.
    pub fn from_response(status: u16, body: Option<&Value>) -> Self {
        let message = body
            .filter(|b| b.get("kind").and_then(Value::as_str) == Some("Status"))
            .and_then(|b| b.get("message").and_then(Value::as_str))
            .unwrap_or("no message in response body")
            .to_string();
        match status {
            401 => ApiError::Unauthorized { message },
            403 => ApiError::Forbidden { message },
            404 => ApiError::NotFound { message },
            409 => ApiError::Conflict { message },
            other => ApiError::Generic { status: other, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_known_status_codes() {
        assert!(matches!(ApiError::from_response(401, None), ApiError::Unauthorized { .. }));
        assert!(matches!(ApiError::from_response(404, None), ApiError::NotFound { .. }));
        assert!(matches!(ApiError::from_response(500, None), ApiError::Generic { .. }));
    }

    #[test]
    fn extracts_message_from_status_body() {
        let body = json!({"kind": "Status", "message": "nope"});
        match ApiError::from_response(409, Some(&body)) {
            ApiError::Conflict { message } => assert_eq!(message, "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ignores_non_status_body() {
        let body = json!({"kind": "Pod"});
        match ApiError::from_response(500, Some(&body)) {
            ApiError::Generic { message, .. } => assert_eq!(message, "no message in response body"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
