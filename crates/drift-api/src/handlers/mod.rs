//! HTTP handlers — thin adapters between axum and the protocol layer.

pub mod control;
pub mod peer;
pub mod status;
pub mod store;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use drift_services::registry::RegistryError;
use drift_services::{Protocol, ProtocolError};

#[derive(Clone)]
pub struct ApiState {
    pub protocol: Protocol,
    pub ha_enabled: bool,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Protocol error on its way to the client: an HTTP status plus a `ResultInfo` body.
#[derive(Debug)]
pub struct ApiError(pub ProtocolError);

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProtocolError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            ProtocolError::Registry(RegistryError::InvalidValue(_)) => StatusCode::BAD_REQUEST,
            ProtocolError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ProtocolError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        (status, Json(self.0.to_result())).into_response()
    }
}

// Re-export handler functions for use in router setup.
pub use control::handle_rpc_server_down;
pub use peer::{handle_pull_piece_task, handle_register, handle_report_piece, handle_service_down};
pub use status::handle_supernodes;
pub use store::{
    handle_kv_put, handle_kv_range, handle_lease_grant, handle_lease_keep_alive,
    handle_lease_revoke, handle_revision, handle_watch,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_error_kind() {
        let bad = ApiError(ProtocolError::InvalidParam("cid".into()));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(bad.0.to_result().code, 501);

        let missing = ApiError(RegistryError::NotFound("task t".into()).into());
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.0.to_result().code, 502);

        let cdn = ApiError(RegistryError::CdnFail("origin".into()).into());
        assert_eq!(cdn.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(cdn.0.to_result().code, 604);
    }
}
