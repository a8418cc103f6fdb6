//! Unified error taxonomy for wakegate.
//!
//! Every client-visible failure mode in the gateway maps to one of these
//! variants; `status_code` is the single place that encodes the mapping from
//! spec ("RouteNotFound -> 404", "StartFailed -> 503", ...).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No hostname/port route matches the inbound request.
    #[error("no route for {0}")]
    RouteNotFound(String),

    /// The start command failed or exited non-zero.
    #[error("service {service} failed to start: {detail}")]
    StartFailed { service: String, detail: String },

    /// Health probing did not succeed within `startTimeout`.
    #[error("service {0} did not become healthy before startTimeout elapsed")]
    HealthTimeout(String),

    /// Waiting for a `stopping -> offline` transition exceeded the hard cap.
    #[error("service {0} did not finish stopping in time")]
    StopTimeout(String),

    /// Upstream connect/transport failure before any response bytes were sent.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream failed after the response was already committed to the client.
    #[error("upstream failed mid-stream: {0}")]
    UpstreamMidStream(String),

    /// Client disconnected; never surfaced to logs at error level.
    #[error("client aborted the connection")]
    ClientAborted,

    /// Config file failed validation; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Request body exceeded the buffering cap.
    #[error("request body too large")]
    PayloadTooLarge,

    /// Admin-plane IP allowlist rejected the caller.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Admin-plane bearer token missing or invalid.
    #[error("unauthorized")]
    Unauthorized,

    /// Admin-plane request referenced an unknown service name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Admin-plane state transition request is invalid for the current status.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status code this error maps to, per the spec's error table.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) | Self::UnknownService(_) => StatusCode::NOT_FOUND,
            Self::StartFailed { .. } | Self::HealthTimeout(_) | Self::StopTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::UpstreamMidStream(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ClientAborted => StatusCode::OK,
        }
    }

    /// True for the one kind that must never be logged at error level.
    pub const fn is_client_aborted(&self) -> bool {
        matches!(self, Self::ClientAborted)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_client_aborted() {
            // The connection is already gone; nothing to write.
            return StatusCode::OK.into_response();
        }
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            Error::RouteNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::StartFailed {
                service: "a".into(),
                detail: "boom".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::HealthTimeout("a".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::StopTimeout("a".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::UpstreamUnreachable("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn client_aborted_is_never_an_error_response() {
        assert!(Error::ClientAborted.is_client_aborted());
    }
}
