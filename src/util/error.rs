//! Crate-wide error taxonomy and its HTTP projection.
use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

/// The kinds of failure named in the error handling design: static config
/// errors are fatal at startup and never reach this type, everything else
/// that can occur once the process is running funnels through here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no healthy, capable node available")]
    NoCapableNode,

    #[error("transport error talking to worker: {0}")]
    TransportError(String),

    #[error("deadline elapsed")]
    Timeout,

    #[error("worker rejected job graph: {0}")]
    RejectedByWorker(String),

    #[error("missing template parameter: {0}")]
    MissingParameter(String),

    #[error("template does not support adapters: {0}")]
    UnsupportedAdapter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt preference export: {0}")]
    CorruptExport(String),

    #[error("job cancelled")]
    Cancelled,
}

impl OrchestratorError {
    fn kind_tag(&self) -> &'static str {
        match self {
            Self::NoCapableNode => "no_capable_node",
            Self::TransportError(_) => "transport_error",
            Self::Timeout => "timeout",
            Self::RejectedByWorker(_) => "rejected_by_worker",
            Self::MissingParameter(_) => "missing_parameter",
            Self::UnsupportedAdapter(_) => "unsupported_adapter",
            Self::NotFound(_) => "not_found",
            Self::CorruptExport(_) => "corrupt_export",
            Self::Cancelled => "cancelled",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NoCapableNode => StatusCode::SERVICE_UNAVAILABLE,
            Self::TransportError(_) | Self::RejectedByWorker(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::MissingParameter(_) | Self::UnsupportedAdapter(_) | Self::CorruptExport(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Cancelled => StatusCode::CONFLICT,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind_tag(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_handling_design() {
        assert_eq!(
            OrchestratorError::NoCapableNode.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            OrchestratorError::MissingParameter("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrchestratorError::NotFound("job".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn kind_tag_is_stable() {
        assert_eq!(OrchestratorError::Timeout.kind_tag(), "timeout");
        assert_eq!(OrchestratorError::Cancelled.kind_tag(), "cancelled");
    }
}
