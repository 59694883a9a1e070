//! Error taxonomy and JSON error responses for the gateway

use crate::launcher::LaunchError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for client-facing gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing, invalid or expired credential
    Unauthenticated,
    /// Session backend failed to launch
    SessionLaunchFailed,
    /// Session backend did not become ready in time
    SessionStartTimeout,
    /// Too many sessions launching at once
    CapacityExceeded,
    /// Session backend could not be reached
    BackendUnavailable,
    /// Session backend returned a broken response
    BackendError,
    /// Session backend did not answer in time
    RequestTimeout,
    /// Request body exceeds the configured limit
    PayloadTooLarge,
    /// Session is being terminated (sign-out, idle reap)
    SessionClosing,
    /// Gateway is shutting down
    ShuttingDown,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::SessionLaunchFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::SessionStartTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::BackendError => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayErrorCode::SessionClosing => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthenticated => "UNAUTHENTICATED",
            GatewayErrorCode::SessionLaunchFailed => "SESSION_LAUNCH_FAILED",
            GatewayErrorCode::SessionStartTimeout => "SESSION_START_TIMEOUT",
            GatewayErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            GatewayErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            GatewayErrorCode::BackendError => "BACKEND_ERROR",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayErrorCode::SessionClosing => "SESSION_CLOSING",
            GatewayErrorCode::ShuttingDown => "SHUTTING_DOWN",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Failures while serving a proxied request
///
/// The `Display` text is for logs. Clients only ever see
/// [`GatewayError::public_message`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("session launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("backend unreachable at {endpoint}: {source}")]
    BackendUnreachable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend protocol error: {0}")]
    Backend(#[from] hyper::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Launch(e) => match e {
                LaunchError::CapacityExceeded { .. } => GatewayErrorCode::CapacityExceeded,
                LaunchError::ReadinessTimeout { .. } => GatewayErrorCode::SessionStartTimeout,
                LaunchError::Draining => GatewayErrorCode::SessionClosing,
                LaunchError::ShuttingDown => GatewayErrorCode::ShuttingDown,
                _ => GatewayErrorCode::SessionLaunchFailed,
            },
            GatewayError::BackendUnreachable { .. } => GatewayErrorCode::BackendUnavailable,
            GatewayError::Backend(_) => GatewayErrorCode::BackendError,
            GatewayError::Timeout(_) => GatewayErrorCode::RequestTimeout,
        }
    }

    /// Message safe to show to clients (no paths, pids or ports)
    pub fn public_message(&self) -> &'static str {
        match self.code() {
            GatewayErrorCode::CapacityExceeded => "Too many sessions are starting, please retry shortly",
            GatewayErrorCode::SessionStartTimeout => "Session did not start in time",
            GatewayErrorCode::SessionLaunchFailed => "Session could not be started",
            GatewayErrorCode::BackendUnavailable => "Session is unavailable",
            GatewayErrorCode::BackendError => "Session returned an invalid response",
            GatewayErrorCode::RequestTimeout => "Session did not respond in time",
            GatewayErrorCode::SessionClosing => "Session is closing, please retry shortly",
            GatewayErrorCode::ShuttingDown => "Server is shutting down",
            _ => "Internal error",
        }
    }

    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayErrorCode::SessionClosing.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayErrorCode::CapacityExceeded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayErrorCode::BackendError.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GatewayErrorCode::Unauthenticated, "Authentication required");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNAUTHENTICATED\""));
        assert!(json.contains("\"message\":\"Authentication required\""));
        assert!(json.contains("\"status\":401"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::SessionStartTimeout, "slow");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "SESSION_START_TIMEOUT"
        );
    }

    #[test]
    fn test_launch_errors_are_distinguishable() {
        let capacity = GatewayError::from(LaunchError::CapacityExceeded { limit: 1 });
        let timeout = GatewayError::from(LaunchError::ReadinessTimeout { timeout_ms: 50 });
        let spawn = GatewayError::from(LaunchError::Spawn("exec failed".to_string()));

        assert_eq!(capacity.code(), GatewayErrorCode::CapacityExceeded);
        assert_eq!(timeout.code(), GatewayErrorCode::SessionStartTimeout);
        assert_eq!(spawn.code(), GatewayErrorCode::SessionLaunchFailed);
        for err in [&capacity, &timeout, &spawn] {
            assert_eq!(err.to_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[test]
    fn test_draining_session_is_not_a_shutdown() {
        let closing = GatewayError::from(LaunchError::Draining);
        assert_eq!(closing.code(), GatewayErrorCode::SessionClosing);
        assert_eq!(closing.public_message(), "Session is closing, please retry shortly");
        assert_eq!(
            closing.to_response().headers().get(X_GATEWAY_ERROR).unwrap(),
            "SESSION_CLOSING"
        );

        let shutdown = GatewayError::from(LaunchError::ShuttingDown);
        assert_eq!(shutdown.code(), GatewayErrorCode::ShuttingDown);
        assert_eq!(shutdown.public_message(), "Server is shutting down");
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = GatewayError::BackendUnreachable {
            endpoint: "/run/sessions/alice-1.sock".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("alice-1.sock"));
        assert!(!err.public_message().contains("alice"));

        let err = GatewayError::Timeout(Duration::from_secs(3));
        assert_eq!(err.code(), GatewayErrorCode::RequestTimeout);
    }
}
