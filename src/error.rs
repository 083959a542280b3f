// Error types module

use std::fmt;

/// Centralized error type for the gateway
///
/// Categorizes errors by the stage that produced them so the pipeline can
/// map each category to the right HTTP status code and log level.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Request validation failures (missing/malformed URL, bad client id)
    Validation(String),

    /// Token failures (bad signature, expired, URL mismatch) and
    /// disallowed media extensions
    Forbidden(String),

    /// Unknown short key or unknown route
    NotFound(String),

    /// Admission control rejection (request or bandwidth quota exceeded)
    Admission {
        reason: String,
        /// Seconds until the current window resets
        retry_after: u64,
    },

    /// Upstream transport failures (connect error, timeout) with no
    /// upstream status to pass through
    Upstream(String),

    /// Internal gateway errors (serialization, unexpected state)
    Internal(String),
}

impl GatewayError {
    /// HTTP status code this error maps to at the response boundary
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::Admission { .. } => 429,
            GatewayError::Upstream(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Validation(msg) => write!(f, "Validation error: {}", msg),
            GatewayError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            GatewayError::NotFound(msg) => write!(f, "Not found: {}", msg),
            GatewayError::Admission { reason, .. } => write!(f, "Admission denied: {}", reason),
            GatewayError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_maps_to_400() {
        let err = GatewayError::Validation("missing url parameter".to_string());
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_forbidden_error_maps_to_403() {
        let err = GatewayError::Forbidden("token expired".to_string());
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_not_found_error_maps_to_404() {
        let err = GatewayError::NotFound("unknown short key".to_string());
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_admission_error_maps_to_429() {
        let err = GatewayError::Admission {
            reason: "request quota exceeded".to_string(),
            retry_after: 42,
        };
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn test_upstream_error_maps_to_500() {
        let err = GatewayError::Upstream("connection refused".to_string());
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = GatewayError::Validation("missing url parameter".to_string());
        assert_eq!(err.to_string(), "Validation error: missing url parameter");
    }
}
