use std::time::Duration;

use press_limit::Reason;
use press_limit::RouteClass;

/// Errors produced by the admission middleware stack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// Backpressure decided the request must not proceed.
    ///
    /// The caller should back off and retry later.
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Request to '{route}' rejected: {reason}")]
    OverloadRejected {
        /// The route class the request was admitted against.
        route: RouteClass,
        reason: Reason,
    },

    /// Handling the request, including any backoff delay, exceeded the request timeout.
    ///
    /// When the `axum` feature is enabled, this converts to `504 Gateway Timeout`.
    #[error("Request to '{route}' timed out after {timeout:?}")]
    TimeoutExceeded {
        route: RouteClass,
        timeout: Duration,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl AdmissionError {
    /// Overload and timeouts are transient; retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OverloadRejected { .. } | Self::TimeoutExceeded { .. }
        )
    }

    /// The suggested wait before a retry, if there is one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::OverloadRejected { reason, .. } => Some(reason.retry_after()),
            _ => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmissionError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, headers) = match &self {
            Self::OverloadRejected { reason, .. } => {
                // Retry-After only carries whole seconds.
                let secs = reason.retry_after().as_secs_f64().ceil().max(1.0) as u64;
                let val = axum::http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Some((axum::http::header::RETRY_AFTER, val)),
                )
            }
            Self::TimeoutExceeded { .. } => (StatusCode::GATEWAY_TIMEOUT, None),
            Self::Inner(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let mut response = (status, self.to_string()).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
