//! Fleet operator error abstractions.

use axum::http::StatusCode;

pub use fleet_core::AppError;

/// An extension trait for the fleet core `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code for this error.
    fn status_code(&self) -> StatusCode;

    /// Translate the given error as an app error and map it into an HTTP status and message.
    fn http(err: anyhow::Error) -> (StatusCode, String);
}

impl AppErrorExt for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::IncompleteFacts { .. } => StatusCode::BAD_REQUEST,
            AppError::Compose(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::LeadershipLost { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RolloutTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::ReloadFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn http(err: anyhow::Error) -> (StatusCode, String) {
        match err.downcast::<Self>() {
            Ok(err) => (err.status_code(), err.to_string()),
            Err(err) => {
                tracing::error!(error = ?err, "internal error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, Self::Ise(err).to_string())
            }
        }
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// Check whether the given error requires the unit to shut down.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ShutdownError>())
}
