//! Fleet error abstractions.

use thiserror::Error;

use crate::facts::Role;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// A unit's published facts do not yet satisfy the required key set of its role.
    ///
    /// The unit is skipped for the current pass; this is not fatal.
    #[error("incomplete facts from unit {unit}, missing or invalid keys: {}", missing.join(", "))]
    IncompleteFacts { unit: String, missing: Vec<String> },
    /// A configuration document could not be composed. The previous document stays in effect.
    #[error("error composing cluster configuration: {0}")]
    Compose(String),
    /// A rollout step's targets did not acknowledge within the ack timeout after all retries.
    #[error("rollout step for role {role} timed out waiting on generation {generation} after {attempts} attempts")]
    RolloutTimeout { role: Role, generation: u64, attempts: u32 },
    /// Primary status was lost while work was in flight.
    #[error("leadership lost during term {term}")]
    LeadershipLost { term: u64 },
    /// A target reported that applying a configuration generation failed.
    #[error("unit {unit} failed to apply generation {generation}: {message}")]
    ReloadFailed { unit: String, generation: u64, message: String },
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// An internal error was hit, but the process will remain online.
    #[error("internal error")]
    Ise(anyhow::Error),
}

/// A result type where the error is an `AppError`.
pub type AppResult<T> = ::std::result::Result<T, AppError>;
