use blackboard_client::BlackboardError;
use thiserror::Error;

/// Errors surfaced by the composer. None of them is fatal to the tick loop.
#[derive(Debug, Error, Clone)]
pub enum ComposerError {
    /// A descriptor, context or parameter payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A required live value is not populated yet or has gone stale.
    #[error("binding unavailable: {0}")]
    BindingUnavailable(String),
    /// No destination could be resolved or provisioned.
    #[error("provisioning failed: {0}")]
    Provision(String),
    /// Envelope tables do not intersect.
    #[error("envelope intersection failed: {0}")]
    Intersection(String),
    /// Transport failure.
    #[error(transparent)]
    Blackboard(#[from] BlackboardError),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type ComposerResult<T> = Result<T, ComposerError>;

impl From<serde_json::Error> for ComposerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
