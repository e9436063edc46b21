#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed or self-contradicting input, rejected before any state was touched
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    /// The operation is not allowed in the current lifecycle or signaling state
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// No compatible configuration could be found while applying a description. Nothing was changed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The peer connection was closed before the operation completed
    #[error("peer connection was closed")]
    Shutdown,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error reported by one of the transport collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error {code}: {reason}")]
pub struct TransportError {
    pub code: u16,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}
