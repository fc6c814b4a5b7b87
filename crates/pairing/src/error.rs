//! Error types for the pairing core.

use credlink_protocol::ArtifactError;

use crate::policy::CloseReason;
use crate::types::SessionId;

/// Errors raised by a Link Provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider construction failed: {0}")]
    Construction(String),

    #[error("connection closed: {0}")]
    Closed(CloseReason),

    #[error("send failed: {0}")]
    Send(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Maps a stream error to the close reason the reconnect policy sees.
    ///
    /// Known terminal signatures in the error text keep their meaning;
    /// anything else is `unknown`.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Closed(reason) => reason.clone(),
            other => CloseReason::from_error_message(&other.to_string()),
        }
    }
}

/// Errors from a [`SessionStore`](crate::store::SessionStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid lineage key: {0}")]
    InvalidKey(String),
}

/// Errors surfaced by the pairing registry and credential capture.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("link provider unavailable: {0}")]
    ProviderUnavailable(#[source] ProviderError),

    #[error("credential incomplete, missing: {}", .missing.join(", "))]
    IncompleteCredential { missing: Vec<String> },

    #[error("credential delivery failed: {0}")]
    DeliveryFailed(#[source] ProviderError),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("another pairing session is active: {0}")]
    SessionBusy(SessionId),

    #[error("session already closed: {0}")]
    SessionClosed(SessionId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential encoding error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("registry is shutting down")]
    ShuttingDown,
}
