use tokio_tungstenite::tungstenite;

use credlink_pairing::StoreError;
use credlink_protocol::{ArtifactError, PayloadError};

/// Errors from the sidecar bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("bridge connection closed")]
    Closed,

    #[error("sidecar error {code}: {message}")]
    Sidecar { code: i32, message: String },

    #[error("response missing payload")]
    EmptyResponse,

    #[error("open event without an account identity")]
    MissingIdentity,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential encoding error: {0}")]
    Artifact(#[from] ArtifactError),
}

impl From<PayloadError> for BridgeError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Missing => BridgeError::EmptyResponse,
            PayloadError::Malformed(e) => BridgeError::Json(e),
        }
    }
}
