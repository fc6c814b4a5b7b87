use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Keep-alive period for observer and sidecar sockets.
///
/// Idle observers only ever receive pings between QR rotations, so this
/// has to stay well under common proxy idle timeouts (60s).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum message size in bytes (4 MB).
///
/// Credential documents are the largest frames on the wire and stay far
/// below this.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Timeout for request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// File name used for the delivered credential document.
pub const CREDENTIAL_FILE_NAME: &str = "creds.json";

/// MIME type of the delivered credential document.
pub const CREDENTIAL_MIME_TYPE: &str = "application/json";

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Operator control surface
    #[serde(rename = "start_pairing")]
    StartPairing,
    #[serde(rename = "pairing_started")]
    PairingStarted,
    #[serde(rename = "abort_pairing")]
    AbortPairing,
    #[serde(rename = "pairing_aborted")]
    PairingAborted,
    #[serde(rename = "get_session")]
    GetSession,
    #[serde(rename = "session_info")]
    SessionInfo,

    // Observer subscriptions
    #[serde(rename = "watch")]
    Watch,
    #[serde(rename = "watching")]
    Watching,
    #[serde(rename = "unwatch")]
    Unwatch,
    #[serde(rename = "unwatched")]
    Unwatched,

    // Link sidecar requests
    #[serde(rename = "link_begin")]
    LinkBegin,
    #[serde(rename = "link_begun")]
    LinkBegun,
    #[serde(rename = "send_message")]
    SendMessage,
    #[serde(rename = "delivery_receipt")]
    DeliveryReceipt,
    #[serde(rename = "link_close")]
    LinkClose,

    // Link sidecar push events
    #[serde(rename = "qr")]
    Qr,
    #[serde(rename = "creds_update")]
    CredsUpdate,
    #[serde(rename = "connection_update")]
    ConnectionUpdate,
    #[serde(rename = "incoming_message")]
    IncomingMessage,

    // Shared
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_GONE: i32 = 410;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_UNAVAILABLE: i32 = 503;
