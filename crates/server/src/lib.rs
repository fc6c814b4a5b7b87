//! WebSocket server for pairing observers and operators.
//!
//! Every connection speaks the same JSON envelope protocol: operators
//! start, inspect and abort lineages, and observers `watch` a lineage to
//! receive its `qr` and `status` events on the same socket.

mod connection;
mod control;
mod handler;
mod server;

pub use connection::{ClientConnection, ConnectionId, SendError, Sender};
pub use control::PairingHandler;
pub use handler::{Handler, HandlerFuture};
pub use server::{PairingServer, ServerConfig};

/// Send buffer capacity per connection.
///
/// Observers receive one frame per QR rotation or status change, so a
/// connection that falls this far behind is treated as gone.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server shutting down")]
    ShuttingDown,
}
