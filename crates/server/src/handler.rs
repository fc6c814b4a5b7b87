//! Handler trait for processing control-surface messages.
//!
//! Implementors provide the pairing logic while the server framework
//! handles connection management and routing.

use std::future::Future;
use std::pin::Pin;

use credlink_protocol::MessageType;
use credlink_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use credlink_protocol::envelope::Message;

use crate::connection::{ConnectionId, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from operators and observers.
///
/// Each method receives the connection's [`Sender`] and the parsed
/// envelope. Default implementations reply with "not implemented".
pub trait Handler: Send + Sync + 'static {
    /// Called for `start_pairing`.
    fn on_start_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for `watch`.
    fn on_watch(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `unwatch`.
    fn on_unwatch(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `abort_pairing`.
    fn on_abort_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `get_session`.
    fn on_get_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called once a connection is gone (cleanup hook).
    fn on_disconnected(&self, conn: ConnectionId) -> HandlerFuture<'_> {
        let _ = conn;
        Box::pin(async {})
    }
}

fn not_implemented(sender: Sender, msg: Message) -> HandlerFuture<'static> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}
