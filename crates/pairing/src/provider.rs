//! The Link Provider boundary.
//!
//! The linking handshake itself lives behind these traits. A factory builds
//! one provider connection per attempt; the connection yields the provider
//! handle plus the attempt's event stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use credlink_protocol::messages::OutboundContent;

use crate::error::ProviderError;
use crate::policy::CloseReason;
use crate::store::SessionStore;
use crate::types::SessionId;

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One event from a provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A fresh QR payload; supersedes the previous one.
    Qr(String),
    /// The device is linked.
    Open { identity: String },
    /// The attempt ended.
    Close(CloseReason),
    /// Inbound text from the linked account.
    Message { from: String, text: String },
}

/// Acknowledgment from the provider's send primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// A live linking attempt.
pub trait LinkProvider: Send + Sync + 'static {
    /// Starts linking. With an identifier, returns the pairing code to show
    /// the user if the account is not yet registered.
    fn begin_link<'a>(
        &'a self,
        identifier: Option<&'a str>,
    ) -> ProviderFuture<'a, Result<Option<String>, ProviderError>>;

    /// Credential field names that must be present before delivery.
    fn required_fields(&self) -> Vec<String>;

    fn send<'a>(
        &'a self,
        target: &'a str,
        content: OutboundContent,
    ) -> ProviderFuture<'a, Result<DeliveryReceipt, ProviderError>>;

    /// Tears the attempt down. Safe to call more than once.
    fn close(&self) -> ProviderFuture<'_, ()>;

    /// The lineage's credential has been delivered and cleared. Later
    /// credential updates must not be staged again.
    fn credentials_delivered(&self) {}
}

/// Event stream of one attempt. Ends, or yields an error, when the
/// underlying connection is gone.
pub type ProviderEvents = mpsc::Receiver<Result<ProviderEvent, ProviderError>>;

pub struct ProviderConnection {
    pub provider: Arc<dyn LinkProvider>,
    pub events: ProviderEvents,
}

/// Builds provider connections for a lineage.
///
/// The store handle is the provider's persistence target for credential
/// updates.
pub trait LinkProviderFactory: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        session_id: &'a SessionId,
        store: Arc<dyn SessionStore>,
    ) -> ProviderFuture<'a, Result<ProviderConnection, ProviderError>>;
}
