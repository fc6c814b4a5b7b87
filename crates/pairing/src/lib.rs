//! Pairing lifecycle manager.
//!
//! Drives device-linking lineages through a Link Provider, fans their QR
//! and status events out to observers, retries recoverable disconnects
//! with backoff, and delivers the captured credential exactly once.

pub mod capture;
pub mod error;
pub mod hub;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{CredentialBundle, CredentialCapture};
pub use error::{PairingError, ProviderError, StoreError};
pub use hub::{BroadcastHub, HubSnapshot, SubscriberId, Subscription};
pub use policy::{CloseReason, DisconnectKind, ReconnectAction, ReconnectPolicy};
pub use provider::{
    DeliveryReceipt, LinkProvider, LinkProviderFactory, ProviderConnection, ProviderEvent,
    ProviderEvents, ProviderFuture,
};
pub use registry::SessionRegistry;
pub use session::{OpenTransition, PairingSession};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, default_store_dir};
pub use types::{
    ConcurrencyMode, PairingConfig, PairingRequest, ReconnectConfig, SessionId, SessionSnapshot,
    SessionState, StartOutcome, normalize_identifier,
};
