pub mod artifact;
pub mod constants;
pub mod envelope;
pub mod events;
pub mod messages;

// Re-export primary types for convenience.
pub use artifact::{ArtifactError, CredentialArtifact, CredentialValue};
pub use constants::MessageType;
pub use envelope::{ErrorBody, Message, PayloadError};
pub use events::{LinkStatus, ObserverEvent};
