//! Observer events.
//!
//! Observers never see error detail, only these coarse events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse pairing status as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    Connecting,
    AwaitingCode,
    Open,
    ClosedRetrying,
    ClosedTerminal,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingCode => "awaiting-code",
            Self::Open => "open",
            Self::ClosedRetrying => "closed-retrying",
            Self::ClosedTerminal => "closed-terminal",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event pushed to observers: `{"type":"qr"|"status","value":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ObserverEvent {
    Qr(String),
    Status(LinkStatus),
}
