//! Reconnect decisions.
//!
//! [`ReconnectPolicy::decide`] is a pure function of the close reason and
//! the lineage's attempt count.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::types::ReconnectConfig;

/// Why a provider connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CloseReason {
    LoggedOut,
    Unauthorized,
    /// Another session took over the linked device.
    Replaced,
    Timeout,
    ConnectionLost,
    ConnectionClosed,
    RestartRequired,
    BadSession,
    ServiceUnavailable,
    RateLimited,
    /// An unmapped numeric status code.
    Other(u16),
    Unknown,
}

/// Whether a close ends the lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Retryable,
    Terminal,
}

impl CloseReason {
    pub fn kind(&self) -> DisconnectKind {
        match self {
            Self::LoggedOut | Self::Unauthorized | Self::Replaced => DisconnectKind::Terminal,
            _ => DisconnectKind::Retryable,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind() == DisconnectKind::Terminal
    }

    /// Maps a provider status code to a reason.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Unauthorized,
            408 => Self::Timeout,
            428 => Self::ConnectionClosed,
            429 => Self::RateLimited,
            440 => Self::Replaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    /// Classifies free-form error text by its known signatures.
    pub fn from_error_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("conflict") || lower.contains("replaced") {
            Self::Replaced
        } else if lower.contains("not-authorized") || lower.contains("unauthorized") {
            Self::Unauthorized
        } else if lower.contains("logged out") || lower.contains("logged-out") {
            Self::LoggedOut
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("connection closed") {
            Self::ConnectionClosed
        } else if lower.contains("connection lost") {
            Self::ConnectionLost
        } else if lower.contains("rate-overlimit") {
            Self::RateLimited
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged-out",
            Self::Unauthorized => "unauthorized",
            Self::Replaced => "replaced",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection-lost",
            Self::ConnectionClosed => "connection-closed",
            Self::RestartRequired => "restart-required",
            Self::BadSession => "bad-session",
            Self::ServiceUnavailable => "service-unavailable",
            Self::RateLimited => "rate-limited",
            Self::Other(_) => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code})"),
            reason => f.write_str(reason.as_str()),
        }
    }
}

impl FromStr for CloseReason {
    type Err = std::convert::Infallible;

    /// Parses a reason name; unrecognized names fall back to signature
    /// matching and finally to `unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "logged-out" => Self::LoggedOut,
            "unauthorized" => Self::Unauthorized,
            "replaced" => Self::Replaced,
            "timeout" => Self::Timeout,
            "connection-lost" => Self::ConnectionLost,
            "connection-closed" => Self::ConnectionClosed,
            "restart-required" => Self::RestartRequired,
            "bad-session" => Self::BadSession,
            "service-unavailable" => Self::ServiceUnavailable,
            "rate-limited" => Self::RateLimited,
            "unknown" => Self::Unknown,
            other => Self::from_error_message(other),
        })
    }
}

/// Outcome of a reconnect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    Retry { delay: Duration },
    Stop,
}

/// Maps close reasons to retry-with-backoff or stop.
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn decide(&self, reason: &CloseReason, attempt_count: u32) -> ReconnectAction {
        match reason.kind() {
            DisconnectKind::Terminal => ReconnectAction::Stop,
            DisconnectKind::Retryable => ReconnectAction::Retry {
                delay: self.config.delay_for_attempt(attempt_count),
            },
        }
    }
}
