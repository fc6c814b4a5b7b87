//! Public types for the pairing lifecycle manager.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use credlink_protocol::LinkStatus;

/// Identity of one linking lineage, stable across its reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh lineage id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a pairing lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, provider not yet asked to link.
    Init,
    /// A QR payload is live and waiting to be scanned.
    AwaitingQr,
    /// A pairing code was handed out and waits to be entered.
    AwaitingCode,
    /// Provider constructed, no QR or code yet.
    Connecting,
    /// Linked.
    Open,
    /// Connection lost, a restart is scheduled.
    ClosedRetrying,
    /// Finished; no further restarts.
    ClosedTerminal,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AwaitingQr => "awaiting_qr",
            Self::AwaitingCode => "awaiting_code",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ClosedRetrying => "closed_retrying",
            Self::ClosedTerminal => "closed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ClosedTerminal)
    }

    /// The coarse status observers see for this state. `AwaitingQr` is
    /// conveyed by `qr` events instead and has no status of its own.
    pub fn link_status(&self) -> Option<LinkStatus> {
        match self {
            Self::Init | Self::AwaitingQr => None,
            Self::Connecting => Some(LinkStatus::Connecting),
            Self::AwaitingCode => Some(LinkStatus::AwaitingCode),
            Self::Open => Some(LinkStatus::Open),
            Self::ClosedRetrying => Some(LinkStatus::ClosedRetrying),
            Self::ClosedTerminal => Some(LinkStatus::ClosedTerminal),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator request to begin (or resume) pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingRequest {
    /// Phone-number-like target. When set, a pairing code is requested.
    pub number: Option<String>,
    /// Reuse this lineage if it is still live.
    pub session_id: Option<SessionId>,
}

impl PairingRequest {
    pub fn qr() -> Self {
        Self::default()
    }

    pub fn code(number: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            session_id: None,
        }
    }
}

/// Strips everything but ASCII digits from an identifier.
///
/// Returns `None` when nothing is left.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

/// What `start` hands back to the operator: a code or an acknowledgment,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    PairingCode { session_id: SessionId, code: String },
    AwaitingQr { session_id: SessionId },
}

impl StartOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::PairingCode { session_id, .. } | Self::AwaitingQr { session_id } => session_id,
        }
    }
}

/// Read-only view of a lineage, published by its driver.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub current_qr: Option<String>,
    pub pairing_code: Option<String>,
    pub attempt_count: u32,
    pub captured_once: bool,
    pub created_at: DateTime<Utc>,
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first restart.
    pub base_delay: Duration,
    /// Maximum delay between restarts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt count (0-based).
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let exp = attempt_count.min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Whether independent lineages may run side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    #[default]
    Parallel,
    /// A new `start` is rejected while another lineage is live.
    SingleActive,
}

/// Tuning knobs for the registry and its sessions.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub reconnect: ReconnectConfig,
    pub concurrency: ConcurrencyMode,
    /// Wait before the single re-check of an incomplete credential bundle.
    pub capture_recheck: Duration,
    /// Wait before asking the provider for a pairing code.
    pub code_request_delay: Duration,
    /// Keep the staged credential after delivery instead of clearing it.
    pub retain_after_delivery: bool,
    /// Answer `ping` with `pong` on open lineages.
    pub liveness_echo: bool,
    /// Per-observer queue depth.
    pub subscriber_buffer: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            concurrency: ConcurrencyMode::default(),
            capture_recheck: Duration::from_secs(3),
            code_request_delay: Duration::from_secs(1),
            retain_after_delivery: false,
            liveness_echo: true,
            subscriber_buffer: 32,
        }
    }
}
