//! Gateway error kinds and the drop-log rate limiter
//!
//! The MAC layer branches on error kinds, so they are typed rather than
//! stringly. Policy (enforced by the supervisor):
//! - `Decode`, `MicInvalid`, `ReplayedCounter` are adversarial or noisy and
//!   are dropped silently behind a rate-limited log; they never perturb
//!   counters.
//! - `RadioBusy` is retried on the next tick.
//! - `JoinFailed` and `StoreCorrupt` re-enter the unjoined state.
//! - `CloudUnavailable` queues the uplink for bounded retry; never fatal.

use std::collections::HashMap;

use thiserror::Error;

use crate::lorawan::DecodeError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Frame did not parse; see [`DecodeError`] for the cause.
    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Message integrity check failed against the expected session key.
    #[error("message integrity check failed")]
    MicInvalid,

    /// Frame counter (or join nonce) at or behind the last accepted value.
    #[error("replayed counter value {0}")]
    ReplayedCounter(u16),

    /// No provisioned keys or live session for the addressed device.
    #[error("unknown device")]
    UnknownDevice,

    /// The radio rejected a transmit request.
    #[error("radio busy")]
    RadioBusy,

    /// The radio collaborator failed outside its send path.
    #[error("radio receive failed")]
    RadioTimeout,

    /// OTAA join gave up after exhausting its retry budget.
    #[error("join failed: {0}")]
    JoinFailed(&'static str),

    /// A confirmed uplink never saw its ACK within the retry budget.
    #[error("no acknowledgement after {0} transmissions")]
    AckMissing(u8),

    /// The network server could not be reached or answered out of contract.
    #[error("network server unavailable: {0}")]
    CloudUnavailable(String),

    /// The persisted key store failed to load.
    #[error("key store corrupt: {0}")]
    StoreCorrupt(String),
}

impl GatewayError {
    /// Stable tag used for structured log fields and drop-log keying.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Decode(_) => "decode",
            GatewayError::MicInvalid => "mic-invalid",
            GatewayError::ReplayedCounter(_) => "replayed-counter",
            GatewayError::UnknownDevice => "unknown-device",
            GatewayError::RadioBusy => "radio-busy",
            GatewayError::RadioTimeout => "radio-timeout",
            GatewayError::JoinFailed(_) => "join-failed",
            GatewayError::AckMissing(_) => "ack-missing",
            GatewayError::CloudUnavailable(_) => "cloud-unavailable",
            GatewayError::StoreCorrupt(_) => "store-corrupt",
        }
    }

    /// Kinds that are dropped without propagating (after a rate-limited log).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            GatewayError::Decode(_) | GatewayError::MicInvalid | GatewayError::ReplayedCounter(_)
        )
    }
}

/// Per-kind rate limiter for the silent-drop log events.
///
/// Adversarial traffic can produce a MIC failure per received frame; logging
/// each one would drown the interesting events. At most one log line per kind
/// per interval, with a count of what was suppressed in between.
#[derive(Debug)]
pub struct DropLog {
    interval_ms: u64,
    kinds: HashMap<&'static str, DropState>,
}

#[derive(Debug)]
struct DropState {
    last_emit_ms: u64,
    suppressed: u32,
}

impl DropLog {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms, kinds: HashMap::new() }
    }

    /// Returns `Some(suppressed_since_last_emit)` when the caller should log
    /// this occurrence, `None` when it should stay quiet.
    pub fn permit(&mut self, now_ms: u64, kind: &'static str) -> Option<u32> {
        match self.kinds.get_mut(kind) {
            None => {
                self.kinds.insert(kind, DropState { last_emit_ms: now_ms, suppressed: 0 });
                Some(0)
            }
            Some(state) if now_ms.saturating_sub(state.last_emit_ms) >= self.interval_ms => {
                let suppressed = state.suppressed;
                state.last_emit_ms = now_ms;
                state.suppressed = 0;
                Some(suppressed)
            }
            Some(state) => {
                state.suppressed += 1;
                None
            }
        }
    }
}
