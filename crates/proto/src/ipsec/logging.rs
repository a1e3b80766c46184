//! Structured logging for IPsec operations
//!
//! Thin wrappers around `tracing` so every event carries the same field
//! names (`spi`, `seq_num`, `sa`, ...). SPIs are rendered as hex.
//!
//! # Log Levels
//!
//! - **TRACE**: Transform discovery attempts
//! - **DEBUG**: AH/ESP packet processing, dropped packets, SA reclamation
//! - **INFO**: SA and policy installation/removal, lifecycle transitions
//! - **WARN**: Replays, authentication failures (rate-limited)
//!
//! # Example
//!
//! ```no_run
//! use kestrel_proto::ipsec::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("kestrel_proto::ipsec=debug")
//!     .init();
//!
//! logging::log_esp_packet("encrypt", 0x1001, 1, 1400);
//! ```

use crate::ipsec::sadb::{SaId, SaState};
use crate::ipsec::selector::Selector;
use crate::ipsec::spd::PolicyAction;
use crate::ipsec::xform::{DiscoveryOutcome, TransformGroup};
use crate::ipsec::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

fn spi_hex(spi: u32) -> String {
    hex::encode(spi.to_be_bytes())
}

/// Log a transform registration
pub fn log_transform_registered(name: &str, group: TransformGroup) {
    info!(transform = name, group = %group, "Transform registered");
}

/// Log a transform removal
pub fn log_transform_unregistered(name: &str, group: TransformGroup) {
    info!(transform = name, group = %group, "Transform unregistered");
}

/// Log one discovery attempt for a candidate name
pub fn log_discovery(candidate: &str, group: TransformGroup, outcome: DiscoveryOutcome) {
    trace!(
        candidate = candidate,
        group = %group,
        outcome = ?outcome,
        "Transform discovery attempted"
    );
}

/// Log SA installation
///
/// # Arguments
///
/// * `id` - SA identity
/// * `auth` - Authentication transform name, if any
/// * `enc` - Encryption transform name, if any
pub fn log_sa_added(id: &SaId, auth: Option<&str>, enc: Option<&str>) {
    info!(
        sa = %id,
        spi = %spi_hex(id.spi),
        auth = auth.unwrap_or("none"),
        enc = enc.unwrap_or("none"),
        "SA added"
    );
}

/// Log an explicit SA deletion
pub fn log_sa_deleted(id: &SaId) {
    info!(sa = %id, spi = %spi_hex(id.spi), "SA deleted");
}

/// Log an SA lifecycle transition
///
/// # Arguments
///
/// * `id` - SA identity
/// * `from` - Previous state
/// * `to` - New state
pub fn log_sa_state_transition(id: &SaId, from: SaState, to: SaState) {
    info!(
        sa = %id,
        state_from = %from,
        state_to = %to,
        "SA state transition"
    );
}

/// Log that a DEAD SA left the database
pub fn log_sa_reclaimed(id: &SaId) {
    debug!(sa = %id, "SA reclaimed");
}

/// Log policy installation
pub fn log_policy_added(selector: &Selector, action: PolicyAction) {
    info!(selector = %selector, action = %action, "Policy added");
}

/// Log policy removal
pub fn log_policy_deleted(selector: &Selector) {
    info!(selector = %selector, "Policy deleted");
}

/// Log ESP packet processing
///
/// # Arguments
///
/// * `operation` - "encrypt" or "decrypt"
/// * `spi` - Security Parameter Index
/// * `seq` - Sequence number
/// * `payload_len` - Plaintext length in bytes
pub fn log_esp_packet(operation: &str, spi: u32, seq: u32, payload_len: usize) {
    debug!(
        operation = operation,
        spi = %spi_hex(spi),
        seq_num = seq,
        payload_len = payload_len,
        "ESP packet processed"
    );
}

/// Log AH packet processing
///
/// `packet_len` is the packet length after the operation.
pub fn log_ah_packet(operation: &str, spi: u32, seq: u32, packet_len: usize) {
    debug!(
        operation = operation,
        spi = %spi_hex(spi),
        seq_num = seq,
        packet_len = packet_len,
        "AH packet processed"
    );
}

/// Log replay detection
pub fn log_replay_detected(spi: u32, seq: u32) {
    warn!(
        spi = %spi_hex(spi),
        seq_num = seq,
        "Replay detected - packet rejected"
    );
}

/// Log a dropped packet
pub fn log_packet_dropped(direction: &str, error: &Error) {
    debug!(direction = direction, error = %error, "Packet dropped");
}

/// Rate limiter for log lines an attacker can trigger at will
///
/// Emits at most one line per `interval`; lines swallowed in between are
/// counted and reported with the next emitted one.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateLimitedLog {
    /// Limiter allowing one line per `interval`
    pub fn new(interval: Duration) -> Self {
        RateLimitedLog {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Whether a line may be emitted now; returns the number suppressed since
    /// the last emitted line when it may
    pub fn permit(&self) -> Option<u64> {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }

    /// Lines suppressed since the last emitted one
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Log an authentication failure, subject to the rate limit
    pub fn log_auth_failure(&self, spi: u32, reason: &str) {
        if let Some(suppressed) = self.permit() {
            warn!(
                spi = %spi_hex(spi),
                reason = reason,
                suppressed = suppressed,
                "Authentication failed"
            );
        }
    }
}
