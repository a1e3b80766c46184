//! Metrics for IPsec operations
//!
//! Counters and gauges for the packet paths and the control plane. All
//! metrics use atomic operations; clones share the same counters.
//!
//! # Example
//!
//! ```
//! use kestrel_proto::ipsec::metrics::IpsecMetrics;
//!
//! let metrics = IpsecMetrics::new();
//!
//! metrics.record_esp_encrypted(1400);
//! metrics.record_sa_added();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.esp_packets_encrypted, 1);
//! assert_eq!(snapshot.sa_added, 1);
//! ```

use crate::ipsec::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// IPsec metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct IpsecMetrics {
    /// ESP packets encrypted
    pub esp_packets_encrypted: Arc<AtomicU64>,

    /// Plaintext bytes encrypted via ESP
    pub esp_bytes_encrypted: Arc<AtomicU64>,

    /// ESP packets decrypted and accepted by the processor
    pub esp_packets_decrypted: Arc<AtomicU64>,

    /// Plaintext bytes recovered from ESP
    pub esp_bytes_decrypted: Arc<AtomicU64>,

    /// AH headers generated
    pub ah_packets_generated: Arc<AtomicU64>,

    /// AH headers verified
    pub ah_packets_verified: Arc<AtomicU64>,

    /// Inbound packets accepted by policy
    pub packets_accepted: Arc<AtomicU64>,

    /// Drops: ICV mismatch
    pub drops_auth: Arc<AtomicU64>,

    /// Drops: replayed sequence number
    pub drops_replay: Arc<AtomicU64>,

    /// Drops: no usable SA
    pub drops_sa_not_found: Arc<AtomicU64>,

    /// Drops: policy said drop, or packet did not match its policy
    pub drops_policy: Arc<AtomicU64>,

    /// Drops: bad ciphertext or header layout
    pub drops_malformed: Arc<AtomicU64>,

    /// Drops: anything else
    pub drops_other: Arc<AtomicU64>,

    /// SAs installed
    pub sa_added: Arc<AtomicU64>,

    /// SAs explicitly deleted
    pub sa_deleted: Arc<AtomicU64>,

    /// SAs that reached DEAD through a lifetime limit
    pub sa_expired: Arc<AtomicU64>,

    /// SAs currently in the database
    pub sa_active: Arc<AtomicU64>,

    /// Policies currently installed
    pub policies_active: Arc<AtomicU64>,
}

impl IpsecMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record ESP packet encrypted
    ///
    /// # Arguments
    ///
    /// * `bytes` - Plaintext bytes encrypted
    pub fn record_esp_encrypted(&self, bytes: usize) {
        self.esp_packets_encrypted.fetch_add(1, Ordering::Relaxed);
        self.esp_bytes_encrypted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record ESP packet decrypted
    ///
    /// # Arguments
    ///
    /// * `bytes` - Plaintext bytes recovered
    pub fn record_esp_decrypted(&self, bytes: usize) {
        self.esp_packets_decrypted.fetch_add(1, Ordering::Relaxed);
        self.esp_bytes_decrypted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record AH header generated
    pub fn record_ah_generated(&self) {
        self.ah_packets_generated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record AH header verified
    pub fn record_ah_verified(&self) {
        self.ah_packets_verified.fetch_add(1, Ordering::Relaxed);
    }

    /// Record inbound packet accepted
    pub fn record_accepted(&self) {
        self.packets_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped packet under the counter for its error kind
    pub fn record_drop(&self, error: &Error) {
        let counter = match error {
            Error::AuthenticationFailed(_) => &self.drops_auth,
            Error::ReplayDetected(_) => &self.drops_replay,
            Error::SaNotFound(_) | Error::InvalidSpi(_) => &self.drops_sa_not_found,
            Error::PolicyDrop(_) | Error::PolicyMismatch(_) => &self.drops_policy,
            Error::MalformedCiphertext(_)
            | Error::InvalidPacket(_)
            | Error::InvalidLength { .. }
            | Error::BufferTooShort { .. } => &self.drops_malformed,
            _ => &self.drops_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA installed
    pub fn record_sa_added(&self) {
        self.sa_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA explicitly deleted
    pub fn record_sa_deleted(&self) {
        self.sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA expired by lifetime
    pub fn record_sa_expired(&self) {
        self.sa_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the SA gauge
    pub fn set_sa_active(&self, n: usize) {
        self.sa_active.store(n as u64, Ordering::Relaxed);
    }

    /// Set the policy gauge
    pub fn set_policies_active(&self, n: usize) {
        self.policies_active.store(n as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across metrics due to concurrent updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            esp_packets_encrypted: self.esp_packets_encrypted.load(Ordering::Relaxed),
            esp_bytes_encrypted: self.esp_bytes_encrypted.load(Ordering::Relaxed),
            esp_packets_decrypted: self.esp_packets_decrypted.load(Ordering::Relaxed),
            esp_bytes_decrypted: self.esp_bytes_decrypted.load(Ordering::Relaxed),
            ah_packets_generated: self.ah_packets_generated.load(Ordering::Relaxed),
            ah_packets_verified: self.ah_packets_verified.load(Ordering::Relaxed),
            packets_accepted: self.packets_accepted.load(Ordering::Relaxed),
            drops_auth: self.drops_auth.load(Ordering::Relaxed),
            drops_replay: self.drops_replay.load(Ordering::Relaxed),
            drops_sa_not_found: self.drops_sa_not_found.load(Ordering::Relaxed),
            drops_policy: self.drops_policy.load(Ordering::Relaxed),
            drops_malformed: self.drops_malformed.load(Ordering::Relaxed),
            drops_other: self.drops_other.load(Ordering::Relaxed),
            sa_added: self.sa_added.load(Ordering::Relaxed),
            sa_deleted: self.sa_deleted.load(Ordering::Relaxed),
            sa_expired: self.sa_expired.load(Ordering::Relaxed),
            sa_active: self.sa_active.load(Ordering::Relaxed),
            policies_active: self.policies_active.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.esp_packets_encrypted,
            &self.esp_bytes_encrypted,
            &self.esp_packets_decrypted,
            &self.esp_bytes_decrypted,
            &self.ah_packets_generated,
            &self.ah_packets_verified,
            &self.packets_accepted,
            &self.drops_auth,
            &self.drops_replay,
            &self.drops_sa_not_found,
            &self.drops_policy,
            &self.drops_malformed,
            &self.drops_other,
            &self.sa_added,
            &self.sa_deleted,
            &self.sa_expired,
            &self.sa_active,
            &self.policies_active,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time snapshot of all IPsec metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// ESP packets encrypted
    pub esp_packets_encrypted: u64,
    /// Plaintext bytes encrypted via ESP
    pub esp_bytes_encrypted: u64,
    /// ESP packets decrypted
    pub esp_packets_decrypted: u64,
    /// Plaintext bytes recovered from ESP
    pub esp_bytes_decrypted: u64,
    /// AH headers generated
    pub ah_packets_generated: u64,
    /// AH headers verified
    pub ah_packets_verified: u64,
    /// Inbound packets accepted
    pub packets_accepted: u64,
    /// Drops: ICV mismatch
    pub drops_auth: u64,
    /// Drops: replay
    pub drops_replay: u64,
    /// Drops: no usable SA
    pub drops_sa_not_found: u64,
    /// Drops: policy
    pub drops_policy: u64,
    /// Drops: malformed
    pub drops_malformed: u64,
    /// Drops: other
    pub drops_other: u64,
    /// SAs installed
    pub sa_added: u64,
    /// SAs deleted
    pub sa_deleted: u64,
    /// SAs expired
    pub sa_expired: u64,
    /// SAs in the database
    pub sa_active: u64,
    /// Policies installed
    pub policies_active: u64,
}

impl MetricsSnapshot {
    /// Total dropped packets
    pub fn drops_total(&self) -> u64 {
        self.drops_auth
            + self.drops_replay
            + self.drops_sa_not_found
            + self.drops_policy
            + self.drops_malformed
            + self.drops_other
    }

    /// Calculate average encrypted payload size in bytes
    pub fn avg_encrypted_packet_size(&self) -> f64 {
        if self.esp_packets_encrypted == 0 {
            return 0.0;
        }
        self.esp_bytes_encrypted as f64 / self.esp_packets_encrypted as f64
    }

    /// Calculate average decrypted payload size in bytes
    pub fn avg_decrypted_packet_size(&self) -> f64 {
        if self.esp_packets_decrypted == 0 {
            return 0.0;
        }
        self.esp_bytes_decrypted as f64 / self.esp_packets_decrypted as f64
    }
}
