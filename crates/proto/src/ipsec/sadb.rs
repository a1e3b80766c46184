//! Security Association Database (SADB)
//!
//! Keyed store of Security Associations. Each SA carries its algorithm
//! bindings and keys (immutable after creation) plus a block of mutable
//! state (chaining IV, replay window, counters, lifecycle state) behind a
//! per-SA lock.
//!
//! # Lifecycle
//!
//! ```text
//!   MATURE ──soft limit──► DYING ──hard limit──► DEAD
//!      │                                          ▲
//!      └──────────────── delete_sa ───────────────┘
//! ```
//!
//! Transitions only move forward. Every processor treats a DEAD SA as
//! absent, but its identity keeps resolving so its final state and counters
//! stay visible. An SA removed with [`Sadb::remove`] leaves the table once
//! the last handle is returned through [`Sadb::release`]; one that expired
//! through its lifetime stays until it is deleted or swept by [`Sadb::reap`].

use crate::ipsec::replay::ReplayWindow;
use crate::ipsec::selector::prefix_contains;
use crate::ipsec::xform::{CipherContext, DigestContext};
use crate::ipsec::{logging, Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// IPsec protocol of an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpsecProtocol {
    /// Encapsulating Security Payload (protocol 50)
    Esp,
    /// Authentication Header (protocol 51)
    Ah,
}

impl IpsecProtocol {
    /// IP protocol number
    pub fn number(self) -> u8 {
        match self {
            IpsecProtocol::Esp => 50,
            IpsecProtocol::Ah => 51,
        }
    }

    /// Protocol for an IP protocol number
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            50 => Some(IpsecProtocol::Esp),
            51 => Some(IpsecProtocol::Ah),
            _ => None,
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpsecProtocol::Esp => f.write_str("esp"),
            IpsecProtocol::Ah => f.write_str("ah"),
        }
    }
}

/// SA identity: destination prefix, protocol and SPI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaId {
    /// Destination address
    pub dst: Ipv6Addr,
    /// Destination prefix length (128 for a host)
    pub prefix_len: u8,
    /// AH or ESP
    pub protocol: IpsecProtocol,
    /// Security Parameters Index (chosen by the receiver)
    pub spi: u32,
}

impl SaId {
    /// Host identity (/128)
    pub fn new(dst: Ipv6Addr, protocol: IpsecProtocol, spi: u32) -> Self {
        SaId {
            dst,
            prefix_len: 128,
            protocol,
            spi,
        }
    }

    /// Widen the destination to a prefix
    pub fn with_prefix(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }

    /// Whether this identity answers for `other` (same protocol and SPI,
    /// destination inside this prefix)
    pub fn covers(&self, other: &SaId) -> bool {
        self.protocol == other.protocol
            && self.spi == other.spi
            && prefix_contains(self.dst, self.prefix_len, other.dst)
    }
}

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/0x{:08x}@{}/{}",
            self.protocol, self.spi, self.dst, self.prefix_len
        )
    }
}

/// SA lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SaState {
    /// In normal use
    Mature,
    /// Soft limit reached; still usable, should be replaced
    Dying,
    /// Hard limit reached or deleted; unusable
    Dead,
}

impl fmt::Display for SaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaState::Mature => f.write_str("MATURE"),
            SaState::Dying => f.write_str("DYING"),
            SaState::Dead => f.write_str("DEAD"),
        }
    }
}

/// SA lifetime limits
///
/// Soft limits move an SA to DYING, hard limits to DEAD. Byte and time
/// limits are independent; whichever is reached first applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaLifetime {
    /// Soft byte limit
    pub soft_bytes: Option<u64>,
    /// Hard byte limit
    pub hard_bytes: Option<u64>,
    /// Soft time limit (age since installation)
    pub soft_time: Option<Duration>,
    /// Hard time limit
    pub hard_time: Option<Duration>,
}

impl SaLifetime {
    /// No limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Set byte limits
    pub fn with_byte_limits(mut self, soft: u64, hard: u64) -> Result<Self> {
        if soft > hard {
            return Err(Error::InvalidParameter(
                "Soft byte limit must not exceed hard byte limit".into(),
            ));
        }
        self.soft_bytes = Some(soft);
        self.hard_bytes = Some(hard);
        Ok(self)
    }

    /// Set time limits
    pub fn with_time_limits(mut self, soft: Duration, hard: Duration) -> Result<Self> {
        if soft > hard {
            return Err(Error::InvalidParameter(
                "Soft lifetime must not exceed hard lifetime".into(),
            ));
        }
        self.soft_time = Some(soft);
        self.hard_time = Some(hard);
        Ok(self)
    }

    /// Check soft <= hard where both are set
    pub fn validate(&self) -> Result<()> {
        if let (Some(soft), Some(hard)) = (self.soft_bytes, self.hard_bytes) {
            if soft > hard {
                return Err(Error::InvalidParameter(
                    "Soft byte limit must not exceed hard byte limit".into(),
                ));
            }
        }
        if let (Some(soft), Some(hard)) = (self.soft_time, self.hard_time) {
            if soft > hard {
                return Err(Error::InvalidParameter(
                    "Soft lifetime must not exceed hard lifetime".into(),
                ));
            }
        }
        Ok(())
    }

    /// State implied by `bytes` processed at `age`
    pub fn state_for(&self, age: Duration, bytes: u64) -> SaState {
        let reached = |limit: Option<u64>, time: Option<Duration>| {
            limit.map_or(false, |l| bytes >= l) || time.map_or(false, |t| age >= t)
        };
        if reached(self.hard_bytes, self.hard_time) {
            SaState::Dead
        } else if reached(self.soft_bytes, self.soft_time) {
            SaState::Dying
        } else {
            SaState::Mature
        }
    }
}

/// Mutable per-SA state, reached only through [`SecurityAssociation::lock`]
#[derive(Debug)]
pub struct SaMutable {
    iv: Option<Vec<u8>>,
    replay: ReplayWindow,
    seq_out: u32,
    bytes: u64,
    packets: u64,
    state: SaState,
    deleted: bool,
    expiry_unreported: bool,
}

impl SaMutable {
    /// Chaining IV for the next record (None until first use)
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    /// Replace the chaining IV
    pub fn set_iv(&mut self, iv: Vec<u8>) {
        self.iv = Some(iv);
    }

    /// Anti-replay window
    pub fn replay(&self) -> &ReplayWindow {
        &self.replay
    }

    /// Anti-replay window (mutable)
    pub fn replay_mut(&mut self) -> &mut ReplayWindow {
        &mut self.replay
    }

    /// Allocate the next outbound sequence number
    ///
    /// Starts at 1 and never wraps: `SequenceOverflow` once 2^32 - 1 is used.
    pub fn next_sequence(&mut self) -> Result<u32> {
        if self.seq_out == u32::MAX {
            return Err(Error::SequenceOverflow(self.seq_out));
        }
        self.seq_out += 1;
        Ok(self.seq_out)
    }

    /// Last sequence number sent
    pub fn seq_out(&self) -> u32 {
        self.seq_out
    }

    /// Bytes processed
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Packets processed
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Lifecycle state
    pub fn state(&self) -> SaState {
        self.state
    }

    /// Whether the SA was explicitly deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Security Association
pub struct SecurityAssociation {
    id: SaId,
    auth: Option<DigestContext>,
    enc: Option<CipherContext>,
    lifetime: SaLifetime,
    created_at: Instant,
    inner: Mutex<SaMutable>,
}

/// Reference-counted SA handle
pub type SaHandle = Arc<SecurityAssociation>;

/// Snapshot returned by `get_sa_state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaStatus {
    /// Identity
    pub id: SaId,
    /// Lifecycle state
    pub state: SaState,
    /// Bytes processed
    pub bytes: u64,
    /// Packets processed
    pub packets: u64,
    /// Last outbound sequence number
    pub seq_out: u32,
    /// Highest inbound sequence number accepted
    pub replay_last: u32,
    /// Time since installation
    pub age: Duration,
}

impl SecurityAssociation {
    /// Create an SA
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` if ESP has no cipher, or AH has no digest or
    ///   carries a cipher
    /// - `InvalidSpi` for SPI 0
    pub fn new(
        id: SaId,
        auth: Option<DigestContext>,
        enc: Option<CipherContext>,
        lifetime: SaLifetime,
        replay_window: u32,
    ) -> Result<Self> {
        if id.spi == 0 {
            return Err(Error::InvalidSpi(0));
        }
        match id.protocol {
            IpsecProtocol::Esp if enc.is_none() => {
                return Err(Error::InvalidParameter(
                    "ESP SA requires an encryption transform".into(),
                ))
            }
            IpsecProtocol::Ah if auth.is_none() => {
                return Err(Error::InvalidParameter(
                    "AH SA requires an authentication transform".into(),
                ))
            }
            IpsecProtocol::Ah if enc.is_some() => {
                return Err(Error::InvalidParameter(
                    "AH SA cannot carry an encryption transform".into(),
                ))
            }
            _ => {}
        }
        lifetime.validate()?;

        Ok(SecurityAssociation {
            id,
            auth,
            enc,
            lifetime,
            created_at: Instant::now(),
            inner: Mutex::new(SaMutable {
                iv: None,
                replay: ReplayWindow::new(replay_window),
                seq_out: 0,
                bytes: 0,
                packets: 0,
                state: SaState::Mature,
                deleted: false,
                expiry_unreported: false,
            }),
        })
    }

    /// Identity
    pub fn id(&self) -> &SaId {
        &self.id
    }

    /// SPI
    pub fn spi(&self) -> u32 {
        self.id.spi
    }

    /// Authentication context
    pub fn auth(&self) -> Option<&DigestContext> {
        self.auth.as_ref()
    }

    /// Encryption context
    pub fn enc(&self) -> Option<&CipherContext> {
        self.enc.as_ref()
    }

    /// Lifetime limits
    pub fn lifetime(&self) -> &SaLifetime {
        &self.lifetime
    }

    /// Time since installation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Lock the mutable state for one operation
    pub fn lock(&self) -> MutexGuard<'_, SaMutable> {
        self.inner.lock()
    }

    /// Current state
    pub fn state(&self) -> SaState {
        self.inner.lock().state
    }

    /// Whether the SA is DEAD
    pub fn is_dead(&self) -> bool {
        self.state() == SaState::Dead
    }

    /// Fail with `SaNotFound` if the locked SA is DEAD
    pub fn ensure_usable(&self, st: &SaMutable) -> Result<()> {
        if st.state == SaState::Dead {
            return Err(Error::SaNotFound(self.id.to_string()));
        }
        Ok(())
    }

    /// Charge one successful operation of `bytes` and apply lifetime limits
    pub fn record_use(&self, st: &mut SaMutable, bytes: u64) {
        st.bytes = st.bytes.saturating_add(bytes);
        st.packets = st.packets.saturating_add(1);
        self.refresh_state(st);
    }

    /// Re-evaluate lifetime limits; returns the new state if it changed
    pub fn refresh_state(&self, st: &mut SaMutable) -> Option<SaState> {
        let target = self.lifetime.state_for(self.age(), st.bytes);
        let changed = self.advance(st, target);
        if changed == Some(SaState::Dead) {
            st.expiry_unreported = true;
        }
        changed
    }

    /// Whether the SA expired through its lifetime since the last call
    ///
    /// Reports each expiry exactly once, however many packets or sweeps
    /// observe the DEAD state. Explicit deletion is never reported.
    pub fn take_expiry(&self, st: &mut SaMutable) -> bool {
        std::mem::replace(&mut st.expiry_unreported, false)
    }

    /// Mark DEAD (explicit deletion)
    pub fn mark_dead(&self) {
        let mut st = self.inner.lock();
        st.deleted = true;
        self.advance(&mut st, SaState::Dead);
    }

    /// Whether the SA was explicitly deleted
    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    fn advance(&self, st: &mut SaMutable, target: SaState) -> Option<SaState> {
        if target <= st.state {
            return None;
        }
        logging::log_sa_state_transition(&self.id, st.state, target);
        st.state = target;
        Some(target)
    }

    /// Snapshot of state and counters
    pub fn status(&self) -> SaStatus {
        let st = self.inner.lock();
        SaStatus {
            id: self.id,
            state: st.state,
            bytes: st.bytes,
            packets: st.packets,
            seq_out: st.seq_out,
            replay_last: st.replay.last(),
            age: self.age(),
        }
    }
}

impl fmt::Debug for SecurityAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityAssociation")
            .field("id", &self.id)
            .field("auth", &self.auth.as_ref().map(|a| a.name()))
            .field("enc", &self.enc.as_ref().map(|e| e.name()))
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// Security Association Database
#[derive(Debug, Default)]
pub struct Sadb {
    table: RwLock<HashMap<SaId, SaHandle>>,
}

impl Sadb {
    /// Empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an SA
    ///
    /// Exact identity first; otherwise the SA with the same protocol and SPI
    /// whose destination prefix contains `id.dst`, longest prefix winning.
    /// DEAD SAs are returned too; callers check the state.
    pub fn find(&self, id: &SaId) -> Option<SaHandle> {
        let table = self.table.read();
        if let Some(sa) = table.get(id) {
            return Some(sa.clone());
        }
        table
            .iter()
            .filter(|(key, _)| key.covers(id))
            .max_by_key(|(key, _)| key.prefix_len)
            .map(|(_, sa)| sa.clone())
    }

    /// Install an SA
    ///
    /// # Errors
    ///
    /// `DuplicateSa` if the identity is already present (including a DEAD
    /// SA not yet reclaimed).
    pub fn insert(&self, sa: SecurityAssociation) -> Result<SaHandle> {
        let mut table = self.table.write();
        if table.contains_key(&sa.id) {
            return Err(Error::DuplicateSa(sa.id.to_string()));
        }
        let handle = Arc::new(sa);
        table.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Delete an SA: mark it DEAD and reclaim it if nobody holds it
    pub fn remove(&self, id: &SaId) -> Result<()> {
        let mut table = self.table.write();
        let sa = table
            .get(id)
            .ok_or_else(|| Error::SaNotFound(id.to_string()))?;
        sa.mark_dead();
        if Arc::strong_count(sa) == 1 {
            table.remove(id);
            logging::log_sa_reclaimed(id);
        }
        Ok(())
    }

    /// Return a handle obtained from [`find`](Self::find)
    ///
    /// Reclaims the SA when it was deleted and this was the last outside
    /// reference. The count is rechecked under the write lock, so a
    /// concurrent `find` cannot resurrect a reclaimed SA. SAs that expired
    /// through their lifetime are left for [`reap`](Self::reap).
    pub fn release(&self, handle: SaHandle) {
        if !handle.is_deleted() {
            return;
        }
        let id = handle.id;
        drop(handle);

        let mut table = self.table.write();
        let reclaim = table
            .get(&id)
            .map_or(false, |sa| sa.is_deleted() && Arc::strong_count(sa) == 1);
        if reclaim {
            table.remove(&id);
            logging::log_sa_reclaimed(&id);
        }
    }

    /// Apply time-based limits to every SA and reclaim unreferenced DEAD ones
    ///
    /// Returns the identities whose lifetime expiry had not been reported
    /// yet, including those that reached DEAD during this sweep.
    pub fn reap(&self) -> Vec<SaId> {
        let mut expired = Vec::new();
        let mut table = self.table.write();
        for sa in table.values() {
            let mut st = sa.lock();
            sa.refresh_state(&mut st);
            if sa.take_expiry(&mut st) {
                expired.push(sa.id);
            }
        }
        table.retain(|id, sa| {
            let keep = !(sa.is_dead() && Arc::strong_count(sa) == 1);
            if !keep {
                logging::log_sa_reclaimed(id);
            }
            keep
        });
        expired
    }

    /// Remove every SA, marking each DEAD; returns how many were removed
    pub fn flush(&self) -> usize {
        let mut table = self.table.write();
        for sa in table.values() {
            sa.mark_dead();
        }
        let n = table.len();
        table.clear();
        n
    }

    /// Identities currently stored
    pub fn ids(&self) -> Vec<SaId> {
        self.table.read().keys().copied().collect()
    }

    /// Number of stored SAs (including DEAD ones awaiting reclamation)
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
