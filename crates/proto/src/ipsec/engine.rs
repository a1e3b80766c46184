//! IPsec engine
//!
//! Ties the transform registry, SADB and SPD together behind the control
//! plane (`add_sa`, `add_policy`, ...) and the packet path
//! (`inbound_check`, `outbound_check`, `outbound_encode`).
//!
//! # Inbound
//!
//! ```text
//! packet ─► AH? verify+strip ─► ESP? decrypt+splice ─► selector ─► SPD
//!                                                                 │
//!                       Accept(next header) ◄── SAs used match ◄──┘
//! ```
//!
//! # Outbound
//!
//! `outbound_check` maps a flow selector to a verdict. For APPLY the caller
//! hands the packet and the policy to `outbound_encode`, which applies ESP
//! and then AH so the wire layout is `IPv6 | ext | AH | ESP | payload`.
//!
//! # Example
//!
//! ```
//! use kestrel_proto::ipsec::{
//!     EngineConfig, InboundVerdict, IpsecEngine, IpsecProtocol, OutboundVerdict, Packet,
//!     PolicyAction, SaConfig, SaId, Selector, TransformRegistry,
//! };
//! use std::sync::Arc;
//!
//! let a = "2001:db8::a".parse().unwrap();
//! let b = "2001:db8::b".parse().unwrap();
//! let id = SaId::new(b, IpsecProtocol::Esp, 0x1001);
//! let selector = Selector::new(a, b, 17).with_ports(1234, 5678);
//!
//! let engine = || -> IpsecEngine {
//!     let engine = IpsecEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(TransformRegistry::with_builtins()),
//!     )
//!     .unwrap();
//!     let sa = SaConfig::builder()
//!         .with_id(id)
//!         .with_encryption("cipher-aes-cbc", vec![7u8; 32])
//!         .with_auth("digest-sha256", vec![9u8; 32])
//!         .build()
//!         .unwrap();
//!     engine.add_sa(sa).unwrap();
//!     engine.add_policy(selector, PolicyAction::Apply, None, Some(id)).unwrap();
//!     engine
//! };
//! let (sender, receiver) = (engine(), engine());
//!
//! let udp = [0x04, 0xD2, 0x16, 0x2E, 0, 8, 0, 0];
//! let packet = Packet::build(a, b, 17, 64, &udp).unwrap();
//!
//! let OutboundVerdict::Apply(policy) = sender.outbound_check(&selector) else {
//!     panic!("expected apply");
//! };
//! let mut wire = sender.outbound_encode(packet.clone(), &policy).unwrap();
//!
//! assert_eq!(receiver.inbound_check(&mut wire), InboundVerdict::Accept(17));
//! assert_eq!(wire, packet);
//! ```

use crate::ipsec::config::{EngineConfig, SaConfig};
use crate::ipsec::logging::{self, RateLimitedLog};
use crate::ipsec::metrics::IpsecMetrics;
use crate::ipsec::packet::{proto, Packet};
use crate::ipsec::sadb::{SaHandle, SaId, SaStatus, Sadb, SecurityAssociation};
use crate::ipsec::selector::Selector;
use crate::ipsec::spd::{PolicyAction, PolicyHandle, ResolvedSas, SecurityPolicy, Spd};
use crate::ipsec::xform::{self, TransformRegistry};
use crate::ipsec::{ah, esp, Error, Result};
use kestrel_platform::{KestrelError, KestrelResult, ModuleState, SecurityModule};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Result of [`IpsecEngine::inbound_check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundVerdict {
    /// Deliver; carries the upper-layer protocol of the decoded packet
    Accept(u8),
    /// Discard, with the reason
    Drop(Error),
}

impl InboundVerdict {
    /// Whether the packet was accepted
    pub fn is_accept(&self) -> bool {
        matches!(self, InboundVerdict::Accept(_))
    }
}

/// Result of [`IpsecEngine::outbound_check`]
#[derive(Debug, Clone)]
pub enum OutboundVerdict {
    /// Send unchanged
    Bypass,
    /// Discard
    Drop,
    /// Protect with the SAs of this policy
    Apply(PolicyHandle),
}

/// IPsec transform engine
pub struct IpsecEngine {
    config: EngineConfig,
    registry: Arc<TransformRegistry>,
    sadb: Sadb,
    spd: Spd,
    metrics: IpsecMetrics,
    auth_log: RateLimitedLog,
    state: AtomicU8,
}

impl IpsecEngine {
    /// Create an engine over `registry`
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the configuration does not validate.
    pub fn new(config: EngineConfig, registry: Arc<TransformRegistry>) -> Result<Self> {
        config.validate()?;
        let auth_log = RateLimitedLog::new(config.auth_failure_log_interval);
        Ok(IpsecEngine {
            config,
            registry,
            sadb: Sadb::new(),
            spd: Spd::new(),
            metrics: IpsecMetrics::new(),
            auth_log,
            state: AtomicU8::new(STATE_CREATED),
        })
    }

    /// Create an engine over the process-wide registry
    ///
    /// # Errors
    ///
    /// `InvalidState` if [`xform::init_global`] has not been called.
    pub fn with_global(config: EngineConfig) -> Result<Self> {
        Self::new(config, xform::global()?)
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transform registry
    pub fn registry(&self) -> &Arc<TransformRegistry> {
        &self.registry
    }

    /// Security Association Database
    pub fn sadb(&self) -> &Sadb {
        &self.sadb
    }

    /// Security Policy Database
    pub fn spd(&self) -> &Spd {
        &self.spd
    }

    /// Metrics
    pub fn metrics(&self) -> &IpsecMetrics {
        &self.metrics
    }

    // ---- SA control plane ----

    /// Install an SA
    ///
    /// Looks up the transforms, expands the keys and inserts the SA. On any
    /// error nothing is installed.
    ///
    /// # Errors
    ///
    /// - `TransformNotFound` for an unknown algorithm name
    /// - `InvalidKeyLength` for a key the transform rejects
    /// - `DuplicateSa` if the identity is present
    pub fn add_sa(&self, config: SaConfig) -> Result<SaHandle> {
        config.validate()?;
        let require_atomic = self.config.require_atomic;

        let auth = match &config.auth {
            Some(t) => Some(self.registry.digest_context(&t.algorithm, &t.key, require_atomic)?),
            None => None,
        };
        let enc = match &config.enc {
            Some(t) => Some(self.registry.cipher_context(&t.algorithm, &t.key, require_atomic)?),
            None => None,
        };

        let sa = SecurityAssociation::new(
            config.id,
            auth,
            enc,
            config.lifetime.unwrap_or(self.config.default_lifetime),
            self.config.replay_window_size,
        )?;
        let handle = self.sadb.insert(sa)?;

        logging::log_sa_added(
            &config.id,
            handle.auth().map(|a| a.name()),
            handle.enc().map(|e| e.name()),
        );
        self.metrics.record_sa_added();
        self.metrics.set_sa_active(self.sadb.len());
        Ok(handle)
    }

    /// Delete an SA
    ///
    /// The SA turns DEAD at once; packets in flight on it finish, later
    /// ones see `SaNotFound`.
    pub fn delete_sa(&self, id: &SaId) -> Result<()> {
        self.sadb.remove(id)?;
        logging::log_sa_deleted(id);
        self.metrics.record_sa_deleted();
        self.metrics.set_sa_active(self.sadb.len());
        Ok(())
    }

    /// State and counters of an SA
    ///
    /// Re-evaluates time-based limits first. An SA that expired through its
    /// lifetime still reports its final state here until it is deleted or
    /// reaped.
    pub fn get_sa_state(&self, id: &SaId) -> Result<SaStatus> {
        let sa = self
            .sadb
            .find(id)
            .ok_or_else(|| Error::SaNotFound(id.to_string()))?;
        let expired = {
            let mut st = sa.lock();
            sa.refresh_state(&mut st);
            sa.take_expiry(&mut st)
        };
        if expired {
            self.metrics.record_sa_expired();
        }
        let status = sa.status();
        self.sadb.release(sa);
        Ok(status)
    }

    /// Apply time-based lifetimes to every SA and reclaim unreferenced DEAD
    /// ones; returns the SAs whose expiry had not been counted yet
    pub fn reap(&self) -> Vec<SaId> {
        let expired = self.sadb.reap();
        for _ in &expired {
            self.metrics.record_sa_expired();
        }
        self.metrics.set_sa_active(self.sadb.len());
        expired
    }

    // ---- Policy control plane ----

    /// Install a policy
    ///
    /// SA references are resolved lazily; the SAs need not exist yet.
    pub fn add_policy(
        &self,
        selector: Selector,
        action: PolicyAction,
        ah: Option<SaId>,
        esp: Option<SaId>,
    ) -> Result<PolicyHandle> {
        let policy = SecurityPolicy::new(selector, action, ah, esp)?;
        let handle = self.spd.insert(policy)?;
        logging::log_policy_added(&selector, action);
        self.metrics.set_policies_active(self.spd.len());
        Ok(handle)
    }

    /// Remove a policy and return its cached SA handles
    pub fn delete_policy(&self, selector: &Selector) -> Result<()> {
        let policy = self.spd.remove(selector)?;
        policy.release_cached(&self.sadb);
        logging::log_policy_deleted(selector);
        self.metrics.set_policies_active(self.spd.len());
        Ok(())
    }

    /// Remove every policy and SA
    pub fn flush(&self) {
        for policy in self.spd.flush() {
            policy.release_cached(&self.sadb);
        }
        let removed = self.sadb.flush();
        tracing::info!(sas = removed, "IPsec databases flushed");
        self.metrics.set_policies_active(0);
        self.metrics.set_sa_active(0);
    }

    // ---- Packet path ----

    /// Verify and decode an inbound packet in place
    ///
    /// AH is verified and stripped, then ESP is decrypted and spliced out;
    /// the decoded packet must then satisfy the policy covering its flow.
    /// On `Accept` the packet holds the plain datagram.
    pub fn inbound_check(&self, packet: &mut Packet) -> InboundVerdict {
        let mut used = ResolvedSas::default();
        let result = match self.decode_inbound(packet, &mut used) {
            Ok(()) => self.check_inbound_policy(packet, &used),
            Err(e) => Err(e),
        };
        self.note_expired(&used);
        used.release(&self.sadb);

        match result {
            Ok(next_header) => {
                self.metrics.record_accepted();
                InboundVerdict::Accept(next_header)
            }
            Err(e) => {
                self.note_drop("inbound", &e, packet);
                InboundVerdict::Drop(e)
            }
        }
    }

    /// Verdict for an outbound flow
    pub fn outbound_check(&self, selector: &Selector) -> OutboundVerdict {
        match self.spd.lookup(selector) {
            Some(policy) => match policy.action() {
                PolicyAction::Bypass => OutboundVerdict::Bypass,
                PolicyAction::Drop => OutboundVerdict::Drop,
                PolicyAction::Apply => OutboundVerdict::Apply(policy),
            },
            None => match self.config.default_outbound_action {
                PolicyAction::Drop => OutboundVerdict::Drop,
                _ => OutboundVerdict::Bypass,
            },
        }
    }

    /// Protect `packet` under `policy`
    ///
    /// BYPASS returns the packet unchanged; DROP fails with `PolicyDrop`.
    /// APPLY resolves the policy's SAs and applies ESP, then AH.
    pub fn outbound_encode(&self, packet: Packet, policy: &PolicyHandle) -> Result<Packet> {
        let result = match policy.action() {
            PolicyAction::Bypass => Ok(packet),
            PolicyAction::Drop => Err(Error::PolicyDrop(format!(
                "outbound policy {}",
                policy.selector()
            ))),
            PolicyAction::Apply => self.apply(packet, policy),
        };
        if let Err(e) = &result {
            self.metrics.record_drop(e);
            logging::log_packet_dropped("outbound", e);
        }
        result
    }

    fn apply(&self, mut packet: Packet, policy: &SecurityPolicy) -> Result<Packet> {
        let sas = policy.resolve_sa_refs(&self.sadb)?;
        let result = self.encode_with(&mut packet, &sas);
        self.note_expired(&sas);
        sas.release(&self.sadb);
        result.map(|()| packet)
    }

    fn encode_with(&self, packet: &mut Packet, sas: &ResolvedSas) -> Result<()> {
        if let Some(sa) = &sas.esp {
            let (at, _) = packet.insertion_point()?;
            let payload_len = packet.len() - at;
            esp::output(sa, packet)?;
            self.metrics.record_esp_encrypted(payload_len);
        }
        if let Some(sa) = &sas.ah {
            ah::output(sa, packet)?;
            self.metrics.record_ah_generated();
        }
        Ok(())
    }

    /// Strip AH and ESP, collecting the SAs used
    ///
    /// The header chain is re-walked after each step. At most one AH and
    /// one ESP are accepted, AH outside ESP.
    fn decode_inbound(&self, packet: &mut Packet, used: &mut ResolvedSas) -> Result<()> {
        let replay = self.config.replay_protection;
        loop {
            let headers = packet.headers()?;
            let Some(at) = headers
                .iter()
                .find(|h| h.kind == proto::AH || h.kind == proto::ESP)
                .copied()
            else {
                return Ok(());
            };

            if at.kind == proto::AH {
                if used.ah.is_some() || used.esp.is_some() {
                    return Err(Error::PolicyMismatch(
                        "nested or misplaced AH header".into(),
                    ));
                }
                used.ah = Some(ah::input(&self.sadb, packet, &at, replay)?);
                self.metrics.record_ah_verified();
            } else {
                if used.esp.is_some() {
                    return Err(Error::PolicyMismatch("nested ESP record".into()));
                }
                let (sa, _) = esp::input(&self.sadb, packet, &at, replay)?;
                used.esp = Some(sa);
                self.metrics.record_esp_decrypted(packet.len() - at.offset);
            }
        }
    }

    fn check_inbound_policy(&self, packet: &Packet, used: &ResolvedSas) -> Result<u8> {
        let selector = Selector::from_packet(packet)?;
        let protected = used.ah.is_some() || used.esp.is_some();

        let policy = self.spd.lookup(&selector);
        let action = policy
            .as_ref()
            .map_or(self.config.default_inbound_action, |p| p.action());

        match action {
            PolicyAction::Drop => {
                return Err(Error::PolicyDrop(format!("inbound {}", selector)));
            }
            PolicyAction::Bypass if protected => {
                return Err(Error::PolicyMismatch(format!(
                    "protected packet on bypass flow {}",
                    selector
                )));
            }
            PolicyAction::Bypass => {}
            PolicyAction::Apply => {
                let policy = policy.ok_or_else(|| {
                    Error::Internal("apply verdict without policy".into())
                })?;
                let ah_ok = match (policy.ah(), &used.ah) {
                    (Some(r), Some(sa)) => r.matches(sa),
                    (None, None) => true,
                    _ => false,
                };
                let esp_ok = match (policy.esp(), &used.esp) {
                    (Some(r), Some(sa)) => r.matches(sa),
                    (None, None) => true,
                    _ => false,
                };
                if !(ah_ok && esp_ok) {
                    return Err(Error::PolicyMismatch(format!(
                        "SAs used do not match policy for {}",
                        selector
                    )));
                }
            }
        }
        Ok(selector.protocol)
    }

    fn note_expired(&self, sas: &ResolvedSas) {
        for sa in sas.ah.iter().chain(sas.esp.iter()) {
            let expired = {
                let mut st = sa.lock();
                sa.take_expiry(&mut st)
            };
            if expired {
                self.metrics.record_sa_expired();
            }
        }
    }

    fn note_drop(&self, direction: &str, error: &Error, packet: &Packet) {
        self.metrics.record_drop(error);
        logging::log_packet_dropped(direction, error);
        match error {
            Error::ReplayDetected(seq) => {
                logging::log_replay_detected(outer_spi(packet).unwrap_or(0), *seq);
            }
            Error::AuthenticationFailed(reason) => {
                self.auth_log
                    .log_auth_failure(outer_spi(packet).unwrap_or(0), reason);
            }
            _ => {}
        }
    }
}

/// SPI of the first AH/ESP header still present in `packet`
fn outer_spi(packet: &Packet) -> Option<u32> {
    let headers = packet.headers().ok()?;
    let h = headers
        .iter()
        .find(|h| h.kind == proto::AH || h.kind == proto::ESP)?;
    let spi_at = if h.kind == proto::AH { h.offset + 4 } else { h.offset };
    let b = packet.as_bytes().get(spi_at..spi_at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

impl SecurityModule for IpsecEngine {
    fn id(&self) -> &'static str {
        "kestrel-ipsec"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IPsec AH/ESP transform engine"
    }

    fn state(&self) -> ModuleState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CREATED => ModuleState::Created,
            STATE_RUNNING => ModuleState::Running,
            _ => ModuleState::Stopped,
        }
    }

    fn init(&self) -> KestrelResult<()> {
        self.state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| KestrelError::State("IPsec engine already initialized".into()))?;
        tracing::info!(module = self.id(), "IPsec engine running");
        Ok(())
    }

    fn shutdown(&self) -> KestrelResult<()> {
        self.flush();
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        tracing::info!(module = self.id(), "IPsec engine stopped");
        Ok(())
    }
}

impl std::fmt::Debug for IpsecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpsecEngine")
            .field("config", &self.config)
            .field("sas", &self.sadb.len())
            .field("policies", &self.spd.len())
            .finish()
    }
}
