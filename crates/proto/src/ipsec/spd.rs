//! Security Policy Database (SPD)
//!
//! Policies are keyed by [`Selector`]. An APPLY policy names at most one AH
//! SA and one ESP SA by identity; the identities are resolved against the
//! SADB on first use and the handles cached until the SA dies, so an SA can
//! be replaced under a live policy without touching the policy.

use crate::ipsec::sadb::{Sadb, SaHandle, SaId};
use crate::ipsec::selector::Selector;
use crate::ipsec::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Policy verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyAction {
    /// Pass traffic without IPsec
    Bypass,
    /// Discard traffic
    Drop,
    /// Protect traffic with the referenced SAs
    Apply,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::Bypass => f.write_str("bypass"),
            PolicyAction::Drop => f.write_str("drop"),
            PolicyAction::Apply => f.write_str("apply"),
        }
    }
}

/// Lazily resolved reference from a policy to an SA
#[derive(Debug)]
pub struct SaRef {
    id: SaId,
    cached: Mutex<Option<SaHandle>>,
}

impl SaRef {
    /// Unresolved reference
    pub fn new(id: SaId) -> Self {
        SaRef {
            id,
            cached: Mutex::new(None),
        }
    }

    /// Referenced identity
    pub fn id(&self) -> &SaId {
        &self.id
    }

    /// Live handle for this reference
    ///
    /// Uses the cached handle unless its SA has died; otherwise re-queries
    /// the SADB and caches the result. A DEAD or missing SA is
    /// `SaNotFound`.
    pub fn resolve(&self, sadb: &Sadb) -> Result<SaHandle> {
        let mut cached = self.cached.lock();
        if let Some(sa) = cached.as_ref() {
            if !sa.is_dead() {
                return Ok(sa.clone());
            }
        }
        if let Some(stale) = cached.take() {
            sadb.release(stale);
        }

        let sa = sadb
            .find(&self.id)
            .ok_or_else(|| Error::SaNotFound(self.id.to_string()))?;
        if sa.is_dead() {
            sadb.release(sa);
            return Err(Error::SaNotFound(self.id.to_string()));
        }
        *cached = Some(sa.clone());
        Ok(sa)
    }

    /// Drop the cached handle back into the SADB
    pub fn release(&self, sadb: &Sadb) {
        if let Some(sa) = self.cached.lock().take() {
            sadb.release(sa);
        }
    }

    /// Whether `sa` is the SA this reference names
    pub fn matches(&self, sa: &SaHandle) -> bool {
        sa.id() == &self.id || sa.id().covers(&self.id) || self.id.covers(sa.id())
    }
}

/// Security policy
#[derive(Debug)]
pub struct SecurityPolicy {
    selector: Selector,
    action: PolicyAction,
    ah: Option<SaRef>,
    esp: Option<SaRef>,
}

/// Reference-counted policy handle
pub type PolicyHandle = Arc<SecurityPolicy>;

/// SAs resolved for one APPLY operation
#[derive(Debug, Default)]
pub struct ResolvedSas {
    /// AH SA, if the policy names one
    pub ah: Option<SaHandle>,
    /// ESP SA, if the policy names one
    pub esp: Option<SaHandle>,
}

impl ResolvedSas {
    /// Return both handles to the SADB
    pub fn release(self, sadb: &Sadb) {
        if let Some(sa) = self.ah {
            sadb.release(sa);
        }
        if let Some(sa) = self.esp {
            sadb.release(sa);
        }
    }
}

impl SecurityPolicy {
    /// Create a policy
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if an APPLY policy names no SA, a BYPASS/DROP
    /// policy names one, or a reference has the wrong protocol.
    pub fn new(
        selector: Selector,
        action: PolicyAction,
        ah: Option<SaId>,
        esp: Option<SaId>,
    ) -> Result<Self> {
        use crate::ipsec::sadb::IpsecProtocol;

        selector.validate()?;
        match action {
            PolicyAction::Apply if ah.is_none() && esp.is_none() => {
                return Err(Error::InvalidParameter(
                    "APPLY policy must reference an AH or ESP SA".into(),
                ));
            }
            PolicyAction::Bypass | PolicyAction::Drop if ah.is_some() || esp.is_some() => {
                return Err(Error::InvalidParameter(format!(
                    "{} policy cannot reference SAs",
                    action
                )));
            }
            _ => {}
        }
        if ah.map_or(false, |id| id.protocol != IpsecProtocol::Ah) {
            return Err(Error::InvalidParameter("AH reference must name an AH SA".into()));
        }
        if esp.map_or(false, |id| id.protocol != IpsecProtocol::Esp) {
            return Err(Error::InvalidParameter("ESP reference must name an ESP SA".into()));
        }

        Ok(SecurityPolicy {
            selector,
            action,
            ah: ah.map(SaRef::new),
            esp: esp.map(SaRef::new),
        })
    }

    /// Selector
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Verdict
    pub fn action(&self) -> PolicyAction {
        self.action
    }

    /// AH reference
    pub fn ah(&self) -> Option<&SaRef> {
        self.ah.as_ref()
    }

    /// ESP reference
    pub fn esp(&self) -> Option<&SaRef> {
        self.esp.as_ref()
    }

    /// Resolve every SA reference to a live handle
    ///
    /// On failure nothing stays checked out.
    pub fn resolve_sa_refs(&self, sadb: &Sadb) -> Result<ResolvedSas> {
        let mut resolved = ResolvedSas::default();
        if let Some(r) = &self.ah {
            resolved.ah = Some(r.resolve(sadb)?);
        }
        if let Some(r) = &self.esp {
            match r.resolve(sadb) {
                Ok(sa) => resolved.esp = Some(sa),
                Err(e) => {
                    resolved.release(sadb);
                    return Err(e);
                }
            }
        }
        Ok(resolved)
    }

    /// Release cached SA handles
    pub fn release_cached(&self, sadb: &Sadb) {
        if let Some(r) = &self.ah {
            r.release(sadb);
        }
        if let Some(r) = &self.esp {
            r.release(sadb);
        }
    }
}

/// Security Policy Database
#[derive(Debug, Default)]
pub struct Spd {
    table: RwLock<HashMap<Selector, PolicyHandle>>,
}

impl Spd {
    /// Empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Most specific policy for `flow`
    ///
    /// Exact selector match first, then the covering policy with the longest
    /// combined prefix.
    pub fn lookup(&self, flow: &Selector) -> Option<PolicyHandle> {
        let table = self.table.read();
        if let Some(policy) = table.get(flow) {
            return Some(policy.clone());
        }
        table
            .iter()
            .filter(|(sel, _)| sel.covers(flow))
            .max_by_key(|(sel, _)| sel.specificity())
            .map(|(_, p)| p.clone())
    }

    /// Install a policy
    ///
    /// # Errors
    ///
    /// `DuplicatePolicy` if the selector is already present.
    pub fn insert(&self, policy: SecurityPolicy) -> Result<PolicyHandle> {
        let mut table = self.table.write();
        if table.contains_key(&policy.selector) {
            return Err(Error::DuplicatePolicy(policy.selector.to_string()));
        }
        let handle = Arc::new(policy);
        table.insert(handle.selector, handle.clone());
        Ok(handle)
    }

    /// Remove a policy, returning it so its cached SAs can be released
    pub fn remove(&self, selector: &Selector) -> Result<PolicyHandle> {
        self.table
            .write()
            .remove(selector)
            .ok_or_else(|| Error::InvalidParameter(format!("no policy for {}", selector)))
    }

    /// Remove every policy
    pub fn flush(&self) -> Vec<PolicyHandle> {
        self.table.write().drain().map(|(_, p)| p).collect()
    }

    /// Number of policies
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
