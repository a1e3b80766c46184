//! Name → transform registry with lazy discovery

use super::chain::ChainMode;
use super::cipher::{BlockCipher, CipherContext};
use super::digest::{DigestAlgorithm, DigestContext};
use super::{builtin, builtin_transforms, Transform, TransformGroup};
use crate::ipsec::{logging, Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Result of asking a [`Discovery`] strategy for a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Something was registered; the lookup should be retried
    Found,
    /// Nothing known under this name
    NotFound,
}

/// Strategy for loading transforms that are not registered yet
///
/// Called without any registry lock held, so implementations may call
/// [`TransformRegistry::register`].
pub trait Discovery: Send + Sync {
    /// Try to make `name` available in `group`
    fn discover(
        &self,
        name: &str,
        group: TransformGroup,
        registry: &TransformRegistry,
    ) -> DiscoveryOutcome;
}

/// Never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn discover(&self, _: &str, _: TransformGroup, _: &TransformRegistry) -> DiscoveryOutcome {
        DiscoveryOutcome::NotFound
    }
}

/// Registers builtin transforms on first use
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDiscovery;

impl Discovery for BuiltinDiscovery {
    fn discover(
        &self,
        name: &str,
        group: TransformGroup,
        registry: &TransformRegistry,
    ) -> DiscoveryOutcome {
        match builtin(name, group) {
            Some(transform) => match registry.register(transform) {
                Ok(()) | Err(Error::TransformExists(_)) => DiscoveryOutcome::Found,
                Err(_) => DiscoveryOutcome::NotFound,
            },
            None => DiscoveryOutcome::NotFound,
        }
    }
}

/// Cipher lookup result: a transform plus the chaining mode the name selected
#[derive(Clone)]
pub struct CipherHandle {
    transform: Arc<dyn BlockCipher>,
    mode: ChainMode,
}

impl CipherHandle {
    /// Transform name (without mode suffix)
    pub fn name(&self) -> &str {
        self.transform.name()
    }

    /// Chaining mode
    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.transform.block_size()
    }

    /// Underlying transform
    pub fn transform(&self) -> &Arc<dyn BlockCipher> {
        &self.transform
    }

    /// Key the transform, producing a context owned by one SA
    pub fn instantiate(&self, key: &[u8]) -> Result<CipherContext> {
        CipherContext::new(self.transform.clone(), self.mode, key)
    }
}

impl fmt::Debug for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherHandle({}-{})", self.name(), self.mode)
    }
}

/// Transform registry
///
/// Two independent namespaces (ciphers, digests), each behind its own
/// reader/writer lock. Lookups take the read lock; registration takes the
/// write lock.
pub struct TransformRegistry {
    ciphers: RwLock<HashMap<String, Arc<dyn BlockCipher>>>,
    digests: RwLock<HashMap<String, Arc<dyn DigestAlgorithm>>>,
    discovery: Arc<dyn Discovery>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformRegistry {
    /// Empty registry without discovery
    pub fn new() -> Self {
        Self::with_discovery(Arc::new(NoDiscovery))
    }

    /// Empty registry consulting `discovery` on misses
    pub fn with_discovery(discovery: Arc<dyn Discovery>) -> Self {
        TransformRegistry {
            ciphers: RwLock::new(HashMap::new()),
            digests: RwLock::new(HashMap::new()),
            discovery,
        }
    }

    /// Registry with every builtin transform registered up front
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for transform in builtin_transforms() {
            // Fresh registry, names are unique
            let _ = registry.register(transform);
        }
        registry
    }

    /// Register a transform
    ///
    /// # Errors
    ///
    /// `TransformExists` if the group already holds this name.
    pub fn register(&self, transform: Transform) -> Result<()> {
        let name = transform.name().to_string();
        let group = transform.group();
        match transform {
            Transform::Cipher(c) => insert_unique(&self.ciphers, name.clone(), c)?,
            Transform::Digest(d) => insert_unique(&self.digests, name.clone(), d)?,
        }
        logging::log_transform_registered(&name, group);
        Ok(())
    }

    /// Register a block cipher
    pub fn register_cipher(&self, cipher: Arc<dyn BlockCipher>) -> Result<()> {
        self.register(Transform::Cipher(cipher))
    }

    /// Register a keyed digest
    pub fn register_digest(&self, digest: Arc<dyn DigestAlgorithm>) -> Result<()> {
        self.register(Transform::Digest(digest))
    }

    /// Remove a transform
    ///
    /// # Errors
    ///
    /// - `TransformNotFound` if nothing is registered under `name`
    /// - `TransformBusy` while any context or handle still holds it
    pub fn unregister(&self, name: &str, group: TransformGroup) -> Result<()> {
        match group {
            TransformGroup::Cipher => remove_idle(&self.ciphers, name)?,
            TransformGroup::Digest => remove_idle(&self.digests, name)?,
        }
        logging::log_transform_unregistered(name, group);
        Ok(())
    }

    /// Whether `name` is registered in `group` (no discovery)
    pub fn contains(&self, name: &str, group: TransformGroup) -> bool {
        match group {
            TransformGroup::Cipher => self.ciphers.read().contains_key(name),
            TransformGroup::Digest => self.digests.read().contains_key(name),
        }
    }

    /// Registered names in `group`, sorted
    pub fn names(&self, group: TransformGroup) -> Vec<String> {
        let mut names: Vec<String> = match group {
            TransformGroup::Cipher => self.ciphers.read().keys().cloned().collect(),
            TransformGroup::Digest => self.digests.read().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Find a transform by name
    pub fn find(
        &self,
        name: &str,
        group: TransformGroup,
        require_atomic: bool,
    ) -> Result<Transform> {
        match group {
            TransformGroup::Cipher => self
                .find_cipher(name, require_atomic)
                .map(|h| Transform::Cipher(h.transform)),
            TransformGroup::Digest => self
                .find_digest(name, require_atomic)
                .map(Transform::Digest),
        }
    }

    /// Find a cipher, honoring a `-cbc` / `-ecb` suffix
    ///
    /// Without a suffix the transform's default mode is used.
    pub fn find_cipher(&self, name: &str, require_atomic: bool) -> Result<CipherHandle> {
        self.resolve(name, TransformGroup::Cipher, || {
            self.lookup_cipher(name, require_atomic)
        })
    }

    /// Find a keyed digest
    pub fn find_digest(
        &self,
        name: &str,
        require_atomic: bool,
    ) -> Result<Arc<dyn DigestAlgorithm>> {
        self.resolve(name, TransformGroup::Digest, || {
            let table = self.digests.read();
            table
                .get(name)
                .filter(|d| !require_atomic || d.is_atomic())
                .cloned()
        })
    }

    /// Find a digest and bind `key` to it
    pub fn digest_context(
        &self,
        name: &str,
        key: &[u8],
        require_atomic: bool,
    ) -> Result<DigestContext> {
        DigestContext::new(self.find_digest(name, require_atomic)?, key)
    }

    /// Find a cipher and key it
    pub fn cipher_context(
        &self,
        name: &str,
        key: &[u8],
        require_atomic: bool,
    ) -> Result<CipherContext> {
        self.find_cipher(name, require_atomic)?.instantiate(key)
    }

    fn lookup_cipher(&self, name: &str, require_atomic: bool) -> Option<CipherHandle> {
        let table = self.ciphers.read();
        let handle = match table.get(name) {
            Some(c) => CipherHandle {
                transform: c.clone(),
                mode: c.default_mode(),
            },
            None => {
                let (base, mode) = ChainMode::split_name(name);
                let mode = mode?;
                CipherHandle {
                    transform: table.get(base)?.clone(),
                    mode,
                }
            }
        };
        if require_atomic && !handle.transform.is_atomic() {
            return None;
        }
        Some(handle)
    }

    /// Local lookup, falling back to discovery over truncated names
    ///
    /// `cipher-blowfish-cbc` asks for `cipher-blowfish-cbc`, then
    /// `cipher-blowfish`, then `cipher`. Every candidate is asked at most
    /// once; after a `Found` the lookup is retried and the pass restarts.
    fn resolve<T>(
        &self,
        name: &str,
        group: TransformGroup,
        lookup: impl Fn() -> Option<T>,
    ) -> Result<T> {
        if let Some(found) = lookup() {
            return Ok(found);
        }

        let mut asked: HashSet<&str> = HashSet::new();
        loop {
            let mut progressed = false;
            for candidate in candidates(name) {
                if !asked.insert(candidate) {
                    continue;
                }
                let outcome = self.discovery.discover(candidate, group, self);
                logging::log_discovery(candidate, group, outcome);
                if outcome == DiscoveryOutcome::Found {
                    progressed = true;
                    if let Some(found) = lookup() {
                        return Ok(found);
                    }
                    break;
                }
            }
            if !progressed {
                return Err(Error::TransformNotFound(name.to_string()));
            }
        }
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("ciphers", &self.names(TransformGroup::Cipher))
            .field("digests", &self.names(TransformGroup::Digest))
            .finish()
    }
}

fn insert_unique<T: ?Sized>(
    table: &RwLock<HashMap<String, Arc<T>>>,
    name: String,
    transform: Arc<T>,
) -> Result<()> {
    let mut table = table.write();
    if table.contains_key(&name) {
        return Err(Error::TransformExists(name));
    }
    table.insert(name, transform);
    Ok(())
}

fn remove_idle<T: ?Sized>(table: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Result<()> {
    let mut table = table.write();
    let entry = table
        .get(name)
        .ok_or_else(|| Error::TransformNotFound(name.to_string()))?;
    if Arc::strong_count(entry) > 1 {
        return Err(Error::TransformBusy(name.to_string()));
    }
    table.remove(name);
    Ok(())
}

/// `a-b-c` → `a-b-c`, `a-b`, `a`
fn candidates(name: &str) -> impl Iterator<Item = &str> {
    std::iter::once(name).chain(
        name.char_indices()
            .rev()
            .filter(|&(_, c)| c == '-')
            .map(move |(i, _)| &name[..i])
            .filter(|s| !s.is_empty()),
    )
}

static GLOBAL: Lazy<RwLock<Option<Arc<TransformRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide registry
///
/// # Errors
///
/// `InvalidState` if a registry is already installed.
pub fn init_global(discovery: Arc<dyn Discovery>) -> Result<Arc<TransformRegistry>> {
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(Error::InvalidState(
            "global transform registry already initialized".into(),
        ));
    }
    let registry = Arc::new(TransformRegistry::with_discovery(discovery));
    *slot = Some(registry.clone());
    Ok(registry)
}

/// The process-wide registry
pub fn global() -> Result<Arc<TransformRegistry>> {
    GLOBAL
        .read()
        .clone()
        .ok_or_else(|| Error::InvalidState("global transform registry not initialized".into()))
}

/// Remove the process-wide registry, returning it
///
/// Engines holding the registry keep it alive until they are dropped.
pub fn shutdown_global() -> Option<Arc<TransformRegistry>> {
    GLOBAL.write().take()
}
