//! Engine and SA configuration
//!
//! Builder-style configuration for [`IpsecEngine`](super::engine::IpsecEngine)
//! and for the SAs a key-management daemon installs through it.

use super::{
    replay::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE},
    sadb::{IpsecProtocol, SaId, SaLifetime},
    spd::PolicyAction,
    Error, Result,
};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Engine-wide settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Replay window size for new SAs (32..=64)
    pub replay_window_size: u32,

    /// Check and update replay windows on inbound packets
    pub replay_protection: bool,

    /// Only accept transforms usable from atomic context
    pub require_atomic: bool,

    /// Verdict for inbound packets no policy covers
    pub default_inbound_action: PolicyAction,

    /// Verdict for outbound flows no policy covers
    pub default_outbound_action: PolicyAction,

    /// Minimum spacing of authentication-failure log lines
    pub auth_failure_log_interval: Duration,

    /// Lifetime for SAs whose configuration sets none
    pub default_lifetime: SaLifetime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            replay_window_size: DEFAULT_WINDOW_SIZE,
            replay_protection: true,
            require_atomic: false,
            default_inbound_action: PolicyAction::Bypass,
            default_outbound_action: PolicyAction::Bypass,
            auth_failure_log_interval: Duration::from_secs(1),
            default_lifetime: SaLifetime::unlimited(),
        }
    }
}

impl EngineConfig {
    /// Create builder for engine configuration
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.replay_window_size) {
            return Err(Error::InvalidParameter(format!(
                "replay window size {} outside {}..={}",
                self.replay_window_size, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
            )));
        }
        if self.default_inbound_action == PolicyAction::Apply
            || self.default_outbound_action == PolicyAction::Apply
        {
            return Err(Error::InvalidParameter(
                "default action must be bypass or drop".into(),
            ));
        }
        self.default_lifetime.validate()
    }
}

/// Builder for EngineConfig
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set replay window size
    pub fn with_replay_window_size(mut self, size: u32) -> Self {
        self.config.replay_window_size = size;
        self
    }

    /// Enable or disable replay protection
    pub fn with_replay_protection(mut self, enabled: bool) -> Self {
        self.config.replay_protection = enabled;
        self
    }

    /// Restrict to atomic-capable transforms
    pub fn with_require_atomic(mut self, required: bool) -> Self {
        self.config.require_atomic = required;
        self
    }

    /// Set the inbound verdict when no policy matches
    pub fn with_default_inbound_action(mut self, action: PolicyAction) -> Self {
        self.config.default_inbound_action = action;
        self
    }

    /// Set the outbound verdict when no policy matches
    pub fn with_default_outbound_action(mut self, action: PolicyAction) -> Self {
        self.config.default_outbound_action = action;
        self
    }

    /// Set the authentication-failure log interval
    pub fn with_auth_failure_log_interval(mut self, interval: Duration) -> Self {
        self.config.auth_failure_log_interval = interval;
        self
    }

    /// Set the default SA lifetime
    pub fn with_default_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.config.default_lifetime = lifetime;
        self
    }

    /// Build EngineConfig with validation
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Algorithm name and key for one transform of an SA
#[derive(Clone)]
pub struct TransformKey {
    /// Registry name (e.g. `digest-sha1`, `cipher-aes-cbc`)
    pub algorithm: String,
    /// Key material
    pub key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for TransformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformKey")
            .field("algorithm", &self.algorithm)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Everything `add_sa` needs to install one SA
#[derive(Clone, Debug)]
pub struct SaConfig {
    /// SA identity
    pub id: SaId,

    /// Authentication transform (required for AH, optional for ESP)
    pub auth: Option<TransformKey>,

    /// Encryption transform (required for ESP, forbidden for AH)
    pub enc: Option<TransformKey>,

    /// Lifetime; the engine default applies when unset
    pub lifetime: Option<SaLifetime>,
}

impl SaConfig {
    /// Create builder for SA configuration
    pub fn builder() -> SaConfigBuilder {
        SaConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.id.spi == 0 {
            return Err(Error::InvalidSpi(0));
        }
        if self.id.prefix_len > 128 {
            return Err(Error::InvalidParameter(format!(
                "prefix length {} out of range",
                self.id.prefix_len
            )));
        }
        match self.id.protocol {
            IpsecProtocol::Esp if self.enc.is_none() => {
                return Err(Error::InvalidParameter(
                    "ESP SA requires an encryption transform".into(),
                ))
            }
            IpsecProtocol::Ah if self.auth.is_none() => {
                return Err(Error::InvalidParameter(
                    "AH SA requires an authentication transform".into(),
                ))
            }
            IpsecProtocol::Ah if self.enc.is_some() => {
                return Err(Error::InvalidParameter(
                    "AH SA cannot carry an encryption transform".into(),
                ))
            }
            _ => {}
        }
        if let Some(lifetime) = &self.lifetime {
            lifetime.validate()?;
        }
        Ok(())
    }
}

/// Builder for SaConfig
#[derive(Default)]
pub struct SaConfigBuilder {
    id: Option<SaId>,
    auth: Option<TransformKey>,
    enc: Option<TransformKey>,
    lifetime: Option<SaLifetime>,
}

impl SaConfigBuilder {
    /// Create new SA builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SA identity
    pub fn with_id(mut self, id: SaId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set authentication algorithm and key
    pub fn with_auth(mut self, algorithm: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.auth = Some(TransformKey {
            algorithm: algorithm.into(),
            key: Zeroizing::new(key.into()),
        });
        self
    }

    /// Set encryption algorithm and key
    pub fn with_encryption(
        mut self,
        algorithm: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        self.enc = Some(TransformKey {
            algorithm: algorithm.into(),
            key: Zeroizing::new(key.into()),
        });
        self
    }

    /// Set SA lifetime
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Build SaConfig with validation
    pub fn build(self) -> Result<SaConfig> {
        let config = SaConfig {
            id: self
                .id
                .ok_or_else(|| Error::InvalidParameter("SA identity is required".into()))?,
            auth: self.auth,
            enc: self.enc,
            lifetime: self.lifetime,
        };

        config.validate()?;
        Ok(config)
    }
}
