//! Core traits for Kestrel security modules

use crate::KestrelResult;

/// Lifecycle state reported by a [`SecurityModule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Constructed, `init` not yet called
    Created,
    /// Initialized and serving requests
    Running,
    /// Shut down; state has been released
    Stopped,
}

/// Security module interface
///
/// Protocol engines implement this trait so a host can bring them up and
/// tear them down uniformly.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// Module description
    fn description(&self) -> &'static str;

    /// Current lifecycle state
    fn state(&self) -> ModuleState;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&self) -> KestrelResult<()> {
        Ok(())
    }

    /// Shutdown the module, releasing any state it holds
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&self) -> KestrelResult<()> {
        Ok(())
    }
}
