//! # Kestrel Platform
//!
//! Core platform types and traits shared by the Kestrel security stack.
//!
//! This crate provides:
//! - Unified error types (`KestrelError`, `KestrelResult`)
//! - The `SecurityModule` lifecycle trait implemented by protocol engines
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn load_policy(name: &str) -> KestrelResult<String> {
//!     if name.is_empty() {
//!         return Err(KestrelError::Config("empty policy name".to_string()));
//!     }
//!     Ok(name.to_string())
//! }
//!
//! # fn main() -> KestrelResult<()> {
//! let policy = load_policy("default")?;
//! assert_eq!(policy, "default");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{KestrelError, KestrelResult};
pub use traits::{ModuleState, SecurityModule};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
