//! Protocol implementations for the Kestrel security stack.
//!
//! - **IPsec** - IPv6 AH/ESP transform engine with its SADB, SPD and the
//!   block-cipher/digest registry it draws transforms from
//!
//! # Features
//!
//! - `ipsec` (default) - IPsec transform engine
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ipsec::ReplayWindow;
//!
//! let mut window = ReplayWindow::new(64);
//! assert!(window.check_and_update(1));
//! assert!(!window.check_and_update(1));
//! ```
//!
//! # Security
//!
//! - All block ciphers and MACs are built on RustCrypto primitives
//! - Constant-time ICV comparison
//! - Secure memory handling with `zeroize`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
