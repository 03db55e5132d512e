//! # owfs-common
//!
//! Common types, error codes, and configuration for the 1-Wire filesystem.
//!
//! This crate provides the foundational pieces shared by the page cache and
//! the directory/file manager:
//!
//! - **Types**: `PageNumber` and `DeviceAddress`
//! - **Errors**: the stable `ErrorKind` taxonomy every layer reports through
//! - **Config**: cache and filesystem tuning knobs
//! - **Constants**: on-media layout constants
//! - **Bits**: LSB-first bitmap helpers
//!
//! ## Example
//!
//! ```rust
//! use owfs_common::types::{DeviceAddress, PageNumber};
//!
//! let master = DeviceAddress::new(0x5A00_0000_1234_560C);
//! assert_eq!(master.family_code(), 0x0C);
//! assert!(PageNumber::ROOT.is_root());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bits;
pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{CacheConfig, ConfigError, FsConfig, OwfsConfig};
pub use error::ErrorKind;
pub use types::{DeviceAddress, PageNumber};
