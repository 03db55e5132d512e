//! Configuration for the 1-Wire filesystem.
//!
//! All structures are serde-derivable so an embedding application can load
//! them from its own configuration file.

mod filesystem;

pub use filesystem::{CacheConfig, ConfigError, FsConfig, OwfsConfig};
