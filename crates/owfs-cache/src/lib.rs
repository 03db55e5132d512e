//! # owfs-cache
//!
//! Page cache for the 1-Wire filesystem.
//!
//! This crate sits between the directory/file manager and the memory banks
//! of 1-Wire devices:
//!
//! - **Bank contract**: [`bank`] defines ordinary and write-once paged
//!   memory banks and how devices are opened
//! - **Packets**: [`packet`] frames page payloads with the 1-Wire CRC16
//! - **Cache**: [`cache::PageCache`] caches pages, buffers writes and
//!   handles write-once redirection
//! - **Registry**: [`registry::CacheRegistry`] shares one cache per device
//!   group
//! - **Simulation**: [`sim`] provides in-memory EEPROM and OTP devices
//!
//! ## Example
//!
//! ```rust
//! use owfs_cache::registry::CacheRegistry;
//! use owfs_cache::sim::SimulatedBus;
//! use owfs_common::{DeviceAddress, OwfsConfig, PageNumber};
//!
//! let bus = SimulatedBus::shared();
//! let address = DeviceAddress::new(0x0C);
//! bus.add_eeprom_device(address, 32, 32);
//!
//! let registry = CacheRegistry::new(bus, OwfsConfig::default());
//! let lease = registry.acquire(&[address]).unwrap();
//! let mut cache = lease.lock();
//! cache.write_page_packet(PageNumber::new(3), b"hello").unwrap();
//! cache.sync().unwrap();
//! assert_eq!(cache.read_page_packet(PageNumber::new(3)).unwrap(), b"hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bank;
pub mod cache;
pub mod packet;
pub mod registry;
pub mod sim;

pub use bank::{BankError, BankGeometry, BankResult, DeviceSource, MemoryBank, MemoryDevice};
pub use cache::{CacheError, CacheResult, PageCache, PageState};
pub use registry::{CacheLease, CacheRegistry, SharedCache};
