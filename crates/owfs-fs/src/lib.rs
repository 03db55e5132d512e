//! # owfs-fs
//!
//! Directory and file manager for the 1-Wire filesystem.
//!
//! This crate lays a hierarchical filesystem over the page cache of a group
//! of 1-Wire memory devices:
//!
//! - **Paths**: [`path`] parses `/`-separated names of up to four
//!   characters with a numeric extension
//! - **Handles**: [`FileDescriptor`] opens, creates, reads, writes, lists,
//!   renames and deletes entries
//! - **Formatting**: [`FileDescriptor::format`] writes an empty filesystem
//!   over a single device or a master with satellites
//!
//! All page I/O goes through one shared [`owfs_cache::PageCache`] per device
//! group, which is locked for the duration of each operation.
//!
//! ## Example
//!
//! ```rust
//! use owfs_cache::registry::CacheRegistry;
//! use owfs_cache::sim::SimulatedBus;
//! use owfs_common::{DeviceAddress, OwfsConfig};
//! use owfs_fs::{CreateOptions, FileDescriptor};
//!
//! let bus = SimulatedBus::shared();
//! let address = DeviceAddress::new(0x0C);
//! bus.add_eeprom_device(address, 64, 32);
//! let registry = CacheRegistry::new(bus, OwfsConfig::default());
//!
//! let mut root = FileDescriptor::new(&registry, &[address], "/").unwrap();
//! root.format().unwrap();
//!
//! let mut logs = FileDescriptor::new(&registry, &[address], "/LOGS").unwrap();
//! logs.mkdir().unwrap();
//! let mut file = FileDescriptor::new(&registry, &[address], "/LOGS/DAY.1").unwrap();
//! file.create(CreateOptions::new()).unwrap();
//! file.write(b"21.5C").unwrap();
//! file.close().unwrap();
//!
//! assert_eq!(logs.list().unwrap(), vec!["DAY.1"]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bitmap;
mod chain;
mod descriptor;
mod device_map;
mod directory;
mod error;
mod format;
mod layout;
mod mount;
mod options;
pub mod path;

pub use bitmap::BitmapLocation;
pub use descriptor::{FileDescriptor, HandleState};
pub use error::{FsError, FsResult};
pub use layout::{DirEntry, Layout};
pub use mount::Mount;
pub use options::CreateOptions;
pub use path::{FsPath, NameElement};
