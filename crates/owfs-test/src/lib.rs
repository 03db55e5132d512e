//! # owfs-test
//!
//! Integration tests for the 1-Wire filesystem.
//!
//! This crate contains:
//! - Fixtures that put formatted filesystems on a simulated bus
//! - End-to-end scenarios under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, Once};

use owfs_cache::registry::CacheRegistry;
use owfs_cache::sim::SimulatedBus;
use owfs_common::{DeviceAddress, OwfsConfig};
use owfs_fs::{CreateOptions, FileDescriptor, FsResult};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Master address used by the single-device fixtures.
pub const MASTER: DeviceAddress = DeviceAddress::new(0x5A00_0000_1234_560C);

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init();
    });
}

/// A device group on a simulated bus and the registry serving it.
#[derive(Debug)]
pub struct Fixture {
    /// The simulated bus.
    pub bus: Arc<SimulatedBus>,
    /// Registry sharing one cache per group.
    pub registry: Arc<CacheRegistry>,
    /// Group addresses, master first.
    pub group: Vec<DeviceAddress>,
}

impl Fixture {
    /// One EEPROM device at [`MASTER`].
    pub fn eeprom(pages: usize, page_len: usize) -> Self {
        let bus = SimulatedBus::shared();
        bus.add_eeprom_device(MASTER, pages, page_len);
        Self::on_bus(bus, vec![MASTER])
    }

    /// One write-once device at [`MASTER`].
    pub fn otp(pages: usize, page_len: usize) -> Self {
        let bus = SimulatedBus::shared();
        bus.add_otp_device(MASTER, pages, page_len);
        Self::on_bus(bus, vec![MASTER])
    }

    /// EEPROM devices of `(address, pages, page_len)`, the first being the
    /// master.
    pub fn eeprom_group(devices: &[(DeviceAddress, usize, usize)]) -> Self {
        let bus = SimulatedBus::shared();
        for &(address, pages, page_len) in devices {
            bus.add_eeprom_device(address, pages, page_len);
        }
        let group = devices.iter().map(|&(address, _, _)| address).collect();
        Self::on_bus(bus, group)
    }

    /// Devices already on `bus`.
    pub fn on_bus(bus: Arc<SimulatedBus>, group: Vec<DeviceAddress>) -> Self {
        init_tracing();
        let registry = CacheRegistry::new(bus.clone(), OwfsConfig::for_testing());
        Self {
            bus,
            registry,
            group,
        }
    }

    /// Formats the group and flushes the result to the devices.
    pub fn formatted(self) -> FsResult<Self> {
        let mut root = self.fd("/")?;
        root.format()?;
        root.close()?;
        Ok(self)
    }

    /// Returns a handle on `path` in the group.
    pub fn fd(&self, path: &str) -> FsResult<FileDescriptor> {
        FileDescriptor::new(&self.registry, &self.group, path)
    }

    /// Returns a handle on `path` opened through `address` alone.
    pub fn fd_via(&self, address: DeviceAddress, path: &str) -> FsResult<FileDescriptor> {
        FileDescriptor::new(&self.registry, &[address], path)
    }

    /// Replaces the registry, so the next handle reads everything back from
    /// the devices. Handles still open keep the old caches.
    pub fn remount(&mut self) {
        debug!(master = %self.group[0], "remounting");
        self.registry = CacheRegistry::new(self.bus.clone(), OwfsConfig::for_testing());
    }

    /// Creates (or truncates) `path`, writes `data` and closes it.
    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let mut file = self.fd(path)?;
        file.create(CreateOptions::new().make_parents(true))?;
        file.write(data)?;
        file.close()
    }

    /// Reads the whole of `path`.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let mut file = self.fd(path)?;
        file.open()?;
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Returns the free bytes of the group.
    pub fn free_memory(&self) -> FsResult<u64> {
        self.fd("/")?.free_memory()
    }

    /// Returns the listing of the directory at `path`.
    pub fn list(&self, path: &str) -> FsResult<Vec<String>> {
        self.fd(path)?.list()
    }
}

/// Returns `len` bytes of a repeating, position-dependent pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
