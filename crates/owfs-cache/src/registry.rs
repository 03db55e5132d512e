//! Process-level registry of shared page caches.
//!
//! Every handle on a device group must go through the same [`PageCache`] so
//! that cached pages, the write log and the open-for-write set stay
//! coherent. The registry maps a group's master address to its cache and
//! hands out [`CacheLease`]s; when the last lease is dropped the entry is
//! removed and the cache torn down.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use owfs_common::{DeviceAddress, OwfsConfig};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::bank::DeviceSource;
use crate::cache::{CacheError, CacheResult, PageCache};

/// A page cache behind the lock that serializes all bus traffic of its
/// device group.
#[derive(Debug)]
pub struct SharedCache {
    master: DeviceAddress,
    /// Live leases.
    owners: AtomicUsize,
    inner: Mutex<PageCache>,
}

impl SharedCache {
    fn new(cache: PageCache) -> Self {
        Self {
            master: cache.master(),
            owners: AtomicUsize::new(0),
            inner: Mutex::new(cache),
        }
    }

    /// Returns the master address of the group.
    pub fn master(&self) -> DeviceAddress {
        self.master
    }

    /// Locks the cache for the duration of one logical operation.
    pub fn lock(&self) -> MutexGuard<'_, PageCache> {
        self.inner.lock()
    }
}

/// Registry of caches keyed by master address.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use owfs_cache::registry::CacheRegistry;
/// use owfs_cache::sim::SimulatedBus;
/// use owfs_common::{DeviceAddress, OwfsConfig};
///
/// let bus = SimulatedBus::shared();
/// let master = DeviceAddress::new(0x0C);
/// bus.add_eeprom_device(master, 32, 32);
///
/// let registry = CacheRegistry::new(bus, OwfsConfig::for_testing());
/// let lease = registry.acquire(&[master]).unwrap();
/// assert_eq!(lease.lock().total_pages(), 32);
/// assert!(registry.contains(master));
///
/// drop(lease);
/// assert!(!registry.contains(master));
/// ```
pub struct CacheRegistry {
    source: Arc<dyn DeviceSource>,
    caches: DashMap<DeviceAddress, Arc<SharedCache>>,
    config: OwfsConfig,
}

impl CacheRegistry {
    /// Creates a registry that opens devices through `source`.
    pub fn new(source: Arc<dyn DeviceSource>, config: OwfsConfig) -> Arc<Self> {
        Arc::new(Self {
            source,
            caches: DashMap::new(),
            config,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OwfsConfig {
        &self.config
    }

    /// Returns a lease on the cache for `group` (master first), creating it
    /// if no cache exists for the master yet.
    ///
    /// An existing cache is returned as-is even if its device list differs;
    /// use [`rebuild`](Self::rebuild) to replace it.
    pub fn acquire(self: &Arc<Self>, group: &[DeviceAddress]) -> CacheResult<CacheLease> {
        let master = *group
            .first()
            .ok_or_else(|| CacheError::invalid_geometry("empty device group"))?;

        // Owners are counted under the entry lock, as `release` checks them.
        let cache = match self.caches.entry(master) {
            Entry::Occupied(entry) => {
                trace!(%master, "reusing page cache");
                let cache = Arc::clone(entry.get());
                cache.owners.fetch_add(1, Ordering::AcqRel);
                cache
            }
            Entry::Vacant(entry) => {
                let cache = Arc::new(self.build(group)?);
                cache.owners.fetch_add(1, Ordering::AcqRel);
                entry.insert(Arc::clone(&cache));
                cache
            }
        };
        Ok(CacheLease {
            registry: Arc::clone(self),
            cache,
        })
    }

    /// Builds a fresh cache for `group` and installs it in place of any
    /// existing cache for the same master.
    ///
    /// Leases on the replaced cache keep working against it; new
    /// acquisitions get the rebuilt one.
    pub fn rebuild(self: &Arc<Self>, group: &[DeviceAddress]) -> CacheResult<CacheLease> {
        let cache = Arc::new(self.build(group)?);
        cache.owners.fetch_add(1, Ordering::AcqRel);
        let master = cache.master();
        self.caches.insert(master, Arc::clone(&cache));
        debug!(%master, devices = group.len(), "page cache rebuilt");
        Ok(CacheLease {
            registry: Arc::clone(self),
            cache,
        })
    }

    /// Returns true if a cache exists for `master`.
    pub fn contains(&self, master: DeviceAddress) -> bool {
        self.caches.contains_key(&master)
    }

    /// Returns the number of live caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Returns true if no cache is live.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    // ----- Private helpers -----

    fn build(&self, group: &[DeviceAddress]) -> CacheResult<SharedCache> {
        let devices = group
            .iter()
            .map(|&address| self.source.open_device(address))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SharedCache::new(PageCache::new(devices, self.config.cache.clone())?))
    }

    /// Drops one owner of `cache` and removes its entry once no lease is
    /// left.
    fn release(&self, cache: &Arc<SharedCache>) {
        if cache.owners.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let removed = self
            .caches
            .remove_if(&cache.master(), |_, current| {
                Arc::ptr_eq(current, cache) && current.owners.load(Ordering::Acquire) == 0
            })
            .is_some();
        if removed {
            debug!(master = %cache.master(), "page cache released");
        }
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.caches.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Shared ownership of one registered cache.
///
/// Cloning a lease adds an owner; dropping the last lease removes the cache
/// from the registry.
#[derive(Debug)]
pub struct CacheLease {
    registry: Arc<CacheRegistry>,
    cache: Arc<SharedCache>,
}

impl CacheLease {
    /// Returns the registry the lease came from.
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Returns true if both leases refer to the same cache instance.
    pub fn same_cache(&self, other: &CacheLease) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache)
    }
}

impl Clone for CacheLease {
    fn clone(&self) -> Self {
        self.cache.owners.fetch_add(1, Ordering::AcqRel);
        Self {
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Deref for CacheLease {
    type Target = SharedCache;

    fn deref(&self) -> &SharedCache {
        &self.cache
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.registry.release(&self.cache);
    }
}
