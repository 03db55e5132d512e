//! File and directory handles.
//!
//! A [`FileDescriptor`] binds one path to the shared page cache of one
//! device group. Every operation locks the cache for its whole duration, so
//! operations from different handles on the same group never interleave
//! their bus traffic.
//!
//! ```text
//!            open / create
//! Unresolved ─────────────▶ Resolved ──close──▶ Closed
//!     ▲                        │
//!     └──── delete / rename ───┘
//! ```

use std::io;
use std::sync::Arc;

use owfs_cache::{CacheLease, CacheRegistry};
use owfs_common::constants::{EXT_FLAG, EXT_MASK};
use owfs_common::{DeviceAddress, FsConfig};
use tracing::{debug, info, trace, warn};

use crate::chain::chain_pages;
use crate::directory::{is_directory_name, Located, Target, Volume};
use crate::error::{FsError, FsResult};
use crate::format;
use crate::mount::{probe, Mount, Probe};
use crate::options::CreateOptions;
use crate::path::{FsPath, NameElement};

/// Lifecycle of a [`FileDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The path has not been looked up.
    Unresolved,
    /// `open` or `create` found the path.
    Resolved,
    /// `close` released the handle.
    Closed,
}

/// Sequential access position.
#[derive(Debug)]
struct Cursor {
    page: usize,
    offset: usize,
    packet: Vec<u8>,
}

#[derive(Debug)]
struct Handle {
    state: HandleState,
    target: Option<Target>,
    cursor: Option<Cursor>,
    position: usize,
    mark_position: usize,
    mark_limit: usize,
    write_key: Option<String>,
    /// Last page of the chain while open for write.
    tail: Option<usize>,
}

impl Handle {
    fn new() -> Self {
        Self {
            state: HandleState::Unresolved,
            target: None,
            cursor: None,
            position: 0,
            mark_position: 0,
            mark_limit: 0,
            write_key: None,
            tail: None,
        }
    }

    fn resolved(&self, path: &FsPath) -> FsResult<Target> {
        self.target.ok_or_else(|| FsError::NotOpen {
            path: path.verbose(),
        })
    }

    fn resolve(&mut self, target: Target) {
        self.target = Some(target);
        self.state = HandleState::Resolved;
    }

    fn rewind(&mut self) {
        self.cursor = None;
        self.position = 0;
    }

    fn unresolve(&mut self) {
        self.rewind();
        self.target = None;
        self.tail = None;
        self.state = HandleState::Unresolved;
    }
}

/// A file or directory on a 1-Wire filesystem.
///
/// Writes are buffered in the group's page cache until `sync` or `close`.
/// Dropping a handle that was not closed flushes on a best-effort basis.
///
/// # Example
///
/// ```rust
/// use std::io::Read;
/// use owfs_cache::registry::CacheRegistry;
/// use owfs_cache::sim::SimulatedBus;
/// use owfs_common::{DeviceAddress, OwfsConfig};
/// use owfs_fs::{CreateOptions, FileDescriptor};
///
/// let bus = SimulatedBus::shared();
/// let address = DeviceAddress::new(0x0C);
/// bus.add_eeprom_device(address, 32, 32);
/// let registry = CacheRegistry::new(bus, OwfsConfig::default());
///
/// let mut root = FileDescriptor::new(&registry, &[address], "/").unwrap();
/// root.format().unwrap();
///
/// let mut file = FileDescriptor::new(&registry, &[address], "/NOTE/TDAY.1").unwrap();
/// file.create(CreateOptions::new().make_parents(true)).unwrap();
/// file.write(b"hello").unwrap();
/// file.close().unwrap();
///
/// let mut file = FileDescriptor::new(&registry, &[address], "/note/tday.1").unwrap();
/// file.open().unwrap();
/// let mut text = String::new();
/// file.read_to_string(&mut text).unwrap();
/// assert_eq!(text, "hello");
/// ```
#[derive(Debug)]
pub struct FileDescriptor {
    lease: Option<CacheLease>,
    path: FsPath,
    config: FsConfig,
    mount: Option<Mount>,
    handle: Handle,
}

impl FileDescriptor {
    /// Creates a handle on `path` in the filesystem of `group` (master
    /// first).
    ///
    /// The path is parsed before any device is touched.
    pub fn new(registry: &Arc<CacheRegistry>, group: &[DeviceAddress], path: &str) -> FsResult<Self> {
        let path = FsPath::parse(path)?;
        let lease = registry.acquire(group)?;
        Ok(Self {
            lease: Some(lease),
            path,
            config: registry.config().fs.clone(),
            mount: None,
            handle: Handle::new(),
        })
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> HandleState {
        self.handle.state
    }

    /// Returns the master address of the group the handle is bound to.
    pub fn master(&self) -> Option<DeviceAddress> {
        self.lease.as_ref().map(|lease| lease.master())
    }

    // =========================================================================
    // Open / Create / Close
    // =========================================================================

    /// Resolves the path for reading.
    ///
    /// Transient transport errors are retried up to
    /// `FsConfig::open_attempts` times.
    pub fn open(&mut self) -> FsResult<()> {
        let attempts = self.config.open_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_open() {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(path = %self.path, attempt, error = %err, "retrying open");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Creates the file or directory.
    ///
    /// Creating an existing file truncates it to one empty page unless
    /// `append` is set; creating an existing directory succeeds. A file
    /// handle is open for writing until it is closed or dropped, and no
    /// other handle may create the same file meanwhile.
    ///
    /// # Errors
    ///
    /// - `InvalidPath` for the root, a directory name with an extension, or
    ///   a file path that ends with a separator
    /// - `OpenForWrite` if another handle is writing the file
    /// - `NotFound` if a parent is missing and `make_parents` is not set
    /// - `NotAFile` / `AlreadyExists` if the other kind is in the way
    /// - `ReadOnly` for an existing read-only file
    /// - `OutOfSpace`
    pub fn create(&mut self, options: CreateOptions) -> FsResult<()> {
        self.with_volume(|volume, path, handle| {
            create_in(volume, path, handle, options, None).map(|_| ())
        })
    }

    /// Creates the file only if nothing exists at the path. Returns true if
    /// it was created.
    pub fn create_new_file(&mut self) -> FsResult<bool> {
        if self.exists()? {
            return Ok(false);
        }
        self.create(CreateOptions::new())?;
        Ok(true)
    }

    /// Creates the directory; its parent must exist.
    pub fn mkdir(&mut self) -> FsResult<()> {
        self.create(CreateOptions::new().directory(true))
    }

    /// Creates the directory and any missing parents.
    pub fn mkdirs(&mut self) -> FsResult<()> {
        self.create(CreateOptions::new().directory(true).make_parents(true))
    }

    /// Flushes the cache and releases the handle.
    ///
    /// If the flush fails the handle stays open so `close` can be retried.
    pub fn close(&mut self) -> FsResult<()> {
        if self.handle.state == HandleState::Closed {
            return Ok(());
        }
        self.sync()?;
        self.release();
        self.handle.unresolve();
        self.handle.state = HandleState::Closed;
        trace!(path = %self.path, "handle closed");
        Ok(())
    }

    /// Writes every buffered page of the group to the devices.
    pub fn sync(&self) -> FsResult<()> {
        let lease = self.lease()?;
        let mut cache = lease.lock();
        cache.clear_last_page_read();
        cache.sync()?;
        Ok(())
    }

    /// Writes an empty filesystem over the whole device group.
    ///
    /// Every file and directory is lost. The result is buffered until the
    /// next `sync`.
    pub fn format(&mut self) -> FsResult<()> {
        self.check_not_closed()?;
        let mount = {
            let lease = self.lease()?;
            let mut cache = lease.lock();
            cache.clear_last_page_read();
            format::format(&mut cache)?
        };
        self.mount = Some(mount);
        self.handle.unresolve();
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Reads into `buf` from the current position. Returns 0 at the end of
    /// the file.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let len = buf.len();
        self.with_volume(|volume, path, handle| advance(volume, path, handle, Some(buf), len))
    }

    /// Reads one byte, `None` at the end of the file.
    pub fn read_byte(&mut self) -> FsResult<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok((self.read(&mut byte)? == 1).then_some(byte[0]))
    }

    /// Skips up to `n` bytes. Returns the number skipped.
    pub fn skip(&mut self, n: usize) -> FsResult<usize> {
        self.with_volume(|volume, path, handle| advance(volume, path, handle, None, n))
    }

    /// Returns the bytes left in the current page.
    pub fn available(&self) -> FsResult<usize> {
        self.check_not_closed()?;
        let (Some(cursor), Some(mount)) = (&self.handle.cursor, self.mount) else {
            return Ok(0);
        };
        let end = cursor.packet.len().saturating_sub(mount.layout.ptr_len());
        Ok(end.saturating_sub(cursor.offset))
    }

    /// Remembers the current position for [`reset`](Self::reset), valid for
    /// the next `limit` bytes.
    pub fn mark(&mut self, limit: usize) {
        self.handle.mark_position = self.handle.position;
        self.handle.mark_limit = limit;
    }

    /// Returns to the marked position.
    ///
    /// Fails with `MarkExpired` if more than the mark limit was read since.
    pub fn reset(&mut self) -> FsResult<()> {
        self.check_not_closed()?;
        let position = self.handle.position;
        let mark_position = self.handle.mark_position;
        let mark_limit = self.handle.mark_limit;
        if position.saturating_sub(mark_position) > mark_limit {
            return Err(FsError::MarkExpired { limit: mark_limit });
        }
        self.handle.rewind();
        self.skip(mark_position)?;
        Ok(())
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Appends `buf` at the write position, growing the page chain as
    /// needed.
    pub fn write(&mut self, buf: &[u8]) -> FsResult<()> {
        self.check_not_closed()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.with_volume(|volume, path, handle| append(volume, path, handle, buf))
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, byte: u8) -> FsResult<()> {
        self.write(&[byte])
    }

    // =========================================================================
    // Directory operations
    // =========================================================================

    /// Deletes the file or the empty directory and frees its pages.
    ///
    /// # Errors
    ///
    /// - `NotFound`
    /// - `DirectoryNotEmpty`
    /// - `ReadOnly` for a read-only file
    /// - `OpenForWrite` if another handle is writing the file
    pub fn delete(&mut self) -> FsResult<()> {
        self.with_volume(|volume, path, handle| {
            let shown = path.verbose();
            let located = match volume.walk(path.elements_mut())? {
                None => return Err(FsError::not_found(shown)),
                Some(Target::Root) => {
                    return Err(FsError::invalid_path(shown, "the root directory cannot be deleted"))
                }
                Some(Target::Entry(located)) => located,
            };

            let start = located.entry.start_page;
            let pages = if located.entry.is_directory() {
                if !volume.is_empty_directory(start)? {
                    return Err(FsError::DirectoryNotEmpty { path: shown });
                }
                vec![start]
            } else {
                if located.entry.is_flagged() {
                    return Err(FsError::ReadOnly { path: shown });
                }
                if written_elsewhere(volume, path, handle) {
                    return Err(FsError::OpenForWrite { path: shown });
                }
                let layout = volume.layout();
                chain_pages(volume.cache(), layout, start)?
            };

            volume.remove_entry(&located)?;
            let mut bitmap = volume.bitmap()?;
            volume.free_pages(&mut bitmap, &pages)?;
            volume.store(&bitmap)?;

            if let Some(key) = handle.write_key.take() {
                volume.cache().release_open_for_write(&key);
            }
            handle.unresolve();
            debug!(path = %shown, pages = pages.len(), "deleted");
            Ok(())
        })
    }

    /// Returns the names in the directory, hidden entries excluded.
    pub fn list(&mut self) -> FsResult<Vec<String>> {
        self.with_volume(|volume, path, _| {
            let target = volume
                .walk(path.elements_mut())?
                .ok_or_else(|| FsError::not_found(path.verbose()))?;
            if !target.is_directory() {
                return Err(FsError::NotADirectory {
                    path: path.verbose(),
                });
            }
            volume.list(target.start_page())
        })
    }

    /// Moves the entry to the path of `dest`. No data pages are copied.
    ///
    /// Both handles must share one device group, and the destination must
    /// not exist.
    pub fn rename_to(&mut self, dest: &mut FileDescriptor) -> FsResult<()> {
        dest.check_not_closed()?;
        self.check_not_closed()?;
        self.ensure_mounted()?;
        dest.ensure_mounted()?;
        let shared = match (&self.lease, &dest.lease) {
            (Some(ours), Some(theirs)) => ours.same_cache(theirs),
            _ => false,
        };
        if !shared {
            return Err(FsError::CrossDevice);
        }

        self.with_volume(|volume, path, handle| {
            let shown = path.verbose();
            let source = match volume.walk(path.elements_mut())? {
                None => return Err(FsError::not_found(shown)),
                Some(Target::Root) => {
                    return Err(FsError::invalid_path(shown, "the root directory cannot be renamed"))
                }
                Some(Target::Entry(located)) => located,
            };
            let directory = source.entry.is_directory();
            if directory && is_within(dest.path.elements(), path.elements()) {
                return Err(FsError::invalid_path(
                    dest.path.verbose(),
                    "a directory cannot move into itself",
                ));
            }
            if !directory && written_elsewhere(volume, path, handle) {
                return Err(FsError::OpenForWrite { path: shown });
            }

            let reuse = Some((source.entry.start_page, source.entry.page_count));
            create_in(
                volume,
                &mut dest.path,
                &mut dest.handle,
                CreateOptions::new().directory(directory),
                reuse,
            )?;

            // Removing the source can shift the destination within a shared page.
            let Some(Target::Entry(source)) = volume.walk(path.elements_mut())? else {
                return Err(FsError::corrupt(format!("{shown} vanished during rename")));
            };
            volume.remove_entry(&source)?;
            if let Some(target) = volume.walk(dest.path.elements_mut())? {
                dest.handle.resolve(target);
            }

            if let Some(key) = handle.write_key.take() {
                volume.cache().release_open_for_write(&key);
            }
            handle.unresolve();
            debug!(from = %shown, to = %dest.path, "renamed");
            Ok(())
        })
    }

    /// Marks the file read-only.
    pub fn set_read_only(&mut self) -> FsResult<()> {
        self.with_volume(|volume, path, handle| {
            let mut located = match volume.walk(path.elements_mut())? {
                None => return Err(FsError::not_found(path.verbose())),
                Some(Target::Entry(located)) if !located.entry.is_directory() => located,
                Some(_) => {
                    return Err(FsError::NotAFile {
                        path: path.verbose(),
                    })
                }
            };
            let extension = located.entry.name.extension();
            located.entry.name.set_extension(extension | EXT_FLAG);
            volume.update_entry(&located)?;
            if handle.target.is_some() {
                handle.target = Some(Target::Entry(located));
            }
            Ok(())
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns true if the path exists.
    pub fn exists(&mut self) -> FsResult<bool> {
        Ok(self.lookup()?.is_some())
    }

    /// Returns true if the path exists.
    pub fn can_read(&mut self) -> FsResult<bool> {
        self.exists()
    }

    /// Returns true if the path exists and is not a read-only file.
    pub fn can_write(&mut self) -> FsResult<bool> {
        Ok(match self.lookup()? {
            None => false,
            Some(Target::Root) => true,
            Some(Target::Entry(located)) => {
                located.entry.is_directory() || !located.entry.is_flagged()
            }
        })
    }

    /// Returns true if the path is an existing file.
    pub fn is_file(&mut self) -> FsResult<bool> {
        Ok(matches!(self.lookup()?, Some(target) if !target.is_directory()))
    }

    /// Returns true if the path is an existing directory.
    pub fn is_directory(&mut self) -> FsResult<bool> {
        Ok(matches!(self.lookup()?, Some(target) if target.is_directory()))
    }

    /// Returns true if the path is a hidden directory.
    pub fn is_hidden(&mut self) -> FsResult<bool> {
        Ok(matches!(
            self.lookup()?,
            Some(Target::Entry(located))
                if located.entry.is_directory() && located.entry.is_flagged()
        ))
    }

    /// Returns the capacity of the pages the entry holds, in bytes. This is
    /// an upper bound of the file size.
    pub fn length(&mut self) -> FsResult<u64> {
        let usable = self.ensure_mounted()?.usable();
        Ok(match self.lookup()? {
            Some(Target::Entry(located)) => (located.entry.page_count * usable) as u64,
            _ => 0,
        })
    }

    /// Returns the layout of the mounted filesystem, reading the root page
    /// if this handle has not done so yet.
    pub fn mount(&mut self) -> FsResult<Mount> {
        self.check_not_closed()?;
        self.ensure_mounted()
    }

    /// Returns the bytes left in free pages.
    pub fn free_memory(&mut self) -> FsResult<u64> {
        self.with_volume(|volume, _, _| {
            let usable = volume.mount().usable();
            Ok((volume.free_pages_count()? * usable) as u64)
        })
    }

    /// Returns the pages of the entry's chain, in order.
    pub fn page_list(&mut self) -> FsResult<Vec<usize>> {
        self.with_volume(|volume, path, _| {
            let target = volume
                .walk(path.elements_mut())?
                .ok_or_else(|| FsError::not_found(path.verbose()))?;
            let layout = volume.layout();
            chain_pages(volume.cache(), layout, target.start_page())
        })
    }

    /// Returns the first page of the entry.
    pub fn start_page(&mut self) -> FsResult<usize> {
        let target = self
            .lookup()?
            .ok_or_else(|| FsError::not_found(self.path.verbose()))?;
        Ok(target.start_page())
    }

    /// Returns the final path element, empty for the root.
    pub fn name(&self) -> String {
        self.path.name().unwrap_or_default()
    }

    /// Returns the parent path, `None` for the root.
    pub fn parent(&self) -> Option<String> {
        self.path.parent()
    }

    /// Returns the path as written.
    pub fn path(&self) -> String {
        self.path.verbose()
    }

    // ----- Private helpers -----

    fn lease(&self) -> FsResult<&CacheLease> {
        self.lease.as_ref().ok_or(FsError::Closed)
    }

    fn check_not_closed(&self) -> FsResult<()> {
        match self.handle.state {
            HandleState::Closed => Err(FsError::Closed),
            _ => Ok(()),
        }
    }

    fn try_open(&mut self) -> FsResult<()> {
        self.with_volume(|volume, path, handle| {
            let target = volume
                .walk(path.elements_mut())?
                .ok_or_else(|| FsError::not_found(path.verbose()))?;
            handle.rewind();
            handle.resolve(target);
            trace!(path = %path, start = target.start_page(), "opened");
            Ok(())
        })
    }

    fn lookup(&mut self) -> FsResult<Option<Target>> {
        self.with_volume(|volume, path, _| volume.walk(path.elements_mut()))
    }

    /// Reads the root page once per handle, following a satellite to its
    /// master and rebuilding a cache whose device list is stale.
    fn ensure_mounted(&mut self) -> FsResult<Mount> {
        if let Some(mount) = self.mount {
            return Ok(mount);
        }
        let mut rehomed = false;
        let mut rebuilt = false;
        loop {
            let lease = self.lease()?;
            let probed = {
                let mut cache = lease.lock();
                cache.clear_last_page_read();
                probe(&mut cache)?
            };
            match probed {
                Probe::Mounted(mount) => {
                    self.mount = Some(mount);
                    return Ok(mount);
                }
                Probe::Satellite { master } => {
                    if rehomed {
                        return Err(FsError::corrupt(format!(
                            "master {master} is itself a satellite"
                        )));
                    }
                    rehomed = true;
                    info!(satellite = %lease.master(), %master, "following satellite to its master");
                    let next = lease.registry().acquire(&[master])?;
                    self.lease = Some(next);
                }
                Probe::StaleGroup { group } => {
                    if rebuilt {
                        return Err(FsError::corrupt(
                            "device map disagrees with the rebuilt device group",
                        ));
                    }
                    rebuilt = true;
                    info!(master = %lease.master(), devices = group.len(), "rebuilding cache from device map");
                    let next = lease.registry().rebuild(&group)?;
                    self.lease = Some(next);
                }
            }
        }
    }

    /// Runs `op` with the group's cache locked.
    fn with_volume<T>(
        &mut self,
        op: impl FnOnce(&mut Volume<'_>, &mut FsPath, &mut Handle) -> FsResult<T>,
    ) -> FsResult<T> {
        self.check_not_closed()?;
        let mount = self.ensure_mounted()?;
        let lease = self.lease.as_ref().ok_or(FsError::Closed)?;
        let mut cache = lease.lock();
        cache.clear_last_page_read();
        let mut volume = Volume::new(&mut cache, mount);
        op(&mut volume, &mut self.path, &mut self.handle)
    }

    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Some(key) = self.handle.write_key.take() {
                lease.lock().release_open_for_write(&key);
            }
        }
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if self.handle.state != HandleState::Closed {
            if let Some(lease) = &self.lease {
                if let Err(err) = lease.lock().sync() {
                    warn!(path = %self.path, error = %err, "flush on drop failed");
                }
            }
        }
        self.release();
    }
}

impl io::Read for FileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(FileDescriptor::read(self, buf)?)
    }
}

impl io::Write for FileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileDescriptor::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.sync()?)
    }
}

// ----- Operations under the cache lock -----

fn write_key(master: DeviceAddress, path: &FsPath) -> String {
    format!("{master}{}", path.canonical())
}

/// Returns true if a handle other than `handle` is writing `path`.
fn written_elsewhere(volume: &mut Volume<'_>, path: &FsPath, handle: &Handle) -> bool {
    let key = write_key(volume.cache().master(), path);
    handle.write_key.as_deref() != Some(key.as_str()) && volume.cache().is_open_for_write(&key)
}

/// Returns true if `path` is `root` or lies below it.
fn is_within(path: &[NameElement], root: &[NameElement]) -> bool {
    path.len() >= root.len()
        && path.iter().zip(root).all(|(a, b)| {
            a.name_bytes() == b.name_bytes()
                && a.extension() & EXT_MASK == b.extension() & EXT_MASK
        })
}

fn create_in(
    volume: &mut Volume<'_>,
    path: &mut FsPath,
    handle: &mut Handle,
    options: CreateOptions,
    reuse: Option<(usize, usize)>,
) -> FsResult<Located> {
    let shown = path.verbose();
    let last = *path
        .last()
        .ok_or_else(|| FsError::invalid_path(&shown, "the root directory always exists"))?;
    if options.directory && !is_directory_name(&last) {
        return Err(FsError::invalid_path(shown, "directory has an extension"));
    }
    if !options.directory && last.is_directory() {
        return Err(FsError::invalid_path(shown, "path names a directory"));
    }
    handle.rewind();

    let mut new_key = None;
    if !options.directory && reuse.is_none() && handle.write_key.is_none() {
        let key = write_key(volume.cache().master(), path);
        if !volume.cache().mark_open_for_write(&key) {
            return Err(FsError::OpenForWrite { path: shown });
        }
        new_key = Some(key);
    }

    match create_marked(volume, path, handle, options, reuse) {
        Ok(located) => {
            if new_key.is_some() {
                handle.write_key = new_key;
            }
            Ok(located)
        }
        Err(err) => {
            if let Some(key) = new_key {
                volume.cache().release_open_for_write(&key);
            }
            Err(err)
        }
    }
}

fn create_marked(
    volume: &mut Volume<'_>,
    path: &mut FsPath,
    handle: &mut Handle,
    options: CreateOptions,
    reuse: Option<(usize, usize)>,
) -> FsResult<Located> {
    let created = volume.create_path(path, options.directory, options.make_parents, reuse)?;
    let mut located = created.located;

    if created.existed && !options.directory {
        if located.entry.is_flagged() {
            return Err(FsError::ReadOnly {
                path: path.verbose(),
            });
        }
        if options.append {
            let layout = volume.layout();
            let pages = chain_pages(volume.cache(), layout, located.entry.start_page)?;
            let mut length = 0;
            let mut tail = None;
            for &page in &pages {
                let packet = volume.read(page)?;
                let end = packet.len() - layout.ptr_len();
                length += end;
                tail = Some(Cursor {
                    page,
                    offset: end,
                    packet,
                });
            }
            handle.tail = tail.as_ref().map(|cursor| cursor.page);
            handle.cursor = tail;
            handle.position = length;
        } else {
            volume.truncate(&mut located)?;
            handle.tail = Some(located.entry.start_page);
        }
    } else if !options.directory && reuse.is_none() {
        handle.tail = Some(located.entry.start_page);
    }

    handle.resolve(Target::Entry(located));
    debug!(
        path = %path,
        directory = options.directory,
        existed = created.existed,
        start = located.entry.start_page,
        "created"
    );
    Ok(located)
}

/// Moves the read cursor forward by up to `len` bytes, copying them into
/// `sink` when given.
fn advance(
    volume: &mut Volume<'_>,
    path: &FsPath,
    handle: &mut Handle,
    mut sink: Option<&mut [u8]>,
    len: usize,
) -> FsResult<usize> {
    let target = handle.resolved(path)?;
    if target.is_directory() {
        return Err(FsError::NotAFile {
            path: path.verbose(),
        });
    }
    let layout = volume.layout();
    let total = volume.mount().total_pages;

    if handle.cursor.is_none() {
        let page = target.start_page();
        handle.cursor = Some(Cursor {
            page,
            offset: 0,
            packet: volume.read(page)?,
        });
        handle.position = 0;
    }
    let Some(cursor) = handle.cursor.as_mut() else {
        return Ok(0);
    };

    let mut count = 0;
    let mut hops = 0;
    while count < len {
        let end = cursor.packet.len().saturating_sub(layout.ptr_len());
        if cursor.offset >= end {
            let next = layout.next_page(&cursor.packet)?;
            if next == 0 {
                break;
            }
            hops += 1;
            if hops > total {
                return Err(FsError::corrupt("looping page pointers"));
            }
            cursor.packet = volume.read(next)?;
            cursor.page = next;
            cursor.offset = 0;
            continue;
        }
        let n = (len - count).min(end - cursor.offset);
        if let Some(buf) = sink.as_deref_mut() {
            buf[count..count + n].copy_from_slice(&cursor.packet[cursor.offset..cursor.offset + n]);
        }
        count += n;
        cursor.offset += n;
        handle.position += n;
    }
    Ok(count)
}

/// Appends `buf` to the file's last page, chaining new pages as each one
/// fills. The entry's page count is bumped only after the new page is
/// linked in.
///
/// Writes always land at the chain tail. The read cursor follows them only
/// if it already sat at the end of the file.
fn append(volume: &mut Volume<'_>, path: &FsPath, handle: &mut Handle, buf: &[u8]) -> FsResult<()> {
    let mut located = match (handle.write_key.as_ref(), handle.target) {
        (Some(_), Some(Target::Entry(located))) => located,
        _ => {
            return Err(FsError::NotOpenForWrite {
                path: path.verbose(),
            })
        }
    };
    if located.entry.is_directory() {
        return Err(FsError::NotAFile {
            path: path.verbose(),
        });
    }
    let mount = volume.mount();
    let layout = mount.layout;
    let ptr_len = layout.ptr_len();
    let max = mount.max_packet_data_length;

    let tail = match handle.tail {
        Some(page) => page,
        None => {
            let pages = chain_pages(volume.cache(), layout, located.entry.start_page)?;
            pages.last().copied().unwrap_or(located.entry.start_page)
        }
    };
    let following = handle.cursor.as_ref().map_or(true, |cursor| {
        cursor.page == tail && cursor.offset + ptr_len >= cursor.packet.len()
    });

    let mut page = tail;
    let mut packet = volume.read(page)?;
    if layout.next_page(&packet)? != 0 {
        return Err(FsError::corrupt(format!("{path} has pages past its tail")));
    }

    let mut rest = buf;
    while !rest.is_empty() {
        if packet.len() >= max {
            let mut bitmap = volume.bitmap()?;
            let new_page = volume.allocate(&mut bitmap, true)?;
            volume.write(new_page, &layout.empty_page())?;
            let at = packet.len() - ptr_len;
            layout.write_ptr(&mut packet, at, new_page);
            volume.write(page, &packet)?;
            volume.store(&bitmap)?;

            located.entry.page_count += 1;
            volume.update_entry(&located)?;
            handle.target = Some(Target::Entry(located));
            handle.tail = Some(new_page);
            trace!(page = new_page, pages = located.entry.page_count, "file grew");

            page = new_page;
            packet = layout.empty_page();
        }

        let at = packet.len() - ptr_len;
        let n = rest.len().min(max - packet.len());
        packet.truncate(at);
        packet.extend_from_slice(&rest[..n]);
        packet.resize(at + n + ptr_len, 0);
        volume.write(page, &packet)?;
        rest = &rest[n..];
        if following {
            handle.position += n;
        }
    }
    handle.tail = Some(page);

    if following {
        let offset = packet.len() - ptr_len;
        handle.cursor = Some(Cursor {
            page,
            offset,
            packet,
        });
    } else if let Some(cursor) = handle.cursor.as_mut() {
        if cursor.page == tail {
            cursor.packet = volume.read(tail)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use owfs_cache::sim::SimulatedBus;
    use owfs_common::{ErrorKind, OwfsConfig};
    use std::io::{Read, Write};

    const ADDRESS: DeviceAddress = DeviceAddress::new(0x0C);

    fn registry(pages: usize, page_len: usize) -> (Arc<SimulatedBus>, Arc<CacheRegistry>) {
        let bus = SimulatedBus::shared();
        bus.add_eeprom_device(ADDRESS, pages, page_len);
        let registry = CacheRegistry::new(bus.clone(), OwfsConfig::for_testing());
        let mut root = FileDescriptor::new(&registry, &[ADDRESS], "/").unwrap();
        root.format().unwrap();
        root.close().unwrap();
        (bus, registry)
    }

    fn fd(registry: &Arc<CacheRegistry>, path: &str) -> FileDescriptor {
        FileDescriptor::new(registry, &[ADDRESS], path).unwrap()
    }

    fn read_all(file: &mut FileDescriptor) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_write_then_read_back() {
        let (_bus, registry) = registry(32, 32);
        let data: Vec<u8> = (0..100).collect();

        let mut file = fd(&registry, "/DATA.1");
        file.create(CreateOptions::new()).unwrap();
        file.write(&data).unwrap();
        assert_eq!(file.page_list().unwrap().len(), 4);
        assert_eq!(file.length().unwrap(), 4 * 28);
        file.close().unwrap();
        assert_eq!(file.state(), HandleState::Closed);

        let mut file = fd(&registry, "/data.1");
        file.open().unwrap();
        assert_eq!(read_all(&mut file), data);
        assert_eq!(file.read_byte().unwrap(), None);
    }

    #[test]
    fn test_invalid_path_rejected_before_device_access() {
        let bus = SimulatedBus::shared();
        let registry = CacheRegistry::new(bus, OwfsConfig::for_testing());
        let err = FileDescriptor::new(&registry, &[ADDRESS], "/TOOLONG").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[test]
    fn test_handle_states() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        assert_eq!(file.state(), HandleState::Unresolved);
        let mut buf = [0u8; 4];
        assert!(matches!(file.read(&mut buf), Err(FsError::NotOpen { .. })));
        assert_eq!(file.open().unwrap_err().kind(), ErrorKind::NotFound);

        file.create(CreateOptions::new()).unwrap();
        assert_eq!(file.state(), HandleState::Resolved);
        file.close().unwrap();
        assert!(matches!(file.read(&mut buf), Err(FsError::Closed)));
        assert!(matches!(file.exists(), Err(FsError::Closed)));
        file.close().unwrap();
    }

    #[test]
    fn test_single_writer() {
        let (_bus, registry) = registry(32, 32);
        let mut first = fd(&registry, "/LOG.1");
        first.create(CreateOptions::new()).unwrap();

        let mut second = fd(&registry, "/log.1");
        assert!(matches!(
            second.create(CreateOptions::new()),
            Err(FsError::OpenForWrite { .. })
        ));
        assert!(matches!(second.delete(), Err(FsError::OpenForWrite { .. })));

        first.close().unwrap();
        second.create(CreateOptions::new()).unwrap();
    }

    #[test]
    fn test_write_requires_create() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.close().unwrap();

        let mut reader = fd(&registry, "/A.1");
        reader.open().unwrap();
        assert!(matches!(
            reader.write(b"x"),
            Err(FsError::NotOpenForWrite { .. })
        ));
    }

    #[test]
    fn test_recreate_truncates() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.write(&[7u8; 80]).unwrap();
        let free = file.free_memory().unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        assert_eq!(file.free_memory().unwrap(), free + 2 * 28);
        file.write(b"new").unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.open().unwrap();
        assert_eq!(read_all(&mut file), b"new");
    }

    #[test]
    fn test_append_keeps_contents() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.write(&[1u8; 30]).unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new().append(true)).unwrap();
        file.write(&[2u8; 30]).unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.open().unwrap();
        let data = read_all(&mut file);
        assert_eq!(data.len(), 60);
        assert!(data[..30].iter().all(|&b| b == 1));
        assert!(data[30..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_mark_and_reset() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.write(&(0..60).collect::<Vec<u8>>()).unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.open().unwrap();
        assert_eq!(file.skip(10).unwrap(), 10);
        assert_eq!(file.available().unwrap(), 18);
        file.mark(40);
        let mut buf = [0u8; 30];
        assert_eq!(file.read(&mut buf).unwrap(), 30);
        file.reset().unwrap();
        assert_eq!(file.read_byte().unwrap(), Some(10));

        file.mark(5);
        file.skip(20).unwrap();
        assert!(matches!(file.reset(), Err(FsError::MarkExpired { limit: 5 })));
    }

    #[test]
    fn test_read_only() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.close().unwrap();

        let mut file = fd(&registry, "/A.1");
        assert!(file.can_write().unwrap());
        file.set_read_only().unwrap();
        assert!(!file.can_write().unwrap());
        assert!(file.can_read().unwrap());
        assert!(matches!(
            file.create(CreateOptions::new()),
            Err(FsError::ReadOnly { .. })
        ));
        assert!(matches!(file.delete(), Err(FsError::ReadOnly { .. })));

        let mut dir = fd(&registry, "/SUB");
        dir.mkdir().unwrap();
        assert!(matches!(dir.set_read_only(), Err(FsError::NotAFile { .. })));
    }

    #[test]
    fn test_directory_queries() {
        let (_bus, registry) = registry(32, 32);
        let mut dir = fd(&registry, "/A/B");
        assert!(matches!(dir.mkdir(), Err(FsError::NotFound { .. })));
        dir.mkdirs().unwrap();
        dir.mkdirs().unwrap();
        assert!(dir.is_directory().unwrap());
        assert!(!dir.is_file().unwrap());
        assert!(!dir.is_hidden().unwrap());
        assert_eq!(dir.name(), "B");
        assert_eq!(dir.parent().as_deref(), Some("/A"));

        let mut root = fd(&registry, "/");
        assert!(root.exists().unwrap());
        assert!(root.is_directory().unwrap());
        root.open().unwrap();
        assert_eq!(root.list().unwrap(), vec!["A"]);
        assert_eq!(root.start_page().unwrap(), 0);
        assert!(matches!(root.delete(), Err(FsError::InvalidPath { .. })));

        let mut bad = fd(&registry, "/A/C.5");
        assert!(matches!(bad.mkdir(), Err(FsError::InvalidPath { .. })));
        bad.create(CreateOptions::new()).unwrap();
        assert!(matches!(bad.list(), Err(FsError::NotADirectory { .. })));
    }

    #[test]
    fn test_delete_directory_must_be_empty() {
        let (_bus, registry) = registry(32, 32);
        let mut sub = fd(&registry, "/SUB");
        sub.mkdir().unwrap();
        let mut file = fd(&registry, "/SUB/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.close().unwrap();

        assert!(matches!(sub.delete(), Err(FsError::DirectoryNotEmpty { .. })));
        let mut file = fd(&registry, "/SUB/A.1");
        file.delete().unwrap();
        sub.delete().unwrap();
        assert!(!sub.exists().unwrap());
    }

    #[test]
    fn test_rename() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/OLD.1");
        file.create(CreateOptions::new()).unwrap();
        file.write(b"payload").unwrap();
        file.close().unwrap();
        let mut taken = fd(&registry, "/TAKE.1");
        taken.create(CreateOptions::new()).unwrap();
        taken.close().unwrap();

        let mut source = fd(&registry, "/OLD.1");
        let start = source.start_page().unwrap();
        let mut occupied = fd(&registry, "/TAKE.1");
        assert!(matches!(
            source.rename_to(&mut occupied),
            Err(FsError::AlreadyExists { .. })
        ));

        let mut dest = fd(&registry, "/NEW.2");
        source.rename_to(&mut dest).unwrap();
        assert!(!source.exists().unwrap());
        assert_eq!(dest.start_page().unwrap(), start);
        assert_eq!(read_all(&mut dest), b"payload");
    }

    #[test]
    fn test_directory_cannot_move_into_itself() {
        let (_bus, registry) = registry(32, 32);
        let mut dir = fd(&registry, "/A");
        dir.mkdir().unwrap();
        let mut inner = fd(&registry, "/A/B/");
        assert!(matches!(
            dir.rename_to(&mut inner),
            Err(FsError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_rename_across_groups() {
        let (bus, registry) = registry(32, 32);
        let other = DeviceAddress::new(0x2C);
        bus.add_eeprom_device(other, 32, 32);
        let mut root = FileDescriptor::new(&registry, &[other], "/").unwrap();
        root.format().unwrap();

        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        let mut dest = FileDescriptor::new(&registry, &[other], "/B.1").unwrap();
        assert!(matches!(file.rename_to(&mut dest), Err(FsError::CrossDevice)));
    }

    #[test]
    fn test_create_new_file() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        assert!(file.create_new_file().unwrap());
        file.close().unwrap();
        let mut again = fd(&registry, "/A.1");
        assert!(!again.create_new_file().unwrap());
    }

    #[test]
    fn test_io_traits() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.write_all(b"through std::io").unwrap();
        file.flush().unwrap();
        drop(file);

        let mut file = fd(&registry, "/A.1");
        file.open().unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert_eq!(text, "through std::io");
    }

    #[test]
    fn test_open_retries_transient_errors() {
        let bus = SimulatedBus::shared();
        bus.add_eeprom_device(ADDRESS, 32, 32);
        let config = OwfsConfig::for_testing();
        let registry = CacheRegistry::new(bus.clone(), config.clone());
        let mut root = fd(&registry, "/");
        root.format().unwrap();
        root.close().unwrap();

        let mut patient = config;
        patient.fs = FsConfig::new().with_open_attempts(3);
        let registry = CacheRegistry::new(bus.clone(), patient);
        let mut file = fd(&registry, "/");
        bus.fail_next_operations(ADDRESS, 1);
        file.open().unwrap();
    }

    #[test]
    fn test_trailing_separator_is_not_a_file() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/X/");
        let err = file.create(CreateOptions::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(file.state(), HandleState::Unresolved);
        assert!(!file.exists().unwrap());

        let mut plain = fd(&registry, "/X");
        plain.create(CreateOptions::new()).unwrap();
        assert!(plain.is_file().unwrap());
    }

    #[test]
    fn test_write_lands_at_tail_after_reset() {
        let (_bus, registry) = registry(32, 32);
        let data: Vec<u8> = (0..100).collect();
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.mark(1000);
        file.write(&data).unwrap();
        let pages = file.page_list().unwrap();

        file.reset().unwrap();
        file.skip(10).unwrap();
        file.write(&[0xEE; 5]).unwrap();
        assert_eq!(file.page_list().unwrap(), pages);

        // The rest of the file, new tail bytes included, is still readable.
        let rest = read_all(&mut file);
        assert_eq!(rest.len(), 95);
        assert_eq!(&rest[..90], &data[10..]);
        assert_eq!(&rest[90..], &[0xEE; 5]);
    }

    #[test]
    fn test_reader_on_tail_page_sees_new_bytes() {
        let (_bus, registry) = registry(32, 32);
        let mut file = fd(&registry, "/A.1");
        file.create(CreateOptions::new()).unwrap();
        file.mark(100);
        file.write(b"abcdef").unwrap();
        file.reset().unwrap();
        assert_eq!(file.read_byte().unwrap(), Some(b'a'));

        file.write(b"gh").unwrap();
        assert_eq!(read_all(&mut file), b"bcdefgh");
    }
}
