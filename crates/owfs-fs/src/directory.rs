//! Directory engine.
//!
//! A [`Volume`] borrows the locked page cache of a mounted group for the
//! length of one logical operation. It finds, creates, updates and removes
//! directory entries, and allocates or frees pages through the bitmap
//! placement chosen at mount time.
//!
//! Directory pages hold entries packed back to back. The first page of a
//! directory starts with the control area; continuation pages start with an
//! entry. New entries are appended before the next-page pointer of the last
//! page, and a full last page gets a fresh page chained after it.

use owfs_cache::PageCache;
use owfs_common::constants::{EXT_DIRECTORY, EXT_UNKNOWN, NAME_CHARS, ROOT_NAME};
use owfs_common::PageNumber;
use tracing::{debug, trace};

use crate::bitmap::PageBitmap;
use crate::chain::chain_pages;
use crate::error::{FsError, FsResult};
use crate::layout::{DirEntry, Layout};
use crate::mount::Mount;
use crate::path::{FsPath, NameElement};

/// A directory entry and where it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Located {
    /// Directory page holding the entry.
    pub dir_page: usize,
    /// Byte offset of the entry in that page's packet.
    pub offset: usize,
    /// Decoded entry.
    pub entry: DirEntry,
}

/// What a path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// The root directory, which has no entry of its own.
    Root,
    /// A file or sub-directory.
    Entry(Located),
}

impl Target {
    pub fn start_page(&self) -> usize {
        match self {
            Self::Root => PageNumber::ROOT.index(),
            Self::Entry(located) => located.entry.start_page,
        }
    }

    pub fn is_directory(&self) -> bool {
        match self {
            Self::Root => true,
            Self::Entry(located) => located.entry.is_directory(),
        }
    }
}

/// Outcome of searching one directory.
#[derive(Debug)]
pub(crate) enum Lookup {
    Found(Located),
    /// Not present; `dir_page`/`packet` are the directory's last page,
    /// where a new entry would go.
    Missing { dir_page: usize, packet: Vec<u8> },
}

/// Outcome of creating a path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Created {
    pub located: Located,
    /// The final element was already there.
    pub existed: bool,
}

/// Page-level view of a mounted filesystem.
pub(crate) struct Volume<'a> {
    cache: &'a mut PageCache,
    mount: Mount,
}

impl<'a> Volume<'a> {
    pub fn new(cache: &'a mut PageCache, mount: Mount) -> Self {
        Self { cache, mount }
    }

    #[inline]
    pub fn mount(&self) -> Mount {
        self.mount
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.mount.layout
    }

    pub fn cache(&mut self) -> &mut PageCache {
        &mut *self.cache
    }

    pub fn read(&mut self, page: usize) -> FsResult<Vec<u8>> {
        Ok(self.cache.read_page_packet(PageNumber::new(page))?)
    }

    pub fn write(&mut self, page: usize, packet: &[u8]) -> FsResult<()> {
        self.cache.write_page_packet(PageNumber::new(page), packet)?;
        Ok(())
    }

    pub fn bitmap(&mut self) -> FsResult<PageBitmap> {
        PageBitmap::load(self.cache, self.mount.layout, self.mount.bitmap)
    }

    pub fn store(&mut self, bitmap: &PageBitmap) -> FsResult<()> {
        bitmap.store(self.cache)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Searches the directory starting at `dir_start` for `name`,
    /// reconciling an undetermined extension against the entry found.
    pub fn find(&mut self, dir_start: usize, name: &mut NameElement) -> FsResult<Lookup> {
        let layout = self.layout();
        let ptr_len = layout.ptr_len();
        let entry_len = layout.entry_len();
        let mut page = dir_start;
        let mut offset = layout.control_len();

        for _ in 0..self.mount.total_pages {
            let packet = self.read(page)?;
            let next = layout.next_page(&packet)?;
            let end = packet.len() - ptr_len;

            while offset + entry_len <= end {
                if name.matches(&packet[offset..offset + entry_len]) {
                    trace!(page, offset, %name, "entry found");
                    return Ok(Lookup::Found(Located {
                        dir_page: page,
                        offset,
                        entry: DirEntry::decode(layout, &packet, offset),
                    }));
                }
                offset += entry_len;
            }

            if next == 0 {
                return Ok(Lookup::Missing {
                    dir_page: page,
                    packet,
                });
            }
            page = next;
            offset = 0;
        }
        Err(FsError::corrupt("looping directory pages"))
    }

    /// Resolves every element of `elements` from the root. Returns `None`
    /// if an element is missing.
    pub fn walk(&mut self, elements: &mut [NameElement]) -> FsResult<Option<Target>> {
        let mut target = Target::Root;
        for element in elements.iter_mut() {
            if !target.is_directory() {
                return Ok(None);
            }
            match self.find(target.start_page(), element)? {
                Lookup::Found(located) => target = Target::Entry(located),
                Lookup::Missing { .. } => return Ok(None),
            }
        }
        Ok(Some(target))
    }

    /// Returns true if the directory starting at `start` has no entries.
    pub fn is_empty_directory(&mut self, start: usize) -> FsResult<bool> {
        let layout = self.layout();
        let packet = self.read(start)?;
        Ok(packet.len() == layout.empty_dir_len() && layout.next_page(&packet)? == 0)
    }

    /// Returns the display names of the listed entries of a directory.
    pub fn list(&mut self, dir_start: usize) -> FsResult<Vec<String>> {
        let layout = self.layout();
        let ptr_len = layout.ptr_len();
        let entry_len = layout.entry_len();
        let total = self.mount.total_pages;
        let mut names = Vec::new();
        let mut page = dir_start;
        let mut offset = layout.control_len();

        for _ in 0..total {
            let packet = self.read(page)?;
            let next = layout.next_page(&packet)?;
            let end = packet.len() - ptr_len;
            while offset + entry_len <= end {
                let entry = DirEntry::decode(layout, &packet, offset);
                if entry.is_listed() {
                    names.push(entry.display_name());
                }
                offset += entry_len;
            }
            if names.len() > total {
                break;
            }

            if next == 0 {
                return Ok(names);
            }
            page = next;
            offset = 0;
        }
        Err(FsError::corrupt("looping directory pages"))
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Creates every missing element of `path`.
    ///
    /// Intermediate directories are only created with `make_parents`. With
    /// `reuse`, the final entry points at an existing `(start, count)` chain
    /// instead of a new page, and must not exist yet.
    pub fn create_path(
        &mut self,
        path: &mut FsPath,
        directory: bool,
        make_parents: bool,
        reuse: Option<(usize, usize)>,
    ) -> FsResult<Created> {
        let shown = path.canonical();
        let depth = path.depth();
        let mut parent_name = ROOT_NAME;
        let mut dir_start = PageNumber::ROOT.index();
        let mut created = None;

        for (index, element) in path.elements_mut().iter_mut().enumerate() {
            let last = index + 1 == depth;
            let located = match self.find(dir_start, element)? {
                Lookup::Found(located) => {
                    if last {
                        let existing = located.entry.is_directory();
                        if reuse.is_some() || existing != directory {
                            return Err(if !directory && existing {
                                FsError::NotAFile {
                                    path: shown.clone(),
                                }
                            } else {
                                FsError::AlreadyExists {
                                    path: shown.clone(),
                                }
                            });
                        }
                        created = Some(Created {
                            located,
                            existed: true,
                        });
                    }
                    located
                }
                Lookup::Missing { dir_page, packet } => {
                    if !last && !make_parents {
                        return Err(FsError::not_found(shown.clone()));
                    }
                    if element.is_unresolved() {
                        element.set_extension(if directory || !last { EXT_DIRECTORY } else { 0 });
                    }
                    let located = self.create_entry(
                        dir_page,
                        packet,
                        *element,
                        if last { reuse } else { None },
                        parent_name,
                        dir_start,
                    )?;
                    if last {
                        created = Some(Created {
                            located,
                            existed: false,
                        });
                    }
                    located
                }
            };
            parent_name.copy_from_slice(element.name_bytes());
            dir_start = located.entry.start_page;
        }

        created.ok_or_else(|| FsError::invalid_path(shown, "the root directory always exists"))
    }

    /// Appends `name` to the directory whose last page is `dir_page`.
    ///
    /// Without `reuse`, a start page is allocated and initialized as an
    /// empty file or an empty sub-directory pointing back at
    /// `parent_name`/`parent_start`.
    pub fn create_entry(
        &mut self,
        dir_page: usize,
        mut packet: Vec<u8>,
        name: NameElement,
        reuse: Option<(usize, usize)>,
        parent_name: [u8; NAME_CHARS],
        parent_start: usize,
    ) -> FsResult<Located> {
        let layout = self.layout();
        let ptr_len = layout.ptr_len();
        let entry_len = layout.entry_len();
        let mut bitmap = self.bitmap()?;

        let fits = packet.len() + entry_len <= self.mount.max_packet_data_length;
        let new_dir_page = if fits {
            None
        } else {
            Some(self.allocate(&mut bitmap, true)?)
        };
        let (start_page, page_count) = match reuse {
            Some(reused) => reused,
            None => {
                let allocated = self.allocate(&mut bitmap, new_dir_page.is_none());
                match (allocated, new_dir_page) {
                    (Ok(page), _) => (page, 1),
                    (Err(err), Some(orphan)) => {
                        bitmap.free(self.cache, orphan)?;
                        return Err(err);
                    }
                    (Err(err), None) => return Err(err),
                }
            }
        };
        let entry = DirEntry {
            name,
            start_page,
            page_count,
        };

        let located = match new_dir_page {
            None => {
                let offset = packet.len() - ptr_len;
                let next = layout.next_page(&packet)?;
                packet.resize(packet.len() + entry_len, 0);
                entry.encode(layout, &mut packet, offset);
                let end = packet.len() - ptr_len;
                layout.write_ptr(&mut packet, end, next);
                if reuse.is_none() {
                    self.write_start_page(entry, parent_name, parent_start)?;
                }
                self.write(dir_page, &packet)?;
                Located {
                    dir_page,
                    offset,
                    entry,
                }
            }
            Some(new_dir_page) => {
                let mut fresh = vec![0u8; entry_len + ptr_len];
                entry.encode(layout, &mut fresh, 0);
                self.write(new_dir_page, &fresh)?;
                if reuse.is_none() {
                    self.write_start_page(entry, parent_name, parent_start)?;
                }
                let end = packet.len() - ptr_len;
                layout.write_ptr(&mut packet, end, new_dir_page);
                self.write(dir_page, &packet)?;
                Located {
                    dir_page: new_dir_page,
                    offset: 0,
                    entry,
                }
            }
        };
        self.store(&bitmap)?;

        debug!(
            name = %name,
            dir_page = located.dir_page,
            start_page,
            reused = reuse.is_some(),
            "directory entry created"
        );
        Ok(located)
    }

    /// Rewrites the stored copy of `located.entry`.
    pub fn update_entry(&mut self, located: &Located) -> FsResult<()> {
        let layout = self.layout();
        let mut packet = self.entry_page(located)?;
        located.entry.encode(layout, &mut packet, located.offset);
        self.write(located.dir_page, &packet)
    }

    /// Removes the entry at `located`, closing the gap it leaves.
    pub fn remove_entry(&mut self, located: &Located) -> FsResult<()> {
        let mut packet = self.entry_page(located)?;
        let entry_len = self.layout().entry_len();
        packet.drain(located.offset..located.offset + entry_len);
        self.write(located.dir_page, &packet)
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Allocates a free page and marks it used in `bitmap`. `first` restarts
    /// the free-page search.
    ///
    /// When no page is left the cache is flushed, best effort, before
    /// reporting `OutOfSpace`.
    pub fn allocate(&mut self, bitmap: &mut PageBitmap, first: bool) -> FsResult<usize> {
        let found = if first {
            bitmap.first_free(self.cache)?
        } else {
            bitmap.next_free(self.cache)?
        };
        match found {
            Some(page) => {
                bitmap.mark_used(self.cache, page)?;
                trace!(page, "page allocated");
                Ok(page)
            }
            None => {
                self.sync_best_effort();
                Err(FsError::OutOfSpace)
            }
        }
    }

    pub fn free_pages(&mut self, bitmap: &mut PageBitmap, pages: &[usize]) -> FsResult<()> {
        for &page in pages {
            if !bitmap.free(self.cache, page)? {
                trace!(page, "page already flushed, not reclaimed");
            }
        }
        Ok(())
    }

    /// Empties the file starting at `located` down to its first page.
    pub fn truncate(&mut self, located: &mut Located) -> FsResult<()> {
        let layout = self.layout();
        let start = located.entry.start_page;
        let pages = chain_pages(self.cache, layout, start)?;
        self.write(start, &layout.empty_page())?;
        if pages.len() > 1 {
            let mut bitmap = self.bitmap()?;
            self.free_pages(&mut bitmap, &pages[1..])?;
            self.store(&bitmap)?;
        }
        if located.entry.page_count != 1 {
            located.entry.page_count = 1;
            self.update_entry(located)?;
        }
        debug!(start, freed = pages.len() - 1, "file truncated");
        Ok(())
    }

    /// Returns the number of free pages.
    pub fn free_pages_count(&mut self) -> FsResult<usize> {
        let bitmap = self.bitmap()?;
        bitmap.free_count(self.cache)
    }

    /// Flushes the cache, logging instead of returning a failure.
    pub fn sync_best_effort(&mut self) {
        if let Err(err) = self.cache.sync() {
            debug!(error = %err, "sync before reporting failure did not complete");
        }
    }

    // ----- Private helpers -----

    fn write_start_page(
        &mut self,
        entry: DirEntry,
        parent_name: [u8; NAME_CHARS],
        parent_start: usize,
    ) -> FsResult<()> {
        let layout = self.layout();
        let page = if entry.is_directory() {
            layout.subdirectory_page(self.mount.is_multi_device(), &parent_name, parent_start)
        } else {
            layout.empty_page()
        };
        self.write(entry.start_page, &page)
    }

    /// Reads the page holding `located`, checking the entry is still where
    /// the handle last saw it.
    fn entry_page(&mut self, located: &Located) -> FsResult<Vec<u8>> {
        let entry_len = self.layout().entry_len();
        let packet = self.read(located.dir_page)?;
        let name = located.entry.name.as_bytes();
        let stored = packet.get(located.offset..located.offset + entry_len);
        match stored {
            Some(stored) if stored[..NAME_CHARS] == name[..NAME_CHARS] => Ok(packet),
            _ => Err(FsError::corrupt(format!(
                "directory entry {} moved from page {}",
                located.entry.name, located.dir_page
            ))),
        }
    }
}

impl std::fmt::Debug for Volume<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("master", &self.cache.master())
            .field("mount", &self.mount)
            .finish()
    }
}

/// Returns true if `name` may be created as a directory.
pub(crate) fn is_directory_name(name: &NameElement) -> bool {
    name.extension() == EXT_UNKNOWN || name.is_directory()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format;
    use owfs_cache::sim::SimulatedBus;
    use owfs_cache::DeviceSource;
    use owfs_common::{CacheConfig, DeviceAddress};

    const ADDRESS: DeviceAddress = DeviceAddress::new(0x0C);

    fn formatted(pages: usize, page_len: usize) -> (PageCache, Mount) {
        let bus = SimulatedBus::new();
        bus.add_eeprom_device(ADDRESS, pages, page_len);
        let device = bus.open_device(ADDRESS).unwrap();
        let mut cache = PageCache::new(vec![device], CacheConfig::for_testing()).unwrap();
        let mount = format(&mut cache).unwrap();
        (cache, mount)
    }

    fn path(raw: &str) -> FsPath {
        FsPath::parse(raw).unwrap()
    }

    #[test]
    fn test_create_and_find() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);

        let created = volume.create_path(&mut path("/DATA.1"), false, false, None).unwrap();
        assert!(!created.existed);
        assert_eq!(created.located.dir_page, 0);
        assert_eq!(created.located.offset, mount.layout.control_len());
        assert_eq!(created.located.entry.start_page, 1);
        assert_eq!(volume.read(1).unwrap(), vec![0]);

        let mut lookup = path("/data.1");
        let target = volume.walk(lookup.elements_mut()).unwrap().unwrap();
        assert_eq!(target, Target::Entry(created.located));
        assert!(volume.walk(path("/DATA.2").elements_mut()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_extension_resolves_on_lookup() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);
        volume.create_path(&mut path("/LOGS/"), true, false, None).unwrap();
        volume.create_path(&mut path("/NOTE"), false, false, None).unwrap();

        let mut logs = path("/LOGS");
        assert!(volume.walk(logs.elements_mut()).unwrap().unwrap().is_directory());
        assert!(logs.last().unwrap().is_directory());

        let mut note = path("/NOTE");
        let target = volume.walk(note.elements_mut()).unwrap().unwrap();
        assert!(!target.is_directory());
        assert_eq!(note.last().unwrap().extension(), 0);
    }

    #[test]
    fn test_subdirectory_page_points_at_parent() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);
        let sub = volume.create_path(&mut path("/SUB/"), true, false, None).unwrap();
        let inner = volume
            .create_path(&mut path("/SUB/IN/"), true, false, None)
            .unwrap();

        let page = volume.read(sub.located.entry.start_page).unwrap();
        assert_eq!(&page[2..6], b"ROOT");
        let page = volume.read(inner.located.entry.start_page).unwrap();
        assert_eq!(&page[2..6], b"SUB ");
        assert_eq!(usize::from(page[6]), sub.located.entry.start_page);
    }

    #[test]
    fn test_missing_parent() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);
        let err = volume
            .create_path(&mut path("/A/B.1"), false, false, None)
            .unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));

        let created = volume.create_path(&mut path("/A/B.1"), false, true, None).unwrap();
        assert!(!created.existed);
        assert!(volume.walk(path("/A").elements_mut()).unwrap().unwrap().is_directory());
    }

    #[test]
    fn test_directory_grows_into_new_page() {
        // 16-byte pages carry 13 packet bytes: the root holds no entries,
        // continuation pages hold one.
        let (mut cache, mount) = formatted(32, 16);
        let mut volume = Volume::new(&mut cache, mount);

        let names = ["A.1", "B.1", "C.1"];
        for name in names {
            volume
                .create_path(&mut path(&format!("/{name}")), false, false, None)
                .unwrap();
        }
        let mut listed = volume.list(0).unwrap();
        listed.sort();
        assert_eq!(listed, names);
        assert_eq!(chain_pages(volume.cache(), mount.layout, 0).unwrap().len(), 4);
    }

    #[test]
    fn test_remove_entry_closes_gap() {
        let (mut cache, mount) = formatted(32, 64);
        let mut volume = Volume::new(&mut cache, mount);
        let a = volume.create_path(&mut path("/A.1"), false, false, None).unwrap();
        volume.create_path(&mut path("/B.1"), false, false, None).unwrap();

        volume.remove_entry(&a.located).unwrap();
        assert_eq!(volume.list(0).unwrap(), vec!["B.1"]);
        let mut b = path("/B.1");
        let Some(Target::Entry(located)) = volume.walk(b.elements_mut()).unwrap() else {
            panic!("B.1 should still exist");
        };
        assert_eq!(located.offset, mount.layout.control_len());
    }

    #[test]
    fn test_hidden_entries_not_listed() {
        let (mut cache, mount) = formatted(32, 64);
        let mut volume = Volume::new(&mut cache, mount);
        let mut hidden = volume
            .create_path(&mut path("/HIDE/"), true, false, None)
            .unwrap()
            .located;
        volume.create_path(&mut path("/SEEN/"), true, false, None).unwrap();

        hidden.entry.name.set_extension(0xFF);
        volume.update_entry(&hidden).unwrap();
        assert_eq!(volume.list(0).unwrap(), vec!["SEEN"]);
    }

    #[test]
    fn test_truncate_frees_tail() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);
        let mut created = volume
            .create_path(&mut path("/LOG.1"), false, false, None)
            .unwrap()
            .located;
        let free_before = volume.free_pages_count().unwrap();

        let mut bitmap = volume.bitmap().unwrap();
        let second = volume.allocate(&mut bitmap, true).unwrap();
        volume.store(&bitmap).unwrap();
        let start = created.entry.start_page;
        volume.write(start, &[1, 2, second as u8]).unwrap();
        volume.write(second, &[3, 0]).unwrap();
        created.entry.page_count = 2;
        volume.update_entry(&created).unwrap();

        volume.truncate(&mut created).unwrap();
        assert_eq!(volume.read(start).unwrap(), vec![0]);
        assert_eq!(created.entry.page_count, 1);
        assert_eq!(volume.free_pages_count().unwrap(), free_before);
    }

    #[test]
    fn test_out_of_space() {
        let (mut cache, mount) = formatted(4, 32);
        let mut volume = Volume::new(&mut cache, mount);
        for name in ["A.1", "B.1", "C.1"] {
            volume
                .create_path(&mut path(&format!("/{name}")), false, false, None)
                .unwrap();
        }
        let err = volume
            .create_path(&mut path("/D.1"), false, false, None)
            .unwrap_err();
        assert!(matches!(err, FsError::OutOfSpace));
        assert_eq!(volume.list(0).unwrap().len(), 3);
    }

    #[test]
    fn test_reuse_requires_absent_destination() {
        let (mut cache, mount) = formatted(32, 32);
        let mut volume = Volume::new(&mut cache, mount);
        let a = volume.create_path(&mut path("/A.1"), false, false, None).unwrap();
        let free = volume.free_pages_count().unwrap();

        let reuse = Some((a.located.entry.start_page, 1));
        let b = volume.create_path(&mut path("/B.1"), false, false, reuse).unwrap();
        assert_eq!(b.located.entry.start_page, a.located.entry.start_page);
        assert_eq!(volume.free_pages_count().unwrap(), free);

        let err = volume
            .create_path(&mut path("/B.1"), false, false, reuse)
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    #[test]
    fn test_directory_names() {
        assert!(is_directory_name(&NameElement::parse("LOGS", true).unwrap()));
        assert!(is_directory_name(&NameElement::parse("LOGS", false).unwrap()));
        assert!(!is_directory_name(&NameElement::parse("LOGS.2", true).unwrap()));
    }
}
