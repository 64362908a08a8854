//! Filesystem facade: wires the buffer cache, the free-map seam, and the
//! open-inode registry together behind the lifecycle operations a syscall
//! layer calls (`create`, `open`, `reopen`, `close`, `remove`), plus the
//! data operations that delegate straight through to `Inode`.
//!
//! Path and directory-entry lookup, and the syscall dispatch that decides
//! *which* sector to open, both live above this module and are out of
//! scope here; `Fs` only ever receives a sector number it is told belongs
//! to an inode.
//!
//! The `registry` field below plays the deduplicating-by-sector role an
//! open-file table needs: a map rather than an intrusive arena, since a
//! hash-map-shaped registry is simpler to reason about and arena/pinning
//! machinery has no other use in this crate. `BTreeMap` is used in place
//! of a hash map because this crate is `no_std` without a hasher
//! dependency.

pub mod inode;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::bio::BufferCache;
use crate::device::BlockDevice;
use crate::error::{Result, StorageError};
use crate::freemap::FreeMap;
use crate::scheduler::{NullTracer, Scheduler, Tracer};

pub use inode::{Inode, InodeStat};

/// The storage core's entry point: a buffer cache, a free-map handle, and
/// the registry that guarantees every open sector maps to exactly one
/// `Inode` regardless of how many callers have it open.
pub struct Fs<D: BlockDevice, T: Tracer = NullTracer> {
    cache: Arc<BufferCache<D, T>>,
    freemap: Arc<dyn FreeMap>,
    tracer: T,
    registry: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl<D: BlockDevice> Fs<D, NullTracer> {
    pub fn new(cache: Arc<BufferCache<D, NullTracer>>, freemap: Arc<dyn FreeMap>) -> Self {
        Self::with_tracer(cache, freemap, NullTracer)
    }
}

impl<D: BlockDevice, T: Tracer> Fs<D, T> {
    pub fn with_tracer(cache: Arc<BufferCache<D, T>>, freemap: Arc<dyn FreeMap>, tracer: T) -> Self {
        Self {
            cache,
            freemap,
            tracer,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<BufferCache<D, T>> {
        &self.cache
    }

    /// Allocates sector `sector` as a new inode of the given length and
    /// kind, then opens it. Fails without side effects (beyond whatever
    /// sectors `Inode::create` already rolled back internally) if the
    /// free map can't satisfy the requested length.
    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> Result<Arc<Inode>> {
        if !Inode::create(&self.cache, &*self.freemap, &self.tracer, sector, length, is_dir)? {
            return Err(StorageError::AllocationFailed);
        }
        self.open(sector)
    }

    /// Opens the inode at `sector`, reading it from disk only if no
    /// handle for this sector already exists in the registry: at most one
    /// in-memory `Inode` per sector.
    pub fn open(&self, sector: u32) -> Result<Arc<Inode>> {
        let mut registry = self.registry.lock();
        if let Some(inode) = registry.get(&sector) {
            inode.bump_open_count();
            return Ok(Arc::clone(inode));
        }

        let inode = Inode::load_from_disk(&self.cache, sector)?;
        registry.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// Bumps `open_count` on an already-open inode. Callers that already
    /// hold an `Arc<Inode>` (e.g. duplicating a file descriptor) should
    /// prefer this over `open` to avoid a registry lookup.
    pub fn reopen(&self, inode: &Arc<Inode>) {
        inode.bump_open_count();
    }

    /// Drops one reference to `inode`. When `open_count` reaches zero,
    /// the inode is removed from the registry; if it was also marked for
    /// removal, its data and indirect sectors and its own inode sector
    /// are released to the free map.
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        let sector = inode.inumber();
        // Held across `free` below, not just the map removal: otherwise a
        // concurrent `open(sector)` could miss the (already-removed) entry
        // and load a second `Inode` for a sector whose blocks we're about
        // to release out from under it, violating the one-handle-per-
        // sector guarantee the registry exists to provide.
        let mut registry = self.registry.lock();

        if inode.drop_open_count() > 0 {
            return Ok(());
        }

        registry.remove(&sector);

        if inode.is_removed() {
            self.free(&inode)?;
        }

        Ok(())
    }

    /// Marks `inode` for deletion. The sectors it owns are only actually
    /// released once its `open_count` drops to zero, so a file unlinked
    /// while still open behaves like POSIX
    /// unlink: existing readers/writers keep working until they close it.
    pub fn remove(&self, inode: &Arc<Inode>) {
        inode.mark_removed();
    }

    fn free(&self, inode: &Arc<Inode>) -> Result<()> {
        inode::free_inode(&self.cache, &*self.freemap, inode)?;
        self.freemap.release(inode.inumber(), 1);
        Ok(())
    }

    pub fn read_at(&self, inode: &Arc<Inode>, buf: &mut [u8], offset: u32) -> Result<u32>
    where
        D: 'static,
        T: 'static,
    {
        inode.read_at(&self.cache, None, buf, offset)
    }

    pub fn read_at_with_readahead(
        &self,
        inode: &Arc<Inode>,
        scheduler: &dyn Scheduler,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<u32>
    where
        D: 'static,
        T: 'static,
    {
        inode.read_at(&self.cache, Some(scheduler), buf, offset)
    }

    pub fn write_at(&self, inode: &Arc<Inode>, data: &[u8], offset: u32) -> Result<u32> {
        inode.write_at(&self.cache, &*self.freemap, &self.tracer, data, offset)
    }

    /// Writes back every dirty cache slot without disturbing the cache's
    /// contents. Intended to be called by an embedder-owned periodic
    /// task; see `BufferCache::run_flusher_loop`.
    pub fn flush(&self) -> usize {
        self.cache.flush_all()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Mutex as StdMutex;
    use std::vec;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::param::SECTOR_SIZE;

    struct MockDisk {
        sectors: StdMutex<StdVec<[u8; SECTOR_SIZE]>>,
    }

    impl MockDisk {
        fn new(n: usize) -> Self {
            Self {
                sectors: StdMutex::new(vec![[0u8; SECTOR_SIZE]; n]),
            }
        }
    }

    impl BlockDevice for MockDisk {
        fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
            buf.copy_from_slice(&self.sectors.lock().unwrap()[sector as usize]);
            Ok(())
        }

        fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
            self.sectors.lock().unwrap()[sector as usize] = *buf;
            Ok(())
        }
    }

    struct BumpFreeMap {
        next: StdMutex<u32>,
        limit: u32,
        released: StdMutex<StdVec<u32>>,
    }

    impl BumpFreeMap {
        fn new(start: u32, limit: u32) -> Self {
            Self {
                next: StdMutex::new(start),
                limit,
                released: StdMutex::new(StdVec::new()),
            }
        }
    }

    impl FreeMap for BumpFreeMap {
        fn allocate(&self, n_contiguous: u32) -> Option<u32> {
            let mut next = self.next.lock().unwrap();
            if *next + n_contiguous > self.limit {
                return None;
            }
            let s = *next;
            *next += n_contiguous;
            Some(s)
        }

        fn release(&self, sector: u32, _n: u32) {
            self.released.lock().unwrap().push(sector);
        }
    }

    fn fixture(n_sectors: usize) -> Fs<MockDisk> {
        let cache = Arc::new(BufferCache::new(MockDisk::new(n_sectors)));
        let freemap: Arc<dyn FreeMap> = Arc::new(BumpFreeMap::new(1, n_sectors as u32));
        Fs::new(cache, freemap)
    }

    #[test]
    fn create_write_read_close_round_trips() {
        let fs = fixture(300);
        let inode = fs.create(0, 0, false).unwrap();

        let n = fs.write_at(&inode, b"hello\n!", 0).unwrap();
        assert_eq!(n, 7);

        let mut out = [0u8; 7];
        let read = fs.read_at(&inode, &mut out, 0).unwrap();
        assert_eq!(read, 7);
        assert_eq!(&out, b"hello\n!");

        fs.close(inode).unwrap();
    }

    #[test]
    fn open_twice_shares_one_handle() {
        let fs = fixture(300);
        let inode = fs.create(0, 0, false).unwrap();
        fs.write_at(&inode, b"x", 0).unwrap();

        let reopened = fs.open(0).unwrap();
        assert!(Arc::ptr_eq(&inode, &reopened));
        assert_eq!(reopened.open_count(), 2);

        fs.close(inode).unwrap();
        fs.close(reopened).unwrap();
    }

    #[test]
    fn remove_while_open_defers_free_until_last_close() {
        let fs = fixture(300);
        let inode = fs.create(0, 10, false).unwrap();

        fs.remove(&inode);
        assert!(inode.is_removed());

        // Still usable through the existing handle (POSIX unlink-while-open).
        let mut buf = [0u8; 10];
        fs.read_at(&inode, &mut buf, 0).unwrap();

        fs.close(inode).unwrap();
    }
}
