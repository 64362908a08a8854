//! Indexed inode.
//!
//! An inode describes a single file's mapping from logical byte offsets to
//! disk sectors, through a fixed count of direct pointers, one
//! single-indirect pointer, and one double-indirect pointer. The on-disk
//! inode (`DiskInode`) is exactly one sector; the in-memory `Inode` adds
//! the book-keeping the disk copy doesn't carry: `open_count`, `removed`,
//! `deny_write_count`, and the `readable_length`/`disk.length` pair that
//! lets an extending write and a concurrent read coexist without the
//! reader ever observing unwritten tail bytes.
//!
//! The on-disk struct is moved through the cache with `zerocopy`, split
//! into a `Dinode`-style fixed-layout type and an `Inode` wrapper carrying
//! the book-keeping above, extended with a second indirection level that a
//! smaller single-indirect design wouldn't need but this filesystem's
//! larger maximum file size requires.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::BufferCache;
use crate::device::BlockDevice;
use crate::error::{Result, StorageError};
use crate::freemap::FreeMap;
use crate::param::{INODE_MAGIC, MAXFILE, NDIRECT, NINDIRECT, NO_SECTOR, SECTOR_SIZE};
use crate::scheduler::{Scheduler, Tracer};

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// On-disk inode structure. Must fit in exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    /// File size in bytes. Non-negative; kept `i32` to mirror the
    /// reference layout's signed field.
    length: i32,
    magic: u32,
    direct: [u32; NDIRECT],
    single_indirect: u32,
    double_indirect: u32,
    is_dir: u8,
    _padding: [u8; SECTOR_SIZE - (4 + 4 + NDIRECT * 4 + 4 + 4 + 1)],
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn new(length: u32, is_dir: bool) -> Self {
        Self {
            length: length as i32,
            magic: INODE_MAGIC,
            direct: [0; NDIRECT],
            single_indirect: 0,
            double_indirect: 0,
            is_dir: is_dir as u8,
            _padding: [0; SECTOR_SIZE - (4 + 4 + NDIRECT * 4 + 4 + 4 + 1)],
        }
    }

    fn to_sector(self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        let mut this = DiskInode::new(0, false);
        this.as_bytes_mut().copy_from_slice(buf);
        this
    }
}

/// One sector's worth of sector numbers, used identically at the single-
/// and double-indirect levels.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndirectBlock {
    entries: [u32; NINDIRECT],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        Self {
            entries: [0; NINDIRECT],
        }
    }

    fn to_sector(self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        let mut this = IndirectBlock::zeroed();
        this.as_bytes_mut().copy_from_slice(buf);
        this
    }
}

fn read_sector<D: BlockDevice, T: Tracer>(cache: &BufferCache<D, T>, sector: u32) -> Result<[u8; SECTOR_SIZE]> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf)?;
    Ok(buf)
}

fn ceil_div(n: u32, d: usize) -> usize {
    (n as usize + d - 1) / d
}

/// A snapshot of the metadata a filesystem facade typically needs beyond
/// `length()` alone.
#[derive(Debug, Clone, Copy)]
pub struct InodeStat {
    pub inumber: u32,
    pub length: u32,
    pub is_dir: bool,
}

/// In-memory handle to an open inode. Shared by every opener of the same
/// sector (the open-inode registry in `fs/registry.rs` guarantees at most
/// one `Inode` per sector), so `open_count`, `removed`, `deny_write_count`,
/// and `readable_length` must be visible to every handle without going
/// through a per-caller copy.
pub struct Inode {
    sector: u32,
    open_count: AtomicU32,
    removed: AtomicBool,
    deny_write_count: AtomicU32,
    /// Bytes readers may observe; always `<= disk.lock().length`. See
    /// `write_at` for why the two are kept apart.
    readable_length: AtomicU32,
    /// Serializes file-extension (`grow`) against this inode. Acquired
    /// before the cache's mutex, never the reverse.
    grow_lock: Mutex<()>,
    disk: Mutex<DiskInode>,
}

impl Inode {
    pub(crate) fn new_open(sector: u32, disk: DiskInode) -> Arc<Self> {
        let length = disk.length as u32;
        Arc::new(Self {
            sector,
            open_count: AtomicU32::new(1),
            removed: AtomicBool::new(false),
            deny_write_count: AtomicU32::new(0),
            readable_length: AtomicU32::new(length),
            grow_lock: Mutex::new(()),
            disk: Mutex::new(disk),
        })
    }

    pub(crate) fn load_from_disk<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        sector: u32,
    ) -> Result<Arc<Self>> {
        let buf = read_sector(cache, sector)?;
        let disk = DiskInode::from_sector(&buf);
        Ok(Self::new_open(sector, disk))
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> u32 {
        self.disk.lock().length as u32
    }

    pub fn is_dir(&self) -> bool {
        self.disk.lock().is_dir != 0
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn stat(&self) -> InodeStat {
        let disk = self.disk.lock();
        InodeStat {
            inumber: self.sector,
            length: disk.length as u32,
            is_dir: disk.is_dir != 0,
        }
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_open_count(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements `open_count`, returning the new value.
    pub(crate) fn drop_open_count(&self) -> u32 {
        self.open_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Raises the deny-write counter (used while an executable image is
    /// mapped read-only). Asserts `0 <= deny_write_count <= open_count`,
    /// an invariant violation of which is a fatal, not a recoverable,
    /// error.
    pub fn deny_write(&self) {
        let deny = self.deny_write_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            deny <= self.open_count(),
            "deny_write_count exceeded open_count"
        );
    }

    pub fn allow_write(&self) {
        let open = self.open_count();
        let prev = self.deny_write_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allow_write without a matching deny_write");
        debug_assert!(prev - 1 <= open, "deny_write_count exceeded open_count");
    }

    fn deny_write_count(&self) -> u32 {
        self.deny_write_count.load(Ordering::Acquire)
    }

    /// Translates a logical sector index to a disk sector, or
    /// `param::NO_SECTOR` if `index` lies beyond the maximum addressable
    /// index for this inode.
    fn index_to_sector<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        disk: &DiskInode,
        index: usize,
    ) -> Result<u32> {
        if index < NDIRECT {
            return Ok(disk.direct[index]);
        }
        let index = index - NDIRECT;

        if index < NINDIRECT {
            if disk.single_indirect == 0 {
                return Ok(NO_SECTOR);
            }
            let block = IndirectBlock::from_sector(&read_sector(cache, disk.single_indirect)?);
            return Ok(block.entries[index]);
        }
        let index = index - NINDIRECT;

        if index < NINDIRECT * NINDIRECT {
            if disk.double_indirect == 0 {
                return Ok(NO_SECTOR);
            }
            let outer = IndirectBlock::from_sector(&read_sector(cache, disk.double_indirect)?);
            let outer_idx = index / NINDIRECT;
            let inner_sector = outer.entries[outer_idx];
            if inner_sector == 0 {
                return Ok(NO_SECTOR);
            }
            let inner = IndirectBlock::from_sector(&read_sector(cache, inner_sector)?);
            return Ok(inner.entries[index % NINDIRECT]);
        }

        Ok(NO_SECTOR)
    }

    /// Translates a byte offset to a disk sector, or `NO_SECTOR` if
    /// `offset >= length`.
    fn byte_to_sector<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        disk: &DiskInode,
        offset: u32,
    ) -> Result<u32> {
        if offset < disk.length as u32 {
            Self::index_to_sector(cache, disk, (offset / SECTOR_SIZE as u32) as usize)
        } else {
            Ok(NO_SECTOR)
        }
    }

    /// Grows the data sectors addressed by `disk` to cover `new_byte_len`
    /// bytes, allocating and zeroing sectors through the direct, then
    /// single-indirect, then double-indirect ranges in that order.
    /// Already-allocated positions are skipped, so calling with a
    /// `new_byte_len <= disk.length` allocates nothing.
    ///
    /// Flattened to two explicit passes (single-, then double-indirect)
    /// rather than one recursive function parameterized by level; the
    /// behavior is identical either way.
    fn grow<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        tracer: &T,
        inumber: u32,
        disk: &mut DiskInode,
        new_byte_len: u32,
    ) -> Result<()> {
        let mut need = ceil_div(new_byte_len, SECTOR_SIZE);

        // Tracks sectors allocated so far. If `grow` returns early on an
        // allocation failure, the guard's closure releases everything it
        // holds back to the free map; the success path defuses it with
        // `ScopeGuard::into_inner` so nothing is released.
        let mut allocated = scopeguard::guard(Vec::<u32>::new(), |sectors| {
            let released = sectors.len();
            for sector in sectors {
                freemap.release(sector, 1);
            }
            tracer.on_grow_fail(inumber, released);
        });

        // Mutated through a local copy, not `*disk` directly: on any
        // early-return failure below, the pointers this function assigns
        // along the way (`single_indirect`, `double_indirect`, individual
        // `direct` entries) name sectors the scopeguard above is about to
        // release back to the free map. Leaving those stale pointers in
        // the caller's `disk` would have it reference sectors it no
        // longer owns. `*disk` is only overwritten with `working` once
        // every sector needed has been allocated and zeroed.
        let mut working = *disk;

        let direct_count = need.min(NDIRECT);
        for slot in working.direct.iter_mut().take(direct_count) {
            if *slot == 0 {
                let s = freemap.allocate(1).ok_or(StorageError::AllocationFailed)?;
                allocated.push(s);
                cache.write(s, &ZERO_SECTOR)?;
                *slot = s;
            }
        }
        need -= direct_count;
        if need > 0 {
            need = Self::grow_indirect_level(
                cache,
                freemap,
                &mut allocated,
                &mut working.single_indirect,
                need,
            )?;
            if need > 0 {
                need = Self::grow_double_indirect(cache, freemap, &mut allocated, &mut working.double_indirect, need)?;
                if need > 0 {
                    // Requested length exceeds what direct + single-indirect +
                    // double-indirect addressing can reach (MAXFILE sectors).
                    return Err(StorageError::AllocationFailed);
                }
            }
        }

        *disk = working;
        scopeguard::ScopeGuard::into_inner(allocated);
        Ok(())
    }

    /// Populates up to `need` data-sector entries of the indirect block
    /// referenced by `*field` (allocating the indirect block itself if
    /// `*field == 0`). Returns the number of sectors still needed after
    /// this level (0 unless `need > NINDIRECT`).
    fn grow_indirect_level<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        allocated: &mut Vec<u32>,
        field: &mut u32,
        need: usize,
    ) -> Result<usize> {
        let count = need.min(NINDIRECT);
        if *field == 0 {
            let s = freemap.allocate(1).ok_or(StorageError::AllocationFailed)?;
            allocated.push(s);
            cache.write(s, &ZERO_SECTOR)?;
            *field = s;
        }

        let mut block = IndirectBlock::from_sector(&read_sector(cache, *field)?);
        for entry in block.entries.iter_mut().take(count) {
            if *entry == 0 {
                let s = freemap.allocate(1).ok_or(StorageError::AllocationFailed)?;
                allocated.push(s);
                cache.write(s, &ZERO_SECTOR)?;
                *entry = s;
            }
        }
        cache.write(*field, &block.to_sector())?;

        Ok(need - count)
    }

    /// Populates the double-indirect subtree: up to
    /// `ceil(need / NINDIRECT)` level-1 indirect blocks, each populated by
    /// `grow_indirect_level`. The outer block itself has only `NINDIRECT`
    /// slots, so this level can satisfy at most `NINDIRECT * NINDIRECT`
    /// sectors; returns whatever of `need` is left unsatisfied beyond
    /// that (0 unless `need` exceeds the double-indirect capacity), for
    /// the caller to treat as an allocation failure.
    fn grow_double_indirect<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        allocated: &mut Vec<u32>,
        field: &mut u32,
        need: usize,
    ) -> Result<usize> {
        if *field == 0 {
            let s = freemap.allocate(1).ok_or(StorageError::AllocationFailed)?;
            allocated.push(s);
            cache.write(s, &ZERO_SECTOR)?;
            *field = s;
        }

        let mut outer = IndirectBlock::from_sector(&read_sector(cache, *field)?);
        let outer_count = ceil_div(need as u32, NINDIRECT).min(NINDIRECT);
        let mut remaining = need;
        for entry in outer.entries.iter_mut().take(outer_count) {
            let chunk = remaining.min(NINDIRECT);
            let left = Self::grow_indirect_level(cache, freemap, allocated, entry, chunk)?;
            debug_assert_eq!(left, 0, "a single level-1 block always satisfies <= NINDIRECT sectors");
            remaining -= chunk;
        }
        cache.write(*field, &outer.to_sector())?;

        Ok(remaining)
    }

    /// Releases every data, indirect, and double-indirect sector owned by
    /// `disk` back to the free map. Run only once, at final close, when
    /// `removed` is set; the inode sector itself is released by the
    /// caller.
    fn free_blocks<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        disk: &mut DiskInode,
    ) -> Result<()> {
        for slot in disk.direct.iter_mut() {
            if *slot != 0 {
                freemap.release(*slot, 1);
                *slot = 0;
            }
        }

        if disk.single_indirect != 0 {
            let block = IndirectBlock::from_sector(&read_sector(cache, disk.single_indirect)?);
            for entry in block.entries.iter() {
                if *entry != 0 {
                    freemap.release(*entry, 1);
                }
            }
            freemap.release(disk.single_indirect, 1);
            disk.single_indirect = 0;
        }

        if disk.double_indirect != 0 {
            let outer = IndirectBlock::from_sector(&read_sector(cache, disk.double_indirect)?);
            for outer_entry in outer.entries.iter() {
                if *outer_entry == 0 {
                    continue;
                }
                let inner = IndirectBlock::from_sector(&read_sector(cache, *outer_entry)?);
                for entry in inner.entries.iter() {
                    if *entry != 0 {
                        freemap.release(*entry, 1);
                    }
                }
                freemap.release(*outer_entry, 1);
            }
            freemap.release(disk.double_indirect, 1);
            disk.double_indirect = 0;
        }

        Ok(())
    }

    /// Writes a fully-zeroed inode body back to `self.sector`, leaving
    /// the sector itself allocated (the caller releases that separately)
    /// but with no data, indirect, or double-indirect sectors owned.
    fn clear_on_disk<D: BlockDevice, T: Tracer>(&self, cache: &BufferCache<D, T>) -> Result<()> {
        let mut guard = self.disk.lock();
        guard.length = 0;
        let disk = *guard;
        drop(guard);
        cache.write(self.sector, &disk.to_sector())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read, which is shorter than `buf.len()`
    /// at or past `readable_length`.
    pub fn read_at<D: BlockDevice, T: Tracer>(
        self: &Arc<Self>,
        cache: &Arc<BufferCache<D, T>>,
        scheduler: Option<&dyn Scheduler>,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<u32>
    where
        D: 'static,
        T: 'static,
    {
        let readable_length = self.readable_length.load(Ordering::Acquire);
        let disk = *self.disk.lock();

        let mut read = 0usize;
        let mut off = offset;
        while read < buf.len() {
            if off >= readable_length {
                break;
            }
            let sector_idx = (off / SECTOR_SIZE as u32) as usize;
            let real_sector = Self::index_to_sector(cache, &disk, sector_idx)?;
            if real_sector == NO_SECTOR {
                break;
            }

            let sector_ofs = (off % SECTOR_SIZE as u32) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let inode_left = (readable_length - off) as usize;
            let chunk = (buf.len() - read).min(sector_left).min(inode_left);
            if chunk == 0 {
                break;
            }

            if chunk == SECTOR_SIZE {
                let mut sector_buf = [0u8; SECTOR_SIZE];
                cache.read(real_sector, &mut sector_buf)?;
                buf[read..read + SECTOR_SIZE].copy_from_slice(&sector_buf);
            } else {
                cache.read_partial(real_sector, &mut buf[read..read + chunk], sector_ofs, chunk)?;
            }

            off += chunk as u32;
            read += chunk;

            if let Some(scheduler) = scheduler {
                let next_idx = (off / SECTOR_SIZE as u32) as usize;
                if let Ok(next_sector) = Self::index_to_sector(cache, &disk, next_idx) {
                    if next_sector != NO_SECTOR {
                        cache.read_ahead(next_sector, scheduler);
                    }
                }
            }
        }

        Ok(read as u32)
    }

    /// Writes `data` at `offset`, growing the file first if necessary.
    /// Returns the number of bytes written; a failed growth attempt
    /// returns `Ok(0)` without writing any data.
    ///
    /// `readable_length` is advanced only after the data loop below has
    /// finished populating every newly-grown sector, so a concurrent
    /// reader using `readable_length` as its bound never observes a mix
    /// of zero-filled and freshly-written tail bytes; see DESIGN.md for
    /// why this ordering was chosen over raising `readable_length`
    /// earlier.
    pub fn write_at<D: BlockDevice, T: Tracer>(
        &self,
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        tracer: &T,
        data: &[u8],
        offset: u32,
    ) -> Result<u32> {
        if self.deny_write_count() > 0 {
            return Ok(0);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let last_byte = offset + data.len() as u32 - 1;
        let extends = last_byte >= self.length();

        let _grow_guard;
        if extends {
            _grow_guard = Some(self.grow_lock.lock());
            let new_len = offset + data.len() as u32;
            let mut disk = self.disk.lock();
            if new_len > disk.length as u32 {
                match Self::grow(cache, freemap, tracer, self.sector, &mut disk, new_len) {
                    Ok(()) => {
                        disk.length = new_len as i32;
                        let sector = self.sector;
                        let bytes = disk.to_sector();
                        drop(disk);
                        cache.write(sector, &bytes)?;
                    }
                    Err(StorageError::AllocationFailed) => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
        } else {
            _grow_guard = None;
        }

        let disk = *self.disk.lock();
        let mut written = 0usize;
        let mut off = offset;
        while written < data.len() {
            let sector_idx = (off / SECTOR_SIZE as u32) as usize;
            if off >= disk.length as u32 {
                break;
            }
            let real_sector = Self::index_to_sector(cache, &disk, sector_idx)?;
            if real_sector == NO_SECTOR {
                break;
            }

            let sector_ofs = (off % SECTOR_SIZE as u32) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (data.len() - written).min(sector_left);
            if chunk == 0 {
                break;
            }

            if chunk == SECTOR_SIZE {
                let mut sector_buf = [0u8; SECTOR_SIZE];
                sector_buf.copy_from_slice(&data[written..written + SECTOR_SIZE]);
                cache.write(real_sector, &sector_buf)?;
            } else {
                cache.write_partial(real_sector, &data[written..written + chunk], sector_ofs, chunk)?;
            }

            off += chunk as u32;
            written += chunk;
        }

        if extends {
            self.readable_length.store(self.length(), Ordering::Release);
        }

        Ok(written as u32)
    }

    /// Initializes a new inode occupying `sector`: allocates the sectors
    /// needed for `length` bytes, zero-fills them via `grow`, and writes
    /// the inode sector itself.
    pub(crate) fn create<D: BlockDevice, T: Tracer>(
        cache: &BufferCache<D, T>,
        freemap: &dyn FreeMap,
        tracer: &T,
        sector: u32,
        length: u32,
        is_dir: bool,
    ) -> Result<bool> {
        assert!(
            (length as usize) <= MAXFILE * SECTOR_SIZE,
            "requested length exceeds the maximum file size"
        );

        let mut disk = DiskInode::new(0, is_dir);
        if length > 0 {
            match Self::grow(cache, freemap, tracer, sector, &mut disk, length) {
                Ok(()) => {}
                Err(StorageError::AllocationFailed) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        disk.length = length as i32;
        cache.write(sector, &disk.to_sector())?;
        Ok(true)
    }
}

/// Releases every sector `inode` owns (its data, indirect, and
/// double-indirect blocks) back to the free map, and zeroes its on-disk
/// body. Does not release the inode's own sector; the caller (`Fs::free`)
/// does that once this returns, after which the sector is free to be
/// reused by an unrelated inode.
pub(crate) fn free_inode<D: BlockDevice, T: Tracer>(
    cache: &BufferCache<D, T>,
    freemap: &dyn FreeMap,
    inode: &Inode,
) -> Result<()> {
    {
        let mut disk = inode.disk.lock();
        Inode::free_blocks(cache, freemap, &mut disk)?;
    }
    inode.clear_on_disk(cache)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Mutex as StdMutex;
    use std::vec;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::param::N_SLOTS;
    use crate::scheduler::NullTracer;

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
        released: StdMutex<usize>,
    }

    impl BumpFreeMap {
        fn new(start: u32, limit: u32) -> Self {
            Self {
                next: StdMutex::new(start),
                limit,
                released: StdMutex::new(0),
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

        fn release(&self, _sector: u32, _n: u32) {
            *self.released.lock().unwrap() += 1;
        }
    }

    fn fixture(n_sectors: usize) -> (BufferCache<MockDisk, NullTracer>, BumpFreeMap, NullTracer) {
        (
            BufferCache::new(MockDisk::new(n_sectors)),
            BumpFreeMap::new(1, n_sectors as u32),
            NullTracer,
        )
    }

    #[test]
    fn disk_inode_is_exactly_one_sector() {
        assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);
        assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);
    }

    #[test]
    fn create_then_read_back_zero_bytes() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 200);
        let cache = Arc::new(cache);
        assert!(Inode::create(&*cache, &freemap, &tracer, 0, 7, false).unwrap());
        let inode = Inode::load_from_disk(&*cache, 0).unwrap();
        assert_eq!(inode.length(), 7);

        let mut buf = [0xFFu8; 7];
        let n = inode.read_at(&cache, None, &mut buf, 0).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf, [0u8; 7]);
    }

    #[test]
    fn write_then_read_round_trips_short_file() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 200);
        let cache = Arc::new(cache);
        assert!(Inode::create(&*cache, &freemap, &tracer, 0, 0, false).unwrap());
        let inode = Inode::load_from_disk(&*cache, 0).unwrap();

        let n = inode
            .write_at(&cache, &freemap, &tracer, b"hello\n!", 0)
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(inode.length(), 7);

        let mut out = [0u8; 7];
        let read = inode.read_at(&cache, None, &mut out, 0).unwrap();
        assert_eq!(read, 7);
        assert_eq!(&out, b"hello\n!");
    }

    #[test]
    fn write_past_single_indirect_boundary_allocates_indirect_block() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 400);
        let cache = Arc::new(cache);
        assert!(Inode::create(&*cache, &freemap, &tracer, 0, 0, false).unwrap());
        let inode = Inode::load_from_disk(&*cache, 0).unwrap();

        let byte_offset = (NDIRECT as u32 + 1) * SECTOR_SIZE as u32;
        let n = inode
            .write_at(&cache, &freemap, &tracer, &[0x42], byte_offset)
            .unwrap();
        assert_eq!(n, 1);

        let disk = inode.disk.lock();
        assert_ne!(disk.single_indirect, 0);
    }

    #[test]
    fn write_past_double_indirect_boundary_allocates_both_levels() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 400);
        let cache = Arc::new(cache);
        assert!(Inode::create(&*cache, &freemap, &tracer, 0, 0, false).unwrap());
        let inode = Inode::load_from_disk(&*cache, 0).unwrap();

        let byte_offset = (NDIRECT as u32 + NINDIRECT as u32 + 1) * SECTOR_SIZE as u32;
        let n = inode
            .write_at(&cache, &freemap, &tracer, &[0x7], byte_offset)
            .unwrap();
        assert_eq!(n, 1);

        let disk = inode.disk.lock();
        assert_ne!(disk.single_indirect, 0);
        assert_ne!(disk.double_indirect, 0);
    }

    #[test]
    fn grow_is_idempotent_for_shrinking_target() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 200);
        let mut disk = DiskInode::new(0, false);
        Inode::grow(&cache, &freemap, &tracer, 0, &mut disk, 4096).unwrap();
        let allocated_after_first = *freemap.next.lock().unwrap();

        Inode::grow(&cache, &freemap, &tracer, 0, &mut disk, 100).unwrap();
        assert_eq!(*freemap.next.lock().unwrap(), allocated_after_first);
    }

    #[test]
    fn grow_beyond_max_file_size_fails_and_rolls_back_without_corrupting_disk_inode() {
        // One sector past what direct + single-indirect + double-indirect
        // addressing can reach.
        let total_sectors_needed = MAXFILE + 1;
        // Filling the whole double-indirect subtree to discover it overflows
        // allocates every leaf, inner-block, and outer-block sector along
        // the way before reporting failure; give the fixture enough room.
        let (cache, freemap, tracer) = fixture(total_sectors_needed + NINDIRECT * NINDIRECT + 2000);

        let mut disk = DiskInode::new(0, false);
        let new_byte_len = (total_sectors_needed * SECTOR_SIZE) as u32;
        let err = Inode::grow(&cache, &freemap, &tracer, 0, &mut disk, new_byte_len).unwrap_err();
        assert_eq!(err, StorageError::AllocationFailed);

        // The caller's `disk` must come back exactly as it went in: no
        // direct/single-indirect/double-indirect field may reference a
        // sector that was just handed back to the free map.
        assert_eq!(disk.length, 0);
        assert!(disk.direct.iter().all(|&s| s == 0));
        assert_eq!(disk.single_indirect, 0);
        assert_eq!(disk.double_indirect, 0);

        assert!(*freemap.released.lock().unwrap() > 0, "allocated sectors should have been rolled back");
    }

    #[test]
    fn read_past_length_returns_zero_bytes() {
        let (cache, freemap, tracer) = fixture(N_SLOTS + 200);
        let cache = Arc::new(cache);
        assert!(Inode::create(&*cache, &freemap, &tracer, 0, 10, false).unwrap());
        let inode = Inode::load_from_disk(&*cache, 0).unwrap();

        let mut buf = [0u8; 4];
        let read = inode.read_at(&cache, None, &mut buf, 10).unwrap();
        assert_eq!(read, 0);
    }
}
