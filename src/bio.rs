//! Buffer cache.
//!
//! The buffer cache is a fixed array of slots holding cached copies of
//! disk sector contents. Caching sectors in memory reduces the number of
//! disk reads and also provides a synchronization point for sectors used
//! by multiple openers.
//!
//! Interface:
//! * `read`/`read_partial` copy sector contents out through the cache.
//! * `write`/`write_partial` copy caller data in; the sector is written
//!   back to disk on eviction or `flush_all`, not immediately.
//! * `read_ahead` warms the cache without blocking the caller.
//! * `flush_all` writes every dirty slot back to disk.
//! * `destroy` flushes and marks the cache unusable.
//!
//! Every operation above acquires one global lock on entry and releases it
//! on exit: any two cache operations are totally ordered. This trades
//! scalability for a cache whose eviction and flush semantics are easy to
//! reason about; see DESIGN.md.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::error::{Result, StorageError};
use crate::param::{FLUSH_INTERVAL_TICKS, N_SLOTS, SECTOR_SIZE};
use crate::scheduler::{NullTracer, Scheduler, Tracer};

struct Slot {
    occupied: bool,
    disk_sector: u32,
    buffer: [u8; SECTOR_SIZE],
    dirty: bool,
    ref_bit: bool,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            occupied: false,
            disk_sector: 0,
            buffer: [0; SECTOR_SIZE],
            dirty: false,
            ref_bit: false,
        }
    }
}

/// Hit/miss/eviction counters, purely observational.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheInner {
    slots: [Slot; N_SLOTS],
    /// Clock hand; persists across calls.
    hand: usize,
    stats: CacheStats,
}

/// A fixed-size, write-back sector cache sitting in front of `D`.
pub struct BufferCache<D: BlockDevice, T: Tracer = NullTracer> {
    device: D,
    tracer: T,
    inner: Mutex<CacheInner>,
    destroyed: AtomicBool,
}

impl<D: BlockDevice> BufferCache<D, NullTracer> {
    /// Builds a cache over `device` with no diagnostic hooks wired up.
    pub fn new(device: D) -> Self {
        Self::with_tracer(device, NullTracer)
    }
}

impl<D: BlockDevice, T: Tracer> BufferCache<D, T> {
    pub fn with_tracer(device: D, tracer: T) -> Self {
        Self {
            device,
            tracer,
            inner: Mutex::new(CacheInner {
                slots: array![_ => Slot::empty(); N_SLOTS],
                hand: 0,
                stats: CacheStats::default(),
            }),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_usable(&self) {
        debug_assert!(
            !self.destroyed.load(Ordering::Relaxed),
            "buffer cache used after destroy()"
        );
    }

    /// Copies the full sector `sector` into `out`.
    pub fn read(&self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_usable();
        let mut inner = self.inner.lock();
        let idx = self.locate(&mut inner, sector)?;
        inner.slots[idx].ref_bit = true;
        out.copy_from_slice(&inner.slots[idx].buffer);
        Ok(())
    }

    /// Copies `length` bytes starting at `offset` within sector `sector`
    /// into `out`. Requires `offset < SECTOR_SIZE` and
    /// `offset + length <= SECTOR_SIZE`.
    pub fn read_partial(
        &self,
        sector: u32,
        out: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<()> {
        self.check_usable();
        if offset >= SECTOR_SIZE || offset + length > SECTOR_SIZE || out.len() < length {
            return Err(StorageError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let idx = self.locate(&mut inner, sector)?;
        inner.slots[idx].ref_bit = true;
        out[..length].copy_from_slice(&inner.slots[idx].buffer[offset..offset + length]);
        Ok(())
    }

    /// Writes the full sector `sector` through the cache.
    pub fn write(&self, sector: u32, data: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_usable();
        let mut inner = self.inner.lock();
        let idx = self.locate(&mut inner, sector)?;
        let slot = &mut inner.slots[idx];
        slot.buffer.copy_from_slice(data);
        slot.dirty = true;
        slot.ref_bit = true;
        Ok(())
    }

    /// Writes `length` bytes starting at `offset` within sector `sector`
    /// through the cache. Requires `offset < SECTOR_SIZE` and
    /// `offset + length <= SECTOR_SIZE`; the rest of the sector is
    /// preserved (the unmodified bytes are read from disk on a miss before
    /// being partially overwritten).
    pub fn write_partial(
        &self,
        sector: u32,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<()> {
        self.check_usable();
        if offset >= SECTOR_SIZE || offset + length > SECTOR_SIZE || data.len() < length {
            return Err(StorageError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let idx = self.locate(&mut inner, sector)?;
        let slot = &mut inner.slots[idx];
        slot.buffer[offset..offset + length].copy_from_slice(&data[..length]);
        slot.dirty = true;
        slot.ref_bit = true;
        Ok(())
    }

    /// Submits a non-blocking request to warm the cache with `sector`.
    /// Never guarantees the sector becomes resident; failures are silent.
    pub fn read_ahead(self: &Arc<Self>, sector: u32, scheduler: &dyn Scheduler)
    where
        D: 'static,
        T: 'static,
    {
        let this = Arc::clone(self);
        scheduler.spawn(Box::new(move || {
            let mut inner = this.inner.lock();
            let _ = this.locate(&mut inner, sector);
        }));
    }

    /// Writes every dirty, occupied slot back to disk. Returns the number
    /// of slots written.
    pub fn flush_all(&self) -> usize {
        self.check_usable();
        let mut inner = self.inner.lock();
        let mut written = 0;
        for slot in inner.slots.iter_mut().filter(|s| s.occupied && s.dirty) {
            if self.device.write(slot.disk_sector, &slot.buffer).is_ok() {
                slot.dirty = false;
                written += 1;
            }
        }
        self.tracer.on_flush(written);
        written
    }

    /// Flushes every dirty slot and marks the cache unusable. Clean slots
    /// are not written back (a clean slot is already consistent with disk
    /// by definition; decision recorded in DESIGN.md).
    pub fn destroy(&self) {
        let _ = self.flush_all();
        self.destroyed.store(true, Ordering::Relaxed);
    }

    /// Runs the periodic write-back daemon. Never returns; the embedder
    /// spawns this via `Scheduler::spawn`. Sleeps for
    /// `FLUSH_INTERVAL_TICKS * timer_freq` ticks between flushes.
    pub fn run_flusher_loop(&self, scheduler: &dyn Scheduler, timer_freq: u64) -> ! {
        loop {
            scheduler.sleep_ticks(FLUSH_INTERVAL_TICKS * timer_freq);
            let _ = self.flush_all();
        }
    }

    /// Hit/miss/eviction counters since creation.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Finds `sector` in the cache, evicting and refilling a slot on a
    /// miss. Returns the index of the slot now holding `sector`.
    fn locate(&self, inner: &mut CacheInner, sector: u32) -> Result<usize> {
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.occupied && s.disk_sector == sector)
        {
            inner.stats.hits += 1;
            return Ok(idx);
        }
        inner.stats.misses += 1;

        let idx = self.evict(inner);
        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read(sector, &mut buf)?;

        let slot = &mut inner.slots[idx];
        slot.occupied = true;
        slot.disk_sector = sector;
        slot.buffer = buf;
        slot.dirty = false;
        slot.ref_bit = false;
        Ok(idx)
    }

    /// Clock (second-chance) eviction. `hand` persists in `inner` across
    /// calls. Picks an unoccupied slot if one exists; otherwise sweeps,
    /// clearing reference bits, until it finds a slot whose reference bit
    /// is already clear, writing it back first if dirty.
    fn evict(&self, inner: &mut CacheInner) -> usize {
        loop {
            let idx = inner.hand;
            if !inner.slots[idx].occupied {
                return idx;
            }
            if inner.slots[idx].ref_bit {
                inner.slots[idx].ref_bit = false;
                inner.hand = (idx + 1) % N_SLOTS;
                continue;
            }

            if inner.slots[idx].dirty {
                let sector = inner.slots[idx].disk_sector;
                let data = inner.slots[idx].buffer;
                // If the write-back fails, the dirtied data is lost but
                // the caller's request still proceeds against a freshly
                // refilled slot.
                let _ = self.device.write(sector, &data);
                self.tracer.on_evict(sector);
            }
            inner.stats.evictions += 1;
            inner.slots[idx].occupied = false;
            inner.slots[idx].dirty = false;
            return idx;
        }
    }
}
