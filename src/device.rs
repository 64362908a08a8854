//! The block device seam.
//!
//! Everything below the buffer cache — the raw disk, its driver, DMA
//! queues, interrupt handling — is out of scope for this crate. We depend
//! on it only through this trait, the way filesystem code should reach a
//! disk driver only through a narrow synchronous interface rather than
//! touching the driver directly.

use crate::error::Result;
use crate::param::SECTOR_SIZE;

/// Synchronous, whole-sector block device. No partial-sector I/O exists at
/// this layer; the buffer cache is what turns this into partial reads and
/// writes for its callers.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;
}
