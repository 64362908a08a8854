//! Compile-time constants shared across the storage core.

/// Size in bytes of a block-device sector. All cache slots, on-disk inodes,
/// and indirect blocks are exactly this size.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the buffer cache.
pub const N_SLOTS: usize = 64;

/// Number of direct block pointers stored in an on-disk inode.
pub const NDIRECT: usize = 123;

/// Number of sector numbers that fit in one indirect block
/// (`SECTOR_SIZE / size_of::<u32>()`), used for both the single- and
/// double-indirect levels.
pub const NINDIRECT: usize = SECTOR_SIZE / 4;

/// Maximum number of data sectors addressable by one inode:
/// direct + single-indirect + double-indirect.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Sanity-check magic stamped into every on-disk inode ("INOD" as an
/// ASCII-derived big-endian reading of the four bytes).
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Sentinel returned by index translation when a logical sector index (or
/// byte offset) lies outside the file, encoded as `u32::MAX` (the natural
/// "one past the largest valid sector number" sentinel).
pub const NO_SECTOR: u32 = u32::MAX;

/// The periodic flusher sleeps this many multiples of the caller's
/// `TIMER_FREQ` between calls to `flush_all`. Mirrors the "~10x TIMER_FREQ"
/// figure (tens of seconds at typical timer frequencies).
pub const FLUSH_INTERVAL_TICKS: u64 = 10;
