//! Buffer cache and indexed inode.
//!
//! This crate is the storage core beneath a filesystem's syscall layer:
//! a fixed-size sector cache with clock/second-chance eviction
//! (`bio`), and an extensible indexed inode built on top of it (`fs`).
//! Everything else a filesystem needs — directory entries, path lookup,
//! the free-sector bitmap, the scheduler, and the block device driver
//! itself — is reached only through the traits in `device`, `freemap`,
//! and `scheduler`; an embedder supplies the implementations.

#![no_std]

extern crate alloc;

pub mod bio;
pub mod device;
pub mod error;
pub mod freemap;
pub mod fs;
pub mod param;
pub mod scheduler;

pub use bio::{BufferCache, CacheStats};
pub use device::BlockDevice;
pub use error::{Result, StorageError};
pub use freemap::FreeMap;
pub use fs::{Fs, Inode, InodeStat};
pub use scheduler::{NullTracer, Scheduler, Tracer};
