//! Error types produced by the storage core.
//!
//! Every fallible public operation on the cache and the inode returns a
//! `Result<_, StorageError>` rather than truncating or silently dropping
//! a failure: block-device errors, exhausted allocation, and malformed
//! partial-I/O requests are all distinguishable at the call site.

/// An error produced by the buffer cache or the indexed inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The underlying block device failed to complete a read or write.
    IoError,
    /// The free-map allocator could not satisfy an allocation request, or
    /// an indirect block could not be populated.
    AllocationFailed,
    /// A partial-I/O request had `offset >= SECTOR_SIZE` or
    /// `offset + length > SECTOR_SIZE`.
    InvalidArgument,
}

pub type Result<T> = core::result::Result<T, StorageError>;
