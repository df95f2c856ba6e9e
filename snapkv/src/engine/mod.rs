pub mod sled_engine;

#[cfg(feature = "rocksdb")]
pub mod rocks_engine;

use std::path::Path;

use crate::error::CResult;

/// The narrow contract over the embedded key-value engine that stores one
/// snapshot per directory. The store never looks inside a snapshot
/// directory; everything it needs goes through these two traits.
pub trait SnapshotEngine: Send + Sync + 'static {
    /// The handle produced by the open calls.
    type Handle: SnapshotHandle;

    /// Creates or opens a writable snapshot at `dir`.
    fn open_writable(&self, dir: &Path) -> CResult<Self::Handle>;

    /// Opens a published snapshot at `dir` for reading.
    fn open_readonly(&self, dir: &Path) -> CResult<Self::Handle>;
}

/// One opened snapshot instance.
///
/// Closing a writable handle must flush durably enough that a subsequent
/// read-only open, in this process or another, sees exactly the data that
/// was put.
pub trait SnapshotHandle: Send + Sync + 'static {
    /// Stores a key/value pair, replacing any existing value.
    fn put(&self, key: &[u8], value: &[u8]) -> CResult<()>;

    /// Fetches the value of a key, if present.
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Batch fetch; the result is positionally aligned with `keys`.
    fn multi_get(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>>;

    /// Closes the handle, flushing writable ones. Idempotent; eviction,
    /// explicit close and drop may all race on it.
    fn close(&self) -> CResult<()>;
}
