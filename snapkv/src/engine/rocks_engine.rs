use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rocksdb::{Options, DB};

use crate::engine::{SnapshotEngine, SnapshotHandle};
use crate::error::{CResult, Error};

/// Snapshot backend on RocksDB, linked only when the "rocksdb" feature is
/// enabled. Unlike sled it supports genuinely read-only opens, so multiple
/// processes can serve the same published snapshot.
#[derive(Clone, Copy, Default)]
pub struct RocksEngine;

impl RocksEngine {
    pub fn new() -> Self {
        RocksEngine
    }
}

impl SnapshotEngine for RocksEngine {
    type Handle = RocksHandle;

    fn open_writable(&self, dir: &Path) -> CResult<Self::Handle> {
        std::fs::create_dir_all(dir)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_use_fsync(true); // Make things a bit more durable in theory.
        let db = DB::open(&opts, dir)?;
        Ok(RocksHandle { db, writable: true, closed: AtomicBool::new(false) })
    }

    fn open_readonly(&self, dir: &Path) -> CResult<Self::Handle> {
        let db = DB::open_for_read_only(&Options::default(), dir, false)?;
        Ok(RocksHandle { db, writable: false, closed: AtomicBool::new(false) })
    }
}

pub struct RocksHandle {
    db: DB,
    writable: bool,
    closed: AtomicBool,
}

impl SnapshotHandle for RocksHandle {
    fn put(&self, key: &[u8], value: &[u8]) -> CResult<()> {
        if !self.writable {
            return Err(Error::Engine("put on a read-only snapshot".to_string()));
        }
        self.db.put(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn multi_get(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>> {
        self.db
            .multi_get(keys)
            .into_iter()
            .map(|result| result.map_err(Error::from))
            .collect()
    }

    fn close(&self) -> CResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.writable {
            self.db.flush()?;
        }
        Ok(())
    }
}

/// Attempt to flush the snapshot when the handle is dropped.
impl Drop for RocksHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to flush snapshot on drop: {}", err);
        }
    }
}
