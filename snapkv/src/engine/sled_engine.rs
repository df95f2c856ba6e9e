use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sled::Mode::HighThroughput;

use crate::engine::{SnapshotEngine, SnapshotHandle};
use crate::error::{CResult, Error};

/// Snapshot backend on sled, the default engine.
#[derive(Clone, Copy, Default)]
pub struct SledEngine;

impl SledEngine {
    pub fn new() -> Self {
        SledEngine
    }
}

impl SnapshotEngine for SledEngine {
    type Handle = SledHandle;

    fn open_writable(&self, dir: &Path) -> CResult<Self::Handle> {
        let config = sled::Config::default().path(dir).mode(HighThroughput);
        let db = config.open()?;
        Ok(SledHandle { db, writable: true, closed: AtomicBool::new(false) })
    }

    fn open_readonly(&self, dir: &Path) -> CResult<Self::Handle> {
        // sled has no read-only open mode; the handle refuses writes instead.
        let config = sled::Config::default().path(dir);
        let db = config.open()?;
        Ok(SledHandle { db, writable: false, closed: AtomicBool::new(false) })
    }
}

pub struct SledHandle {
    db: sled::Db,
    writable: bool,
    closed: AtomicBool,
}

impl SnapshotHandle for SledHandle {
    fn put(&self, key: &[u8], value: &[u8]) -> CResult<()> {
        if !self.writable {
            return Err(Error::Engine("put on a read-only snapshot".to_string()));
        }
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    fn multi_get(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn close(&self) -> CResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush()?;
        Ok(())
    }
}

/// Attempt to flush the snapshot when the handle is dropped.
impl Drop for SledHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to flush snapshot on drop: {}", err);
        }
    }
}
