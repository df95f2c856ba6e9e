use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::codec::Codec;
use crate::config::StoreOptions;
use crate::db::{reclaim_expired, SnapshotSink, VersionedDb};
use crate::engine::SnapshotEngine;
use crate::error::{CResult, Error};
use crate::version::VersionRecord;

/// Reclamation window of the disk-quota enforcer, fixed at 24 hours.
const QUOTA_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// The multi-database store: hosts the data root, bounds the set of open
/// databases, runs periodic reclamation and enforces the disk-usage
/// ceiling.
///
/// Databases load lazily on first reference and close when idle-evicted
/// from the cache or when the store closes. A single background worker
/// periodically clears expired versions of every resident database; it
/// holds only a weak reference to the shared state so it can never outlive
/// the store.
pub struct Store<E: SnapshotEngine, K: 'static, V: 'static> {
    inner: Arc<StoreInner<E, K, V>>,
    stop: Arc<StopSignal>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

struct StoreInner<E: SnapshotEngine, K: 'static, V: 'static> {
    opts: StoreOptions,
    engine: Arc<E>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    dbs: Cache<String, Arc<VersionedDb<E, K, V>>>,
}

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl<E: SnapshotEngine, K: 'static, V: 'static> Store<E, K, V> {
    /// Opens a store over `opts.data_dir`, creating the directory if
    /// missing, and starts the maintenance worker.
    pub fn open<KC, VC>(
        opts: StoreOptions,
        engine: E,
        key_codec: KC,
        value_codec: VC,
    ) -> CResult<Self>
    where
        KC: Codec<K> + 'static,
        VC: Codec<V> + 'static,
    {
        opts.validate()?;
        std::fs::create_dir_all(&opts.data_dir)?;

        let dbs: Cache<String, Arc<VersionedDb<E, K, V>>> = Cache::builder()
            .max_capacity(opts.max_open_dbs)
            .time_to_idle(opts.db_idle())
            .eviction_listener(|name: Arc<String>, db: Arc<VersionedDb<E, K, V>>, _cause| {
                db.close();
                log::info!("closed idle database {}", name);
            })
            .build();

        let inner = Arc::new(StoreInner {
            engine: Arc::new(engine),
            key_codec: Arc::new(key_codec),
            value_codec: Arc::new(value_codec),
            dbs,
            opts,
        });

        let stop = Arc::new(StopSignal { stopped: Mutex::new(false), cond: Condvar::new() });
        let weak = Arc::downgrade(&inner);
        let signal = stop.clone();
        let delay = inner.opts.clean_delay();
        let period = inner.opts.clean_period();
        let janitor = std::thread::Builder::new()
            .name("snapkv-maintenance".to_string())
            .spawn(move || maintenance_loop(weak, signal, delay, period))?;

        Ok(Store { inner, stop, janitor: Mutex::new(Some(janitor)) })
    }

    /// Fetches a database by name, loading and caching it on a miss. A
    /// blank or reserved name, or a database that fails to open, reads as
    /// absent.
    pub fn get_db(&self, name: &str) -> Option<Arc<VersionedDb<E, K, V>>> {
        if !valid_name(name) {
            return None;
        }
        self.inner.dbs.optionally_get_with(name.to_string(), || self.load_db(name))
    }

    fn load_db(&self, name: &str) -> Option<Arc<VersionedDb<E, K, V>>> {
        let inner = &self.inner;
        match VersionedDb::new(
            inner.opts.data_dir.join(name),
            inner.engine.clone(),
            inner.key_codec.clone(),
            inner.value_codec.clone(),
            inner.opts.db.clone(),
        ) {
            Ok(db) => Some(Arc::new(db)),
            Err(err) => {
                log::error!("failed to open database {:?}: {}", name, err);
                None
            }
        }
    }

    /// Publishes a new version of the named database through the producer,
    /// then enforces the disk quota. Returns whether a version was
    /// installed; losing the publication race is not an error.
    pub fn create_and_fill<F>(&self, name: &str, producer: F) -> CResult<bool>
    where
        F: FnOnce(&mut SnapshotSink<'_, E, K, V>) -> CResult<bool>,
    {
        if !valid_name(name) {
            return Err(Error::Argument(format!("invalid database name {:?}", name)));
        }
        let db = self
            .get_db(name)
            .ok_or_else(|| Error::Io(format!("failed to open database {:?}", name)))?;
        let installed = db.write_once(producer)?;
        if let Err(err) = self.enforce_disk_quota() {
            log::error!("disk quota enforcement failed: {}", err);
        }
        Ok(installed)
    }

    /// Walks the data root and, when its total size crosses the ceiling,
    /// reclaims expired versions of every database, resident or not, with a
    /// fixed 24-hour window. Works straight on the version record files so
    /// the open-database cache is left untouched.
    pub fn enforce_disk_quota(&self) -> CResult<()> {
        let opts = &self.inner.opts;
        let used = fs_extra::dir::get_size(&opts.data_dir)?;
        if used <= opts.quota_bytes() {
            return Ok(());
        }
        log::warn!(
            "data dir {:?} holds {} bytes, over the {} byte ceiling, reclaiming",
            opts.data_dir,
            used,
            opts.quota_bytes()
        );
        for entry in std::fs::read_dir(&opts.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if !valid_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let record = match VersionRecord::open(&entry.path(), opts.db.version_slots) {
                Ok(record) => record,
                Err(err) => {
                    log::error!("failed to open version record of {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            let record = RwLock::new(record);
            reclaim_expired(&record, &entry.path(), QUOTA_WINDOW_MS);
            if let Err(err) = record.into_inner().close() {
                log::error!("failed to close version record of {:?}: {}", entry.path(), err);
            }
        }
        Ok(())
    }

    /// Stops the maintenance worker and closes every resident database.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut stopped = self.stop.stopped.lock();
            *stopped = true;
        }
        self.stop.cond.notify_all();
        if let Some(janitor) = self.janitor.lock().take() {
            if janitor.join().is_err() {
                log::error!("maintenance worker panicked");
            }
        }
        for (name, db) in self.inner.dbs.iter() {
            log::debug!("closing database {}", name);
            db.close();
        }
        self.inner.dbs.invalidate_all();
        self.inner.dbs.run_pending_tasks();
    }
}

impl<E: SnapshotEngine, K: 'static, V: 'static> Drop for Store<E, K, V> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A usable database name: nonblank, no path separators, and not starting
/// with the underscore reserved for the version record and writer scratch.
fn valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && !name.starts_with('_')
}

fn maintenance_loop<E: SnapshotEngine, K: 'static, V: 'static>(
    inner: Weak<StoreInner<E, K, V>>,
    stop: Arc<StopSignal>,
    delay: Duration,
    period: Duration,
) {
    let mut wait = delay;
    loop {
        {
            let mut stopped = stop.stopped.lock();
            if !*stopped && !wait.is_zero() {
                let _ = stop.cond.wait_for(&mut stopped, wait);
            }
            if *stopped {
                return;
            }
        }
        match inner.upgrade() {
            Some(inner) => run_maintenance(&inner),
            None => return,
        }
        wait = period;
    }
}

/// One maintenance pass: clear expired versions of every resident database
/// and let idle ones evict. Every failure is logged by the callee and the
/// pass moves on.
fn run_maintenance<E: SnapshotEngine, K: 'static, V: 'static>(inner: &StoreInner<E, K, V>) {
    for (name, db) in inner.dbs.iter() {
        log::debug!("clearing expired versions of {}", name);
        db.clear();
    }
    inner.dbs.run_pending_tasks();
}
