use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::sync::Cache;
use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::config::DbOptions;
use crate::engine::{SnapshotEngine, SnapshotHandle};
use crate::error::{CResult, Error};
use crate::version::{now_ms, VersionRecord, CLEARING};

/// Prefix of a writer's scratch directory, `_temp_v<version>_<ms>`.
pub(crate) const TEMP_PREFIX: &str = "_temp_v";

/// One logical database: a directory of write-once snapshot versions plus
/// the version record that publishes them.
///
/// Readers always see the latest published version. A publication streams
/// data into a scratch directory, flushes it, compare-and-sets the current
/// version and only then renames the scratch to its version name, so a
/// version directory observed on disk has always already been published.
pub struct VersionedDb<E: SnapshotEngine, K: 'static, V: 'static> {
    path: PathBuf,
    opts: DbOptions,
    engine: Arc<E>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    record: RwLock<VersionRecord>,
    handles: Cache<i32, Arc<E::Handle>>,
}

/// Typed write surface handed to a producer during write_once(). Every put
/// is serialized through the database's codecs into the scratch snapshot.
pub struct SnapshotSink<'a, E: SnapshotEngine, K, V> {
    handle: &'a E::Handle,
    key_codec: &'a dyn Codec<K>,
    value_codec: &'a dyn Codec<V>,
}

impl<'a, E: SnapshotEngine, K, V> SnapshotSink<'a, E, K, V> {
    pub fn put(&mut self, key: &K, value: &V) -> CResult<()> {
        let kbytes = self.key_codec.encode(key)?;
        let vbytes = self.value_codec.encode(value)?;
        self.handle.put(&kbytes, &vbytes)
    }
}

/// Database status, in the spirit of an engine status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The database directory name.
    pub name: String,

    /// The currently published version, 0 for an empty database.
    pub current_version: i32,

    /// The number of version directories on disk.
    pub versions: u64,

    /// The on-disk size of the database directory.
    pub total_disk_size: u64,
}

impl<E: SnapshotEngine, K: 'static, V: 'static> VersionedDb<E, K, V> {
    /// Opens the database at `path`, creating it if missing. Sweeps scratch
    /// directories orphaned by crashed writers before anything else.
    pub(crate) fn new(
        path: PathBuf,
        engine: Arc<E>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        opts: DbOptions,
    ) -> CResult<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&path)?;
        sweep_orphans(&path)?;
        let record = VersionRecord::open(&path, opts.version_slots)?;
        let handles: Cache<i32, Arc<E::Handle>> = Cache::builder()
            .max_capacity(opts.max_open_handles)
            .time_to_idle(opts.handle_idle())
            .eviction_listener(|version: Arc<i32>, handle: Arc<E::Handle>, _cause| {
                if let Err(err) = handle.close() {
                    log::error!("failed to close snapshot handle for version {}: {}", version, err);
                }
            })
            .build();

        Ok(VersionedDb {
            path,
            opts,
            engine,
            key_codec,
            value_codec,
            record: RwLock::new(record),
            handles,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The currently published version, 0 for an empty database.
    pub fn version(&self) -> i32 {
        match self.record.read().latest() {
            Ok(version) => version,
            Err(err) => {
                log::error!("failed to read current version of {}: {}", self, err);
                0
            }
        }
    }

    /// Point lookup against the latest published version. Read failures are
    /// absorbed: they are logged and read as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(err) => {
                log::error!("read on {} failed: {}", self, err);
                None
            }
        }
    }

    fn try_get(&self, key: &K) -> CResult<Option<V>> {
        let version = self.record.read().latest()?;
        if version <= 0 {
            return Ok(None);
        }
        let handle = match self.handle(version) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        let kbytes = self.key_codec.encode(key)?;
        match handle.get(&kbytes)? {
            Some(vbytes) => Ok(Some(self.value_codec.decode(&vbytes)?)),
            None => Ok(None),
        }
    }

    /// Batch lookup against the latest published version, one engine call,
    /// positionally aligned with `keys`. A database without a usable
    /// version reads as all-absent; a failure is logged and returns an
    /// empty list.
    pub fn multi_get(&self, keys: &[K]) -> Vec<Option<V>> {
        match self.try_multi_get(keys) {
            Ok(values) => values,
            Err(err) => {
                log::error!("batch read on {} failed: {}", self, err);
                Vec::new()
            }
        }
    }

    fn try_multi_get(&self, keys: &[K]) -> CResult<Vec<Option<V>>> {
        let version = self.record.read().latest()?;
        let handle = if version > 0 { self.handle(version) } else { None };
        let handle = match handle {
            Some(handle) => handle,
            None => return Ok(keys.iter().map(|_| None).collect()),
        };
        let kbytes = keys
            .iter()
            .map(|key| self.key_codec.encode(key))
            .collect::<CResult<Vec<_>>>()?;
        handle
            .multi_get(&kbytes)?
            .into_iter()
            .map(|vbytes| vbytes.map(|b| self.value_codec.decode(&b)).transpose())
            .collect()
    }

    /// Fetches the cached handle of `version`, opening it read-only on a
    /// miss. Concurrent callers of the same version share one open.
    fn handle(&self, version: i32) -> Option<Arc<E::Handle>> {
        self.handles.optionally_get_with(version, || self.open_handle(version))
    }

    fn open_handle(&self, version: i32) -> Option<Arc<E::Handle>> {
        if version <= 0 {
            return None;
        }
        let dir = self.path.join(version.to_string());
        if !dir.is_dir() {
            return None;
        }
        let stamp = match self.record.read().record_value(version) {
            Ok(stamp) => stamp,
            Err(err) => {
                log::error!("failed to read record {} of {}: {}", version, self, err);
                return None;
            }
        };
        if stamp <= CLEARING {
            // Reclamation is deleting this version.
            return None;
        }
        let handle = match self.engine.open_readonly(&dir) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("failed to open snapshot {:?}: {}", dir, err);
                return None;
            }
        };
        // Refresh the access stamp. Losing this race is fine, the winner's
        // stamp is just as recent.
        match self.record.write().compare_and_set_record_value(version, stamp, now_ms()) {
            Ok(_) => {}
            Err(err) => log::warn!("failed to stamp version {} of {}: {}", version, self, err),
        }
        Some(Arc::new(handle))
    }

    /// Publishes the next version. The producer fills a scratch snapshot
    /// and reports whether it should be installed; the publication itself
    /// is a compare-and-set on the version record followed by an atomic
    /// rename. Returns whether a version was installed: losing the
    /// publication race or a producer abandoning its data is not an error.
    pub fn write_once<F>(&self, producer: F) -> CResult<bool>
    where
        F: FnOnce(&mut SnapshotSink<'_, E, K, V>) -> CResult<bool>,
    {
        let (expected, slots) = {
            let record = self.record.read();
            (record.latest()?, record.slots())
        };
        let next = expected + 1;
        if next > slots {
            return Err(Error::CapacityExhausted(format!(
                "all {} version slots of {} are used",
                slots, self
            )));
        }

        let scratch = self.path.join(format!("{}{}_{}", TEMP_PREFIX, next, now_ms()));
        std::fs::create_dir_all(&scratch)?;

        let produced = match self.produce(&scratch, producer) {
            Ok(produced) => produced,
            Err(err) => {
                remove_scratch(&scratch);
                return Err(err);
            }
        };
        if !produced {
            log::info!("producer abandoned version {} of {}", next, self);
            remove_scratch(&scratch);
            return Ok(false);
        }

        let installed = match self.record.write().compare_and_set_latest(expected, next) {
            Ok(installed) => installed,
            Err(err) => {
                remove_scratch(&scratch);
                return Err(err);
            }
        };
        if !installed {
            log::info!("version {} of {} lost the publication race", next, self);
            remove_scratch(&scratch);
            return Ok(false);
        }
        std::fs::rename(&scratch, self.path.join(next.to_string()))?;
        log::info!("published version {} of {}", next, self);
        Ok(true)
    }

    fn produce<F>(&self, scratch: &Path, producer: F) -> CResult<bool>
    where
        F: FnOnce(&mut SnapshotSink<'_, E, K, V>) -> CResult<bool>,
    {
        let handle = self.engine.open_writable(scratch)?;
        let mut sink = SnapshotSink {
            handle: &handle,
            key_codec: self.key_codec.as_ref(),
            value_codec: self.value_codec.as_ref(),
        };
        let produced = producer(&mut sink);
        // Flush even when the producer failed, the close must not be skipped.
        let closed = handle.close();
        let produced = produced?;
        closed?;
        Ok(produced)
    }

    /// Deletes versions that have not been read within the configured
    /// window. The current version is never considered. Failures are logged
    /// and skipped, never raised.
    pub fn clear(&self) {
        reclaim_expired(&self.record, &self.path, self.opts.clear_window_ms());
    }

    /// Walks the database directory for a status report.
    pub fn status(&self) -> CResult<Status> {
        let current_version = self.record.read().latest()?;
        let mut versions = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry.file_name().to_string_lossy().parse::<i32>().is_ok()
            {
                versions += 1;
            }
        }
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Status {
            name,
            current_version,
            versions,
            total_disk_size: fs_extra::dir::get_size(&self.path)?,
        })
    }

    /// Closes every open snapshot handle and the version record. Idempotent.
    pub fn close(&self) {
        for (version, handle) in self.handles.iter() {
            if let Err(err) = handle.close() {
                log::error!("failed to close snapshot handle for version {}: {}", version, err);
            }
        }
        self.handles.invalidate_all();
        self.handles.run_pending_tasks();
        if let Err(err) = self.record.write().close() {
            log::error!("failed to close version record of {}: {}", self, err);
        }
    }
}

impl<E: SnapshotEngine, K: 'static, V: 'static> std::fmt::Display for VersionedDb<E, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "database {:?}", self.path)
    }
}

/// Attempt to release every resource when the database is dropped.
impl<E: SnapshotEngine, K: 'static, V: 'static> Drop for VersionedDb<E, K, V> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deletes scratch directories left behind by crashed writers. They were
/// never published: the compare-and-set plus rename did not run to
/// completion.
fn sweep_orphans(path: &Path) -> CResult<()> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(TEMP_PREFIX) && entry.file_type()?.is_dir() {
            log::warn!("sweeping orphaned writer scratch {:?}", entry.path());
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn remove_scratch(scratch: &Path) {
    if let Err(err) = std::fs::remove_dir_all(scratch) {
        log::error!("failed to remove writer scratch {:?}: {}", scratch, err);
    }
}

/// The reclamation loop shared by clear() and the disk-quota enforcer.
///
/// Walks every version below the current one and deletes those whose access
/// stamp fell out of the window. A deletion is gated by compare-and-setting
/// the stamp to [`CLEARING`]; concurrent reclaimers race on that
/// compare-and-set and the loser skips. When the deletion itself fails the
/// stamp is restored so the version stays eligible next time.
pub(crate) fn reclaim_expired(record: &RwLock<VersionRecord>, dir: &Path, window_ms: i64) {
    let latest = match record.read().latest() {
        Ok(latest) => latest,
        Err(err) => {
            log::error!("failed to read current version of {:?}: {}", dir, err);
            return;
        }
    };
    let now = now_ms();
    for version in 1..latest {
        let stamp = match record.read().record_value(version) {
            Ok(stamp) => stamp,
            Err(err) => {
                log::error!("failed to read record {} of {:?}: {}", version, dir, err);
                continue;
            }
        };
        if stamp < 0 || now - stamp <= window_ms {
            continue;
        }
        let claimed = match record.write().compare_and_set_record_value(version, stamp, CLEARING) {
            Ok(claimed) => claimed,
            Err(err) => {
                log::error!("failed to claim record {} of {:?}: {}", version, dir, err);
                continue;
            }
        };
        if !claimed {
            // Another reclaimer got there first.
            continue;
        }
        let target = dir.join(version.to_string());
        match std::fs::remove_dir_all(&target) {
            Ok(()) => log::info!("reclaimed version {} at {:?}", version, target),
            // A slot gap: the version number was allocated but never
            // published, there is nothing on disk.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                log::error!("failed to delete {:?}, restoring stamp: {}", target, err);
                match record.write().compare_and_set_record_value(version, CLEARING, stamp) {
                    Ok(_) => {}
                    Err(err) => log::error!(
                        "failed to restore stamp of version {} of {:?}: {}",
                        version,
                        dir,
                        err
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Barrier;

    use super::*;
    use crate::codec::int_codec::IntCodec;
    use crate::codec::string_codec::StringCodec;
    use crate::engine::sled_engine::SledEngine;
    use crate::version::VERSION_FILE;

    type TestDb = VersionedDb<SledEngine, i64, String>;

    fn open(path: PathBuf, opts: DbOptions) -> CResult<TestDb> {
        VersionedDb::new(
            path,
            Arc::new(SledEngine::new()),
            Arc::new(IntCodec::new()),
            Arc::new(StringCodec::new()),
            opts,
        )
    }

    fn setup() -> CResult<(tempdir::TempDir, TestDb)> {
        let dir = tempdir::TempDir::new("vdb")?;
        let db = open(dir.path().join("db1"), DbOptions::default())?;
        Ok((dir, db))
    }

    /// A producer that installs the given rows.
    fn rows(pairs: &[(i64, &str)]) -> BTreeMap<i64, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    fn fill(db: &TestDb, pairs: &[(i64, &str)]) -> CResult<bool> {
        let map = rows(pairs);
        db.write_once(|sink| {
            for (key, value) in &map {
                sink.put(key, value)?;
            }
            Ok(true)
        })
    }

    #[test]
    /// Cold write then read: the first publication installs version 1.
    fn write_then_read() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert_eq!(db.version(), 0);
        assert_eq!(db.get(&1), None);

        assert!(fill(&db, &[(1, "a"), (2, "b")])?);
        assert_eq!(db.version(), 1);
        assert!(db.path().join("1").is_dir());
        assert!(db.path().join(VERSION_FILE).is_file());

        assert_eq!(db.get(&1), Some("a".to_string()));
        assert_eq!(db.get(&2), Some("b".to_string()));
        assert_eq!(db.get(&3), None);
        Ok(())
    }

    #[test]
    /// A second publication replaces, never merges.
    fn second_write_replaces() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a"), (2, "b")])?);
        assert!(fill(&db, &[(1, "x")])?);

        assert_eq!(db.version(), 2);
        assert!(db.path().join("1").is_dir());
        assert!(db.path().join("2").is_dir());

        assert_eq!(db.get(&1), Some("x".to_string()));
        assert_eq!(
            db.multi_get(&[1, 2, 3]),
            vec![Some("x".to_string()), None, None]
        );
        Ok(())
    }

    #[test]
    fn multi_get_on_empty_db() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert_eq!(db.multi_get(&[1, 2]), vec![None, None]);
        Ok(())
    }

    #[test]
    /// A producer that reports failure leaves nothing behind.
    fn abandoned_producer_cleans_up() -> CResult<()> {
        let (_dir, db) = setup()?;
        let installed = db.write_once(|sink| {
            sink.put(&1, &"ignored".to_string())?;
            Ok(false)
        })?;
        assert!(!installed);
        assert_eq!(db.version(), 0);
        assert_eq!(scratch_dirs(db.path())?, 0);
        Ok(())
    }

    #[test]
    /// A producer error surfaces and leaves nothing behind.
    fn failing_producer_cleans_up() -> CResult<()> {
        let (_dir, db) = setup()?;
        let result: CResult<bool> =
            db.write_once(|_| Err(Error::Engine("producer blew up".to_string())));
        assert!(result.is_err());
        assert_eq!(db.version(), 0);
        assert_eq!(scratch_dirs(db.path())?, 0);
        Ok(())
    }

    #[test]
    /// Publishing past the record capacity fails.
    fn capacity_exhausted() -> CResult<()> {
        let dir = tempdir::TempDir::new("vdb")?;
        let opts = DbOptions { version_slots: 2, ..DbOptions::default() };
        let db = open(dir.path().join("small"), opts)?;

        assert!(fill(&db, &[(1, "a")])?);
        assert!(fill(&db, &[(1, "b")])?);
        match fill(&db, &[(1, "c")]) {
            Err(Error::CapacityExhausted(_)) => {}
            other => panic!("expected capacity exhaustion, got {:?}", other),
        }
        assert_eq!(db.version(), 2);
        Ok(())
    }

    #[test]
    /// Two racing writers: exactly one publishes, the loser's scratch is
    /// deleted.
    fn publication_race() -> CResult<()> {
        let (_dir, db) = setup()?;
        let barrier = Barrier::new(2);
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let (first, second) = std::thread::scope(|scope| {
            let first = scope.spawn(|| {
                db.write_once(|sink| {
                    sink.put(&1, &"first".to_string())?;
                    started_tx.send(()).expect("receiver should be alive");
                    barrier.wait();
                    Ok(true)
                })
            });
            // Start the second writer only once the first one's scratch
            // exists, and a beat later so the scratch names differ.
            started_rx.recv().expect("first writer should start");
            std::thread::sleep(std::time::Duration::from_millis(5));
            let second = scope.spawn(|| {
                db.write_once(|sink| {
                    sink.put(&1, &"second".to_string())?;
                    barrier.wait();
                    Ok(true)
                })
            });
            (first.join().expect("writer panicked"), second.join().expect("writer panicked"))
        });

        let installed = [first?, second?];
        assert_eq!(installed.iter().filter(|i| **i).count(), 1);
        assert_eq!(db.version(), 1);
        assert!(db.path().join("1").is_dir());
        assert!(!db.path().join("2").exists());
        assert_eq!(scratch_dirs(db.path())?, 0);
        Ok(())
    }

    #[test]
    /// Reclamation deletes an expired version, marks its record and leaves
    /// the current version alone.
    fn clear_reclaims_expired() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);
        assert_eq!(db.get(&1), Some("a".to_string()));
        assert!(fill(&db, &[(1, "x")])?);
        assert_eq!(db.get(&1), Some("x".to_string()));

        // Age version 1 past the reclamation window.
        let mut record = VersionRecord::open(db.path(), 64)?;
        let stamp = record.record_value(1)?;
        assert!(stamp > 0);
        let aged = now_ms() - db.opts.clear_window_ms() - 1_000;
        assert!(record.compare_and_set_record_value(1, stamp, aged)?);

        db.clear();

        assert!(!db.path().join("1").exists());
        assert!(db.path().join("2").is_dir());
        assert_eq!(db.version(), 2);
        assert_eq!(record.record_value(1)?, CLEARING);
        assert_eq!(db.get(&1), Some("x".to_string()));
        Ok(())
    }

    #[test]
    /// A fresh version inside the window survives reclamation.
    fn clear_keeps_recent_versions() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);
        assert_eq!(db.get(&1), Some("a".to_string()));
        assert!(fill(&db, &[(1, "x")])?);

        db.clear();

        assert!(db.path().join("1").is_dir());
        assert!(db.path().join("2").is_dir());
        Ok(())
    }

    #[test]
    /// A reader refuses a version whose record carries the clearing mark.
    fn reader_refuses_clearing() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);

        let mut record = VersionRecord::open(db.path(), 64)?;
        let stamp = record.record_value(1)?;
        assert!(record.compare_and_set_record_value(1, stamp, CLEARING)?);

        assert_eq!(db.get(&1), None);
        db.handles.run_pending_tasks();
        assert_eq!(db.handles.entry_count(), 0);
        Ok(())
    }

    #[test]
    /// Orphaned scratch directories are swept on startup.
    fn startup_sweeps_orphans() -> CResult<()> {
        let dir = tempdir::TempDir::new("vdb")?;
        let path = dir.path().join("db1");
        let orphan = path.join("_temp_v3_12345");
        std::fs::create_dir_all(&orphan)?;
        std::fs::write(orphan.join("junk"), b"half-written")?;

        let db = open(path.clone(), DbOptions::default())?;
        assert!(!orphan.exists());

        assert!(fill(&db, &[(7, "ok")])?);
        assert_eq!(db.version(), 1);
        assert_eq!(db.get(&7), Some("ok".to_string()));
        Ok(())
    }

    #[test]
    /// The handle cache is bounded and eviction closes handles.
    fn handle_cache_is_bounded() -> CResult<()> {
        let dir = tempdir::TempDir::new("vdb")?;
        let opts = DbOptions { max_open_handles: 1, ..DbOptions::default() };
        let db = open(dir.path().join("db1"), opts)?;

        assert!(fill(&db, &[(1, "a")])?);
        assert_eq!(db.get(&1), Some("a".to_string()));
        assert!(fill(&db, &[(1, "b")])?);
        assert_eq!(db.get(&1), Some("b".to_string()));

        db.handles.run_pending_tasks();
        assert!(db.handles.entry_count() <= 1);
        Ok(())
    }

    #[test]
    /// Repeated reads share the cached handle.
    fn repeated_reads_reuse_handle() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);

        assert_eq!(db.get(&1), Some("a".to_string()));
        db.handles.run_pending_tasks();
        assert_eq!(db.handles.entry_count(), 1);
        for _ in 0..5 {
            assert_eq!(db.get(&1), Some("a".to_string()));
        }
        db.handles.run_pending_tasks();
        assert_eq!(db.handles.entry_count(), 1);
        Ok(())
    }

    #[test]
    fn status_reports_versions() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);
        assert!(fill(&db, &[(1, "b")])?);

        let status = db.status()?;
        assert_eq!(status.name, "db1");
        assert_eq!(status.current_version, 2);
        assert_eq!(status.versions, 2);
        assert!(status.total_disk_size > 0);
        Ok(())
    }

    #[test]
    /// Reads keep absorbing after close instead of panicking.
    fn reads_after_close_are_absent() -> CResult<()> {
        let (_dir, db) = setup()?;
        assert!(fill(&db, &[(1, "a")])?);
        db.close();
        db.close();
        assert_eq!(db.version(), 0);
        assert_eq!(db.get(&1), None);
        Ok(())
    }

    fn scratch_dirs(path: &Path) -> CResult<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            if entry?.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                count += 1;
            }
        }
        Ok(count)
    }
}
