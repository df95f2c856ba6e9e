use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{CResult, Error};

/// Name of the per-database version record file.
pub const VERSION_FILE: &str = "_VERSION";

/// Width of the current-version field at the head of the file.
const META_LEN: usize = 4;

/// Width of one per-version record: a 4-byte version tag and an 8-byte
/// access stamp.
const RECORD_LEN: usize = 12;

/// Record capacity used when the configured one is out of range.
pub const DEFAULT_SLOTS: i32 = 64;

/// Hard ceiling on the record capacity.
pub const MAX_SLOTS: i32 = 1024;

/// Access-stamp sentinel: reclamation of this version is in progress and
/// readers must refuse to open it.
pub const CLEARING: i64 = -1;

/// Unix milliseconds, the clock all access stamps use.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An exclusive advisory byte-range lock on the record file, released on
/// drop.
///
/// fcntl locks exclude other processes, not other threads of this process;
/// in-process exclusion comes from the lock wrapping the whole record.
pub struct RangeLock<'a> {
    file: &'a File,
    start: i64,
    len: i64,
}

impl<'a> RangeLock<'a> {
    /// Takes an exclusive lock on `[start, start+len)` without blocking.
    /// Returns None when another process holds a conflicting lock.
    fn acquire(file: &'a File, start: i64, len: i64) -> CResult<Option<Self>> {
        let locked = fcntl_range(file, libc::F_WRLCK as libc::c_short, start, len)
            .map_err(|err| Error::Lock(err.to_string()))?;
        Ok(locked.then_some(RangeLock { file, start, len }))
    }
}

impl<'a> Drop for RangeLock<'a> {
    fn drop(&mut self) {
        if let Err(err) = fcntl_range(self.file, libc::F_UNLCK as libc::c_short, self.start, self.len) {
            log::warn!(
                "failed to release byte-range lock at {}+{}: {}",
                self.start,
                self.len,
                err
            );
        }
    }
}

/// Issues a non-blocking fcntl(F_SETLK) for the given range. Returns false
/// when the range is held by another process.
fn fcntl_range(file: &File, lock_type: libc::c_short, start: i64, len: i64) -> io::Result<bool> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

fn read_i32(map: &MmapMut, offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&map[offset..offset + 4]);
    i32::from_le_bytes(buf)
}

fn read_i64(map: &MmapMut, offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

struct Mapping {
    file: File,
    map: MmapMut,
}

/// The fixed-layout version record backing one logical database, a
/// memory-mapped `_VERSION` file of `4 + slots * 12` bytes. All fields are
/// little-endian, the native order of the hosts this store targets; there is
/// no magic or header byte, the layout is the format.
///
/// - Bytes `0..4`: the current version, 0 until the first publication.
/// - Bytes `4 + (v-1)*12 ..`: the record of version `v`, a 4-byte version
///   tag (0 until first use, then `v`) followed by an 8-byte access stamp.
///
/// An access stamp is the Unix-millisecond time of the last read-only open
/// of that version, 0 for never-touched slots, or [`CLEARING`] while the
/// version directory is being deleted.
///
/// Cooperating processes share the file through the page cache. Every
/// mutation happens under an exclusive fcntl byte-range lock on exactly the
/// bytes it touches and is flushed before the lock is released; reads are
/// lock-free and may be momentarily stale under a racing writer.
pub struct VersionRecord {
    path: PathBuf,
    slots: i32,
    inner: Option<Mapping>,
}

impl VersionRecord {
    /// Opens (creating and zero-extending as needed) the version record of
    /// the database directory `dir`. A `dir` already pointing at a
    /// `_VERSION` file is used as-is. A capacity outside `[1, MAX_SLOTS]`
    /// falls back to [`DEFAULT_SLOTS`].
    pub fn open(dir: &Path, slots: i32) -> CResult<Self> {
        let slots = if (1..=MAX_SLOTS).contains(&slots) {
            slots
        } else {
            log::warn!(
                "record capacity {} out of range 1..={}, using {}",
                slots,
                MAX_SLOTS,
                DEFAULT_SLOTS
            );
            DEFAULT_SLOTS
        };

        let path = if dir.file_name() == Some(OsStr::new(VERSION_FILE)) {
            dir.to_path_buf()
        } else {
            dir.join(VERSION_FILE)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let expected = (META_LEN + slots as usize * RECORD_LEN) as u64;
        if file.metadata()?.len() < expected {
            // set_len zero-fills the gap
            file.set_len(expected)?;
            file.sync_all()?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(VersionRecord { path, slots, inner: Some(Mapping { file, map }) })
    }

    /// The record capacity, i.e. the largest version this database can hold.
    pub fn slots(&self) -> i32 {
        self.slots
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mapping(&self) -> CResult<&Mapping> {
        self.inner
            .as_ref()
            .ok_or_else(|| Error::Io(format!("version record {:?} is closed", self.path)))
    }

    fn mapping_mut(&mut self) -> CResult<&mut Mapping> {
        let path = &self.path;
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Io(format!("version record {:?} is closed", path)))
    }

    fn check_slot(&self, version: i32) -> CResult<()> {
        if !(1..=self.slots).contains(&version) {
            return Err(Error::Argument(format!(
                "version {} out of range 1..={}",
                version, self.slots
            )));
        }
        Ok(())
    }

    fn record_offset(version: i32) -> usize {
        META_LEN + (version as usize - 1) * RECORD_LEN
    }

    /// The currently published version, 0 for an empty database. Lock-free;
    /// may briefly trail a concurrent publisher, which the next
    /// compare-and-set or record read re-validates.
    pub fn latest(&self) -> CResult<i32> {
        Ok(read_i32(&self.mapping()?.map, 0))
    }

    /// Installs `new` as the current version if the field still holds
    /// `expected`. Only strictly increasing installs are accepted; `new`
    /// outside `[1, slots]` is a programming error. Returns false on a miss,
    /// including when another process holds the meta lock.
    pub fn compare_and_set_latest(&mut self, expected: i32, new: i32) -> CResult<bool> {
        self.check_slot(new)?;
        if new <= expected {
            return Ok(false);
        }
        let mapping = self.mapping_mut()?;
        let guard = match RangeLock::acquire(&mapping.file, 0, META_LEN as i64)? {
            Some(guard) => guard,
            None => return Ok(false),
        };
        if read_i32(&mapping.map, 0) != expected {
            return Ok(false);
        }
        mapping.map[0..META_LEN].copy_from_slice(&new.to_le_bytes());
        mapping.map.flush_range(0, META_LEN)?;
        drop(guard);
        Ok(true)
    }

    /// The access stamp of `version`. Lock-free.
    pub fn record_value(&self, version: i32) -> CResult<i64> {
        self.check_slot(version)?;
        let offset = Self::record_offset(version);
        Ok(read_i64(&self.mapping()?.map, offset + 4))
    }

    /// Installs `new` as the access stamp of `version` if it still holds
    /// `expected`, initializing the version tag on first use. Returns false
    /// on a miss, a held lock, or a recoverable flush failure.
    pub fn compare_and_set_record_value(
        &mut self,
        version: i32,
        expected: i64,
        new: i64,
    ) -> CResult<bool> {
        self.check_slot(version)?;
        let offset = Self::record_offset(version);
        let VersionRecord { path, inner, .. } = self;
        let mapping = inner
            .as_mut()
            .ok_or_else(|| Error::Io(format!("version record {:?} is closed", path)))?;
        let guard = match RangeLock::acquire(&mapping.file, offset as i64, RECORD_LEN as i64)? {
            Some(guard) => guard,
            None => return Ok(false),
        };
        if read_i32(&mapping.map, offset) != version {
            mapping.map[offset..offset + 4].copy_from_slice(&version.to_le_bytes());
        }
        if read_i64(&mapping.map, offset + 4) != expected {
            return Ok(false);
        }
        mapping.map[offset + 4..offset + RECORD_LEN].copy_from_slice(&new.to_le_bytes());
        if let Err(err) = mapping.map.flush_range(offset, RECORD_LEN) {
            log::error!("failed to flush record {} of {:?}: {}", version, path, err);
            return Ok(false);
        }
        drop(guard);
        Ok(true)
    }

    /// Locks the current-version field for a caller-managed critical
    /// section. None when another process holds it.
    pub fn try_lock_meta(&self) -> CResult<Option<RangeLock<'_>>> {
        RangeLock::acquire(&self.mapping()?.file, 0, META_LEN as i64)
    }

    /// Locks the record of `version` for a caller-managed critical section.
    /// None when another process holds it.
    pub fn try_lock_record(&self, version: i32) -> CResult<Option<RangeLock<'_>>> {
        self.check_slot(version)?;
        let offset = Self::record_offset(version);
        RangeLock::acquire(&self.mapping()?.file, offset as i64, RECORD_LEN as i64)
    }

    /// Flushes and unmaps the file. Idempotent; all other operations fail
    /// once closed.
    pub fn close(&mut self) -> CResult<()> {
        if let Some(mapping) = self.inner.take() {
            mapping.map.flush()?;
        }
        Ok(())
    }
}

impl Drop for VersionRecord {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to close version record {:?}: {}", self.path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(slots: i32) -> CResult<(tempdir::TempDir, VersionRecord)> {
        let dir = tempdir::TempDir::new("record")?;
        let record = VersionRecord::open(dir.path(), slots)?;
        Ok((dir, record))
    }

    #[test]
    /// A fresh record file has the exact fixed size and reads as empty.
    fn open_sizes_file() -> CResult<()> {
        let (dir, record) = setup(64)?;
        let meta = std::fs::metadata(dir.path().join(VERSION_FILE))?;
        assert_eq!(meta.len(), 4 + 64 * 12);
        assert_eq!(record.latest()?, 0);
        assert_eq!(record.record_value(1)?, 0);
        assert_eq!(record.record_value(64)?, 0);
        Ok(())
    }

    #[test]
    /// An out-of-range capacity falls back to the default.
    fn open_clamps_capacity() -> CResult<()> {
        let (_dir, record) = setup(0)?;
        assert_eq!(record.slots(), DEFAULT_SLOTS);
        let (_dir, record) = setup(MAX_SLOTS + 1)?;
        assert_eq!(record.slots(), DEFAULT_SLOTS);
        let (_dir, record) = setup(1)?;
        assert_eq!(record.slots(), 1);
        Ok(())
    }

    #[test]
    /// A path that already names the record file is used as-is.
    fn open_accepts_file_path() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let record = VersionRecord::open(&dir.path().join(VERSION_FILE), 8)?;
        assert_eq!(record.path(), dir.path().join(VERSION_FILE));
        Ok(())
    }

    #[test]
    fn compare_and_set_latest() -> CResult<()> {
        let (_dir, mut record) = setup(8)?;

        assert!(record.compare_and_set_latest(0, 1)?);
        assert_eq!(record.latest()?, 1);

        // A stale expectation misses.
        assert!(!record.compare_and_set_latest(0, 2)?);
        assert_eq!(record.latest()?, 1);

        // Only strictly increasing versions install.
        assert!(!record.compare_and_set_latest(1, 1)?);
        assert!(record.compare_and_set_latest(1, 3)?);
        assert_eq!(record.latest()?, 3);

        // Out of range is a programming error.
        assert!(record.compare_and_set_latest(3, 9).is_err());
        assert!(record.compare_and_set_latest(3, 0).is_err());
        Ok(())
    }

    #[test]
    /// Survives a close and reopen with the same contents.
    fn reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let mut record = VersionRecord::open(dir.path(), 8)?;
        assert!(record.compare_and_set_latest(0, 2)?);
        assert!(record.compare_and_set_record_value(2, 0, 12345)?);
        record.close()?;

        let record = VersionRecord::open(dir.path(), 8)?;
        assert_eq!(record.latest()?, 2);
        assert_eq!(record.record_value(2)?, 12345);
        Ok(())
    }

    #[test]
    fn compare_and_set_record_value() -> CResult<()> {
        let (_dir, mut record) = setup(8)?;

        assert!(record.compare_and_set_record_value(3, 0, 1000)?);
        assert_eq!(record.record_value(3)?, 1000);

        assert!(!record.compare_and_set_record_value(3, 0, 2000)?);
        assert!(record.compare_and_set_record_value(3, 1000, 2000)?);
        assert_eq!(record.record_value(3)?, 2000);

        // The sentinel round-trips the way the reclaimer drives it.
        assert!(record.compare_and_set_record_value(3, 2000, CLEARING)?);
        assert_eq!(record.record_value(3)?, CLEARING);
        assert!(record.compare_and_set_record_value(3, CLEARING, 2000)?);
        assert_eq!(record.record_value(3)?, 2000);

        assert!(record.record_value(0).is_err());
        assert!(record.record_value(9).is_err());
        Ok(())
    }

    #[test]
    /// Two mappings of the same file observe each other's writes, the way
    /// cooperating processes do.
    fn shared_mappings() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let mut a = VersionRecord::open(dir.path(), 8)?;
        let b = VersionRecord::open(dir.path(), 8)?;

        assert!(a.compare_and_set_latest(0, 1)?);
        assert_eq!(b.latest()?, 1);

        assert!(a.compare_and_set_record_value(1, 0, 777)?);
        assert_eq!(b.record_value(1)?, 777);
        Ok(())
    }

    #[test]
    fn lock_guards_release_on_drop() -> CResult<()> {
        let (_dir, mut record) = setup(8)?;

        let meta = record.try_lock_meta()?;
        assert!(meta.is_some());
        drop(meta);

        let rec = record.try_lock_record(5)?;
        assert!(rec.is_some());
        drop(rec);
        assert!(record.try_lock_record(9).is_err());

        // The record stays fully usable after guard churn.
        assert!(record.compare_and_set_latest(0, 1)?);
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> CResult<()> {
        let (_dir, mut record) = setup(8)?;
        record.close()?;
        record.close()?;
        assert!(record.latest().is_err());
        assert!(record.compare_and_set_latest(0, 1).is_err());
        Ok(())
    }
}
