use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::version::DEFAULT_SLOTS;

/// Per-database tuning, forwarded by the store to every database it opens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbOptions {
    /// Record capacity of the version file, i.e. how many versions the
    /// database may ever publish. Out-of-range values fall back to 64.
    pub version_slots: i32,

    /// Bound on concurrently open snapshot handles per database.
    pub max_open_handles: u64,

    /// Minutes a cached snapshot handle may sit idle before it is closed.
    pub handle_idle_minutes: u64,

    /// Minutes a non-current version may go unread before clear() deletes
    /// it. Raised to five times the handle idle timeout when configured
    /// below it.
    pub clear_timeout_minutes: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            version_slots: DEFAULT_SLOTS,
            max_open_handles: 10,
            handle_idle_minutes: 30,
            clear_timeout_minutes: 24 * 60,
        }
    }
}

impl DbOptions {
    pub fn validate(&self) -> CResult<()> {
        if self.max_open_handles == 0 {
            return Err(Error::Config("max_open_handles must be positive".to_string()));
        }
        if self.handle_idle_minutes == 0 {
            return Err(Error::Config("handle_idle_minutes must be positive".to_string()));
        }
        if self.clear_timeout_minutes == 0 {
            return Err(Error::Config("clear_timeout_minutes must be positive".to_string()));
        }
        Ok(())
    }

    pub(crate) fn handle_idle(&self) -> Duration {
        Duration::from_secs(self.handle_idle_minutes * 60)
    }

    /// The effective reclamation window, never shorter than the handle idle
    /// timeout so a cached handle cannot outlive its version directory.
    pub(crate) fn clear_window_ms(&self) -> i64 {
        let minutes = if self.clear_timeout_minutes < self.handle_idle_minutes {
            self.handle_idle_minutes * 5
        } else {
            self.clear_timeout_minutes
        };
        minutes as i64 * 60 * 1000
    }
}

/// Store-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Root directory hosting one subdirectory per logical database.
    /// Created if missing.
    pub data_dir: PathBuf,

    /// Bound on concurrently open databases.
    pub max_open_dbs: u64,

    /// Minutes a database may sit idle before it is closed and evicted.
    pub db_idle_minutes: u64,

    /// Ceiling on the total size of data_dir, in gigabytes. Crossing it
    /// triggers reclamation across all databases.
    pub max_disk_usage_gb: u64,

    /// Minutes before the first maintenance run.
    pub clean_delay_minutes: u64,

    /// Minutes between maintenance runs.
    pub clean_period_minutes: u64,

    /// Per-database knobs.
    pub db: DbOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            data_dir: PathBuf::from("data"),
            max_open_dbs: 300,
            db_idle_minutes: 60,
            max_disk_usage_gb: 50,
            clean_delay_minutes: 5,
            clean_period_minutes: 30,
            db: DbOptions::default(),
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> CResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir must not be empty".to_string()));
        }
        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(Error::Config(format!("data_dir {:?} is not a directory", self.data_dir)));
        }
        if self.max_open_dbs == 0 {
            return Err(Error::Config("max_open_dbs must be positive".to_string()));
        }
        if self.db_idle_minutes == 0 {
            return Err(Error::Config("db_idle_minutes must be positive".to_string()));
        }
        if self.max_disk_usage_gb == 0 {
            return Err(Error::Config("max_disk_usage_gb must be positive".to_string()));
        }
        if self.clean_period_minutes == 0 {
            return Err(Error::Config("clean_period_minutes must be positive".to_string()));
        }
        self.db.validate()
    }

    pub(crate) fn db_idle(&self) -> Duration {
        Duration::from_secs(self.db_idle_minutes * 60)
    }

    pub(crate) fn clean_delay(&self) -> Duration {
        Duration::from_secs(self.clean_delay_minutes * 60)
    }

    pub(crate) fn clean_period(&self) -> Duration {
        Duration::from_secs(self.clean_period_minutes * 60)
    }

    pub(crate) fn quota_bytes(&self) -> u64 {
        self.max_disk_usage_gb << 30
    }
}
