use serde_derive::{Deserialize, Serialize};

/// Result returning a snapkv Error.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store. Read paths absorb these and log them,
/// write and constructor paths propagate them to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An invalid store or database configuration.
    Config(String),
    /// A filesystem failure: create, write, fsync, rename, delete or mmap.
    Io(String),
    /// An advisory byte-range lock failed with an unexpected error. A held
    /// lock is not an error, it is reported as a compare-and-set miss.
    Lock(String),
    /// Every version slot of the database has been used.
    CapacityExhausted(String),
    /// An error raised by the embedded engine, wrapped opaquely.
    Engine(String),
    /// Malformed bytes were handed to a codec.
    Encoding(String),
    /// An invalid argument, i.e. a programming error in the caller.
    Argument(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Io(msg) => write!(f, "io failure: {}", msg),
            Error::Lock(msg) => write!(f, "lock failure: {}", msg),
            Error::CapacityExhausted(msg) => write!(f, "version capacity exhausted: {}", msg),
            Error::Engine(msg) => write!(f, "engine failure: {}", msg),
            Error::Encoding(msg) => write!(f, "encoding failure: {}", msg),
            Error::Argument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<fs_extra::error::Error> for Error {
    fn from(err: fs_extra::error::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Engine(err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Engine(err.to_string())
    }
}
