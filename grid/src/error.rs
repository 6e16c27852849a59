use serde_derive::{Deserialize, Serialize};

/// Crate-wide result type, returned by all fallible grid operations.
pub type CResult<T> = Result<T, Error>;

/// Grid errors. Errors are passed to the caller synchronously; the entry
/// never retries by itself except for the optimistic version-retry loops
/// documented on `clear`, `invalidate` and `compact`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The removed signal: the entry is obsolete and pending removal from
    /// the owning map. Callers re-fetch a fresh entry and retry.
    EntryRemoved,

    /// An index (query manager) update failed. Fatal to the current
    /// operation; the entry state is left as it was before the operation.
    Index(String),

    /// The persistent store failed. Transactional operations surface this
    /// to the caller so the transaction can roll back.
    Store(String),

    /// Marshaling or off-heap codec failure. The previous value is never
    /// partially overwritten when this is raised from `set_value`.
    Codec(String),

    /// An invalid value or argument.
    Value(String),

    /// An I/O error, e.g. from the swap device.
    Io(String),

    /// An internal error. These represent invariant violations or poisoned
    /// locks and are not expected during normal operation.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::EntryRemoved => write!(f, "entry is obsolete"),
            Error::Index(msg) => write!(f, "index failure: {}", msg),
            Error::Store(msg) => write!(f, "store failure: {}", msg),
            Error::Codec(msg) => write!(f, "codec failure: {}", msg),
            Error::Value(msg) => write!(f, "invalid value: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
