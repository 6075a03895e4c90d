use thiserror::Error;

/// The error kinds reported by replicas, drivers, and formats.
///
/// Expected conditions (validation failures, missing attachments, obsolete
/// ingests) are returned as values through [`Result`]; nothing in this crate
/// panics for them.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A document, address, path, timestamp, signature, or query failed a
    /// well-formedness rule. Carries the failing rule in human-readable form.
    #[error("validation: {0}")]
    Validation(String),
    /// The replica or one of its drivers was closed before the call.
    #[error("replica is closed")]
    ReplicaClosed,
    /// A document or attachment was required but is not present.
    #[error("not found: {0}")]
    NotFound(String),
    /// The format does not implement the requested capability.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A storage back-end failed. Raw driver errors are wrapped, never
    /// surfaced directly.
    #[error("storage: {0}")]
    Storage(String),
    /// A transport or remote back-end failed.
    #[error("connection: {0}")]
    Connection(String),
    /// A driver or transport operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] with the given reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
