use crate::address::ShareAddress;
use crate::crypto::default_crypto;
use crate::doc::Doc;
use crate::error::{Error, Result};
use crate::query::Query;
use std::io::Read;

/// Persists the document records of one share.
///
/// A driver is owned by exactly one [`Replica`](crate::Replica); every
/// operation after [`close`](DocDriver::close) fails with
/// [`Error::ReplicaClosed`]. Implementations are free to push query
/// execution into their storage engine or to scan and delegate to
/// [`crate::query::execute`].
pub trait DocDriver: Send {
    /// The share this driver stores.
    fn share(&self) -> &ShareAddress;

    /// Whether [`close`](DocDriver::close) has run.
    fn is_closed(&self) -> bool;

    /// Closes the driver; with `erase`, removes everything it persisted.
    /// A second close is an error.
    fn close(&mut self, erase: bool) -> Result<()>;

    /// Reads a config value.
    fn get_config(&self, key: &str) -> Result<Option<String>>;

    /// Writes a config value.
    fn set_config(&mut self, key: &str, value: &str) -> Result<()>;

    /// Deletes a config value, reporting whether it existed.
    fn delete_config(&mut self, key: &str) -> Result<bool>;

    /// Lists config keys, sorted.
    fn config_keys(&self) -> Result<Vec<String>>;

    /// The highest `_localIndex` ever assigned, or −1 when empty.
    fn max_local_index(&self) -> Result<i64>;

    /// Runs a query. Documents expired at `now` are never returned.
    fn query_docs(&self, query: &Query, now: u64) -> Result<Vec<Doc>>;

    /// Stores `doc` under a freshly assigned `_localIndex`, replacing any
    /// previous row with the same path, author, and format. Returns the
    /// stored document.
    fn upsert(&mut self, doc: Doc) -> Result<Doc>;

    /// Atomically removes every document with `deleteAfter < now`,
    /// returning the removed set.
    fn erase_expired_docs(&mut self, now: u64) -> Result<Vec<Doc>>;
}

/// A staged attachment: bytes consumed, hashed, and parked, but not yet
/// visible. Hand it back to the driver's `commit` or `reject`.
#[derive(Debug)]
pub struct StagedAttachment {
    format: String,
    hash: String,
    size: u64,
    token: u64,
}

impl StagedAttachment {
    /// Builds a handle; only drivers have a reason to call this.
    pub fn new(format: String, hash: String, size: u64, token: u64) -> Self {
        Self {
            format,
            hash,
            size,
            token,
        }
    }

    /// The format tag the bytes were staged under.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// The verified base32 SHA-256 of the staged bytes.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The number of bytes staged.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The driver-private staging slot.
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Persists opaque attachment bytes keyed by `(format, hash)`.
pub trait AttachmentDriver: Send {
    /// Whether [`close`](AttachmentDriver::close) has run.
    fn is_closed(&self) -> bool;

    /// Closes the driver; with `erase`, removes all stored bytes.
    /// A second close is an error.
    fn close(&mut self, erase: bool) -> Result<()>;

    /// Consumes `source`, hashing incrementally. If the digest differs from
    /// `expected_hash` nothing is kept and a validation error is returned;
    /// otherwise the bytes are parked invisibly until `commit`.
    fn stage(
        &mut self,
        format: &str,
        expected_hash: &str,
        source: &mut dyn Read,
    ) -> Result<StagedAttachment>;

    /// Atomically makes staged bytes addressable under their key.
    fn commit(&mut self, staged: StagedAttachment) -> Result<()>;

    /// Discards staged bytes.
    fn reject(&mut self, staged: StagedAttachment) -> Result<()>;

    /// The bytes stored under `(format, hash)`, as a fresh reader.
    fn attachment(&self, format: &str, hash: &str) -> Result<Option<Box<dyn Read + Send>>>;

    /// Removes one attachment, reporting whether it existed.
    fn erase_attachment(&mut self, format: &str, hash: &str) -> Result<bool>;

    /// Removes every attachment whose `(format, hash)` is not in
    /// `allow`, returning the erased keys. The garbage-collection
    /// primitive: the caller supplies the document driver's ground truth.
    fn filter(&mut self, allow: &[(String, String)]) -> Result<Vec<(String, String)>>;

    /// Removes everything, staged and committed. Used at replica erase.
    fn clear_all(&mut self) -> Result<()>;
}

/// Reads `source` to the end, hashing incrementally, and checks the digest
/// against `expected_hash`. Shared by the shipped drivers.
pub(crate) fn read_verified(
    expected_hash: &str,
    source: &mut dyn Read,
) -> Result<(Vec<u8>, u64)> {
    let crypto = default_crypto();
    let mut hasher = crypto.updatable_sha256();
    let mut bytes = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes.extend_from_slice(&buf[..n]);
    }
    let actual = crate::base32::encode(&hasher.finish());
    if actual != expected_hash {
        return Err(Error::validation(format!(
            "attachment bytes hash to {} but the document declares {}",
            actual, expected_hash
        )));
    }
    let size = bytes.len() as u64;
    Ok((bytes, size))
}
