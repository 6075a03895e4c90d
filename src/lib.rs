//! # Offline-first, peer-to-peer document storage
//!
//! ## Shares and replicas
//! A *share* is a replication group named by an address like
//! `+gardening.b63a5eqlqd...`: a human-chosen name plus the base32 Ed25519
//! public key that makes the group unforgeable. Every participant runs a
//! [`Replica`], the authoritative local store of one share's documents and
//! attachments. Replicas never talk to each other directly; a separate
//! synchronizer moves documents between them and uses each replica's
//! local-index sequence to ask for "everything after N".
//!
//! ## Documents
//! A [`Doc`] is a signed record addressed by a [`Path`] within its share.
//! Writes never edit in place: a newer document from the same author
//! supersedes the older one at that path, while other authors' documents at
//! the path are retained as its history. The winner at a path is decided by
//! timestamp, with the signature breaking ties, so any two replicas that
//! hold the same documents agree on the winner without coordination.
//!
//! Paths can encode two behaviors. A path containing `~author-address` is
//! writable only by that author. A path containing `!` is ephemeral: its
//! documents must carry a `deleteAfter` deadline, stop appearing in queries
//! once the deadline passes, and are eventually erased by the expiry sweep.
//!
//! ## Formats
//! A [`Format`] bundles the schema and rule set documents are validated
//! against: canonical hashing, signing, wipe semantics, and attachment
//! metadata. Formats are stateless values. [`EsFour`] is the text-only
//! schema; [`EsFive`] adds content-addressed attachments. Validation runs
//! its cheap structural checks before the expensive cryptographic ones.
//!
//! ## Attachments
//! Attachment bytes are opaque and addressed by `(format, hash)`. They
//! travel separately from their documents: a document declaring an
//! attachment is *complete* only once bytes matching its declared hash and
//! size are present. Ingestion stages bytes through an incremental hash
//! check and commits them atomically, so a half-written attachment is never
//! visible; bytes no live document references are garbage-collected when a
//! replica opens.
//!
//! ## Drivers
//! A replica owns two storage back-ends behind the [`DocDriver`] and
//! [`AttachmentDriver`] contracts: an in-memory pair for tests and
//! ephemeral replicas, and a sled-backed pair for persistence. The
//! document driver also carries a small config KV (share address, schema
//! version) so a store can refuse to open under the wrong share.
//!
//! ## Events
//! Every state change is announced on a typed broadcast stream:
//! ingests (successful or not), attachment ingests and prunes, expiries,
//! and closing. Subscribers are `futures::Stream`s; each sees every event
//! after its subscription time, optionally restricted to one channel, with
//! a buffer bound of its choosing.
#![warn(missing_docs)]
mod address;
mod base32;
mod crypto;
mod disk;
mod doc;
mod driver;
mod error;
mod events;
mod format;
mod memory;
mod path;
#[cfg(test)]
mod props;
mod query;
mod replica;
mod util;

pub use crate::address::{AuthorAddress, AuthorKeypair, ShareAddress, ShareKeypair};
pub use crate::base32::{decode as base32_decode, encode as base32_encode};
pub use crate::crypto::{
    default_crypto, set_default_crypto, CryptoProvider, DalekCrypto, Keypair, UpdatableHash,
};
pub use crate::disk::{SledAttachmentDriver, SledDocDriver};
pub use crate::doc::{cmp_newest_first, AttachmentInfo, Doc};
pub use crate::driver::{AttachmentDriver, DocDriver, StagedAttachment};
pub use crate::error::{Error, Result};
pub use crate::events::{EventChannel, EventSubscription, IngestKind, ReplicaEvent};
pub use crate::format::{default_format, format_by_id, DocInput, EsFive, EsFour, Format};
pub use crate::memory::{MemoryAttachmentDriver, MemoryDocDriver};
pub use crate::path::Path;
pub use crate::query::{
    clean_up_query, doc_matches_filter, execute as execute_query, HistoryMode, OrderBy, Query,
    QueryFilter, WillMatch,
};
pub use crate::replica::{AttachmentSource, IngestOutcome, Replica, SetInput};
pub use crate::util::{now_microseconds, FUTURE_CUTOFF, MAX_TIMESTAMP, MIN_TIMESTAMP};
