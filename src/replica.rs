use crate::address::{AuthorAddress, AuthorKeypair, ShareAddress};
use crate::base32;
use crate::doc::{cmp_newest_first, is_obsolete, Doc};
use crate::driver::{AttachmentDriver, DocDriver};
use crate::error::{Error, Result};
use crate::events::{EventChannel, EventFanout, EventSubscription, IngestKind, ReplicaEvent};
use crate::format::{crypto_snapshot, default_format, format_by_id, DocInput, Format};
use crate::memory::{MemoryAttachmentDriver, MemoryDocDriver};
use crate::path::Path;
use crate::query::{HistoryMode, Query, QueryFilter};
use crate::util::now_microseconds;
use std::io::Read;
use tracing::{debug, info};

/// Attachment bytes handed to [`Replica::set`]: already in memory, or a
/// stream to be consumed once.
pub enum AttachmentSource {
    /// The whole attachment, in memory.
    Bytes(Vec<u8>),
    /// A one-shot byte stream.
    Stream(Box<dyn Read + Send>),
}

impl From<Vec<u8>> for AttachmentSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for AttachmentSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// Caller-supplied ingredients for [`Replica::set`].
#[derive(Default)]
pub struct SetInput {
    /// Where the document lives in the share.
    pub path: String,
    /// Inline text content.
    pub text: String,
    /// Microsecond timestamp. When absent the replica picks
    /// `max(now, newest-at-path + 1)` so the write wins its path.
    pub timestamp: Option<u64>,
    /// Expiry deadline; required on `!` paths, forbidden elsewhere.
    pub delete_after: Option<u64>,
    /// Attachment bytes to ingest together with the document.
    pub attachment: Option<AttachmentSource>,
}

/// What became of a document handed to [`Replica::ingest`].
#[derive(Clone, Debug)]
pub enum IngestOutcome {
    /// The document was stored.
    Ingested {
        /// The document as stored, `_localIndex` assigned.
        doc: Doc,
        /// Whether it is now the latest document at its path.
        latest: bool,
    },
    /// A newer-or-equal document from the same author already holds the
    /// path; nothing was stored.
    Obsolete,
}

/// The local, authoritative store of one share's documents and attachments.
///
/// A replica owns its two drivers exclusively. It validates and ingests
/// documents, assigns the local-index sequence the synchronizer pages by,
/// sweeps expired ephemeral documents, garbage-collects unreferenced
/// attachments, and announces every state change on a typed event stream.
pub struct Replica {
    share: ShareAddress,
    docs: Box<dyn DocDriver>,
    attachments: Box<dyn AttachmentDriver>,
    events: EventFanout,
    next_expiry: Option<u64>,
    closed: bool,
}

impl Replica {
    /// Opens a replica over a pair of drivers.
    ///
    /// Runs the recovery work that keeps the two stores consistent after a
    /// crash: sweeps documents that expired while the replica was away and
    /// erases attachment bytes no stored document references.
    pub fn open(docs: Box<dyn DocDriver>, attachments: Box<dyn AttachmentDriver>) -> Result<Self> {
        let share = docs.share().clone();
        let mut replica = Self {
            share,
            docs,
            attachments,
            events: EventFanout::new(),
            next_expiry: None,
            closed: false,
        };
        let now = now_microseconds();
        replica.sweep(now)?;
        replica.prune_attachments(now)?;
        info!(share = %replica.share, "opened replica");
        Ok(replica)
    }

    /// Opens a replica that keeps everything in memory.
    pub fn memory(share: ShareAddress) -> Result<Self> {
        Self::open(
            Box::new(MemoryDocDriver::new(share)),
            Box::new(MemoryAttachmentDriver::new()),
        )
    }

    /// The share this replica stores.
    pub fn share(&self) -> &ShareAddress {
        &self.share
    }

    /// Whether [`close`](Replica::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ReplicaClosed)
        } else {
            Ok(())
        }
    }

    fn all_query() -> Query {
        Query {
            history: HistoryMode::All,
            ..Default::default()
        }
    }

    fn path_query(path: &Path) -> Query {
        Query {
            history: HistoryMode::All,
            filter: Some(QueryFilter {
                path: Some(path.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Remembers the earliest pending expiry so a later call can sweep.
    fn note_deadline(&mut self, doc: &Doc) {
        if let Some(deadline) = doc.delete_after {
            self.next_expiry = Some(self.next_expiry.map_or(deadline, |e| e.min(deadline)));
        }
    }

    fn sweep_if_due(&mut self, now: u64) -> Result<()> {
        match self.next_expiry {
            Some(deadline) if deadline < now => self.sweep(now),
            _ => Ok(()),
        }
    }

    fn sweep(&mut self, now: u64) -> Result<()> {
        for doc in self.docs.erase_expired_docs(now)? {
            debug!(path = %doc.path, "erased expired document");
            self.events.emit(ReplicaEvent::Expire { doc });
        }
        let all = self.docs.query_docs(&Self::all_query(), now)?;
        self.next_expiry = all.iter().filter_map(|doc| doc.delete_after).min();
        Ok(())
    }

    fn prune_attachments(&mut self, now: u64) -> Result<()> {
        let all = self.docs.query_docs(&Self::all_query(), now)?;
        let allow: Vec<(String, String)> = all
            .iter()
            .filter_map(|doc| {
                doc.declared_attachment()
                    .map(|info| (doc.format.clone(), info.hash))
            })
            .collect();
        for (format, hash) in self.attachments.filter(&allow)? {
            debug!(%format, %hash, "pruned unreferenced attachment");
            self.events.emit(ReplicaEvent::AttachmentPrune { format, hash });
        }
        Ok(())
    }

    /// Signs and ingests a new document, and its attachment when the input
    /// carries one. Byte-identical attachments already present are not
    /// stored twice.
    pub fn set(&mut self, keypair: &AuthorKeypair, input: SetInput) -> Result<IngestOutcome> {
        self.set_with_format(keypair, input, default_format())
    }

    /// [`set`](Replica::set) with an explicit format.
    pub fn set_with_format(
        &mut self,
        keypair: &AuthorKeypair,
        input: SetInput,
        format: &dyn Format,
    ) -> Result<IngestOutcome> {
        self.ensure_open()?;
        let now = now_microseconds();
        self.sweep_if_due(now)?;

        let timestamp = match input.timestamp {
            Some(timestamp) => timestamp,
            None => {
                // Win the path: one past the newest existing doc, or now,
                // whichever is later.
                let path = Path::parse(&input.path)?;
                let at_path = self.docs.query_docs(&Self::path_query(&path), now)?;
                let newest = at_path.iter().map(|doc| doc.timestamp).max().unwrap_or(0);
                now.max(newest + 1)
            }
        };
        let mut doc = format.generate_document(
            keypair,
            &self.share,
            DocInput {
                path: input.path,
                text: input.text,
                timestamp: Some(timestamp),
                delete_after: input.delete_after,
            },
            now,
        )?;

        let attachment_bytes = match input.attachment {
            None => None,
            Some(source) => {
                let crypto = crypto_snapshot();
                let bytes = match source {
                    AttachmentSource::Bytes(bytes) => bytes,
                    AttachmentSource::Stream(mut stream) => {
                        let mut bytes = Vec::new();
                        stream.read_to_end(&mut bytes)?;
                        bytes
                    }
                };
                let hash = base32::encode(&crypto.sha256(&bytes));
                doc = format.update_attachment_fields(keypair, doc, bytes.len() as u64, hash)?;
                Some(bytes)
            }
        };

        let outcome = self.ingest(format, doc, "local")?;
        if let Some(bytes) = attachment_bytes {
            if let IngestOutcome::Ingested { doc, .. } = &outcome {
                let doc = doc.clone();
                self.ingest_attachment(format, &doc, &mut bytes.as_slice(), "local")?;
            }
        }
        Ok(outcome)
    }

    /// Validates and stores a document, local or from a peer.
    ///
    /// Validation failures are announced as failure events and returned as
    /// errors; nothing is partially persisted. A document older than what
    /// the same author already has at the path is a no-op, not an error.
    pub fn ingest(
        &mut self,
        format: &dyn Format,
        doc: Doc,
        source: &str,
    ) -> Result<IngestOutcome> {
        self.ensure_open()?;
        let now = now_microseconds();
        self.sweep_if_due(now)?;

        let checked = format.check_document_is_valid(&doc, now).and_then(|()| {
            if doc.share == self.share {
                Ok(())
            } else {
                Err(Error::validation(format!(
                    "document belongs to {}, not {}",
                    doc.share, self.share
                )))
            }
        });
        if let Err(err) = checked {
            debug!(path = %doc.path, %err, "rejected document");
            self.events.emit(ReplicaEvent::Ingest {
                doc,
                kind: IngestKind::Failure {
                    reason: err.to_string(),
                },
                source: source.to_string(),
            });
            return Err(err);
        }

        let at_path = self.docs.query_docs(&Self::path_query(&doc.path), now)?;
        let existing = at_path
            .iter()
            .find(|d| d.author == doc.author && d.format == doc.format);
        if matches!(existing, Some(existing) if is_obsolete(&doc, existing)) {
            self.events.emit(ReplicaEvent::Ingest {
                doc,
                kind: IngestKind::Nothing {
                    reason: "obsolete_from_same_author".to_string(),
                },
                source: source.to_string(),
            });
            return Ok(IngestOutcome::Obsolete);
        }

        let stored = self.docs.upsert(doc)?;
        self.note_deadline(&stored);

        let at_path = self.docs.query_docs(&Self::path_query(&stored.path), now)?;
        let latest = at_path
            .iter()
            .min_by(|a, b| cmp_newest_first(a, b))
            .map(|winner| winner.author == stored.author && winner.signature == stored.signature)
            .unwrap_or(true);

        debug!(path = %stored.path, index = ?stored.local_index, latest, "ingested document");
        self.events.emit(ReplicaEvent::Ingest {
            doc: stored.clone(),
            kind: if latest {
                IngestKind::Success
            } else {
                IngestKind::SuccessButNotLatest
            },
            source: source.to_string(),
        });
        Ok(IngestOutcome::Ingested {
            doc: stored,
            latest,
        })
    }

    /// Streams attachment bytes for a stored document through staging into
    /// the attachment store.
    ///
    /// Returns `false`, with no side effects, when the bytes are already
    /// present. Hash or size mismatches against the document's declaration
    /// discard the staged bytes and return a validation error.
    pub fn ingest_attachment(
        &mut self,
        format: &dyn Format,
        doc: &Doc,
        source: &mut dyn Read,
        source_tag: &str,
    ) -> Result<bool> {
        self.ensure_open()?;
        let now = now_microseconds();
        format.check_document_is_valid(doc, now)?;
        let info = format
            .attachment_info(doc)?
            .ok_or_else(|| Error::validation("document declares no attachment"))?;

        if self.attachments.attachment(&doc.format, &info.hash)?.is_some() {
            return Ok(false);
        }
        let staged = self.attachments.stage(&doc.format, &info.hash, source)?;
        if staged.size() != info.size {
            let size = staged.size();
            self.attachments.reject(staged)?;
            return Err(Error::validation(format!(
                "attachment is {} bytes but the document declares {}",
                size, info.size
            )));
        }
        self.attachments.commit(staged)?;
        debug!(path = %doc.path, hash = %info.hash, "ingested attachment");
        self.events.emit(ReplicaEvent::AttachmentIngest {
            format: doc.format.clone(),
            hash: info.hash,
            size: info.size,
            source: source_tag.to_string(),
        });
        Ok(true)
    }

    /// The attachment bytes a document declares, as a fresh reader.
    ///
    /// `Ok(None)` means declared but not (yet) present. A document of a
    /// format without attachment support is an error.
    pub fn attachment(&mut self, doc: &Doc) -> Result<Option<Box<dyn Read + Send>>> {
        self.ensure_open()?;
        let format = format_by_id(&doc.format)
            .ok_or_else(|| Error::validation(format!("unknown format {}", doc.format)))?;
        let info = format
            .attachment_info(doc)?
            .ok_or_else(|| Error::validation("document declares no attachment"))?;
        self.attachments.attachment(&doc.format, &info.hash)
    }

    /// [`attachment`](Replica::attachment), read to the end.
    pub fn attachment_bytes(&mut self, doc: &Doc) -> Result<Option<Vec<u8>>> {
        match self.attachment(doc)? {
            Some(mut read) => {
                let mut bytes = Vec::new();
                read.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Runs a query.
    pub fn query_docs(&mut self, query: &Query) -> Result<Vec<Doc>> {
        self.ensure_open()?;
        let now = now_microseconds();
        self.sweep_if_due(now)?;
        self.docs.query_docs(query, now)
    }

    /// Every retained document: one per (path, author).
    pub fn all_docs(&mut self) -> Result<Vec<Doc>> {
        self.query_docs(&Self::all_query())
    }

    /// The winning document of every path.
    pub fn latest_docs(&mut self) -> Result<Vec<Doc>> {
        self.query_docs(&Query::default())
    }

    /// The retained history of one path, newest first.
    pub fn all_docs_at_path(&mut self, path: &Path) -> Result<Vec<Doc>> {
        self.query_docs(&Self::path_query(path))
    }

    /// The winning document of one path.
    pub fn latest_doc_at_path(&mut self, path: &Path) -> Result<Option<Doc>> {
        let mut docs = self.query_docs(&Query {
            filter: Some(QueryFilter {
                path: Some(path.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })?;
        Ok(docs.pop())
    }

    /// The distinct authors among the documents a query returns, sorted.
    pub fn query_authors(&mut self, query: &Query) -> Result<Vec<AuthorAddress>> {
        let mut authors: Vec<AuthorAddress> = self
            .query_docs(query)?
            .into_iter()
            .map(|doc| doc.author)
            .collect();
        authors.sort();
        authors.dedup();
        Ok(authors)
    }

    /// The distinct paths among the documents a query returns, sorted.
    pub fn query_paths(&mut self, query: &Query) -> Result<Vec<Path>> {
        let mut paths: Vec<Path> = self
            .query_docs(query)?
            .into_iter()
            .map(|doc| doc.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// The highest `_localIndex` assigned so far, or −1 when empty. The
    /// synchronizer pages with "everything after N".
    pub fn max_local_index(&self) -> Result<i64> {
        self.ensure_open()?;
        self.docs.max_local_index()
    }

    /// Wipes every document `keypair` has in `format`, returning how many
    /// were overwritten. A wipe that cannot be signed (timestamp already at
    /// its ceiling) propagates its error rather than being dropped.
    pub fn overwrite_all_docs_by_author(
        &mut self,
        keypair: &AuthorKeypair,
        format: &dyn Format,
    ) -> Result<usize> {
        self.ensure_open()?;
        let docs = self.query_docs(&Query {
            history: HistoryMode::All,
            filter: Some(QueryFilter {
                author: Some(keypair.address.clone()),
                ..Default::default()
            }),
            formats: Some(vec![format.id().to_string()]),
            ..Default::default()
        })?;
        let mut count = 0;
        for doc in docs {
            let wiped = format.wipe_document(keypair, &doc)?;
            if let IngestOutcome::Ingested { .. } = self.ingest(format, wiped, "local")? {
                count += 1;
            }
        }
        info!(author = %keypair.address, count, "overwrote all docs by author");
        Ok(count)
    }

    /// Replaces `keypair`'s document at `path` with an empty one and erases
    /// its attachment if nothing else references it.
    pub fn wipe_doc_at_path(&mut self, keypair: &AuthorKeypair, path: &Path) -> Result<Doc> {
        self.ensure_open()?;
        let doc = self
            .all_docs_at_path(path)?
            .into_iter()
            .find(|doc| doc.author == keypair.address)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no document at {}", keypair.address, path))
            })?;
        let format = format_by_id(&doc.format)
            .ok_or_else(|| Error::validation(format!("unknown format {}", doc.format)))?;
        let orphaned = doc.declared_attachment();

        let wiped = format.wipe_document(keypair, &doc)?;
        let stored = match self.ingest(format, wiped, "local")? {
            IngestOutcome::Ingested { doc, .. } => doc,
            IngestOutcome::Obsolete => {
                return Err(Error::validation("wipe lost against a newer document"))
            }
        };

        if let Some(info) = orphaned {
            let still_referenced = self.all_docs()?.iter().any(|d| {
                d.format == doc.format && d.attachment_hash.as_deref() == Some(info.hash.as_str())
            });
            if !still_referenced && self.attachments.erase_attachment(&doc.format, &info.hash)? {
                self.events.emit(ReplicaEvent::AttachmentPrune {
                    format: doc.format.clone(),
                    hash: info.hash,
                });
            }
        }
        Ok(stored)
    }

    /// Reads a config value from the document driver's KV store.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        self.docs.get_config(key)
    }

    /// Writes a config value.
    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.docs.set_config(key, value)
    }

    /// Deletes a config value, reporting whether it existed.
    pub fn delete_config(&mut self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        self.docs.delete_config(key)
    }

    /// Lists config keys, sorted.
    pub fn config_keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.docs.config_keys()
    }

    /// Subscribes to the replica's events with an unbounded buffer;
    /// `channel` restricts which events arrive. Dropping the subscription
    /// unsubscribes.
    pub fn subscribe(&self, channel: Option<EventChannel>) -> EventSubscription {
        self.events.subscribe(channel)
    }

    /// [`subscribe`](Replica::subscribe) with a bounded buffer: at most
    /// `capacity` events wait; further ones are dropped until the
    /// subscriber catches up.
    pub fn subscribe_bounded(
        &self,
        channel: Option<EventChannel>,
        capacity: usize,
    ) -> EventSubscription {
        self.events.subscribe_bounded(channel, capacity)
    }

    /// Closes the replica and both drivers; with `erase`, their stored
    /// state is removed first. Every later operation fails with
    /// [`Error::ReplicaClosed`].
    pub fn close(&mut self, erase: bool) -> Result<()> {
        if self.closed {
            return Err(Error::ReplicaClosed);
        }
        self.events.emit(ReplicaEvent::WillClose);
        self.docs.close(erase)?;
        self.attachments.close(erase)?;
        self.closed = true;
        self.events.emit(ReplicaEvent::DidClose);
        info!(share = %self.share, erase, "closed replica");
        Ok(())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("share", &self.share)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
