use crate::address::ShareAddress;
use crate::doc::Doc;
use crate::driver::{read_verified, AttachmentDriver, DocDriver, StagedAttachment};
use crate::error::{Error, Result};
use crate::query::{self, Query};
use std::io::{Cursor, Read};

const SHARE_KEY: &str = "share";
const SCHEMA_VERSION_KEY: &str = "schemaVersion";
const SCHEMA_VERSION: &str = "2";
const MAX_LOCAL_INDEX_KEY: &[u8] = b"maxLocalIndex";

/// A sled-backed [`DocDriver`].
///
/// Layout: a `docs` tree keyed by `path \0 author \0 format` holding the
/// JSON document, a `config` tree for the string KV, and a `doc_meta` tree
/// for the local-index counter.
pub struct SledDocDriver {
    share: ShareAddress,
    docs: sled::Tree,
    config: sled::Tree,
    meta: sled::Tree,
    closed: bool,
}

fn doc_key(doc: &Doc) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        doc.path.as_str().len() + doc.author.as_str().len() + doc.format.len() + 2,
    );
    key.extend_from_slice(doc.path.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(doc.author.as_str().as_bytes());
    key.push(0);
    key.extend_from_slice(doc.format.as_bytes());
    key
}

impl SledDocDriver {
    /// Opens (or creates) the document store for `share` inside `db`.
    ///
    /// A database that already persists a different share is refused: a
    /// replica must never mix two shares' documents.
    pub fn open(db: &sled::Db, share: &ShareAddress) -> Result<Self> {
        let docs = db.open_tree("docs")?;
        let config = db.open_tree("config")?;
        let meta = db.open_tree("doc_meta")?;
        match config.get(SHARE_KEY)? {
            Some(stored) => {
                let stored = String::from_utf8_lossy(&stored).to_string();
                if stored != share.as_str() {
                    return Err(Error::validation(format!(
                        "store belongs to {}, not {}",
                        stored, share
                    )));
                }
            }
            None => {
                config.insert(SHARE_KEY, share.as_str())?;
                config.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
            }
        }
        Ok(Self {
            share: share.clone(),
            docs,
            config,
            meta,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ReplicaClosed)
        } else {
            Ok(())
        }
    }

    fn all_docs(&self) -> Result<Vec<Doc>> {
        let mut out = Vec::new();
        for entry in self.docs.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

impl DocDriver for SledDocDriver {
    fn share(&self) -> &ShareAddress {
        &self.share
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self, erase: bool) -> Result<()> {
        self.ensure_open()?;
        if erase {
            self.docs.clear()?;
            self.config.clear()?;
            self.meta.clear()?;
        }
        self.docs.flush()?;
        self.closed = true;
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .config
            .get(key)?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.config.insert(key, value)?;
        Ok(())
    }

    fn delete_config(&mut self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.config.remove(key)?.is_some())
    }

    fn config_keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut keys = Vec::new();
        for entry in self.config.iter() {
            let (key, _) = entry?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }

    fn max_local_index(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(match self.meta.get(MAX_LOCAL_INDEX_KEY)? {
            Some(bytes) => i64::from_be_bytes(
                bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt local index counter".into()))?,
            ),
            None => -1,
        })
    }

    fn query_docs(&self, query: &Query, now: u64) -> Result<Vec<Doc>> {
        self.ensure_open()?;
        Ok(query::execute(query, self.all_docs()?, now))
    }

    fn upsert(&mut self, mut doc: Doc) -> Result<Doc> {
        self.ensure_open()?;
        let next = self.max_local_index()? + 1;
        doc.local_index = Some(next as u64);
        self.docs.insert(doc_key(&doc), serde_json::to_vec(&doc)?)?;
        self.meta
            .insert(MAX_LOCAL_INDEX_KEY, &next.to_be_bytes()[..])?;
        Ok(doc)
    }

    fn erase_expired_docs(&mut self, now: u64) -> Result<Vec<Doc>> {
        self.ensure_open()?;
        let mut removed = Vec::new();
        for entry in self.docs.iter() {
            let (key, value) = entry?;
            let doc: Doc = serde_json::from_slice(&value)?;
            if doc.is_expired(now) {
                self.docs.remove(key)?;
                removed.push(doc);
            }
        }
        Ok(removed)
    }
}

/// A sled-backed [`AttachmentDriver`].
///
/// Committed bytes live in an `attachments` tree keyed by
/// `format \0 hash`; staged bytes live in a `staging` tree keyed by a
/// counter and are discarded on the next open, which is what makes a
/// mid-stream crash safe.
pub struct SledAttachmentDriver {
    attachments: sled::Tree,
    staging: sled::Tree,
    next_token: u64,
    closed: bool,
}

fn attachment_key(format: &str, hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(format.len() + hash.len() + 1);
    key.extend_from_slice(format.as_bytes());
    key.push(0);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn split_attachment_key(key: &[u8]) -> Option<(String, String)> {
    let sep = key.iter().position(|b| *b == 0)?;
    Some((
        String::from_utf8_lossy(&key[..sep]).to_string(),
        String::from_utf8_lossy(&key[sep + 1..]).to_string(),
    ))
}

impl SledAttachmentDriver {
    /// Opens (or creates) the attachment store inside `db`, discarding any
    /// bytes a previous process staged but never committed.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let attachments = db.open_tree("attachments")?;
        let staging = db.open_tree("staging")?;
        staging.clear()?;
        Ok(Self {
            attachments,
            staging,
            next_token: 0,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ReplicaClosed)
        } else {
            Ok(())
        }
    }
}

impl AttachmentDriver for SledAttachmentDriver {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self, erase: bool) -> Result<()> {
        self.ensure_open()?;
        if erase {
            self.attachments.clear()?;
        }
        self.staging.clear()?;
        self.attachments.flush()?;
        self.closed = true;
        Ok(())
    }

    fn stage(
        &mut self,
        format: &str,
        expected_hash: &str,
        source: &mut dyn Read,
    ) -> Result<StagedAttachment> {
        self.ensure_open()?;
        let (bytes, size) = read_verified(expected_hash, source)?;
        let token = self.next_token;
        self.next_token += 1;
        self.staging.insert(token.to_be_bytes(), bytes)?;
        Ok(StagedAttachment::new(
            format.to_string(),
            expected_hash.to_string(),
            size,
            token,
        ))
    }

    fn commit(&mut self, staged: StagedAttachment) -> Result<()> {
        self.ensure_open()?;
        let bytes = self
            .staging
            .remove(staged.token().to_be_bytes())?
            .ok_or_else(|| Error::NotFound("staged attachment".to_string()))?;
        self.attachments
            .insert(attachment_key(staged.format(), staged.hash()), bytes)?;
        Ok(())
    }

    fn reject(&mut self, staged: StagedAttachment) -> Result<()> {
        self.ensure_open()?;
        self.staging.remove(staged.token().to_be_bytes())?;
        Ok(())
    }

    fn attachment(&self, format: &str, hash: &str) -> Result<Option<Box<dyn Read + Send>>> {
        self.ensure_open()?;
        Ok(self
            .attachments
            .get(attachment_key(format, hash))?
            .map(|bytes| Box::new(Cursor::new(bytes.to_vec())) as Box<dyn Read + Send>))
    }

    fn erase_attachment(&mut self, format: &str, hash: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.attachments.remove(attachment_key(format, hash))?.is_some())
    }

    fn filter(&mut self, allow: &[(String, String)]) -> Result<Vec<(String, String)>> {
        self.ensure_open()?;
        let mut erased = Vec::new();
        for entry in self.attachments.iter() {
            let (key, _) = entry?;
            let pair = match split_attachment_key(&key) {
                Some(pair) => pair,
                None => continue,
            };
            if !allow.contains(&pair) {
                self.attachments.remove(key)?;
                erased.push(pair);
            }
        }
        Ok(erased)
    }

    fn clear_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.attachments.clear()?;
        self.staging.clear()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AuthorKeypair, ShareKeypair};
    use crate::base32;
    use crate::crypto::default_crypto;
    use crate::format::{DocInput, EsFive, Format};
    use crate::query::HistoryMode;
    use crate::util::now_microseconds;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[test]
    fn persists_docs_and_counter_across_reopen() {
        let db = temp_db();
        let share = ShareKeypair::generate("testing").unwrap().address;
        let keypair = AuthorKeypair::generate("test").unwrap();
        let now = now_microseconds();

        let mut driver = SledDocDriver::open(&db, &share).unwrap();
        let doc = EsFive
            .generate_document(
                &keypair,
                &share,
                DocInput {
                    path: "/a".into(),
                    text: "persisted".into(),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        driver.upsert(doc).unwrap();
        driver.close(false).unwrap();

        let driver = SledDocDriver::open(&db, &share).unwrap();
        assert_eq!(driver.max_local_index().unwrap(), 0);
        let query = Query {
            history: HistoryMode::All,
            ..Default::default()
        };
        let docs = driver.query_docs(&query, now).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "persisted");
        assert_eq!(docs[0].local_index, Some(0));
    }

    #[test]
    fn refuses_a_store_from_another_share() {
        let db = temp_db();
        let ours = ShareKeypair::generate("ours").unwrap().address;
        let theirs = ShareKeypair::generate("theirs").unwrap().address;
        SledDocDriver::open(&db, &ours).unwrap();
        assert!(matches!(
            SledDocDriver::open(&db, &theirs),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn erase_clears_the_store() {
        let db = temp_db();
        let share = ShareKeypair::generate("testing").unwrap().address;
        let mut driver = SledDocDriver::open(&db, &share).unwrap();
        driver.set_config("hello", "world").unwrap();
        driver.close(true).unwrap();

        let driver = SledDocDriver::open(&db, &share).unwrap();
        assert_eq!(driver.get_config("hello").unwrap(), None);
        assert_eq!(driver.max_local_index().unwrap(), -1);
    }

    #[test]
    fn staged_bytes_do_not_survive_reopen() {
        let db = temp_db();
        let crypto = default_crypto();
        let hash = base32::encode(&crypto.sha256(b"orphan"));

        let mut driver = SledAttachmentDriver::open(&db).unwrap();
        // Staged but never committed, as if the process died here.
        driver.stage("es.5", &hash, &mut &b"orphan"[..]).unwrap();
        drop(driver);

        let driver = SledAttachmentDriver::open(&db).unwrap();
        assert_eq!(driver.staging.len(), 0);
        assert!(driver.attachment("es.5", &hash).unwrap().is_none());
    }

    #[test]
    fn commit_makes_bytes_visible_across_reopen() {
        let db = temp_db();
        let crypto = default_crypto();
        let hash = base32::encode(&crypto.sha256(b"Hi!"));

        let mut driver = SledAttachmentDriver::open(&db).unwrap();
        let staged = driver.stage("es.5", &hash, &mut &b"Hi!"[..]).unwrap();
        driver.commit(staged).unwrap();
        driver.close(false).unwrap();

        let driver = SledAttachmentDriver::open(&db).unwrap();
        let mut read = driver.attachment("es.5", &hash).unwrap().unwrap();
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"Hi!");
    }
}
