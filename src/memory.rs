use crate::address::ShareAddress;
use crate::doc::Doc;
use crate::driver::{read_verified, AttachmentDriver, DocDriver, StagedAttachment};
use crate::error::{Error, Result};
use crate::query::{self, Query};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

/// An in-memory [`DocDriver`]. Nothing survives the process; useful for
/// tests and deliberately ephemeral replicas.
pub struct MemoryDocDriver {
    share: ShareAddress,
    config: BTreeMap<String, String>,
    docs: BTreeMap<(String, String, String), Doc>,
    max_local_index: i64,
    closed: bool,
}

impl MemoryDocDriver {
    /// Creates an empty driver for `share`.
    pub fn new(share: ShareAddress) -> Self {
        let mut config = BTreeMap::new();
        config.insert("share".to_string(), share.to_string());
        config.insert("schemaVersion".to_string(), "2".to_string());
        Self {
            share,
            config,
            docs: BTreeMap::new(),
            max_local_index: -1,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ReplicaClosed)
        } else {
            Ok(())
        }
    }

    fn key(doc: &Doc) -> (String, String, String) {
        (
            doc.path.to_string(),
            doc.author.to_string(),
            doc.format.clone(),
        )
    }
}

impl DocDriver for MemoryDocDriver {
    fn share(&self) -> &ShareAddress {
        &self.share
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self, erase: bool) -> Result<()> {
        self.ensure_open()?;
        if erase {
            self.docs.clear();
            self.config.clear();
            self.max_local_index = -1;
        }
        self.closed = true;
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.config.get(key).cloned())
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_config(&mut self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.config.remove(key).is_some())
    }

    fn config_keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.config.keys().cloned().collect())
    }

    fn max_local_index(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.max_local_index)
    }

    fn query_docs(&self, query: &Query, now: u64) -> Result<Vec<Doc>> {
        self.ensure_open()?;
        Ok(query::execute(query, self.docs.values().cloned().collect(), now))
    }

    fn upsert(&mut self, mut doc: Doc) -> Result<Doc> {
        self.ensure_open()?;
        self.max_local_index += 1;
        doc.local_index = Some(self.max_local_index as u64);
        self.docs.insert(Self::key(&doc), doc.clone());
        Ok(doc)
    }

    fn erase_expired_docs(&mut self, now: u64) -> Result<Vec<Doc>> {
        self.ensure_open()?;
        let expired: Vec<(String, String, String)> = self
            .docs
            .iter()
            .filter(|(_, doc)| doc.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(doc) = self.docs.remove(&key) {
                removed.push(doc);
            }
        }
        Ok(removed)
    }
}

/// An in-memory [`AttachmentDriver`].
#[derive(Default)]
pub struct MemoryAttachmentDriver {
    committed: HashMap<(String, String), Vec<u8>>,
    staged: HashMap<u64, Vec<u8>>,
    next_token: u64,
    closed: bool,
}

impl MemoryAttachmentDriver {
    /// Creates an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ReplicaClosed)
        } else {
            Ok(())
        }
    }
}

impl AttachmentDriver for MemoryAttachmentDriver {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self, erase: bool) -> Result<()> {
        self.ensure_open()?;
        if erase {
            self.clear_all()?;
        }
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
        self.staged.insert(token, bytes);
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
            .staged
            .remove(&staged.token())
            .ok_or_else(|| Error::NotFound("staged attachment".to_string()))?;
        self.committed.insert(
            (staged.format().to_string(), staged.hash().to_string()),
            bytes,
        );
        Ok(())
    }

    fn reject(&mut self, staged: StagedAttachment) -> Result<()> {
        self.ensure_open()?;
        self.staged.remove(&staged.token());
        Ok(())
    }

    fn attachment(&self, format: &str, hash: &str) -> Result<Option<Box<dyn Read + Send>>> {
        self.ensure_open()?;
        Ok(self
            .committed
            .get(&(format.to_string(), hash.to_string()))
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>))
    }

    fn erase_attachment(&mut self, format: &str, hash: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .committed
            .remove(&(format.to_string(), hash.to_string()))
            .is_some())
    }

    fn filter(&mut self, allow: &[(String, String)]) -> Result<Vec<(String, String)>> {
        self.ensure_open()?;
        let doomed: Vec<(String, String)> = self
            .committed
            .keys()
            .filter(|key| !allow.contains(*key))
            .cloned()
            .collect();
        for key in &doomed {
            self.committed.remove(key);
        }
        Ok(doomed)
    }

    fn clear_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.committed.clear();
        self.staged.clear();
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
    use crate::util::now_microseconds;

    fn driver() -> MemoryDocDriver {
        MemoryDocDriver::new(ShareKeypair::generate("testing").unwrap().address)
    }

    fn doc_at(driver: &MemoryDocDriver, path: &str, text: &str) -> Doc {
        let keypair = AuthorKeypair::generate("test").unwrap();
        EsFive
            .generate_document(
                &keypair,
                driver.share(),
                DocInput {
                    path: path.into(),
                    text: text.into(),
                    ..Default::default()
                },
                now_microseconds(),
            )
            .unwrap()
    }

    #[test]
    fn upsert_assigns_increasing_local_indexes() {
        let mut driver = driver();
        assert_eq!(driver.max_local_index().unwrap(), -1);
        let a = driver.upsert(doc_at(&driver, "/a", "x")).unwrap();
        let b = driver.upsert(doc_at(&driver, "/b", "y")).unwrap();
        assert_eq!(a.local_index, Some(0));
        assert_eq!(b.local_index, Some(1));
        assert_eq!(driver.max_local_index().unwrap(), 1);
    }

    #[test]
    fn upsert_replaces_same_path_author_row() {
        let mut driver = driver();
        let keypair = AuthorKeypair::generate("test").unwrap();
        let share = driver.share().clone();
        let now = now_microseconds();
        let make = |ts: u64| {
            EsFive
                .generate_document(
                    &keypair,
                    &share,
                    DocInput {
                        path: "/a".into(),
                        text: "x".into(),
                        timestamp: Some(ts),
                        ..Default::default()
                    },
                    now,
                )
                .unwrap()
        };
        driver.upsert(make(now)).unwrap();
        driver.upsert(make(now + 5)).unwrap();
        let query = Query {
            history: crate::query::HistoryMode::All,
            ..Default::default()
        };
        let docs = driver.query_docs(&query, now).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].timestamp, now + 5);
    }

    #[test]
    fn close_is_terminal() {
        let mut driver = driver();
        driver.close(false).unwrap();
        assert!(driver.is_closed());
        assert_eq!(driver.close(false), Err(Error::ReplicaClosed));
        assert_eq!(driver.max_local_index(), Err(Error::ReplicaClosed));
        assert_eq!(driver.get_config("share"), Err(Error::ReplicaClosed));
    }

    #[test]
    fn config_carries_share_and_schema_version() {
        let driver = driver();
        assert_eq!(
            driver.get_config("share").unwrap(),
            Some(driver.share().to_string())
        );
        assert_eq!(driver.get_config("schemaVersion").unwrap(), Some("2".into()));
    }

    #[test]
    fn staging_verifies_hashes() {
        let crypto = default_crypto();
        let mut driver = MemoryAttachmentDriver::new();
        let hash = base32::encode(&crypto.sha256(b"Hi!"));

        // Wrong bytes: nothing staged, nothing committed.
        assert!(driver.stage("es.5", &hash, &mut &b"nope"[..]).is_err());
        assert!(driver.attachment("es.5", &hash).unwrap().is_none());

        let staged = driver.stage("es.5", &hash, &mut &b"Hi!"[..]).unwrap();
        assert_eq!(staged.size(), 3);
        // Still invisible until committed.
        assert!(driver.attachment("es.5", &hash).unwrap().is_none());
        driver.commit(staged).unwrap();

        let mut read = driver.attachment("es.5", &hash).unwrap().unwrap();
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"Hi!");
    }

    #[test]
    fn reject_discards_staged_bytes() {
        let crypto = default_crypto();
        let mut driver = MemoryAttachmentDriver::new();
        let hash = base32::encode(&crypto.sha256(b"Hi!"));
        let staged = driver.stage("es.5", &hash, &mut &b"Hi!"[..]).unwrap();
        driver.reject(staged).unwrap();
        assert!(driver.attachment("es.5", &hash).unwrap().is_none());
    }

    #[test]
    fn filter_erases_everything_off_the_allow_list() {
        let crypto = default_crypto();
        let mut driver = MemoryAttachmentDriver::new();
        let keep = base32::encode(&crypto.sha256(b"keep"));
        let drop = base32::encode(&crypto.sha256(b"drop"));
        for (hash, bytes) in [(&keep, &b"keep"[..]), (&drop, &b"drop"[..])] {
            let staged = driver.stage("es.5", hash, &mut &bytes[..]).unwrap();
            driver.commit(staged).unwrap();
        }
        let erased = driver
            .filter(&[("es.5".to_string(), keep.clone())])
            .unwrap();
        assert_eq!(erased, vec![("es.5".to_string(), drop.clone())]);
        assert!(driver.attachment("es.5", &keep).unwrap().is_some());
        assert!(driver.attachment("es.5", &drop).unwrap().is_none());
    }
}
