use crate::address::{AuthorAddress, ShareAddress};
use crate::path::Path;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A signed, path-addressed document.
///
/// One struct carries both the text-only and the attachment-capable formats;
/// each format decides which fields are legal and how they are named in the
/// canonical hashing form. The JSON shape below is what drivers persist.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    /// Format tag, e.g. `es.5`.
    pub format: String,
    /// The author who signed this document.
    pub author: AuthorAddress,
    /// Routing key within the share.
    pub path: Path,
    /// The share this document belongs to.
    pub share: ShareAddress,
    /// Microseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Expiry deadline in microseconds; present exactly on ephemeral paths.
    #[serde(default, rename = "deleteAfter", skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<u64>,
    /// Inline document text.
    pub text: String,
    /// Base32 SHA-256 of `text`.
    #[serde(rename = "textHash")]
    pub text_hash: String,
    /// Base32 SHA-256 of the attachment bytes, when one is declared.
    #[serde(default, rename = "attachmentHash", skip_serializing_if = "Option::is_none")]
    pub attachment_hash: Option<String>,
    /// Size of the attachment bytes, when one is declared.
    #[serde(default, rename = "attachmentSize", skip_serializing_if = "Option::is_none")]
    pub attachment_size: Option<u64>,
    /// Base32 Ed25519 signature over the canonical hash.
    pub signature: String,
    /// Replica-local ingest sequence number; never part of the signed
    /// identity and never replicated.
    #[serde(default, rename = "_localIndex", skip_serializing_if = "Option::is_none")]
    pub local_index: Option<u64>,
}

/// The attachment a document declares: content hash and byte size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentInfo {
    /// Base32 SHA-256 of the attachment bytes.
    pub hash: String,
    /// Byte size of the attachment.
    pub size: u64,
}

impl Doc {
    /// Whether the document is past its expiry deadline at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.delete_after, Some(deadline) if deadline < now)
    }

    /// The declared attachment, if the fields are present.
    pub(crate) fn declared_attachment(&self) -> Option<AttachmentInfo> {
        match (&self.attachment_hash, self.attachment_size) {
            (Some(hash), Some(size)) => Some(AttachmentInfo {
                hash: hash.clone(),
                size,
            }),
            _ => None,
        }
    }
}

/// Orders documents newest-first: timestamp descending, then signature
/// descending as the tie-break. The first document of a sorted history is
/// the winner at its path.
pub fn cmp_newest_first(a: &Doc, b: &Doc) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.signature.cmp(&a.signature))
}

/// Whether `incoming` loses against an already-stored `existing` document
/// from the same author at the same path.
pub(crate) fn is_obsolete(incoming: &Doc, existing: &Doc) -> bool {
    cmp_newest_first(existing, incoming) != Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AuthorKeypair;

    fn doc(timestamp: u64, signature: &str) -> Doc {
        let author = AuthorKeypair::generate("test").unwrap();
        let share = crate::address::ShareKeypair::generate("testing").unwrap();
        Doc {
            format: "es.5".into(),
            author: author.address,
            path: Path::parse("/a").unwrap(),
            share: share.address,
            timestamp,
            delete_after: None,
            text: String::new(),
            text_hash: String::new(),
            attachment_hash: None,
            attachment_size: None,
            signature: signature.into(),
            local_index: None,
        }
    }

    #[test]
    fn newest_first_ordering() {
        let older = doc(1_600_000_000_000_000, "bzz");
        let newer = doc(1_600_000_000_000_005, "baa");
        let mut history = vec![older.clone(), newer.clone()];
        history.sort_by(cmp_newest_first);
        assert_eq!(history[0].timestamp, newer.timestamp);

        // Equal timestamps break the tie on signature, descending.
        let low = doc(1_600_000_000_000_000, "baa");
        let high = doc(1_600_000_000_000_000, "bzz");
        let mut history = vec![low, high];
        history.sort_by(cmp_newest_first);
        assert_eq!(history[0].signature, "bzz");
    }

    #[test]
    fn obsolete_rules() {
        let stored = doc(1_600_000_000_000_005, "bmm");
        assert!(is_obsolete(&doc(1_600_000_000_000_000, "bzz"), &stored));
        // Same timestamp and signature: re-ingest of the identical doc.
        assert!(is_obsolete(&doc(1_600_000_000_000_005, "bmm"), &stored));
        assert!(!is_obsolete(&doc(1_600_000_000_000_009, "baa"), &stored));
    }

    #[test]
    fn expiry() {
        let mut d = doc(1_600_000_000_000_000, "bxx");
        assert!(!d.is_expired(u64::MAX));
        d.delete_after = Some(500);
        assert!(d.is_expired(501));
        assert!(!d.is_expired(500));
    }

    #[test]
    fn json_shape() {
        let d = doc(1_600_000_000_000_000, "bxx");
        let value = serde_json::to_value(&d).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("textHash"));
        assert!(!obj.contains_key("deleteAfter"));
        assert!(!obj.contains_key("_localIndex"));
        let back: Doc = serde_json::from_value(value).unwrap();
        assert_eq!(back, d);
    }
}
