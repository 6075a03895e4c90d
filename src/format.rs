use crate::address::{AuthorKeypair, ShareAddress};
use crate::base32;
use crate::crypto::{default_crypto, CryptoProvider};
use crate::doc::{AttachmentInfo, Doc};
use crate::error::{Error, Result};
use crate::path::Path;
use crate::util::{FUTURE_CUTOFF, MAX_TIMESTAMP, MIN_TIMESTAMP};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Caller-supplied ingredients for a new document.
#[derive(Clone, Debug, Default)]
pub struct DocInput {
    /// Where the document lives in the share.
    pub path: String,
    /// Inline text content.
    pub text: String,
    /// Microsecond timestamp; resolved by the caller when absent.
    pub timestamp: Option<u64>,
    /// Expiry deadline; required on `!` paths, forbidden elsewhere.
    pub delete_after: Option<u64>,
}

/// A versioned document schema and its rule set.
///
/// Formats are stateless values; the two shipped formats are [`EsFour`]
/// (text only) and [`EsFive`] (text plus attachment). All signing and
/// verification snapshots the process crypto provider once per call.
pub trait Format: Send + Sync {
    /// The format tag carried in every document, e.g. `"es.5"`.
    fn id(&self) -> &'static str;

    /// Whether documents of this format may declare attachments.
    fn supports_attachments(&self) -> bool;

    /// Hashes the canonical form of `doc`: fields sorted by name, each
    /// emitted as `name\tvalue\n`, omitting null fields, the inline text
    /// (its hash stands in), and the signature. Returns the base32 SHA-256.
    ///
    /// Runs the structural shape check first, substituting a well-shaped
    /// fake signature when the document has not been signed yet.
    fn hash_document(&self, doc: &Doc) -> Result<String>;

    /// Builds, signs, and validates a fresh document.
    fn generate_document(
        &self,
        keypair: &AuthorKeypair,
        share: &ShareAddress,
        input: DocInput,
        now: u64,
    ) -> Result<Doc>;

    /// Hashes and signs `doc`, returning it with the signature installed.
    fn sign_document(&self, keypair: &AuthorKeypair, doc: Doc) -> Result<Doc>;

    /// Produces the empty-content replacement for `doc`: same path and
    /// author, timestamp one microsecond later, attachment fields cleared,
    /// re-signed.
    fn wipe_document(&self, keypair: &AuthorKeypair, doc: &Doc) -> Result<Doc>;

    /// Strips fields outside the schema from a loose JSON document. Extras
    /// whose names begin with `_` are returned separately; anything else is
    /// dropped.
    fn remove_extra_fields(&self, value: Value) -> Result<(Doc, Map<String, Value>)>;

    /// Runs the full validity check: shape, timestamps and ephemerality,
    /// write scope, signature, text hash. Cheap checks run first; the
    /// cryptographic ones last.
    fn check_document_is_valid(&self, doc: &Doc, now: u64) -> Result<()>;

    /// The attachment `doc` declares, or `None` when it declares none.
    /// Formats without attachment support return [`Error::NotSupported`].
    fn attachment_info(&self, doc: &Doc) -> Result<Option<AttachmentInfo>>;

    /// Returns a re-signed copy of `doc` with attachment metadata filled in.
    fn update_attachment_fields(
        &self,
        keypair: &AuthorKeypair,
        doc: Doc,
        size: u64,
        hash: String,
    ) -> Result<Doc>;
}

struct Rules {
    id: &'static str,
    max_text: usize,
    attachments: bool,
    text_hash_field: &'static str,
}

const ES4_RULES: Rules = Rules {
    id: "es.4",
    max_text: 4_000_000,
    attachments: false,
    text_hash_field: "contentHash",
};

const ES5_RULES: Rules = Rules {
    id: "es.5",
    max_text: 8_000,
    attachments: true,
    text_hash_field: "textHash",
};

/// Base32 length of a SHA-256 digest, `b` prefix included.
const HASH_LEN: usize = 53;
/// Base32 length of an Ed25519 signature, `b` prefix included.
const SIG_LEN: usize = 104;

fn check_hash_shape(s: &str, what: &str) -> Result<()> {
    if s.len() != HASH_LEN || base32::decode(s).is_err() {
        return Err(Error::validation(format!("{} is not a base32 sha256", what)));
    }
    Ok(())
}

fn check_shape(rules: &Rules, doc: &Doc) -> Result<()> {
    if doc.format != rules.id {
        return Err(Error::validation(format!(
            "expected format {}, got {}",
            rules.id, doc.format
        )));
    }
    if doc.text.len() > rules.max_text {
        return Err(Error::validation(format!(
            "text length {} exceeds the {} limit of {}",
            doc.text.len(),
            rules.id,
            rules.max_text
        )));
    }
    check_hash_shape(&doc.text_hash, "text hash")?;
    let signature = if doc.signature.is_empty() {
        // Not signed yet; stand in a well-shaped signature so the rest of
        // the shape can be judged before signing.
        fake_signature()
    } else {
        doc.signature.clone()
    };
    if signature.len() != SIG_LEN || base32::decode(&signature).is_err() {
        return Err(Error::validation("signature is not a base32 ed25519 signature"));
    }
    match (&doc.attachment_hash, doc.attachment_size) {
        (None, None) => {}
        (Some(hash), Some(_)) if rules.attachments => {
            check_hash_shape(hash, "attachment hash")?;
        }
        (Some(_), Some(_)) => {
            return Err(Error::validation(format!(
                "{} documents do not carry attachments",
                rules.id
            )));
        }
        _ => {
            return Err(Error::validation(
                "attachment hash and size must be declared together",
            ));
        }
    }
    Ok(())
}

fn check_timestamps(doc: &Doc, now: u64) -> Result<()> {
    if doc.timestamp < MIN_TIMESTAMP || doc.timestamp > MAX_TIMESTAMP {
        return Err(Error::validation(format!(
            "timestamp {} is out of range",
            doc.timestamp
        )));
    }
    if doc.timestamp > now + FUTURE_CUTOFF {
        return Err(Error::validation(
            "timestamp is more than 10 minutes in the future",
        ));
    }
    match doc.delete_after {
        Some(deadline) => {
            if !doc.path.is_ephemeral() {
                return Err(Error::validation(
                    "only paths containing ! may carry deleteAfter",
                ));
            }
            if deadline <= doc.timestamp {
                return Err(Error::validation("deleteAfter must be after timestamp"));
            }
            if deadline > MAX_TIMESTAMP {
                return Err(Error::validation("deleteAfter is out of range"));
            }
            if deadline < now {
                return Err(Error::validation("ephemeral document has already expired"));
            }
        }
        None => {
            if doc.path.is_ephemeral() {
                return Err(Error::validation(
                    "paths containing ! require deleteAfter",
                ));
            }
        }
    }
    Ok(())
}

fn fake_signature() -> String {
    base32::encode(&[0; 64])
}

fn canonical_hash(rules: &Rules, doc: &Doc, crypto: &dyn CryptoProvider) -> Result<String> {
    check_shape(rules, doc)?;
    let mut fields: Vec<(&str, String)> = vec![
        ("author", doc.author.to_string()),
        ("format", doc.format.clone()),
        ("path", doc.path.to_string()),
        ("share", doc.share.to_string()),
        (rules.text_hash_field, doc.text_hash.clone()),
        ("timestamp", doc.timestamp.to_string()),
    ];
    if let Some(deadline) = doc.delete_after {
        fields.push(("deleteAfter", deadline.to_string()));
    }
    if rules.attachments {
        if let Some(hash) = &doc.attachment_hash {
            fields.push(("attachmentHash", hash.clone()));
        }
        if let Some(size) = doc.attachment_size {
            fields.push(("attachmentSize", size.to_string()));
        }
    }
    fields.sort_by_key(|(name, _)| *name);
    let mut canonical = String::new();
    for (name, value) in fields {
        canonical.push_str(name);
        canonical.push('\t');
        canonical.push_str(&value);
        canonical.push('\n');
    }
    Ok(base32::encode(&crypto.sha256(canonical.as_bytes())))
}

fn sign(
    rules: &Rules,
    keypair: &AuthorKeypair,
    mut doc: Doc,
    crypto: &dyn CryptoProvider,
) -> Result<Doc> {
    if keypair.address != doc.author {
        return Err(Error::validation(format!(
            "keypair {} cannot sign a document by {}",
            keypair.address, doc.author
        )));
    }
    let hash = canonical_hash(rules, &doc, crypto)?;
    let signature = crypto.sign(keypair.keypair(), hash.as_bytes())?;
    doc.signature = base32::encode(&signature);
    Ok(doc)
}

fn check_valid(rules: &Rules, doc: &Doc, now: u64, crypto: &dyn CryptoProvider) -> Result<()> {
    check_shape(rules, doc)?;
    check_timestamps(doc, now)?;
    if !doc.path.can_be_written_by(&doc.author) {
        return Err(Error::validation(format!(
            "path {} is not writable by {}",
            doc.path, doc.author
        )));
    }
    if doc.signature.is_empty() {
        return Err(Error::validation("document is unsigned"));
    }
    let hash = canonical_hash(rules, doc, crypto)?;
    let signature: [u8; 64] = base32::decode(&doc.signature)?
        .try_into()
        .map_err(|_| Error::validation("signature does not decode to 64 bytes"))?;
    if !crypto.verify(&doc.author.public_key(), &signature, hash.as_bytes()) {
        return Err(Error::validation("signature does not verify"));
    }
    if base32::encode(&crypto.sha256(doc.text.as_bytes())) != doc.text_hash {
        return Err(Error::validation("text does not match its declared hash"));
    }
    Ok(())
}

const DOC_FIELDS: &[&str] = &[
    "format",
    "author",
    "path",
    "share",
    "timestamp",
    "deleteAfter",
    "text",
    "textHash",
    "attachmentHash",
    "attachmentSize",
    "signature",
];

fn remove_extras(value: Value) -> Result<(Doc, Map<String, Value>)> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(Error::validation(format!(
                "document must be a JSON object, got {}",
                other
            )))
        }
    };
    let mut kept = Map::new();
    let mut extras = Map::new();
    for (name, value) in obj {
        if DOC_FIELDS.contains(&name.as_str()) {
            kept.insert(name, value);
        } else if name.starts_with('_') {
            extras.insert(name, value);
        }
    }
    let doc = serde_json::from_value(Value::Object(kept))
        .map_err(|err| Error::validation(format!("document does not fit the schema: {}", err)))?;
    Ok((doc, extras))
}

fn generate(
    rules: &Rules,
    keypair: &AuthorKeypair,
    share: &ShareAddress,
    input: DocInput,
    now: u64,
    crypto: &dyn CryptoProvider,
) -> Result<Doc> {
    let doc = Doc {
        format: rules.id.to_string(),
        author: keypair.address.clone(),
        path: Path::parse(&input.path)?,
        share: share.clone(),
        timestamp: input.timestamp.unwrap_or(now),
        delete_after: input.delete_after,
        text_hash: base32::encode(&crypto.sha256(input.text.as_bytes())),
        text: input.text,
        attachment_hash: None,
        attachment_size: None,
        signature: String::new(),
        local_index: None,
    };
    let doc = sign(rules, keypair, doc, crypto)?;
    check_valid(rules, &doc, now, crypto)?;
    Ok(doc)
}

fn wipe(
    rules: &Rules,
    keypair: &AuthorKeypair,
    doc: &Doc,
    crypto: &dyn CryptoProvider,
) -> Result<Doc> {
    if doc.timestamp >= MAX_TIMESTAMP {
        return Err(Error::validation(
            "cannot wipe: timestamp is already at its maximum",
        ));
    }
    let wiped = Doc {
        format: doc.format.clone(),
        author: doc.author.clone(),
        path: doc.path.clone(),
        share: doc.share.clone(),
        timestamp: doc.timestamp + 1,
        delete_after: doc.delete_after,
        text: String::new(),
        text_hash: base32::encode(&crypto.sha256(b"")),
        attachment_hash: None,
        attachment_size: None,
        signature: String::new(),
        local_index: None,
    };
    sign(rules, keypair, wiped, crypto)
}

macro_rules! impl_format {
    ($ty:ident, $rules:expr) => {
        impl Format for $ty {
            fn id(&self) -> &'static str {
                $rules.id
            }

            fn supports_attachments(&self) -> bool {
                $rules.attachments
            }

            fn hash_document(&self, doc: &Doc) -> Result<String> {
                canonical_hash(&$rules, doc, &*default_crypto())
            }

            fn generate_document(
                &self,
                keypair: &AuthorKeypair,
                share: &ShareAddress,
                input: DocInput,
                now: u64,
            ) -> Result<Doc> {
                generate(&$rules, keypair, share, input, now, &*default_crypto())
            }

            fn sign_document(&self, keypair: &AuthorKeypair, doc: Doc) -> Result<Doc> {
                sign(&$rules, keypair, doc, &*default_crypto())
            }

            fn wipe_document(&self, keypair: &AuthorKeypair, doc: &Doc) -> Result<Doc> {
                wipe(&$rules, keypair, doc, &*default_crypto())
            }

            fn remove_extra_fields(&self, value: Value) -> Result<(Doc, Map<String, Value>)> {
                remove_extras(value)
            }

            fn check_document_is_valid(&self, doc: &Doc, now: u64) -> Result<()> {
                check_valid(&$rules, doc, now, &*default_crypto())
            }

            fn attachment_info(&self, doc: &Doc) -> Result<Option<AttachmentInfo>> {
                if !$rules.attachments {
                    return Err(Error::NotSupported(format!(
                        "{} documents do not support attachments",
                        $rules.id
                    )));
                }
                Ok(doc.declared_attachment())
            }

            fn update_attachment_fields(
                &self,
                keypair: &AuthorKeypair,
                mut doc: Doc,
                size: u64,
                hash: String,
            ) -> Result<Doc> {
                if !$rules.attachments {
                    return Err(Error::NotSupported(format!(
                        "{} documents do not support attachments",
                        $rules.id
                    )));
                }
                doc.attachment_hash = Some(hash);
                doc.attachment_size = Some(size);
                doc.signature = String::new();
                sign(&$rules, keypair, doc, &*default_crypto())
            }
        }
    };
}

/// The text-only `es.4` format: inline content up to 4,000,000 UTF-8 bytes,
/// no attachments.
#[derive(Clone, Copy, Debug, Default)]
pub struct EsFour;

/// The attachment-capable `es.5` format: inline text up to 8,000 UTF-8
/// bytes plus an optional content-addressed attachment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EsFive;

impl_format!(EsFour, ES4_RULES);
impl_format!(EsFive, ES5_RULES);

/// The format new documents use unless told otherwise.
pub fn default_format() -> &'static dyn Format {
    &EsFive
}

/// Looks a shipped format up by its tag.
pub fn format_by_id(id: &str) -> Option<&'static dyn Format> {
    match id {
        "es.4" => Some(&EsFour),
        "es.5" => Some(&EsFive),
        _ => None,
    }
}

/// Snapshot of the crypto provider for one replica operation.
pub(crate) fn crypto_snapshot() -> Arc<dyn CryptoProvider> {
    default_crypto()
}
