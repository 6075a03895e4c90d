use crate::error::{Error, Result};
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};

/// An Ed25519 keypair: 32 secret bytes and the 32 public bytes derived from
/// them.
#[derive(Clone, Copy)]
pub struct Keypair {
    /// Public key bytes.
    pub public: [u8; 32],
    /// Secret key bytes.
    pub secret: [u8; 32],
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Never print the secret half.
        f.debug_struct("Keypair")
            .field("public", &crate::base32::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// An incremental hasher for verifying streamed attachment bytes without
/// buffering them.
pub trait UpdatableHash: Send {
    /// Feeds more bytes into the hash.
    fn update(&mut self, bytes: &[u8]);
    /// Consumes the hasher and returns the digest.
    fn finish(self: Box<Self>) -> [u8; 32];
}

/// The cryptographic primitives the rest of the crate consumes.
///
/// Implementations are interchangeable; consumers hold an `Arc` snapshot for
/// the duration of one operation so a provider swap can never split a single
/// ingest between implementations.
pub trait CryptoProvider: Send + Sync {
    /// SHA-256 of `bytes`.
    fn sha256(&self, bytes: &[u8]) -> [u8; 32];

    /// A fresh incremental SHA-256 hasher.
    fn updatable_sha256(&self) -> Box<dyn UpdatableHash>;

    /// Generates a new random [`Keypair`].
    fn generate_keypair(&self) -> Keypair;

    /// Derives the [`Keypair`] belonging to 32 secret bytes.
    fn keypair_from_secret(&self, secret: &[u8; 32]) -> Result<Keypair>;

    /// Signs `message`, deterministically, with `keypair`.
    fn sign(&self, keypair: &Keypair, message: &[u8]) -> Result<[u8; 64]>;

    /// Verifies `signature` over `message` against `public`. Malformed input
    /// of any kind returns `false`, never an error.
    fn verify(&self, public: &[u8; 32], signature: &[u8; 64], message: &[u8]) -> bool;
}

/// [`CryptoProvider`] backed by ed25519-dalek and sha2.
#[derive(Clone, Copy, Debug, Default)]
pub struct DalekCrypto;

struct Sha256Hasher(Sha256);

impl UpdatableHash for Sha256Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self: Box<Self>) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl CryptoProvider for DalekCrypto {
    fn sha256(&self, bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    fn updatable_sha256(&self) -> Box<dyn UpdatableHash> {
        Box::new(Sha256Hasher(Sha256::new()))
    }

    fn generate_keypair(&self) -> Keypair {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).expect("no entropy source");
        self.keypair_from_secret(&secret)
            .expect("32 bytes are always a valid ed25519 secret")
    }

    fn keypair_from_secret(&self, secret: &[u8; 32]) -> Result<Keypair> {
        let sk = SecretKey::from_bytes(secret)
            .map_err(|err| Error::validation(format!("bad secret key: {}", err)))?;
        let public = PublicKey::from(&sk);
        Ok(Keypair {
            public: public.to_bytes(),
            secret: *secret,
        })
    }

    fn sign(&self, keypair: &Keypair, message: &[u8]) -> Result<[u8; 64]> {
        let secret = SecretKey::from_bytes(&keypair.secret)
            .map_err(|err| Error::validation(format!("bad secret key: {}", err)))?;
        let public = PublicKey::from(&secret);
        let keypair = ed25519_dalek::Keypair { secret, public };
        Ok(keypair.sign(message).to_bytes())
    }

    fn verify(&self, public: &[u8; 32], signature: &[u8; 64], message: &[u8]) -> bool {
        let public = match PublicKey::from_bytes(public) {
            Ok(public) => public,
            Err(_) => return false,
        };
        let sig = Signature::from(*signature);
        public.verify(message, &sig).is_ok()
    }
}

fn registry() -> &'static RwLock<Arc<dyn CryptoProvider>> {
    static CURRENT: OnceLock<RwLock<Arc<dyn CryptoProvider>>> = OnceLock::new();
    CURRENT.get_or_init(|| RwLock::new(Arc::new(DalekCrypto)))
}

/// Returns a snapshot of the process-wide default [`CryptoProvider`].
///
/// Callers keep the returned `Arc` for the whole of one operation; a
/// concurrent [`set_default_crypto`] affects only operations started after
/// the swap.
pub fn default_crypto() -> Arc<dyn CryptoProvider> {
    registry().read().clone()
}

/// Replaces the process-wide default [`CryptoProvider`].
pub fn set_default_crypto(provider: Arc<dyn CryptoProvider>) {
    *registry().write() = provider;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let crypto = DalekCrypto;
        let keypair = crypto.generate_keypair();
        let sig = crypto.sign(&keypair, b"abc").unwrap();
        assert!(crypto.verify(&keypair.public, &sig, b"abc"));
        assert!(!crypto.verify(&keypair.public, &sig, b"abd"));
        assert!(!crypto.verify(&keypair.public, &[7; 64], b"abc"));
    }

    #[test]
    fn signing_is_deterministic() {
        let crypto = DalekCrypto;
        let keypair = crypto.generate_keypair();
        assert_eq!(
            crypto.sign(&keypair, b"aaa").unwrap(),
            crypto.sign(&keypair, b"aaa").unwrap()
        );
    }

    #[test]
    fn verify_never_raises_on_garbage_key() {
        let crypto = DalekCrypto;
        // Not a valid curve point.
        assert!(!crypto.verify(&[0xff; 32], &[0; 64], b"abc"));
    }

    #[test]
    fn updatable_hash_matches_one_shot() {
        let crypto = DalekCrypto;
        let mut hasher = crypto.updatable_sha256();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), crypto.sha256(b"hello world"));
    }

    #[test]
    fn keypair_from_secret_is_stable() {
        let crypto = DalekCrypto;
        let a = crypto.keypair_from_secret(&[1; 32]).unwrap();
        let b = crypto.keypair_from_secret(&[1; 32]).unwrap();
        assert_eq!(a.public, b.public);
    }
}
