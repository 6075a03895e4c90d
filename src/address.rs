use crate::base32;
use crate::crypto::{default_crypto, Keypair};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

fn is_name_char(c: u8, first: bool) -> bool {
    if first {
        c.is_ascii_lowercase()
    } else {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }
}

/// Checks a `b`-prefixed base32 pubkey suffix and returns the key bytes.
fn parse_pubkey_suffix(suffix: &str, what: &str) -> Result<[u8; 32]> {
    if suffix.len() != 53 {
        return Err(Error::validation(format!(
            "{} pubkey must be 53 characters, got {}",
            what,
            suffix.len()
        )));
    }
    let bytes = base32::decode(suffix)?;
    bytes.try_into().map_err(|_| {
        Error::validation(format!("{} pubkey does not decode to 32 bytes", what))
    })
}

fn parse_name(name: &str, what: &str, len: std::ops::RangeInclusive<usize>) -> Result<()> {
    if !len.contains(&name.len()) {
        return Err(Error::validation(format!(
            "{} name must be {}-{} characters, got {}",
            what,
            len.start(),
            len.end(),
            name.len()
        )));
    }
    for (i, c) in name.bytes().enumerate() {
        if !is_name_char(c, i == 0) {
            return Err(Error::validation(format!(
                "{} name contains invalid character {:?}",
                what, c as char
            )));
        }
    }
    Ok(())
}

/// The address of a share: `+name.b<pubkey>`.
///
/// The name is 1-15 characters, lowercase alphanumeric, starting with a
/// letter; the suffix is the base32 Ed25519 public key naming the
/// replication group.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareAddress(String);

impl ShareAddress {
    /// Parses and validates a share address.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('+')
            .ok_or_else(|| Error::validation("share address must start with +"))?;
        let (name, suffix) = body
            .split_once('.')
            .ok_or_else(|| Error::validation("share address must contain a . separator"))?;
        if suffix.contains('.') {
            return Err(Error::validation("share address has too many . separators"));
        }
        parse_name(name, "share", 1..=15)?;
        parse_pubkey_suffix(suffix, "share")?;
        Ok(Self(s.to_string()))
    }

    /// Builds an address from a name and public key bytes.
    pub fn from_parts(name: &str, public: &[u8; 32]) -> Result<Self> {
        Self::parse(&format!("+{}.{}", name, base32::encode(public)))
    }

    /// The address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The human-chosen name between `+` and `.`.
    pub fn name(&self) -> &str {
        let dot = self.0.find('.').unwrap_or(self.0.len());
        &self.0[1..dot]
    }

    /// The base32 pubkey suffix, including its `b` prefix.
    pub fn suffix(&self) -> &str {
        let dot = self.0.find('.').unwrap_or(0);
        &self.0[dot + 1..]
    }

    /// The Ed25519 public key embedded in the address.
    pub fn public_key(&self) -> [u8; 32] {
        base32::decode(self.suffix())
            .expect("validated at parse")
            .try_into()
            .expect("validated at parse")
    }
}

impl std::fmt::Debug for ShareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ShareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ShareAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ShareAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ShareAddress> for String {
    fn from(addr: ShareAddress) -> Self {
        addr.0
    }
}

/// The address of an author: `@shortname.b<pubkey>`.
///
/// The shortname is exactly 4 characters, lowercase alphanumeric, starting
/// with a letter.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AuthorAddress(String);

impl AuthorAddress {
    /// Parses and validates an author address.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('@')
            .ok_or_else(|| Error::validation("author address must start with @"))?;
        let (shortname, suffix) = body
            .split_once('.')
            .ok_or_else(|| Error::validation("author address must contain a . separator"))?;
        if suffix.contains('.') {
            return Err(Error::validation("author address has too many . separators"));
        }
        parse_name(shortname, "author", 4..=4)?;
        parse_pubkey_suffix(suffix, "author")?;
        Ok(Self(s.to_string()))
    }

    /// Builds an address from a shortname and public key bytes.
    pub fn from_parts(shortname: &str, public: &[u8; 32]) -> Result<Self> {
        Self::parse(&format!("@{}.{}", shortname, base32::encode(public)))
    }

    /// The address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 4-character shortname.
    pub fn shortname(&self) -> &str {
        &self.0[1..5]
    }

    /// The base32 pubkey suffix, including its `b` prefix.
    pub fn suffix(&self) -> &str {
        &self.0[6..]
    }

    /// The Ed25519 public key embedded in the address.
    pub fn public_key(&self) -> [u8; 32] {
        base32::decode(self.suffix())
            .expect("validated at parse")
            .try_into()
            .expect("validated at parse")
    }
}

impl std::fmt::Debug for AuthorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for AuthorAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AuthorAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AuthorAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AuthorAddress> for String {
    fn from(addr: AuthorAddress) -> Self {
        addr.0
    }
}

/// An author address together with the secret half of its keypair.
#[derive(Clone)]
pub struct AuthorKeypair {
    /// The public address.
    pub address: AuthorAddress,
    keypair: Keypair,
}

impl AuthorKeypair {
    /// Generates a fresh keypair for `shortname`.
    pub fn generate(shortname: &str) -> Result<Self> {
        let keypair = default_crypto().generate_keypair();
        Ok(Self {
            address: AuthorAddress::from_parts(shortname, &keypair.public)?,
            keypair,
        })
    }

    /// Rebuilds a keypair from a shortname and 32 secret bytes.
    pub fn from_secret(shortname: &str, secret: &[u8; 32]) -> Result<Self> {
        let keypair = default_crypto().keypair_from_secret(secret)?;
        Ok(Self {
            address: AuthorAddress::from_parts(shortname, &keypair.public)?,
            keypair,
        })
    }

    /// The underlying key material.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The secret key as a `b`-prefixed base32 string.
    pub fn secret(&self) -> String {
        base32::encode(&self.keypair.secret)
    }
}

impl std::fmt::Debug for AuthorKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AuthorKeypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A share address together with the secret half of its keypair.
///
/// Only needed when minting a new share; replicas operate on the address
/// alone.
#[derive(Clone)]
pub struct ShareKeypair {
    /// The public address.
    pub address: ShareAddress,
    keypair: Keypair,
}

impl ShareKeypair {
    /// Generates a fresh share keypair for `name`.
    pub fn generate(name: &str) -> Result<Self> {
        let keypair = default_crypto().generate_keypair();
        Ok(Self {
            address: ShareAddress::from_parts(name, &keypair.public)?,
            keypair,
        })
    }

    /// The secret key as a `b`-prefixed base32 string.
    pub fn secret(&self) -> String {
        base32::encode(&self.keypair.secret)
    }
}

impl std::fmt::Debug for ShareKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShareKeypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_roundtrip() {
        let share = ShareKeypair::generate("gardening").unwrap();
        let addr = share.address.clone();
        assert_eq!(addr.name(), "gardening");
        assert!(addr.suffix().starts_with('b'));
        assert_eq!(ShareAddress::parse(addr.as_str()).unwrap(), addr);
    }

    #[test]
    fn author_roundtrip() {
        let author = AuthorKeypair::generate("suzy").unwrap();
        let addr = author.address.clone();
        assert_eq!(addr.shortname(), "suzy");
        assert_eq!(addr.public_key(), author.keypair().public);
        assert_eq!(AuthorAddress::parse(addr.as_str()).unwrap(), addr);
    }

    #[test]
    fn rejects_bad_shares() {
        let suffix = crate::base32::encode(&[7; 32]);
        assert!(ShareAddress::parse(&format!("gardening.{}", suffix)).is_err());
        assert!(ShareAddress::parse(&format!("+.{}", suffix)).is_err());
        assert!(ShareAddress::parse(&format!("+9name.{}", suffix)).is_err());
        assert!(ShareAddress::parse(&format!("+waytoolongname42.{}", suffix)).is_err());
        assert!(ShareAddress::parse(&format!("+Big.{}", suffix)).is_err());
        assert!(ShareAddress::parse("+name.bshort").is_err());
        assert!(ShareAddress::parse(&format!("+na.me.{}", suffix)).is_err());
    }

    #[test]
    fn rejects_bad_authors() {
        let suffix = crate::base32::encode(&[7; 32]);
        assert!(AuthorAddress::parse(&format!("@suz.{}", suffix)).is_err());
        assert!(AuthorAddress::parse(&format!("@suzzy.{}", suffix)).is_err());
        assert!(AuthorAddress::parse(&format!("@1uzy.{}", suffix)).is_err());
        assert!(AuthorAddress::parse(&format!("@SUZY.{}", suffix)).is_err());
        assert!(AuthorAddress::parse(&format!("suzy.{}", suffix)).is_err());
        assert!(AuthorAddress::parse("@suzy.b234").is_err());
        // Uppercase anywhere in the pubkey is out of alphabet.
        let bad = format!("@suzy.B{}", &suffix[1..]);
        assert!(AuthorAddress::parse(&bad).is_err());
    }

    #[test]
    fn from_secret_recovers_address() {
        let a = AuthorKeypair::generate("mira").unwrap();
        let secret = a.keypair().secret;
        let b = AuthorKeypair::from_secret("mira", &secret).unwrap();
        assert_eq!(a.address, b.address);
    }
}
