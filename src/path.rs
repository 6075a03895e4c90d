use crate::address::AuthorAddress;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Punctuation allowed in paths, besides `/` itself and alphanumerics.
const PATH_PUNCTUATION: &str = "'()-._~!*$&+,:=?@%";

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || PATH_PUNCTUATION.contains(c)
}

/// The routing key of a document within a share.
///
/// Paths are 2-512 characters from a restricted alphabet, start with `/`,
/// never end with `/`, and never contain `//`. A path containing `~author`
/// is writable only by that author; a path containing `!` is ephemeral and
/// must carry a `deleteAfter`.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(String);

impl Path {
    /// Parses and validates a path.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() < 2 || s.len() > 512 {
            return Err(Error::validation(format!(
                "path must be 2-512 characters, got {}",
                s.len()
            )));
        }
        if !s.starts_with('/') {
            return Err(Error::validation("path must start with /"));
        }
        if s.starts_with("/@") {
            return Err(Error::validation("path must not start with /@"));
        }
        if s.ends_with('/') {
            return Err(Error::validation("path must not end with /"));
        }
        if s.contains("//") {
            return Err(Error::validation("path must not contain //"));
        }
        if let Some(c) = s.chars().find(|c| !is_path_char(*c)) {
            return Err(Error::validation(format!(
                "path contains invalid character {:?}",
                c
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// The path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the path carries a `!`, making its documents ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.0.contains('!')
    }

    /// Whether the path carries a `~`, scoping writes to named authors.
    pub fn is_owned(&self) -> bool {
        self.0.contains('~')
    }

    /// Whether `author` may write documents at this path.
    ///
    /// An unowned path is writable by everyone; an owned path only by an
    /// author whose full address appears after a `~`.
    pub fn can_be_written_by(&self, author: &AuthorAddress) -> bool {
        !self.is_owned() || self.0.contains(&format!("~{}", author))
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.0
    }
}
