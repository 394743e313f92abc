use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const SHA256_PREFIX: &str = "sha256:";

/// Errors for malformed digest strings.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("Digest `{0}` does not use the sha256 algorithm.")]
    UnsupportedAlgorithm(String),
    #[error("Digest `{0}` does not contain 64 lowercase hex characters.")]
    InvalidHex(String),
}

/// A content address in the `sha256:<hex>` form used by registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hashes the given bytes.
    #[must_use]
    pub fn sha256(bytes: &[u8]) -> Self {
        Self(format!("{SHA256_PREFIX}{}", hex::encode(Sha256::digest(bytes))))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part, without the algorithm prefix.
    #[must_use]
    pub fn encoded(&self) -> &str {
        self.0.strip_prefix(SHA256_PREFIX).unwrap_or(&self.0)
    }

    /// Returns true if `bytes` hash to this digest.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::sha256(bytes) == *self
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(encoded) = s.strip_prefix(SHA256_PREFIX) else {
            return Err(DigestError::UnsupportedAlgorithm(s.to_owned()));
        };
        if encoded.len() != 64 || !encoded.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(DigestError::InvalidHex(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}
