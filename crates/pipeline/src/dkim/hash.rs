//! Hash algorithms available for DKIM signing.
//!
//! Algorithms are looked up by name in [`HASH_ALGORITHMS`]; registering a
//! new algorithm means adding a variant and a table row, the signing
//! procedure itself does not change.

use std::{fmt::Display, str::FromStr};

use rsa::Pkcs1v15Sign;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Hash algorithm used for both the body hash and the header signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
}

/// Registered hash algorithms, by configuration name.
pub const HASH_ALGORITHMS: &[(&str, HashAlgorithm)] = &[("sha256", HashAlgorithm::Sha256)];

impl HashAlgorithm {
    /// Looks an algorithm up in the registration table.
    pub fn from_name(name: &str) -> Option<Self> {
        HASH_ALGORITHMS
            .iter()
            .find(|(registered, _)| registered.eq_ignore_ascii_case(name))
            .map(|(_, algorithm)| *algorithm)
    }

    /// Returns the name used in configuration and in the `a=` tag.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Creates a streaming hasher.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub(crate) fn pkcs1v15(&self) -> Pkcs1v15Sign {
        match self {
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unsupported hash algorithm: {s}"))
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Incremental hash state.
pub enum Hasher {
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}
