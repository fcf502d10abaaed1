//! Stored password records: `<tag>:<value>` where the tag selects how a
//! presented password is transformed before comparison.

use std::fmt;

use digest::Digest;
use ftpost_core::{FtpostError, FtpostResult};
use subtle::ConstantTimeEq;

const PLAIN_TAG: &str = "plain";

/// Digest algorithms accepted in stored records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 6] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.tag() == tag)
    }

    /// Lowercase hex digest of `input`.
    pub fn hex_digest(self, input: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(md5::Md5::digest(input)),
            HashAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(input)),
            HashAlgorithm::Sha224 => hex::encode(sha2::Sha224::digest(input)),
            HashAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(input)),
            HashAlgorithm::Sha384 => hex::encode(sha2::Sha384::digest(input)),
            HashAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(input)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Plain,
    Digest(HashAlgorithm),
}

/// The full tagged value as written in configuration.
#[derive(Clone)]
pub struct PasswordRecord {
    stored: String,
}

impl PasswordRecord {
    pub fn new(stored: impl Into<String>) -> Self {
        PasswordRecord {
            stored: stored.into(),
        }
    }

    fn tag(&self) -> Option<&str> {
        self.stored.split_once(':').map(|(tag, _)| tag)
    }

    /// Resolve the tag. Unknown tags are an operator error, not a login error.
    pub fn format(&self) -> FtpostResult<RecordFormat> {
        match self.tag() {
            Some(PLAIN_TAG) => Ok(RecordFormat::Plain),
            Some(tag) => HashAlgorithm::from_tag(tag)
                .map(RecordFormat::Digest)
                .ok_or_else(unexpected_format),
            None => Err(unexpected_format()),
        }
    }

    /// Transform `presented` into the stored form and compare the complete
    /// tagged strings, so a digest under one algorithm can never equal a
    /// record written for another.
    pub fn matches(&self, presented: &str) -> FtpostResult<bool> {
        let candidate = match self.format()? {
            RecordFormat::Plain => format!("{PLAIN_TAG}:{presented}"),
            RecordFormat::Digest(alg) => {
                format!("{}:{}", alg.tag(), alg.hex_digest(presented.as_bytes()))
            }
        };
        Ok(candidate.as_bytes().ct_eq(self.stored.as_bytes()).into())
    }
}

fn unexpected_format() -> FtpostError {
    FtpostError::MisconfiguredCredential("Unexpected password format in configuration file.".into())
}

impl fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Some(tag) => write!(f, "PasswordRecord({tag}:***)"),
            None => write!(f, "PasswordRecord(***)"),
        }
    }
}
