use std::str::FromStr;

use oci_spec::image::{Digest, DigestAlgorithm};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::error::StorageError;

/// Media type recorded for content whose repository-local type is unknown.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Size, media type and digest of a stored blob. Serializes with the OCI
/// descriptor field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

impl Descriptor {
    pub fn new(digest: Digest, size: u64, media_type: impl Into<String>) -> Self {
        Descriptor {
            digest,
            size,
            media_type: media_type.into(),
        }
    }
}

pub fn parse_digest(value: &str) -> Result<Digest, StorageError> {
    Digest::from_str(value).map_err(|_| StorageError::DigestInvalid(value.to_string()))
}

/// Canonical (sha256) digest of `content`.
pub fn digest_of(content: &[u8]) -> Result<Digest, StorageError> {
    let mut digester = Digester::canonical();
    digester.update(content);
    digester.digest()
}

/// Incremental hasher for the algorithms the store can verify.
#[derive(Clone)]
pub enum Digester {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Digester {
    pub fn canonical() -> Self {
        Digester::Sha256(Sha256::new())
    }

    pub fn for_algorithm(algorithm: &DigestAlgorithm) -> Result<Self, StorageError> {
        match algorithm {
            DigestAlgorithm::Sha256 => Ok(Digester::Sha256(Sha256::new())),
            DigestAlgorithm::Sha384 => Ok(Digester::Sha384(Sha384::new())),
            DigestAlgorithm::Sha512 => Ok(Digester::Sha512(Sha512::new())),
            other => Err(StorageError::DigestInvalid(format!(
                "unsupported digest algorithm {other}"
            ))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha384(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    /// Digest of everything hashed so far; the digester keeps accepting input.
    pub fn digest(&self) -> Result<Digest, StorageError> {
        let (algorithm, encoded) = match self {
            Digester::Sha256(h) => ("sha256", hex::encode(h.clone().finalize())),
            Digester::Sha384(h) => ("sha384", hex::encode(h.clone().finalize())),
            Digester::Sha512(h) => ("sha512", hex::encode(h.clone().finalize())),
        };
        parse_digest(&format!("{algorithm}:{encoded}"))
    }
}
