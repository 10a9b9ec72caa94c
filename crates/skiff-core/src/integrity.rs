//! Subresource Integrity hashes: `<algo>-<base64>` compute and verify.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Supported hash algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Algorithm::Sha1),
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    fn digest_base64(&self, content: &[u8]) -> String {
        match self {
            Algorithm::Sha1 => BASE64.encode(Sha1::digest(content)),
            Algorithm::Sha256 => BASE64.encode(Sha256::digest(content)),
            Algorithm::Sha384 => BASE64.encode(Sha384::digest(content)),
            Algorithm::Sha512 => BASE64.encode(Sha512::digest(content)),
        }
    }
}

/// Compute an SRI string for `content`.
pub fn compute(content: &[u8], algorithm: Algorithm) -> String {
    format!("{}-{}", algorithm.name(), algorithm.digest_base64(content))
}

/// Verify `content` against an SRI spec. A spec may carry several
/// space-separated hashes; any match verifies. Malformed specs and unknown
/// algorithms verify false, they never error.
pub fn verify(content: &[u8], spec: &str) -> bool {
    for part in spec.split_whitespace() {
        let Some((algo_name, expected)) = part.split_once('-') else {
            continue;
        };
        let Some(algorithm) = Algorithm::from_name(algo_name) else {
            continue;
        };
        if algorithm.digest_base64(content) == expected {
            return true;
        }
    }
    false
}

/// SHA-256 hex digest of a string, the addressing primitive for cache and store.
pub fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
