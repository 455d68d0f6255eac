//! Integrity digests and file verification
//!
//! Digests are algorithm-tagged (`sha256:<hex>`). Verification streams the
//! file through the hasher so large archives never sit in memory.

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const READ_BUFFER: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Length of the hex-encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// An algorithm-tagged content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Build a digest, normalizing hex to lowercase
    pub fn new(algorithm: Algorithm, hex: &str) -> Result<Self, String> {
        let hex = hex.trim().to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "{} digest must be {} hex characters",
                algorithm,
                algorithm.hex_len()
            ));
        }
        Ok(Self { algorithm, hex })
    }

    /// Digest of an in-memory buffer
    pub fn of_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        Self {
            algorithm,
            hex: hasher.finalize_hex(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Cache-relative object path (`<algorithm>/<hex>`)
    pub fn object_path(&self) -> PathBuf {
        PathBuf::from(self.algorithm.to_string()).join(&self.hex)
    }

    /// Abbreviated form for display
    pub fn short(&self) -> String {
        format!("{}:{}", self.algorithm, &self.hex[..12])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("sha256", hex)) => Self::new(Algorithm::Sha256, hex),
            Some(("sha512", hex)) => Self::new(Algorithm::Sha512, hex),
            Some((other, _)) => Err(format!("unsupported digest algorithm '{}'", other)),
            // Bare hex is accepted as sha256, the common formula convention
            None => Self::new(Algorithm::Sha256, s),
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Stream a file through `algorithm` and return its digest
pub fn compute(path: &Path, algorithm: Algorithm) -> KilnResult<Digest> {
    let mut file = File::open(path)
        .map_err(|e| KilnError::io(format!("opening {} for hashing", path.display()), e))?;

    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| KilnError::io(format!("reading {} for hashing", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Digest {
        algorithm,
        hex: hasher.finalize_hex(),
    })
}

/// Check a file against an expected digest. No side effects.
pub fn verify(path: &Path, expected: &Digest) -> KilnResult<bool> {
    Ok(compute(path, expected.algorithm())? == *expected)
}

/// Async wrapper for [`compute`], hashing on the blocking pool
pub async fn compute_file(path: &Path, algorithm: Algorithm) -> KilnResult<Digest> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute(&path, algorithm))
        .await
        .map_err(|e| KilnError::Internal(format!("hashing task failed: {}", e)))?
}

/// Async wrapper for [`verify`]
pub async fn verify_file(path: &Path, expected: &Digest) -> KilnResult<bool> {
    Ok(compute_file(path, expected.algorithm()).await? == *expected)
}
