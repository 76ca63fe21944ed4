//! Checksum utilities for downloaded archives
//!
//! Publishers advertise digests either with an explicit algorithm prefix
//! (`sha256:<hex>`, `md5:<hex>`) or as a bare hex string, in which case the
//! algorithm is inferred from the digest length.

use crate::error::{Result, TradeDataError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    /// Length of the hex-encoded digest
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Md5 => 32,
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
        }
    }
}

/// A digest together with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into().trim().to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TradeDataError::InvalidChecksum(format!("{}:{}", algorithm, hex)));
        }
        Ok(Self { algorithm, hex })
    }

    /// Compute the checksum of a file on disk
    pub fn of_file(path: impl AsRef<Path>, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Self::of_reader(&mut file, algorithm)
    }

    /// Compute the checksum of any readable source
    pub fn of_reader<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let hex = match algorithm {
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = reader.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                hex::encode(hasher.finalize())
            },
            ChecksumAlgorithm::Md5 => {
                let mut context = md5::Context::new();
                loop {
                    let n = reader.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    context.consume(&buffer[..n]);
                }
                format!("{:x}", context.compute())
            },
        };
        Ok(Self { algorithm, hex })
    }

    /// Verify that the file at `path` hashes to this checksum
    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let actual = Self::of_file(path, self.algorithm)?;
        if actual.hex == self.hex {
            Ok(())
        } else {
            Err(TradeDataError::ChecksumMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl std::str::FromStr for Checksum {
    type Err = TradeDataError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((algorithm, hex)) = s.split_once(':') {
            let algorithm = match algorithm.to_ascii_lowercase().as_str() {
                "sha256" | "sha-256" => ChecksumAlgorithm::Sha256,
                "md5" => ChecksumAlgorithm::Md5,
                other => {
                    return Err(TradeDataError::InvalidChecksum(format!(
                        "unsupported algorithm '{}'",
                        other
                    )))
                },
            };
            return Self::new(algorithm, hex);
        }

        match s.len() {
            64 => Self::new(ChecksumAlgorithm::Sha256, s),
            32 => Self::new(ChecksumAlgorithm::Md5, s),
            _ => Err(TradeDataError::InvalidChecksum(s.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn test_sha256_of_reader() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = Checksum::of_reader(&mut cursor, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(checksum.hex, HELLO_SHA256);
    }

    #[test]
    fn test_md5_of_reader() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = Checksum::of_reader(&mut cursor, ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(checksum.hex, HELLO_MD5);
    }

    #[test]
    fn test_parse_prefixed_and_bare() {
        let prefixed: Checksum = format!("SHA256:{}", HELLO_SHA256.to_uppercase()).parse().unwrap();
        assert_eq!(prefixed.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(prefixed.hex, HELLO_SHA256);

        let bare: Checksum = HELLO_MD5.parse().unwrap();
        assert_eq!(bare.algorithm, ChecksumAlgorithm::Md5);

        assert!("crc32:deadbeef".parse::<Checksum>().is_err());
        assert!("abc".parse::<Checksum>().is_err());
        assert!(format!("md5:{}", HELLO_SHA256).parse::<Checksum>().is_err());
    }

    #[test]
    fn test_verify_file_mismatch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let good: Checksum = HELLO_SHA256.parse().unwrap();
        assert!(good.verify_file(file.path()).is_ok());

        let bad = Checksum::new(ChecksumAlgorithm::Sha256, "0".repeat(64)).unwrap();
        match bad.verify_file(file.path()) {
            Err(TradeDataError::ChecksumMismatch { actual, .. }) => {
                assert_eq!(actual, format!("sha256:{}", HELLO_SHA256));
            },
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }
}
