//! Per-chunk transform: compress, checksum, encrypt, checksum.
//!
//! A chunk is a fixed-size block of the delta stream (the last may be short).
//! [`ChunkCodec::encode`] turns a block into a sealed frame plus the
//! [`ChunkDescriptor`] that goes into the manifest; [`ChunkCodec::decode`]
//! checks every anchor in the descriptor on the way back.

use crate::crypto::ChunkCipher;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;

/// Default chunk size (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Smallest configurable chunk size
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest configurable chunk size; also bounds allocations on restore
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Default zstd compression level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Lossless compression applied before encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Zstd,
    None,
}

impl CompressionAlgorithm {
    pub fn compress(self, data: &[u8], level: i32) -> io::Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::Zstd => zstd::bulk::compress(data, level),
            CompressionAlgorithm::None => Ok(data.to_vec()),
        }
    }

    /// Largest output [`CompressionAlgorithm::compress`] can produce for
    /// `len` input bytes
    pub fn compressed_bound(self, len: usize) -> usize {
        match self {
            CompressionAlgorithm::Zstd => zstd::zstd_safe::compress_bound(len),
            CompressionAlgorithm::None => len,
        }
    }

    /// Inverse of [`CompressionAlgorithm::compress`]; output larger than
    /// `expected_len` is an error
    pub fn decompress(self, data: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::Zstd => zstd::bulk::decompress(data, expected_len),
            CompressionAlgorithm::None => Ok(data.to_vec()),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::None => write!(f, "none"),
        }
    }
}

/// Hash used for chunk and aggregate checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn digest(self, data: &[u8]) -> Checksum {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn hasher(self) -> ChecksumHasher {
        match self {
            ChecksumAlgorithm::Blake3 => ChecksumHasher::Blake3(Box::new(blake3::Hasher::new())),
            ChecksumAlgorithm::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Incremental hasher for either checksum algorithm
pub enum ChecksumHasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Blake3(h) => {
                h.update(data);
            }
            ChecksumHasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            ChecksumHasher::Blake3(h) => Checksum(h.finalize().as_bytes().to_vec()),
            ChecksumHasher::Sha256(h) => Checksum(h.finalize().to_vec()),
        }
    }
}

/// Digest bytes, serialized as lowercase hex
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(#[serde(with = "hex")] Vec<u8>);

impl Checksum {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

/// Manifest entry for one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Position in the stream, contiguous from 0
    pub sequence_index: u64,
    /// Bytes of delta stream in this chunk
    pub plaintext_size: u64,
    /// Bytes after compression, before encryption
    pub compressed_size: u64,
    /// Bytes of ciphertext including the authentication tag
    pub ciphertext_size: u64,
    /// Checksum of the compressed block before encryption
    pub plaintext_checksum: Checksum,
    /// Checksum of the ciphertext and tag as stored
    pub ciphertext_checksum: Checksum,
}

/// Chunk transform for one backup, configured from its manifest
pub struct ChunkCodec {
    compression: CompressionAlgorithm,
    zstd_level: i32,
    checksum: ChecksumAlgorithm,
    cipher: ChunkCipher,
}

impl ChunkCodec {
    pub fn new(
        compression: CompressionAlgorithm,
        zstd_level: i32,
        checksum: ChecksumAlgorithm,
        cipher: ChunkCipher,
    ) -> Self {
        Self {
            compression,
            zstd_level,
            checksum,
            cipher,
        }
    }

    /// Turn block `index` into a sealed frame and its descriptor
    pub fn encode(&self, index: u64, block: &[u8]) -> Result<(ChunkDescriptor, Vec<u8>)> {
        let compressed = self
            .compression
            .compress(block, self.zstd_level)
            .map_err(|e| Error::ChunkCorrupt {
                index,
                reason: format!("compression failed: {}", e),
            })?;
        let plaintext_checksum = self.checksum.digest(&compressed);
        let sealed = self.cipher.seal(index, &compressed)?;
        let ciphertext_checksum = self.checksum.digest(&sealed);

        let descriptor = ChunkDescriptor {
            sequence_index: index,
            plaintext_size: block.len() as u64,
            compressed_size: compressed.len() as u64,
            ciphertext_size: sealed.len() as u64,
            plaintext_checksum,
            ciphertext_checksum,
        };
        Ok((descriptor, sealed))
    }

    /// Verify and invert a sealed frame.
    ///
    /// Checks run in stream order: ciphertext checksum, authentication tag,
    /// pre-encryption checksum, then decompressed length.
    pub fn decode(&self, descriptor: &ChunkDescriptor, sealed: &[u8]) -> Result<Vec<u8>> {
        let index = descriptor.sequence_index;
        let corrupt = |reason: String| Error::ChunkCorrupt { index, reason };

        if sealed.len() as u64 != descriptor.ciphertext_size {
            return Err(corrupt(format!(
                "ciphertext is {} bytes, manifest says {}",
                sealed.len(),
                descriptor.ciphertext_size
            )));
        }
        if self.checksum.digest(sealed) != descriptor.ciphertext_checksum {
            return Err(corrupt("ciphertext checksum mismatch".to_string()));
        }

        let compressed = self.cipher.open(index, sealed)?;
        if self.checksum.digest(&compressed) != descriptor.plaintext_checksum {
            return Err(corrupt("plaintext checksum mismatch".to_string()));
        }

        let plaintext = self
            .compression
            .decompress(&compressed, descriptor.plaintext_size as usize)
            .map_err(|e| corrupt(format!("decompression failed: {}", e)))?;
        if plaintext.len() as u64 != descriptor.plaintext_size {
            return Err(corrupt(format!(
                "decompressed to {} bytes, manifest says {}",
                plaintext.len(),
                descriptor.plaintext_size
            )));
        }
        Ok(plaintext)
    }
}
