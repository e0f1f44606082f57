//! Backup manifest: the metadata artifact describing one sealed archive

use crate::chunk::{
    Checksum, ChecksumAlgorithm, ChunkDescriptor, CompressionAlgorithm, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::crypto::{EncryptionAlgorithm, SALT_LEN, TAG_LEN};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Manifest format version
pub const FORMAT_VERSION: u32 = 1;

/// Bytes of length prefix in front of every frame in the data artifact
pub const FRAME_HEADER_LEN: u64 = 8;

/// Describes one backup archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    /// Unique per backup; bound into every chunk's authentication data
    pub backup_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Source filesystem (dataset)
    pub filesystem: String,
    /// Snapshot the delta starts from; `None` for a full stream
    pub base_snapshot: Option<String>,
    pub target_snapshot: String,
    /// Nominal plaintext bytes per chunk
    pub chunk_size: u64,
    pub compression: CompressionAlgorithm,
    pub encryption: EncryptionAlgorithm,
    pub checksum: ChecksumAlgorithm,
    /// Salt the chunk key is derived with
    #[serde(with = "hex")]
    pub key_salt: [u8; SALT_LEN],
    pub chunks: Vec<ChunkDescriptor>,
    /// Length of the delta stream
    pub total_plaintext_size: u64,
    /// Checksum over the concatenated plaintext checksums in sequence order
    pub aggregate_checksum: Checksum,
}

/// Checksum over the concatenation of the given chunk checksums.
///
/// Defined for the empty sequence: the digest of no bytes.
pub fn aggregate_of<'a, I>(algorithm: ChecksumAlgorithm, checksums: I) -> Checksum
where
    I: IntoIterator<Item = &'a Checksum>,
{
    let mut hasher = algorithm.hasher();
    for checksum in checksums {
        hasher.update(checksum.as_bytes());
    }
    hasher.finalize()
}

impl BackupManifest {
    /// Start an unsealed manifest with no chunks
    pub fn new(
        filesystem: String,
        base_snapshot: Option<String>,
        target_snapshot: String,
        chunk_size: u64,
        compression: CompressionAlgorithm,
        checksum: ChecksumAlgorithm,
        key_salt: [u8; SALT_LEN],
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backup_id: Uuid::new_v4(),
            created_at: Utc::now(),
            filesystem,
            base_snapshot,
            target_snapshot,
            chunk_size,
            compression,
            encryption: EncryptionAlgorithm::default(),
            aggregate_checksum: aggregate_of(checksum, std::iter::empty::<&Checksum>()),
            checksum,
            key_salt,
            chunks: Vec::new(),
            total_plaintext_size: 0,
        }
    }

    /// Record the next chunk
    pub fn push_chunk(&mut self, descriptor: ChunkDescriptor) {
        self.total_plaintext_size += descriptor.plaintext_size;
        self.chunks.push(descriptor);
    }

    /// Fix the aggregate checksum over the recorded chunks
    pub fn seal(&mut self) {
        self.aggregate_checksum = self.compute_aggregate();
    }

    pub fn compute_aggregate(&self) -> Checksum {
        aggregate_of(self.checksum, self.chunks.iter().map(|c| &c.plaintext_checksum))
    }

    pub fn is_incremental(&self) -> bool {
        self.base_snapshot.is_some()
    }

    /// Total length of the data artifact, frame headers included
    pub fn data_len(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| FRAME_HEADER_LEN + c.ciphertext_size)
            .sum()
    }

    /// Offset of chunk `k`'s frame within the data artifact
    pub fn frame_offset(&self, k: u64) -> Option<u64> {
        if k >= self.chunks.len() as u64 {
            return None;
        }
        Some(
            self.chunks[..k as usize]
                .iter()
                .map(|c| FRAME_HEADER_LEN + c.ciphertext_size)
                .sum(),
        )
    }

    pub fn total_ciphertext_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.ciphertext_size).sum()
    }

    /// Structural checks that need no data: version, chunk size and a chunk
    /// list that is contiguous and self-consistent.
    ///
    /// The aggregate checksum is left to restore, which compares it against
    /// the chunk checksums it actually verified.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::InvalidManifest {
                reason: format!(
                    "Unsupported manifest version: {} (expected {})",
                    self.format_version, FORMAT_VERSION
                ),
            });
        }
        if self.chunk_size < MIN_CHUNK_SIZE as u64 || self.chunk_size > MAX_CHUNK_SIZE as u64 {
            return Err(Error::InvalidManifest {
                reason: format!("chunk size {} is out of range", self.chunk_size),
            });
        }

        let tampered = |reason: String| Error::ManifestTampered { reason };
        let max_compressed = self.compression.compressed_bound(self.chunk_size as usize) as u64;
        let last = self.chunks.len().saturating_sub(1);
        let mut total = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.sequence_index != i as u64 {
                return Err(tampered(format!(
                    "chunk at position {} has sequence index {}",
                    i, chunk.sequence_index
                )));
            }
            let size_ok = if i == last {
                chunk.plaintext_size > 0 && chunk.plaintext_size <= self.chunk_size
            } else {
                chunk.plaintext_size == self.chunk_size
            };
            if !size_ok {
                return Err(tampered(format!(
                    "chunk {} claims {} plaintext bytes with chunk size {}",
                    i, chunk.plaintext_size, self.chunk_size
                )));
            }
            if chunk.compressed_size > max_compressed {
                return Err(tampered(format!(
                    "chunk {} claims {} compressed bytes, more than {} can produce from {} bytes",
                    i, chunk.compressed_size, self.compression, self.chunk_size
                )));
            }
            if chunk.ciphertext_size != chunk.compressed_size + TAG_LEN as u64 {
                return Err(tampered(format!(
                    "chunk {} ciphertext size {} does not match compressed size {}",
                    i, chunk.ciphertext_size, chunk.compressed_size
                )));
            }
            total += chunk.plaintext_size;
        }

        if total != self.total_plaintext_size {
            return Err(tampered(format!(
                "chunks hold {} bytes but the manifest claims {}",
                total, self.total_plaintext_size
            )));
        }
        Ok(())
    }

    /// Write the manifest atomically: temporary file, fsync, rename
    pub fn save<P: AsRef<Path>>(&self, manifest_path: P) -> Result<()> {
        let manifest_path = manifest_path.as_ref();
        let temp_path = self.write_staged(manifest_path)?;
        fs::rename(&temp_path, manifest_path)?;
        Ok(())
    }

    /// Write and fsync the manifest next to `manifest_path` without
    /// publishing it. Returns the staged path, ready to be renamed into place.
    pub fn write_staged(&self, manifest_path: &Path) -> Result<PathBuf> {
        let temp_path = temp_path_for(manifest_path);

        let manifest_json = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&manifest_json)?;
        file.sync_all()?;
        Ok(temp_path)
    }

    /// Load and structurally validate a manifest
    pub fn load<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        let file = File::open(&manifest_path).map_err(|_| Error::ManifestNotFound {
            path: manifest_path.as_ref().display().to_string(),
        })?;

        let reader = BufReader::new(file);
        let manifest: BackupManifest = serde_json::from_reader(reader).map_err(|e| Error::InvalidManifest {
            reason: format!("{}: {}", manifest_path.as_ref().display(), e),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }
}

pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn descriptor(index: u64, plaintext_size: u64) -> ChunkDescriptor {
        let sum = ChecksumAlgorithm::Blake3.digest(&index.to_le_bytes());
        ChunkDescriptor {
            sequence_index: index,
            plaintext_size,
            compressed_size: 100,
            ciphertext_size: 100 + TAG_LEN as u64,
            plaintext_checksum: sum.clone(),
            ciphertext_checksum: sum,
        }
    }

    fn manifest_with(sizes: &[u64]) -> BackupManifest {
        let mut manifest = BackupManifest::new(
            "tank/home".to_string(),
            Some("2024-01-01".to_string()),
            "2024-01-02".to_string(),
            4096,
            CompressionAlgorithm::Zstd,
            ChecksumAlgorithm::Blake3,
            [5u8; SALT_LEN],
        );
        for (i, &size) in sizes.iter().enumerate() {
            manifest.push_chunk(descriptor(i as u64, size));
        }
        manifest.seal();
        manifest
    }

    #[test]
    fn test_empty_aggregate_is_defined() {
        let manifest = manifest_with(&[]);
        assert_eq!(manifest.aggregate_checksum, ChecksumAlgorithm::Blake3.digest(b""));
        manifest.validate().unwrap();
    }

    #[test]
    fn test_aggregate_covers_chunk_order() {
        let manifest = manifest_with(&[4096, 10]);
        let mut swapped = manifest.chunks.clone();
        swapped.swap(0, 1);
        let reordered = aggregate_of(ChecksumAlgorithm::Blake3, swapped.iter().map(|c| &c.plaintext_checksum));
        assert_ne!(reordered, manifest.aggregate_checksum);
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("tank_home@2024-01-02.manifest.json");
        let manifest = manifest_with(&[4096, 4096, 7]);

        manifest.save(&path)?;
        assert!(!temp_path_for(&path).exists());

        let loaded = BackupManifest::load(&path)?;
        assert_eq!(loaded, manifest);
        Ok(())
    }

    #[test]
    fn test_salt_and_checksums_are_hex_in_json() {
        let manifest = manifest_with(&[3]);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["key_salt"], "05".repeat(SALT_LEN));
        assert_eq!(json["compression"], "zstd");
        assert_eq!(json["encryption"], "chacha20poly1305");
        assert!(json["aggregate_checksum"].is_string());
    }

    #[test]
    fn test_missing_manifest() {
        let result = BackupManifest::load("/nonexistent/backup.manifest.json");
        assert!(matches!(result, Err(Error::ManifestNotFound { .. })));
    }

    #[test]
    fn test_validate_rejects_gaps_and_bad_sizes() {
        let mut gap = manifest_with(&[4096, 4096, 1]);
        gap.chunks.remove(1);
        gap.total_plaintext_size = 4097;
        assert!(matches!(gap.validate(), Err(Error::ManifestTampered { .. })));

        let short_middle = manifest_with(&[100, 4096]);
        assert!(matches!(short_middle.validate(), Err(Error::ManifestTampered { .. })));

        let mut wrong_total = manifest_with(&[4096, 1]);
        wrong_total.total_plaintext_size = 5;
        assert!(matches!(wrong_total.validate(), Err(Error::ManifestTampered { .. })));

        let mut future = manifest_with(&[1]);
        future.format_version = 99;
        assert!(matches!(future.validate(), Err(Error::InvalidManifest { .. })));
    }

    #[test]
    fn test_validate_bounds_frame_sizes() {
        let mut huge = manifest_with(&[4096, 7]);
        huge.chunks[0].compressed_size = 1 << 46;
        huge.chunks[0].ciphertext_size = (1 << 46) + TAG_LEN as u64;
        assert!(matches!(huge.validate(), Err(Error::ManifestTampered { .. })));

        let bound = CompressionAlgorithm::Zstd.compressed_bound(4096) as u64;
        let mut at_bound = manifest_with(&[4096, 7]);
        at_bound.chunks[0].compressed_size = bound;
        at_bound.chunks[0].ciphertext_size = bound + TAG_LEN as u64;
        at_bound.validate().unwrap();

        let mut stored = manifest_with(&[4096, 7]);
        stored.compression = CompressionAlgorithm::None;
        stored.chunks[1].compressed_size = 4097;
        stored.chunks[1].ciphertext_size = 4097 + TAG_LEN as u64;
        assert!(matches!(stored.validate(), Err(Error::ManifestTampered { .. })));
    }

    #[test]
    fn test_frame_offsets() {
        let manifest = manifest_with(&[4096, 4096, 1]);
        let frame = FRAME_HEADER_LEN + 100 + TAG_LEN as u64;
        assert_eq!(manifest.frame_offset(0), Some(0));
        assert_eq!(manifest.frame_offset(2), Some(2 * frame));
        assert_eq!(manifest.frame_offset(3), None);
        assert_eq!(manifest.data_len(), 3 * frame);
    }
}
