//! Backup pipeline: delta stream in, sealed archive and manifest out.

use crate::archive::BackupSink;
use crate::cancel::CancellationToken;
use crate::chunk::{
    ChecksumAlgorithm, ChunkCodec, ChunkDescriptor, CompressionAlgorithm, DEFAULT_CHUNK_SIZE, DEFAULT_ZSTD_LEVEL,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::crypto::{generate_salt, BackupKey, ChunkCipher};
use crate::manifest::BackupManifest;
use crate::volume::VolumeBinding;
use crate::{Error, Result};
use std::io::{self, Read};
use tracing::{debug, info, span, warn, Level};

/// Configuration for backup operations
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Plaintext bytes per chunk
    pub chunk_size: usize,
    pub compression: CompressionAlgorithm,
    /// zstd level, 1 to 22
    pub zstd_level: i32,
    pub checksum: ChecksumAlgorithm,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: CompressionAlgorithm::default(),
            zstd_level: DEFAULT_ZSTD_LEVEL,
            checksum: ChecksumAlgorithm::default(),
        }
    }
}

impl BackupOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::Configuration {
                reason: format!(
                    "chunk size {} must be between {} and {} bytes",
                    self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
                ),
            });
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(Error::Configuration {
                reason: format!("zstd level {} must be between 1 and 22", self.zstd_level),
            });
        }
        Ok(())
    }
}

/// Which delta to back up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub filesystem: String,
    /// `None` for a full stream
    pub base_snapshot: Option<String>,
    pub target_snapshot: String,
}

impl BackupRequest {
    pub fn full(filesystem: &str, target: &str) -> Self {
        Self {
            filesystem: filesystem.to_string(),
            base_snapshot: None,
            target_snapshot: target.to_string(),
        }
    }

    pub fn incremental(filesystem: &str, base: &str, target: &str) -> Self {
        Self {
            filesystem: filesystem.to_string(),
            base_snapshot: Some(base.to_string()),
            target_snapshot: target.to_string(),
        }
    }
}

/// Progress callback for backup operations
pub trait BackupProgress {
    /// Called after each chunk is written
    fn on_chunk(&mut self, _descriptor: &ChunkDescriptor) {}

    /// Called once the manifest is sealed
    fn on_complete(&mut self, _manifest: &BackupManifest) {}
}

impl BackupProgress for () {}

/// Single-pass, streaming backup: memory use is bounded by the chunk size
#[derive(Debug, Clone, Default)]
pub struct BackupPipeline {
    options: BackupOptions,
    cancel: CancellationToken,
}

impl BackupPipeline {
    pub fn new(options: BackupOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Check `token` between chunks
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    /// Back up `delta` into `sink` and return the sealed manifest
    pub fn backup<R, S>(&self, delta: &mut R, request: &BackupRequest, key: &BackupKey, sink: &mut S) -> Result<BackupManifest>
    where
        R: Read + ?Sized,
        S: BackupSink + ?Sized,
    {
        self.backup_with_progress(delta, request, key, sink, &mut ())
    }

    /// Back up `delta` into `sink`, reporting each chunk to `progress`.
    ///
    /// The manifest is sealed only after the whole stream went through. Any
    /// failure (or cancellation) leaves the sink unsealed.
    pub fn backup_with_progress<R, S>(
        &self,
        delta: &mut R,
        request: &BackupRequest,
        key: &BackupKey,
        sink: &mut S,
        progress: &mut dyn BackupProgress,
    ) -> Result<BackupManifest>
    where
        R: Read + ?Sized,
        S: BackupSink + ?Sized,
    {
        self.options.validate()?;

        let span = span!(
            Level::INFO,
            "backup",
            filesystem = %request.filesystem,
            target = %request.target_snapshot
        );
        let _enter = span.enter();

        match &request.base_snapshot {
            Some(base) => info!("Starting incremental backup from {}", base),
            None => info!("Starting full backup"),
        }

        let mut manifest = BackupManifest::new(
            request.filesystem.clone(),
            request.base_snapshot.clone(),
            request.target_snapshot.clone(),
            self.options.chunk_size as u64,
            self.options.compression,
            self.options.checksum,
            generate_salt(),
        );
        let cipher = ChunkCipher::new(key, &manifest.key_salt, manifest.backup_id);
        let codec = ChunkCodec::new(
            self.options.compression,
            self.options.zstd_level,
            self.options.checksum,
            cipher,
        );

        let mut block = vec![0u8; self.options.chunk_size];
        let mut bytes_read = 0u64;
        let mut index = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                warn!("Backup cancelled after {} chunks; archive left unsealed", index);
                return Err(Error::Cancelled);
            }

            let filled = fill_block(delta, &mut block, &mut bytes_read)
                .map_err(|source| Error::DeltaStreamError { bytes_read, source })?;
            if filled == 0 {
                break;
            }

            let (descriptor, sealed) = codec.encode(index, &block[..filled])?;
            sink.append_frame(&sealed).map_err(Error::SinkWriteError)?;
            debug!(
                "Chunk {}: {} -> {} bytes",
                index, descriptor.plaintext_size, descriptor.ciphertext_size
            );
            progress.on_chunk(&descriptor);
            manifest.push_chunk(descriptor);
            index += 1;

            if filled < block.len() {
                break;
            }
        }

        manifest.seal();
        sink.seal(&manifest).map_err(Error::SinkWriteError)?;
        info!(
            "Backup sealed: {} chunks, {} bytes of delta, {} bytes stored",
            manifest.chunks.len(),
            manifest.total_plaintext_size,
            manifest.data_len()
        );
        progress.on_complete(&manifest);
        Ok(manifest)
    }

    /// Open the delta for `request` on `binding` and back it up into `sink`
    pub fn backup_from_volume<S>(
        &self,
        binding: &dyn VolumeBinding,
        request: &BackupRequest,
        key: &BackupKey,
        sink: &mut S,
        progress: &mut dyn BackupProgress,
    ) -> Result<BackupManifest>
    where
        S: BackupSink + ?Sized,
    {
        let mut delta = binding.compute_delta(
            &request.filesystem,
            request.base_snapshot.as_deref(),
            &request.target_snapshot,
        )?;
        self.backup_with_progress(&mut delta, request, key, sink, progress)
    }
}

/// Read until `block` is full or the stream ends; only the final block of a
/// stream comes back short
fn fill_block<R: Read + ?Sized>(reader: &mut R, block: &mut [u8], bytes_read: &mut u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                *bytes_read += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
