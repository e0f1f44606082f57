//! Restore pipeline: verify, decrypt and decompress an archive back into the
//! delta stream it was made from.
//!
//! Every failure is fatal and stops at the first bad chunk. The aggregate
//! checksum, and the absence of trailing bytes, are checked once the last
//! chunk has been read, so a stream is only known good once it has been
//! consumed to the end.

use crate::archive::ArchiveReader;
use crate::chunk::{Checksum, ChecksumHasher, ChunkCodec, DEFAULT_ZSTD_LEVEL};
use crate::crypto::{BackupKey, ChunkCipher};
use crate::manifest::BackupManifest;
use crate::volume::{VolumeBinding, VolumeError};
use crate::{Error, Result};
use std::io::{self, Read, Seek};
use tracing::{debug, info, span, Level};

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub chunks: u64,
    /// Bytes of delta stream reconstructed
    pub plaintext_bytes: u64,
    /// Bytes of ciphertext checked, tags included
    pub ciphertext_bytes: u64,
    pub aggregate_checksum: Checksum,
}

/// Decodes the chunks of one archive
pub struct RestorePipeline {
    manifest: BackupManifest,
    codec: ChunkCodec,
}

impl RestorePipeline {
    /// Prepare to restore `manifest` with `key`; the manifest is checked
    /// structurally first
    pub fn new(manifest: BackupManifest, key: &BackupKey) -> Result<Self> {
        manifest.validate()?;
        let cipher = ChunkCipher::new(key, &manifest.key_salt, manifest.backup_id);
        let codec = ChunkCodec::new(manifest.compression, DEFAULT_ZSTD_LEVEL, manifest.checksum, cipher);
        Ok(Self { manifest, codec })
    }

    pub fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    /// Lazily reconstruct the delta stream from `archive`
    pub fn stream<R: Read>(self, archive: R) -> RestoreStream<R> {
        let hasher = self.manifest.checksum.hasher();
        RestoreStream {
            pipeline: self,
            reader: ArchiveReader::new(archive),
            next_index: 0,
            hasher: Some(hasher),
            done: false,
            buffer: Vec::new(),
            position: 0,
            plaintext_bytes: 0,
        }
    }

    /// Decode chunk `k` alone, seeking past the frames before it
    pub fn read_chunk<R: Read + Seek>(&self, archive: &mut ArchiveReader<R>, k: u64) -> Result<Vec<u8>> {
        archive.seek_to_chunk(&self.manifest, k)?;
        let descriptor = &self.manifest.chunks[k as usize];
        let frame = archive.next_frame(k, descriptor.ciphertext_size)?;
        self.codec.decode(descriptor, &frame)
    }

    /// Run the whole pipeline over `archive`, discarding the output
    pub fn verify<R: Read>(self, archive: R) -> Result<VerifyReport> {
        let span = span!(Level::INFO, "verify", backup = %self.manifest.backup_id);
        let _enter = span.enter();

        let chunks = self.manifest.chunks.len() as u64;
        let ciphertext_bytes = self.manifest.total_ciphertext_size();
        let aggregate_checksum = self.manifest.aggregate_checksum.clone();

        let mut stream = self.stream(archive);
        let mut plaintext_bytes = 0u64;
        for chunk in &mut stream {
            plaintext_bytes += chunk?.len() as u64;
        }

        info!("Verified {} chunks, {} bytes", chunks, plaintext_bytes);
        Ok(VerifyReport {
            chunks,
            plaintext_bytes,
            ciphertext_bytes,
            aggregate_checksum,
        })
    }
}

/// Reconstructed delta stream.
///
/// As an iterator it yields one decoded chunk at a time with typed errors. As
/// a reader, errors arrive wrapped in `io::Error`; [`Error::from_io`] recovers
/// them.
pub struct RestoreStream<R> {
    pipeline: RestorePipeline,
    reader: ArchiveReader<R>,
    next_index: u64,
    hasher: Option<ChecksumHasher>,
    done: bool,
    buffer: Vec<u8>,
    position: usize,
    plaintext_bytes: u64,
}

impl<R: Read> RestoreStream<R> {
    pub fn manifest(&self) -> &BackupManifest {
        &self.pipeline.manifest
    }

    /// Bytes of delta stream produced so far
    pub fn plaintext_bytes(&self) -> u64 {
        self.plaintext_bytes
    }

    fn next_chunk(&mut self) -> Result<Vec<u8>> {
        let index = self.next_index;
        let descriptor = &self.pipeline.manifest.chunks[index as usize];
        let frame = self.reader.next_frame(index, descriptor.ciphertext_size)?;
        let plaintext = self.pipeline.codec.decode(descriptor, &frame)?;

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(descriptor.plaintext_checksum.as_bytes());
        }
        debug!("Restored chunk {} ({} bytes)", index, plaintext.len());
        self.next_index += 1;
        self.plaintext_bytes += plaintext.len() as u64;
        Ok(plaintext)
    }

    /// Checks that only make sense after the last chunk
    fn finish(&mut self) -> Result<()> {
        if !self.reader.is_exhausted()? {
            return Err(Error::ManifestTampered {
                reason: "archive has data beyond the last chunk".to_string(),
            });
        }

        let algorithm = self.pipeline.manifest.checksum;
        let seen = self
            .hasher
            .take()
            .unwrap_or_else(|| algorithm.hasher())
            .finalize();
        if seen != self.pipeline.manifest.aggregate_checksum {
            return Err(Error::ManifestTampered {
                reason: format!(
                    "aggregate checksum {} does not match manifest {}",
                    seen, self.pipeline.manifest.aggregate_checksum
                ),
            });
        }
        Ok(())
    }
}

impl<R: Read> Iterator for RestoreStream<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = if self.next_index < self.pipeline.manifest.chunks.len() as u64 {
            self.next_chunk().map(Some)
        } else {
            self.done = true;
            self.finish().map(|_| None)
        };

        match result {
            Ok(chunk) => chunk.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> Read for RestoreStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position == self.buffer.len() {
            match self.next() {
                Some(Ok(chunk)) => {
                    self.buffer = chunk;
                    self.position = 0;
                }
                Some(Err(e)) => return Err(e.into_io()),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.buffer.len() - self.position);
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

/// Reconstruct the delta stream of `manifest` from `archive`
pub fn restore<R: Read>(manifest: BackupManifest, archive: R, key: &BackupKey) -> Result<RestoreStream<R>> {
    Ok(RestorePipeline::new(manifest, key)?.stream(archive))
}

/// Verify `archive` against `manifest` without producing output
pub fn verify<R: Read>(manifest: BackupManifest, archive: R, key: &BackupKey) -> Result<VerifyReport> {
    RestorePipeline::new(manifest, key)?.verify(archive)
}

/// Replay a restore stream into `filesystem` through the volume binding.
///
/// Integrity failures inside the stream come back as their own variants
/// rather than as a generic volume error.
pub fn restore_into_volume<R: Read>(
    binding: &dyn VolumeBinding,
    filesystem: &str,
    mut stream: RestoreStream<R>,
) -> Result<u64> {
    let span = span!(Level::INFO, "restore", filesystem = %filesystem);
    let _enter = span.enter();

    info!(
        "Replaying {}@{} into {}",
        stream.manifest().filesystem,
        stream.manifest().target_snapshot,
        filesystem
    );
    binding
        .apply_delta(filesystem, &mut stream)
        .map_err(|e| match e {
            VolumeError::Io(io_err) => Error::from_io(io_err),
            other => Error::Volume(other),
        })?;
    Ok(stream.plaintext_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemorySink;
    use crate::backup::{BackupOptions, BackupPipeline, BackupRequest};
    use crate::volume::MemoryVolume;
    use std::io::Cursor;

    fn key() -> BackupKey {
        BackupKey::from_bytes([11u8; 32])
    }

    fn backed_up(data: &[u8]) -> (BackupManifest, Vec<u8>) {
        let options = BackupOptions {
            chunk_size: 4096,
            ..Default::default()
        };
        let mut sink = MemorySink::new();
        let manifest = BackupPipeline::new(options)
            .backup(&mut Cursor::new(data.to_vec()), &BackupRequest::full("tank", "a"), &key(), &mut sink)
            .unwrap();
        (manifest, sink.into_parts().0)
    }

    fn sample() -> Vec<u8> {
        (0..20_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_via_read() -> Result<()> {
        let data = sample();
        let (manifest, archive) = backed_up(&data);

        let mut out = Vec::new();
        restore(manifest, Cursor::new(archive), &key())?.read_to_end(&mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_verify_report() -> Result<()> {
        let (manifest, archive) = backed_up(&sample());
        let report = verify(manifest.clone(), Cursor::new(archive), &key())?;
        assert_eq!(report.chunks, 5);
        assert_eq!(report.plaintext_bytes, 20_000);
        assert_eq!(report.aggregate_checksum, manifest.aggregate_checksum);
        Ok(())
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let (manifest, archive) = backed_up(&sample());
        let result = verify(manifest, Cursor::new(archive), &BackupKey::from_bytes([12u8; 32]));
        assert!(matches!(result, Err(Error::AuthenticationFailed { index: 0 })));
    }

    #[test]
    fn test_altered_descriptor_fails_before_later_chunks() {
        let (mut manifest, archive) = backed_up(&sample());
        manifest.chunks[1].ciphertext_checksum = manifest.chunks[2].ciphertext_checksum.clone();

        let mut stream = restore(manifest, Cursor::new(archive), &key()).unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(matches!(stream.next(), Some(Err(Error::ChunkCorrupt { index: 1, .. }))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_aggregate_mismatch_is_tampering() {
        let (mut manifest, archive) = backed_up(&sample());
        manifest.aggregate_checksum = manifest.checksum.digest(b"forged");
        assert!(matches!(
            verify(manifest, Cursor::new(archive), &key()),
            Err(Error::ManifestTampered { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_tampering() {
        let (manifest, mut archive) = backed_up(&sample());
        archive.extend_from_slice(b"extra");
        assert!(matches!(
            verify(manifest, Cursor::new(archive), &key()),
            Err(Error::ManifestTampered { .. })
        ));
    }

    #[test]
    fn test_dropped_chunk_is_tampering() {
        let (mut manifest, archive) = backed_up(&sample());
        manifest.chunks.remove(2);
        assert!(matches!(
            RestorePipeline::new(manifest, &key()),
            Err(Error::ManifestTampered { .. })
        ));
    }

    #[test]
    fn test_read_error_recovers_typed_variant() {
        let (manifest, mut archive) = backed_up(&sample());
        let last = archive.len() - 1;
        archive[last] ^= 0x80;

        let mut out = Vec::new();
        let err = restore(manifest, Cursor::new(archive), &key())
            .unwrap()
            .read_to_end(&mut out)
            .unwrap_err();
        assert!(Error::from_io(err).is_integrity_failure());
    }

    #[test]
    fn test_read_single_chunk() -> Result<()> {
        let data = sample();
        let (manifest, archive) = backed_up(&data);
        let pipeline = RestorePipeline::new(manifest, &key())?;

        let mut reader = ArchiveReader::new(Cursor::new(archive));
        assert_eq!(pipeline.read_chunk(&mut reader, 3)?, &data[3 * 4096..4 * 4096]);
        assert_eq!(pipeline.read_chunk(&mut reader, 0)?, &data[..4096]);
        assert!(matches!(pipeline.read_chunk(&mut reader, 9), Err(Error::InvalidManifest { .. })));
        Ok(())
    }

    #[test]
    fn test_restore_into_volume() -> Result<()> {
        let data = sample();
        let (manifest, archive) = backed_up(&data);
        let vol = MemoryVolume::new();

        let stream = restore(manifest, Cursor::new(archive), &key())?;
        let written = restore_into_volume(&vol, "tank/restored", stream)?;

        assert_eq!(written, data.len() as u64);
        assert_eq!(vol.received_streams("tank/restored"), vec![data]);
        Ok(())
    }

    #[test]
    fn test_restore_into_volume_surfaces_corruption() {
        let (manifest, mut archive) = backed_up(&sample());
        archive[20] ^= 1;
        let vol = MemoryVolume::new();

        let stream = restore(manifest, Cursor::new(archive), &key()).unwrap();
        let err = restore_into_volume(&vol, "tank/restored", stream).unwrap_err();
        assert!(matches!(err, Error::ChunkCorrupt { index: 0, .. }));
        assert!(vol.received_streams("tank/restored").is_empty());
    }
}
