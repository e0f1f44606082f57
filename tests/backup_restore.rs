//! Backup to a destination directory and restore from it again.

use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tempfile::TempDir;
use zsnapmgr::archive::{data_path_for, ArchiveReader, BackupDestination};
use zsnapmgr::backup::{BackupOptions, BackupPipeline, BackupRequest};
use zsnapmgr::chunk::ChecksumAlgorithm;
use zsnapmgr::crypto::{BackupKey, TAG_LEN};
use zsnapmgr::manifest::BackupManifest;
use zsnapmgr::restore::{self, restore_into_volume, RestorePipeline};
use zsnapmgr::{Error, MemoryVolume, Result};

const CHUNK: usize = 4096;

fn key() -> BackupKey {
    BackupKey::from_bytes([0x42; 32])
}

fn pipeline() -> BackupPipeline {
    BackupPipeline::new(BackupOptions {
        chunk_size: CHUNK,
        ..BackupOptions::default()
    })
}

/// Pseudo-random but repeatable payload that zstd cannot squash to nothing
fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            if i % 3 == 0 {
                b'z'
            } else {
                state as u8
            }
        })
        .collect()
}

fn volume_with_history() -> MemoryVolume {
    let volume = MemoryVolume::new();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    volume.add_snapshot_with_payload("pool/data", "2024-01-01", base, 0, payload(3 * CHUNK));
    volume.add_snapshot_with_payload(
        "pool/data",
        "2024-01-02",
        base + Duration::days(1),
        0,
        payload(5 * CHUNK + 17),
    );
    volume
}

fn back_up(volume: &MemoryVolume, destination: &BackupDestination, request: &BackupRequest) -> Result<BackupManifest> {
    let mut sink = destination.create_sink(&request.filesystem, &request.target_snapshot)?;
    pipeline().backup_from_volume(volume, request, &key(), &mut sink, &mut ())
}

fn read_all(manifest_path: &Path) -> Result<Vec<u8>> {
    let manifest = BackupManifest::load(manifest_path)?;
    let archive = BufReader::new(File::open(data_path_for(manifest_path))?);
    let mut stream = restore::restore(manifest, archive, &key())?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).map_err(Error::from_io)?;
    Ok(out)
}

#[test]
fn incremental_backup_round_trips_through_a_directory() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();

    back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-01"))?;
    let request = BackupRequest::incremental("pool/data", "2024-01-01", "2024-01-02");
    let manifest = back_up(&volume, &destination, &request)?;

    let manifest_path = destination.manifest_path("pool/data", "2024-01-02");
    assert!(manifest_path.exists());
    assert!(destination.data_path("pool/data", "2024-01-02").exists());
    assert!(!destination.partial_path("pool/data", "2024-01-02").exists());

    let expected = volume
        .expected_delta("pool/data", Some("2024-01-01"), "2024-01-02")
        .unwrap();
    assert_eq!(manifest.total_plaintext_size, expected.len() as u64);
    assert_eq!(read_all(&manifest_path)?, expected);

    let (_, latest) = destination.latest_for("pool/data")?.unwrap();
    assert_eq!(latest.target_snapshot, "2024-01-02");
    assert_eq!(destination.list()?.len(), 2);
    Ok(())
}

#[test]
fn restore_replays_into_the_volume() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let manifest = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"))?;

    let archive = File::open(destination.data_path("pool/data", "2024-01-02"))?;
    let stream = restore::restore(manifest, BufReader::new(archive), &key())?;
    let replica = MemoryVolume::new();
    let written = restore_into_volume(&replica, "backup/data", stream)?;

    let expected = volume.expected_delta("pool/data", None, "2024-01-02").unwrap();
    assert_eq!(written, expected.len() as u64);
    assert_eq!(replica.received_streams("backup/data"), vec![expected]);
    Ok(())
}

#[test]
fn sealed_backups_are_never_overwritten() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let request = BackupRequest::full("pool/data", "2024-01-01");

    back_up(&volume, &destination, &request)?;
    let before = fs::read(destination.data_path("pool/data", "2024-01-01"))?;

    assert!(matches!(
        destination.create_sink("pool/data", "2024-01-01"),
        Err(Error::SinkWriteError(_))
    ));
    assert_eq!(fs::read(destination.data_path("pool/data", "2024-01-01"))?, before);
    Ok(())
}

#[test]
fn interrupted_delta_leaves_no_manifest() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    volume.fail_delta_after(2 * CHUNK as u64 + 10);

    let result = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"));
    assert!(matches!(
        result,
        Err(Error::DeltaStreamError { bytes_read, .. }) if bytes_read == 2 * CHUNK as u64 + 10
    ));

    assert!(destination.partial_path("pool/data", "2024-01-02").exists());
    assert!(!destination.manifest_path("pool/data", "2024-01-02").exists());
    assert!(destination.list()?.is_empty());
    Ok(())
}

#[test]
fn flipped_bit_in_data_is_detected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"))?;

    let data_path = destination.data_path("pool/data", "2024-01-02");
    let mut data = fs::read(&data_path)?;
    let middle = data.len() / 2;
    data[middle] ^= 0x10;
    fs::write(&data_path, &data)?;

    let err = read_all(&destination.manifest_path("pool/data", "2024-01-02")).unwrap_err();
    assert!(
        matches!(err, Error::ChunkCorrupt { .. } | Error::AuthenticationFailed { .. }),
        "unexpected error: {}",
        err
    );
    Ok(())
}

#[test]
fn altered_descriptor_checksum_fails_at_that_chunk() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let manifest = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"))?;
    assert!(manifest.chunks.len() > 3);

    let manifest_path = destination.manifest_path("pool/data", "2024-01-02");
    let mut tampered = manifest.clone();
    tampered.chunks[1].plaintext_checksum = ChecksumAlgorithm::Blake3.digest(b"not this chunk");
    tampered.save(&manifest_path)?;

    let manifest = BackupManifest::load(&manifest_path)?;
    let archive = BufReader::new(File::open(data_path_for(&manifest_path))?);
    let mut stream = restore::restore(manifest, archive, &key())?;

    assert!(stream.next().unwrap().is_ok());
    assert!(matches!(stream.next(), Some(Err(Error::ChunkCorrupt { index: 1, .. }))));
    assert!(stream.next().is_none());
    Ok(())
}

#[test]
fn oversized_frame_claim_is_rejected_before_reading() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let mut manifest = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"))?;

    // Manifest and length prefix agree on a 64 TiB frame
    let claimed = 1u64 << 46;
    manifest.chunks[0].ciphertext_size = claimed;
    manifest.chunks[0].compressed_size = claimed - TAG_LEN as u64;
    let data_path = destination.data_path("pool/data", "2024-01-02");
    let mut data = fs::read(&data_path)?;
    data[..8].copy_from_slice(&claimed.to_le_bytes());
    fs::write(&data_path, &data)?;

    let archive = BufReader::new(File::open(&data_path)?);
    assert!(matches!(
        restore::restore(manifest, archive, &key()),
        Err(Error::ManifestTampered { .. })
    ));
    Ok(())
}

#[test]
fn wrong_key_fails_authentication() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let manifest = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-01"))?;

    let archive = BufReader::new(File::open(destination.data_path("pool/data", "2024-01-01"))?);
    let result = restore::verify(manifest, archive, &BackupKey::from_bytes([0x43; 32]));
    assert!(matches!(result, Err(Error::AuthenticationFailed { index: 0 })));
    Ok(())
}

#[test]
fn single_chunk_is_readable_by_seeking() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let destination = BackupDestination::new(temp_dir.path())?;
    let volume = volume_with_history();
    let manifest = back_up(&volume, &destination, &BackupRequest::full("pool/data", "2024-01-02"))?;
    let expected = volume.expected_delta("pool/data", None, "2024-01-02").unwrap();

    let manifest_path = destination.manifest_path("pool/data", "2024-01-02");
    let mut archive = ArchiveReader::open_for_manifest(&manifest_path)?;
    let pipeline = RestorePipeline::new(manifest.clone(), &key())?;

    let last = manifest.chunks.len() as u64 - 1;
    let chunk = pipeline.read_chunk(&mut archive, last)?;
    assert_eq!(chunk, &expected[last as usize * CHUNK..]);

    let chunk = pipeline.read_chunk(&mut archive, 2)?;
    assert_eq!(chunk, &expected[2 * CHUNK..3 * CHUNK]);
    Ok(())
}

#[test]
fn key_file_round_trip_restores() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let key_path = temp_dir.path().join("backup.key");
    let generated = BackupKey::generate();
    generated.write_key_file(&key_path)?;
    let loaded = BackupKey::from_file(&key_path)?;

    let volume = volume_with_history();
    let destination = BackupDestination::new(temp_dir.path().join("dest"))?;
    let request = BackupRequest::full("pool/data", "2024-01-01");
    let mut sink = destination.create_sink(&request.filesystem, &request.target_snapshot)?;
    let manifest = pipeline().backup_from_volume(&volume, &request, &generated, &mut sink, &mut ())?;

    let archive = BufReader::new(File::open(destination.data_path("pool/data", "2024-01-01"))?);
    let report = restore::verify(manifest, archive, &loaded)?;
    assert_eq!(report.chunks, 4);
    Ok(())
}
