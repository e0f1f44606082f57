//! Archive storage: where sealed frames go and how they are read back.
//!
//! The data artifact is a plain concatenation of frames, each an 8-byte
//! little-endian length followed by ciphertext and tag. Frame sizes are all in
//! the manifest, so a reader can seek straight to any chunk.
//!
//! On disk a backup of `pool/data` at snapshot `2024-01-02` is the pair
//! `pool_data@2024-01-02.zdata` and `pool_data@2024-01-02.manifest.json`.
//! Data is written to `*.zdata_partial`. On seal the manifest is staged
//! first, then the data is renamed and the manifest published last, so a
//! manifest on disk always describes a complete data artifact. A `.zdata`
//! without a manifest is an unsealed leftover.

use crate::manifest::{BackupManifest, FRAME_HEADER_LEN};
use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const DATA_SUFFIX: &str = ".zdata";
const PARTIAL_SUFFIX: &str = ".zdata_partial";
const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Destination for the output of one backup run.
///
/// Nothing written before [`BackupSink::seal`] counts as a backup.
pub trait BackupSink {
    /// Append one frame, length prefix included
    fn append_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Make the data durable and publish `manifest` next to it
    fn seal(&mut self, manifest: &BackupManifest) -> io::Result<()>;
}

impl<S: BackupSink + ?Sized> BackupSink for &mut S {
    fn append_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).append_frame(frame)
    }

    fn seal(&mut self, manifest: &BackupManifest) -> io::Result<()> {
        (**self).seal(manifest)
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(&(frame.len() as u64).to_le_bytes())?;
    writer.write_all(frame)
}

/// Artifact name stem: `/` in the dataset name becomes `_`
pub fn artifact_stem(filesystem: &str, target: &str) -> String {
    format!("{}@{}", filesystem.replace('/', "_"), target)
}

/// Data artifact belonging to a manifest path
pub fn data_path_for(manifest_path: &Path) -> PathBuf {
    let name = manifest_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.strip_suffix(MANIFEST_SUFFIX).unwrap_or(name);
    manifest_path.with_file_name(format!("{}{}", stem, DATA_SUFFIX))
}

/// A directory holding sealed backups
#[derive(Debug, Clone)]
pub struct BackupDestination {
    root: PathBuf,
}

impl BackupDestination {
    /// Open a destination, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(Error::SinkWriteError)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, filesystem: &str, target: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", artifact_stem(filesystem, target), MANIFEST_SUFFIX))
    }

    pub fn data_path(&self, filesystem: &str, target: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", artifact_stem(filesystem, target), DATA_SUFFIX))
    }

    pub fn partial_path(&self, filesystem: &str, target: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", artifact_stem(filesystem, target), PARTIAL_SUFFIX))
    }

    /// Start writing a backup of `filesystem@target`.
    ///
    /// Refuses to replace a sealed backup. Leftovers from an earlier failed
    /// run (a partial artifact, or data whose manifest was never published)
    /// are overwritten.
    pub fn create_sink(&self, filesystem: &str, target: &str) -> Result<DirectorySink> {
        let data_path = self.data_path(filesystem, target);
        let manifest_path = self.manifest_path(filesystem, target);
        if manifest_path.exists() {
            return Err(Error::SinkWriteError(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", manifest_path.display()),
            )));
        }
        if data_path.exists() {
            warn!("Discarding unsealed {}", data_path.display());
            fs::remove_file(&data_path).map_err(Error::SinkWriteError)?;
        }

        let partial_path = self.partial_path(filesystem, target);
        let file = File::create(&partial_path).map_err(Error::SinkWriteError)?;
        debug!("Writing backup data to {}", partial_path.display());

        Ok(DirectorySink {
            writer: BufWriter::new(file),
            partial_path,
            data_path,
            manifest_path,
            bytes_written: 0,
        })
    }

    /// All sealed backups in the destination, oldest first. Unreadable
    /// manifests are skipped with a warning.
    pub fn list(&self) -> Result<Vec<(PathBuf, BackupManifest)>> {
        let mut backups = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Io(io::Error::from(e)))?;
            let path = entry.path();
            let is_manifest = entry.file_type().is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with(MANIFEST_SUFFIX));
            if !is_manifest {
                continue;
            }

            match BackupManifest::load(path) {
                Ok(manifest) => backups.push((path.to_path_buf(), manifest)),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        backups.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        Ok(backups)
    }

    /// Most recent sealed backup of `filesystem`
    pub fn latest_for(&self, filesystem: &str) -> Result<Option<(PathBuf, BackupManifest)>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|(_, manifest)| manifest.filesystem == filesystem)
            .last())
    }
}

/// Sink writing one backup into a [`BackupDestination`]
#[derive(Debug)]
pub struct DirectorySink {
    writer: BufWriter<File>,
    partial_path: PathBuf,
    data_path: PathBuf,
    manifest_path: PathBuf,
    bytes_written: u64,
}

impl DirectorySink {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Where the manifest will be written on seal
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }
}

impl BackupSink for DirectorySink {
    fn append_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        write_frame(&mut self.writer, frame)?;
        self.bytes_written += FRAME_HEADER_LEN + frame.len() as u64;
        Ok(())
    }

    fn seal(&mut self, manifest: &BackupManifest) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let staged = manifest.write_staged(&self.manifest_path).map_err(Error::into_io)?;
        fs::rename(&self.partial_path, &self.data_path)?;
        fs::rename(&staged, &self.manifest_path)?;

        // Persist both renames
        #[cfg(unix)]
        {
            if let Some(dir) = self.manifest_path.parent() {
                File::open(dir)?.sync_all()?;
            }
        }
        debug!("Sealed {}", self.manifest_path.display());
        Ok(())
    }
}

/// In-memory sink, optionally failing once a byte budget is exhausted
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    manifest: Option<BackupManifest>,
    capacity: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that reports a full device after `capacity` bytes
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// The sealed manifest, if the backup completed
    pub fn manifest(&self) -> Option<&BackupManifest> {
        self.manifest.as_ref()
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<BackupManifest>) {
        (self.data, self.manifest)
    }
}

impl BackupSink for MemorySink {
    fn append_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let needed = FRAME_HEADER_LEN as usize + frame.len();
        if let Some(capacity) = self.capacity {
            if self.data.len() + needed > capacity {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "no space left in sink"));
            }
        }
        write_frame(&mut self.data, frame)
    }

    fn seal(&mut self, manifest: &BackupManifest) -> io::Result<()> {
        self.manifest = Some(manifest.clone());
        Ok(())
    }
}

/// Reads frames back out of a data artifact
#[derive(Debug)]
pub struct ArchiveReader<R> {
    inner: R,
}

impl ArchiveReader<BufReader<File>> {
    /// Open the data artifact next to `manifest_path`
    pub fn open_for_manifest(manifest_path: &Path) -> Result<Self> {
        let data_path = data_path_for(manifest_path);
        let file = OpenOptions::new().read(true).open(&data_path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the frame of chunk `index`, which the manifest says is
    /// `expected_len` bytes. The length prefix must match before the frame
    /// buffer is allocated; a validated manifest keeps `expected_len` within
    /// the compression bound of one chunk.
    pub fn next_frame(&mut self, index: u64, expected_len: u64) -> Result<Vec<u8>> {
        let truncated = |e: io::Error| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::ChunkCorrupt {
                index,
                reason: "archive is truncated".to_string(),
            },
            _ => Error::Io(e),
        };

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.inner.read_exact(&mut header).map_err(truncated)?;
        let len = u64::from_le_bytes(header);
        if len != expected_len {
            return Err(Error::ChunkCorrupt {
                index,
                reason: format!("frame length {} does not match manifest ({})", len, expected_len),
            });
        }

        let mut frame = vec![0u8; len as usize];
        self.inner.read_exact(&mut frame).map_err(truncated)?;
        Ok(frame)
    }

    /// Whether the archive holds no further bytes
    pub fn is_exhausted(&mut self) -> Result<bool> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(true),
                Ok(_) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Position the reader at chunk `k` using the manifest's frame sizes
    pub fn seek_to_chunk(&mut self, manifest: &BackupManifest, k: u64) -> Result<()> {
        let offset = manifest.frame_offset(k).ok_or_else(|| Error::InvalidManifest {
            reason: format!("chunk {} is beyond the {} chunks in the manifest", k, manifest.chunks.len()),
        })?;
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}
