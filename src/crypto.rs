//! Backup key material and per-chunk authenticated encryption.
//!
//! Each backup draws a fresh random salt and derives its own chunk key from
//! the master key and that salt, so the sequence-index nonces of one backup
//! never meet the same key as those of another.

use crate::{Error, Result};
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Master key length in bytes
pub const KEY_LEN: usize = 32;

/// Per-backup salt length in bytes
pub const SALT_LEN: usize = 32;

/// Poly1305 tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

const NONCE_LEN: usize = 12;
const CHUNK_KEY_CONTEXT: &str = "zsnapmgr 2024-06-01 backup chunk key v1";

/// Authenticated cipher recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[default]
    #[serde(rename = "chacha20poly1305")]
    ChaCha20Poly1305,
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionAlgorithm::ChaCha20Poly1305 => write!(f, "chacha20poly1305"),
        }
    }
}

/// 256-bit master key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupKey([u8; KEY_LEN]);

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupKey(..)")
    }
}

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the operating system RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse key file contents: 64 hex characters (surrounding whitespace
    /// allowed) or exactly 32 raw bytes
    pub fn parse(contents: &[u8]) -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];

        let text = std::str::from_utf8(contents).map(str::trim).ok();
        match text {
            Some(hex_text) if hex_text.len() == KEY_LEN * 2 => {
                hex::decode_to_slice(hex_text, &mut bytes).map_err(|e| Error::KeyMaterial {
                    reason: format!("key is not valid hex: {}", e),
                })?;
            }
            _ if contents.len() == KEY_LEN => bytes.copy_from_slice(contents),
            _ => {
                return Err(Error::KeyMaterial {
                    reason: format!(
                        "expected {} hex characters or {} raw bytes, found {} bytes",
                        KEY_LEN * 2,
                        KEY_LEN,
                        contents.len()
                    ),
                })
            }
        }
        Ok(Self(bytes))
    }

    /// Load a key from a file written by [`BackupKey::write_key_file`] or
    /// holding 32 raw bytes
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut contents = fs::read(path).map_err(|e| Error::KeyMaterial {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let key = Self::parse(&contents);
        contents.zeroize();
        key
    }

    /// Write the key as hex to a new file readable only by its owner
    pub fn write_key_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path.as_ref())?;
        let mut text = hex::encode(self.0);
        text.push('\n');
        let written = file.write_all(text.as_bytes()).and_then(|_| file.sync_all());
        text.zeroize();
        written?;
        Ok(())
    }

    /// Key for the chunks of one backup, derived from this key and `salt`
    fn derive_chunk_key(&self, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
        let mut material = [0u8; KEY_LEN + SALT_LEN];
        material[..KEY_LEN].copy_from_slice(&self.0);
        material[KEY_LEN..].copy_from_slice(salt);
        let derived = blake3::derive_key(CHUNK_KEY_CONTEXT, &material);
        material.zeroize();
        derived
    }
}

/// Fresh random salt for one backup
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Seals and opens the chunks of a single backup.
///
/// The nonce is the chunk's sequence index; the associated data binds the
/// backup id and index so frames cannot be reordered or moved between
/// backups.
pub struct ChunkCipher {
    cipher: ChaCha20Poly1305,
    backup_id: Uuid,
}

impl ChunkCipher {
    pub fn new(key: &BackupKey, salt: &[u8; SALT_LEN], backup_id: Uuid) -> Self {
        let mut chunk_key = key.derive_chunk_key(salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&chunk_key));
        chunk_key.zeroize();
        Self { cipher, backup_id }
    }

    fn nonce(index: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&index.to_le_bytes());
        nonce
    }

    fn associated_data(&self, index: u64) -> [u8; 24] {
        let mut aad = [0u8; 24];
        aad[..16].copy_from_slice(self.backup_id.as_bytes());
        aad[16..].copy_from_slice(&index.to_le_bytes());
        aad
    }

    /// Encrypt chunk `index`, returning ciphertext followed by the tag
    pub fn seal(&self, index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(index);
        let aad = self.associated_data(index);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| encryption_failed(index))
    }

    /// Decrypt and authenticate chunk `index`
    pub fn open(&self, index: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(index);
        let aad = self.associated_data(index);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: sealed, aad: &aad },
            )
            .map_err(|_| Error::AuthenticationFailed { index })
    }
}

fn encryption_failed(index: u64) -> Error {
    Error::EncryptionFailed { index }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encryption_failure_is_not_an_integrity_failure() {
        let err = encryption_failed(4);
        assert!(matches!(err, Error::EncryptionFailed { index: 4 }));
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn test_seal_open() {
        let key = BackupKey::generate();
        let salt = generate_salt();
        let cipher = ChunkCipher::new(&key, &salt, Uuid::new_v4());

        let sealed = cipher.seal(7, b"delta bytes").unwrap();
        assert_eq!(sealed.len(), b"delta bytes".len() + TAG_LEN);
        assert_eq!(cipher.open(7, &sealed).unwrap(), b"delta bytes");
    }

    #[test]
    fn test_wrong_index_or_backup_fails_authentication() {
        let key = BackupKey::generate();
        let salt = generate_salt();
        let id = Uuid::new_v4();
        let sealed = ChunkCipher::new(&key, &salt, id).seal(0, b"abc").unwrap();

        let same = ChunkCipher::new(&key, &salt, id);
        assert!(matches!(same.open(1, &sealed), Err(Error::AuthenticationFailed { index: 1 })));

        let other_backup = ChunkCipher::new(&key, &salt, Uuid::new_v4());
        assert!(other_backup.open(0, &sealed).is_err());

        let other_salt = ChunkCipher::new(&key, &generate_salt(), id);
        assert!(other_salt.open(0, &sealed).is_err());
    }

    #[test]
    fn test_salt_changes_ciphertext() {
        let key = BackupKey::from_bytes([9u8; KEY_LEN]);
        let id = Uuid::new_v4();
        let a = ChunkCipher::new(&key, &[1u8; SALT_LEN], id).seal(0, b"same").unwrap();
        let b = ChunkCipher::new(&key, &[2u8; SALT_LEN], id).seal(0, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_file_formats() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("backup.key");

        let key = BackupKey::generate();
        key.write_key_file(&path)?;
        let loaded = BackupKey::from_file(&path)?;
        assert_eq!(loaded.0, key.0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Refuses to clobber an existing key
        assert!(key.write_key_file(&path).is_err());

        let raw = BackupKey::parse(&[0xAB; KEY_LEN])?;
        assert_eq!(raw.0, [0xAB; KEY_LEN]);

        assert!(matches!(BackupKey::parse(b"too short"), Err(Error::KeyMaterial { .. })));
        Ok(())
    }
}
