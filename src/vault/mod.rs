//! At-rest encrypted per-cluster credential cache (§4.1).
//!
//! Each cluster's bind password is stored as a JSON record `{v, ct, created_at, ttl}`
//! under `<secrets>/<cluster>.cred`, encrypted with AES-256-GCM under a key generated
//! once and stored at `<secrets>/vault.key`. Both files are written with owner-only
//! permissions on POSIX hosts.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

const KEY_FILE: &str = "vault.key";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("I/O error accessing vault storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt credential record for cluster '{0}'")]
    Corrupt(String),
    #[error("no cached credential for cluster '{0}'")]
    Absent(String),
}

impl VaultError {
    #[must_use]
    pub fn kind(&self) -> crate::errors::ErrorKind {
        match self {
            Self::Absent(_) => crate::errors::ErrorKind::NotFound,
            Self::Corrupt(_) | Self::Io(_) => crate::errors::ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    v: u8,
    ct: String,
    created_at: u64,
    ttl: u64,
}

/// AEAD-encrypted, TTL-expiring, atomically-written credential store.
pub struct CredentialVault {
    secrets_dir: PathBuf,
    key: [u8; KEY_LEN],
}

impl CredentialVault {
    /// Opens (or initializes) the vault rooted at `secrets_dir`, generating the key
    /// file on first use.
    pub fn open(secrets_dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let secrets_dir = secrets_dir.into();
        std::fs::create_dir_all(&secrets_dir)?;
        let key_path = secrets_dir.join(KEY_FILE);
        let mut fresh_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut fresh_key);
        let key = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&key_path)
        {
            Ok(mut file) => {
                file.write_all(&fresh_key)?;
                restrict_permissions(&key_path);
                fresh_key
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let bytes = std::fs::read(&key_path)?;
                let mut key = [0u8; KEY_LEN];
                if bytes.len() != KEY_LEN {
                    return Err(VaultError::Corrupt("vault.key".into()));
                }
                key.copy_from_slice(&bytes);
                key
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { secrets_dir, key })
    }

    fn record_path(&self, cluster: &str) -> PathBuf {
        self.secrets_dir.join(format!("{cluster}.cred"))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Encrypts `plaintext` and atomically overwrites the record for `cluster`.
    pub fn store(&self, cluster: &str, plaintext: &str, ttl_seconds: u64) -> Result<(), VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Corrupt(cluster.to_string()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);

        let record = Record {
            v: 1,
            ct: base64::encode(&blob),
            created_at: now_unix(),
            ttl: ttl_seconds,
        };
        let json = serde_json::to_vec(&record).map_err(|_| VaultError::Corrupt(cluster.into()))?;
        let path = self.record_path(cluster);
        write_atomically(&path, &json)?;
        restrict_permissions(&path);
        Ok(())
    }

    /// Loads and decrypts the credential for `cluster`. Returns `Ok(None)` for an
    /// absent, expired, or tamper-detected record; expired/corrupt records are
    /// deleted as a side effect.
    pub fn load(&self, cluster: &str) -> Result<Option<String>, VaultError> {
        let path = self.record_path(cluster);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: Record = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(_) => {
                warn!(cluster, "discarding unparseable credential record");
                let _ = std::fs::remove_file(&path);
                return Ok(None);
            }
        };

        if now_unix().saturating_sub(record.created_at) >= record.ttl {
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }

        let blob = match base64::decode(&record.ct) {
            Ok(b) if b.len() > NONCE_LEN => b,
            _ => {
                warn!(cluster, "discarding corrupt credential record");
                let _ = std::fs::remove_file(&path);
                return Ok(None);
            }
        };
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        match self.cipher().decrypt(nonce, ciphertext) {
            Ok(plaintext) => Ok(Some(
                String::from_utf8(plaintext).map_err(|_| VaultError::Corrupt(cluster.into()))?,
            )),
            Err(_) => {
                warn!(cluster, "decryption failed, discarding record");
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Removes any cached credential for `cluster`. Idempotent.
    pub fn clear(&self, cluster: &str) -> Result<(), VaultError> {
        match std::fs::remove_file(self.record_path(cluster)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn present(&self, cluster: &str) -> bool {
        matches!(self.load(cluster), Ok(Some(_)))
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %e, "failed to restrict file permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(path: &Path) {
    warn!(
        path = %path.display(),
        "owner-only permissions are not enforced on this platform"
    );
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::CredentialVault;

    #[test]
    fn round_trips_within_ttl() {
        let dir = tempdir();
        let vault = CredentialVault::open(&dir).unwrap();
        vault.store("c1", "hunter2", 3600).unwrap();
        assert_eq!(vault.load("c1").unwrap().as_deref(), Some("hunter2"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn clear_removes_record() {
        let dir = tempdir();
        let vault = CredentialVault::open(&dir).unwrap();
        vault.store("c1", "hunter2", 3600).unwrap();
        vault.clear("c1").unwrap();
        assert_eq!(vault.load("c1").unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn absent_cluster_loads_as_none() {
        let dir = tempdir();
        let vault = CredentialVault::open(&dir).unwrap();
        assert_eq!(vault.load("nope").unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        let mut suffix = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut suffix);
        dir.push(format!("vault-test-{}", hex_encode(&suffix)));
        dir
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
