//! Credential Store
//!
//! Encrypts and persists per-profile username/secret pairs on disk.
//!
//! # At-rest format
//!
//! One file per profile, named from the flattened profile id with a `.cred`
//! extension:
//!
//! ```text
//! "OVC1" (4 bytes) | XChaCha20 nonce (24 bytes) | AEAD ciphertext
//! ```
//!
//! The ciphertext is an authenticated encryption of a small JSON envelope
//! holding the username and the base64 secret. Any bit flip in the file fails
//! decryption with [`CredentialError::Integrity`] instead of yielding a
//! plausible wrong credential.
//!
//! The 256-bit master key lives next to the credentials as `store.key` and is
//! generated from the OS RNG on first use. The store directory is forced to
//! owner-only access when opened; key and credential files are written `0600`.

use crate::catalog::ProfileId;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit},
};
use fs2::FileExt;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"OVC1";
const NONCE_LEN: usize = 24;
const KEY_FILE_NAME: &str = "store.key";
const CREDENTIAL_EXTENSION: &str = "cred";

/// Attempts to grab the per-file write lock before giving up.
const LOCK_ATTEMPTS: u32 = 5;
/// Base backoff between lock attempts; doubles each retry.
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// An opaque secret byte sequence.
///
/// `Debug` is redacted so the secret can never leak through logs or error
/// formatting.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Access the raw bytes. Callers must not copy them into logs or argv.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([redacted])")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// A decrypted credential for one profile.
#[derive(Debug, Clone)]
pub struct Credential {
    pub profile_id: ProfileId,
    pub username: String,
    pub secret: Secret,
}

/// Plaintext envelope sealed inside the credential file.
#[derive(Serialize, Deserialize)]
struct Envelope {
    username: String,
    /// base64 of the secret bytes
    secret: String,
}

/// Encrypted, file-per-profile credential storage.
pub struct CredentialStore {
    dir: PathBuf,
    cipher: XChaCha20Poly1305,
}

impl CredentialStore {
    /// Open (and if needed initialize) a store at `dir`.
    ///
    /// Creates the directory owner-only on first use and loads or generates
    /// the master key.
    pub fn open(dir: &Path) -> Result<Self, CredentialError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| CredentialError::Io(dir.to_path_buf(), e))?;
            info!("Created credential directory: {}", dir.display());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| CredentialError::Io(dir.to_path_buf(), e))?;
        }

        let key = load_or_create_key(&dir.join(KEY_FILE_NAME))?;
        let cipher = XChaCha20Poly1305::new((&key).into());

        Ok(Self {
            dir: dir.to_path_buf(),
            cipher,
        })
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the credential file for a profile.
    pub fn path_for(&self, profile_id: &ProfileId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", profile_id.flattened(), CREDENTIAL_EXTENSION))
    }

    /// Whether a stored credential exists for the profile.
    pub fn contains(&self, profile_id: &ProfileId) -> bool {
        self.path_for(profile_id).exists()
    }

    /// Decrypt and return the credential for a profile.
    pub fn load(&self, profile_id: &ProfileId) -> Result<Credential, CredentialError> {
        let path = self.path_for(profile_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(profile_id.clone()));
            }
            Err(e) => return Err(CredentialError::Io(path, e)),
        };

        if bytes.len() < MAGIC.len() + NONCE_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(CredentialError::Integrity(profile_id.clone()));
        }

        let nonce = XNonce::from_slice(&bytes[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let ciphertext = &bytes[MAGIC.len() + NONCE_LEN..];

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CredentialError::Integrity(profile_id.clone()))?;

        let envelope: Envelope = serde_json::from_slice(&plaintext)
            .map_err(|_| CredentialError::Integrity(profile_id.clone()))?;
        let secret = BASE64
            .decode(&envelope.secret)
            .map_err(|_| CredentialError::Integrity(profile_id.clone()))?;

        debug!("Loaded credential for {}", profile_id);

        Ok(Credential {
            profile_id: profile_id.clone(),
            username: envelope.username,
            secret: Secret::new(secret),
        })
    }

    /// Encrypt and persist a credential for a profile.
    ///
    /// Holds an exclusive advisory lock for the duration of the write and
    /// lands the ciphertext via temp-file-then-rename, so a concurrent load
    /// never observes a partially written file.
    pub fn save(
        &self,
        profile_id: &ProfileId,
        username: &str,
        secret: &Secret,
    ) -> Result<(), CredentialError> {
        let path = self.path_for(profile_id);
        let _lock = WriteLock::acquire(&path)?;

        let envelope = Envelope {
            username: username.to_string(),
            secret: BASE64.encode(secret.expose()),
        };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|e| CredentialError::Encode(e.to_string()))?;

        let nonce = XChaCha20Poly1305::generate_nonce(&mut chacha20poly1305::aead::OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CredentialError::Encode("encryption failure".to_string()))?;

        let mut bytes = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(nonce.as_slice());
        bytes.extend_from_slice(&ciphertext);

        write_private(&self.dir, &path, &bytes)?;
        info!("Saved credentials for {}", profile_id);
        Ok(())
    }

    /// Remove the stored credential for a profile.
    ///
    /// Deleting a credential that does not exist is a no-op.
    pub fn delete(&self, profile_id: &ProfileId) -> Result<(), CredentialError> {
        let path = self.path_for(profile_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted credentials for {}", profile_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CredentialError::Io(path, e)),
        }
    }
}

/// Load the master key, generating it on first use.
fn load_or_create_key(path: &Path) -> Result<[u8; 32], CredentialError> {
    match fs::read(path) {
        Ok(bytes) => {
            if bytes.len() != 32 {
                return Err(CredentialError::BadKeyFile(path.to_path_buf()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            let dir = path.parent().unwrap_or(Path::new("."));
            write_private(dir, path, &key)?;
            info!("Generated credential store key: {}", path.display());
            Ok(key)
        }
        Err(e) => Err(CredentialError::Io(path.to_path_buf(), e)),
    }
}

/// Write `bytes` to `path` with mode 0600, via temp-file-then-rename in `dir`.
fn write_private(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), CredentialError> {
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| CredentialError::Io(dir.to_path_buf(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| CredentialError::Io(tmp.path().to_path_buf(), e))?;
    }

    tmp.write_all(bytes)
        .map_err(|e| CredentialError::Io(path.to_path_buf(), e))?;
    tmp.flush()
        .map_err(|e| CredentialError::Io(path.to_path_buf(), e))?;
    tmp.persist(path)
        .map_err(|e| CredentialError::Io(path.to_path_buf(), e.error))?;
    Ok(())
}

/// Exclusive advisory lock guard for one credential file.
///
/// Lock contention is retried a bounded number of times with doubling
/// backoff before surfacing an error.
struct WriteLock {
    #[allow(dead_code)]
    file: File,
    lock_path: PathBuf,
}

impl WriteLock {
    fn acquire(path: &Path) -> Result<Self, CredentialError> {
        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CredentialError::Io(lock_path.clone(), e))?;

        let mut backoff = LOCK_BACKOFF;
        for attempt in 1..=LOCK_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, lock_path }),
                Err(e) if attempt == LOCK_ATTEMPTS => {
                    return Err(CredentialError::Locked(lock_path, e.to_string()));
                }
                Err(e) => {
                    warn!(
                        "Credential lock busy ({}), retrying in {:?}: {}",
                        lock_path.display(),
                        backoff,
                        e
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
        unreachable!("lock loop always returns")
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        // The lock itself releases with the file handle.
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no stored credentials for profile {0}")]
    NotFound(ProfileId),

    #[error("credential file for profile {0} is corrupted or tampered")]
    Integrity(ProfileId),

    #[error("credential io error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("credential store key file is invalid: {0}")]
    BadKeyFile(PathBuf),

    #[error("could not encode credential: {0}")]
    Encode(String),

    #[error("credential file {0} is locked by another writer: {1}")]
    Locked(PathBuf, String),
}
