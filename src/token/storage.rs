//! Token Storage
//!
//! Durable storage for the single token record. The file store writes a
//! versioned envelope through a temporary file that is atomically renamed
//! over the canonical path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CredentialError, CredentialResult, StorageError};
use crate::types::TokenRecord;

/// Format tag written into every envelope.
pub const ENVELOPE_FORMAT: &str = "broker-auth/token-record";
/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// On-disk representation of a [`TokenRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecordEnvelope {
    pub format: String,
    pub version: u32,
    pub record: TokenRecord,
}

impl PersistedRecordEnvelope {
    pub fn new(record: TokenRecord) -> Self {
        Self {
            format: ENVELOPE_FORMAT.to_string(),
            version: ENVELOPE_VERSION,
            record,
        }
    }

    /// Decode an envelope, rejecting foreign formats and other versions.
    pub fn decode(bytes: &[u8]) -> Result<TokenRecord, String> {
        let envelope: PersistedRecordEnvelope =
            serde_json::from_slice(bytes).map_err(|e| e.to_string())?;

        if envelope.format != ENVELOPE_FORMAT {
            return Err(format!("unexpected format {:?}", envelope.format));
        }
        if envelope.version != ENVELOPE_VERSION {
            return Err(format!(
                "unsupported version {} (expected {})",
                envelope.version, ENVELOPE_VERSION
            ));
        }
        if envelope.record.access_token.is_empty() {
            return Err("record has an empty access token".to_string());
        }

        Ok(envelope.record)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

/// Token storage interface.
///
/// Purely storage: no network access and no validity checks beyond the
/// envelope itself.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the record; `NotFound` when absent, `CorruptStore` when unusable.
    async fn load(&self) -> CredentialResult<TokenRecord>;

    /// Replace the stored record as a whole.
    async fn save(&self, record: &TokenRecord) -> CredentialResult<()>;

    /// Remove the stored record. Returns whether one existed.
    async fn delete(&self) -> CredentialResult<bool>;

    /// Check if a record (usable or not) is present.
    async fn exists(&self) -> CredentialResult<bool>;
}

/// File-backed token store.
pub struct FileTokenStore {
    path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
    before_persist: PersistHook,
}

/// Runs against the fully written temporary file, just before the rename.
type PersistHook = fn(&Path) -> std::io::Result<()>;

impl FileTokenStore {
    /// Create a store for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: tokio::sync::Mutex::new(()),
            before_persist: |_| Ok(()),
        }
    }

    #[cfg(test)]
    fn with_persist_hook(mut self, hook: PersistHook) -> Self {
        self.before_persist = hook;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> CredentialResult<TokenRecord> {
        let _guard = self.io_lock.lock().await;

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    path: self.display_path(),
                }
                .into());
            }
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    message: format!("{}: {}", self.display_path(), e),
                }
                .into());
            }
        };

        PersistedRecordEnvelope::decode(&bytes).map_err(|message| {
            tracing::warn!(path = %self.path.display(), reason = %message, "Token file is unusable");
            CredentialError::Storage(StorageError::CorruptStore {
                path: self.display_path(),
                message,
            })
        })
    }

    async fn save(&self, record: &TokenRecord) -> CredentialResult<()> {
        let bytes = PersistedRecordEnvelope::new(record.clone())
            .encode()
            .map_err(|e| StorageError::WriteFailed {
                message: e.to_string(),
            })?;

        let _guard = self.io_lock.lock().await;
        let path = self.path.clone();
        let before_persist = self.before_persist;

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes, before_persist))
            .await
            .map_err(|e| StorageError::WriteFailed {
                message: format!("write task failed: {}", e),
            })??;

        tracing::debug!(path = %self.path.display(), expires_at = %record.expires_at, "Token record saved");
        Ok(())
    }

    async fn delete(&self) -> CredentialResult<bool> {
        let _guard = self.io_lock.lock().await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFailed {
                message: format!("{}: {}", self.display_path(), e),
            }
            .into()),
        }
    }

    async fn exists(&self) -> CredentialResult<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| {
                StorageError::ReadFailed {
                    message: format!("{}: {}", self.display_path(), e),
                }
                .into()
            })
    }
}

/// Write `bytes` to a temporary file next to `path`, flush it, restrict it
/// to the owner and rename it over `path`. The temporary file is removed if
/// any step before the rename fails.
fn write_atomically(
    path: &Path,
    bytes: &[u8],
    before_persist: PersistHook,
) -> Result<(), CredentialError> {
    let write_failed = |message: String| {
        CredentialError::Storage(StorageError::WriteFailed {
            message: format!("{}: {}", path.display(), message),
        })
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| write_failed(e.to_string()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".broker-token")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| write_failed(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| write_failed(e.to_string()))?;
    }

    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| write_failed(e.to_string()))?;

    before_persist(tmp.path()).map_err(|e| write_failed(e.to_string()))?;

    tmp.persist(path).map_err(|e| write_failed(e.error.to_string()))?;
    Ok(())
}

/// In-memory token store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryTokenStore {
    record: Mutex<Option<TokenRecord>>,
}

impl InMemoryTokenStore {
    /// Create new in-memory token store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `record`.
    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<TokenRecord>> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self) -> CredentialResult<TokenRecord> {
        self.slot().clone().ok_or_else(|| {
            StorageError::NotFound {
                path: "<memory>".to_string(),
            }
            .into()
        })
    }

    async fn save(&self, record: &TokenRecord) -> CredentialResult<()> {
        *self.slot() = Some(record.clone());
        Ok(())
    }

    async fn delete(&self) -> CredentialResult<bool> {
        Ok(self.slot().take().is_some())
    }

    async fn exists(&self) -> CredentialResult<bool> {
        Ok(self.slot().is_some())
    }
}

/// Mock token store for testing.
#[derive(Default)]
pub struct MockTokenStore {
    record: Mutex<Option<TokenRecord>>,
    save_history: Mutex<Vec<TokenRecord>>,
    load_count: Mutex<usize>,
    delete_count: Mutex<usize>,
    load_error: Mutex<Option<CredentialError>>,
    save_error: Mutex<Option<CredentialError>>,
}

impl MockTokenStore {
    /// Create new mock token store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the record.
    pub fn set_record(&self, record: TokenRecord) -> &Self {
        *self.record.lock().unwrap() = Some(record);
        self
    }

    /// Fail the next load with `error`.
    pub fn set_load_error(&self, error: CredentialError) -> &Self {
        *self.load_error.lock().unwrap() = Some(error);
        self
    }

    /// Fail the next save with `error`.
    pub fn set_save_error(&self, error: CredentialError) -> &Self {
        *self.save_error.lock().unwrap() = Some(error);
        self
    }

    /// Current record.
    pub fn get_record(&self) -> Option<TokenRecord> {
        self.record.lock().unwrap().clone()
    }

    /// Get save history.
    pub fn get_save_history(&self) -> Vec<TokenRecord> {
        self.save_history.lock().unwrap().clone()
    }

    pub fn load_count(&self) -> usize {
        *self.load_count.lock().unwrap()
    }

    pub fn delete_count(&self) -> usize {
        *self.delete_count.lock().unwrap()
    }
}

#[async_trait]
impl TokenStore for MockTokenStore {
    async fn load(&self) -> CredentialResult<TokenRecord> {
        *self.load_count.lock().unwrap() += 1;

        if let Some(error) = self.load_error.lock().unwrap().take() {
            return Err(error);
        }

        self.record.lock().unwrap().clone().ok_or_else(|| {
            StorageError::NotFound {
                path: "<mock>".to_string(),
            }
            .into()
        })
    }

    async fn save(&self, record: &TokenRecord) -> CredentialResult<()> {
        if let Some(error) = self.save_error.lock().unwrap().take() {
            return Err(error);
        }

        self.save_history.lock().unwrap().push(record.clone());
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    async fn delete(&self) -> CredentialResult<bool> {
        *self.delete_count.lock().unwrap() += 1;
        Ok(self.record.lock().unwrap().take().is_some())
    }

    async fn exists(&self) -> CredentialResult<bool> {
        Ok(self.record.lock().unwrap().is_some())
    }
}
