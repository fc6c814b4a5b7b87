//! Credential staging store.
//!
//! Holds one serialized credential document per lineage. The Link
//! Provider's persistence callback writes it; capture and the terminal path
//! read and clear it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::StoreError;
use crate::types::SessionId;

/// Key/value persistence of staged credential material, keyed by lineage.
pub trait SessionStore: Send + Sync + 'static {
    /// Returns the staged document, or `None` when nothing is staged.
    fn load(&self, id: &SessionId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the staged document.
    fn save(&self, id: &SessionId, document: &[u8]) -> Result<(), StoreError>;

    /// Removes the staged document. Clearing an absent entry is not an error.
    fn clear(&self, id: &SessionId) -> Result<(), StoreError>;
}

/// One file per lineage under a root directory.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        let key = id.as_str();
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(id)?;
        match std::fs::read(&path) {
            Ok(data) => {
                debug!(session = %id, bytes = data.len(), "loaded staged credential");
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &SessionId, document: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(&path, document)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(session = %id, path = %path.display(), "staged credential");
        Ok(())
    }

    fn clear(&self, id: &SessionId) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(session = %id, "cleared staged credential");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<SessionId, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(id).cloned())
    }

    fn save(&self, id: &SessionId, document: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(id.clone(), document.to_vec());
        Ok(())
    }

    fn clear(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id);
        Ok(())
    }
}

/// Returns the default staging directory.
pub fn default_store_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("credlink").join("sessions"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
