//! Identity registry: the persisted set of known endpoint identities.
//!
//! The registry is a JSON array on disk (`clients.json` by default):
//!
//! ```json
//! [
//!     {"name": "web-01", "username": "ops", "role": 1, "version": "1.0", "uuid": "..."}
//! ]
//! ```
//!
//! Every mutation rewrites the whole file. There is at most one entry per
//! uuid.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;
use tokio::fs;

use crate::types::Identity;

/// Errors from reading or writing the registry file.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Registry file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Known endpoint identities, backed by a JSON file.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    path: PathBuf,
    identities: Vec<Identity>,
}

impl IdentityRegistry {
    /// An empty registry that will persist to `path`. Nothing is read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            identities: Vec::new(),
        }
    }

    /// Read the registry at `path`.
    ///
    /// A missing or empty file yields an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No identities to load, {} does not exist", path.display());
                return Ok(Self::new(path));
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            info!("No identities to load, {} is empty", path.display());
            return Ok(Self::new(path));
        }

        let identities: Vec<Identity> = serde_json::from_slice(&bytes)
            .map_err(|source| RegistryError::Json {
                path: path.clone(),
                source,
            })?;

        let mut registry = Self::new(path);
        for identity in identities {
            // Older files may carry duplicates; the last entry wins.
            registry.identities.retain(|known| known.uuid != identity.uuid);
            registry.identities.push(identity);
        }
        info!(
            "Loaded {} identities from {}",
            registry.identities.len(),
            registry.path.display()
        );
        Ok(registry)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Add `identity` and persist the whole registry.
    ///
    /// An existing entry with the same uuid is replaced.
    pub async fn save(&mut self, identity: Identity) -> Result<(), RegistryError> {
        self.identities.retain(|known| known.uuid != identity.uuid);
        info!("Saved identity {}", identity.name);
        self.identities.push(identity);
        self.persist().await
    }

    /// Remove every entry with `uuid` and persist the rest.
    /// Returns the number of entries removed.
    pub async fn delete(&mut self, uuid: &str) -> Result<usize, RegistryError> {
        let before = self.identities.len();
        self.identities.retain(|known| known.uuid != uuid);
        let removed = before - self.identities.len();
        if removed > 0 {
            info!("Deleted identity with uuid {}", uuid);
        }
        self.persist().await?;
        Ok(removed)
    }

    pub fn lookup(&self, uuid: &str) -> Option<&Identity> {
        self.identities.iter().find(|known| known.uuid == uuid)
    }

    /// True when a stored record shares the candidate's uuid but differs in
    /// name, username, role or version. No stored record means no mismatch.
    pub fn detect_mismatch(&self, candidate: &Identity) -> bool {
        let Some(stored) = self.lookup(&candidate.uuid) else {
            return false;
        };

        if stored.name != candidate.name {
            info!(
                "Mismatch in saved name ({}) and received name ({})",
                stored.name, candidate.name
            );
            return true;
        }
        if stored.username != candidate.username {
            info!(
                "Mismatch in saved username ({}) and received username ({})",
                stored.username, candidate.username
            );
            return true;
        }
        if stored.role != candidate.role {
            info!(
                "Mismatch in saved role ({}) and received role ({})",
                stored.role, candidate.role
            );
            return true;
        }
        if stored.version != candidate.version {
            info!(
                "Mismatch in saved version ({}) and received version ({})",
                stored.version, candidate.version
            );
            return true;
        }
        false
    }

    /// Rewrite the file through a sibling temp file so a crash mid-write
    /// leaves the previous contents intact.
    async fn persist(&self) -> Result<(), RegistryError> {
        let io_err = |source: std::io::Error| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(&self.identities).map_err(|source| {
            RegistryError::Json {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).await.map_err(io_err)?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            warn!("Failed to replace {}: {}", self.path.display(), e);
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    /// Move an unreadable registry file to `<path>.corrupt` so that the
    /// next save cannot overwrite it. Returns where it went, or `None` if
    /// there was no file.
    pub async fn quarantine(path: &Path) -> Result<Option<PathBuf>, RegistryError> {
        let mut aside = path.to_path_buf().into_os_string();
        aside.push(".corrupt");
        let aside = PathBuf::from(aside);
        match fs::rename(path, &aside).await {
            Ok(()) => {
                warn!(
                    "Moved unreadable registry {} to {}",
                    path.display(),
                    aside.display()
                );
                Ok(Some(aside))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
