use crate::signal::Signal;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Errors raised by the signal store. All of them are per-command failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no signal stored for command '{0}'")]
    NotFound(String),

    #[error("stored signal for command '{name}' is not valid hex: {source}")]
    Decode {
        name: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command name '{0}'")]
    InvalidName(String),
}

/// Filesystem-backed store for captured signals.
///
/// One file per command name below `root`. Names may contain `/` to form
/// sub-directories, which are created on demand when saving.
#[derive(Clone, Debug)]
pub struct SignalStore {
    root: PathBuf,
}

impl SignalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a command name to its file, refusing anything that could
    /// escape the store root.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.is_empty() || name.split('/').any(|segment| segment.is_empty()) {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        let relative = Path::new(name);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        Ok(self.root.join(relative))
    }

    pub async fn exists(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn load(&self, name: &str) -> Result<Signal, StoreError> {
        let path = self.path_for(name)?;
        debug!("Loading signal for '{}' from {}", name, path.display());

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Signal::from_hex(&content).map_err(|source| StoreError::Decode {
            name: name.to_string(),
            source,
        })
    }

    pub async fn save(&self, name: &str, signal: &Signal) -> Result<(), StoreError> {
        let path = self.path_for(name)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&path, signal.to_hex())
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        info!(
            "Stored {} byte signal for '{}' at {}",
            signal.len(),
            name,
            path.display()
        );
        Ok(())
    }
}
