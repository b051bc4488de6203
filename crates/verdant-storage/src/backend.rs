//! Redb database handle shared by the stores.

use redb::Database;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

/// Shared handle to the embedded redb database.
///
/// One backend per process; each store opens its own tables on top of it.
pub struct StorageBackend {
    db: Arc<Database>,
    path: PathBuf,
    /// Backing file for throwaway databases, removed on drop.
    temp_path: Option<PathBuf>,
}

impl StorageBackend {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            Database::open(&path)?
        } else {
            Database::create(&path)?
        };

        info!(path = %path.display(), "storage backend opened");
        Ok(Self {
            db: Arc::new(db),
            path,
            temp_path: None,
        })
    }

    /// Create a throwaway database backed by a temp file.
    ///
    /// redb has no true in-memory mode, so this mirrors it with a
    /// uniquely-named file that is removed when the backend drops.
    pub fn ephemeral() -> Result<Self> {
        let temp_path = std::env::temp_dir().join(format!("verdant_{}.redb", uuid::Uuid::new_v4()));
        let db = Database::create(&temp_path)?;
        Ok(Self {
            db: Arc::new(db),
            path: temp_path.clone(),
            temp_path: Some(temp_path),
        })
    }

    /// The underlying database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageBackend {
    fn drop(&mut self) {
        if let Some(temp_path) = &self.temp_path {
            let _ = std::fs::remove_file(temp_path);
        }
    }
}
