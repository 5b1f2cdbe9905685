//! In-memory backups of the managed configuration store

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::fs;
use uuid::Uuid;

use safenet_core::{Result, StoreError};

use crate::layered::LayeredConfigWriter;

/// Information about a backed up file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    /// Original file path
    pub path: PathBuf,
    /// File content at backup time
    pub content: Vec<u8>,
    /// MD5 checksum for integrity verification
    pub checksum: String,
    /// File size in bytes
    pub size: u64,
}

impl BackupFile {
    fn new(path: PathBuf, content: Vec<u8>) -> Self {
        let checksum = format!("{:x}", md5::compute(&content));
        let size = content.len() as u64;
        Self {
            path,
            content,
            checksum,
            size,
        }
    }

    fn verify(&self) -> bool {
        format!("{:x}", md5::compute(&self.content)) == self.checksum
    }
}

/// Snapshot of every managed file in the store
#[derive(Debug, Clone)]
pub struct StoreBackup {
    pub id: Uuid,
    pub taken_at: DateTime<Utc>,
    dir: PathBuf,
    files: Vec<BackupFile>,
}

/// What a restore changed on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Managed files created after the backup and removed again
    pub removed: Vec<PathBuf>,
    /// Files written back with their backed up content
    pub rewritten: Vec<PathBuf>,
}

impl RestoreSummary {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.rewritten.is_empty()
    }
}

impl StoreBackup {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[BackupFile] {
        &self.files
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

impl LayeredConfigWriter {
    /// Capture the content of every managed file
    pub async fn backup(&self) -> Result<StoreBackup> {
        let mut files = Vec::new();
        for path in self.managed_files().await? {
            let content = fs::read(&path).await?;
            debug!("Backed up {} ({} bytes)", path.display(), content.len());
            files.push(BackupFile::new(path, content));
        }

        let backup = StoreBackup {
            id: Uuid::new_v4(),
            taken_at: Utc::now(),
            dir: self.dir().to_path_buf(),
            files,
        };
        info!(
            "Created store backup {} with {} file(s)",
            backup.id,
            backup.files.len()
        );
        Ok(backup)
    }

    /// Bring the managed files back to the state captured in `backup`.
    ///
    /// Checksums are verified before anything is touched. Managed files that
    /// did not exist at backup time are removed and changed files rewritten.
    pub async fn restore(&self, backup: &StoreBackup) -> Result<RestoreSummary> {
        if let Some(corrupt) = backup.files.iter().find(|f| !f.verify()) {
            return Err(StoreError::ChecksumMismatch {
                path: corrupt.path.display().to_string(),
            }
            .into());
        }

        let mut summary = RestoreSummary::default();

        for path in self.managed_files().await? {
            if backup.contains(&path) {
                continue;
            }
            fs::remove_file(&path)
                .await
                .map_err(|source| StoreError::Remove {
                    path: path.display().to_string(),
                    source,
                })?;
            debug!("Removed {} created after backup {}", path.display(), backup.id);
            summary.removed.push(path);
        }

        for file in &backup.files {
            let unchanged = match fs::read(&file.path).await {
                Ok(current) => current == file.content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!("Could not read {}: {}", file.path.display(), e);
                    false
                }
            };
            if unchanged {
                continue;
            }
            self.write_atomic(&file.path, &file.content).await?;
            summary.rewritten.push(file.path.clone());
        }

        info!(
            "Restored store backup {}: {} removed, {} rewritten",
            backup.id,
            summary.removed.len(),
            summary.rewritten.len()
        );
        Ok(summary)
    }
}
