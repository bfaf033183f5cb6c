use std::{
    fs::{self, File},
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Local, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder};
use thiserror::Error;

/// File suffixes included in a backup archive.
const BACKUP_SUFFIXES: [&str; 4] = ["json", "jsonl", "log", "txt"];

/// Errors produced by backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Filesystem or archive I/O failure.
    #[error("backup io error: {0}")]
    Io(#[from] std::io::Error),
    /// The named archive does not exist.
    #[error("backup not found: {0}")]
    NotFound(String),
    /// The archive name does not match `nexus_backup_*.tar.gz`.
    #[error("invalid backup name: {0}")]
    InvalidName(String),
    /// The data directory is missing, nothing to archive.
    #[error("data directory missing: {0}")]
    NoDataDir(PathBuf),
}

/// Summary of a created backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Archive path.
    pub path: PathBuf,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Number of files archived.
    pub files_count: usize,
    /// Archive timestamp tag.
    pub timestamp: String,
}

/// One entry of the backup listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Archive file name.
    pub name: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Creation time.
    pub created: DateTime<Utc>,
}

/// Summary of a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreInfo {
    /// Files restored into the data directory.
    pub restored_files: usize,
    /// Entries skipped for unsafe paths.
    pub skipped_entries: usize,
    /// Source archive name.
    pub source: String,
    /// Restore timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Creates, lists, restores, and prunes brain-data backups.
#[derive(Debug, Clone)]
pub struct BackupManager {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    /// Creates a manager over the given brain data and backup directories.
    /// `max_backups == 0` disables retention pruning.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: backup_dir.into(),
            max_backups,
        }
    }

    /// Archives every `.json/.jsonl/.log/.txt` file under the data directory
    /// into a timestamped `tar.gz`.
    pub fn create_backup(&self, tag: Option<&str>) -> Result<BackupInfo, BackupError> {
        if !self.data_dir.exists() {
            return Err(BackupError::NoDataDir(self.data_dir.clone()));
        }
        fs::create_dir_all(&self.backup_dir)?;

        let timestamp = Local::now().format("%Y-%m-%d_%H%M%S").to_string();
        let name = match tag {
            Some(tag) if !tag.is_empty() => format!("nexus_backup_{timestamp}_{tag}.tar.gz"),
            _ => format!("nexus_backup_{timestamp}.tar.gz"),
        };
        let archive_path = self.backup_dir.join(&name);

        let mut files_count = 0;
        {
            let file = File::create(&archive_path)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = Builder::new(encoder);
            for path in collect_backup_files(&self.data_dir)? {
                let relative = path
                    .strip_prefix(&self.data_dir)
                    .unwrap_or(&path)
                    .to_path_buf();
                builder.append_path_with_name(&path, relative)?;
                files_count += 1;
            }
            builder.into_inner()?.finish()?;
        }

        if self.max_backups > 0 {
            self.prune_old_backups()?;
        }

        let size_bytes = fs::metadata(&archive_path)?.len();
        Ok(BackupInfo {
            path: archive_path,
            size_bytes,
            files_count,
            timestamp,
        })
    }

    /// Lists available backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let mut entries = Vec::new();
        let Ok(read_dir) = fs::read_dir(&self.backup_dir) else {
            return Ok(entries);
        };
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_backup_name(&name) {
                continue;
            }
            let meta = entry.metadata()?;
            let created = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(BackupEntry {
                name,
                size_bytes: meta.len(),
                created,
            });
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// Restores an archive into the data directory.
    ///
    /// Rejects names outside the `nexus_backup_*.tar.gz` pattern and skips
    /// entries with absolute or parent-traversing paths. A `pre_restore`
    /// backup is taken first.
    pub fn restore_backup(&self, backup_name: &str) -> Result<RestoreInfo, BackupError> {
        if !is_backup_name(backup_name) {
            return Err(BackupError::InvalidName(backup_name.to_string()));
        }
        let archive_path = self.backup_dir.join(backup_name);
        if !archive_path.exists() {
            return Err(BackupError::NotFound(backup_name.to_string()));
        }

        // Safety net so a bad restore is itself recoverable.
        let _ = self.create_backup(Some("pre_restore"));

        let file = File::open(&archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        let mut restored = 0;
        let mut skipped = 0;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            if !is_safe_relative(&entry_path) {
                skipped += 1;
                continue;
            }
            let target = self.data_dir.join(&entry_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
            restored += 1;
        }

        Ok(RestoreInfo {
            restored_files: restored,
            skipped_entries: skipped,
            source: backup_name.to_string(),
            timestamp: Utc::now(),
        })
    }

    fn prune_old_backups(&self) -> Result<(), BackupError> {
        let backups = self.list_backups()?;
        for old in backups.iter().skip(self.max_backups) {
            let _ = fs::remove_file(self.backup_dir.join(&old.name));
        }
        Ok(())
    }
}

fn is_backup_name(name: &str) -> bool {
    name.starts_with("nexus_backup_") && name.ends_with(".tar.gz")
}

fn is_safe_relative(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn collect_backup_files(dir: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)?.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| BACKUP_SUFFIXES.contains(&ext))
            {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded_manager(root: &Path) -> BackupManager {
        let data = root.join("data").join("brain");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("knowledge.jsonl"), "{\"id\":\"k1\"}\n").unwrap();
        fs::write(data.join("issues.json"), "{}").unwrap();
        fs::write(data.join("ignored.bin"), [0u8; 4]).unwrap();
        BackupManager::new(data, root.join("data").join("backups"), 10)
    }

    #[test]
    fn backup_then_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = seeded_manager(dir.path());
        let info = manager.create_backup(None).unwrap();
        assert_eq!(info.files_count, 2);
        assert!(info.path.exists());

        // Mutate then restore.
        fs::write(
            dir.path().join("data").join("brain").join("knowledge.jsonl"),
            "corrupted",
        )
        .unwrap();
        let name = info.path.file_name().unwrap().to_str().unwrap().to_string();
        let restore = manager.restore_backup(&name).unwrap();
        assert_eq!(restore.restored_files, 2);
        let content = fs::read_to_string(
            dir.path().join("data").join("brain").join("knowledge.jsonl"),
        )
        .unwrap();
        assert!(content.contains("k1"));
    }

    #[test]
    fn rejects_malformed_names() {
        let dir = tempdir().unwrap();
        let manager = seeded_manager(dir.path());
        let err = manager.restore_backup("../../etc/passwd").unwrap_err();
        assert!(matches!(err, BackupError::InvalidName(_)));
        let err = manager.restore_backup("nexus_backup_missing.tar.gz").unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[test]
    fn listing_is_newest_first_and_filtered() {
        let dir = tempdir().unwrap();
        let manager = seeded_manager(dir.path());
        manager.create_backup(Some("a")).unwrap();
        fs::write(
            dir.path().join("data").join("backups").join("not_a_backup.tar.gz"),
            b"x",
        )
        .unwrap();
        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].name.starts_with("nexus_backup_"));
    }
}
