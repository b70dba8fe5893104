use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    Zip,
    Tar,
    Raw,
}

impl BackupFormat {
    pub fn for_path(path: &Path, is_dir: bool) -> Self {
        if is_dir {
            return Self::Raw;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::Tar
        } else {
            Self::Raw
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::Raw => "raw",
        }
    }
}

impl std::fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCandidate {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub format: BackupFormat,
    pub is_dir: bool,
}

impl BackupCandidate {
    pub fn modified_rfc3339(&self) -> String {
        DateTime::<Utc>::from(self.modified).to_rfc3339()
    }
}

fn is_eligible(name: &str, is_dir: bool, extension: &str) -> bool {
    if extension.is_empty() {
        return true;
    }
    !is_dir && name.to_lowercase().ends_with(&extension.to_lowercase())
}

/// Lists direct children of `backup_dir` with their modification time, newest first.
/// Ties on modification time are ordered by name, descending.
pub fn list_entries(backup_dir: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime, bool)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(dir = %backup_dir.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping entry without metadata");
                continue;
            }
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((path, modified, meta.is_dir()));
    }
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.file_name().cmp(&a.0.file_name())));
    Ok(entries)
}

/// Finds the most recently modified eligible backup directly under `backup_dir`.
pub fn find_latest_backup(backup_dir: &Path, extension: &str) -> Option<BackupCandidate> {
    let entries = match list_entries(backup_dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %backup_dir.display(), error = %err, "backup directory not readable");
            return None;
        }
    };
    entries
        .into_iter()
        .find(|(path, _, is_dir)| {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            is_eligible(&name, *is_dir, extension)
        })
        .map(|(path, modified, is_dir)| BackupCandidate {
            format: BackupFormat::for_path(&path, is_dir),
            path,
            modified,
            is_dir,
        })
}
