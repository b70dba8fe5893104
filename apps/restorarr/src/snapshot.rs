use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::BACKUP_ORIG_DIR;
use crate::utils::{copy_dir, copy_file_preserving};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub copied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

pub fn snapshot_dir(restore_dir: &Path) -> PathBuf {
    restore_dir.join(BACKUP_ORIG_DIR)
}

fn expand_members(restore_dir: &Path, members: &[PathBuf]) -> Vec<PathBuf> {
    let mut expanded = Vec::new();
    for member in members {
        if !member.as_os_str().is_empty() {
            expanded.push(member.clone());
            continue;
        }
        let Ok(entries) = fs::read_dir(restore_dir) else {
            continue;
        };
        let mut names: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| PathBuf::from(entry.file_name()))
            .collect();
        names.sort();
        expanded.extend(names);
    }
    expanded
}

fn snapshot_one(source: &Path, target: &Path) -> anyhow::Result<()> {
    if source.is_dir() {
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        copy_dir(source, target)
    } else {
        copy_file_preserving(source, target)
    }
}

/// Copies every member that already exists under `restore_dir` into `backup_orig/`.
/// Individual failures are recorded and never stop the pass.
pub fn snapshot_existing(restore_dir: &Path, members: &[PathBuf]) -> SnapshotReport {
    let snapshot_root = snapshot_dir(restore_dir);
    let mut report = SnapshotReport::default();

    for member in expand_members(restore_dir, members) {
        if member.starts_with(BACKUP_ORIG_DIR) {
            continue;
        }
        let source = restore_dir.join(&member);
        if fs::symlink_metadata(&source).is_err() {
            tracing::warn!(path = %source.display(), "nothing to snapshot; file does not exist yet");
            report.skipped.push(member);
            continue;
        }
        let target = snapshot_root.join(&member);
        match snapshot_one(&source, &target) {
            Ok(()) => {
                tracing::info!(
                    source = %source.display(),
                    target = %target.display(),
                    "saved pre-restore copy"
                );
                report.copied.push(member);
            }
            Err(err) => {
                tracing::warn!(path = %source.display(), error = %format!("{err:#}"), "snapshot failed");
                report.failed.push((member, format!("{err:#}")));
            }
        }
    }
    report
}
