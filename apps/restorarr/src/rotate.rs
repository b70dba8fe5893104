use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::locator::list_entries;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub root: PathBuf,
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

fn remove_entry(path: &Path, is_dir: bool) -> std::io::Result<()> {
    if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Keeps the `keep` newest entries of `root` and deletes the rest.
pub fn rotate_root(root: &Path, keep: usize) -> Result<RotationReport> {
    let mut report = RotationReport {
        root: root.to_path_buf(),
        ..RotationReport::default()
    };
    if !root.exists() {
        tracing::info!(root = %root.display(), "backup root missing; creating it");
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create backup root {}", root.display()))?;
        return Ok(report);
    }
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    let entries = list_entries(root)
        .with_context(|| format!("Failed to list backup root {}", root.display()))?;
    for (index, (path, _, is_dir)) in entries.into_iter().enumerate() {
        if index < keep {
            report.kept.push(path);
            continue;
        }
        match remove_entry(&path, is_dir) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed old backup");
                report.removed.push(path);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove old backup");
                report.failed.push((path, err.to_string()));
            }
        }
    }
    Ok(report)
}

/// Rotates every root; a broken root is logged and the others still run.
pub fn rotate_all(roots: &[PathBuf], keep: usize) -> Vec<RotationReport> {
    let mut reports = Vec::new();
    for root in roots {
        match rotate_root(root, keep) {
            Ok(report) => reports.push(report),
            Err(err) => {
                tracing::error!(
                    root = %root.display(),
                    error = %format!("{err:#}"),
                    "rotation skipped"
                );
                reports.push(RotationReport {
                    root: root.clone(),
                    failed: vec![(root.clone(), format!("{err:#}"))],
                    ..RotationReport::default()
                });
            }
        }
    }
    reports
}
