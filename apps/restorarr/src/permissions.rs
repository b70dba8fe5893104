use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::PermissionRule;
use crate::utils::is_root;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PermissionReport {
    pub applied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl PermissionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn apply_rule(target: &Path, rule: &PermissionRule) -> Result<(), String> {
    let mut errors = Vec::new();
    if let Some(mode) = rule.mode {
        if let Err(err) = fs::set_permissions(target, fs::Permissions::from_mode(mode)) {
            errors.push(format!("chmod {mode:o}: {err}"));
        }
    }
    if let Some((uid, gid)) = rule.ownership {
        if let Err(err) = std::os::unix::fs::chown(target, Some(uid), Some(gid)) {
            errors.push(format!("chown {uid}:{gid}: {err}"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Applies declared modes and ownerships under `restore_dir`, one path at a time.
pub fn reconcile_permissions(restore_dir: &Path, rules: &[PermissionRule]) -> PermissionReport {
    let mut report = PermissionReport::default();
    if rules.iter().any(|rule| rule.ownership.is_some()) && !is_root() {
        tracing::warn!("not running as root; ownership changes will likely be refused");
    }

    for rule in rules {
        let target = restore_dir.join(&rule.path);
        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(_) => {
                tracing::warn!(path = %target.display(), "permission target missing; skipping");
                report.skipped.push(rule.path.clone());
                continue;
            }
        };
        // chmod and chown follow links, which could reach outside restore_dir.
        if meta.file_type().is_symlink() {
            tracing::warn!(path = %target.display(), "permission target is a symlink; refusing");
            report
                .failed
                .push((rule.path.clone(), "refusing to follow symlink".to_string()));
            continue;
        }
        match apply_rule(&target, rule) {
            Ok(()) => {
                tracing::info!(
                    path = %target.display(),
                    mode = ?rule.mode.map(|mode| format!("{mode:o}")),
                    ownership = ?rule.ownership,
                    "permissions applied"
                );
                report.applied.push(rule.path.clone());
            }
            Err(err) => {
                tracing::warn!(path = %target.display(), error = %err, "permission change failed");
                report.failed.push((rule.path.clone(), err));
            }
        }
    }
    report
}
