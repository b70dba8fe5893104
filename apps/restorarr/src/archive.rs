use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;

use crate::locator::{BackupCandidate, BackupFormat};
use crate::utils::{
    copy_dir, copy_file_preserving, copy_path, normalize_relative, remove_non_dir, unlink_symlink,
};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("unsafe path {member:?} would escape {}", .root.display())]
    UnsafePath { member: String, root: PathBuf },
    #[error("backup {} does not exist", .0.display())]
    MissingArchive(PathBuf),
    #[error("failed to decode zip {}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("copy failed: {0:#}")]
    Copy(anyhow::Error),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn unsafe_path(member: impl Into<String>, root: &Path) -> Self {
        Self::UnsafePath {
            member: member.into(),
            root: root.to_path_buf(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    /// Archive entries or raw paths written, relative to the restore directory.
    pub written: Vec<PathBuf>,
    /// Requested members that the backup did not contain.
    pub missing: Vec<PathBuf>,
}

/// Resolves `member` under `root`, rejecting anything that would land outside it.
/// Existing ancestors are canonicalized so a symlinked directory cannot redirect writes.
pub fn resolve_within(root: &Path, member: &Path) -> Result<PathBuf, ArchiveError> {
    let display = member.display().to_string();
    let normalized =
        normalize_relative(member).ok_or_else(|| ArchiveError::unsafe_path(&display, root))?;
    if normalized.as_os_str().is_empty() {
        return Ok(root.to_path_buf());
    }
    let target = root.join(&normalized);

    let Ok(canonical_root) = root.canonicalize() else {
        return Ok(target);
    };
    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let canonical = dir
                .canonicalize()
                .map_err(|err| ArchiveError::io(dir, err))?;
            if !canonical.starts_with(&canonical_root) {
                return Err(ArchiveError::unsafe_path(display, root));
            }
            break;
        }
        ancestor = dir.parent();
    }
    Ok(target)
}

fn member_matches(entry: &Path, member: &Path) -> bool {
    member.as_os_str().is_empty() || entry.starts_with(member)
}

/// Materializes `members` of `backup` under `restore_dir`.
pub fn extract_members(
    backup: &BackupCandidate,
    members: &[PathBuf],
    restore_dir: &Path,
) -> Result<ExtractReport, ArchiveError> {
    if !backup.path.exists() {
        return Err(ArchiveError::MissingArchive(backup.path.clone()));
    }
    for member in members {
        resolve_within(restore_dir, member)?;
    }
    fs::create_dir_all(restore_dir).map_err(|err| ArchiveError::io(restore_dir, err))?;

    match backup.format {
        BackupFormat::Zip => extract_zip(&backup.path, members, restore_dir),
        BackupFormat::Tar => extract_tar(&backup.path, members, restore_dir),
        BackupFormat::Raw if backup.is_dir => copy_raw_tree(&backup.path, members, restore_dir),
        BackupFormat::Raw => copy_raw_file(&backup.path, members, restore_dir),
    }
}

fn plan_missing(members: &[PathBuf], matched: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
    members
        .iter()
        .filter(|member| !matched.contains(*member))
        .cloned()
        .collect()
}

fn log_missing(backup: &Path, missing: &[PathBuf]) {
    for member in missing {
        tracing::warn!(
            backup = %backup.display(),
            member = %member.display(),
            "member not present in backup; skipping"
        );
    }
}

fn extract_zip(
    path: &Path,
    members: &[PathBuf],
    restore_dir: &Path,
) -> Result<ExtractReport, ArchiveError> {
    let zip_err = |source: zip::result::ZipError| ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::open(path).map_err(|err| ArchiveError::io(path, err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_err)?;

    // Every entry is checked before anything is written.
    let mut planned: Vec<(String, PathBuf)> = Vec::new();
    let mut matched = BTreeSet::new();
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    for name in names {
        let target = resolve_within(restore_dir, Path::new(&name))?;
        let relative = target
            .strip_prefix(restore_dir)
            .unwrap_or(&target)
            .to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let mut wanted = false;
        for member in members.iter().filter(|member| member_matches(&relative, member)) {
            matched.insert(member.clone());
            wanted = true;
        }
        if wanted {
            planned.push((name.clone(), relative));
        }
    }

    let mut report = ExtractReport {
        missing: plan_missing(members, &matched),
        ..ExtractReport::default()
    };
    log_missing(path, &report.missing);

    for (name, relative) in planned {
        let target = restore_dir.join(&relative);
        let mut entry = archive.by_name(&name).map_err(zip_err)?;
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| ArchiveError::io(&target, err))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| ArchiveError::io(parent, err))?;
        }
        remove_non_dir(&target).map_err(ArchiveError::Copy)?;
        let mut out = fs::File::create(&target).map_err(|err| ArchiveError::io(&target, err))?;
        io::copy(&mut entry, &mut out).map_err(|err| ArchiveError::io(&target, err))?;
        tracing::debug!(entry = %name, target = %target.display(), "extracted zip entry");
        report.written.push(relative);
    }
    Ok(report)
}

fn open_tar(path: &Path) -> Result<tar::Archive<Box<dyn Read>>, ArchiveError> {
    let file = fs::File::open(path).map_err(|err| ArchiveError::io(path, err))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let reader: Box<dyn Read> = if name.ends_with(".gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

fn is_content_entry(kind: EntryType) -> bool {
    matches!(
        kind,
        EntryType::Regular
            | EntryType::Continuous
            | EntryType::Directory
            | EntryType::Symlink
            | EntryType::Link
            | EntryType::GNUSparse
    )
}

fn check_tar_link(
    entry: &tar::Entry<'_, Box<dyn Read>>,
    relative: &Path,
    restore_dir: &Path,
) -> Result<(), ArchiveError> {
    let kind = entry.header().entry_type();
    let link = entry
        .link_name()
        .map_err(|err| ArchiveError::io(restore_dir, err))?;
    let Some(link) = link else {
        return Ok(());
    };
    let resolved = match kind {
        EntryType::Symlink => relative
            .parent()
            .map(|parent| parent.join(&link))
            .unwrap_or_else(|| link.to_path_buf()),
        _ => link.to_path_buf(),
    };
    if normalize_relative(&resolved).is_none() {
        return Err(ArchiveError::unsafe_path(
            format!("{} -> {}", relative.display(), link.display()),
            restore_dir,
        ));
    }
    Ok(())
}

fn extract_tar(
    path: &Path,
    members: &[PathBuf],
    restore_dir: &Path,
) -> Result<ExtractReport, ArchiveError> {
    let mut matched = BTreeSet::new();
    let mut planned = BTreeSet::new();
    {
        let mut archive = open_tar(path)?;
        let entries = archive.entries().map_err(|err| ArchiveError::io(path, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| ArchiveError::io(path, err))?;
            if !is_content_entry(entry.header().entry_type()) {
                continue;
            }
            let raw = entry
                .path()
                .map_err(|err| ArchiveError::io(path, err))?
                .into_owned();
            let target = resolve_within(restore_dir, &raw)?;
            let relative = target
                .strip_prefix(restore_dir)
                .unwrap_or(&target)
                .to_path_buf();
            check_tar_link(&entry, &relative, restore_dir)?;
            if relative.as_os_str().is_empty() {
                continue;
            }
            let mut wanted = false;
            for member in members.iter().filter(|member| member_matches(&relative, member)) {
                matched.insert(member.clone());
                wanted = true;
            }
            if wanted {
                planned.insert(relative);
            }
        }
    }

    let mut report = ExtractReport {
        missing: plan_missing(members, &matched),
        ..ExtractReport::default()
    };
    log_missing(path, &report.missing);
    if planned.is_empty() {
        return Ok(report);
    }

    let mut archive = open_tar(path)?;
    let entries = archive.entries().map_err(|err| ArchiveError::io(path, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| ArchiveError::io(path, err))?;
        if !is_content_entry(entry.header().entry_type()) {
            continue;
        }
        let raw = entry
            .path()
            .map_err(|err| ArchiveError::io(path, err))?
            .into_owned();
        let Some(relative) = normalize_relative(&raw) else {
            return Err(ArchiveError::unsafe_path(raw.display().to_string(), restore_dir));
        };
        if !planned.contains(&relative) {
            continue;
        }
        let unpacked = entry
            .unpack_in(restore_dir)
            .map_err(|err| ArchiveError::io(&restore_dir.join(&relative), err))?;
        if !unpacked {
            return Err(ArchiveError::unsafe_path(raw.display().to_string(), restore_dir));
        }
        tracing::debug!(entry = %raw.display(), "extracted tar entry");
        report.written.push(relative);
    }
    Ok(report)
}

fn copy_raw_tree(
    backup_dir: &Path,
    members: &[PathBuf],
    restore_dir: &Path,
) -> Result<ExtractReport, ArchiveError> {
    let mut report = ExtractReport::default();
    for member in members {
        let source = backup_dir.join(member);
        if !source.exists() {
            report.missing.push(member.clone());
            continue;
        }
        let target = resolve_within(restore_dir, member)?;
        if member.as_os_str().is_empty() {
            copy_dir(&source, &target).map_err(ArchiveError::Copy)?;
        } else {
            unlink_symlink(&target).map_err(ArchiveError::Copy)?;
            copy_path(&source, &target).map_err(ArchiveError::Copy)?;
        }
        report.written.push(member.clone());
    }
    log_missing(backup_dir, &report.missing);
    Ok(report)
}

/// A plain file backup restores onto the member with the same file name, or onto the
/// only requested member when exactly one is configured.
fn copy_raw_file(
    backup_file: &Path,
    members: &[PathBuf],
    restore_dir: &Path,
) -> Result<ExtractReport, ArchiveError> {
    let mut report = ExtractReport::default();
    let file_name = backup_file.file_name().map(PathBuf::from).unwrap_or_default();
    for member in members {
        let destination = if member.as_os_str().is_empty() {
            Some(file_name.clone())
        } else if member.file_name() == Some(file_name.as_os_str()) || members.len() == 1 {
            Some(member.clone())
        } else {
            None
        };
        match destination {
            Some(relative) => {
                let target = resolve_within(restore_dir, &relative)?;
                copy_file_preserving(backup_file, &target).map_err(ArchiveError::Copy)?;
                report.written.push(relative);
            }
            None => report.missing.push(member.clone()),
        }
    }
    log_missing(backup_file, &report.missing);
    Ok(report)
}
