use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl CommandResult {
    pub fn detail(&self) -> &str {
        if self.stderr.is_empty() {
            self.stdout.as_str()
        } else {
            self.stderr.as_str()
        }
    }
}

pub fn which<S: AsRef<OsStr>>(cmd: S) -> Option<PathBuf> {
    let cmd_ref = cmd.as_ref();
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let candidate = dir.join(cmd_ref);
            if candidate.exists() {
                Some(candidate)
            } else {
                None
            }
        })
    })
}

pub fn run_cmd_capture(mut command: Command) -> Result<CommandResult> {
    let mut command_display = command.get_program().to_string_lossy().to_string();
    for arg in command.get_args() {
        command_display.push(' ');
        command_display.push_str(&arg.to_string_lossy());
    }
    let output = command
        .output()
        .with_context(|| format!("Failed to run {command_display}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Ok(CommandResult {
        command: command_display,
        ok: output.status.success(),
        stdout,
        stderr,
        returncode: output.status.code().unwrap_or(-1),
    })
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Lexically normalizes a relative member path. Returns `None` when the path is
/// absolute or climbs above its root; an empty path means the root itself.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

/// Unlinks a file or symlink at `path` so the next write creates a fresh inode
/// instead of following a link.
pub fn remove_non_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display())),
        _ => Ok(()),
    }
}

/// Removes `path` if it is a symlink, leaving the link target alone.
pub fn unlink_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path)
            .with_context(|| format!("Failed to remove symlink {}", path.display())),
        _ => Ok(()),
    }
}

/// Copies a single file and carries its permission bits and modification time over.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    remove_non_dir(dst)?;
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy file {} -> {}", src.display(), dst.display()))?;
    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, fs::Permissions::from_mode(meta.permissions().mode()))
        .with_context(|| format!("Failed to chmod {}", dst.display()))?;
    if let Ok(modified) = meta.modified() {
        let file = fs::File::open(dst)
            .with_context(|| format!("Failed to open {}", dst.display()))?;
        file.set_modified(modified)
            .with_context(|| format!("Failed to set mtime on {}", dst.display()))?;
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, merging with whatever already exists there.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("{} is not a directory", src.display());
    }
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory {}", dst.display()))?;
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("Failed while walking {}", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            // Symlinked subdirectories in `dst` are replaced, never written through.
            if !rel.as_os_str().is_empty() {
                unlink_symlink(&target)?;
            }
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {}", target.display()))?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            let link_target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink {}", entry.path().display()))?;
            if target.exists() || target.is_symlink() {
                fs::remove_file(&target)
                    .with_context(|| format!("Failed to remove {}", target.display()))?;
            }
            symlink(link_target, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else if entry.file_type().is_file() {
            copy_file_preserving(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copies a file or a directory tree to `dst`.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        copy_dir(src, dst)
    } else {
        copy_file_preserving(src, dst)
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
