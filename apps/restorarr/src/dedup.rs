use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{DedupConfig, LibraryConfig};
use crate::utils::sha256_file;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupReport {
    pub examined: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub removed_dirs: Vec<PathBuf>,
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
    extensions
        .iter()
        .any(|wanted| wanted.to_lowercase() == ext || wanted.to_lowercase() == ext[1..])
}

fn walk_files(root: &Path) -> impl Iterator<Item = (PathBuf, u64)> + '_ {
    WalkDir::new(root)
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(root = %root.display(), error = %err, "skipping unreadable path");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            Some((entry.into_path(), size))
        })
}

/// Library files grouped by size, with digests computed on first comparison.
struct LibraryIndex {
    by_size: HashMap<u64, Vec<PathBuf>>,
    digests: HashMap<PathBuf, Option<String>>,
}

impl LibraryIndex {
    fn build(dir: &Path) -> Self {
        let mut by_size: HashMap<u64, Vec<PathBuf>> = HashMap::new();
        for (path, size) in walk_files(dir) {
            by_size.entry(size).or_default().push(path);
        }
        Self {
            by_size,
            digests: HashMap::new(),
        }
    }

    fn digest(&mut self, path: &Path) -> Option<String> {
        self.digests
            .entry(path.to_path_buf())
            .or_insert_with(|| match sha256_file(path) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "could not hash library file"
                    );
                    None
                }
            })
            .clone()
    }

    /// Finds a library file with the same content that is not `download` itself.
    fn find_copy(&mut self, download: &Path, size: u64, digest: &str) -> Option<PathBuf> {
        let download = fs::canonicalize(download).unwrap_or_else(|_| download.to_path_buf());
        let candidates = self.by_size.get(&size)?.clone();
        candidates.into_iter().find(|candidate| {
            let same_file = fs::canonicalize(candidate)
                .map(|candidate| candidate == download)
                .unwrap_or(false);
            !same_file && self.digest(candidate).as_deref() == Some(digest)
        })
    }
}

fn dedup_library(download_dir: &Path, library: &LibraryConfig, report: &mut DedupReport) {
    if !library.dir.is_dir() {
        tracing::warn!(
            library = %library.name,
            dir = %library.dir.display(),
            "library directory missing; skipping"
        );
        return;
    }
    let downloads: Vec<(PathBuf, u64)> = walk_files(download_dir)
        .filter(|(path, _)| has_extension(path, &library.extensions))
        .collect();
    if downloads.is_empty() {
        tracing::info!(library = %library.name, "no matching downloads");
        return;
    }
    tracing::info!(
        library = %library.name,
        files = downloads.len(),
        "checking downloads against library"
    );

    let mut index = LibraryIndex::build(&library.dir);
    for (path, size) in downloads {
        report.examined += 1;
        if !index.by_size.contains_key(&size) {
            continue;
        }
        let digest = match sha256_file(&path) {
            Ok(digest) => digest,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "could not hash download"
                );
                report.failed.push((path, format!("{err:#}")));
                continue;
            }
        };
        let Some(existing) = index.find_copy(&path, size, &digest) else {
            continue;
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(
                    library = %library.name,
                    path = %path.display(),
                    existing = %existing.display(),
                    "deleted download already in library"
                );
                report.deleted.push(path);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to delete download");
                report.failed.push((path, err.to_string()));
            }
        }
    }
}

/// Removes empty directories under `root` bottom-up, leaving `root` itself.
pub fn remove_empty_dirs(root: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_empty = fs::read_dir(entry.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && fs::remove_dir(entry.path()).is_ok() {
            tracing::info!(dir = %entry.path().display(), "removed empty directory");
            removed.push(entry.into_path());
        }
    }
    removed
}

/// Deletes downloads that already exist byte-for-byte in one of the libraries.
pub fn run_dedup(config: &DedupConfig) -> Result<DedupReport> {
    if !config.download_dir.is_dir() {
        bail!("download directory {} does not exist", config.download_dir.display());
    }
    let mut report = DedupReport::default();
    for library in &config.libraries {
        dedup_library(&config.download_dir, library, &mut report);
    }
    report.removed_dirs = remove_empty_dirs(&config.download_dir);
    Ok(report)
}
