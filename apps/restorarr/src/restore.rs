use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::extract_members;
use crate::config::{AppEntry, AppRestoreSpec};
use crate::constants::DEFAULT_STOP_TIMEOUT_SECS;
use crate::locator::find_latest_backup;
use crate::permissions::reconcile_permissions;
use crate::service::ServiceManager;
use crate::snapshot::snapshot_existing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Restored,
    NoBackupFound,
    ConfigInvalid,
    ExtractionFailed,
    PermissionFailed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restored => "restored",
            Self::NoBackupFound => "no_backup_found",
            Self::ConfigInvalid => "config_invalid",
            Self::ExtractionFailed => "extraction_failed",
            Self::PermissionFailed => "permission_failed",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline position of one application's restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validated,
    Stopped,
    Snapshotted,
    Located,
    Extracted,
    Reconciled,
    Started,
    Done,
    Aborted,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Stopped => "stopped",
            Self::Snapshotted => "snapshotted",
            Self::Located => "located",
            Self::Extracted => "extracted",
            Self::Reconciled => "reconciled",
            Self::Started => "started",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub app: String,
    pub kind: OutcomeKind,
    /// Terminal stage: `Done` on success, `Aborted` otherwise.
    pub stage: Stage,
    pub backup: Option<PathBuf>,
    pub message: Option<String>,
}

impl RestoreOutcome {
    fn aborted(app: &str, kind: OutcomeKind, message: String) -> Self {
        Self {
            app: app.to_string(),
            kind,
            stage: Stage::Aborted,
            backup: None,
            message: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Restored
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Upper bound on waiting for a stopped unit to report inactive.
    pub stop_timeout: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
        }
    }
}

fn stop_service(
    spec: &AppRestoreSpec,
    services: &dyn ServiceManager,
    options: &RestoreOptions,
) -> bool {
    if !spec.is_service {
        tracing::info!(stage = %Stage::Stopped, "pass-through application; no service to stop");
        return false;
    }
    match services.stop(&spec.name) {
        Ok(()) => {
            if !services.wait_inactive(&spec.name, options.stop_timeout) {
                tracing::warn!(
                    stage = %Stage::Stopped,
                    timeout_secs = options.stop_timeout.as_secs(),
                    "service still reports active; continuing"
                );
            } else {
                tracing::info!(stage = %Stage::Stopped, "service stopped");
            }
            true
        }
        Err(err) => {
            tracing::warn!(stage = %Stage::Stopped, error = %err, "service stop failed; continuing");
            false
        }
    }
}

fn start_service(spec: &AppRestoreSpec, services: &dyn ServiceManager) -> Option<String> {
    if !spec.is_service {
        return None;
    }
    match services.start(&spec.name) {
        Ok(()) => {
            tracing::info!(stage = %Stage::Started, "service started");
            None
        }
        Err(err) => {
            tracing::error!(stage = %Stage::Started, error = %err, "service start failed");
            Some(format!("service start failed: {err}"))
        }
    }
}

fn run_pipeline(
    spec: &AppRestoreSpec,
    services: &dyn ServiceManager,
    options: &RestoreOptions,
) -> RestoreOutcome {
    tracing::info!(
        stage = %Stage::Validated,
        backup_dir = %spec.backup_dir.display(),
        restore_dir = %spec.restore_dir.display(),
        "starting restore"
    );

    let stopped = stop_service(spec, services, options);

    if let Err(err) = fs::create_dir_all(&spec.restore_dir) {
        tracing::warn!(
            stage = %Stage::Snapshotted,
            error = %err,
            "could not create restore directory"
        );
    }
    let snapshot = snapshot_existing(&spec.restore_dir, &spec.files_to_restore);
    tracing::info!(
        stage = %Stage::Snapshotted,
        copied = snapshot.copied.len(),
        skipped = snapshot.skipped.len(),
        failed = snapshot.failed.len(),
        "snapshot pass finished"
    );

    let Some(backup) = find_latest_backup(&spec.backup_dir, &spec.backup_ext) else {
        tracing::error!(
            stage = %Stage::Aborted,
            backup_dir = %spec.backup_dir.display(),
            ext = %spec.backup_ext,
            "no eligible backup found"
        );
        let mut message = format!(
            "no backup matching {:?} in {}",
            spec.backup_ext,
            spec.backup_dir.display()
        );
        // Nothing was overwritten, so the service goes back up.
        if stopped {
            if let Some(err) = start_service(spec, services) {
                message = format!("{message}; {err}");
            }
        }
        return RestoreOutcome::aborted(&spec.name, OutcomeKind::NoBackupFound, message);
    };
    tracing::info!(
        stage = %Stage::Located,
        backup = %backup.path.display(),
        format = %backup.format,
        modified = %backup.modified_rfc3339(),
        "selected backup"
    );

    let extracted = match extract_members(&backup, &spec.files_to_restore, &spec.restore_dir) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(
                stage = %Stage::Aborted,
                backup = %backup.path.display(),
                error = %err,
                "extraction failed; pre-restore copies remain in backup_orig"
            );
            let mut outcome =
                RestoreOutcome::aborted(&spec.name, OutcomeKind::ExtractionFailed, err.to_string());
            outcome.backup = Some(backup.path);
            return outcome;
        }
    };
    tracing::info!(
        stage = %Stage::Extracted,
        written = extracted.written.len(),
        missing = extracted.missing.len(),
        "backup extracted"
    );

    let permissions = reconcile_permissions(&spec.restore_dir, &spec.permissions);
    tracing::info!(
        stage = %Stage::Reconciled,
        applied = permissions.applied.len(),
        skipped = permissions.skipped.len(),
        failed = permissions.failed.len(),
        "permissions reconciled"
    );

    let mut notes = Vec::new();
    let kind = if permissions.is_clean() {
        OutcomeKind::Restored
    } else {
        let paths: Vec<String> = permissions
            .failed
            .iter()
            .map(|(path, err)| format!("{}: {err}", path.display()))
            .collect();
        notes.push(format!("permission changes failed ({})", paths.join(", ")));
        OutcomeKind::PermissionFailed
    };
    if !extracted.missing.is_empty() {
        let missing: Vec<String> = extracted
            .missing
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        notes.push(format!("missing from backup: {}", missing.join(", ")));
    }
    if let Some(err) = start_service(spec, services) {
        notes.push(err);
    }

    tracing::info!(stage = %Stage::Done, outcome = %kind, "restore finished");
    RestoreOutcome {
        app: spec.name.clone(),
        kind,
        stage: Stage::Done,
        backup: Some(backup.path),
        message: (!notes.is_empty()).then(|| notes.join("; ")),
    }
}

/// Runs one application's pipeline. Every failure ends up in the returned outcome.
pub fn restore_app(
    entry: &AppEntry,
    services: &dyn ServiceManager,
    options: &RestoreOptions,
) -> RestoreOutcome {
    let span = tracing::info_span!("restore", app = %entry.name);
    let _guard = span.enter();

    match &entry.spec {
        Ok(spec) => run_pipeline(spec, services, options),
        Err(err) => {
            tracing::error!(stage = %Stage::Aborted, error = %err, "invalid configuration");
            RestoreOutcome::aborted(&entry.name, OutcomeKind::ConfigInvalid, err.to_string())
        }
    }
}

/// Restores every configured application in order, or only those named in `only`.
pub fn restore_all(
    apps: &[AppEntry],
    only: &[String],
    services: &dyn ServiceManager,
    options: &RestoreOptions,
) -> Vec<RestoreOutcome> {
    apps.iter()
        .filter(|entry| only.is_empty() || only.iter().any(|name| name == &entry.name))
        .map(|entry| restore_app(entry, services, options))
        .collect()
}

pub fn render_summary(outcomes: &[RestoreOutcome]) -> String {
    let app_width = outcomes
        .iter()
        .map(|outcome| outcome.app.len())
        .chain(std::iter::once("APP".len()))
        .max()
        .unwrap_or(3);
    let kind_width = outcomes
        .iter()
        .map(|outcome| outcome.kind.as_str().len())
        .chain(std::iter::once("OUTCOME".len()))
        .max()
        .unwrap_or(7);

    let mut lines = vec![format!(
        "{:<app_width$}  {:<kind_width$}  DETAIL",
        "APP", "OUTCOME"
    )];
    for outcome in outcomes {
        let detail = match (&outcome.message, &outcome.backup) {
            (Some(message), _) => message.clone(),
            (None, Some(backup)) => format!("from {}", backup.display()),
            (None, None) => String::new(),
        };
        lines.push(
            format!(
                "{:<app_width$}  {:<kind_width$}  {detail}",
                outcome.app,
                outcome.kind.as_str()
            )
            .trim_end()
            .to_string(),
        );
    }
    let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
    lines.push(format!(
        "{} application(s): {} restored, {failed} failed",
        outcomes.len(),
        outcomes.len() - failed
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, PermissionRule};
    use crate::service::ServiceError;
    use std::cell::RefCell;
    use std::io::Write;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingServices {
        calls: RefCell<Vec<String>>,
        fail_stop: bool,
        fail_start: bool,
    }

    impl RecordingServices {
        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl ServiceManager for RecordingServices {
        fn stop(&self, name: &str) -> Result<(), ServiceError> {
            self.calls.borrow_mut().push(format!("stop {name}"));
            if self.fail_stop {
                return Err(ServiceError::Spawn("denied".to_string()));
            }
            Ok(())
        }

        fn start(&self, name: &str) -> Result<(), ServiceError> {
            self.calls.borrow_mut().push(format!("start {name}"));
            if self.fail_start {
                return Err(ServiceError::CommandFailed {
                    command: format!("systemctl start {name}"),
                    code: 1,
                    detail: "unit failed".to_string(),
                });
            }
            Ok(())
        }
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    fn spec(name: &str, backup: &Path, restore: &Path, files: &[&str]) -> AppRestoreSpec {
        AppRestoreSpec {
            name: name.to_string(),
            backup_dir: backup.to_path_buf(),
            backup_ext: ".zip".to_string(),
            restore_dir: restore.to_path_buf(),
            files_to_restore: files.iter().map(PathBuf::from).collect(),
            permissions: Vec::new(),
            is_service: true,
        }
    }

    fn entry(spec: AppRestoreSpec) -> AppEntry {
        AppEntry {
            name: spec.name.clone(),
            spec: Ok(spec),
        }
    }

    #[test]
    fn restores_latest_zip_into_fresh_target() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(&backups.join("2024.zip"), &[("app.db", b"from-backup")]);

        let services = RecordingServices::default();
        let outcome = restore_app(
            &entry(spec("sonarr", &backups, &restore, &["app.db"])),
            &services,
            &RestoreOptions::default(),
        );

        assert_eq!(outcome.kind, OutcomeKind::Restored);
        assert_eq!(outcome.stage, Stage::Done);
        assert_eq!(outcome.backup, Some(backups.join("2024.zip")));
        assert_eq!(fs::read(restore.join("app.db")).unwrap(), b"from-backup");
        assert!(!restore.join("backup_orig/app.db").exists());
        assert_eq!(services.calls(), vec!["stop sonarr", "start sonarr"]);
    }

    #[test]
    fn existing_file_is_snapshotted_before_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        fs::create_dir_all(&restore).unwrap();
        fs::write(restore.join("app.db"), "live").unwrap();
        write_zip(&backups.join("2024.zip"), &[("app.db", b"from-backup")]);

        let app = entry(spec("radarr", &backups, &restore, &["app.db"]));
        let services = RecordingServices::default();
        let first = restore_app(&app, &services, &RestoreOptions::default());
        assert!(first.is_success());
        assert_eq!(fs::read_to_string(restore.join("backup_orig/app.db")).unwrap(), "live");

        let second = restore_app(&app, &services, &RestoreOptions::default());
        assert!(second.is_success());
        assert_eq!(fs::read(restore.join("app.db")).unwrap(), b"from-backup");
        assert_eq!(
            fs::read(restore.join("backup_orig/app.db")).unwrap(),
            b"from-backup"
        );
    }

    #[test]
    fn invalid_app_does_not_block_the_next() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(&backups.join("2024.zip"), &[("app.db", b"db")]);

        let apps = vec![
            AppEntry {
                name: "broken".to_string(),
                spec: Err(ConfigError::EmptyFileList),
            },
            entry(spec("lidarr", &backups, &restore, &["app.db"])),
        ];
        let services = RecordingServices::default();
        let outcomes = restore_all(&apps, &[], &services, &RestoreOptions::default());

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].kind, OutcomeKind::ConfigInvalid);
        assert_eq!(outcomes[0].stage, Stage::Aborted);
        assert_eq!(outcomes[1].kind, OutcomeKind::Restored);
        assert_eq!(outcomes[1].stage, Stage::Done);
        assert_eq!(services.calls(), vec!["stop lidarr", "start lidarr"]);
    }

    #[test]
    fn pass_through_app_never_touches_services() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(&backups.join("2024.zip"), &[("fstab", b"tmpfs /tmp")]);

        let mut system = spec("system", &backups, &restore, &["fstab"]);
        system.is_service = false;
        let services = RecordingServices::default();
        let outcome = restore_app(&entry(system), &services, &RestoreOptions::default());

        assert!(outcome.is_success());
        assert!(services.calls().is_empty());
    }

    #[test]
    fn missing_backup_restarts_the_stopped_service() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();

        let services = RecordingServices::default();
        let outcome = restore_app(
            &entry(spec("prowlarr", &backups, &restore, &["app.db"])),
            &services,
            &RestoreOptions::default(),
        );

        assert_eq!(outcome.kind, OutcomeKind::NoBackupFound);
        assert_eq!(services.calls(), vec!["stop prowlarr", "start prowlarr"]);
    }

    #[test]
    fn unsafe_archive_aborts_without_writing() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("nested/r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(
            &backups.join("evil.zip"),
            &[("app.db", b"db"), ("../../etc/passwd", b"root::0:0")],
        );

        let services = RecordingServices::default();
        let outcome = restore_app(
            &entry(spec("readarr", &backups, &restore, &["app.db"])),
            &services,
            &RestoreOptions::default(),
        );

        assert_eq!(outcome.kind, OutcomeKind::ExtractionFailed);
        assert!(outcome.message.unwrap().contains("unsafe path"));
        assert!(!restore.join("app.db").exists());
        assert!(!temp.path().join("etc/passwd").exists());
        assert_eq!(services.calls(), vec!["stop readarr"]);
    }

    #[test]
    fn stop_failure_is_advisory_and_start_failure_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(&backups.join("2024.zip"), &[("config.xml", b"<Config/>")]);

        let services = RecordingServices {
            fail_stop: true,
            fail_start: true,
            ..RecordingServices::default()
        };
        let outcome = restore_app(
            &entry(spec("bazarr", &backups, &restore, &["config.xml"])),
            &services,
            &RestoreOptions::default(),
        );

        assert_eq!(outcome.kind, OutcomeKind::Restored);
        assert!(restore.join("config.xml").exists());
        assert!(outcome
            .message
            .unwrap()
            .contains("service start failed"));
    }

    #[test]
    fn permission_failures_mark_the_outcome() {
        let temp = tempfile::tempdir().unwrap();
        let backups = temp.path().join("b");
        let restore = temp.path().join("r");
        fs::create_dir_all(&backups).unwrap();
        write_zip(&backups.join("2024.zip"), &[("app.db", b"db")]);

        let mut app = spec("whisparr", &backups, &restore, &["app.db"]);
        // A path that exists but is a dangling symlink makes chmod fail.
        fs::create_dir_all(&restore).unwrap();
        std::os::unix::fs::symlink(temp.path().join("nowhere"), restore.join("link")).unwrap();
        app.permissions = vec![
            PermissionRule {
                path: PathBuf::from("link"),
                mode: Some(0o600),
                ownership: None,
            },
            PermissionRule {
                path: PathBuf::from("app.db"),
                mode: Some(0o600),
                ownership: None,
            },
        ];
        let services = RecordingServices::default();
        let outcome = restore_app(&entry(app), &services, &RestoreOptions::default());

        assert_eq!(outcome.kind, OutcomeKind::PermissionFailed);
        assert_eq!(outcome.stage, Stage::Done);
        assert!(outcome.message.unwrap().contains("link"));
        assert_eq!(services.calls(), vec!["stop whisparr", "start whisparr"]);
    }

    #[test]
    fn filter_selects_named_apps() {
        let apps = vec![
            AppEntry {
                name: "a".to_string(),
                spec: Err(ConfigError::EmptyFileList),
            },
            AppEntry {
                name: "b".to_string(),
                spec: Err(ConfigError::MissingField("restore_dir")),
            },
        ];
        let services = RecordingServices::default();
        let outcomes = restore_all(
            &apps,
            &["b".to_string()],
            &services,
            &RestoreOptions::default(),
        );
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].app, "b");
    }

    #[test]
    fn summary_lists_each_app() {
        let outcomes = vec![
            RestoreOutcome {
                app: "sonarr".to_string(),
                kind: OutcomeKind::Restored,
                stage: Stage::Done,
                backup: Some(PathBuf::from("/b/2024.zip")),
                message: None,
            },
            RestoreOutcome::aborted("radarr", OutcomeKind::NoBackupFound, "nothing".to_string()),
        ];
        let summary = render_summary(&outcomes);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "APP     OUTCOME          DETAIL");
        assert_eq!(lines[1], "sonarr  restored         from /b/2024.zip");
        assert_eq!(lines[2], "radarr  no_backup_found  nothing");
        assert_eq!(lines[3], "2 application(s): 1 restored, 1 failed");
    }
}
