use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH, DEFAULT_ROTATION_KEEP, PASSTHROUGH_APP,
    WHOLE_BACKUP_MEMBER,
};
use crate::utils::normalize_relative;

pub fn resolve_config_path(path: Option<PathBuf>) -> PathBuf {
    path.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{field} must be an absolute path (got {path})")]
    RelativePath { field: &'static str, path: String },
    #[error("files_to_restore must list at least one path")]
    EmptyFileList,
    #[error("{field} entry {path:?} must be relative and stay inside restore_dir")]
    UnsafeMember { field: &'static str, path: String },
    #[error("invalid octal mode {mode:?} for {path}")]
    InvalidMode { path: String, mode: String },
    #[error("malformed application entry: {0}")]
    Malformed(String),
}

/// Application entry exactly as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAppConfig {
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub backup_ext: String,
    #[serde(default)]
    pub restore_dir: String,
    #[serde(default, alias = "files")]
    pub files_to_restore: Vec<String>,
    #[serde(default)]
    pub file_permissions: BTreeMap<String, String>,
    #[serde(default)]
    pub file_ownerships: BTreeMap<String, (u32, u32)>,
    #[serde(default)]
    pub service: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRule {
    pub path: PathBuf,
    pub mode: Option<u32>,
    pub ownership: Option<(u32, u32)>,
}

/// Validated restore settings for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppRestoreSpec {
    pub name: String,
    pub backup_dir: PathBuf,
    pub backup_ext: String,
    pub restore_dir: PathBuf,
    pub files_to_restore: Vec<PathBuf>,
    pub permissions: Vec<PermissionRule>,
    pub is_service: bool,
}

impl AppRestoreSpec {
    pub fn from_raw(name: &str, raw: RawAppConfig) -> Result<Self, ConfigError> {
        let backup_dir = absolute_dir("backup_dir", &raw.backup_dir)?;
        let restore_dir = absolute_dir("restore_dir", &raw.restore_dir)?;

        if raw.files_to_restore.is_empty() {
            return Err(ConfigError::EmptyFileList);
        }
        let mut files_to_restore = Vec::with_capacity(raw.files_to_restore.len());
        for file in &raw.files_to_restore {
            let member = safe_member("files_to_restore", file)?;
            if member.as_os_str().is_empty() && file.trim() != WHOLE_BACKUP_MEMBER {
                return Err(ConfigError::UnsafeMember {
                    field: "files_to_restore",
                    path: file.clone(),
                });
            }
            if !files_to_restore.contains(&member) {
                files_to_restore.push(member);
            }
        }

        let mut permissions: Vec<PermissionRule> = Vec::new();
        for (path, mode) in &raw.file_permissions {
            let parsed = parse_mode(mode).ok_or_else(|| ConfigError::InvalidMode {
                path: path.clone(),
                mode: mode.clone(),
            })?;
            permissions.push(PermissionRule {
                path: safe_member("file_permissions", path)?,
                mode: Some(parsed),
                ownership: None,
            });
        }
        for (path, ids) in &raw.file_ownerships {
            let path = safe_member("file_ownerships", path)?;
            match permissions.iter_mut().find(|rule| rule.path == path) {
                Some(rule) => rule.ownership = Some(*ids),
                None => permissions.push(PermissionRule {
                    path,
                    mode: None,
                    ownership: Some(*ids),
                }),
            }
        }

        let is_service = name != PASSTHROUGH_APP && raw.service.unwrap_or(true);

        Ok(Self {
            name: name.to_string(),
            backup_dir,
            backup_ext: raw.backup_ext.trim().to_string(),
            restore_dir,
            files_to_restore,
            permissions,
            is_service,
        })
    }
}

fn absolute_dir(field: &'static str, value: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    let path = PathBuf::from(trimmed);
    if !path.is_absolute() {
        return Err(ConfigError::RelativePath {
            field,
            path: trimmed.to_string(),
        });
    }
    Ok(path)
}

fn safe_member(field: &'static str, value: &str) -> Result<PathBuf, ConfigError> {
    normalize_relative(Path::new(value.trim())).ok_or_else(|| ConfigError::UnsafeMember {
        field,
        path: value.to_string(),
    })
}

/// Parses an octal permission string such as `644`, `0644` or `0o2775`.
pub fn parse_mode(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0o")
        .or_else(|| trimmed.strip_prefix("0O"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    let mode = u32::from_str_radix(digits, 8).ok()?;
    (mode <= 0o7777).then_some(mode)
}

#[derive(Debug, Clone, Serialize)]
pub struct AppEntry {
    pub name: String,
    #[serde(serialize_with = "serialize_validation")]
    pub spec: Result<AppRestoreSpec, ConfigError>,
}

fn serialize_validation<S: serde::Serializer>(
    spec: &Result<AppRestoreSpec, ConfigError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(1))?;
    match spec {
        Ok(spec) => map.serialize_entry("valid", spec)?,
        Err(err) => map.serialize_entry("invalid", &err.to_string())?,
    }
    map.end()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_rotation_keep")]
    pub keep: usize,
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
}

fn default_rotation_keep() -> usize {
    DEFAULT_ROTATION_KEEP
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            keep: default_rotation_keep(),
            extra_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    pub dir: PathBuf,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    pub download_dir: PathBuf,
    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreConfig {
    pub apps: Vec<AppEntry>,
    pub rotation: RotationConfig,
    pub dedup: Option<DedupConfig>,
}

impl RestoreConfig {
    /// Distinct backup roots of every valid application, in configuration order.
    pub fn backup_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for entry in &self.apps {
            if let Ok(spec) = &entry.spec {
                if !roots.contains(&spec.backup_dir) {
                    roots.push(spec.backup_dir.clone());
                }
            }
        }
        for dir in &self.rotation.extra_dirs {
            if !roots.contains(dir) {
                roots.push(dir.clone());
            }
        }
        roots
    }
}

pub fn load_config(path: &Path) -> Result<RestoreConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Failed to parse config at {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<RestoreConfig> {
    let value: Value = serde_json::from_str(contents)?;
    let Value::Object(mut root) = value else {
        bail!("top-level value must be a JSON object");
    };

    let structured = matches!(root.get("apps"), Some(Value::Object(_)));
    let (apps, rotation, dedup) = if structured {
        let apps = match root.remove("apps") {
            Some(Value::Object(apps)) => apps,
            _ => serde_json::Map::new(),
        };
        let rotation = match root.remove("rotation") {
            Some(value) => serde_json::from_value(value).context("invalid rotation block")?,
            None => RotationConfig::default(),
        };
        let dedup = match root.remove("dedup") {
            Some(value) => Some(serde_json::from_value(value).context("invalid dedup block")?),
            None => None,
        };
        (apps, rotation, dedup)
    } else {
        (root, RotationConfig::default(), None)
    };

    let apps = apps
        .into_iter()
        .map(|(name, value)| {
            let spec = serde_json::from_value::<RawAppConfig>(value)
                .map_err(|err| ConfigError::Malformed(err.to_string()))
                .and_then(|raw| AppRestoreSpec::from_raw(&name, raw));
            AppEntry { name, spec }
        })
        .collect();

    Ok(RestoreConfig {
        apps,
        rotation,
        dedup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(backup_dir: &str, restore_dir: &str, files: &[&str]) -> RawAppConfig {
        RawAppConfig {
            backup_dir: backup_dir.to_string(),
            restore_dir: restore_dir.to_string(),
            files_to_restore: files.iter().map(|f| f.to_string()).collect(),
            ..RawAppConfig::default()
        }
    }

    #[test]
    fn relative_and_missing_directories_are_rejected() {
        let err = AppRestoreSpec::from_raw("sonarr", raw("backups", "/r", &["a"])).unwrap_err();
        assert!(matches!(err, ConfigError::RelativePath { field: "backup_dir", .. }));

        let err = AppRestoreSpec::from_raw("sonarr", raw("/b", "", &["a"])).unwrap_err();
        assert_eq!(err, ConfigError::MissingField("restore_dir"));

        let err = AppRestoreSpec::from_raw("sonarr", raw("/b", "/r", &[])).unwrap_err();
        assert_eq!(err, ConfigError::EmptyFileList);
    }

    #[test]
    fn escaping_members_are_rejected() {
        let err =
            AppRestoreSpec::from_raw("sonarr", raw("/b", "/r", &["../../etc/passwd"])).unwrap_err();
        assert!(matches!(err, ConfigError::UnsafeMember { .. }));

        let err = AppRestoreSpec::from_raw("sonarr", raw("/b", "/r", &["a/.."])).unwrap_err();
        assert!(matches!(err, ConfigError::UnsafeMember { .. }));

        let spec = AppRestoreSpec::from_raw("sonarr", raw("/b", "/r", &["."])).unwrap();
        assert_eq!(spec.files_to_restore, vec![PathBuf::new()]);
    }

    #[test]
    fn modes_parse_as_octal() {
        assert_eq!(parse_mode("644"), Some(0o644));
        assert_eq!(parse_mode("0755"), Some(0o755));
        assert_eq!(parse_mode("0o2775"), Some(0o2775));
        assert_eq!(parse_mode("888"), None);
        assert_eq!(parse_mode("17777"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[test]
    fn ownership_is_attached_only_where_declared() {
        let mut config = raw("/b", "/r", &["app.db", "config.xml"]);
        config
            .file_permissions
            .insert("app.db".to_string(), "600".to_string());
        config
            .file_permissions
            .insert("config.xml".to_string(), "644".to_string());
        config
            .file_ownerships
            .insert("app.db".to_string(), (1000, 1000));
        config
            .file_ownerships
            .insert("logs".to_string(), (1001, 1001));

        let spec = AppRestoreSpec::from_raw("radarr", config).unwrap();
        let find = |p: &str| {
            spec.permissions
                .iter()
                .find(|rule| rule.path == Path::new(p))
                .cloned()
                .unwrap()
        };
        assert_eq!(find("app.db").ownership, Some((1000, 1000)));
        assert_eq!(find("config.xml").ownership, None);
        assert_eq!(find("logs").mode, None);
        assert_eq!(find("logs").ownership, Some((1001, 1001)));
    }

    #[test]
    fn passthrough_name_and_flag_disable_service_control() {
        let spec = AppRestoreSpec::from_raw("system", raw("/b", "/r", &["a"])).unwrap();
        assert!(!spec.is_service);

        let mut config = raw("/b", "/r", &["a"]);
        config.service = Some(false);
        let spec = AppRestoreSpec::from_raw("scripts", config).unwrap();
        assert!(!spec.is_service);

        let spec = AppRestoreSpec::from_raw("plexmediaserver", raw("/b", "/r", &["a"])).unwrap();
        assert!(spec.is_service);
    }

    #[test]
    fn structured_config_keeps_order_and_isolates_bad_entries() {
        let contents = r#"{
            "apps": {
                "zeta": {"backup_dir": "/b/zeta", "restore_dir": "/r/zeta", "files_to_restore": ["z.db"]},
                "alpha": {"backup_dir": "relative", "restore_dir": "/r/alpha", "files_to_restore": ["a.db"]},
                "mid": {"backup_dir": "/b/mid", "restore_dir": "/r/mid", "files_to_restore": "nope"}
            },
            "rotation": {"keep": 5},
            "dedup": {"download_dir": "/downloads", "libraries": [
                {"name": "music", "dir": "/media/music", "extensions": [".flac"]}
            ]}
        }"#;
        let config = parse_config(contents).unwrap();
        let names: Vec<&str> = config.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert!(config.apps[0].spec.is_ok());
        assert!(matches!(
            config.apps[1].spec,
            Err(ConfigError::RelativePath { .. })
        ));
        assert!(matches!(config.apps[2].spec, Err(ConfigError::Malformed(_))));
        assert_eq!(config.rotation.keep, 5);
        assert_eq!(config.dedup.as_ref().unwrap().libraries.len(), 1);
        assert_eq!(config.backup_roots(), vec![PathBuf::from("/b/zeta")]);
    }

    #[test]
    fn flat_layout_is_read_as_app_map() {
        let contents = r#"{
            "bazarr": {"backup_dir": "/b", "backup_ext": ".zip", "restore_dir": "/r",
                       "files": ["db/bazarr.db"], "file_ownerships": {"db/bazarr.db": [1000, 100]}}
        }"#;
        let config = parse_config(contents).unwrap();
        assert_eq!(config.apps.len(), 1);
        let spec = config.apps[0].spec.as_ref().unwrap();
        assert_eq!(spec.backup_ext, ".zip");
        assert_eq!(spec.files_to_restore, vec![PathBuf::from("db/bazarr.db")]);
        assert_eq!(config.rotation, RotationConfig::default());
        assert!(config.dedup.is_none());
    }

    #[test]
    fn config_path_prefers_explicit_flag() {
        let explicit = PathBuf::from("/tmp/explicit.json");
        assert_eq!(resolve_config_path(Some(explicit.clone())), explicit);
    }
}
