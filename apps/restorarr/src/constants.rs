pub const DEFAULT_CONFIG_PATH: &str = "/etc/restorarr/restore_apps.json";
pub const CONFIG_ENV_VAR: &str = "RESTORARR_CONFIG";

/// Subdirectory of a restore target that receives pre-restore copies.
pub const BACKUP_ORIG_DIR: &str = "backup_orig";

/// Application name that never maps to an OS service.
pub const PASSTHROUGH_APP: &str = "system";

/// Member name meaning "everything in the backup".
pub const WHOLE_BACKUP_MEMBER: &str = ".";

pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_ROTATION_KEEP: usize = 3;
