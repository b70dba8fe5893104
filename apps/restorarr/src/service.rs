use std::process::Command;
use std::time::{Duration, Instant};

use crate::utils::{is_root, run_cmd_capture, which, CommandResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{command} failed (exit {code}): {detail}")]
    CommandFailed {
        command: String,
        code: i32,
        detail: String,
    },
    #[error("could not run service manager: {0}")]
    Spawn(String),
}

/// Transitions OS-managed units by name.
pub trait ServiceManager {
    fn stop(&self, name: &str) -> Result<(), ServiceError>;
    fn start(&self, name: &str) -> Result<(), ServiceError>;

    /// Polls until the unit is no longer active. Returns `false` on timeout.
    fn wait_inactive(&self, _name: &str, _timeout: Duration) -> bool {
        true
    }
}

/// `systemctl`-backed controller; escalates through non-interactive sudo when not root.
#[derive(Debug, Clone)]
pub struct Systemctl {
    use_sudo: bool,
    poll_interval: Duration,
}

impl Systemctl {
    pub fn detect() -> Self {
        Self {
            use_sudo: !is_root() && which("sudo").is_some(),
            poll_interval: Duration::from_millis(500),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg("systemctl");
            cmd
        } else {
            Command::new("systemctl")
        };
        cmd.args(args);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<CommandResult, ServiceError> {
        run_cmd_capture(self.command(args)).map_err(|err| ServiceError::Spawn(format!("{err:#}")))
    }
}

fn is_missing_unit(result: &CommandResult) -> bool {
    if result.ok {
        return false;
    }
    let combined = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();
    combined.contains("not loaded") || combined.contains("not found") || result.returncode == 5
}

fn failed(result: &CommandResult) -> ServiceError {
    ServiceError::CommandFailed {
        command: result.command.clone(),
        code: result.returncode,
        detail: result.detail().to_string(),
    }
}

impl ServiceManager for Systemctl {
    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let result = self.run(&["stop", name])?;
        if result.ok {
            return Ok(());
        }
        if is_missing_unit(&result) {
            tracing::info!(unit = name, "no such unit; nothing to stop");
            return Ok(());
        }
        Err(failed(&result))
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        let result = self.run(&["start", name])?;
        if result.ok {
            Ok(())
        } else {
            Err(failed(&result))
        }
    }

    fn wait_inactive(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.run(&["is-active", name]) {
                // is-active exits non-zero for inactive, failed and unknown units.
                Ok(result) if !result.ok => return true,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(unit = name, error = %err, "is-active probe failed");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
