//! Shell command runner behind a trait seam so the coordinator can be
//! exercised with scripted fakes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;
use crate::manifest::Detection;

/// Default per-command timeout. Installs (brew, xcode-select) can be slow;
/// anything past this is treated as hung.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on captured stdout/stderr per command.
pub const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Length of the output summary stored into session command records.
const SUMMARY_CHARS: usize = 500;

/// Result of running one shell command, reduced to what session records and
/// failure classification need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    /// First `SUMMARY_CHARS` characters of stdout, lossily decoded.
    pub stdout_summary: String,
    /// Stderr tail when the command failed, for the failure record.
    pub error: Option<String>,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Executes shell commands. The one production implementation shells out;
/// tests substitute scripted outcomes.
pub trait CommandRunner {
    fn execute(&self, command: &str) -> Result<CommandOutcome>;
}

/// Runs commands via `sh -c` with a timeout and bounded capture.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(command))]
    fn execute(&self, command: &str) -> Result<CommandOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);

        let output = run_command_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run `{command}`"))?;

        let stdout_summary = summarize(&output.stdout);
        let error = if output.timed_out {
            Some(format!("timed out after {}s", self.timeout.as_secs()))
        } else if output.status.success() {
            None
        } else {
            let stderr = summarize(&output.stderr);
            Some(if stderr.is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr
            })
        };

        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "command done");
        Ok(CommandOutcome {
            exit_code: output.status.code(),
            stdout_summary,
            error,
            timed_out: output.timed_out,
        })
    }
}

fn summarize(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.chars().count() <= SUMMARY_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(SUMMARY_CHARS).collect()
    }
}

/// Decide whether a task's tool is already present: its check command exits
/// 0, or its indicator path exists. Runner errors count as "not installed" so
/// a broken probe degrades to a redundant install, never a skipped one.
pub fn detection_satisfied(runner: &dyn CommandRunner, detection: &Detection) -> bool {
    if let Some(check) = &detection.check_command {
        match runner.execute(check) {
            Ok(outcome) if outcome.success() => return true,
            Ok(_) => {}
            Err(err) => debug!(err = %err, "detection check failed to run"),
        }
    }
    if let Some(indicator) = &detection.installed_indicator {
        return expand_home(indicator).exists();
    }
    false
}

/// Expand a leading `~` against the home directory. Paths without one pass
/// through untouched.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRunner;

    /// Exit 0 without a timeout is success; everything else is not.
    #[test]
    fn outcome_success_requires_exit_zero() {
        let ok = CommandOutcome {
            exit_code: Some(0),
            stdout_summary: String::new(),
            error: None,
            timed_out: false,
        };
        assert!(ok.success());

        let failed = CommandOutcome {
            exit_code: Some(1),
            ..ok.clone()
        };
        assert!(!failed.success());

        let hung = CommandOutcome {
            exit_code: None,
            timed_out: true,
            ..ok
        };
        assert!(!hung.success());
    }

    /// A passing check command short-circuits detection.
    #[test]
    fn detection_check_command_exit_zero_means_installed() {
        let runner = FakeRunner::new().ok("git --version", "git version 2.44.0");
        let detection = Detection {
            check_command: Some("git --version".to_string()),
            installed_indicator: None,
        };
        assert!(detection_satisfied(&runner, &detection));
    }

    /// A failing check falls through to the indicator path, which decides.
    #[test]
    fn detection_falls_back_to_indicator_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join(".nvm");
        std::fs::create_dir(&marker).expect("mkdir");

        let runner = FakeRunner::new().failing("command -v nvm", 1, "not found");
        let detection = Detection {
            check_command: Some("command -v nvm".to_string()),
            installed_indicator: Some(marker.to_string_lossy().into_owned()),
        };
        assert!(detection_satisfied(&runner, &detection));

        let detection_missing = Detection {
            check_command: Some("command -v nvm".to_string()),
            installed_indicator: Some(temp.path().join("absent").to_string_lossy().into_owned()),
        };
        assert!(!detection_satisfied(&runner, &detection_missing));
    }

    /// Paths without a tilde pass through unchanged.
    #[test]
    fn expand_home_leaves_plain_paths_alone() {
        assert_eq!(expand_home("/usr/local/bin"), PathBuf::from("/usr/local/bin"));
    }
}
