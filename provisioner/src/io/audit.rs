//! Machine and tool audit probes.
//!
//! Everything here goes through [`CommandRunner`], so audits are scriptable
//! in tests and never assume the host is actually a Mac.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::session::Session;
use crate::core::types::{MachineInfo, TaskStatus};
use crate::io::runner::{CommandRunner, detection_satisfied};
use crate::manifest::Manifests;

/// Presence/version probe result for one known task's tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub id: String,
    pub name: String,
    pub installed: bool,
    /// First line of the check command's output when available.
    pub version: Option<String>,
}

/// Probe basic machine facts. Probe failures degrade to empty fields; an
/// audit must never abort provisioning.
#[instrument(skip_all)]
pub fn audit_machine(runner: &dyn CommandRunner) -> MachineInfo {
    MachineInfo {
        hostname: probe(runner, "hostname"),
        os_version: probe(runner, "sw_vers -productVersion"),
        architecture: probe(runner, "uname -m"),
        chip: probe(runner, "sysctl -n machdep.cpu.brand_string"),
    }
}

/// Run every known task's detection and report which tools are present.
/// Ordering follows the manifest catalog (sorted by task id).
#[instrument(skip_all)]
pub fn audit_tools(runner: &dyn CommandRunner, manifests: &Manifests) -> Vec<ToolStatus> {
    let mut statuses = Vec::new();
    for task in manifests.tasks() {
        let Some(detection) = &task.detection else {
            continue;
        };
        let installed = detection_satisfied(runner, detection);
        let version = if installed {
            detection
                .check_command
                .as_deref()
                .and_then(|check| match runner.execute(check) {
                    Ok(outcome) if outcome.success() => {
                        outcome.stdout_summary.lines().next().map(str::to_string)
                    }
                    _ => None,
                })
        } else {
            None
        };
        debug!(task = %task.id, installed, "tool probed");
        statuses.push(ToolStatus {
            id: task.id.clone(),
            name: task.name.clone(),
            installed,
            version,
        });
    }
    statuses
}

/// Drift between what a session recorded as completed and what the machine
/// currently has installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionDrift {
    /// Installed now, but not completed by the session.
    pub added_outside_session: Vec<String>,
    /// Completed by the session, but no longer detected.
    pub removed_since_session: Vec<String>,
    pub still_installed: Vec<String>,
}

/// Diff an audit report against a session's completed tasks. Read-only; the
/// session is never mutated by an audit.
pub fn compare_with_session(tools: &[ToolStatus], session: &Session) -> SessionDrift {
    let installed: BTreeSet<&str> = tools
        .iter()
        .filter(|tool| tool.installed)
        .map(|tool| tool.id.as_str())
        .collect();
    let completed: BTreeSet<&str> = session
        .tasks
        .iter()
        .filter(|(_, run)| run.status == TaskStatus::Completed)
        .map(|(id, _)| id.as_str())
        .collect();

    let owned = |ids: Vec<&&str>| ids.into_iter().map(|id| (*id).to_string()).collect();
    SessionDrift {
        added_outside_session: owned(installed.difference(&completed).collect()),
        removed_since_session: owned(completed.difference(&installed).collect()),
        still_installed: owned(installed.intersection(&completed).collect()),
    }
}

fn probe(runner: &dyn CommandRunner, command: &str) -> String {
    match runner.execute(command) {
        Ok(outcome) if outcome.success() => {
            outcome.stdout_summary.lines().next().unwrap_or("").to_string()
        }
        Ok(_) | Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskRun;
    use crate::manifest::Detection;
    use crate::test_support::{FakeRunner, catalog, task_with};

    /// Machine probes populate all fields from command output.
    #[test]
    fn audit_machine_collects_probe_output() {
        let runner = FakeRunner::new()
            .ok("hostname", "devbox.local\n")
            .ok("sw_vers -productVersion", "14.5")
            .ok("uname -m", "arm64")
            .ok("sysctl -n machdep.cpu.brand_string", "Apple M3 Pro");

        let machine = audit_machine(&runner);
        assert_eq!(machine.hostname, "devbox.local");
        assert_eq!(machine.os_version, "14.5");
        assert_eq!(machine.architecture, "arm64");
        assert_eq!(machine.chip, "Apple M3 Pro");
    }

    /// A failed probe leaves its field empty instead of erroring.
    #[test]
    fn audit_machine_tolerates_probe_failures() {
        let runner = FakeRunner::new().ok("hostname", "devbox.local");
        let machine = audit_machine(&runner);
        assert_eq!(machine.hostname, "devbox.local");
        assert_eq!(machine.os_version, "");
    }

    /// Tool audit reports installed state and version line per detectable task.
    #[test]
    fn audit_tools_reports_installed_and_version() {
        let manifests = catalog(vec![
            task_with("git", |t| {
                t.detection = Some(Detection {
                    check_command: Some("git --version".to_string()),
                    installed_indicator: None,
                });
            }),
            task_with("nvm", |t| {
                t.detection = Some(Detection {
                    check_command: Some("command -v nvm".to_string()),
                    installed_indicator: None,
                });
            }),
        ]);
        let runner = FakeRunner::new()
            .ok("git --version", "git version 2.44.0\nbuilt from source")
            .failing("command -v nvm", 1, "");

        let statuses = audit_tools(&runner, &manifests);
        assert_eq!(statuses.len(), 2);
        let git = statuses.iter().find(|s| s.id == "git").expect("git");
        assert!(git.installed);
        assert_eq!(git.version.as_deref(), Some("git version 2.44.0"));
        let nvm = statuses.iter().find(|s| s.id == "nvm").expect("nvm");
        assert!(!nvm.installed);
        assert!(nvm.version.is_none());
    }

    /// Drift splits into tools installed outside the session, completed
    /// tasks whose tool has since disappeared, and the stable intersection.
    #[test]
    fn compare_with_session_reports_drift() {
        let mut session = Session::new("prov-20260101-000000-aaaa", None);
        for id in ["git", "nvm"] {
            let mut run = TaskRun::pending();
            run.status = TaskStatus::Completed;
            session.tasks.insert(id.to_string(), run);
        }

        let tool = |id: &str, installed: bool| ToolStatus {
            id: id.to_string(),
            name: id.to_string(),
            installed,
            version: None,
        };
        let tools = vec![tool("git", true), tool("nvm", false), tool("docker", true)];

        let drift = compare_with_session(&tools, &session);
        assert_eq!(drift.added_outside_session, vec!["docker".to_string()]);
        assert_eq!(drift.removed_since_session, vec!["nvm".to_string()]);
        assert_eq!(drift.still_installed, vec!["git".to_string()]);
    }
}
