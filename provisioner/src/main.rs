//! CLI for the provisioning core: validate manifests, resolve task sets,
//! list sessions, and audit the machine.
//!
//! The conversational layer talks to the library directly; this binary is
//! the operator's inspection surface.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use provisioner::core::resolver::{build_plan, resolve};
use provisioner::core::types::{ExecutionMode, SessionStatus};
use provisioner::io::audit::{audit_machine, audit_tools, compare_with_session};
use provisioner::io::runner::ShellRunner;
use provisioner::io::session_store::SessionStore;
use provisioner::manifest::ManifestStore;

#[derive(Parser)]
#[command(
    name = "provisioner",
    version,
    about = "Session-state and task-execution core for machine provisioning"
)]
struct Cli {
    /// Store root holding tasks/ and sessions/ (default: $PROVISIONER_DIR,
    /// else ~/.provisioner).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate every task and profile manifest.
    Validate,
    /// Resolve a task set into a dependency-ordered plan and print it.
    Resolve {
        /// Task ids to resolve.
        #[arg(long, value_delimiter = ',', required = true)]
        tasks: Vec<String>,
    },
    /// List sessions, newest first.
    Sessions {
        /// Filter by status (in_progress, completed, failed, paused).
        #[arg(long)]
        status: Option<String>,
    },
    /// Probe the machine and report which known tools are installed.
    Audit {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
        /// Diff the report against a session's completed tasks.
        #[arg(long, value_name = "SESSION_ID")]
        diff: Option<String>,
    },
}

fn main() {
    provisioner::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = store_root(cli.root)?;
    match cli.command {
        Command::Validate => cmd_validate(&root),
        Command::Resolve { tasks } => cmd_resolve(&root, &tasks),
        Command::Sessions { status } => cmd_sessions(&root, status.as_deref()),
        Command::Audit { json, diff } => cmd_audit(&root, json, diff.as_deref()),
    }
}

fn store_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(dir) = std::env::var_os("PROVISIONER_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".provisioner"))
}

fn cmd_validate(root: &PathBuf) -> Result<()> {
    let manifests = ManifestStore::new(root).load().context("load manifests")?;
    println!(
        "ok: {} tasks, {} profiles",
        manifests.task_count(),
        manifests.profile_count()
    );
    Ok(())
}

fn cmd_resolve(root: &PathBuf, tasks: &[String]) -> Result<()> {
    let manifests = ManifestStore::new(root).load().context("load manifests")?;
    let resolved = resolve(&manifests, tasks)?;
    let plan = build_plan(&manifests, resolved, ExecutionMode::AllAtOnce);
    for group in &plan.groups {
        println!("[{}]", group.category);
        for id in &group.tasks {
            println!("  {id}");
        }
    }
    Ok(())
}

fn cmd_sessions(root: &PathBuf, status: Option<&str>) -> Result<()> {
    let filter = match status {
        None => None,
        Some("in_progress") => Some(SessionStatus::InProgress),
        Some("completed") => Some(SessionStatus::Completed),
        Some("failed") => Some(SessionStatus::Failed),
        Some("paused") => Some(SessionStatus::Paused),
        Some(other) => bail!("unknown status '{other}'"),
    };
    let store = SessionStore::new(root);
    let summaries = store.list(filter).context("list sessions")?;
    if summaries.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {:<12}  {:<20}  updated {}",
            summary.id,
            status_label(summary.status),
            phase_label(&summary),
            summary.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::InProgress => "in_progress",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Paused => "paused",
    }
}

fn phase_label(summary: &provisioner::io::session_store::SessionSummary) -> String {
    serde_json::to_string(&summary.phase.current)
        .map(|raw| raw.trim_matches('"').to_string())
        .unwrap_or_default()
}

fn cmd_audit(root: &PathBuf, json: bool, diff: Option<&str>) -> Result<()> {
    let manifests = ManifestStore::new(root).load().context("load manifests")?;
    let runner = ShellRunner::default();
    let machine = audit_machine(&runner);
    let tools = audit_tools(&runner, &manifests);
    let drift = match diff {
        Some(id) => {
            let session = SessionStore::new(root)
                .load(id)
                .with_context(|| format!("load session '{id}' for diff"))?;
            Some(compare_with_session(&tools, &session))
        }
        None => None,
    };

    if json {
        let report = serde_json::json!({ "machine": machine, "tools": tools, "drift": drift });
        let mut payload = serde_json::to_string_pretty(&report).context("serialize audit")?;
        payload.push('\n');
        print!("{payload}");
        return Ok(());
    }

    println!(
        "{} · macOS {} · {} ({})",
        machine.hostname, machine.os_version, machine.architecture, machine.chip
    );
    for tool in tools {
        let mark = if tool.installed { "✓" } else { "✗" };
        match tool.version {
            Some(version) => println!("{mark} {:<20} {version}", tool.name),
            None => println!("{mark} {}", tool.name),
        }
    }
    if let Some(drift) = drift {
        println!();
        println!("drift vs session:");
        println!("  added outside session: {}", drift.added_outside_session.join(", "));
        println!("  removed since session: {}", drift.removed_since_session.join(", "));
        println!("  still installed:       {}", drift.still_installed.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolve_with_comma_separated_tasks() {
        let cli = Cli::parse_from(["provisioner", "resolve", "--tasks", "git,nvm"]);
        match cli.command {
            Command::Resolve { tasks } => {
                assert_eq!(tasks, vec!["git".to_string(), "nvm".to_string()]);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn parse_global_root_flag() {
        let cli = Cli::parse_from(["provisioner", "--root", "/tmp/prov", "validate"]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/prov")));
        assert!(matches!(cli.command, Command::Validate));
    }

    #[test]
    fn parse_audit_diff_session() {
        let cli = Cli::parse_from(["provisioner", "audit", "--json", "--diff", "prov-x"]);
        match cli.command {
            Command::Audit { json, diff } => {
                assert!(json);
                assert_eq!(diff.as_deref(), Some("prov-x"));
            }
            _ => panic!("expected audit"),
        }
    }

    #[test]
    fn parse_sessions_status_filter() {
        let cli = Cli::parse_from(["provisioner", "sessions", "--status", "failed"]);
        match cli.command {
            Command::Sessions { status } => assert_eq!(status.as_deref(), Some("failed")),
            _ => panic!("expected sessions"),
        }
    }
}
