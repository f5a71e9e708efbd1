//! Execution coordinator: walks an approved plan task by task, step by step,
//! recording every command into the session and persisting after each task
//! boundary so a crash never loses more than the step in flight.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::resolver::{build_plan, resolve};
use crate::core::session::Session;
use crate::core::types::{
    Approval, CommandRecord, CommandStatus, ExecutionMode, FailureKind, Phase, ResumeAction,
    ResumePoint, TaskStatus,
};
use crate::io::runner::{CommandOutcome, CommandRunner, detection_satisfied};
use crate::io::session_store::SessionStore;
use crate::manifest::{InstallSpec, InstallStep, Manifests, TaskDefinition};

/// Decides per install step whether to proceed. Only consulted in
/// `review_each_step` mode; `all_at_once` approves the whole plan up front.
pub trait ApprovalGate {
    fn review(&self, task_id: &str, step: &InstallStep) -> Approval;
}

/// Gate for `all_at_once` runs and non-interactive callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn review(&self, _task_id: &str, _step: &InstallStep) -> Approval {
        Approval::Approve
    }
}

/// How a plan walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task reached a terminal status; the session is completed.
    Completed,
    /// A task failed; the session is failed with a resume point set.
    Failed { task_id: String },
    /// The user stopped at an approval gate; the session is paused.
    Paused { task_id: String },
}

/// Ties the manifest catalog, session store, command runner, and approval
/// gate together for one provisioning run.
pub struct Coordinator<'a> {
    manifests: &'a Manifests,
    store: &'a SessionStore,
    runner: &'a dyn CommandRunner,
    gate: &'a dyn ApprovalGate,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        manifests: &'a Manifests,
        store: &'a SessionStore,
        runner: &'a dyn CommandRunner,
        gate: &'a dyn ApprovalGate,
    ) -> Self {
        Self {
            manifests,
            store,
            runner,
            gate,
        }
    }

    /// Resolve the requested tasks, record the approved plan into the
    /// session, and advance it into `execute`.
    #[instrument(skip_all, fields(session = %session.id))]
    pub fn approve_plan(
        &self,
        session: &mut Session,
        requested: &[String],
        mode: ExecutionMode,
    ) -> Result<()> {
        let resolved = resolve(self.manifests, requested).context("resolve task set")?;
        let plan = build_plan(self.manifests, resolved, mode);
        info!(tasks = plan.tasks.len(), mode = ?mode, "plan approved");
        session.set_plan(plan).context("record plan")?;
        session.set_phase(Phase::Execute).context("enter execute")?;
        self.store.save(session).context("save session")?;
        Ok(())
    }

    /// Walk the plan in dependency order. Terminal tasks are left alone, so
    /// the same call drives both a fresh run and a resume.
    #[instrument(skip_all, fields(session = %session.id))]
    pub fn run_plan(&self, session: &mut Session) -> Result<RunOutcome> {
        let plan = session
            .plan
            .clone()
            .ok_or_else(|| anyhow!("session '{}' has no approved plan", session.id))?;

        for task_id in &plan.tasks {
            let status = session
                .tasks
                .get(task_id)
                .map(|run| run.status)
                .ok_or_else(|| anyhow!("plan names unseeded task '{task_id}'"))?;
            if status.is_terminal() {
                continue;
            }

            let task = self
                .manifests
                .task(task_id)
                .ok_or_else(|| anyhow!("plan references unknown task '{task_id}'"))?;

            // A task that never ran and whose tool is already present is
            // skipped, not re-installed. Failed tasks skip the probe: the
            // user asked for a retry.
            if status == TaskStatus::Pending
                && let Some(detection) = &task.detection
                && detection_satisfied(self.runner, detection)
            {
                info!(task = %task_id, "already installed, skipping");
                session.skip_task(task_id, "already installed")?;
                self.store.save(session)?;
                continue;
            }

            match self.run_task(session, task, &plan.mode, status)? {
                TaskOutcome::Done => {
                    self.store.save(session)?;
                }
                TaskOutcome::Failed => {
                    session.fail()?;
                    self.store.save(session)?;
                    return Ok(RunOutcome::Failed {
                        task_id: task_id.clone(),
                    });
                }
                TaskOutcome::Stopped { command_index } => {
                    session.set_resume_point(ResumePoint {
                        task_id: task_id.clone(),
                        command_index,
                        action: ResumeAction::Retry,
                        context: Some("stopped at approval gate".to_string()),
                    })?;
                    session.pause()?;
                    self.store.save(session)?;
                    return Ok(RunOutcome::Paused {
                        task_id: task_id.clone(),
                    });
                }
            }
        }

        session.set_phase(Phase::Completion)?;
        session.complete()?;
        self.store.save(session)?;
        info!("plan completed");
        Ok(RunOutcome::Completed)
    }

    /// Reopen a failed or paused session and continue its plan, retrying the
    /// task at the resume point.
    pub fn resume_session(&self, id: &str) -> Result<(Session, RunOutcome)> {
        let mut session = self.store.load(id).context("load session")?;
        session.resume().context("resume session")?;
        self.store.save(&mut session)?;
        let outcome = self.run_plan(&mut session)?;
        Ok((session, outcome))
    }

    /// Reopen a failed session, give up on the task at its resume point, and
    /// continue with the rest of the plan.
    pub fn skip_and_resume(&self, id: &str) -> Result<(Session, RunOutcome)> {
        let mut session = self.store.load(id).context("load session")?;
        let task_id = session
            .resume_point
            .as_ref()
            .map(|point| point.task_id.clone())
            .ok_or_else(|| anyhow!("session '{id}' has no resume point to skip"))?;
        session.resume().context("resume session")?;
        session.skip_task(&task_id, "skipped by user after failure")?;
        self.store.save(&mut session)?;
        info!(task = %task_id, "failed task skipped on resume");
        let outcome = self.run_plan(&mut session)?;
        Ok((session, outcome))
    }

    /// Open a new session that adds tasks on top of a completed one, with the
    /// added set resolved against the catalog.
    pub fn expand_session(&self, source_id: &str, requested: &[String]) -> Result<Session> {
        let source = self.store.load(source_id).context("load source session")?;
        let resolved = resolve(self.manifests, requested).context("resolve added tasks")?;
        let mut session = Session::expand_from(&source, self.store.new_session_id(), &resolved)?;
        self.store.save(&mut session)?;
        info!(source = %source_id, session = %session.id, "session expanded");
        Ok(session)
    }

    fn run_task(
        &self,
        session: &mut Session,
        task: &TaskDefinition,
        mode: &ExecutionMode,
        status: TaskStatus,
    ) -> Result<TaskOutcome> {
        // A task paused mid-run stays in_progress; restarting it would reset
        // its resume point.
        if status != TaskStatus::InProgress {
            session.start_task(&task.id)?;
        }

        let steps = match select_steps(task, session) {
            Ok(steps) => steps,
            Err(message) => {
                session.fail_task(
                    &task.id,
                    FailureKind::Variant,
                    &message,
                    Some("add one of the variant tasks to the plan or define a default".to_string()),
                )?;
                return Ok(TaskOutcome::Failed);
            }
        };

        let start = session
            .resume_point
            .as_ref()
            .filter(|point| point.task_id == task.id)
            .map_or(0, |point| point.command_index);
        info!(task = %task.id, steps = steps.len(), start, "task started");

        for (index, step) in steps.iter().enumerate().skip(start) {
            let approval = match mode {
                ExecutionMode::AllAtOnce => Approval::Approve,
                ExecutionMode::ReviewEachStep => self.gate.review(&task.id, step),
            };
            match approval {
                Approval::Approve => {}
                Approval::Skip => {
                    session.append_command(&task.id, skipped_record(step))?;
                    continue;
                }
                Approval::Stop => {
                    return Ok(TaskOutcome::Stopped {
                        command_index: index,
                    });
                }
            }

            let retry_count = session.retry_count_for(&task.id, &step.command);
            let outcome = match self.runner.execute(&step.command) {
                Ok(outcome) => outcome,
                Err(err) => CommandOutcome {
                    exit_code: None,
                    stdout_summary: String::new(),
                    error: Some(format!("{err:#}")),
                    timed_out: false,
                },
            };
            let failed = !outcome.success();
            session.append_command(&task.id, executed_record(step, &outcome, retry_count))?;

            if failed {
                let message = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "command failed".to_string());
                let kind = classify_failure(&outcome);
                warn!(task = %task.id, step = index, kind = ?kind, "install step failed");
                session.fail_task(&task.id, kind, &message, suggestion_for(kind))?;
                return Ok(TaskOutcome::Failed);
            }
        }

        let mut result = BTreeMap::new();
        if let Some(verify) = &task.verify {
            match self.runner.execute(&verify.command) {
                Ok(outcome) if outcome.success() => {
                    result.insert("verified".to_string(), "true".to_string());
                }
                Ok(outcome) => {
                    // Verification is advisory: the install ran, so record
                    // the warning instead of failing the task.
                    warn!(task = %task.id, "verify command failed");
                    result.insert(
                        "verify_warning".to_string(),
                        outcome
                            .error
                            .unwrap_or_else(|| "verify command failed".to_string()),
                    );
                }
                Err(err) => {
                    warn!(task = %task.id, err = %err, "verify command did not run");
                    result.insert("verify_warning".to_string(), format!("{err:#}"));
                }
            }
        }

        session.complete_task(&task.id, result)?;
        info!(task = %task.id, "task completed");
        Ok(TaskOutcome::Done)
    }
}

enum TaskOutcome {
    Done,
    Failed,
    Stopped { command_index: usize },
}

/// Pick the install steps for a task: plain steps as-is; variant installs
/// take the first variant whose key is in the plan (plan order), falling
/// back to `default`. No match is a task failure, not a silent no-op.
fn select_steps<'t>(task: &'t TaskDefinition, session: &Session) -> Result<&'t [InstallStep], String> {
    match &task.install {
        InstallSpec::Plain { steps } => Ok(steps),
        InstallSpec::Variants { variants } => {
            let plan_tasks: &[String] = session
                .plan
                .as_ref()
                .map_or(&[], |plan| plan.tasks.as_slice());
            for candidate in plan_tasks {
                if let Some(variant) = variants.get(candidate) {
                    return Ok(&variant.steps);
                }
            }
            if let Some(default) = variants.get("default") {
                return Ok(&default.steps);
            }
            Err(format!(
                "no install variant of '{}' matches the plan ({} defined, no default)",
                task.id,
                variants.len()
            ))
        }
    }
}

fn skipped_record(step: &InstallStep) -> CommandRecord {
    CommandRecord {
        command: step.command.clone(),
        description: step.description.clone(),
        status: CommandStatus::Skipped,
        exit_code: None,
        error: None,
        output_summary: None,
        approval: Approval::Skip,
        retry_count: 0,
        executed_at: Utc::now(),
    }
}

fn executed_record(step: &InstallStep, outcome: &CommandOutcome, retry_count: u32) -> CommandRecord {
    CommandRecord {
        command: step.command.clone(),
        description: step.description.clone(),
        status: if outcome.success() {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        },
        exit_code: outcome.exit_code,
        error: outcome.error.clone(),
        output_summary: if outcome.stdout_summary.is_empty() {
            None
        } else {
            Some(outcome.stdout_summary.clone())
        },
        approval: Approval::Approve,
        retry_count,
        executed_at: Utc::now(),
    }
}

/// Map a failed command to a failure category the user can act on.
fn classify_failure(outcome: &CommandOutcome) -> FailureKind {
    if outcome.timed_out {
        return FailureKind::Timeout;
    }
    let text = outcome.error.as_deref().unwrap_or("").to_lowercase();
    if text.contains("permission denied") || text.contains("operation not permitted") {
        return FailureKind::Permission;
    }
    const NETWORK_MARKERS: [&str; 6] = [
        "could not resolve",
        "connection refused",
        "connection reset",
        "network is unreachable",
        "no route to host",
        "failed to connect",
    ];
    if NETWORK_MARKERS.iter().any(|marker| text.contains(marker)) {
        return FailureKind::Network;
    }
    FailureKind::Command
}

fn suggestion_for(kind: FailureKind) -> Option<String> {
    match kind {
        FailureKind::Network => Some("check the network connection and retry".to_string()),
        FailureKind::Permission => {
            Some("re-run the step with the needed permissions (sudo)".to_string())
        }
        FailureKind::Timeout => Some("retry; slow downloads are the usual cause".to_string()),
        FailureKind::Command | FailureKind::Variant => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionStatus;
    use crate::manifest::Detection;
    use crate::test_support::{
        FakeGate, FakeRunner, catalog, install_step, task, task_with, variant_task,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        manifests: Manifests,
        store: SessionStore,
    }

    fn fixture(manifests: Manifests) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        Fixture {
            _temp: temp,
            manifests,
            store,
        }
    }

    fn planned_session(
        coordinator: &Coordinator,
        requested: &[&str],
        mode: ExecutionMode,
    ) -> Session {
        let mut session = Session::new(coordinator.store.new_session_id(), None);
        session.set_phase(Phase::StackSelection).expect("phase");
        session.set_phase(Phase::GatherRequirements).expect("phase");
        session.set_phase(Phase::PresentPlan).expect("phase");
        let requested: Vec<String> = requested.iter().map(|s| s.to_string()).collect();
        coordinator
            .approve_plan(&mut session, &requested, mode)
            .expect("approve");
        session
    }

    /// A clean run walks every task, persists it as completed, and moves the
    /// session to the completed store.
    #[test]
    fn run_plan_completes_all_tasks() {
        let fx = fixture(catalog(vec![
            task_with("homebrew", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("install homebrew")],
                };
            }),
            task_with("git", |t| {
                t.dependencies.required = vec!["homebrew".into()];
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install git")],
                };
            }),
        ]));
        let runner = FakeRunner::new()
            .ok("install homebrew", "done")
            .ok("brew install git", "done");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(&coordinator, &["git"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.phase.current, Phase::Completion);
        assert!(session.all_tasks_terminal());
        // Dependency ran first.
        assert_eq!(
            runner.commands(),
            vec!["install homebrew".to_string(), "brew install git".to_string()]
        );
        // Persisted under completed/.
        let reloaded = fx.store.load(&session.id).expect("reload");
        assert_eq!(reloaded.status, SessionStatus::Completed);
    }

    /// Detection short-circuits a pending task to skipped without running
    /// its install steps.
    #[test]
    fn run_plan_skips_already_installed_tools() {
        let fx = fixture(catalog(vec![task_with("git", |t| {
            t.detection = Some(Detection {
                check_command: Some("git --version".to_string()),
                installed_indicator: None,
            });
            t.install = InstallSpec::Plain {
                steps: vec![install_step("brew install git")],
            };
        })]));
        let runner = FakeRunner::new().ok("git --version", "git version 2.44.0");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(&coordinator, &["git"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");

        assert_eq!(outcome, RunOutcome::Completed);
        let run = session.tasks.get("git").expect("run");
        assert_eq!(run.status, TaskStatus::Skipped);
        assert_eq!(run.skip_reason.as_deref(), Some("already installed"));
        assert!(run.commands.is_empty());
        assert!(!runner.commands().contains(&"brew install git".to_string()));
    }

    /// A failing step fails the task and session with classified context;
    /// resuming retries from the failed step with an incremented counter.
    #[test]
    fn failed_step_then_resume_retries_from_failure_point() {
        let fx = fixture(catalog(vec![task_with("cursor", |t| {
            t.install = InstallSpec::Plain {
                steps: vec![
                    install_step("brew tap cursor/cask"),
                    install_step("brew install cursor"),
                ],
            };
        })]));
        let runner = FakeRunner::new()
            .ok("brew tap cursor/cask", "tapped")
            .failing_then_ok(
                "brew install cursor",
                1,
                "curl: (7) Failed to connect to example.com",
                "installed",
            );
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(&coordinator, &["cursor"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                task_id: "cursor".to_string()
            }
        );
        assert_eq!(session.status, SessionStatus::Failed);
        let failure = session
            .tasks
            .get("cursor")
            .and_then(|run| run.failure.clone())
            .expect("failure context");
        assert_eq!(failure.kind, FailureKind::Network);
        let point = session.resume_point.clone().expect("resume point");
        assert_eq!(point.task_id, "cursor");
        assert_eq!(point.command_index, 1, "first step succeeded");
        assert_eq!(point.action, ResumeAction::RetryOrSkip);

        let (resumed, outcome) = coordinator.resume_session(&session.id).expect("resume");
        assert_eq!(outcome, RunOutcome::Completed);
        let run = resumed.tasks.get("cursor").expect("run");
        assert_eq!(run.status, TaskStatus::Completed);
        // tap ran once, install ran twice; the retry carries retry_count 1.
        assert_eq!(run.commands.len(), 3);
        let retried = &run.commands[2];
        assert_eq!(retried.command, "brew install cursor");
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, CommandStatus::Success);
    }

    /// A gate-skipped step counts toward the resume index, so retrying a
    /// failure after a skip never re-runs the step that already succeeded.
    #[test]
    fn resume_does_not_rerun_steps_settled_before_the_failure() {
        let fx = fixture(catalog(vec![task_with("zsh-setup", |t| {
            t.install = InstallSpec::Plain {
                steps: vec![
                    install_step("append rc snippet"),
                    install_step("brew install zsh-autosuggestions"),
                    install_step("chsh -s /bin/zsh"),
                ],
            };
        })]));
        let runner = FakeRunner::new()
            .ok("brew install zsh-autosuggestions", "done")
            .failing_then_ok(
                "chsh -s /bin/zsh",
                1,
                "chsh: operation not permitted",
                "shell changed",
            );
        // Skip the rc snippet at the gate, approve everything after.
        let gate = FakeGate::scripted(vec![Approval::Skip]);
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session =
            planned_session(&coordinator, &["zsh-setup"], ExecutionMode::ReviewEachStep);
        let outcome = coordinator.run_plan(&mut session).expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                task_id: "zsh-setup".to_string()
            }
        );
        assert_eq!(
            session.resume_point.as_ref().map(|p| p.command_index),
            Some(2),
            "the skipped step still advances the index"
        );

        let (resumed, outcome) = coordinator.resume_session(&session.id).expect("resume");
        assert_eq!(outcome, RunOutcome::Completed);
        let count = |cmd: &str| runner.commands().iter().filter(|c| *c == cmd).count();
        assert_eq!(count("brew install zsh-autosuggestions"), 1, "ran once across both runs");
        assert_eq!(count("chsh -s /bin/zsh"), 2, "only the failed step was re-issued");

        let run = resumed.tasks.get("zsh-setup").expect("run");
        assert_eq!(run.status, TaskStatus::Completed);
        // The skipped rc step stays skipped; the retry carries counter 1.
        assert_eq!(
            run.commands
                .iter()
                .filter(|r| r.command == "append rc snippet")
                .count(),
            1
        );
        let retried = run.commands.last().expect("last record");
        assert_eq!(retried.command, "chsh -s /bin/zsh");
        assert_eq!(retried.retry_count, 1);
    }

    /// A profile's answers seed a plan containing the profile's required
    /// tasks, default CLI tools, and the chosen options' tasks; approval
    /// moves the session into execute.
    #[test]
    fn profile_answers_build_the_approved_plan() {
        let fx = fixture(catalog(vec![
            task_with("homebrew", |t| t.category = "foundation".into()),
            task("git"),
            task("nvm"),
            task_with("node-lts", |t| {
                t.dependencies.one_of = vec!["nvm".into(), "fnm".into()];
            }),
            task("fnm"),
            task("cursor"),
            task("zed"),
        ]));
        let runner = FakeRunner::new();
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let profile = crate::test_support::profile_fullstack_web();
        let mut session = Session::new(fx.store.new_session_id(), Some(profile.id.clone()));
        session.set_phase(Phase::StackSelection).expect("phase");
        session.set_phase(Phase::GatherRequirements).expect("phase");
        session.set_phase(Phase::PresentPlan).expect("phase");

        let mut answers = BTreeMap::new();
        answers.insert("js_runtime".to_string(), "A".to_string());
        answers.insert("editor".to_string(), "B".to_string());
        let requested = crate::core::resolver::seed_from_profile(&profile, &answers);

        coordinator
            .approve_plan(&mut session, &requested, ExecutionMode::AllAtOnce)
            .expect("approve");

        let plan = session.plan.as_ref().expect("plan");
        for id in ["homebrew", "git", "nvm", "node-lts", "cursor"] {
            assert!(plan.tasks.contains(&id.to_string()), "plan misses {id}");
        }
        assert!(!plan.tasks.contains(&"fnm".to_string()));
        // nvm satisfies node-lts's one_of and is ordered before it.
        let pos = |id: &str| plan.tasks.iter().position(|t| t == id).expect("position");
        assert!(pos("nvm") < pos("node-lts"));
        assert_eq!(session.phase.current, Phase::Execute);
    }

    /// Skipping the failed task on resume finishes the rest of the plan
    /// without re-running tasks completed before the failure.
    #[test]
    fn skip_and_resume_moves_past_failed_task() {
        let fx = fixture(catalog(vec![
            task_with("homebrew", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("install homebrew")],
                };
            }),
            task_with("cursor", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install cursor")],
                };
            }),
            task_with("git", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install git")],
                };
            }),
        ]));
        let runner = FakeRunner::new()
            .ok("install homebrew", "done")
            .failing("brew install cursor", 1, "cask not found")
            .ok("brew install git", "done");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(
            &coordinator,
            &["homebrew", "cursor", "git"],
            ExecutionMode::AllAtOnce,
        );
        let outcome = coordinator.run_plan(&mut session).expect("run");
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                task_id: "cursor".to_string()
            }
        );
        assert_eq!(
            session.resume_point.as_ref().map(|p| p.task_id.as_str()),
            Some("cursor")
        );

        let (resumed, outcome) = coordinator.skip_and_resume(&session.id).expect("resume");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            resumed.tasks.get("cursor").expect("cursor").status,
            TaskStatus::Skipped
        );
        assert_eq!(
            resumed.tasks.get("git").expect("git").status,
            TaskStatus::Completed
        );
        // homebrew installed exactly once across both runs.
        let installs = runner
            .commands()
            .iter()
            .filter(|cmd| *cmd == "install homebrew")
            .count();
        assert_eq!(installs, 1);
    }

    /// In review mode, Skip records a skipped step and continues; Stop
    /// pauses the session with a resume point at the stopped step.
    #[test]
    fn review_mode_honors_skip_and_stop() {
        let fx = fixture(catalog(vec![
            task_with("git", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![
                        install_step("brew install git"),
                        install_step("git config --global init.defaultBranch main"),
                    ],
                };
            }),
            task_with("docker", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install --cask docker")],
                };
            }),
        ]));
        let runner = FakeRunner::new().ok("brew install git", "done");
        let gate = FakeGate::scripted(vec![Approval::Approve, Approval::Skip, Approval::Stop]);
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session =
            planned_session(&coordinator, &["git", "docker"], ExecutionMode::ReviewEachStep);
        let outcome = coordinator.run_plan(&mut session).expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Paused {
                task_id: "docker".to_string()
            }
        );
        assert_eq!(session.status, SessionStatus::Paused);

        let git = session.tasks.get("git").expect("git");
        assert_eq!(git.status, TaskStatus::Completed);
        assert_eq!(git.commands.len(), 2);
        assert_eq!(git.commands[1].status, CommandStatus::Skipped);
        assert_eq!(git.commands[1].approval, Approval::Skip);

        let point = session.resume_point.clone().expect("resume point");
        assert_eq!(point.task_id, "docker");
        assert_eq!(point.command_index, 0);
        // The docker install never ran.
        assert!(!runner.commands().contains(&"brew install --cask docker".to_string()));
    }

    /// Variant installs pick the plan's variant, fall back to default, and
    /// fail the task when nothing matches.
    #[test]
    fn variant_steps_follow_plan_membership() {
        let fx = fixture(catalog(vec![
            task_with("nvm", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install nvm")],
                };
            }),
            variant_task("node-lts", &[("nvm", "nvm install --lts"), ("default", "brew install node")]),
        ]));
        let runner = FakeRunner::new()
            .ok("brew install nvm", "done")
            .ok("nvm install --lts", "done");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session =
            planned_session(&coordinator, &["nvm", "node-lts"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(runner.commands().contains(&"nvm install --lts".to_string()));
        assert!(!runner.commands().contains(&"brew install node".to_string()));

        // Without nvm in the plan, default is used.
        let runner = FakeRunner::new().ok("brew install node", "done");
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);
        let mut session = planned_session(&coordinator, &["node-lts"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(runner.commands().contains(&"brew install node".to_string()));
    }

    /// A variant task with no matching variant and no default fails with a
    /// variant-kind failure context.
    #[test]
    fn unmatched_variant_fails_the_task() {
        let fx = fixture(catalog(vec![
            task_with("fnm", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install fnm")],
                };
            }),
            variant_task("node-lts", &[("fnm", "fnm install --lts")]),
        ]));
        let runner = FakeRunner::new();
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(&coordinator, &["node-lts"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Failed {
                task_id: "node-lts".to_string()
            }
        );
        let failure = session
            .tasks
            .get("node-lts")
            .and_then(|run| run.failure.clone())
            .expect("failure");
        assert_eq!(failure.kind, FailureKind::Variant);
    }

    /// A verify failure downgrades to a result warning; the task still
    /// completes.
    #[test]
    fn verify_failure_is_a_warning_not_a_failure() {
        let fx = fixture(catalog(vec![task_with("git", |t| {
            t.install = InstallSpec::Plain {
                steps: vec![install_step("brew install git")],
            };
            t.verify = Some(crate::manifest::Verify {
                command: "git --version".to_string(),
            });
        })]));
        let runner = FakeRunner::new()
            .ok("brew install git", "done")
            .failing("git --version", 127, "git: command not found");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut session = planned_session(&coordinator, &["git"], ExecutionMode::AllAtOnce);
        let outcome = coordinator.run_plan(&mut session).expect("run");

        assert_eq!(outcome, RunOutcome::Completed);
        let run = session.tasks.get("git").expect("run");
        assert_eq!(run.status, TaskStatus::Completed);
        assert!(run.result.contains_key("verify_warning"));
    }

    /// Expansion opens a fresh session carrying lineage and the resolved
    /// added tasks, which then runs to completion on its own.
    #[test]
    fn expand_session_runs_added_tasks() {
        let fx = fixture(catalog(vec![
            task_with("homebrew", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("install homebrew")],
                };
            }),
            task_with("docker", |t| {
                t.install = InstallSpec::Plain {
                    steps: vec![install_step("brew install --cask docker")],
                };
            }),
        ]));
        let runner = FakeRunner::new()
            .ok("install homebrew", "done")
            .ok("brew install --cask docker", "done");
        let gate = AutoApprove;
        let coordinator = Coordinator::new(&fx.manifests, &fx.store, &runner, &gate);

        let mut first = planned_session(&coordinator, &["homebrew"], ExecutionMode::AllAtOnce);
        coordinator.run_plan(&mut first).expect("first run");

        let mut expanded = coordinator
            .expand_session(&first.id, &["docker".to_string()])
            .expect("expand");
        assert_ne!(expanded.id, first.id);
        assert_eq!(expanded.expansion_history.len(), 1);
        assert_eq!(expanded.expansion_history[0].source_session_id, first.id);

        expanded.set_phase(Phase::StackSelection).expect("phase");
        expanded.set_phase(Phase::GatherRequirements).expect("phase");
        expanded.set_phase(Phase::PresentPlan).expect("phase");
        coordinator
            .approve_plan(&mut expanded, &["docker".to_string()], ExecutionMode::AllAtOnce)
            .expect("approve");
        let outcome = coordinator.run_plan(&mut expanded).expect("run expanded");
        assert_eq!(outcome, RunOutcome::Completed);

        // The source session is untouched.
        let source = fx.store.load(&first.id).expect("source");
        assert_eq!(source.status, SessionStatus::Completed);
        assert!(!source.tasks.contains_key("docker"));
    }
}
