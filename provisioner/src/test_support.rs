//! Test-only helpers: deterministic manifest builders, scripted command
//! runners and approval gates, and manifest file fixtures.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use crate::coordinator::ApprovalGate;
use crate::core::types::{
    Approval, CommandRecord, CommandStatus, ExecutionMode, Plan, PlanGroup,
};
use crate::io::runner::{CommandOutcome, CommandRunner};
use crate::manifest::{
    InstallSpec, InstallStep, Manifests, ProfileDefinition, Question, QuestionOption,
    TaskDefinition, VariantSteps,
};

/// Owned id list from literals.
pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// A minimal valid task: one plain install step, no detection, no deps.
pub fn task(id: &str) -> TaskDefinition {
    TaskDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: format!("{id} description"),
        category: "general".to_string(),
        tags: Vec::new(),
        detection: None,
        dependencies: Default::default(),
        install: InstallSpec::Plain {
            steps: vec![install_step(&format!("install {id}"))],
        },
        shell_integration: Vec::new(),
        post_install: Vec::new(),
        verify: None,
        conflicts_with: Vec::new(),
        options: BTreeMap::new(),
    }
}

/// A task customized in place.
pub fn task_with(id: &str, customize: impl FnOnce(&mut TaskDefinition)) -> TaskDefinition {
    let mut definition = task(id);
    customize(&mut definition);
    definition
}

/// A task whose install is variant-keyed, one step per variant.
pub fn variant_task(id: &str, variants: &[(&str, &str)]) -> TaskDefinition {
    task_with(id, |definition| {
        definition.install = InstallSpec::Variants {
            variants: variants
                .iter()
                .map(|(key, command)| {
                    (
                        key.to_string(),
                        VariantSteps {
                            steps: vec![install_step(command)],
                        },
                    )
                })
                .collect(),
        };
    })
}

pub fn install_step(command: &str) -> InstallStep {
    InstallStep {
        command: command.to_string(),
        description: format!("run {command}"),
    }
}

/// A validated in-memory catalog from task definitions.
pub fn catalog(tasks: Vec<TaskDefinition>) -> Manifests {
    Manifests::from_definitions(tasks, Vec::new()).expect("test catalog must validate")
}

/// An approved single-group plan over the given task ids.
pub fn approved_plan(tasks: &[&str]) -> Plan {
    let tasks = ids(tasks);
    Plan {
        groups: vec![PlanGroup {
            category: "general".to_string(),
            tasks: tasks.clone(),
        }],
        tasks,
        mode: ExecutionMode::AllAtOnce,
        approved_at: Utc::now(),
    }
}

/// An executed command record with the given status and retry counter.
pub fn command_record(command: &str, status: CommandStatus, retry_count: u32) -> CommandRecord {
    CommandRecord {
        command: command.to_string(),
        description: format!("run {command}"),
        status,
        exit_code: match status {
            CommandStatus::Success => Some(0),
            CommandStatus::Failed => Some(1),
            CommandStatus::Skipped => None,
        },
        error: None,
        output_summary: None,
        approval: Approval::Approve,
        retry_count,
        executed_at: Utc::now(),
    }
}

/// A profile with two questions: a JS runtime choice and an editor choice.
pub fn profile_fullstack_web() -> ProfileDefinition {
    let option = |letter: &str, value: &str, tasks: &[&str]| QuestionOption {
        letter: letter.to_string(),
        text: value.to_string(),
        value: Some(value.to_string()),
        tasks: ids(tasks),
        requires_user_data: Vec::new(),
    };
    ProfileDefinition {
        id: "fullstack-web".to_string(),
        name: "Full-stack web".to_string(),
        description: "Node-centric web development".to_string(),
        question_flow: vec![
            Question {
                id: "js_runtime".to_string(),
                question: "How do you want to manage Node versions?".to_string(),
                options: vec![
                    option("A", "nvm", &["nvm", "node-lts"]),
                    option("B", "fnm", &["fnm", "node-lts"]),
                ],
            },
            Question {
                id: "editor".to_string(),
                question: "Which editor do you use?".to_string(),
                options: vec![
                    option("A", "zed", &["zed"]),
                    option("B", "cursor", &["cursor"]),
                ],
            },
        ],
        required_tasks: ids(&["homebrew"]),
        default_cli_tools: ids(&["git"]),
        post_install_suggestions: Vec::new(),
    }
}

/// Write a manifest file under `<root>/tasks/<rel_path>`, creating parents.
pub fn write_manifest(root: &Path, rel_path: &str, contents: &str) {
    let path = root.join("tasks").join(rel_path);
    fs::create_dir_all(path.parent().expect("manifest path has a parent"))
        .expect("create manifest dir");
    fs::write(&path, contents).expect("write manifest");
}

/// A command runner that replays scripted outcomes and logs every call.
///
/// Unscripted commands fail with exit 127 so a test never silently succeeds
/// on a command it forgot to script. A command scripted with a sequence
/// replays it front to back, repeating the final outcome.
#[derive(Default)]
pub struct FakeRunner {
    scripts: RefCell<BTreeMap<String, VecDeque<CommandOutcome>>>,
    log: RefCell<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a command to succeed with the given stdout.
    #[must_use]
    pub fn ok(self, command: &str, stdout: &str) -> Self {
        self.push(command, success_outcome(stdout));
        self
    }

    /// Script a command to fail with the given exit code and stderr.
    #[must_use]
    pub fn failing(self, command: &str, exit_code: i32, stderr: &str) -> Self {
        self.push(command, failure_outcome(exit_code, stderr));
        self
    }

    /// Script a command to fail once, then succeed on the retry.
    #[must_use]
    pub fn failing_then_ok(
        self,
        command: &str,
        exit_code: i32,
        stderr: &str,
        stdout: &str,
    ) -> Self {
        self.push(command, failure_outcome(exit_code, stderr));
        self.push(command, success_outcome(stdout));
        self
    }

    /// Script a command to time out.
    #[must_use]
    pub fn timing_out(self, command: &str) -> Self {
        self.push(
            command,
            CommandOutcome {
                exit_code: None,
                stdout_summary: String::new(),
                error: Some("timed out after 600s".to_string()),
                timed_out: true,
            },
        );
        self
    }

    /// Every command issued, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn push(&self, command: &str, outcome: CommandOutcome) {
        self.scripts
            .borrow_mut()
            .entry(command.to_string())
            .or_default()
            .push_back(outcome);
    }
}

impl CommandRunner for FakeRunner {
    fn execute(&self, command: &str) -> Result<CommandOutcome> {
        self.log.borrow_mut().push(command.to_string());
        let mut scripts = self.scripts.borrow_mut();
        let outcome = match scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty queue"),
            Some(queue) => queue.front().cloned().expect("non-empty queue"),
            None => failure_outcome(127, &format!("command not scripted: {command}")),
        };
        Ok(outcome)
    }
}

fn success_outcome(stdout: &str) -> CommandOutcome {
    CommandOutcome {
        exit_code: Some(0),
        stdout_summary: stdout.trim().to_string(),
        error: None,
        timed_out: false,
    }
}

fn failure_outcome(exit_code: i32, stderr: &str) -> CommandOutcome {
    CommandOutcome {
        exit_code: Some(exit_code),
        stdout_summary: String::new(),
        error: Some(stderr.to_string()),
        timed_out: false,
    }
}

/// An approval gate replaying a scripted decision sequence, approving once
/// the script runs out.
#[derive(Default)]
pub struct FakeGate {
    script: RefCell<VecDeque<Approval>>,
}

impl FakeGate {
    pub fn scripted(decisions: Vec<Approval>) -> Self {
        Self {
            script: RefCell::new(decisions.into()),
        }
    }
}

impl ApprovalGate for FakeGate {
    fn review(&self, _task_id: &str, _step: &InstallStep) -> Approval {
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or(Approval::Approve)
    }
}
