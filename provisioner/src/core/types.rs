//! Shared types for the session document and execution records.
//!
//! These types define the persisted session schema and must remain
//! deterministic to serialize: maps are `BTreeMap`, enums carry fixed
//! serde names, and no field depends on ambient state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Interview/execution phase of a session, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SessionCheck,
    StackSelection,
    GatherRequirements,
    PresentPlan,
    Execute,
    Completion,
}

impl Phase {
    /// The phase that legally follows this one, if any.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::SessionCheck => Some(Phase::StackSelection),
            Phase::StackSelection => Some(Phase::GatherRequirements),
            Phase::GatherRequirements => Some(Phase::PresentPlan),
            Phase::PresentPlan => Some(Phase::Execute),
            Phase::Execute => Some(Phase::Completion),
            Phase::Completion => None,
        }
    }
}

/// Lifecycle status of a session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
    Paused,
}

/// Status of one task within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// `completed` and `skipped` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

/// Outcome of one executed (or skipped) shell step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failed,
    Skipped,
}

/// The user's decision at a command approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Approve,
    Skip,
    Stop,
}

/// How the approved plan should be walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    AllAtOnce,
    ReviewEachStep,
}

/// What the coordinator should do when a session resumes at its resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    Retry,
    RetryOrSkip,
}

/// Classification of an install-step failure, used to suggest a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Permission,
    Timeout,
    Command,
    Variant,
}

/// An answered interview question. Re-asking the same question id replaces
/// the previous record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// The question as presented to the user.
    pub question: String,
    /// Chosen letter (A-E).
    pub letter: String,
    /// Semantic value the letter maps to (e.g. "nvm").
    pub value: String,
    pub recorded_at: DateTime<Utc>,
}

/// Basic descriptor of the machine being provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub hostname: String,
    pub os_version: String,
    pub architecture: String,
    pub chip: String,
}

/// One executed (or skipped) shell step within a task. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Literal command text as issued.
    pub command: String,
    /// Human description of the step.
    pub description: String,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output_summary: Option<String>,
    /// The user's decision at the approval gate for this step.
    pub approval: Approval,
    /// 0 on first issue, incremented per retry of the same command.
    pub retry_count: u32,
    pub executed_at: DateTime<Utc>,
}

/// Why and how a task failed, surfaced to the user for a retry/skip choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub kind: FailureKind,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Execution record for one task within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub status: TaskStatus,
    pub skip_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Append-only command history; retries add records, never rewrite.
    pub commands: Vec<CommandRecord>,
    pub result: BTreeMap<String, String>,
    pub failure: Option<FailureContext>,
}

impl TaskRun {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            skip_reason: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            commands: Vec::new(),
            result: BTreeMap::new(),
            failure: None,
        }
    }

    /// Index of the next step to run: the number of steps already settled,
    /// either executed successfully or skipped at the approval gate. Failed
    /// records retry the same step and do not advance the index.
    pub fn settled_steps(&self) -> usize {
        self.commands
            .iter()
            .filter(|record| {
                matches!(record.status, CommandStatus::Success | CommandStatus::Skipped)
            })
            .count()
    }
}

/// Tasks of one display category, in resolved order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanGroup {
    pub category: String,
    pub tasks: Vec<String>,
}

/// The approved, resolved set of tasks. Immutable after approval; re-entering
/// planning produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Dependency-ordered task ids (dependencies before dependents).
    pub tasks: Vec<String>,
    /// The same ids grouped by category for display.
    pub groups: Vec<PlanGroup>,
    pub mode: ExecutionMode,
    pub approved_at: DateTime<Utc>,
}

/// Pointer to where an interrupted session should continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub task_id: String,
    /// Index of the next install step to run within the task.
    pub command_index: usize,
    pub action: ResumeAction,
    pub context: Option<String>,
}

/// Lineage record written when a completed session is reopened for expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    pub source_session_id: String,
    pub expanded_at: DateTime<Utc>,
    pub added_tasks: Vec<String>,
}

/// One entry of the append-only phase history: the phase being left and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    pub ended_at: DateTime<Utc>,
}
