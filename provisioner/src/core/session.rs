//! The session aggregate and its state machines.
//!
//! A [`Session`] is the authoritative in-memory record of one provisioning
//! run: interview phases, recorded choices, the approved plan, per-task
//! execution history, and the resume point. Every mutation validates the
//! transition first and returns [`TransitionError`] instead of corrupting
//! state. Persistence is someone else's job (`io::session_store`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::TransitionError;
use crate::core::types::{
    Choice, CommandRecord, CommandStatus, ExpansionRecord, FailureContext, FailureKind,
    MachineInfo, Phase, PhaseTransition, Plan, ResumeAction, ResumePoint, SessionStatus, TaskRun,
    TaskStatus,
};

/// Current phase plus the append-only history of phases already left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub current: Phase,
    pub history: Vec<PhaseTransition>,
}

/// One provisioning session. Created at interview start, mutated throughout,
/// and relocated to a terminal store on exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub machine: Option<MachineInfo>,
    pub phase: PhaseState,
    pub profile: Option<String>,
    pub choices: BTreeMap<String, Choice>,
    pub user_data: BTreeMap<String, String>,
    pub tasks: BTreeMap<String, TaskRun>,
    pub plan: Option<Plan>,
    pub resume_point: Option<ResumePoint>,
    pub expansion_history: Vec<ExpansionRecord>,
}

impl Session {
    /// Create a fresh session at `session_check`, `in_progress`.
    pub fn new(id: impl Into<String>, profile: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::InProgress,
            machine: None,
            phase: PhaseState {
                current: Phase::SessionCheck,
                history: Vec::new(),
            },
            profile,
            choices: BTreeMap::new(),
            user_data: BTreeMap::new(),
            tasks: BTreeMap::new(),
            plan: None,
            resume_point: None,
            expansion_history: Vec::new(),
        }
    }

    /// Build a new session that expands a completed one with more tasks.
    ///
    /// The source is never mutated; lineage is preserved through an
    /// [`ExpansionRecord`]. Tasks already completed in the source are
    /// excluded from the added set.
    pub fn expand_from(
        source: &Session,
        new_id: impl Into<String>,
        added_tasks: &[String],
    ) -> Result<Session, TransitionError> {
        if source.status != SessionStatus::Completed {
            return Err(TransitionError::NotExpandable {
                id: source.id.clone(),
                status: source.status,
            });
        }

        let added: Vec<String> = added_tasks
            .iter()
            .filter(|id| {
                source
                    .tasks
                    .get(*id)
                    .is_none_or(|run| run.status != TaskStatus::Completed)
            })
            .cloned()
            .collect();

        let mut session = Session::new(new_id, source.profile.clone());
        session.machine = source.machine.clone();
        session.user_data = source.user_data.clone();
        for id in &added {
            session.tasks.insert(id.clone(), TaskRun::pending());
        }
        session.expansion_history = source.expansion_history.clone();
        session.expansion_history.push(ExpansionRecord {
            source_session_id: source.id.clone(),
            expanded_at: Utc::now(),
            added_tasks: added,
        });
        Ok(session)
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::InProgress => Ok(()),
            status => Err(TransitionError::SessionClosed {
                id: self.id.clone(),
                status,
            }),
        }
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut TaskRun, TransitionError> {
        let Some(run) = self.tasks.get_mut(id) else {
            return Err(TransitionError::UnknownTask { id: id.to_string() });
        };
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Phase management
    // -----------------------------------------------------------------------

    /// Advance to the defined successor phase, appending the current phase
    /// to history. Any other target is rejected; resuming jumps via
    /// [`Session::resume`], rewinding via [`Session::rewind_phase`].
    pub fn set_phase(&mut self, to: Phase) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.phase.current.successor() != Some(to) {
            return Err(TransitionError::Phase {
                from: self.phase.current,
                to,
            });
        }
        self.push_phase(to);
        Ok(())
    }

    /// User-directed override: jump back to an earlier phase (e.g. re-enter
    /// planning). Forward jumps stay illegal.
    pub fn rewind_phase(&mut self, to: Phase) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if to >= self.phase.current {
            return Err(TransitionError::Phase {
                from: self.phase.current,
                to,
            });
        }
        self.push_phase(to);
        Ok(())
    }

    fn push_phase(&mut self, to: Phase) {
        debug!(session = %self.id, from = ?self.phase.current, to = ?to, "phase transition");
        self.phase.history.push(PhaseTransition {
            phase: self.phase.current,
            ended_at: Utc::now(),
        });
        self.phase.current = to;
    }

    // -----------------------------------------------------------------------
    // Interview records
    // -----------------------------------------------------------------------

    /// Upsert an answered question; re-asking replaces the prior answer.
    pub fn record_choice(
        &mut self,
        question_id: &str,
        choice: Choice,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.choices.insert(question_id.to_string(), choice);
        Ok(())
    }

    pub fn record_user_data(&mut self, key: &str, value: &str) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.user_data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_machine(&mut self, machine: MachineInfo) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.machine = Some(machine);
        Ok(())
    }

    /// Record the approved plan and seed pending task runs for its tasks.
    ///
    /// Legal only while still planning (`present_plan` or earlier). Existing
    /// task runs are kept as-is so expansion seeds survive.
    pub fn set_plan(&mut self, plan: Plan) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.phase.current > Phase::PresentPlan {
            return Err(TransitionError::PlanLocked {
                phase: self.phase.current,
            });
        }
        for id in &plan.tasks {
            self.tasks
                .entry(id.clone())
                .or_insert_with(TaskRun::pending);
        }
        self.plan = Some(plan);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task state machine
    // -----------------------------------------------------------------------

    /// `pending -> in_progress`, or `failed -> in_progress` for a retry.
    pub fn start_task(&mut self, id: &str) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let run = self.task_mut(id)?;
        match run.status {
            TaskStatus::Pending | TaskStatus::Failed => {}
            from => {
                return Err(TransitionError::Task {
                    id: id.to_string(),
                    from,
                    to: TaskStatus::InProgress,
                });
            }
        }
        run.status = TaskStatus::InProgress;
        run.started_at = Some(Utc::now());
        let command_index = run.settled_steps();
        self.resume_point = Some(ResumePoint {
            task_id: id.to_string(),
            command_index,
            action: ResumeAction::Retry,
            context: None,
        });
        Ok(())
    }

    /// `in_progress -> completed`. Merges `result` into the task's result map
    /// and clears the resume point for this task.
    pub fn complete_task(
        &mut self,
        id: &str,
        result: BTreeMap<String, String>,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let run = self.task_mut(id)?;
        if run.status != TaskStatus::InProgress {
            return Err(TransitionError::Task {
                id: id.to_string(),
                from: run.status,
                to: TaskStatus::Completed,
            });
        }
        run.status = TaskStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.result.extend(result);
        self.clear_resume_point_for(id);
        Ok(())
    }

    /// `in_progress -> failed`, recording failure context and a resume point
    /// pointing at the failed step.
    pub fn fail_task(
        &mut self,
        id: &str,
        kind: FailureKind,
        message: &str,
        suggestion: Option<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let run = self.task_mut(id)?;
        if run.status != TaskStatus::InProgress {
            return Err(TransitionError::Task {
                id: id.to_string(),
                from: run.status,
                to: TaskStatus::Failed,
            });
        }
        run.status = TaskStatus::Failed;
        run.failed_at = Some(Utc::now());
        run.failure = Some(FailureContext {
            kind,
            message: message.to_string(),
            suggestion,
        });
        let command_index = run.settled_steps();
        self.resume_point = Some(ResumePoint {
            task_id: id.to_string(),
            command_index,
            action: ResumeAction::RetryOrSkip,
            context: Some(message.to_string()),
        });
        Ok(())
    }

    /// `pending|failed|in_progress -> skipped` (already installed, or the
    /// user gave up on a failed task).
    pub fn skip_task(&mut self, id: &str, reason: &str) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let run = self.task_mut(id)?;
        if run.status.is_terminal() {
            return Err(TransitionError::Task {
                id: id.to_string(),
                from: run.status,
                to: TaskStatus::Skipped,
            });
        }
        run.status = TaskStatus::Skipped;
        run.skip_reason = Some(reason.to_string());
        self.clear_resume_point_for(id);
        Ok(())
    }

    /// Append a command record to a task's history. Never rewrites prior
    /// entries; a retry is a new record with an incremented retry counter.
    pub fn append_command(
        &mut self,
        task_id: &str,
        record: CommandRecord,
    ) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let run = self.task_mut(task_id)?;
        run.commands.push(record);
        Ok(())
    }

    /// Retry counter for a command about to be issued: the number of prior
    /// executions (success or failure) of the same command text within the
    /// task. Gate-skipped records never ran, so they do not count; an
    /// alternative command starts back at zero.
    pub fn retry_count_for(&self, task_id: &str, command: &str) -> u32 {
        self.tasks
            .get(task_id)
            .map(|run| {
                run.commands
                    .iter()
                    .filter(|record| {
                        record.command == command && record.status != CommandStatus::Skipped
                    })
                    .count() as u32
            })
            .unwrap_or(0)
    }

    pub fn set_resume_point(&mut self, point: ResumePoint) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.resume_point = Some(point);
        Ok(())
    }

    fn clear_resume_point_for(&mut self, task_id: &str) {
        if self
            .resume_point
            .as_ref()
            .is_some_and(|point| point.task_id == task_id)
        {
            self.resume_point = None;
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// `in_progress -> completed`. Terminal: no further mutation allowed.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = SessionStatus::Completed;
        Ok(())
    }

    /// `in_progress -> failed`.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = SessionStatus::Failed;
        Ok(())
    }

    /// `in_progress -> paused`.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = SessionStatus::Paused;
        Ok(())
    }

    /// `failed|paused -> in_progress`, jumping the phase directly to
    /// `execute`. The only way back into a session.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        match self.status {
            SessionStatus::Failed | SessionStatus::Paused => {}
            status => {
                return Err(TransitionError::SessionClosed {
                    id: self.id.clone(),
                    status,
                });
            }
        }
        self.status = SessionStatus::InProgress;
        if self.phase.current != Phase::Execute {
            self.push_phase(Phase::Execute);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Task ids in the given status, in plan order when a plan exists.
    pub fn tasks_in_status(&self, status: TaskStatus) -> Vec<String> {
        let ordered: Vec<&String> = match &self.plan {
            Some(plan) => plan.tasks.iter().collect(),
            None => self.tasks.keys().collect(),
        };
        ordered
            .into_iter()
            .filter(|id| self.tasks.get(*id).is_some_and(|run| run.status == status))
            .cloned()
            .collect()
    }

    /// True when every task in the plan reached a terminal status.
    pub fn all_tasks_terminal(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.tasks.iter().all(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|run| run.status.is_terminal())
            }),
            None => true,
        }
    }
}
