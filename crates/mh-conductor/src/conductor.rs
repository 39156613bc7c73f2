use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use mh_agents::events::AgentEvent;
use mh_agents::runner::{AgentRunner, InvocationSpec, RunOutcome};
use mh_agents::selection::{resolve_agent, AgentSelection};
use mh_agents::watcher::WorkTreeWatcher;
use mh_agents::{AgentRegistry, CommandAgent};
use mh_bridge::{CancelToken, ConductorEvent, EventBus};
use mh_core::config::{render_template, WorkspaceConfig};
use mh_core::ident::{slugify, TaskId};
use mh_core::store::{StoreError, WorkspaceStore};
use mh_core::types::{
    ActiveTask, Note, NoteRole, PendingQuestion, SessionKind, SessionRecord, SpecStatus, StepKind,
    TaskAgent, TaskCosts, TaskSource, TaskWork, WorkflowState,
};
use mh_providers::{ProviderRegistry, PullRequestSpec};
use mh_vcs::{GitVcs, RepoReader, VcsError};

use crate::error::{ConductorError, Result};
use crate::quality::{AutoConfirm, ConfirmPrompt, QualityGate, QualityResult, StdinConfirm};
use crate::review::{ReviewTool, ReviewVerdict};
use crate::state::{InvalidTransition, WorkflowEvent, WorkflowMachine};

// ---------------------------------------------------------------------------
// Options / results
// ---------------------------------------------------------------------------

/// Cross-cutting options fixed at conductor construction.
#[derive(Debug, Clone, Default)]
pub struct ConductorOptions {
    /// CLI global agent override.
    pub agent: Option<String>,
    /// CLI per-step agent overrides, keyed by step name.
    pub step_agents: BTreeMap<String, String>,
    /// Auto-answer agent questions (auto mode).
    pub skip_agent_questions: bool,
    /// Refuse agent file writes.
    pub dry_run: bool,
    /// Review tool command override.
    pub review_command: Option<String>,
    /// Quality make-target override.
    pub quality_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Create a task branch (implied by `use_worktree`).
    pub create_branch: bool,
    /// Spawn a linked worktree for the task.
    pub use_worktree: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            create_branch: true,
            use_worktree: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinishOptions {
    pub skip_quality: bool,
    /// Create a pull request instead of merging locally.
    pub pr: bool,
    pub pr_draft: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub delete_branch: bool,
    pub push: bool,
    /// Merge target; defaults to the branch the task was started from.
    pub target_branch: Option<String>,
}

impl Default for FinishOptions {
    fn default() -> Self {
        Self {
            skip_quality: false,
            pr: false,
            pr_draft: false,
            pr_title: None,
            pr_body: None,
            delete_branch: true,
            push: false,
            target_branch: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbandonOptions {
    pub keep_branch: bool,
    pub keep_work: bool,
}

/// Snapshot of the active task for `status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub title: String,
    pub state: WorkflowState,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub specifications: usize,
    pub open_specifications: usize,
    pub checkpoints: usize,
    pub checkpoint_cursor: usize,
    pub pending_question: Option<String>,
    pub costs: TaskCosts,
}

/// How an agent-driven step ended.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed,
    /// The agent raised a question; the workflow is `waiting`.
    QuestionPending(PendingQuestion),
}

/// What `note` did.
#[derive(Debug, Clone)]
pub struct NoteOutcome {
    /// The note answered a pending question.
    pub answered: bool,
    /// The state to resume when a question was answered.
    pub resume: Option<WorkflowState>,
}

/// What `review` produced.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    pub artifact_number: u32,
    pub artifact_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Conductor
// ---------------------------------------------------------------------------

/// The long-lived owner of one task's lifecycle.
///
/// Composes the workspace store, the VCS adapter, the event bus, and the
/// provider/agent registries. Public operations are serialized: two calls
/// against the same active task never run concurrently
/// (`OperationInProgress`). Every successful transition is persisted to
/// `active.json` before the logic that depends on it runs.
pub struct Conductor {
    /// Root of the checkout this conductor operates in (worktree-aware).
    workdir: PathBuf,
    /// Task records live in the main worktree's store.
    store: WorkspaceStore,
    /// The active-task pointer lives in the current checkout's store.
    active_store: WorkspaceStore,
    config: WorkspaceConfig,
    bus: EventBus,
    agents: AgentRegistry,
    providers: ProviderRegistry,
    options: ConductorOptions,
    confirm: Box<dyn ConfirmPrompt>,
    op_gate: Mutex<()>,
}

impl Conductor {
    /// Open a conductor for the repository containing `cwd`, with the
    /// built-in providers and agents registered.
    pub async fn open(cwd: impl AsRef<Path>, options: ConductorOptions) -> Result<Self> {
        let mut agents = AgentRegistry::new();
        for (name, program) in [
            ("claude", "claude"),
            ("codex", "codex"),
            ("gemini", "gemini"),
            ("opencode", "opencode"),
        ] {
            agents
                .register(name, move || Arc::new(CommandAgent::new(name, program)))
                .map_err(ConductorError::Agent)?;
        }
        Self::with_registries(cwd, options, agents, ProviderRegistry::with_builtins()).await
    }

    /// Open with caller-supplied registries (tests inject scripted agents
    /// this way).
    pub async fn with_registries(
        cwd: impl AsRef<Path>,
        options: ConductorOptions,
        mut agents: AgentRegistry,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let root = RepoReader::root(cwd.as_ref()).map_err(ConductorError::Vcs)?;
        let record_root = if RepoReader::is_worktree(&root).map_err(ConductorError::Vcs)? {
            RepoReader::main_worktree_path(&root).map_err(ConductorError::Vcs)?
        } else {
            root.clone()
        };

        let store = WorkspaceStore::open(&record_root);
        store.init().await?;
        let active_store = WorkspaceStore::open(&root);
        if root != record_root {
            active_store.init().await?;
        }

        let config = WorkspaceConfig::load(store.config_path())
            .map_err(|e| ConductorError::UserInput(e.to_string()))?;
        agents
            .register_config_aliases(&config)
            .map_err(ConductorError::Agent)?;

        let confirm: Box<dyn ConfirmPrompt> = if options.skip_agent_questions {
            Box::new(AutoConfirm)
        } else {
            Box::new(StdinConfirm)
        };

        Ok(Self {
            workdir: root,
            store,
            active_store,
            config,
            bus: EventBus::new(),
            agents,
            providers,
            options,
            confirm,
            op_gate: Mutex::new(()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Path of the workspace `settings.json`.
    pub fn settings_path(&self) -> PathBuf {
        self.store.settings_path()
    }

    // -- Start ------------------------------------------------------------

    /// Register a task from a provider reference, create its branch (and
    /// optionally a worktree), and set it active.
    pub async fn start(
        &self,
        reference: &str,
        opts: StartOptions,
        cancel: &CancelToken,
    ) -> Result<TaskStatus> {
        let _guard = self.op_guard()?;
        let op = "start";

        if let Some(active) = self.active_store.read_active().await? {
            return Err(self.report(
                op,
                ConductorError::TaskAlreadyActive(active.task_id.to_string()),
            ));
        }
        if cancel.is_cancelled() {
            return Err(ConductorError::Cancelled);
        }

        // Fetch the work unit.
        let (provider, local_ref) = self
            .providers
            .resolve(reference, self.config.providers.default.as_deref())
            .map_err(|e| self.report(op, e.into()))?;
        let unit = provider
            .fetch(&local_ref)
            .await
            .map_err(|e| self.report(op, e.into()))?;

        // Build the task record.
        let id = TaskId::generate();
        let slug = unit
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&unit.title));
        let agent = self
            .resolve_step_agent(StepKind::Planning, Some(&unit.agent))
            .map_err(|e| self.report(op, e))?;

        let mut task = TaskWork::new(
            id.clone(),
            unit.title.clone(),
            TaskSource {
                provider: provider.name().to_string(),
                reference: reference.to_string(),
                snapshot: unit.body.clone(),
            },
            agent,
        );
        task.metadata.external_key = unit.external_key.clone();
        task.metadata.task_type = unit.task_type.clone();
        task.metadata.slug = Some(slug.clone());
        task.agent_overrides = unit.agent.clone();

        // Branch and worktree.
        let vcs = GitVcs::new(&self.workdir);
        let base_branch = vcs.current_branch().map_err(|e| self.report(op, e.into()))?;
        task.git.base_branch = Some(base_branch.clone());

        let create_branch = opts.create_branch || opts.use_worktree;
        let mut task_workdir = self.workdir.clone();
        if create_branch {
            let branch = self.branch_name(&task);
            vcs.create_branch(&branch, &base_branch)
                .map_err(|e| self.report(op, e.into()))?;

            if opts.use_worktree {
                let wt_path = self.store.work_dir(&id).join("worktree");
                vcs.add_worktree(&wt_path, &branch)
                    .map_err(|e| self.report(op, e.into()))?;
                task.git.worktree_path = Some(wt_path.display().to_string());
                task_workdir = wt_path;
            } else {
                vcs.checkout(&branch).map_err(|e| self.report(op, e.into()))?;
            }
            task.git.branch = Some(branch.clone());
            self.bus.publish(ConductorEvent::BranchCreated { branch });
        }

        // Registration checkpoint on the task branch.
        let task_vcs = GitVcs::new(&task_workdir);
        let message = format!("{} register task", self.commit_prefix(&task));
        let cp_id = task_vcs
            .commit(&message)
            .map_err(|e| self.report(op, e.into()))?;
        let number = task.push_checkpoint(&cp_id, &message);
        self.bus.publish(ConductorEvent::Checkpoint {
            number,
            id: cp_id,
            message,
        });

        self.store.write_task(&task).await?;

        // The active pointer lives in the checkout the task runs in.
        let active = ActiveTask {
            task_id: id.clone(),
            state: WorkflowState::Idle,
            branch: task.git.branch.clone(),
            worktree_path: task.git.worktree_path.clone(),
            working_dir: task_workdir.display().to_string(),
            started_at: chrono::Utc::now(),
        };
        if opts.use_worktree {
            let wt_store = WorkspaceStore::open(&task_workdir);
            wt_store.init().await?;
            wt_store.write_active(&active).await?;
        } else {
            self.active_store.write_active(&active).await?;
        }

        info!(task_id = %id, title = %task.metadata.title, "task registered");
        Ok(self.status_of(&active, &task).await)
    }

    // -- Plan -------------------------------------------------------------

    /// Run the planning agent. Writes numbered specifications into the work
    /// directory and records a checkpoint.
    pub async fn plan(&self, cancel: &CancelToken) -> Result<StepOutcome> {
        let _guard = self.op_guard()?;
        let op = "plan";
        let (mut active, mut task) = self.load_active(op).await?;

        if active.state != WorkflowState::Planning {
            let mut machine = WorkflowMachine::at(active.state);
            machine
                .transition(WorkflowEvent::Plan)
                .map_err(|e| self.report(op, self.transition_error(e)))?;
            self.set_state(&mut active, WorkflowState::Planning).await?;
        }

        let prompt = self.planning_prompt(&task).await?;
        let work_dir = self.store.work_dir(&task.metadata.id);
        let run = self
            .run_step(StepKind::Planning, SessionKind::Planning, prompt, &work_dir, &mut task, cancel)
            .await
            .map_err(|e| self.report(op, e))?;

        if let Some(question) = run.outcome.question {
            return self
                .park_on_question(&mut active, question.text, question.options)
                .await;
        }

        // Fold freshly written specification files into the record; when the
        // agent produced none, its transcript becomes the specification.
        let known: HashSet<u32> = task.specifications.iter().map(|s| s.number).collect();
        let on_disk = self.store.list_spec_numbers(&task.metadata.id).await?;
        let mut new_specs = 0;
        for number in on_disk {
            if known.contains(&number) {
                continue;
            }
            let content = self.store.read_specification(&task.metadata.id, number).await?;
            let title = mh_core::frontmatter::first_heading(&content)
                .unwrap_or(&task.metadata.title)
                .to_string();
            task.specifications.push(mh_core::types::Specification {
                number,
                title,
                status: SpecStatus::Ready,
                created_at: chrono::Utc::now(),
                completed_at: None,
            });
            new_specs += 1;
        }
        if new_specs == 0 {
            let title = task.metadata.title.clone();
            let body = if run.transcript.trim().is_empty() {
                task.source.snapshot.clone()
            } else {
                run.transcript.clone()
            };
            self.store
                .create_specification(&mut task, &title, &body)
                .await?;
        }

        self.checkpoint(&mut task, "plan").await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;
        self.store.write_task(&task).await?;
        Ok(StepOutcome::Completed)
    }

    // -- Implement --------------------------------------------------------

    /// Run the implementing agent against the working tree. Requires at
    /// least one specification that is not `done`.
    pub async fn implement(&self, cancel: &CancelToken) -> Result<StepOutcome> {
        let _guard = self.op_guard()?;
        let op = "implement";
        let (mut active, mut task) = self.load_active(op).await?;

        if task.specifications.is_empty() {
            return Err(self.report(
                op,
                ConductorError::invalid_transition(
                    InvalidTransition {
                        state: active.state,
                        event: WorkflowEvent::Implement,
                    },
                    "no specifications; run `mh plan` first",
                ),
            ));
        }

        if active.state != WorkflowState::Implementing {
            let mut machine = WorkflowMachine::at(active.state);
            machine
                .transition(WorkflowEvent::Implement)
                .map_err(|e| self.report(op, self.transition_error(e)))?;
            self.set_state(&mut active, WorkflowState::Implementing).await?;
        }

        let watcher = WorkTreeWatcher::start(&self.workdir)
            .map_err(|e| {
                warn!(error = %e, "working-tree watcher unavailable");
                e
            })
            .ok();

        let prompt = self.implementing_prompt(&task).await?;
        let workdir = self.workdir.clone();
        let run = self
            .run_step(StepKind::Implementing, SessionKind::Implementing, prompt, &workdir, &mut task, cancel)
            .await
            .map_err(|e| self.report(op, e))?;

        if let Some(question) = run.outcome.question {
            return self
                .park_on_question(&mut active, question.text, question.options)
                .await;
        }

        // Direct edits the agent made without announcing them.
        if let Some(watcher) = watcher {
            let announced: HashSet<String> =
                run.files.iter().map(|(path, _)| path.clone()).collect();
            for (path, file_op) in watcher.drain() {
                if !announced.contains(&path) {
                    self.bus
                        .publish(ConductorEvent::FileChanged { path, op: file_op });
                }
            }
            watcher.stop();
        }

        // Mark specifications done; an agent that reports nothing completed
        // everything it was given.
        let completed: Vec<u32> = if run.outcome.completed_specs.is_empty() {
            task.open_specifications().iter().map(|s| s.number).collect()
        } else {
            run.outcome.completed_specs.clone()
        };
        let now = chrono::Utc::now();
        for spec in task.specifications.iter_mut() {
            if completed.contains(&spec.number) && spec.status != SpecStatus::Done {
                spec.status = SpecStatus::Done;
                spec.completed_at = Some(now);
            }
        }

        self.checkpoint(&mut task, "implement").await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;
        self.store.write_task(&task).await?;
        Ok(StepOutcome::Completed)
    }

    // -- Review -----------------------------------------------------------

    /// Run the external review tool, classify its output, and write a
    /// numbered review artifact. Never modifies code.
    pub async fn review(&self, cancel: &CancelToken) -> Result<ReviewOutcome> {
        let _guard = self.op_guard()?;
        let op = "review";
        let (mut active, mut task) = self.load_active(op).await?;

        let mut machine = WorkflowMachine::at(active.state);
        machine
            .transition(WorkflowEvent::Review)
            .map_err(|e| self.report(op, self.transition_error(e)))?;
        self.set_state(&mut active, WorkflowState::Reviewing).await?;

        let tool = match &self.options.review_command {
            Some(cmd) => ReviewTool::from_command_line(cmd),
            None => ReviewTool::default(),
        };
        let (verdict, output) = tool.run(&self.workdir, cancel).await?;
        let (artifact_number, artifact_path) =
            self.store.write_review(&task.metadata.id, &output).await?;

        self.checkpoint(&mut task, "review").await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;
        self.store.write_task(&task).await?;

        info!(verdict = ?verdict, artifact = %artifact_path.display(), "review recorded");
        Ok(ReviewOutcome {
            verdict,
            artifact_number,
            artifact_path,
        })
    }

    // -- Dialogue ---------------------------------------------------------

    /// Ask the dialogue agent a free-form question about the task. The
    /// exchange is recorded as a session and a checkpoint like any other
    /// agent step; the reply transcript is returned.
    pub async fn dialogue(&self, message: &str, cancel: &CancelToken) -> Result<String> {
        let _guard = self.op_guard()?;
        let op = "dialogue";
        let (mut active, mut task) = self.load_active(op).await?;

        if active.state != WorkflowState::Dialogue {
            let mut machine = WorkflowMachine::at(active.state);
            machine
                .transition(WorkflowEvent::Dialogue)
                .map_err(|e| self.report(op, self.transition_error(e)))?;
            self.set_state(&mut active, WorkflowState::Dialogue).await?;
        }

        let notes = self.store.read_notes(&task.metadata.id).await?;
        let mut prompt = format!(
            "Answer a question about this task. Do not change any files.\n\n\
             # Task: {}\n\n{}\n",
            task.metadata.title, task.source.snapshot
        );
        if !notes.trim().is_empty() {
            prompt.push_str("\n# Notes\n");
            prompt.push_str(&notes);
        }
        prompt.push_str(&format!("\n# Question\n{message}\n"));

        let workdir = self.workdir.clone();
        let run = self
            .run_step(StepKind::Dialogue, SessionKind::Dialogue, prompt, &workdir, &mut task, cancel)
            .await
            .map_err(|e| self.report(op, e))?;

        if let Some(question) = run.outcome.question {
            self.park_on_question(&mut active, question.text, question.options)
                .await?;
            return Ok(run.transcript);
        }

        self.checkpoint(&mut task, "dialogue").await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;
        self.store.write_task(&task).await?;
        Ok(run.transcript)
    }

    // -- Note / answer ----------------------------------------------------

    /// Append a note. When a question is pending, the note is its answer:
    /// the question is cleared and the workflow leaves `waiting`.
    pub async fn note(&self, message: &str, role: NoteRole) -> Result<NoteOutcome> {
        let _guard = self.op_guard()?;
        let op = "note";
        let (mut active, task) = self.load_active(op).await?;
        let id = task.metadata.id.clone();

        if let Some(question) = self.store.read_pending_question(&id).await? {
            self.store
                .append_note(
                    &id,
                    &Note {
                        role: NoteRole::Answer,
                        state: active.state,
                        recorded_at: chrono::Utc::now(),
                        message: message.to_string(),
                    },
                )
                .await?;
            self.store.clear_pending_question(&id).await?;

            let mut machine = WorkflowMachine::waiting_from(question.prior_state);
            let resumed = machine
                .transition(WorkflowEvent::Answered)
                .map_err(|e| self.report(op, self.transition_error(e)))?;
            self.set_state(&mut active, resumed).await?;
            info!(state = %resumed, "pending question answered");
            return Ok(NoteOutcome {
                answered: true,
                resume: Some(resumed),
            });
        }

        self.store
            .append_note(
                &id,
                &Note {
                    role,
                    state: active.state,
                    recorded_at: chrono::Utc::now(),
                    message: message.to_string(),
                },
            )
            .await?;
        Ok(NoteOutcome {
            answered: false,
            resume: None,
        })
    }

    // -- Undo / redo ------------------------------------------------------

    /// Reset the working tree to the previous checkpoint, keeping the
    /// forward history for `redo`.
    pub async fn undo(&self, _cancel: &CancelToken) -> Result<()> {
        let _guard = self.op_guard()?;
        let op = "undo";
        let (mut active, mut task) = self.load_active(op).await?;

        let mut machine = WorkflowMachine::at(active.state);
        machine
            .transition(WorkflowEvent::Undo)
            .map_err(|e| self.report(op, self.transition_error(e)))?;

        if task.checkpoint_cursor <= 1 {
            return Err(self.report(
                op,
                ConductorError::NotFound("no earlier checkpoint to undo to".into()),
            ));
        }

        self.set_state(&mut active, WorkflowState::Reverting).await?;
        let target = task.checkpoints[task.checkpoint_cursor - 2].clone();
        GitVcs::new(&self.workdir)
            .reset_to(&target.id)
            .map_err(|e| self.report(op, e.into()))?;
        task.checkpoint_cursor -= 1;
        self.store.write_task(&task).await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;

        info!(checkpoint = target.number, "undid to checkpoint");
        Ok(())
    }

    /// Move forward one checkpoint in the retained history.
    pub async fn redo(&self, _cancel: &CancelToken) -> Result<()> {
        let _guard = self.op_guard()?;
        let op = "redo";
        let (mut active, mut task) = self.load_active(op).await?;

        let mut machine = WorkflowMachine::at(active.state);
        machine
            .transition(WorkflowEvent::Redo)
            .map_err(|e| self.report(op, self.transition_error(e)))?;

        if task.checkpoint_cursor >= task.checkpoints.len() {
            return Err(self.report(
                op,
                ConductorError::NotFound("no next checkpoint to redo to".into()),
            ));
        }

        self.set_state(&mut active, WorkflowState::Restoring).await?;
        let target = task.checkpoints[task.checkpoint_cursor].clone();
        GitVcs::new(&self.workdir)
            .reset_to(&target.id)
            .map_err(|e| self.report(op, e.into()))?;
        task.checkpoint_cursor += 1;
        self.store.write_task(&task).await?;
        self.set_state(&mut active, WorkflowState::Idle).await?;

        info!(checkpoint = target.number, "redid to checkpoint");
        Ok(())
    }

    // -- Quality ----------------------------------------------------------

    /// Run the quality command. `auto_mode` skips the file-modification
    /// confirmation prompt.
    pub async fn quality(
        &self,
        target: Option<&str>,
        auto_mode: bool,
        cancel: &CancelToken,
    ) -> Result<QualityResult> {
        let _guard = self.op_guard()?;
        self.quality_unguarded(target, auto_mode, cancel).await
    }

    async fn quality_unguarded(
        &self,
        target: Option<&str>,
        auto_mode: bool,
        cancel: &CancelToken,
    ) -> Result<QualityResult> {
        let target = target
            .or(self.options.quality_target.as_deref())
            .unwrap_or("quality");
        let vcs = GitVcs::new(&self.workdir);
        let dirty_before = vcs.is_dirty().unwrap_or(false);

        let mut result = QualityGate::new(target).run(&self.workdir, cancel).await?;

        if result.ran && !dirty_before && vcs.is_dirty().unwrap_or(false) && !auto_mode {
            let proceed = self
                .confirm
                .confirm("the quality command modified files; continue?");
            if !proceed {
                result.user_aborted = true;
            }
        }
        Ok(result)
    }

    // -- Finish -----------------------------------------------------------

    /// Quality-gate, then squash-merge locally or push + open a pull
    /// request. On success the task is `done` and no longer active.
    pub async fn finish(&self, opts: FinishOptions, cancel: &CancelToken) -> Result<()> {
        let _guard = self.op_guard()?;
        let op = "finish";
        let (mut active, mut task) = self.load_active(op).await?;

        // Validate before doing anything irreversible.
        let mut machine = WorkflowMachine::at(active.state);
        machine
            .transition(WorkflowEvent::Finish)
            .map_err(|e| self.report(op, self.transition_error(e)))?;

        if !opts.skip_quality {
            let result = self
                .quality_unguarded(None, self.options.skip_agent_questions, cancel)
                .await?;
            if result.blocks_finish() {
                return Err(self.report(
                    op,
                    ConductorError::QualityFailed {
                        output: result.output,
                    },
                ));
            }
        }
        if cancel.is_cancelled() {
            return Err(ConductorError::Cancelled);
        }

        let branch = task.git.branch.clone();
        let target = opts
            .target_branch
            .clone()
            .or_else(|| task.git.base_branch.clone());

        if opts.pr {
            self.finish_pr(&task, &opts).await.map_err(|e| self.report(op, e))?;
        } else if let (Some(branch), Some(target)) = (branch.as_deref(), target.as_deref()) {
            // Merge from the main checkout; a worktree holds the task branch
            // and cannot check out the target.
            let merge_root = match task.git.worktree_path.as_deref() {
                Some(_) => self.store_root(),
                None => self.workdir.clone(),
            };
            let vcs = GitVcs::new(&merge_root);
            let message = format!(
                "{} {}",
                self.commit_prefix(&task),
                task.metadata.title
            );

            self.release_worktree(&mut task).await;
            let delete_branch = opts.delete_branch && task.git.worktree_path.is_none();
            vcs.squash_merge(branch, target, &message, delete_branch, opts.push)
                .map_err(|e| self.report(op, e.into()))?;
        } else {
            info!("no task branch; nothing to merge");
        }

        self.set_state(&mut active, WorkflowState::Done).await?;
        self.active_store.clear_active().await?;
        self.store.write_task(&task).await?;

        if self.config.cleanup_on_finish {
            self.store.remove_task_dir(&task.metadata.id).await?;
        }
        info!(task_id = %task.metadata.id, "task finished");
        Ok(())
    }

    async fn finish_pr(&self, task: &TaskWork, opts: &FinishOptions) -> Result<()> {
        let provider = self.providers.get(&task.source.provider)?;
        if !provider.capabilities().pr {
            return Err(ConductorError::UserInput(format!(
                "provider `{}` cannot create pull requests",
                provider.name()
            )));
        }
        let branch = task.git.branch.clone().ok_or_else(|| {
            ConductorError::UserInput("cannot open a pull request without a task branch".into())
        })?;

        GitVcs::new(&self.workdir).push(&branch)?;
        let url = provider
            .create_pr(&PullRequestSpec {
                branch,
                base: task
                    .git
                    .base_branch
                    .clone()
                    .unwrap_or_else(|| "main".into()),
                title: opts
                    .pr_title
                    .clone()
                    .unwrap_or_else(|| task.metadata.title.clone()),
                body: opts
                    .pr_body
                    .clone()
                    .unwrap_or_else(|| task.source.snapshot.clone()),
                draft: opts.pr_draft,
            })
            .await?;
        info!(url = %url, "pull request created");
        Ok(())
    }

    // -- Abandon ----------------------------------------------------------

    /// Tear the task down: branch, worktree, work directory, active
    /// pointer. Allowed from any state, `failed` included.
    pub async fn abandon(&self, opts: AbandonOptions, _cancel: &CancelToken) -> Result<()> {
        let _guard = self.op_guard()?;
        let op = "abandon";
        let (_active, mut task) = self.load_active(op).await?;

        self.release_worktree(&mut task).await;

        if let Some(branch) = task.git.branch.clone() {
            let vcs = GitVcs::new(&self.workdir);
            if vcs.current_branch().ok().as_deref() == Some(branch.as_str()) {
                if let Some(base) = task.git.base_branch.as_deref() {
                    if let Err(e) = vcs.checkout(base) {
                        warn!(error = %e, "could not leave task branch");
                    }
                }
            }
            if !opts.keep_branch && task.git.worktree_path.is_none() {
                if let Err(e) = vcs.delete_branch(&branch) {
                    warn!(branch = %branch, error = %e, "could not delete task branch");
                }
            }
        }

        if !opts.keep_work {
            self.store.remove_task_dir(&task.metadata.id).await?;
        } else {
            self.store.write_task(&task).await?;
        }
        self.active_store.clear_active().await?;
        info!(task_id = %task.metadata.id, "task abandoned");
        Ok(())
    }

    // -- Status -----------------------------------------------------------

    pub async fn status(&self) -> Result<TaskStatus> {
        let (active, task) = self.load_active("status").await?;
        Ok(self.status_of(&active, &task).await)
    }

    async fn status_of(&self, active: &ActiveTask, task: &TaskWork) -> TaskStatus {
        let pending_question = self
            .store
            .read_pending_question(&task.metadata.id)
            .await
            .ok()
            .flatten()
            .map(|q| q.question);
        TaskStatus {
            task_id: task.metadata.id.clone(),
            title: task.metadata.title.clone(),
            state: active.state,
            branch: task.git.branch.clone(),
            worktree: task.git.worktree_path.clone(),
            specifications: task.specifications.len(),
            open_specifications: task.open_specifications().len(),
            checkpoints: task.checkpoints.len(),
            checkpoint_cursor: task.checkpoint_cursor,
            pending_question,
            costs: task.costs.clone(),
        }
    }

    // -- Internals --------------------------------------------------------

    fn op_guard(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.op_gate
            .try_lock()
            .map_err(|_| ConductorError::OperationInProgress)
    }

    fn store_root(&self) -> PathBuf {
        self.store
            .dir()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.workdir.clone())
    }

    fn transition_error(&self, source: InvalidTransition) -> ConductorError {
        let suggestion = match source.state {
            WorkflowState::Waiting => Some("answer the pending question with `mh note <answer>`"),
            WorkflowState::Done | WorkflowState::Failed => {
                Some("abandon the task and start a new one")
            }
            _ => None,
        };
        match suggestion {
            Some(s) => ConductorError::invalid_transition(source, s),
            None => source.into(),
        }
    }

    fn report(&self, operation: &str, err: ConductorError) -> ConductorError {
        self.bus.publish(ConductorEvent::Error {
            operation: operation.to_string(),
            message: err.to_string(),
        });
        err
    }

    async fn load_active(&self, op: &str) -> Result<(ActiveTask, TaskWork)> {
        let active = self
            .active_store
            .read_active()
            .await?
            .ok_or_else(|| {
                self.report(
                    op,
                    ConductorError::NotFound(
                        "no active task; start one with `mh start <reference>`".into(),
                    ),
                )
            })?;
        let task = match self.store.read_task(&active.task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound(id)) => {
                return Err(self.report(
                    op,
                    ConductorError::Fatal(format!(
                        "active task `{id}` has no task record; refusing to continue"
                    )),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        Ok((active, task))
    }

    /// Publish the state change, then persist it. Events precede any I/O
    /// that observes the new state.
    async fn set_state(&self, active: &mut ActiveTask, to: WorkflowState) -> Result<()> {
        let from = active.state;
        self.bus.publish(ConductorEvent::StateChanged { from, to });
        active.state = to;
        self.active_store.write_active(active).await?;
        Ok(())
    }

    async fn park_on_question(
        &self,
        active: &mut ActiveTask,
        text: String,
        options: Vec<mh_core::types::QuestionOption>,
    ) -> Result<StepOutcome> {
        let question = PendingQuestion {
            question: text,
            options,
            asked_at: chrono::Utc::now(),
            prior_state: active.state,
        };
        self.store
            .write_pending_question(&active.task_id, &question)
            .await?;
        self.set_state(active, WorkflowState::Waiting).await?;
        info!(question = %question.question, "agent question pending");
        Ok(StepOutcome::QuestionPending(question))
    }

    fn commit_prefix(&self, task: &TaskWork) -> String {
        let key = task
            .metadata
            .external_key
            .clone()
            .unwrap_or_else(|| task.metadata.id.to_string());
        render_template(
            &self.config.git.commit_prefix,
            &key,
            task.metadata.task_type.as_deref().unwrap_or(""),
            task.metadata.slug.as_deref().unwrap_or(""),
        )
    }

    fn branch_name(&self, task: &TaskWork) -> String {
        let key = task
            .metadata
            .external_key
            .clone()
            .unwrap_or_else(|| task.metadata.id.to_string());
        render_template(
            &self.config.git.branch_pattern,
            &key,
            task.metadata.task_type.as_deref().unwrap_or("task"),
            task.metadata.slug.as_deref().unwrap_or(""),
        )
    }

    /// Record a checkpoint commit for a completed step.
    async fn checkpoint(&self, task: &mut TaskWork, label: &str) -> Result<()> {
        let message = format!("{} {}", self.commit_prefix(task), label);
        let id = GitVcs::new(&self.workdir).commit(&message)?;
        let number = task.push_checkpoint(&id, &message);
        self.store.write_task(task).await?;
        self.bus.publish(ConductorEvent::Checkpoint {
            number,
            id,
            message,
        });
        Ok(())
    }

    /// Remove the task's worktree unless this conductor is running inside
    /// it. Clears the recorded path once released.
    async fn release_worktree(&self, task: &mut TaskWork) {
        let Some(path_str) = task.git.worktree_path.clone() else {
            return;
        };
        let path = PathBuf::from(&path_str);
        let inside = path
            .canonicalize()
            .ok()
            .zip(self.workdir.canonicalize().ok())
            .map(|(wt, cwd)| cwd.starts_with(&wt))
            .unwrap_or(false);
        if inside {
            warn!(path = %path_str, "running inside the task worktree; leaving it in place");
            return;
        }
        match GitVcs::new(self.store_root()).remove_worktree(&path) {
            Ok(()) => task.git.worktree_path = None,
            Err(VcsError::WorktreeMissing(_)) => {
                warn!(path = %path_str, "worktree already gone");
                task.git.worktree_path = None;
            }
            Err(e) => warn!(path = %path_str, error = %e, "could not remove worktree"),
        }
    }

    fn resolve_step_agent(
        &self,
        step: StepKind,
        overrides: Option<&mh_core::types::WorkUnitAgent>,
    ) -> Result<TaskAgent> {
        let selection = AgentSelection {
            cli_step: self
                .options
                .step_agents
                .get(step.as_str())
                .map(String::as_str),
            cli_global: self.options.agent.as_deref(),
            work_unit: overrides,
            config: Some(&self.config),
        };
        resolve_agent(step, &selection, &self.agents).map_err(ConductorError::Agent)
    }

    /// Run one agent step: spawn, republish events, record the session, and
    /// fold usage into the cost counters.
    async fn run_step(
        &self,
        step: StepKind,
        kind: SessionKind,
        prompt: String,
        agent_workdir: &Path,
        task: &mut TaskWork,
        cancel: &CancelToken,
    ) -> Result<StepRun> {
        let resolved = self.resolve_step_agent(step, Some(&task.agent_overrides))?;
        let agent = self.agents.get(&resolved.name)?;
        agent.available().map_err(ConductorError::Agent)?;

        let mut session = SessionRecord::start(kind, resolved.name.clone());
        self.store.write_session(&task.metadata.id, &session).await?;

        let mut spec = InvocationSpec::new(step, prompt, agent_workdir);
        spec.skip_questions = self.options.skip_agent_questions;
        spec.dry_run = self.options.dry_run;

        let run = AgentRunner::spawn(agent.as_ref(), spec, cancel.clone())
            .map_err(ConductorError::Agent)?;
        let events = run.events.clone();

        let publisher = {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let mut transcript = String::new();
                let mut files = Vec::new();
                while let Ok(event) = events.recv_async().await {
                    match event {
                        AgentEvent::Text { content } => {
                            transcript.push_str(&content);
                            transcript.push('\n');
                            bus.publish(ConductorEvent::AgentMessage {
                                step,
                                text: content,
                            });
                        }
                        AgentEvent::Progress { message, percent } => {
                            bus.publish(ConductorEvent::Progress { message, percent });
                        }
                        AgentEvent::FileChanged { path, op } => {
                            if mh_agents::runner::is_workspace_internal(Path::new(&path)) {
                                continue;
                            }
                            files.push((path.clone(), op));
                            bus.publish(ConductorEvent::FileChanged { path, op });
                        }
                        AgentEvent::TokenUsage { usage, .. } => {
                            bus.publish(ConductorEvent::TokenUsage { step, usage });
                        }
                        AgentEvent::ToolCall {
                            name, description, ..
                        } => {
                            bus.publish(ConductorEvent::AgentMessage {
                                step,
                                text: format!("[tool:{name}] {description}"),
                            });
                        }
                        AgentEvent::Question { .. } | AgentEvent::Done { .. } => {}
                    }
                }
                (transcript, files)
            })
        };

        let outcome = run.wait().await.map_err(ConductorError::Agent)?;
        let (transcript, files) = publisher
            .await
            .map_err(|e| ConductorError::Fatal(format!("event fan-out failed: {e}")))?;

        session.finish(outcome.exit_status, outcome.usage);
        self.store.write_session(&task.metadata.id, &session).await?;
        task.costs
            .record(step.as_str(), outcome.usage, outcome.cost_usd);
        self.store.write_task(task).await?;

        if outcome.cancelled {
            // On-disk state goes back to the last checkpoint; the persisted
            // workflow state still names the interrupted step.
            if let Some(cp) = task.current_checkpoint() {
                if let Err(e) = GitVcs::new(&self.workdir).reset_to(&cp.id) {
                    warn!(error = %e, "could not reset to the last checkpoint");
                }
            }
            return Err(ConductorError::Cancelled);
        }
        if outcome.question.is_none() && outcome.exit_status != 0 {
            return Err(ConductorError::Agent(mh_agents::AgentError::Internal(
                format!(
                    "agent `{}` exited with status {}",
                    resolved.name, outcome.exit_status
                ),
            )));
        }

        Ok(StepRun {
            outcome,
            transcript,
            files,
        })
    }

    // -- Prompts ----------------------------------------------------------

    async fn planning_prompt(&self, task: &TaskWork) -> Result<String> {
        let notes = self.store.read_notes(&task.metadata.id).await?;
        let mut prompt = format!(
            "Plan the following task by writing numbered specification files.\n\n\
             # Task: {}\n\n{}\n",
            task.metadata.title, task.source.snapshot
        );
        if !task.specifications.is_empty() {
            prompt.push_str("\n# Existing specifications\n");
            for spec in &task.specifications {
                prompt.push_str(&format!(
                    "- specification-{} ({:?}): {}\n",
                    spec.number, spec.status, spec.title
                ));
            }
        }
        if !notes.trim().is_empty() {
            prompt.push_str("\n# Notes\n");
            prompt.push_str(&notes);
        }
        prompt.push_str(
            "\nWrite each specification as `specification-<n>.md` in the current directory, \
             continuing the numbering. Each file starts with a `# <title>` heading.\n",
        );
        Ok(prompt)
    }

    async fn implementing_prompt(&self, task: &TaskWork) -> Result<String> {
        let notes = self.store.read_notes(&task.metadata.id).await?;
        let mut prompt = format!(
            "Implement the open specifications for this task.\n\n# Task: {}\n",
            task.metadata.title
        );
        // After a quality failure every spec may already be done; the agent
        // then reworks all of them against the feedback notes.
        let open = task.open_specifications();
        let targets: Vec<&mh_core::types::Specification> = if open.is_empty() {
            task.specifications.iter().collect()
        } else {
            open
        };
        for spec in targets {
            let content = self
                .store
                .read_specification(&task.metadata.id, spec.number)
                .await
                .unwrap_or_default();
            prompt.push_str(&format!("\n## Specification {}\n{}\n", spec.number, content));
        }
        if !notes.trim().is_empty() {
            prompt.push_str("\n# Notes\n");
            prompt.push_str(&notes);
        }
        prompt.push_str(
            "\nApply the changes in the working tree. Report completed specification numbers \
             in your final done event.\n",
        );
        Ok(prompt)
    }
}

/// What one agent step produced, runner outcome plus the republished
/// transcript and announced file changes.
struct StepRun {
    outcome: RunOutcome,
    transcript: String,
    files: Vec<(String, mh_core::types::FileOp)>,
}
