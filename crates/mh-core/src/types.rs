use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident::TaskId;

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The closed set of workflow states a task can be in.
///
/// `idle` is the central hub: every agent-driven step starts there and
/// returns there. The snake_case names below are the wire strings written
/// to `active.json` and any JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Planning,
    Implementing,
    Reviewing,
    Waiting,
    Dialogue,
    Checkpointing,
    Reverting,
    Restoring,
    Done,
    Failed,
}

impl WorkflowState {
    /// Terminal states admit no further workflow events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }

    /// The wire string for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Planning => "planning",
            WorkflowState::Implementing => "implementing",
            WorkflowState::Reviewing => "reviewing",
            WorkflowState::Waiting => "waiting",
            WorkflowState::Dialogue => "dialogue",
            WorkflowState::Checkpointing => "checkpointing",
            WorkflowState::Reverting => "reverting",
            WorkflowState::Restoring => "restoring",
            WorkflowState::Done => "done",
            WorkflowState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// `urgent` is accepted as an input alias.
    #[serde(alias = "urgent")]
    Critical,
}

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// The named steps that may invoke an agent. Used for per-step agent
/// overrides and per-step cost attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Planning,
    Implementing,
    Reviewing,
    Dialogue,
    Checkpointing,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Planning => "planning",
            StepKind::Implementing => "implementing",
            StepKind::Reviewing => "reviewing",
            StepKind::Dialogue => "dialogue",
            StepKind::Checkpointing => "checkpointing",
        }
    }

    pub fn all() -> &'static [StepKind] {
        &[
            StepKind::Planning,
            StepKind::Implementing,
            StepKind::Reviewing,
            StepKind::Dialogue,
            StepKind::Checkpointing,
        ]
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FileOp
// ---------------------------------------------------------------------------

/// The kind of change an agent performed on a working-tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FileOp::Create => "create",
            FileOp::Modify => "modify",
            FileOp::Delete => "delete",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// WorkUnit — what a provider hands us
// ---------------------------------------------------------------------------

/// Per-task agent configuration carried by a work unit (e.g. from task-file
/// frontmatter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitAgent {
    /// Default agent name for every step.
    #[serde(default)]
    pub name: Option<String>,
    /// Extra environment passed to the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra arguments appended to the agent command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-step overrides keyed by step name.
    #[serde(default)]
    pub steps: BTreeMap<String, WorkUnitStepAgent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitStepAgent {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A unit of work fetched from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Identifier in the source system (file path, issue number, ...).
    pub source_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// External key such as `FEAT-123`.
    #[serde(default)]
    pub external_key: Option<String>,
    /// Task type such as `feature` or `fix`.
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub agent: WorkUnitAgent,
}

// ---------------------------------------------------------------------------
// TaskWork — the authoritative task record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub external_key: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the source the task was registered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSource {
    pub provider: String,
    /// The original reference string (`file:task.md`, ...).
    pub reference: String,
    /// Captured source content at registration time.
    pub snapshot: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGit {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Where a resolved agent name came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentChoiceSource {
    CliStep,
    CliGlobal,
    FrontmatterStep,
    FrontmatterDefault,
    ConfigStep,
    ConfigDefault,
    AutoDetected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAgent {
    pub name: String,
    pub source: AgentChoiceSource,
}

/// Token usage deltas reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cached_tokens == 0
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
}

/// Cumulative cost counters. Totals only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCosts {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub steps: BTreeMap<String, StepCost>,
}

impl TaskCosts {
    /// Record a usage delta against a step. Counters are monotonic: deltas
    /// are only ever added, never assigned.
    pub fn record(&mut self, step: &str, usage: TokenUsage, cost_usd: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cached_tokens += usage.cached_tokens;
        self.total_cost_usd += cost_usd;

        let entry = self.steps.entry(step.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cached_tokens += usage.cached_tokens;
        entry.cost_usd += cost_usd;
    }
}

/// A VCS commit on the task branch marking a coherent end-of-step state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Monotonic per-task number, starting at 1.
    pub number: u32,
    /// Commit id.
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Specification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Draft,
    Ready,
    Implementing,
    Done,
}

/// Metadata of a numbered specification artifact. The content body lives on
/// disk as `specification-<n>.md`; its first `# ` heading is the title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub number: u32,
    pub title: String,
    pub status: SpecStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TaskWork
// ---------------------------------------------------------------------------

/// The authoritative on-disk task record (`work/<task-id>/task.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWork {
    pub metadata: TaskMetadata,
    pub source: TaskSource,
    #[serde(default)]
    pub git: TaskGit,
    pub agent: TaskAgent,
    /// Agent configuration carried over from the task source frontmatter,
    /// consulted again at every step for per-step overrides.
    #[serde(default)]
    pub agent_overrides: WorkUnitAgent,
    #[serde(default)]
    pub costs: TaskCosts,
    #[serde(default)]
    pub specifications: Vec<Specification>,
    /// Checkpoint chain, oldest first.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRecord>,
    /// Index one past the checkpoint the working tree currently sits at.
    /// Undo moves it back, redo forward; a new checkpoint truncates the
    /// forward history.
    #[serde(default)]
    pub checkpoint_cursor: usize,
}

impl TaskWork {
    pub fn new(
        id: TaskId,
        title: impl Into<String>,
        source: TaskSource,
        agent: TaskAgent,
    ) -> Self {
        Self {
            metadata: TaskMetadata {
                id,
                title: title.into(),
                external_key: None,
                task_type: None,
                slug: None,
                created_at: Utc::now(),
            },
            source,
            git: TaskGit::default(),
            agent,
            agent_overrides: WorkUnitAgent::default(),
            costs: TaskCosts::default(),
            specifications: Vec::new(),
            checkpoints: Vec::new(),
            checkpoint_cursor: 0,
        }
    }

    /// The checkpoint the working tree currently sits at, if any.
    pub fn current_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.checkpoint_cursor
            .checked_sub(1)
            .and_then(|i| self.checkpoints.get(i))
    }

    /// Append a checkpoint, discarding any forward history past the cursor.
    pub fn push_checkpoint(&mut self, id: impl Into<String>, message: impl Into<String>) -> u32 {
        self.checkpoints.truncate(self.checkpoint_cursor);
        let number = self.checkpoints.last().map(|c| c.number).unwrap_or(0) + 1;
        self.checkpoints.push(CheckpointRecord {
            number,
            id: id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
        self.checkpoint_cursor = self.checkpoints.len();
        number
    }

    /// Next free specification number. Numbering is gap-tolerant: deleting
    /// `specification-2` never causes `2` to be reused.
    pub fn next_spec_number(&self) -> u32 {
        self.specifications
            .iter()
            .map(|s| s.number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Specifications still awaiting implementation.
    pub fn open_specifications(&self) -> Vec<&Specification> {
        self.specifications
            .iter()
            .filter(|s| s.status != SpecStatus::Done)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ActiveTask
// ---------------------------------------------------------------------------

/// The pointer record for the (at most one) active task of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub state: WorkflowState,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    pub working_dir: String,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteRole {
    User,
    Answer,
    QualityFeedback,
}

impl NoteRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteRole::User => "user",
            NoteRole::Answer => "answer",
            NoteRole::QualityFeedback => "quality-feedback",
        }
    }
}

impl std::fmt::Display for NoteRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A free-form textual addition to a task, tagged with the workflow state it
/// was recorded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub role: NoteRole,
    pub state: WorkflowState,
    pub recorded_at: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Planning,
    Implementing,
    Reviewing,
    Dialogue,
}

/// One agent invocation record (`work/<task-id>/sessions/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: uuid::Uuid,
    pub kind: SessionKind,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl SessionRecord {
    pub fn start(kind: SessionKind, agent: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            agent: agent.into(),
            started_at: Utc::now(),
            ended_at: None,
            exit_status: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn finish(&mut self, exit_status: i32, usage: TokenUsage) {
        self.ended_at = Some(Utc::now());
        self.exit_status = Some(exit_status);
        self.usage = usage;
    }
}

// ---------------------------------------------------------------------------
// PendingQuestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    /// The option the agent recommends as default (used by auto runs).
    #[serde(default)]
    pub recommended: bool,
}

/// A question raised by an agent mid-step. Its presence means the workflow
/// is `waiting`; answering it resumes `prior_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    pub asked_at: DateTime<Utc>,
    /// The state the workflow was in when the question was raised.
    pub prior_state: WorkflowState,
}

impl PendingQuestion {
    /// The answer an unattended run should pick: the recommended option,
    /// else the first option, else nothing.
    pub fn default_answer(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.recommended)
            .or_else(|| self.options.first())
            .map(|o| o.label.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
