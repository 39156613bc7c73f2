//! The conductor: a long-lived state machine owning one task's lifecycle.
//!
//! Composes the workspace store, the VCS adapter, the event bus, and the
//! provider/agent registries into the public workflow operations — start,
//! plan, implement, review, note, undo/redo, quality, finish, abandon — and
//! the unattended auto loop on top of them.

pub mod auto;
pub mod conductor;
pub mod error;
pub mod quality;
pub mod review;
pub mod state;

pub use auto::{run_auto, AutoOptions, AutoResult};
pub use conductor::{
    AbandonOptions, Conductor, ConductorOptions, FinishOptions, NoteOutcome, ReviewOutcome,
    StartOptions, StepOutcome, TaskStatus,
};
pub use error::{ConductorError, Result};
pub use quality::{QualityGate, QualityResult};
pub use review::{classify_review_output, ReviewTool, ReviewVerdict};
pub use state::{InvalidTransition, WorkflowEvent, WorkflowMachine};
