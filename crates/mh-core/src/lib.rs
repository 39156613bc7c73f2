//! Core data model and workspace store for mehrhof.
//!
//! Everything a workflow run persists lives under `<repo-root>/.mehrhof/`:
//! the active-task pointer, per-task work directories with specifications,
//! notes, sessions and pending questions, workspace configuration and
//! per-user settings. This crate owns those records and the disciplined
//! (atomic, locked) way they reach disk.

pub mod config;
pub mod frontmatter;
pub mod ident;
pub mod store;
pub mod types;
pub mod worklock;

pub use config::{UserSettings, WorkspaceConfig};
pub use ident::TaskId;
pub use store::{StoreError, WorkspaceStore};
