use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::ident::TaskId;
use crate::types::{ActiveTask, Note, PendingQuestion, SessionRecord, Specification, SpecStatus, TaskWork};
use crate::worklock::{LockError, WorkLock};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("no task record for `{0}`")]
    TaskNotFound(String),
    #[error("no specification {number} for task `{task}`")]
    SpecNotFound { task: String, number: u32 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// WorkspaceStore
// ---------------------------------------------------------------------------

const DIR_NAME: &str = ".mehrhof";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Filesystem-backed workspace store rooted at `<repo-root>/.mehrhof/`.
///
/// Layout:
///
/// ```text
/// config.yaml               workspace config
/// .env                      secrets (0600)
/// settings.json             per-user state
/// active.json               ActiveTask pointer (absent when none)
/// work/<task-id>/
///   task.json               TaskWork record
///   notes.md                append-only notes
///   specification-<n>.md    numbered specifications
///   sessions/<id>.json      agent session records
///   pending-question.json   PendingQuestion (when present)
///   review-<n>.txt          review artifacts
/// planned/<plan-id>/        standalone planning sessions
/// plugins/                  project-scoped plugins
/// ```
///
/// Every write goes through a sibling temp file and an atomic rename, so a
/// crash never leaves a half-written record. Task records are cached in an
/// in-memory LRU keyed by task id.
pub struct WorkspaceStore {
    root: PathBuf,
    cache: Mutex<LruCache<TaskId, TaskWork>>,
}

impl WorkspaceStore {
    /// Open a store for the repository rooted at `repo_root`. Does not
    /// create anything on disk; call [`init`](Self::init) for that.
    pub fn open(repo_root: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(32).expect("32 is non-zero");
        Self {
            root: repo_root.into().join(DIR_NAME),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Create the on-disk layout: base directories, `.gitignore`, and an
    /// empty `.env` with owner-only permissions.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("work")).await?;
        tokio::fs::create_dir_all(self.root.join("planned")).await?;
        tokio::fs::create_dir_all(self.root.join("plugins")).await?;
        self.ensure_gitignore().await?;
        self.ensure_env_file().await?;
        Ok(())
    }

    // -- Paths --

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn env_path(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn active_path(&self) -> PathBuf {
        self.root.join("active.json")
    }

    pub fn work_dir(&self, id: &TaskId) -> PathBuf {
        self.root.join("work").join(id.as_str())
    }

    pub fn planned_dir(&self, plan_id: &str) -> PathBuf {
        self.root.join("planned").join(plan_id)
    }

    pub fn task_path(&self, id: &TaskId) -> PathBuf {
        self.work_dir(id).join("task.json")
    }

    pub fn notes_path(&self, id: &TaskId) -> PathBuf {
        self.work_dir(id).join("notes.md")
    }

    pub fn spec_path(&self, id: &TaskId, number: u32) -> PathBuf {
        self.work_dir(id).join(format!("specification-{number}.md"))
    }

    pub fn pending_question_path(&self, id: &TaskId) -> PathBuf {
        self.work_dir(id).join("pending-question.json")
    }

    fn workspace_lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    fn task_lock_path(&self, id: &TaskId) -> PathBuf {
        self.work_dir(id).join(".lock")
    }

    // -- Atomic write --

    /// Write `contents` to `path` via a sibling temp file and rename.
    async fn atomic_write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!(
            ".{}.tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "write".into()),
            std::process::id()
        ));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    // -- ActiveTask pointer --

    pub async fn read_active(&self) -> Result<Option<ActiveTask>> {
        let path = self.active_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_active(&self, active: &ActiveTask) -> Result<()> {
        let json = serde_json::to_string_pretty(active)?;
        self.atomic_write(&self.active_path(), json.as_bytes()).await
    }

    pub async fn clear_active(&self) -> Result<()> {
        match tokio::fs::remove_file(self.active_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -- TaskWork records --

    pub async fn write_task(&self, task: &TaskWork) -> Result<()> {
        let id = task.metadata.id.clone();
        tokio::fs::create_dir_all(self.work_dir(&id)).await?;
        let _lock = WorkLock::acquire(self.task_lock_path(&id), LOCK_TIMEOUT)?;
        let json = serde_json::to_string_pretty(task)?;
        self.atomic_write(&self.task_path(&id), json.as_bytes()).await?;

        let mut cache = self.cache.lock().await;
        cache.put(id, task.clone());
        Ok(())
    }

    pub async fn read_task(&self, id: &TaskId) -> Result<TaskWork> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(task) = cache.get(id) {
                return Ok(task.clone());
            }
        }

        let path = self.task_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::TaskNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let task: TaskWork = serde_json::from_str(&text)?;

        let mut cache = self.cache.lock().await;
        cache.put(id.clone(), task.clone());
        Ok(task)
    }

    pub async fn task_exists(&self, id: &TaskId) -> bool {
        self.task_path(id).exists()
    }

    /// List all task ids that have a record on disk.
    pub async fn list_tasks(&self) -> Result<Vec<TaskId>> {
        let work = self.root.join("work");
        let mut ids = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&work).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.path().join("task.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(TaskId::from(name));
                }
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Remove a task's entire work directory.
    pub async fn remove_task_dir(&self, id: &TaskId) -> Result<()> {
        let dir = self.work_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut cache = self.cache.lock().await;
        cache.pop(id);
        Ok(())
    }

    // -- Notes --

    /// Append a note to the task's `notes.md`. Each note is an H3 header
    /// carrying role and timestamp, followed by the message body.
    pub async fn append_note(&self, id: &TaskId, note: &Note) -> Result<()> {
        tokio::fs::create_dir_all(self.work_dir(id)).await?;
        let path = self.notes_path(id);
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let entry = format!(
            "### {} — {} ({})\n\n{}\n\n",
            note.role,
            note.recorded_at.to_rfc3339(),
            note.state,
            note.message.trim_end()
        );
        self.atomic_write(&path, format!("{existing}{entry}").as_bytes())
            .await
    }

    /// Raw markdown of the notes file (empty when none recorded).
    pub async fn read_notes(&self, id: &TaskId) -> Result<String> {
        match tokio::fs::read_to_string(self.notes_path(id)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    // -- Specifications --

    /// Create a new numbered specification for `task`, assigning the next
    /// free number under the workspace lock so the assignment is race-free
    /// against concurrent workspace readers. Updates `task` in place and
    /// persists both the content file and the task record.
    pub async fn create_specification(
        &self,
        task: &mut TaskWork,
        title: &str,
        content: &str,
    ) -> Result<Specification> {
        let id = task.metadata.id.clone();
        tokio::fs::create_dir_all(self.work_dir(&id)).await?;
        let _lock = WorkLock::acquire(self.workspace_lock_path(), LOCK_TIMEOUT)?;

        // Number past both the record and any file already on disk.
        let on_disk = self.max_spec_number_on_disk(&id).await?;
        let number = task.next_spec_number().max(on_disk + 1);

        let body = if content.trim_start().starts_with("# ") {
            content.to_string()
        } else {
            format!("# {title}\n\n{content}")
        };
        self.atomic_write(&self.spec_path(&id, number), body.as_bytes())
            .await?;

        let spec = Specification {
            number,
            title: title.to_string(),
            status: SpecStatus::Ready,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        task.specifications.push(spec.clone());
        drop(_lock);
        self.write_task(task).await?;
        Ok(spec)
    }

    pub async fn read_specification(&self, id: &TaskId, number: u32) -> Result<String> {
        match tokio::fs::read_to_string(self.spec_path(id, number)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::SpecNotFound {
                task: id.to_string(),
                number,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Specification numbers present as files, sorted ascending.
    pub async fn list_spec_numbers(&self, id: &TaskId) -> Result<Vec<u32>> {
        let mut numbers = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(self.work_dir(id)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_numbered(name, "specification-", ".md") {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    async fn max_spec_number_on_disk(&self, id: &TaskId) -> Result<u32> {
        Ok(self
            .list_spec_numbers(id)
            .await?
            .into_iter()
            .max()
            .unwrap_or(0))
    }

    // -- Sessions --

    pub async fn write_session(&self, id: &TaskId, session: &SessionRecord) -> Result<()> {
        let dir = self.work_dir(id).join("sessions");
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_string_pretty(session)?;
        self.atomic_write(&dir.join(format!("{}.json", session.id)), json.as_bytes())
            .await
    }

    pub async fn list_sessions(&self, id: &TaskId) -> Result<Vec<SessionRecord>> {
        let dir = self.work_dir(id).join("sessions");
        let mut sessions = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if let Ok(text) = tokio::fs::read_to_string(entry.path()).await {
                if let Ok(session) = serde_json::from_str::<SessionRecord>(&text) {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    // -- Pending question --

    pub async fn write_pending_question(
        &self,
        id: &TaskId,
        question: &PendingQuestion,
    ) -> Result<()> {
        tokio::fs::create_dir_all(self.work_dir(id)).await?;
        let json = serde_json::to_string_pretty(question)?;
        self.atomic_write(&self.pending_question_path(id), json.as_bytes())
            .await
    }

    pub async fn read_pending_question(&self, id: &TaskId) -> Result<Option<PendingQuestion>> {
        match tokio::fs::read_to_string(self.pending_question_path(id)).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn clear_pending_question(&self, id: &TaskId) -> Result<()> {
        match tokio::fs::remove_file(self.pending_question_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -- Review artifacts --

    /// Write a `review-<n>.txt` artifact with the next free number.
    pub async fn write_review(&self, id: &TaskId, content: &str) -> Result<(u32, PathBuf)> {
        tokio::fs::create_dir_all(self.work_dir(id)).await?;
        let _lock = WorkLock::acquire(self.task_lock_path(id), LOCK_TIMEOUT)?;

        let mut max = 0;
        let mut read_dir = tokio::fs::read_dir(self.work_dir(id)).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_numbered(name, "review-", ".txt") {
                    max = max.max(n);
                }
            }
        }
        let number = max + 1;
        let path = self.work_dir(id).join(format!("review-{number}.txt"));
        self.atomic_write(&path, content.as_bytes()).await?;
        Ok((number, path))
    }

    // -- Standalone plans --

    /// Create a standalone planning directory and persist its prompt.
    pub async fn create_plan(&self, plan_id: &str, prompt: &str) -> Result<PathBuf> {
        let dir = self.planned_dir(plan_id);
        tokio::fs::create_dir_all(&dir).await?;
        self.atomic_write(&dir.join("prompt.md"), prompt.as_bytes())
            .await?;
        Ok(dir)
    }

    // -- Housekeeping --

    /// Keep everything under `.mehrhof/` out of version control except
    /// `config.yaml`.
    pub async fn ensure_gitignore(&self) -> Result<()> {
        let path = self.root.join(".gitignore");
        let wanted = "*\n!.gitignore\n!config.yaml\n";
        let current = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        if current != wanted {
            self.atomic_write(&path, wanted.as_bytes()).await?;
        }
        Ok(())
    }

    async fn ensure_env_file(&self) -> Result<()> {
        let path = self.env_path();
        if !path.exists() {
            tokio::fs::write(&path, b"").await?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(())
    }
}

/// Parse `<prefix><n><suffix>` file names; returns the number.
fn parse_numbered(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
