use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tracing::debug;

use mh_core::types::FileOp;

// ---------------------------------------------------------------------------
// WorkTreeWatcher
// ---------------------------------------------------------------------------

/// Observes working-tree changes while an implementing agent runs.
///
/// Agents normally announce their edits through `file_changed` events; the
/// watcher catches direct edits those events miss. Paths under `.mehrhof/`
/// and `.git/` never count as agent work and are filtered out. Events are
/// reported as paths relative to the watched root, de-duplicated per drain.
pub struct WorkTreeWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
}

impl WorkTreeWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: impl Into<PathBuf>) -> Result<Self, notify::Error> {
        let root = root.into();
        let (tx, rx): (
            Sender<notify::Result<notify::Event>>,
            Receiver<notify::Result<notify::Event>>,
        ) = crossbeam_channel::unbounded();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self { root, watcher, rx })
    }

    /// Stop watching and drop the backend.
    pub fn stop(mut self) {
        let _ = self.watcher.unwatch(&self.root);
    }

    /// Drain all pending change events, newest state wins per path.
    pub fn drain(&self) -> Vec<(String, FileOp)> {
        let mut seen: HashSet<(String, FileOp)> = HashSet::new();
        let mut out = Vec::new();

        while let Ok(result) = self.rx.try_recv() {
            let Ok(event) = result else { continue };
            let Some(op) = map_event_kind(&event.kind) else {
                continue;
            };
            for path in &event.paths {
                let Some(rel) = self.relative(path) else {
                    continue;
                };
                if is_internal(&rel) {
                    continue;
                }
                let rel = rel.to_string_lossy().to_string();
                if seen.insert((rel.clone(), op)) {
                    debug!(path = %rel, op = %op, "working-tree change observed");
                    out.push((rel, op));
                }
            }
        }
        out
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| {
                // Some backends report canonicalized paths.
                let canon_root = self.root.canonicalize().ok()?;
                path.strip_prefix(&canon_root).ok().map(Path::to_path_buf)
            })
    }
}

/// Paths inside the workspace state dir or the git dir are not agent edits.
fn is_internal(rel: &Path) -> bool {
    rel.components()
        .next()
        .map(|c| c.as_os_str() == ".mehrhof" || c.as_os_str() == ".git")
        .unwrap_or(false)
}

fn map_event_kind(kind: &EventKind) -> Option<FileOp> {
    match kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => Some(FileOp::Create),
        EventKind::Create(_) => Some(FileOp::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileOp::Modify),
        EventKind::Modify(_) => Some(FileOp::Modify),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => Some(FileOp::Delete),
        EventKind::Remove(_) => Some(FileOp::Delete),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn detects_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = WorkTreeWatcher::start(dir.path()).expect("start watcher");

        fs::write(dir.path().join("greeting.txt"), "hello").unwrap();
        thread::sleep(Duration::from_millis(500));

        let changes = watcher.drain();
        assert!(
            changes
                .iter()
                .any(|(p, _)| p.contains("greeting.txt")),
            "expected a change for greeting.txt, got: {changes:?}"
        );
    }

    #[test]
    fn filters_workspace_internal_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".mehrhof/work")).unwrap();
        let watcher = WorkTreeWatcher::start(dir.path()).expect("start watcher");

        fs::write(dir.path().join(".mehrhof/work/task.json"), "{}").unwrap();
        fs::write(dir.path().join("visible.txt"), "x").unwrap();
        thread::sleep(Duration::from_millis(500));

        let changes = watcher.drain();
        assert!(
            !changes.iter().any(|(p, _)| p.contains(".mehrhof")),
            "workspace-internal paths must be filtered: {changes:?}"
        );
        assert!(changes.iter().any(|(p, _)| p.contains("visible.txt")));
    }

    #[test]
    fn detects_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let doomed = dir.path().join("doomed.txt");
        fs::write(&doomed, "bye").unwrap();

        let watcher = WorkTreeWatcher::start(dir.path()).expect("start watcher");
        thread::sleep(Duration::from_millis(200));
        let _ = watcher.drain();

        fs::remove_file(&doomed).unwrap();
        thread::sleep(Duration::from_millis(500));

        let changes = watcher.drain();
        assert!(
            changes
                .iter()
                .any(|(p, op)| p.contains("doomed.txt") && *op == FileOp::Delete),
            "expected a delete for doomed.txt, got: {changes:?}"
        );
    }

    #[test]
    fn internal_path_detection() {
        assert!(is_internal(Path::new(".mehrhof/active.json")));
        assert!(is_internal(Path::new(".git/HEAD")));
        assert!(!is_internal(Path::new("src/.mehrhof-lookalike")));
        assert!(!is_internal(Path::new("greeting.txt")));
    }
}
