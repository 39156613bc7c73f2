use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tracing::{debug, info, warn};

use mh_bridge::CancelToken;
use mh_core::types::{FileOp, QuestionOption, StepKind, TokenUsage};

use crate::agent::Agent;
use crate::dedup::DedupFilter;
use crate::events::{parse_line, AgentEvent};
use crate::AgentError;

// ---------------------------------------------------------------------------
// Invocation / outcome types
// ---------------------------------------------------------------------------

/// Everything a single agent invocation needs.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub step: StepKind,
    pub prompt: String,
    pub workdir: PathBuf,
    /// Auto-answer `question` events with the recommended default so
    /// unattended runs never block.
    pub skip_questions: bool,
    /// Refuse tool-call writes; nothing reaches the working tree.
    pub dry_run: bool,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub grace: Duration,
}

impl InvocationSpec {
    pub fn new(step: StepKind, prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            step,
            prompt: prompt.into(),
            workdir: workdir.into(),
            skip_questions: false,
            dry_run: false,
            grace: Duration::from_secs(5),
        }
    }
}

/// A question the agent raised that interrupted the step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentQuestion {
    pub text: String,
    pub options: Vec<QuestionOption>,
}

/// What an invocation produced once the child exited.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_status: i32,
    /// Accumulated token-usage deltas for the whole invocation.
    pub usage: TokenUsage,
    /// Accumulated USD cost reported alongside the usage deltas.
    pub cost_usd: f64,
    /// Specification numbers the agent reported as completed.
    pub completed_specs: Vec<u32>,
    /// Set when the agent asked a question and the run was interrupted.
    pub question: Option<AgentQuestion>,
    /// Set when the caller's cancellation handle fired.
    pub cancelled: bool,
}

/// A running invocation: a finite stream of events plus the final outcome.
pub struct AgentRun {
    pub events: flume::Receiver<AgentEvent>,
    handle: tokio::task::JoinHandle<Result<RunOutcome, AgentError>>,
}

impl AgentRun {
    /// Wait for the child to be reaped and the outcome assembled. Events
    /// already buffered stay readable from `events` afterwards.
    pub async fn wait(self) -> Result<RunOutcome, AgentError> {
        self.handle
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

/// Spawns an agent child process for a step and streams structured events
/// until the process exits.
///
/// The runner de-duplicates consecutive identical output lines, applies
/// tool-call writes (unless dry-run), auto-answers questions when asked to,
/// accumulates token usage, and honors cancellation with a graceful
/// terminate-then-kill sequence. The event stream is finite: it closes
/// after EOF and reap.
pub struct AgentRunner;

impl AgentRunner {
    /// Spawn `agent` for the invocation. Returns immediately; events stream
    /// on `AgentRun::events` while the child runs.
    pub fn spawn(
        agent: &dyn Agent,
        spec: InvocationSpec,
        cancel: CancelToken,
    ) -> Result<AgentRun, AgentError> {
        let cmd = agent.command(spec.step);
        info!(
            agent = %agent.name(),
            step = %spec.step,
            program = %cmd.program,
            "spawning agent process"
        );

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.env)
            .current_dir(&spec.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // The agent gets its own process group so termination signals reach
        // helpers it spawns (they share our stdout pipe otherwise).
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", cmd.program)))?;

        let stdin = child.stdin.take();
        let (tx, rx) = flume::unbounded();
        let handle = tokio::spawn(drive(child, stdin, spec, cancel, tx));

        Ok(AgentRun { events: rx, handle })
    }
}

/// The reader task: feeds the prompt, streams stdout into events, and reaps
/// the child.
async fn drive(
    mut child: Child,
    stdin: Option<ChildStdin>,
    spec: InvocationSpec,
    cancel: CancelToken,
    tx: flume::Sender<AgentEvent>,
) -> Result<RunOutcome, AgentError> {
    let mut stdin = stdin;
    if let Some(pipe) = stdin.as_mut() {
        // A failed prompt write means the child exited early; the exit
        // status below reports that.
        let _ = pipe.write_all(spec.prompt.as_bytes()).await;
        let _ = pipe.write_all(b"\n").await;
        let _ = pipe.flush().await;
    }
    // Close stdin unless we may need it for auto-answers, so agents that
    // read the prompt until EOF can start.
    if !spec.skip_questions {
        stdin = None;
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::Internal("child stdout not captured".into()))?;

    let mut filter = DedupFilter::new();
    let mut outcome = RunOutcome::default();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        for line in filter.push(&chunk) {
                            handle_line(&line, &spec, &mut outcome, &mut stdin, &tx).await;
                        }
                        if outcome.question.is_some() {
                            // Step interrupted; ask the child to stop and
                            // drain whatever it still prints.
                            terminate(&child);
                            drain_after_signal(&mut stdout, &mut filter, &spec, &mut outcome, &mut stdin, &mut child, &tx).await;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "agent stdout read failed");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                terminate(&child);
                drain_after_signal(&mut stdout, &mut filter, &spec, &mut outcome, &mut stdin, &mut child, &tx).await;
                break;
            }
        }
    }

    if let Some(line) = filter.finish() {
        forward(&tx, AgentEvent::Text { content: line });
    }

    let status = child
        .wait()
        .await
        .map_err(|e| AgentError::Internal(format!("wait failed: {e}")))?;
    outcome.exit_status = exit_code(status);
    debug!(exit = outcome.exit_status, "agent process reaped");
    Ok(outcome)
}

/// After a termination signal: keep reading until EOF or the grace period
/// runs out, then kill. Buffered events are still delivered.
async fn drain_after_signal(
    stdout: &mut tokio::process::ChildStdout,
    filter: &mut DedupFilter,
    spec: &InvocationSpec,
    outcome: &mut RunOutcome,
    stdin: &mut Option<ChildStdin>,
    child: &mut Child,
    tx: &flume::Sender<AgentEvent>,
) {
    let deadline = tokio::time::Instant::now() + spec.grace;
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return,
            Ok(Ok(n)) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                for line in filter.push(&chunk) {
                    handle_line(&line, spec, outcome, stdin, tx).await;
                }
            }
            Err(_) => {
                warn!("grace period expired, killing agent process group");
                signal_group(child, libc::SIGKILL);
                let _ = child.start_kill();
                return;
            }
        }
    }
}

/// Interpret one de-duplicated line.
async fn handle_line(
    line: &str,
    spec: &InvocationSpec,
    outcome: &mut RunOutcome,
    stdin: &mut Option<ChildStdin>,
    tx: &flume::Sender<AgentEvent>,
) {
    match parse_line(line) {
        AgentEvent::TokenUsage { usage, cost_usd } => {
            outcome.usage.add(usage);
            outcome.cost_usd += cost_usd;
            forward(tx, AgentEvent::TokenUsage { usage, cost_usd });
        }
        AgentEvent::Done {
            status,
            completed_specs,
        } => {
            outcome.completed_specs = completed_specs.clone();
            forward(
                tx,
                AgentEvent::Done {
                    status,
                    completed_specs,
                },
            );
        }
        AgentEvent::Question { text, options } => {
            if spec.skip_questions {
                let question = AgentQuestion {
                    text,
                    options,
                };
                let answer = question
                    .options
                    .iter()
                    .find(|o| o.recommended)
                    .or_else(|| question.options.first())
                    .map(|o| o.label.clone())
                    .unwrap_or_default();
                info!(answer = %answer, "auto-answering agent question");
                if let Some(pipe) = stdin.as_mut() {
                    let _ = pipe.write_all(answer.as_bytes()).await;
                    let _ = pipe.write_all(b"\n").await;
                    let _ = pipe.flush().await;
                }
            } else {
                outcome.question = Some(AgentQuestion {
                    text: text.clone(),
                    options: options.clone(),
                });
                forward(tx, AgentEvent::Question { text, options });
            }
        }
        AgentEvent::ToolCall {
            name,
            description,
            args,
        } => {
            apply_tool_call(&name, &args, spec, tx).await;
            forward(
                tx,
                AgentEvent::ToolCall {
                    name,
                    description,
                    args,
                },
            );
        }
        event => forward(tx, event),
    }
}

/// Apply a file-writing tool call to the working tree, refusing it under
/// dry-run. Successful writes are reported as `file_changed` events.
async fn apply_tool_call(
    name: &str,
    args: &serde_json::Value,
    spec: &InvocationSpec,
    tx: &flume::Sender<AgentEvent>,
) {
    let (op, path) = match name {
        "write_file" => (FileOp::Create, args.get("path")),
        "delete_file" => (FileOp::Delete, args.get("path")),
        _ => return,
    };
    let Some(rel) = path.and_then(|p| p.as_str()) else {
        warn!(tool = name, "tool call without a path argument");
        return;
    };
    if spec.dry_run {
        info!(tool = name, path = rel, "dry-run: refusing file write");
        return;
    }

    let target = spec.workdir.join(rel);
    let result = match op {
        FileOp::Delete => tokio::fs::remove_file(&target).await,
        _ => {
            let content = args.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let existed = target.exists();
            let write = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await
            }
            .await;
            if write.is_ok() {
                let op = if existed { FileOp::Modify } else { FileOp::Create };
                forward(
                    tx,
                    AgentEvent::FileChanged {
                        path: rel.to_string(),
                        op,
                    },
                );
            }
            write
        }
    };
    match result {
        Ok(()) => {
            if op == FileOp::Delete {
                forward(
                    tx,
                    AgentEvent::FileChanged {
                        path: rel.to_string(),
                        op: FileOp::Delete,
                    },
                );
            }
        }
        Err(e) => warn!(tool = name, path = rel, error = %e, "tool call failed"),
    }
}

fn forward(tx: &flume::Sender<AgentEvent>, event: AgentEvent) {
    let _ = tx.send(event);
}

/// Send SIGTERM to the child's process group, if it is still running.
fn terminate(child: &Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        // SAFETY: pid is a child group we created via process_group(0).
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Check a path is not inside the workspace's own state directory; those
/// changes never count as agent file edits.
pub fn is_workspace_internal(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == ".mehrhof" || c.as_os_str() == ".git")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
