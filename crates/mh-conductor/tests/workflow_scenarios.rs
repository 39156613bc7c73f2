//! End-to-end workflow scenarios against a real git repository and scripted
//! shell agents speaking the JSON-lines protocol. Skipped gracefully on
//! machines without a `git` binary.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use mh_agents::{AgentRegistry, CommandAgent};
use mh_bridge::CancelToken;
use mh_conductor::{
    run_auto, AutoOptions, Conductor, ConductorError, ConductorOptions, FinishOptions,
    StartOptions, StepOutcome,
};
use mh_core::types::{NoteRole, WorkflowState};
use mh_providers::ProviderRegistry;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.name", "test"]);
    run(&["config", "user.email", "test@example.com"]);
    std::fs::write(dir.join("README.md"), "# repo\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-m", "initial"]);
}

fn write_task_file(dir: &Path) {
    std::fs::write(
        dir.join("task.md"),
        "---\nkey: FEAT-1\ntype: feature\n---\n# Add greeting\n\nCreate greeting.txt containing hello.\n",
    )
    .unwrap();
}

const PLAN_SCRIPT: &str = r##"
printf '%s\n' '{"type":"tool_call","payload":{"name":"write_file","description":"write spec","args":{"path":"specification-1.md","content":"# Greeting spec\n\nCreate greeting.txt with hello.\n"}}}'
echo '{"type":"done","payload":{"status":0}}'
"##;

const IMPLEMENT_SCRIPT: &str = r#"
printf '%s\n' '{"type":"tool_call","payload":{"name":"write_file","description":"write greeting","args":{"path":"greeting.txt","content":"hello\n"}}}'
echo '{"type":"token_usage","payload":{"usage":{"input_tokens":50,"output_tokens":10,"cached_tokens":0},"cost_usd":0.01}}'
echo '{"type":"done","payload":{"status":0,"completed_specs":[1]}}'
"#;

const QUESTION_SCRIPT: &str = r#"
echo '{"type":"question","payload":{"text":"Use SQL or NoSQL?","options":[{"label":"SQL","recommended":true},{"label":"NoSQL"}]}}'
sleep 10
"#;

fn scripted_registry(plan: &str, implement: &str) -> AgentRegistry {
    let mut reg = AgentRegistry::new();
    let plan = plan.to_string();
    let implement = implement.to_string();
    reg.register("planner", move || {
        Arc::new(CommandAgent::new("planner", "sh").with_args(vec!["-c".into(), plan.clone()]))
    })
    .unwrap();
    reg.register("implementer", move || {
        Arc::new(
            CommandAgent::new("implementer", "sh").with_args(vec!["-c".into(), implement.clone()]),
        )
    })
    .unwrap();
    reg
}

fn scripted_options(skip_questions: bool) -> ConductorOptions {
    let mut step_agents = BTreeMap::new();
    step_agents.insert("planning".to_string(), "planner".to_string());
    step_agents.insert("implementing".to_string(), "implementer".to_string());
    ConductorOptions {
        step_agents,
        skip_agent_questions: skip_questions,
        ..Default::default()
    }
}

async fn open_conductor(dir: &Path, plan: &str, implement: &str, auto: bool) -> Conductor {
    Conductor::with_registries(
        dir,
        scripted_options(auto),
        scripted_registry(plan, implement),
        ProviderRegistry::with_builtins(),
    )
    .await
    .expect("open conductor")
}

// ---------------------------------------------------------------------------
// S1: file task, plan, implement, finish-merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_file_task_plan_implement_finish() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());

    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cancel = CancelToken::new();

    let status = conductor
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(status.task_id.as_str().starts_with("t_"));
    assert_eq!(status.task_id.as_str().len(), 10);
    assert_eq!(
        status.branch.as_deref(),
        Some("feature/FEAT-1--add-greeting")
    );
    assert_eq!(status.state, WorkflowState::Idle);
    assert_eq!(status.checkpoints, 1);

    // A second start must be rejected.
    let err = conductor
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::TaskAlreadyActive(_)));

    // Plan produces specification-1.md in the work directory.
    let outcome = conductor.plan(&cancel).await.unwrap();
    assert!(matches!(outcome, StepOutcome::Completed));
    let work_dir = dir
        .path()
        .join(".mehrhof/work")
        .join(status.task_id.as_str());
    let spec = std::fs::read_to_string(work_dir.join("specification-1.md")).unwrap();
    assert!(spec.starts_with("# Greeting spec"));

    // Implement creates greeting.txt in the working tree.
    conductor.implement(&cancel).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap(),
        "hello\n"
    );

    let status = conductor.status().await.unwrap();
    assert_eq!(status.state, WorkflowState::Idle);
    assert_eq!(status.open_specifications, 0);
    assert_eq!(status.checkpoints, 3); // register, plan, implement
    assert_eq!(status.costs.total_input_tokens, 50);

    // Finish squash-merges into main and deletes the task branch.
    conductor
        .finish(
            FinishOptions {
                delete_branch: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();

    let vcs = mh_vcs::GitVcs::new(dir.path());
    assert_eq!(vcs.current_branch().unwrap(), "main");
    assert!(dir.path().join("greeting.txt").exists());
    assert!(!mh_vcs::RepoReader::branch_exists(dir.path(), "feature/FEAT-1--add-greeting").unwrap());
    assert!(!dir.path().join(".mehrhof/active.json").exists());

    // Finishing again: there is no active task anymore.
    let err = conductor
        .finish(FinishOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// S2: worktree isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_worktrees_isolate_tasks() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    std::fs::write(dir.path().join("a.md"), "---\nkey: A-1\n---\n# Task A\n").unwrap();
    std::fs::write(dir.path().join("b.md"), "---\nkey: B-1\n---\n# Task B\n").unwrap();

    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cancel = CancelToken::new();
    let worktree_opts = StartOptions {
        create_branch: true,
        use_worktree: true,
    };

    let a = conductor
        .start("file:a.md", worktree_opts.clone(), &cancel)
        .await
        .unwrap();
    // The main checkout has no active task, so a second worktree start works.
    let b = conductor
        .start("file:b.md", worktree_opts, &cancel)
        .await
        .unwrap();

    let wt_a = a.worktree.clone().expect("worktree for a");
    let wt_b = b.worktree.clone().expect("worktree for b");
    assert_ne!(wt_a, wt_b);
    assert!(Path::new(&wt_a).join(".mehrhof/active.json").exists());
    assert!(Path::new(&wt_b).join(".mehrhof/active.json").exists());
    assert!(!dir.path().join(".mehrhof/active.json").exists());

    // Each worktree's conductor sees its own task.
    let ca = open_conductor(Path::new(&wt_a), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cb = open_conductor(Path::new(&wt_b), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let sa = ca.status().await.unwrap();
    let sb = cb.status().await.unwrap();
    assert_eq!(sa.task_id, a.task_id);
    assert_eq!(sb.task_id, b.task_id);
    assert!(sa.pending_question.is_none());
    assert!(sb.pending_question.is_none());
}

// ---------------------------------------------------------------------------
// S3: pending question
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_question_parks_then_answer_resumes() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());

    let asking = open_conductor(dir.path(), QUESTION_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cancel = CancelToken::new();
    let started = asking
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap();

    let outcome = asking.plan(&cancel).await.unwrap();
    let question = match outcome {
        StepOutcome::QuestionPending(q) => q,
        other => panic!("expected a pending question, got {other:?}"),
    };
    assert_eq!(question.question, "Use SQL or NoSQL?");
    assert_eq!(question.prior_state, WorkflowState::Planning);

    let work_dir = dir
        .path()
        .join(".mehrhof/work")
        .join(started.task_id.as_str());
    assert!(work_dir.join("pending-question.json").exists());
    assert_eq!(asking.status().await.unwrap().state, WorkflowState::Waiting);

    // While waiting, plan is an invalid transition.
    let err = asking.plan(&cancel).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);

    // The answer clears the question and returns to planning.
    let note = asking.note("SQL", NoteRole::User).await.unwrap();
    assert!(note.answered);
    assert_eq!(note.resume, Some(WorkflowState::Planning));
    assert!(!work_dir.join("pending-question.json").exists());
    assert_eq!(asking.status().await.unwrap().state, WorkflowState::Planning);

    let notes = std::fs::read_to_string(work_dir.join("notes.md")).unwrap();
    assert!(notes.contains("### answer"));
    assert!(notes.contains("SQL"));

    // Resuming the plan (now with a cooperative agent) completes to idle.
    let resumed = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let outcome = resumed.plan(&cancel).await.unwrap();
    assert!(matches!(outcome, StepOutcome::Completed));
    assert_eq!(resumed.status().await.unwrap().state, WorkflowState::Idle);
}

// ---------------------------------------------------------------------------
// S4: auto with quality retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_auto_cycle_with_quality_retry() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());
    // The quality target fails once, then passes.
    std::fs::write(
        dir.path().join("Makefile"),
        "quality:\n\t@if [ -f .q_ok ]; then echo quality ok; \
         else touch .q_ok; echo 'ERROR: tests failed'; exit 1; fi\n",
    )
    .unwrap();
    Command::new("git")
        .args(["add", "-A"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    Command::new("git")
        .args(["commit", "-m", "add makefile"])
        .current_dir(dir.path())
        .output()
        .unwrap();

    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, true).await;
    let cancel = CancelToken::new();

    let result = run_auto(
        &conductor,
        "file:task.md",
        AutoOptions::default(),
        &cancel,
    )
    .await
    .unwrap();

    assert!(result.started && result.planned && result.implemented);
    assert_eq!(result.quality_attempts, 2);
    assert!(result.quality_passed);
    assert!(result.finished);
    assert!(result.failed_phase.is_none());

    // One quality-feedback note was recorded.
    let work_root = dir.path().join(".mehrhof/work");
    let task_dir = std::fs::read_dir(&work_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.join("notes.md").exists())
        .expect("task work dir with notes");
    let notes = std::fs::read_to_string(task_dir.join("notes.md")).unwrap();
    assert_eq!(notes.matches("### quality-feedback").count(), 1);
    assert!(notes.contains("tests failed"));

    // Merged to main.
    let vcs = mh_vcs::GitVcs::new(dir.path());
    assert_eq!(vcs.current_branch().unwrap(), "main");
    assert!(dir.path().join("greeting.txt").exists());
}

// ---------------------------------------------------------------------------
// S5: undo and redo around implement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_undo_then_redo_restores_tree() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());

    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cancel = CancelToken::new();
    conductor
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap();
    conductor.plan(&cancel).await.unwrap();
    conductor.implement(&cancel).await.unwrap();
    assert!(dir.path().join("greeting.txt").exists());

    // Undo to the post-plan checkpoint removes the implementation.
    conductor.undo(&cancel).await.unwrap();
    assert!(!dir.path().join("greeting.txt").exists());
    assert_eq!(conductor.status().await.unwrap().state, WorkflowState::Idle);

    // Redo restores it.
    conductor.redo(&cancel).await.unwrap();
    assert!(dir.path().join("greeting.txt").exists());

    // Redo past the tip fails.
    let err = conductor.redo(&cancel).await.unwrap_err();
    assert!(matches!(err, ConductorError::NotFound(_)));

    // Undoing back to the first checkpoint, then once more, fails.
    conductor.undo(&cancel).await.unwrap();
    conductor.undo(&cancel).await.unwrap();
    let err = conductor.undo(&cancel).await.unwrap_err();
    assert!(matches!(err, ConductorError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// S6: cancellation mid-implement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_cancellation_leaves_step_state() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());

    let slow_implement = r#"
echo '{"type":"text","payload":{"content":"working"}}'
sleep 30
"#;
    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, slow_implement, false).await;
    let cancel = CancelToken::new();
    conductor
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap();
    conductor.plan(&cancel).await.unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(15), conductor.implement(&cancel))
        .await
        .expect("cancel ends the step promptly")
        .unwrap_err();
    assert!(matches!(err, ConductorError::Cancelled));
    assert_eq!(err.exit_code(), 130);

    // No checkpoint was committed, so the persisted state still names the
    // interrupted step.
    let fresh = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let status = fresh.status().await.unwrap();
    assert_eq!(status.state, WorkflowState::Implementing);
    assert_eq!(status.checkpoints, 2); // register, plan
}

// ---------------------------------------------------------------------------
// Abandon
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abandon_removes_all_task_artifacts() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_task_file(dir.path());

    let conductor = open_conductor(dir.path(), PLAN_SCRIPT, IMPLEMENT_SCRIPT, false).await;
    let cancel = CancelToken::new();
    let status = conductor
        .start("file:task.md", StartOptions::default(), &cancel)
        .await
        .unwrap();
    conductor.plan(&cancel).await.unwrap();

    conductor
        .abandon(Default::default(), &cancel)
        .await
        .unwrap();

    assert!(!dir
        .path()
        .join(".mehrhof/work")
        .join(status.task_id.as_str())
        .exists());
    assert!(!dir.path().join(".mehrhof/active.json").exists());
    assert_eq!(
        mh_vcs::GitVcs::new(dir.path()).current_branch().unwrap(),
        "main"
    );
    assert!(!mh_vcs::RepoReader::branch_exists(dir.path(), "feature/FEAT-1--add-greeting").unwrap());
}
