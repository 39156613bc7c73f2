use std::collections::BTreeMap;

use mh_bridge::CancelToken;
use mh_conductor::{
    run_auto, AbandonOptions, AutoOptions, Conductor, ConductorError, ConductorOptions,
    FinishOptions, StartOptions, StepOutcome, TaskStatus,
};
use mh_core::config::UserSettings;
use mh_core::types::{NoteRole, WorkflowState};

use crate::{Cli, Commands};

/// Dispatch a parsed command line; returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, ConductorError> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let step_agents = parse_step_agents(&cli.step_agents)?;
    let auto_mode = matches!(cli.command, Commands::Auto { .. });
    let options = ConductorOptions {
        agent: cli.agent.clone(),
        step_agents,
        skip_agent_questions: auto_mode,
        dry_run: matches!(cli.command, Commands::Implement { dry_run: true }),
        review_command: match &cli.command {
            Commands::Review { tool } => tool.clone(),
            _ => None,
        },
        quality_target: match &cli.command {
            Commands::Quality { target } => target.clone(),
            Commands::Auto { quality_target, .. } => quality_target.clone(),
            _ => None,
        },
    };

    let cwd = std::env::current_dir()
        .map_err(|e| ConductorError::Fatal(format!("cannot determine working directory: {e}")))?;
    let conductor = Conductor::open(&cwd, options).await?;
    record_update_check(&conductor.settings_path());

    match cli.command {
        Commands::Start {
            reference,
            no_branch,
            worktree,
        } => {
            let status = conductor
                .start(
                    &reference,
                    StartOptions {
                        create_branch: !no_branch,
                        use_worktree: worktree,
                    },
                    &cancel,
                )
                .await?;
            println!("started {} -- {}", status.task_id, status.title);
            if let Some(branch) = &status.branch {
                println!("  branch:   {branch}");
            }
            if let Some(worktree) = &status.worktree {
                println!("  worktree: {worktree}");
                println!("  next:     cd {worktree} && mh plan");
            } else {
                println!("  next:     mh plan");
            }
        }

        Commands::Plan => match conductor.plan(&cancel).await? {
            StepOutcome::Completed => println!("plan complete; next: mh implement"),
            StepOutcome::QuestionPending(q) => print_question(&q),
        },

        Commands::Implement { .. } => match conductor.implement(&cancel).await? {
            StepOutcome::Completed => println!("implementation complete; next: mh finish"),
            StepOutcome::QuestionPending(q) => print_question(&q),
        },

        Commands::Review { .. } => {
            let outcome = conductor.review(&cancel).await?;
            println!(
                "review {:?}; artifact review-{}.txt",
                outcome.verdict, outcome.artifact_number
            );
        }

        Commands::Note { message } => {
            let outcome = conductor.note(&message.join(" "), NoteRole::User).await?;
            if outcome.answered {
                println!("answer recorded; resume with the interrupted step");
            } else {
                println!("note recorded");
            }
        }

        Commands::Answer { message } => {
            let outcome = conductor.note(&message.join(" "), NoteRole::User).await?;
            match outcome.resume {
                Some(WorkflowState::Planning) => {
                    println!("answer recorded; resuming planning");
                    conductor.plan(&cancel).await?;
                }
                Some(WorkflowState::Implementing) => {
                    println!("answer recorded; resuming implementation");
                    conductor.implement(&cancel).await?;
                }
                Some(state) => println!("answer recorded; state is now {state}"),
                None => println!("no pending question; note recorded"),
            }
        }

        Commands::Dialogue { message } => {
            let reply = conductor.dialogue(&message.join(" "), &cancel).await?;
            println!("{}", reply.trim_end());
        }

        Commands::Undo => {
            conductor.undo(&cancel).await?;
            println!("working tree reset to the previous checkpoint");
        }

        Commands::Redo => {
            conductor.redo(&cancel).await?;
            println!("working tree restored to the next checkpoint");
        }

        Commands::Quality { target } => {
            let result = conductor
                .quality(target.as_deref(), false, &cancel)
                .await?;
            if !result.ran {
                println!("no quality command defined");
            } else if result.passed {
                println!("quality passed");
            } else {
                println!("quality failed:\n{}", result.output.trim_end());
                return Ok(1);
            }
        }

        Commands::Finish {
            no_quality,
            pr,
            draft,
            keep_branch,
            push,
            target_branch,
        } => {
            conductor
                .finish(
                    FinishOptions {
                        skip_quality: no_quality,
                        pr,
                        pr_draft: draft,
                        pr_title: None,
                        pr_body: None,
                        delete_branch: !keep_branch,
                        push,
                        target_branch,
                    },
                    &cancel,
                )
                .await?;
            println!("task finished");
        }

        Commands::Abandon {
            keep_work,
            keep_branch,
        } => {
            conductor
                .abandon(
                    AbandonOptions {
                        keep_branch,
                        keep_work,
                    },
                    &cancel,
                )
                .await?;
            println!("task abandoned");
        }

        Commands::Auto {
            reference,
            max_retries,
            skip_quality,
            worktree,
            keep_branch,
            push,
            target_branch,
            quality_target,
        } => {
            let result = run_auto(
                &conductor,
                &reference,
                AutoOptions {
                    start: StartOptions {
                        create_branch: true,
                        use_worktree: worktree,
                    },
                    finish: FinishOptions {
                        delete_branch: !keep_branch,
                        push,
                        target_branch,
                        ..Default::default()
                    },
                    quality_target,
                    max_retries,
                    skip_quality,
                },
                &cancel,
            )
            .await?;

            if let Some(phase) = &result.failed_phase {
                eprintln!(
                    "auto cycle stopped at {phase}: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                return Ok(1);
            }
            println!(
                "auto cycle complete ({} quality attempt{})",
                result.quality_attempts,
                if result.quality_attempts == 1 { "" } else { "s" }
            );
        }

        Commands::Status { json } => {
            let status = conductor.status().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .map_err(|e| ConductorError::Fatal(e.to_string()))?
                );
            } else {
                print_status(&status);
            }
        }
    }

    Ok(0)
}

fn parse_step_agents(pairs: &[String]) -> Result<BTreeMap<String, String>, ConductorError> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((step, agent)) = pair.split_once('=') else {
            return Err(ConductorError::UserInput(format!(
                "invalid --step-agent `{pair}`; expected STEP=AGENT"
            )));
        };
        map.insert(step.trim().to_string(), agent.trim().to_string());
    }
    Ok(map)
}

fn print_question(question: &mh_core::types::PendingQuestion) {
    println!("the agent needs input: {}", question.question);
    for option in &question.options {
        let marker = if option.recommended { " (recommended)" } else { "" };
        println!("  - {}{marker}", option.label);
    }
    println!("answer with: mh answer <text>");
}

fn print_status(status: &TaskStatus) {
    println!("{} -- {}", status.task_id, status.title);
    println!("  state:          {}", status.state);
    if let Some(branch) = &status.branch {
        println!("  branch:         {branch}");
    }
    if let Some(worktree) = &status.worktree {
        println!("  worktree:       {worktree}");
    }
    println!(
        "  specifications: {} ({} open)",
        status.specifications, status.open_specifications
    );
    println!(
        "  checkpoints:    {} (at {})",
        status.checkpoints, status.checkpoint_cursor
    );
    if let Some(question) = &status.pending_question {
        println!("  waiting on:     {question}");
    }
    println!(
        "  tokens:         {} in / {} out / {} cached (${:.4})",
        status.costs.total_input_tokens,
        status.costs.total_output_tokens,
        status.costs.total_cached_tokens,
        status.costs.total_cost_usd
    );
}

/// Remember when we last looked for updates; the check itself is an outer
/// concern and never blocks startup.
fn record_update_check(path: &std::path::Path) {
    let mut settings = UserSettings::load(path);
    let stale = settings
        .last_update_check
        .map(|t| chrono::Utc::now() - t > chrono::Duration::hours(24))
        .unwrap_or(true);
    if stale {
        settings.last_update_check = Some(chrono::Utc::now());
        if let Err(e) = settings.save(&path) {
            tracing::debug!(error = %e, "could not persist update-check time");
        }
    }
}
