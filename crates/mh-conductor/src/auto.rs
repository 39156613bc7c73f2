use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mh_bridge::{CancelToken, ConductorEvent};
use mh_core::types::NoteRole;

use crate::conductor::{Conductor, FinishOptions, StartOptions, StepOutcome};
use crate::error::{ConductorError, Result};

// ---------------------------------------------------------------------------
// Options / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AutoOptions {
    pub start: StartOptions,
    pub finish: FinishOptions,
    pub quality_target: Option<String>,
    /// Implementation retries after quality failures.
    pub max_retries: u32,
    pub skip_quality: bool,
}

impl Default for AutoOptions {
    fn default() -> Self {
        Self {
            start: StartOptions::default(),
            finish: FinishOptions::default(),
            quality_target: None,
            max_retries: 3,
            skip_quality: false,
        }
    }
}

/// Outcome of a full unattended cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoResult {
    pub started: bool,
    pub planned: bool,
    pub implemented: bool,
    pub quality_attempts: u32,
    pub quality_passed: bool,
    pub finished: bool,
    /// The phase the cycle stopped at, when it did not complete.
    pub failed_phase: Option<String>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Auto loop
// ---------------------------------------------------------------------------

/// Drive Start → Plan → Implement → Quality(retry) → Finish without user
/// interaction. Quality failures feed back into the notes and trigger
/// another implementation round, up to `max_retries`. The conductor must
/// have been opened with `skip_agent_questions` so questions never block.
///
/// Phase failures are reported in the result; only cancellation propagates
/// as an error.
pub async fn run_auto(
    conductor: &Conductor,
    reference: &str,
    opts: AutoOptions,
    cancel: &CancelToken,
) -> Result<AutoResult> {
    let mut result = AutoResult::default();

    macro_rules! phase {
        ($name:literal, $percent:expr, $call:expr) => {
            match $call {
                Ok(value) => {
                    conductor.bus().publish(ConductorEvent::Progress {
                        message: concat!("phase ", $name, " complete").to_string(),
                        percent: $percent,
                    });
                    value
                }
                Err(ConductorError::Cancelled) => return Err(ConductorError::Cancelled),
                Err(e) => {
                    warn!(phase = $name, error = %e, "auto cycle stopped");
                    result.failed_phase = Some(phase_label($name));
                    result.error = Some(e.to_string());
                    return Ok(result);
                }
            }
        };
    }

    // Phase 1/5: register the task.
    phase!("1/5 start", 10, conductor.start(reference, opts.start.clone(), cancel).await);
    result.started = true;

    // Phase 2/5: plan. Questions are auto-answered, so a pending question
    // here means the conductor was misconfigured.
    let planned = phase!("2/5 plan", 30, conductor.plan(cancel).await);
    if matches!(planned, StepOutcome::QuestionPending(_)) {
        result.failed_phase = Some("plan".into());
        result.error = Some("planning stopped on an agent question".into());
        return Ok(result);
    }
    result.planned = true;

    // Phase 3/5: implement.
    phase!("3/5 implement", 50, conductor.implement(cancel).await);
    result.implemented = true;

    // Phase 4/5: quality with retries, feeding failures back to the agent.
    let mut finish = opts.finish.clone();
    if opts.skip_quality {
        finish.skip_quality = true;
    } else {
        for attempt in 1..=opts.max_retries.max(1) {
            result.quality_attempts = attempt;
            let quality = phase!(
                "4/5 quality",
                80,
                conductor
                    .quality(opts.quality_target.as_deref(), true, cancel)
                    .await
            );

            if !quality.ran {
                info!("no quality command; skipping the gate");
                finish.skip_quality = true;
                break;
            }
            if quality.passed {
                result.quality_passed = true;
                finish.skip_quality = true;
                break;
            }

            info!(attempt, "quality failed, feeding output back");
            phase!(
                "4/5 quality-feedback",
                80,
                conductor
                    .note(&quality.output, NoteRole::QualityFeedback)
                    .await
                    .map(|_| ())
            );

            if attempt == opts.max_retries.max(1) {
                result.failed_phase = Some("quality".into());
                result.error = Some("quality did not pass within the configured retries".into());
                return Ok(result);
            }
            phase!("4/5 re-implement", 80, conductor.implement(cancel).await);
        }
    }

    // Phase 5/5: finish.
    phase!("5/5 finish", 100, conductor.finish(finish, cancel).await);
    result.finished = true;

    conductor.bus().publish(ConductorEvent::Progress {
        message: "auto cycle complete".into(),
        percent: 100,
    });
    Ok(result)
}

fn phase_label(name: &str) -> String {
    name.split_whitespace()
        .nth(1)
        .unwrap_or(name)
        .to_string()
}
