use crate::adapters::{self, Agent};
use crate::errors::AppResult;
use crate::harness::progress;
use crate::harness::secret::{detect_secret, generate_secret};
use crate::models::EventKind;
use crate::process::{self, CancelHandle, DEFAULT_AGENT_TIMEOUT};
use crate::prompt::{build_prompt, PrdContext, PromptContext};
use crate::validate::{failure_context, run_validations};
use crate::worktree::Git;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

pub const DEFAULT_FAILURE_CONTEXT_CHARS: usize = 8_000;

/// Sink for loop events; the control plane persists and fans out each one.
pub type EventSink = Arc<dyn Fn(EventKind, serde_json::Value) + Send + Sync>;

#[derive(Clone)]
pub struct LoopConfig {
    pub worktree_path: PathBuf,
    pub task: String,
    pub validate_commands: Vec<String>,
    pub max_iterations: u32,
    pub progress_file: String,
    pub failure_context_chars: usize,
    pub git_checkpoints: bool,
    pub agent: Arc<dyn Agent>,
    pub dry_run: bool,
    pub iteration_delay: Duration,
    pub prd: Option<PrdContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub success: bool,
    pub iterations: u32,
    pub cancelled: bool,
}

/// Drive one run to completion, exhaustion, or cancellation.
///
/// The high-water mark never decreases, and an iteration that scores below it
/// leaves the worktree reverted to the last checkpoint before the next
/// iteration begins.
pub async fn run_loop(
    config: &LoopConfig,
    cancel: &CancelHandle,
    events: &EventSink,
) -> AppResult<LoopOutcome> {
    let secret = generate_secret();
    let git = Git::new(&config.worktree_path);

    if !adapters::is_installed(config.agent.as_ref()).await {
        tracing::warn!(
            agent = config.agent.name(),
            "agent CLI not detected; the run will proceed and likely fail its iterations"
        );
    }

    progress::ensure_progress_file(&config.worktree_path, &config.progress_file, &config.task)?;

    let baseline = run_validations(
        &config.validate_commands,
        &config.worktree_path,
        Some(cancel),
    )
    .await;
    let mut best_score = baseline.score();
    tracing::debug!(
        baseline = best_score,
        total = baseline.total_count,
        "baseline validation complete"
    );

    let mut last_failure_output: Option<String> = None;
    let mut was_reverted = false;

    for iteration in 1..=config.max_iterations {
        if cancel.is_cancelled() {
            return Ok(LoopOutcome {
                success: false,
                iterations: iteration - 1,
                cancelled: true,
            });
        }

        events(
            EventKind::LoopIterationStarted,
            json!({ "iteration": iteration }),
        );

        let progress_text =
            progress::read_progress(&config.worktree_path, &config.progress_file);
        let prompt = build_prompt(&PromptContext {
            task: config.task.clone(),
            iteration,
            max_iterations: config.max_iterations,
            progress: progress_text,
            validate_commands: config.validate_commands.clone(),
            completion_secret: secret.clone(),
            progress_file: config.progress_file.clone(),
            last_failure_output: last_failure_output.take(),
            was_reverted,
            prd: config.prd.clone(),
        });

        let spawn_spec = config
            .agent
            .build_command(&prompt, &config.worktree_path);
        if config.dry_run {
            return Ok(LoopOutcome {
                success: true,
                iterations: 0,
                cancelled: false,
            });
        }

        events(
            EventKind::LoopAgentSpawned,
            json!({ "agent": config.agent.name(), "iteration": iteration }),
        );
        let agent_outcome =
            process::run_spawn(&spawn_spec, Some(DEFAULT_AGENT_TIMEOUT), Some(cancel)).await;
        events(
            EventKind::LoopAgentExited,
            json!({
                "iteration": iteration,
                "exitCode": agent_outcome.exit_code,
                "elapsedMs": agent_outcome.elapsed_ms
            }),
        );

        let combined = format!("{}\n{}", agent_outcome.stdout, agent_outcome.stderr);
        let secret_claimed = detect_secret(&combined, &secret);

        // The agent's own claim is never trusted alone.
        let report = run_validations(
            &config.validate_commands,
            &config.worktree_path,
            Some(cancel),
        )
        .await;
        events(
            EventKind::LoopValidationCompleted,
            json!({
                "iteration": iteration,
                "passCount": report.pass_count,
                "totalCount": report.total_count,
                "allPassed": report.all_passed
            }),
        );
        let current_score = report.score();

        if secret_claimed && report.all_passed {
            if config.git_checkpoints {
                git.commit_all(&completion_message(config, iteration)).await?;
            }
            return Ok(LoopOutcome {
                success: true,
                iterations: iteration,
                cancelled: false,
            });
        }

        if secret_claimed {
            tracing::warn!(
                iteration,
                pass_count = report.pass_count,
                total = report.total_count,
                "agent claimed completion but validations are failing"
            );
        }

        if config.git_checkpoints {
            if current_score < best_score {
                git.revert_to_head().await?;
                events(
                    EventKind::LoopRegressionReverted,
                    json!({
                        "iteration": iteration,
                        "score": current_score,
                        "bestScore": best_score
                    }),
                );
                was_reverted = true;
            } else {
                was_reverted = false;
                if current_score > best_score {
                    best_score = current_score;
                }
                git.commit_all(&checkpoint_message(config, iteration, &report)).await?;
                events(
                    EventKind::LoopCheckpointCommitted,
                    json!({
                        "iteration": iteration,
                        "score": current_score,
                        "total": report.total_count
                    }),
                );
            }
        } else {
            was_reverted = false;
        }
        last_failure_output = Some(failure_context(&report, config.failure_context_chars));

        if config.iteration_delay > Duration::ZERO && iteration < config.max_iterations {
            tokio::select! {
                _ = tokio::time::sleep(config.iteration_delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    Ok(LoopOutcome {
        success: false,
        iterations: config.max_iterations,
        cancelled: false,
    })
}

fn completion_message(config: &LoopConfig, iteration: u32) -> String {
    match &config.prd {
        Some(prd) => format!("ralph: [{}] complete (iteration {})", prd.task_id, iteration),
        None => format!("ralph: task complete (iteration {})", iteration),
    }
}

fn checkpoint_message(
    config: &LoopConfig,
    iteration: u32,
    report: &crate::validate::ValidationReport,
) -> String {
    let passing = format!("{}/{} passing", report.pass_count, report.total_count);
    match &config.prd {
        Some(prd) => format!(
            "ralph: [{}] iteration {} ({})",
            prd.task_id, iteration, passing
        ),
        None => format!("ralph: iteration {} ({})", iteration, passing),
    }
}
