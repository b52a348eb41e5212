use crate::adapters::AgentRegistry;
use crate::automation::{cron_matches, minute_bucket, validate_cron};
use crate::broadcast::Broadcaster;
use crate::config::{ServerConfig, DEFAULT_MAX_ITERATIONS};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::harness::progress;
use crate::models::{
    AutomationRecord, CreateAutomationPayload, CreateCommentPayload, CreateThreadPayload,
    EventKind, EventRecord, ReviewCommentRecord, RunControlAction, RunRecord, RunStatus,
    StartRunPayload, ThreadDetail, ThreadRecord,
};
use crate::process::CancelHandle;
use crate::queue::{RunQueue, StopDisposition};
use crate::review::build_feedback_task;
use crate::run_loop::{run_loop, EventSink, LoopConfig, DEFAULT_FAILURE_CONTEXT_CHARS};
use crate::worktree::{self, Git};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

/// The explicit control-plane value. Constructed once at startup and passed
/// by reference to every handler; there is no ambient global state.
pub struct ControlPlane {
    db: Arc<Database>,
    queue: RunQueue,
    broadcaster: Broadcaster,
    agents: AgentRegistry,
}

impl ControlPlane {
    pub fn new(config: &ServerConfig) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&config.db_path)?);

        match db.mark_orphan_runs_interrupted() {
            Ok(settled) if settled > 0 => {
                tracing::warn!(count = settled, "settled orphaned runs from a previous process");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(error = %error, "failed to settle orphaned runs");
            }
        }

        let queue = RunQueue::new(config.max_concurrent);

        let this = Arc::new(Self {
            db,
            queue: queue.clone(),
            broadcaster: Broadcaster::default(),
            agents: AgentRegistry::new(),
        });

        let weak = Arc::downgrade(&this);
        queue.set_executor(Arc::new(move |run_id: String, cancel: CancelHandle| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(strong) = weak.upgrade() {
                    strong.execute_queued_run(run_id, cancel).await;
                }
            })
        }));

        Ok(this)
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    pub fn shutdown(&self) {
        self.queue.cancel_all_running();
    }

    fn emit(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        match self.db.insert_event(thread_id, run_id, kind, &payload) {
            Ok(event) => self.broadcaster.publish(event),
            Err(error) => {
                tracing::error!(kind = kind.as_str(), error = %error, "failed to journal event");
            }
        }
    }

    // --- threads ---

    pub async fn create_thread(&self, payload: CreateThreadPayload) -> AppResult<ThreadRecord> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Input("Thread name cannot be empty".to_string()));
        }
        if payload.task.trim().is_empty() {
            return Err(AppError::Input("Task cannot be empty".to_string()));
        }
        let agent = payload.agent.unwrap_or_else(|| "claude".to_string());
        if !self.agents.contains(&agent) {
            return Err(AppError::Input(format!(
                "Agent '{}' is not registered",
                agent
            )));
        }

        let thread_id = Uuid::new_v4().to_string();
        let created = worktree::provision(Path::new(&payload.repo_path), &thread_id).await?;

        let thread = self.db.insert_thread(
            &thread_id,
            &payload.name,
            &payload.task,
            &payload.repo_path,
            &created.worktree_path.to_string_lossy(),
            &created.branch_name,
            &agent,
            &payload.validate.unwrap_or_default(),
        )?;

        self.emit(
            &thread_id,
            None,
            EventKind::ThreadCreated,
            json!({ "name": thread.name, "agent": thread.agent }),
        );
        self.emit(
            &thread_id,
            None,
            EventKind::ThreadWorktreeCreated,
            json!({
                "worktreePath": thread.worktree_path,
                "branchName": thread.branch_name
            }),
        );

        Ok(thread)
    }

    pub fn list_threads(&self) -> AppResult<Vec<ThreadDetail>> {
        let threads = self.db.list_threads()?;
        let mut detailed = Vec::with_capacity(threads.len());
        for thread in threads {
            let runs = self.db.list_runs_for_thread(&thread.id)?;
            detailed.push(ThreadDetail { thread, runs });
        }
        Ok(detailed)
    }

    pub fn get_thread(&self, thread_id: &str) -> AppResult<ThreadRecord> {
        self.db
            .get_thread(thread_id)?
            .ok_or_else(|| AppError::NotFound(format!("Thread '{}' not found", thread_id)))
    }

    pub fn thread_events(
        &self,
        thread_id: &str,
        limit: Option<u32>,
    ) -> AppResult<Vec<EventRecord>> {
        self.get_thread(thread_id)?;
        self.db.list_thread_events(thread_id, limit)
    }

    pub async fn thread_diff(&self, thread_id: &str) -> AppResult<String> {
        let thread = self.get_thread(thread_id)?;
        Git::new(PathBuf::from(&thread.worktree_path)).diff().await
    }

    // --- runs ---

    pub fn start_run(&self, thread_id: &str, payload: StartRunPayload) -> AppResult<RunRecord> {
        let thread = self.get_thread(thread_id)?;
        let run_id = Uuid::new_v4().to_string();
        let max_iterations = payload.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(AppError::Input(
                "maxIterations must be at least 1".to_string(),
            ));
        }

        let run = self.db.insert_run(
            &run_id,
            &thread.id,
            max_iterations,
            payload.task_override.as_deref(),
            payload.source_run_id.as_deref(),
        )?;

        self.emit(
            &thread.id,
            Some(&run_id),
            EventKind::RunQueued,
            json!({ "maxIterations": max_iterations }),
        );
        self.queue.enqueue(&run_id);

        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> AppResult<RunRecord> {
        self.db
            .get_run(run_id)?
            .ok_or_else(|| AppError::NotFound(format!("Run '{}' not found", run_id)))
    }

    pub fn control_run(&self, run_id: &str, action: RunControlAction) -> AppResult<RunRecord> {
        let run = self.get_run(run_id)?;

        match action {
            RunControlAction::Pause => {
                if !self.queue.pause(run_id) {
                    return Err(AppError::Conflict(
                        "Only queued runs can be paused".to_string(),
                    ));
                }
                self.db.update_run_status(run_id, RunStatus::Paused, None)?;
                self.emit(&run.thread_id, Some(run_id), EventKind::RunPaused, json!({}));
                self.get_run(run_id)
            }
            RunControlAction::Resume => {
                if run.status != RunStatus::Paused {
                    return Err(AppError::Conflict(
                        "Only paused runs can be resumed".to_string(),
                    ));
                }
                self.db.update_run_status(run_id, RunStatus::Queued, None)?;
                self.emit(&run.thread_id, Some(run_id), EventKind::RunResumed, json!({}));
                self.queue.enqueue(run_id);
                self.get_run(run_id)
            }
            RunControlAction::Stop => match self.queue.stop(run_id) {
                StopDisposition::Pending => {
                    self.db.update_run_status(run_id, RunStatus::Cancelled, None)?;
                    self.emit(
                        &run.thread_id,
                        Some(run_id),
                        EventKind::RunCancelled,
                        json!({ "iterations": run.iterations }),
                    );
                    self.get_run(run_id)
                }
                // The loop observes the cancellation at its next suspension
                // point and its finalizer settles the run.
                StopDisposition::Running => self.get_run(run_id),
                StopDisposition::Unknown => Err(AppError::Conflict(format!(
                    "Run is {} and cannot be stopped",
                    run.status.as_str()
                ))),
            },
            RunControlAction::Retry => {
                if !matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
                    return Err(AppError::Conflict(
                        "Only failed or cancelled runs can be retried".to_string(),
                    ));
                }
                self.start_run(
                    &run.thread_id,
                    StartRunPayload {
                        max_iterations: Some(run.max_iterations),
                        task_override: run.task_override.clone(),
                        source_run_id: Some(run.id.clone()),
                    },
                )
            }
        }
    }

    /// Queue executor: status-gate, run the loop, settle the run. Every exit
    /// path finalizes the run; the queue re-ticks after this returns.
    async fn execute_queued_run(self: Arc<Self>, run_id: String, cancel: CancelHandle) {
        match self.db.run_status(&run_id) {
            Ok(Some(RunStatus::Queued)) => {}
            Ok(_) => return,
            Err(error) => {
                tracing::error!(run_id = %run_id, error = %error, "status gate failed");
                return;
            }
        }

        let run = match self.get_run(&run_id) {
            Ok(run) => run,
            Err(error) => {
                tracing::error!(run_id = %run_id, error = %error, "queued run vanished");
                return;
            }
        };
        let thread = match self.get_thread(&run.thread_id) {
            Ok(thread) => thread,
            Err(error) => {
                self.fail_run(&run, &error.to_string());
                return;
            }
        };

        if let Err(error) = self.db.update_run_status(&run_id, RunStatus::Running, None) {
            tracing::error!(run_id = %run_id, error = %error, "failed to mark run running");
        }
        self.emit(&thread.id, Some(&run_id), EventKind::RunStarted, json!({}));

        let agent = match self.agents.resolve(&thread.agent) {
            Ok(agent) => agent,
            Err(error) => {
                self.fail_run(&run, &error.to_string());
                return;
            }
        };

        let sink: EventSink = {
            let plane = self.clone();
            let thread_id = thread.id.clone();
            let run_id = run_id.clone();
            Arc::new(move |kind, payload| {
                plane.emit(&thread_id, Some(&run_id), kind, payload);
            })
        };

        let loop_config = LoopConfig {
            worktree_path: PathBuf::from(&thread.worktree_path),
            task: run
                .task_override
                .clone()
                .unwrap_or_else(|| thread.task.clone()),
            validate_commands: thread.validate_commands.clone(),
            max_iterations: run.max_iterations,
            progress_file: progress::default_progress_file(&thread.id),
            failure_context_chars: DEFAULT_FAILURE_CONTEXT_CHARS,
            git_checkpoints: true,
            agent,
            dry_run: false,
            iteration_delay: Duration::ZERO,
            prd: None,
        };

        let result = run_loop(&loop_config, &cancel, &sink).await;

        match result {
            Ok(outcome) => {
                if let Err(error) = self.db.set_run_iterations(&run_id, outcome.iterations) {
                    tracing::error!(run_id = %run_id, error = %error, "failed to record iterations");
                }
                if outcome.cancelled || cancel.is_cancelled() {
                    let _ = self.db.update_run_status(&run_id, RunStatus::Cancelled, None);
                    self.emit(
                        &thread.id,
                        Some(&run_id),
                        EventKind::RunCancelled,
                        json!({ "iterations": outcome.iterations }),
                    );
                } else if outcome.success {
                    let _ = self.db.update_run_status(&run_id, RunStatus::Completed, None);
                    self.emit(
                        &thread.id,
                        Some(&run_id),
                        EventKind::RunCompleted,
                        json!({ "iterations": outcome.iterations }),
                    );
                } else {
                    self.fail_run(&run, "Loop ended before completion");
                }
            }
            Err(error) => {
                // Cancellation wins over any error the teardown produced.
                if cancel.is_cancelled() {
                    let _ = self.db.update_run_status(&run_id, RunStatus::Cancelled, None);
                    self.emit(&thread.id, Some(&run_id), EventKind::RunCancelled, json!({}));
                } else {
                    self.fail_run(&run, &error.to_string());
                }
            }
        }

        if let Err(error) = self.db.touch_thread(&thread.id) {
            tracing::warn!(thread_id = %thread.id, error = %error, "failed to touch thread");
        }
    }

    fn fail_run(&self, run: &RunRecord, message: &str) {
        if let Err(error) = self
            .db
            .update_run_status(&run.id, RunStatus::Failed, Some(message))
        {
            tracing::error!(run_id = %run.id, error = %error, "failed to mark run failed");
        }
        self.emit(
            &run.thread_id,
            Some(&run.id),
            EventKind::RunFailed,
            json!({ "message": message }),
        );
    }

    // --- review comments ---

    pub fn create_comment(
        &self,
        thread_id: &str,
        payload: CreateCommentPayload,
    ) -> AppResult<ReviewCommentRecord> {
        let thread = self.get_thread(thread_id)?;
        if payload.body.trim().is_empty() {
            return Err(AppError::Input("Comment body cannot be empty".to_string()));
        }
        if payload.line_number == 0 {
            return Err(AppError::Input(
                "Line numbers are 1-based; 0 is not a valid line".to_string(),
            ));
        }

        let comment = self.db.insert_comment(
            &thread.id,
            payload.run_id.as_deref(),
            &payload.file_path,
            payload.line_number,
            &payload.body,
        )?;

        self.emit(
            &thread.id,
            payload.run_id.as_deref(),
            EventKind::ReviewCommentCreated,
            json!({
                "commentId": comment.id,
                "filePath": comment.file_path,
                "lineNumber": comment.line_number
            }),
        );

        Ok(comment)
    }

    pub fn list_comments(&self, thread_id: &str) -> AppResult<Vec<ReviewCommentRecord>> {
        self.get_thread(thread_id)?;
        self.db.list_comments(thread_id)
    }

    /// Build and enqueue a rerun whose task carries the selected comments,
    /// marking each one applied.
    pub fn rerun_from_comments(
        &self,
        thread_id: &str,
        comment_ids: &[String],
    ) -> AppResult<RunRecord> {
        let thread = self.get_thread(thread_id)?;
        if comment_ids.is_empty() {
            return Err(AppError::Input("No comment ids supplied".to_string()));
        }
        let comments = self.db.get_comments_by_ids(&thread.id, comment_ids)?;
        if comments.is_empty() {
            return Err(AppError::Input(
                "None of the supplied comments belong to this thread".to_string(),
            ));
        }

        let task_override = build_feedback_task(&thread.task, &comments);
        let source_run_id = comments[0].run_id.clone();
        let applied_ids: Vec<String> = comments.iter().map(|comment| comment.id.clone()).collect();

        self.db.mark_comments_applied(&thread.id, &applied_ids)?;

        let run = self.start_run(
            &thread.id,
            StartRunPayload {
                max_iterations: None,
                task_override: Some(task_override),
                source_run_id,
            },
        )?;

        self.emit(
            &thread.id,
            Some(&run.id),
            EventKind::ReviewRerunQueued,
            json!({ "commentIds": applied_ids }),
        );

        Ok(run)
    }

    // --- automations ---

    pub fn create_automation(
        &self,
        payload: CreateAutomationPayload,
    ) -> AppResult<AutomationRecord> {
        validate_cron(&payload.cron)?;
        let thread = self.get_thread(&payload.thread_id)?;
        if payload.name.trim().is_empty() {
            return Err(AppError::Input("Automation name cannot be empty".to_string()));
        }

        let automation = self.db.insert_automation(
            &payload.name,
            &payload.cron,
            &thread.id,
            payload.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            payload.enabled.unwrap_or(true),
        )?;

        self.emit(
            &thread.id,
            None,
            EventKind::AutomationCreated,
            json!({ "automationId": automation.id, "cron": automation.cron }),
        );

        Ok(automation)
    }

    pub fn list_automations(&self) -> AppResult<Vec<AutomationRecord>> {
        self.db.list_automations(false)
    }

    pub fn toggle_automation(&self, automation_id: &str, enabled: bool) -> AppResult<AutomationRecord> {
        if !self.db.set_automation_enabled(automation_id, enabled)? {
            return Err(AppError::NotFound(format!(
                "Automation '{}' not found",
                automation_id
            )));
        }
        self.db
            .get_automation(automation_id)?
            .ok_or_else(|| AppError::NotFound(format!("Automation '{}' not found", automation_id)))
    }

    /// One scheduler tick: fire every enabled automation whose cron matches
    /// `now`, at most once per minute bucket.
    pub fn automation_tick(&self, now: DateTime<Utc>) -> AppResult<()> {
        for automation in self.db.list_automations(true)? {
            if !cron_matches(&automation.cron, &now) {
                continue;
            }
            let already_fired = automation
                .last_triggered_at
                .map(|last| minute_bucket(&last) == minute_bucket(&now))
                .unwrap_or(false);
            if already_fired {
                continue;
            }
            if let Err(error) = self.fire_automation(&automation, now) {
                tracing::warn!(
                    automation_id = %automation.id,
                    error = %error,
                    "automation trigger failed"
                );
            }
        }
        Ok(())
    }

    /// Manual trigger: same effect as a matching tick, ignoring the cron and
    /// the minute-bucket guard.
    pub fn trigger_automation_now(&self, automation_id: &str) -> AppResult<RunRecord> {
        let automation = self
            .db
            .get_automation(automation_id)?
            .ok_or_else(|| AppError::NotFound(format!("Automation '{}' not found", automation_id)))?;
        self.fire_automation(&automation, Utc::now())
    }

    fn fire_automation(
        &self,
        automation: &AutomationRecord,
        now: DateTime<Utc>,
    ) -> AppResult<RunRecord> {
        let thread = self.get_thread(&automation.thread_id)?;
        self.db.touch_automation_triggered(&automation.id, now)?;

        self.emit(
            &thread.id,
            None,
            EventKind::AutomationTriggered,
            json!({ "automationId": automation.id, "name": automation.name }),
        );

        self.start_run(
            &thread.id,
            StartRunPayload {
                max_iterations: Some(automation.max_iterations),
                task_override: None,
                source_run_id: None,
            },
        )
    }
}
