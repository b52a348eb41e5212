use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentStatus {
    Open,
    Applied,
}

impl CommentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Applied => "applied",
        }
    }
}

/// Closed set of journal event kinds. The wire encoding is the namespaced
/// dotted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "thread.created")]
    ThreadCreated,
    #[serde(rename = "thread.worktree.created")]
    ThreadWorktreeCreated,
    #[serde(rename = "review.comment.created")]
    ReviewCommentCreated,
    #[serde(rename = "review.rerun.queued")]
    ReviewRerunQueued,
    #[serde(rename = "automation.created")]
    AutomationCreated,
    #[serde(rename = "automation.triggered")]
    AutomationTriggered,
    #[serde(rename = "run.queued")]
    RunQueued,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.paused")]
    RunPaused,
    #[serde(rename = "run.resumed")]
    RunResumed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "loop.iteration.started")]
    LoopIterationStarted,
    #[serde(rename = "loop.agent.spawned")]
    LoopAgentSpawned,
    #[serde(rename = "loop.agent.exited")]
    LoopAgentExited,
    #[serde(rename = "loop.validation.completed")]
    LoopValidationCompleted,
    #[serde(rename = "loop.regression.reverted")]
    LoopRegressionReverted,
    #[serde(rename = "loop.checkpoint.committed")]
    LoopCheckpointCommitted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreadCreated => "thread.created",
            Self::ThreadWorktreeCreated => "thread.worktree.created",
            Self::ReviewCommentCreated => "review.comment.created",
            Self::ReviewRerunQueued => "review.rerun.queued",
            Self::AutomationCreated => "automation.created",
            Self::AutomationTriggered => "automation.triggered",
            Self::RunQueued => "run.queued",
            Self::RunStarted => "run.started",
            Self::RunPaused => "run.paused",
            Self::RunResumed => "run.resumed",
            Self::RunCancelled => "run.cancelled",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::LoopIterationStarted => "loop.iteration.started",
            Self::LoopAgentSpawned => "loop.agent.spawned",
            Self::LoopAgentExited => "loop.agent.exited",
            Self::LoopValidationCompleted => "loop.validation.completed",
            Self::LoopRegressionReverted => "loop.regression.reverted",
            Self::LoopCheckpointCommitted => "loop.checkpoint.committed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    pub name: String,
    pub task: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub agent: String,
    pub validate_commands: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub thread: ThreadRecord,
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    pub max_iterations: u32,
    pub iterations: u32,
    pub task_override: Option<String>,
    pub source_run_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub thread_id: String,
    pub run_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCommentRecord {
    pub id: String,
    pub thread_id: String,
    pub run_id: Option<String>,
    pub file_path: String,
    pub line_number: u32,
    pub body: String,
    pub status: CommentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRecord {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub thread_id: String,
    pub max_iterations: u32,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadPayload {
    pub name: String,
    pub task: String,
    pub repo_path: String,
    pub agent: Option<String>,
    pub validate: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunPayload {
    pub max_iterations: Option<u32>,
    pub task_override: Option<String>,
    pub source_run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunControlAction {
    Pause,
    Resume,
    Stop,
    Retry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunControlPayload {
    pub action: RunControlAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentPayload {
    pub run_id: Option<String>,
    pub file_path: String,
    pub line_number: u32,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunFromCommentsPayload {
    pub comment_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutomationPayload {
    pub name: String,
    pub cron: String,
    pub thread_id: String,
    pub max_iterations: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToggleAutomationPayload {
    pub enabled: bool,
}

/// One frame on the live stream. The `channel` field discriminates journal
/// events from connection-level notices.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum StreamEnvelope {
    Events {
        event: EventRecord,
    },
    System {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        missed: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::{EventKind, RunStatus, StreamEnvelope};

    #[test]
    fn event_kind_round_trips_through_wire_name() {
        let encoded = serde_json::to_string(&EventKind::LoopRegressionReverted).expect("encode");
        assert_eq!(encoded, "\"loop.regression.reverted\"");
        let decoded: EventKind = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, EventKind::LoopRegressionReverted);
        assert_eq!(decoded.as_str(), "loop.regression.reverted");
    }

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn system_envelope_omits_missing_fields() {
        let frame = StreamEnvelope::System {
            message: "connected".to_string(),
            missed: None,
        };
        let encoded = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({ "channel": "system", "message": "connected" })
        );
    }
}
