use crate::errors::{AppError, AppResult};
use crate::models::{
    AutomationRecord, CommentStatus, EventKind, EventRecord, ReviewCommentRecord, RunRecord,
    RunStatus, ThreadRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const DEFAULT_EVENT_LIMIT: u32 = 200;

/// Serialized facade over the single SQLite file. All writes are single
/// statements; the connection mutex is the only synchronization.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema_extensions()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema_extensions()?;
        Ok(db)
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Columns that postdate the original schema are added lazily so older
    /// database files keep working.
    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.lock()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if !column_exists(&conn, "runs", "source_run_id")? {
            conn.execute("ALTER TABLE runs ADD COLUMN source_run_id TEXT", [])?;
        }
        if !column_exists(&conn, "automations", "last_triggered_at")? {
            conn.execute("ALTER TABLE automations ADD COLUMN last_triggered_at TEXT", [])?;
        }

        Ok(())
    }

    /// Runs left non-terminal by a previous process can never make progress
    /// again; settle them before the queue starts.
    pub fn mark_orphan_runs_interrupted(&self) -> AppResult<usize> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'failed', error = 'Interrupted by restart', finished_at = ?1
             WHERE status IN ('queued', 'running', 'paused')",
            params![now],
        )?;
        Ok(changed)
    }

    // --- threads ---

    #[allow(clippy::too_many_arguments)]
    pub fn insert_thread(
        &self,
        id: &str,
        name: &str,
        task: &str,
        repo_path: &str,
        worktree_path: &str,
        branch_name: &str,
        agent: &str,
        validate_commands: &[String],
    ) -> AppResult<ThreadRecord> {
        let now = Utc::now();
        let validate_json = serde_json::to_string(validate_commands)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO threads (id, name, task, repo_path, worktree_path, branch_name, agent, validate_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                name,
                task,
                repo_path,
                worktree_path,
                branch_name,
                agent,
                validate_json,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;

        Ok(ThreadRecord {
            id: id.to_string(),
            name: name.to_string(),
            task: task.to_string(),
            repo_path: repo_path.to_string(),
            worktree_path: worktree_path.to_string(),
            branch_name: branch_name.to_string(),
            agent: agent.to_string(),
            validate_commands: validate_commands.to_vec(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_thread(&self, thread_id: &str) -> AppResult<Option<ThreadRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, task, repo_path, worktree_path, branch_name, agent, validate_json, created_at, updated_at
             FROM threads WHERE id = ?1",
            [thread_id],
            map_thread_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_threads(&self) -> AppResult<Vec<ThreadRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, task, repo_path, worktree_path, branch_name, agent, validate_json, created_at, updated_at
             FROM threads ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], map_thread_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    pub fn touch_thread(&self, thread_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), thread_id],
        )?;
        Ok(())
    }

    // --- runs ---

    pub fn insert_run(
        &self,
        run_id: &str,
        thread_id: &str,
        max_iterations: u32,
        task_override: Option<&str>,
        source_run_id: Option<&str>,
    ) -> AppResult<RunRecord> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (id, thread_id, status, max_iterations, iterations, task_override, source_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
            params![
                run_id,
                thread_id,
                RunStatus::Queued.as_str(),
                max_iterations,
                task_override,
                source_run_id,
                now.to_rfc3339()
            ],
        )?;

        Ok(RunRecord {
            id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            status: RunStatus::Queued,
            max_iterations,
            iterations: 0,
            task_override: task_override.map(ToString::to_string),
            source_run_id: source_run_id.map(ToString::to_string),
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn get_run(&self, run_id: &str) -> AppResult<Option<RunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, thread_id, status, max_iterations, iterations, task_override, source_run_id, error, created_at, started_at, finished_at
             FROM runs WHERE id = ?1",
            [run_id],
            map_run_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_runs_for_thread(&self, thread_id: &str) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, status, max_iterations, iterations, task_override, source_run_id, error, created_at, started_at, finished_at
             FROM runs WHERE thread_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([thread_id], map_run_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    pub fn run_status(&self, run_id: &str) -> AppResult<Option<RunStatus>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", [run_id], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(parse_run_status(&raw)?)),
            None => Ok(None),
        }
    }

    /// `started_at` is stamped on the first transition to running and
    /// `finished_at` on any terminal transition.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        if status == RunStatus::Running {
            conn.execute(
                "UPDATE runs SET status = ?1, started_at = COALESCE(started_at, ?2) WHERE id = ?3",
                params![status.as_str(), now, run_id],
            )?;
        } else if status.is_terminal() {
            conn.execute(
                "UPDATE runs SET status = ?1, error = COALESCE(?2, error), finished_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, now, run_id],
            )?;
        } else {
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), run_id],
            )?;
        }
        Ok(())
    }

    pub fn set_run_iterations(&self, run_id: &str, iterations: u32) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET iterations = ?1 WHERE id = ?2",
            params![iterations, run_id],
        )?;
        Ok(())
    }

    // --- events ---

    pub fn insert_event(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> AppResult<EventRecord> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (thread_id, run_id, kind, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id,
                run_id,
                kind.as_str(),
                serde_json::to_string(payload)?,
                created_at.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(EventRecord {
            id,
            thread_id: thread_id.to_string(),
            run_id: run_id.map(ToString::to_string),
            kind,
            payload: payload.clone(),
            created_at,
        })
    }

    pub fn list_thread_events(
        &self,
        thread_id: &str,
        limit: Option<u32>,
    ) -> AppResult<Vec<EventRecord>> {
        let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, run_id, kind, payload_json, created_at
             FROM events WHERE thread_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit], map_event_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    pub fn get_event(&self, event_id: i64) -> AppResult<Option<EventRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, thread_id, run_id, kind, payload_json, created_at
             FROM events WHERE id = ?1",
            [event_id],
            map_event_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    // --- review comments ---

    pub fn insert_comment(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
        file_path: &str,
        line_number: u32,
        body: &str,
    ) -> AppResult<ReviewCommentRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO review_comments (id, thread_id, run_id, file_path, line_number, body, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                thread_id,
                run_id,
                file_path,
                line_number,
                body,
                CommentStatus::Open.as_str(),
                created_at.to_rfc3339()
            ],
        )?;

        Ok(ReviewCommentRecord {
            id,
            thread_id: thread_id.to_string(),
            run_id: run_id.map(ToString::to_string),
            file_path: file_path.to_string(),
            line_number,
            body: body.to_string(),
            status: CommentStatus::Open,
            created_at,
        })
    }

    pub fn list_comments(&self, thread_id: &str) -> AppResult<Vec<ReviewCommentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, run_id, file_path, line_number, body, status, created_at
             FROM review_comments WHERE thread_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([thread_id], map_comment_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    /// Returns only comments belonging to `thread_id`, preserving the order
    /// of `ids` as submitted. Foreign or unknown ids are silently skipped.
    pub fn get_comments_by_ids(
        &self,
        thread_id: &str,
        ids: &[String],
    ) -> AppResult<Vec<ReviewCommentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, run_id, file_path, line_number, body, status, created_at
             FROM review_comments WHERE id = ?1 AND thread_id = ?2",
        )?;
        let mut found = Vec::new();
        for id in ids {
            if let Some(comment) = stmt
                .query_row(params![id, thread_id], map_comment_row)
                .optional()?
            {
                found.push(comment);
            }
        }
        Ok(found)
    }

    pub fn mark_comments_applied(&self, thread_id: &str, ids: &[String]) -> AppResult<usize> {
        let conn = self.lock()?;
        let mut changed = 0;
        for id in ids {
            changed += conn.execute(
                "UPDATE review_comments SET status = 'applied' WHERE id = ?1 AND thread_id = ?2 AND status = 'open'",
                params![id, thread_id],
            )?;
        }
        Ok(changed)
    }

    // --- automations ---

    pub fn insert_automation(
        &self,
        name: &str,
        cron: &str,
        thread_id: &str,
        max_iterations: u32,
        enabled: bool,
    ) -> AppResult<AutomationRecord> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO automations (id, name, cron, thread_id, max_iterations, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, name, cron, thread_id, max_iterations, enabled],
        )?;

        Ok(AutomationRecord {
            id,
            name: name.to_string(),
            cron: cron.to_string(),
            thread_id: thread_id.to_string(),
            max_iterations,
            enabled,
            last_triggered_at: None,
        })
    }

    pub fn list_automations(&self, enabled_only: bool) -> AppResult<Vec<AutomationRecord>> {
        let conn = self.lock()?;
        let sql = if enabled_only {
            "SELECT id, name, cron, thread_id, max_iterations, enabled, last_triggered_at
             FROM automations WHERE enabled = 1 ORDER BY name"
        } else {
            "SELECT id, name, cron, thread_id, max_iterations, enabled, last_triggered_at
             FROM automations ORDER BY name"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], map_automation_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(AppError::from)
    }

    pub fn get_automation(&self, automation_id: &str) -> AppResult<Option<AutomationRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, cron, thread_id, max_iterations, enabled, last_triggered_at
             FROM automations WHERE id = ?1",
            [automation_id],
            map_automation_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn set_automation_enabled(&self, automation_id: &str, enabled: bool) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE automations SET enabled = ?1 WHERE id = ?2",
            params![enabled, automation_id],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_automation_triggered(
        &self,
        automation_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE automations SET last_triggered_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), automation_id],
        )?;
        Ok(())
    }
}

fn map_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let validate_json: String = row.get(7)?;
    let validate_commands: Vec<String> = serde_json::from_str(&validate_json)
        .map_err(|err| conversion_error(format!("validate_json: {err}")))?;
    Ok(ThreadRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        task: row.get(2)?,
        repo_path: row.get(3)?,
        worktree_path: row.get(4)?,
        branch_name: row.get(5)?,
        agent: row.get(6)?,
        validate_commands,
        created_at: parse_timestamp(&row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(9)?)?,
    })
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        status: parse_run_status(&row.get::<_, String>(2)?)?,
        max_iterations: row.get(3)?,
        iterations: row.get(4)?,
        task_override: row.get(5)?,
        source_run_id: row.get(6)?,
        error: row.get(7)?,
        created_at: parse_timestamp(&row.get::<_, String>(8)?)?,
        started_at: parse_optional_timestamp(row.get::<_, Option<String>>(9)?)?,
        finished_at: parse_optional_timestamp(row.get::<_, Option<String>>(10)?)?,
    })
}

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload_json: String = row.get(4)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|err| conversion_error(format!("payload_json: {err}")))?;
    Ok(EventRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        run_id: row.get(2)?,
        kind: parse_event_kind(&row.get::<_, String>(3)?)?,
        payload,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

fn map_comment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewCommentRecord> {
    Ok(ReviewCommentRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        run_id: row.get(2)?,
        file_path: row.get(3)?,
        line_number: row.get(4)?,
        body: row.get(5)?,
        status: parse_comment_status(&row.get::<_, String>(6)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}

fn map_automation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationRecord> {
    Ok(AutomationRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        thread_id: row.get(3)?,
        max_iterations: row.get(4)?,
        enabled: row.get(5)?,
        last_triggered_at: parse_optional_timestamp(row.get::<_, Option<String>>(6)?)?,
    })
}

fn parse_run_status(raw: &str) -> rusqlite::Result<RunStatus> {
    match raw {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(conversion_error(format!("unknown run status '{other}'"))),
    }
}

fn parse_comment_status(raw: &str) -> rusqlite::Result<CommentStatus> {
    match raw {
        "open" => Ok(CommentStatus::Open),
        "applied" => Ok(CommentStatus::Applied),
        other => Err(conversion_error(format!("unknown comment status '{other}'"))),
    }
}

fn parse_event_kind(raw: &str) -> rusqlite::Result<EventKind> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| conversion_error(format!("unknown event kind '{raw}'")))
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| conversion_error(format!("timestamp '{raw}': {err}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_timestamp(&value)).transpose()
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, message.into())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
