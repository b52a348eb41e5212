use crate::errors::{AppError, AppResult};
use std::fs;
use std::path::Path;

pub fn default_progress_file(thread_id: &str) -> String {
    format!("ralph-progress-{thread_id}.md")
}

/// The document the agent finds on its first iteration.
pub fn initial_progress(task: &str) -> String {
    format!(
        "# Ralph Loop Progress\n\n## Task\n\n{}\n\n## Status\n\nStarted — no iterations completed yet.\n\n## Iteration Log\n",
        task.trim_end()
    )
}

/// Create the progress document if the worktree does not have one yet.
pub fn ensure_progress_file(worktree: &Path, file_name: &str, task: &str) -> AppResult<()> {
    let path = worktree.join(file_name);
    if path.exists() {
        return Ok(());
    }
    fs::write(&path, initial_progress(task)).map_err(|err| AppError::Io(err.to_string()))
}

/// None when the file does not exist; the loop turns that into the
/// first-iteration notice.
pub fn read_progress(worktree: &Path, file_name: &str) -> Option<String> {
    fs::read_to_string(worktree.join(file_name)).ok()
}
