use crate::errors::{AppError, AppResult};
use crate::process::{self, CommandOutcome, SpawnSpec};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// An isolated checkout bound to one thread.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub repo_root: PathBuf,
    pub worktree_path: PathBuf,
    pub branch_name: String,
}

/// Create the per-thread worktree and branch. Not idempotent: a second call
/// for the same thread produces a second worktree.
pub async fn provision(repo_path: &Path, thread_id: &str) -> AppResult<Worktree> {
    let probe = git_in(repo_path, &["rev-parse", "--show-toplevel"]).await;
    if !probe.success() {
        return Err(AppError::Input(format!(
            "Not a git repository: {}",
            repo_path.display()
        )));
    }
    let repo_root = PathBuf::from(probe.stdout.trim());

    let short_id = short_thread_id(thread_id);
    let branch = format!("ralph/thread-{short_id}");
    let path = repo_root.join(".ralph").join("worktrees").join(&short_id);

    let first = add_worktree(&repo_root, &branch, &path).await;
    if first.success() {
        return Ok(Worktree {
            repo_root,
            worktree_path: path,
            branch_name: branch,
        });
    }

    // Path or branch collision from an earlier thread with the same prefix;
    // retry once with a timestamp suffix on both.
    let suffix = Utc::now().timestamp();
    let branch = format!("{branch}-{suffix}");
    let path = repo_root
        .join(".ralph")
        .join("worktrees")
        .join(format!("{short_id}-{suffix}"));

    let second = add_worktree(&repo_root, &branch, &path).await;
    if second.success() {
        return Ok(Worktree {
            repo_root,
            worktree_path: path,
            branch_name: branch,
        });
    }

    Err(AppError::Worktree(second.stderr.trim().to_string()))
}

async fn add_worktree(repo_root: &Path, branch: &str, path: &Path) -> CommandOutcome {
    let path_arg = path.to_string_lossy().to_string();
    git_in(repo_root, &["worktree", "add", "-b", branch, &path_arg]).await
}

/// Derive the filesystem-safe short form of a thread id: alphanumerics only,
/// lowercased, at most 10 chars. A degenerate id falls back to `thread`.
pub fn short_thread_id(thread_id: &str) -> String {
    let cleaned: String = thread_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .take(10)
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        "thread".to_string()
    } else {
        cleaned
    }
}

async fn git_in(workdir: &Path, args: &[&str]) -> CommandOutcome {
    let spec = SpawnSpec {
        program: "git".to_string(),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        cwd: workdir.to_path_buf(),
        env: BTreeMap::new(),
    };
    process::run_spawn(&spec, None, None).await
}

/// Thin argv-only wrapper over the `git` CLI, scoped to one working
/// directory. Messages and paths are always passed as single arguments.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub async fn head_sha(&self) -> AppResult<String> {
        let out = self.run_checked(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Stage everything and commit. Returns false (without erroring) when
    /// there is nothing to commit.
    pub async fn commit_all(&self, message: &str) -> AppResult<bool> {
        self.run_checked(&["add", "-A"]).await?;
        let staged = self.run_checked(&["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message]).await?;
        Ok(true)
    }

    /// Restore all tracked files from HEAD and remove untracked files and
    /// directories. Total: afterwards the tree equals HEAD.
    pub async fn revert_to_head(&self) -> AppResult<()> {
        self.run_checked(&["checkout", "HEAD", "--", "."]).await?;
        self.run_checked(&["clean", "-fd"]).await?;
        Ok(())
    }

    pub async fn diff(&self) -> AppResult<String> {
        self.run_checked(&["diff", "--no-color", "HEAD"]).await
    }

    pub async fn log_oneline(&self, limit: u32) -> AppResult<String> {
        let count = format!("-{limit}");
        self.run_checked(&["log", "--oneline", &count]).await
    }

    async fn run_checked(&self, args: &[&str]) -> AppResult<String> {
        let outcome = git_in(&self.workdir, args).await;
        if !outcome.success() {
            return Err(AppError::Worktree(format!(
                "git {} failed: {}",
                args.join(" "),
                outcome.stderr.trim()
            )));
        }
        Ok(outcome.stdout)
    }
}
