mod common;

use common::{count_kind, fixture_path, git, init_repo, recording_sink, MockAgent};
use ralph_command_center::models::EventKind;
use ralph_command_center::process::CancelHandle;
use ralph_command_center::run_loop::{run_loop, LoopConfig};
use ralph_command_center::worktree::{provision, Git};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

#[test]
fn fixture_script_exists() {
    assert!(fixture_path().exists());
}

fn loop_config(
    worktree: &Path,
    state_dir: &Path,
    validate: Vec<String>,
    max_iterations: u32,
) -> LoopConfig {
    LoopConfig {
        worktree_path: worktree.to_path_buf(),
        task: "drive the fixture repo to green".to_string(),
        validate_commands: validate,
        max_iterations,
        progress_file: "ralph-progress-test.md".to_string(),
        failure_context_chars: 4_000,
        git_checkpoints: true,
        agent: Arc::new(MockAgent {
            state_dir: state_dir.to_path_buf(),
        }),
        dry_run: false,
        iteration_delay: Duration::ZERO,
        prd: None,
    }
}

fn write_behavior(state_dir: &Path, iteration: u32, script: &str) {
    std::fs::write(state_dir.join(format!("{iteration}.sh")), script).expect("write behavior");
}

#[cfg(unix)]
#[tokio::test]
async fn happy_path_completes_on_first_iteration() {
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let worktree = provision(repo.path(), "happy-thread").await.expect("worktree");

    let state = TempDir::new().expect("state dir");
    write_behavior(
        state.path(),
        1,
        "echo ok > done.txt\nprintf '%s\\n' \"$RALPH_SECRET\"\n",
    );

    let (sink, log) = recording_sink();
    let config = loop_config(
        &worktree.worktree_path,
        state.path(),
        vec![
            "test -f done.txt".to_string(),
            "grep -q ok done.txt".to_string(),
        ],
        3,
    );

    let outcome = run_loop(&config, &CancelHandle::new(), &sink)
        .await
        .expect("loop");

    assert!(outcome.success);
    assert_eq!(outcome.iterations, 1);
    assert!(!outcome.cancelled);

    assert_eq!(count_kind(&log, EventKind::LoopIterationStarted), 1);
    assert_eq!(count_kind(&log, EventKind::LoopAgentSpawned), 1);
    assert_eq!(count_kind(&log, EventKind::LoopValidationCompleted), 1);
    assert_eq!(count_kind(&log, EventKind::LoopRegressionReverted), 0);

    let history = Git::new(&worktree.worktree_path)
        .log_oneline(5)
        .await
        .expect("log");
    assert!(history.contains("ralph: task complete (iteration 1)"));
}

#[cfg(unix)]
#[tokio::test]
async fn regression_is_reverted_then_recovered() {
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    std::fs::write(repo.path().join("value.txt"), "good\n").expect("seed file");
    git(repo.path(), &["add", "-A"]);
    git(repo.path(), &["commit", "--quiet", "-m", "seed value"]);
    let worktree = provision(repo.path(), "regress-thread").await.expect("worktree");

    let state = TempDir::new().expect("state dir");
    // Iteration 1 breaks the seeded file: 0/2 against a baseline of 1/2.
    write_behavior(state.path(), 1, "echo bad > value.txt\n");
    // Iteration 2 repairs forward and claims completion.
    write_behavior(
        state.path(),
        2,
        "echo ok > extra.txt\nprintf '%s\\n' \"$RALPH_SECRET\"\n",
    );

    let (sink, log) = recording_sink();
    let config = loop_config(
        &worktree.worktree_path,
        state.path(),
        vec![
            "grep -q good value.txt".to_string(),
            "test -f extra.txt".to_string(),
        ],
        5,
    );

    let outcome = run_loop(&config, &CancelHandle::new(), &sink)
        .await
        .expect("loop");

    assert!(outcome.success);
    assert_eq!(outcome.iterations, 2);

    assert_eq!(count_kind(&log, EventKind::LoopRegressionReverted), 1);
    assert_eq!(count_kind(&log, EventKind::LoopIterationStarted), 2);

    // The revert was total: the seeded content survived iteration 1.
    let value = std::fs::read_to_string(worktree.worktree_path.join("value.txt"))
        .expect("read value.txt");
    assert_eq!(value, "good\n");
    assert!(worktree.worktree_path.join("extra.txt").exists());

    let history = Git::new(&worktree.worktree_path)
        .log_oneline(5)
        .await
        .expect("log");
    assert!(history.contains("ralph: task complete (iteration 2)"));
}

#[cfg(unix)]
#[tokio::test]
async fn exhaustion_consumes_the_full_budget() {
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let worktree = provision(repo.path(), "exhaust-thread").await.expect("worktree");

    // No behavior scripts: the agent runs and changes nothing.
    let state = TempDir::new().expect("state dir");

    let (sink, log) = recording_sink();
    let config = loop_config(
        &worktree.worktree_path,
        state.path(),
        vec!["test -f never.txt".to_string()],
        3,
    );

    let outcome = run_loop(&config, &CancelHandle::new(), &sink)
        .await
        .expect("loop");

    assert!(!outcome.success);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(count_kind(&log, EventKind::LoopIterationStarted), 3);
    assert_eq!(count_kind(&log, EventKind::LoopValidationCompleted), 3);
}

#[cfg(unix)]
#[tokio::test]
async fn cancellation_is_observed_at_the_iteration_boundary() {
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let worktree = provision(repo.path(), "cancel-thread").await.expect("worktree");

    let state = TempDir::new().expect("state dir");
    write_behavior(state.path(), 1, "sleep 30\n");

    let (sink, _log) = recording_sink();
    let mut config = loop_config(&worktree.worktree_path, state.path(), vec![], 3);
    config.git_checkpoints = false;

    let cancel = CancelHandle::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        signal.cancel();
    });

    let outcome = run_loop(&config, &cancel, &sink).await.expect("loop");

    assert!(outcome.cancelled);
    assert!(!outcome.success);
    assert_eq!(outcome.iterations, 1);
}
