mod common;

use chrono::Utc;
use common::init_repo;
use ralph_command_center::config::ServerConfig;
use ralph_command_center::control::ControlPlane;
use ralph_command_center::errors::AppError;
use ralph_command_center::models::{
    CreateAutomationPayload, CreateCommentPayload, CreateThreadPayload, EventKind,
    RunControlAction, RunStatus, StartRunPayload,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{sleep, Duration};

fn plane_config(state_dir: &TempDir, max_concurrent: usize) -> ServerConfig {
    ServerConfig {
        db_path: state_dir.path().join("state.sqlite"),
        host: "127.0.0.1".to_string(),
        port: 0,
        max_concurrent,
    }
}

async fn make_thread(
    plane: &Arc<ControlPlane>,
    repo: &TempDir,
    validate: Vec<String>,
) -> ralph_command_center::models::ThreadRecord {
    plane
        .create_thread(CreateThreadPayload {
            name: "fixture".to_string(),
            task: "drive the fixture repo to green".to_string(),
            repo_path: repo.path().display().to_string(),
            agent: Some("claude".to_string()),
            validate: Some(validate),
        })
        .await
        .expect("create thread")
}

async fn wait_terminal(plane: &Arc<ControlPlane>, run_id: &str) {
    for _ in 0..300 {
        let run = plane.get_run(run_id).expect("get run");
        if run.status.is_terminal() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}

#[cfg(unix)]
#[tokio::test]
async fn pause_resume_stop_lifecycle_for_a_pending_run() {
    common::install_agent_shims();
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");

    // The blocker's baseline validation holds the single slot long enough for
    // the second run to stay pending.
    let thread = make_thread(&plane, &repo, vec!["sleep 1".to_string()]).await;
    let blocker = plane
        .start_run(
            &thread.id,
            StartRunPayload {
                max_iterations: Some(1),
                ..Default::default()
            },
        )
        .expect("blocker run");
    let waiting = plane
        .start_run(&thread.id, StartRunPayload::default())
        .expect("waiting run");

    let paused = plane
        .control_run(&waiting.id, RunControlAction::Pause)
        .expect("pause");
    assert_eq!(paused.status, RunStatus::Paused);

    // Pausing anything not pending is an illegal transition.
    let again = plane.control_run(&waiting.id, RunControlAction::Pause);
    assert!(matches!(again, Err(AppError::Conflict(_))));
    let running_pause = plane.control_run(&blocker.id, RunControlAction::Pause);
    assert!(matches!(running_pause, Err(AppError::Conflict(_))));

    let resumed = plane
        .control_run(&waiting.id, RunControlAction::Resume)
        .expect("resume");
    assert_eq!(resumed.status, RunStatus::Queued);

    let stopped = plane
        .control_run(&waiting.id, RunControlAction::Stop)
        .expect("stop");
    assert_eq!(stopped.status, RunStatus::Cancelled);
    assert!(stopped.finished_at.is_some());

    let _ = plane.control_run(&blocker.id, RunControlAction::Stop);
    wait_terminal(&plane, &blocker.id).await;

    let events = plane.thread_events(&thread.id, None).expect("events");
    let for_waiting = |kind: EventKind| {
        events
            .iter()
            .filter(|event| event.kind == kind && event.run_id.as_deref() == Some(&waiting.id))
            .count()
    };
    assert_eq!(for_waiting(EventKind::RunPaused), 1);
    assert_eq!(for_waiting(EventKind::RunResumed), 1);
    assert_eq!(for_waiting(EventKind::RunCancelled), 1);
    assert_eq!(for_waiting(EventKind::RunStarted), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn stopping_a_running_run_cancels_it() {
    common::install_agent_shims();
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");

    let thread = make_thread(&plane, &repo, vec!["sleep 2".to_string()]).await;
    let run = plane
        .start_run(
            &thread.id,
            StartRunPayload {
                max_iterations: Some(5),
                ..Default::default()
            },
        )
        .expect("run");

    // Let the executor pick it up, then stop it mid-flight.
    sleep(Duration::from_millis(200)).await;
    let _ = plane.control_run(&run.id, RunControlAction::Stop);
    wait_terminal(&plane, &run.id).await;

    let settled = plane.get_run(&run.id).expect("get run");
    assert_eq!(settled.status, RunStatus::Cancelled);

    // Terminal runs accept no further control actions except retry.
    let stop_again = plane.control_run(&run.id, RunControlAction::Stop);
    assert!(matches!(stop_again, Err(AppError::Conflict(_))));

    let retried = plane
        .control_run(&run.id, RunControlAction::Retry)
        .expect("retry");
    assert_eq!(retried.status, RunStatus::Queued);
    assert_eq!(retried.source_run_id.as_deref(), Some(run.id.as_str()));
    let _ = plane.control_run(&retried.id, RunControlAction::Stop);
    wait_terminal(&plane, &retried.id).await;
    plane.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn exhausted_run_fails_with_the_documented_error() {
    common::install_agent_shims();
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");

    // The shimmed agent CLI exits 1 every iteration and the validation never
    // passes, so the run must exhaust its budget.
    let thread = make_thread(&plane, &repo, vec!["test -f never.txt".to_string()]).await;
    let run = plane
        .start_run(
            &thread.id,
            StartRunPayload {
                max_iterations: Some(2),
                ..Default::default()
            },
        )
        .expect("run");

    wait_terminal(&plane, &run.id).await;
    let settled = plane.get_run(&run.id).expect("get run");
    assert_eq!(settled.status, RunStatus::Failed);
    assert_eq!(settled.error.as_deref(), Some("Loop ended before completion"));
    assert_eq!(settled.iterations, 2);

    let events = plane.thread_events(&thread.id, None).expect("events");
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::RunFailed
            && event.payload["message"] == "Loop ended before completion"));
}

#[cfg(unix)]
#[tokio::test]
async fn feedback_rerun_folds_comments_and_marks_them_applied() {
    common::install_agent_shims();
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");

    let thread = make_thread(&plane, &repo, vec![]).await;
    let first = plane
        .create_comment(
            &thread.id,
            CreateCommentPayload {
                run_id: None,
                file_path: "src/a.ts".to_string(),
                line_number: 10,
                body: "rename".to_string(),
            },
        )
        .expect("first comment");
    let second = plane
        .create_comment(
            &thread.id,
            CreateCommentPayload {
                run_id: None,
                file_path: "src/a.ts".to_string(),
                line_number: 22,
                body: "extract helper".to_string(),
            },
        )
        .expect("second comment");

    let rerun = plane
        .rerun_from_comments(&thread.id, &[first.id.clone(), second.id.clone()])
        .expect("rerun");

    let override_text = rerun.task_override.expect("task override");
    let first_at = override_text
        .find("1. src/a.ts:10 - rename")
        .expect("first folded entry");
    let second_at = override_text
        .find("2. src/a.ts:22 - extract helper")
        .expect("second folded entry");
    assert!(first_at < second_at);
    assert!(override_text.contains("Address the following review feedback"));

    for comment in plane.list_comments(&thread.id).expect("comments") {
        assert_eq!(
            comment.status,
            ralph_command_center::models::CommentStatus::Applied
        );
    }

    let events = plane.thread_events(&thread.id, None).expect("events");
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::ReviewRerunQueued));
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::RunQueued
            && event.run_id.as_deref() == Some(&rerun.id)));

    // Comments from another thread never cross the tenant boundary.
    let other_repo = TempDir::new().expect("repo dir");
    init_repo(other_repo.path());
    let other = make_thread(&plane, &other_repo, vec![]).await;
    let cross = plane.rerun_from_comments(&other.id, &[first.id.clone()]);
    assert!(matches!(cross, Err(AppError::Input(_))));

    let _ = plane.control_run(&rerun.id, RunControlAction::Stop);
    wait_terminal(&plane, &rerun.id).await;
    plane.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn automation_fires_at_most_once_per_minute_bucket() {
    common::install_agent_shims();
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");

    let thread = make_thread(&plane, &repo, vec![]).await;
    let automation = plane
        .create_automation(CreateAutomationPayload {
            name: "keep-green".to_string(),
            cron: "* * * * *".to_string(),
            thread_id: thread.id.clone(),
            max_iterations: Some(1),
            enabled: Some(true),
        })
        .expect("automation");

    let runs_on_thread = |plane: &Arc<ControlPlane>| {
        plane
            .list_threads()
            .expect("threads")
            .into_iter()
            .find(|detail| detail.thread.id == thread.id)
            .map(|detail| detail.runs.len())
            .unwrap_or(0)
    };

    let now = Utc::now();
    plane.automation_tick(now).expect("first tick");
    plane.automation_tick(now).expect("same-bucket tick");
    assert_eq!(runs_on_thread(&plane), 1);

    let next_minute = now + chrono::Duration::minutes(1);
    plane.automation_tick(next_minute).expect("next bucket");
    assert_eq!(runs_on_thread(&plane), 2);

    plane
        .toggle_automation(&automation.id, false)
        .expect("disable");
    plane
        .automation_tick(next_minute + chrono::Duration::minutes(1))
        .expect("disabled tick");
    assert_eq!(runs_on_thread(&plane), 2);

    // Manual trigger ignores both the cron match and the bucket guard.
    let manual = plane
        .trigger_automation_now(&automation.id)
        .expect("manual trigger");
    assert_eq!(runs_on_thread(&plane), 3);

    for detail in plane.list_threads().expect("threads") {
        for run in detail.runs {
            if !run.status.is_terminal() {
                let _ = plane.control_run(&run.id, RunControlAction::Stop);
                wait_terminal(&plane, &run.id).await;
            }
        }
    }
    assert!(plane.get_run(&manual.id).expect("manual run").status.is_terminal());
    plane.shutdown();
}

#[tokio::test]
async fn bad_cron_expressions_are_rejected_at_creation() {
    let repo = TempDir::new().expect("repo dir");
    init_repo(repo.path());
    let state = TempDir::new().expect("state dir");
    let plane = ControlPlane::new(&plane_config(&state, 1)).expect("plane");
    let thread = make_thread(&plane, &repo, vec![]).await;

    for bad in ["*/5 * * * *", "1-3 * * * *", "* * * *", "mon * * * *"] {
        let result = plane.create_automation(CreateAutomationPayload {
            name: "bad".to_string(),
            cron: bad.to_string(),
            thread_id: thread.id.clone(),
            max_iterations: None,
            enabled: Some(false),
        });
        assert!(matches!(result, Err(AppError::Input(_))), "accepted: {bad}");
    }
}
