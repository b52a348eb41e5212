#![allow(dead_code)]

use ralph_command_center::adapters::Agent;
use ralph_command_center::models::EventKind;
use ralph_command_center::process::SpawnSpec;
use ralph_command_center::run_loop::EventSink;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

pub fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.email", "tests@example.com"]);
    git(dir, &["config", "user.name", "Test Harness"]);
    std::fs::write(dir.join("README.md"), "fixture repo\n").expect("write readme");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "-m", "initial"]);
}

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {:?} failed in {}", args, dir.display());
}

pub fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/mock-agent.sh")
}

/// Test double for the agent seam: runs the shell fixture via bash with the
/// per-test behavior directory wired through the environment.
pub struct MockAgent {
    pub state_dir: PathBuf,
}

impl Agent for MockAgent {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock Agent"
    }

    fn cli_program(&self) -> &str {
        "bash"
    }

    fn build_command(&self, prompt: &str, cwd: &Path) -> SpawnSpec {
        let mut env = BTreeMap::new();
        env.insert(
            "MOCK_AGENT_DIR".to_string(),
            self.state_dir.display().to_string(),
        );
        SpawnSpec {
            program: "bash".to_string(),
            args: vec![fixture_path().display().to_string(), prompt.to_string()],
            cwd: cwd.to_path_buf(),
            env,
        }
    }
}

/// Put inert `claude`/`codex`/`opencode` shims first on PATH so control-plane
/// tests never invoke a real agent CLI that happens to be installed. The shim
/// directory lives for the whole test process.
#[cfg(unix)]
pub fn install_agent_shims() {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    static SHIMS: OnceLock<tempfile::TempDir> = OnceLock::new();
    SHIMS.get_or_init(|| {
        let dir = tempfile::TempDir::new().expect("shim dir");
        for name in ["claude", "codex", "opencode"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "#!/bin/sh\nexit 1\n").expect("write shim");
            let mut perms = std::fs::metadata(&path).expect("shim metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod shim");
        }
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), old_path));
        dir
    });
}

pub type EventLog = Arc<Mutex<Vec<(EventKind, serde_json::Value)>>>;

pub fn recording_sink() -> (EventSink, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let writer = log.clone();
    let sink: EventSink = Arc::new(move |kind, payload| {
        writer.lock().expect("event log lock").push((kind, payload));
    });
    (sink, log)
}

pub fn count_kind(log: &EventLog, kind: EventKind) -> usize {
    log.lock()
        .expect("event log lock")
        .iter()
        .filter(|(recorded, _)| *recorded == kind)
        .count()
}
