use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_BUFFERED_OUTPUT_BYTES: usize = 2 * 1024 * 1024;
const MAX_BUFFERED_OUTPUT_LINES: usize = 4_000;

/// Cooperative cancellation signal shared between the queue, the loop, and
/// every subprocess the loop spawns.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Fully resolved child invocation: explicit program + argv, no shell.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Default)]
struct OutputBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
}

impl OutputBuffer {
    fn push(&mut self, line: String) {
        let line_len = line.len();
        self.lines.push_back(line);
        self.total_bytes = self.total_bytes.saturating_add(line_len);

        while self.lines.len() > MAX_BUFFERED_OUTPUT_LINES
            || self.total_bytes > MAX_BUFFERED_OUTPUT_BYTES
        {
            if let Some(removed) = self.lines.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(removed.len());
            } else {
                break;
            }
        }
    }

    fn joined(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run an explicit argv command. Never returns an error: spawn failures,
/// timeouts, and cancellations are all folded into the outcome record.
pub async fn run_spawn(
    spec: &SpawnSpec,
    timeout: Option<Duration>,
    cancel: Option<&CancelHandle>,
) -> CommandOutcome {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    run_prepared(command, timeout, cancel).await
}

/// Run a command line through the shell. Reserved for validator commands,
/// where pipes and `&&` are part of the contract.
pub async fn run_shell(
    command_line: &str,
    cwd: &Path,
    cancel: Option<&CancelHandle>,
) -> CommandOutcome {
    let mut command = shell_command(command_line);
    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    run_prepared(command, None, cancel).await
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

async fn run_prepared(
    mut command: Command,
    timeout: Option<Duration>,
    cancel: Option<&CancelHandle>,
) -> CommandOutcome {
    let start = Instant::now();

    if let Some(handle) = cancel {
        if handle.is_cancelled() {
            return CommandOutcome {
                stdout: String::new(),
                stderr: "Cancelled before spawn".to_string(),
                exit_code: 1,
                elapsed_ms: 0,
            };
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            return CommandOutcome {
                stdout: String::new(),
                stderr: error.to_string(),
                exit_code: 1,
                elapsed_ms: elapsed_ms(start),
            };
        }
    };

    let stdout_buffer = Arc::new(Mutex::new(OutputBuffer::default()));
    let stderr_buffer = Arc::new(Mutex::new(OutputBuffer::default()));

    let stdout_task = child.stdout.take().map(|stream| {
        let buffer = stdout_buffer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().await.push(line);
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stream| {
        let buffer = stderr_buffer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.lock().await.push(line);
            }
        })
    });

    let cancel_wait = async {
        match cancel {
            Some(handle) => handle.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline_wait = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    enum WaitDisposition {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled,
        TimedOut,
    }

    let disposition = tokio::select! {
        status = child.wait() => WaitDisposition::Exited(status),
        _ = cancel_wait => WaitDisposition::Cancelled,
        _ = deadline_wait => WaitDisposition::TimedOut,
    };

    let mut cancelled = false;
    let mut timed_out = false;
    let status = match disposition {
        WaitDisposition::Exited(status) => status,
        WaitDisposition::Cancelled => {
            cancelled = true;
            let _ = child.start_kill();
            child.wait().await
        }
        WaitDisposition::TimedOut => {
            timed_out = true;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let mut exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    if (cancelled || timed_out) && exit_code == 0 {
        exit_code = 1;
    }

    let stdout = stdout_buffer.lock().await.joined();
    let mut stderr = stderr_buffer.lock().await.joined();
    if timed_out {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str("Process timed out");
    } else if cancelled {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str("Process cancelled");
    }

    CommandOutcome {
        stdout,
        stderr,
        exit_code,
        elapsed_ms: elapsed_ms(start),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
