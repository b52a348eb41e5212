use crate::process::{self, CancelHandle};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub command: String,
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
    pub pass_count: usize,
    pub total_count: usize,
    pub all_passed: bool,
}

impl ValidationReport {
    pub fn from_results(results: Vec<ValidationResult>) -> Self {
        let pass_count = results.iter().filter(|result| result.passed).count();
        let total_count = results.len();
        Self {
            pass_count,
            total_count,
            all_passed: pass_count == total_count,
            results,
        }
    }

    /// The loop's score: count of passing commands, higher is better.
    pub fn score(&self) -> usize {
        self.pass_count
    }
}

/// Run the validation commands in order, each through the shell so pipes and
/// `&&` work. Commands run to completion; there is no per-command timeout.
pub async fn run_validations(
    commands: &[String],
    cwd: &Path,
    cancel: Option<&CancelHandle>,
) -> ValidationReport {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let outcome = process::run_shell(command, cwd, cancel).await;
        results.push(ValidationResult {
            command: command.clone(),
            passed: outcome.success(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            elapsed_ms: outcome.elapsed_ms,
        });
    }
    ValidationReport::from_results(results)
}

const TRUNCATION_SENTINEL: &str = "...(truncated)\n";

/// Render the failing commands into the block fed back to the agent on the
/// next iteration. All-pass reports render as the empty string. When the
/// rendered text exceeds `max_chars`, the tail is kept (error output is most
/// useful near the end) behind the truncation sentinel.
pub fn failure_context(report: &ValidationReport, max_chars: usize) -> String {
    let mut text = String::new();
    for result in report.results.iter().filter(|result| !result.passed) {
        let body = if result.stderr.is_empty() {
            result.stdout.as_str()
        } else {
            result.stderr.as_str()
        };
        let _ = writeln!(
            text,
            "### {} (FAILED (exit code {}))",
            result.command, result.exit_code
        );
        let _ = writeln!(text, "```");
        let _ = writeln!(text, "{}", body.trim_end());
        let _ = writeln!(text, "```");
        let _ = writeln!(text);
    }

    let total_chars = text.chars().count();
    if total_chars <= max_chars {
        return text;
    }

    let keep = max_chars.saturating_sub(TRUNCATION_SENTINEL.chars().count());
    let tail: String = text.chars().skip(total_chars - keep).collect();
    format!("{TRUNCATION_SENTINEL}{tail}")
}

#[cfg(test)]
mod tests {
    use super::{failure_context, ValidationReport, ValidationResult};

    fn result(command: &str, passed: bool, stdout: &str, stderr: &str) -> ValidationResult {
        ValidationResult {
            command: command.to_string(),
            passed,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: if passed { 0 } else { 1 },
            elapsed_ms: 1,
        }
    }

    #[test]
    fn score_counts_passing_commands() {
        let report = ValidationReport::from_results(vec![
            result("a", true, "", ""),
            result("b", false, "", "boom"),
            result("c", true, "", ""),
        ]);
        assert_eq!(report.score(), 2);
        assert_eq!(report.total_count, 3);
        assert!(!report.all_passed);
    }

    #[test]
    fn all_pass_renders_empty_context() {
        let report =
            ValidationReport::from_results(vec![result("a", true, "ok", ""), result("b", true, "", "")]);
        assert!(report.all_passed);
        assert_eq!(failure_context(&report, 1000), "");
    }

    #[test]
    fn failing_commands_prefer_stderr_over_stdout() {
        let report = ValidationReport::from_results(vec![
            result("cargo test", false, "stdout noise", "assertion failed"),
            result("cargo clippy", false, "warning output", ""),
        ]);
        let context = failure_context(&report, 10_000);
        assert!(context.contains("### cargo test (FAILED (exit code 1))"));
        assert!(context.contains("assertion failed"));
        assert!(!context.contains("stdout noise"));
        assert!(context.contains("warning output"));
    }

    #[test]
    fn truncation_keeps_the_tail_under_the_cap() {
        let long_output = "x".repeat(500) + "THE_END";
        let report = ValidationReport::from_results(vec![result("t", false, "", &long_output)]);
        let context = failure_context(&report, 120);
        assert!(context.starts_with("...(truncated)\n"));
        assert!(context.contains("THE_END"));
        assert!(context.chars().count() <= 120);
    }
}
