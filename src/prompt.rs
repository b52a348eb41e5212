use std::fmt::Write as _;

/// Position of the thread's task inside a larger planned project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrdContext {
    pub task_id: String,
    pub task_index: u32,
    pub task_total: u32,
    pub project_name: String,
    pub project_description: String,
    pub acceptance_criteria: Vec<String>,
    pub completed_summary: Option<String>,
}

/// Everything the prompt is assembled from. Equal contexts produce
/// byte-identical prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub task: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub progress: Option<String>,
    pub validate_commands: Vec<String>,
    pub completion_secret: String,
    pub progress_file: String,
    pub last_failure_output: Option<String>,
    pub was_reverted: bool,
    pub prd: Option<PrdContext>,
}

pub fn build_prompt(ctx: &PromptContext) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "You are working on the following task:");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", ctx.task.trim_end());
    let _ = writeln!(out);

    if let Some(prd) = &ctx.prd {
        let _ = writeln!(
            out,
            "## Project: {} (task {} of {})",
            prd.project_name, prd.task_index, prd.task_total
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", prd.project_description.trim_end());
        let _ = writeln!(out);
        if !prd.acceptance_criteria.is_empty() {
            let _ = writeln!(out, "Acceptance criteria:");
            for criterion in &prd.acceptance_criteria {
                let _ = writeln!(out, "- {}", criterion);
            }
            let _ = writeln!(out);
        }
        if let Some(summary) = &prd.completed_summary {
            let _ = writeln!(out, "Previously completed tasks:");
            let _ = writeln!(out, "{}", summary.trim_end());
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "## Rules");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "- This is iteration {} of {}.",
        ctx.iteration, ctx.max_iterations
    );
    let _ = writeln!(
        out,
        "- Keep notes for your future self in `{}`; it is the only memory that survives between iterations. Update it before you finish.",
        ctx.progress_file
    );
    let _ = writeln!(out, "- Your work is checked by running, in order:");
    for (index, command) in ctx.validate_commands.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", index + 1, command);
    }
    let _ = writeln!(out, "- Do not weaken or delete the checks.");
    let _ = writeln!(out);

    match &ctx.progress {
        Some(progress) => {
            let _ = writeln!(out, "## Progress so far");
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", progress.trim_end());
            let _ = writeln!(out);
        }
        None => {
            let _ = writeln!(
                out,
                "This is the first iteration; no progress notes exist yet."
            );
            let _ = writeln!(out);
        }
    }

    if ctx.was_reverted {
        let _ = writeln!(
            out,
            "Warning: your previous iteration made the checks worse and was reverted. The workspace is back at the last good state; take a different approach."
        );
        let _ = writeln!(out);
    }

    if let Some(failure) = &ctx.last_failure_output {
        if !failure.is_empty() {
            let _ = writeln!(out, "## Output of the checks that failed last time");
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", failure.trim_end());
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(
        out,
        "When the task is fully done and you expect every check to pass, print the following token by itself as the final line of your output:"
    );
    let _ = writeln!(out);
    let _ = write!(out, "{}", ctx.completion_secret);

    out
}
