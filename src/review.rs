use crate::models::ReviewCommentRecord;
use std::fmt::Write as _;

pub const FEEDBACK_HEADER: &str =
    "Address the following review feedback before declaring completion:";

/// Fold selected comments into the task override for a feedback rerun. The
/// list keeps the submission order.
pub fn build_feedback_task(base_task: &str, comments: &[ReviewCommentRecord]) -> String {
    let mut out = String::new();
    out.push_str(base_task.trim_end());
    out.push_str("\n\n");
    out.push_str(FEEDBACK_HEADER);
    for (index, comment) in comments.iter().enumerate() {
        let _ = write!(
            out,
            "\n{}. {}:{} - {}",
            index + 1,
            comment.file_path,
            comment.line_number,
            comment.body
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{build_feedback_task, FEEDBACK_HEADER};
    use crate::models::{CommentStatus, ReviewCommentRecord};
    use chrono::Utc;

    fn comment(path: &str, line: u32, body: &str) -> ReviewCommentRecord {
        ReviewCommentRecord {
            id: format!("c-{path}-{line}"),
            thread_id: "t1".to_string(),
            run_id: None,
            file_path: path.to_string(),
            line_number: line,
            body: body.to_string(),
            status: CommentStatus::Open,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn folds_comments_in_submission_order() {
        let task = build_feedback_task(
            "Implement the widget",
            &[
                comment("src/a.ts", 10, "rename"),
                comment("src/a.ts", 22, "extract helper"),
            ],
        );

        assert!(task.starts_with("Implement the widget\n\n"));
        assert!(task.contains(FEEDBACK_HEADER));
        let first = task.find("1. src/a.ts:10 - rename").expect("first entry");
        let second = task
            .find("2. src/a.ts:22 - extract helper")
            .expect("second entry");
        assert!(first < second);
    }

    #[test]
    fn header_sits_after_a_blank_line() {
        let task = build_feedback_task("Base task", &[comment("f.rs", 1, "x")]);
        assert!(task.contains(&format!("Base task\n\n{FEEDBACK_HEADER}")));
    }
}
