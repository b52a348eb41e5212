use super::Agent;
use crate::process::SpawnSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeOptions {
    pub model: Option<String>,
    #[serde(default)]
    pub additional_flags: Vec<String>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ClaudeAgent {
    options: ClaudeOptions,
}

impl ClaudeAgent {
    pub fn new(options: ClaudeOptions) -> Self {
        Self { options }
    }
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn cli_program(&self) -> &str {
        "claude"
    }

    fn build_command(&self, prompt: &str, cwd: &Path) -> SpawnSpec {
        let mut args = vec!["-p".to_string()];

        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(max_turns) = self.options.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        args.extend(self.options.additional_flags.iter().cloned());
        args.push(prompt.to_string());

        let mut env = BTreeMap::new();
        env.insert("CLAUDE_NON_INTERACTIVE".to_string(), "1".to_string());

        SpawnSpec {
            program: self.cli_program().to_string(),
            args,
            cwd: cwd.to_path_buf(),
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Agent, ClaudeAgent, ClaudeOptions};
    use std::path::Path;

    #[test]
    fn builds_print_mode_argv_with_model_and_turn_cap() {
        let agent = ClaudeAgent::new(ClaudeOptions {
            model: Some("sonnet".to_string()),
            additional_flags: vec!["--verbose".to_string()],
            max_turns: Some(25),
        });
        let spec = agent.build_command("fix the tests", Path::new("/work"));

        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args[0], "-p");
        assert!(spec.args.contains(&"--model".to_string()));
        assert!(spec.args.contains(&"sonnet".to_string()));
        assert!(spec.args.contains(&"--max-turns".to_string()));
        assert!(spec.args.contains(&"--verbose".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("fix the tests"));
        assert_eq!(spec.env.get("CLAUDE_NON_INTERACTIVE").map(String::as_str), Some("1"));
    }

    #[test]
    fn default_options_stay_minimal() {
        let agent = ClaudeAgent::default();
        let spec = agent.build_command("p", Path::new("/work"));
        assert_eq!(spec.args, vec!["-p".to_string(), "p".to_string()]);
    }
}
