use super::Agent;
use crate::process::SpawnSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WorkspaceWrite => "workspace-write",
            Self::DangerFullAccess => "danger-full-access",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexOptions {
    pub model: Option<String>,
    #[serde(default)]
    pub additional_flags: Vec<String>,
    pub sandbox: Option<SandboxMode>,
}

#[derive(Debug, Default)]
pub struct CodexAgent {
    options: CodexOptions,
}

impl CodexAgent {
    pub fn new(options: CodexOptions) -> Self {
        Self { options }
    }
}

impl Agent for CodexAgent {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn display_name(&self) -> &'static str {
        "Codex CLI"
    }

    fn cli_program(&self) -> &str {
        "codex"
    }

    fn build_command(&self, prompt: &str, cwd: &Path) -> SpawnSpec {
        let mut args = vec!["exec".to_string()];

        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        let sandbox = self.options.sandbox.unwrap_or(SandboxMode::WorkspaceWrite);
        args.push("--sandbox".to_string());
        args.push(sandbox.as_str().to_string());
        args.push("--skip-git-repo-check".to_string());
        args.extend(self.options.additional_flags.iter().cloned());
        args.push(prompt.to_string());

        SpawnSpec {
            program: self.cli_program().to_string(),
            args,
            cwd: cwd.to_path_buf(),
            env: BTreeMap::new(),
        }
    }
}
