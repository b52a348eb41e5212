pub mod claude;
pub mod codex;
pub mod opencode;

use crate::errors::{AppError, AppResult};
use crate::process::SpawnSpec;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// One driveable agent CLI. `build_command` translates a prompt and a
/// workspace directory into a concrete argv; the prompt is always the final
/// positional argument and nothing passes through a shell.
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn cli_program(&self) -> &str;
    fn build_command(&self, prompt: &str, cwd: &Path) -> SpawnSpec;
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("name", &self.name()).finish()
    }
}

/// Options recognized per adapter, selected by agent name.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "agent", rename_all = "kebab-case")]
pub enum AgentOptions {
    Claude(claude::ClaudeOptions),
    Codex(codex::CodexOptions),
    Opencode(opencode::OpencodeOptions),
}

#[derive(Clone)]
pub struct AgentRegistry {
    claude: Arc<dyn Agent>,
    codex: Arc<dyn Agent>,
    opencode: Arc<dyn Agent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            claude: Arc::new(claude::ClaudeAgent::default()),
            codex: Arc::new(codex::CodexAgent::default()),
            opencode: Arc::new(opencode::OpencodeAgent::default()),
        }
    }

    pub fn with_options(options: Vec<AgentOptions>) -> Self {
        let mut registry = Self::new();
        for entry in options {
            match entry {
                AgentOptions::Claude(opts) => {
                    registry.claude = Arc::new(claude::ClaudeAgent::new(opts));
                }
                AgentOptions::Codex(opts) => {
                    registry.codex = Arc::new(codex::CodexAgent::new(opts));
                }
                AgentOptions::Opencode(opts) => {
                    registry.opencode = Arc::new(opencode::OpencodeAgent::new(opts));
                }
            }
        }
        registry
    }

    pub fn resolve(&self, name: &str) -> AppResult<Arc<dyn Agent>> {
        match name {
            "claude" => Ok(self.claude.clone()),
            "codex" => Ok(self.codex.clone()),
            "opencode" => Ok(self.opencode.clone()),
            other => Err(AppError::NotFound(format!(
                "Agent '{}' is not registered",
                other
            ))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn names(&self) -> [&'static str; 3] {
        ["claude", "codex", "opencode"]
    }
}

/// Probe the CLI with `--version`. A missing binary, a non-zero exit, or a
/// hung probe all count as not installed.
pub async fn is_installed(agent: &dyn Agent) -> bool {
    let mut command = Command::new(agent.cli_program());
    command.arg("--version");

    match timeout(Duration::from_secs(3), command.output()).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::AgentRegistry;
    use crate::errors::AppError;

    #[test]
    fn resolves_all_registered_names() {
        let registry = AgentRegistry::new();
        for name in registry.names() {
            let agent = registry.resolve(name).expect("registered");
            assert_eq!(agent.name(), name);
        }
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let registry = AgentRegistry::new();
        let error = registry.resolve("cursor").expect_err("unregistered");
        assert!(matches!(error, AppError::NotFound(_)));
    }

    #[test]
    fn prompt_is_always_the_final_positional() {
        let registry = AgentRegistry::new();
        for name in registry.names() {
            let agent = registry.resolve(name).expect("registered");
            let spec = agent.build_command("do the thing", std::path::Path::new("/tmp"));
            assert_eq!(spec.args.last().map(String::as_str), Some("do the thing"));
        }
    }
}
