use super::Agent;
use crate::process::SpawnSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpencodeOptions {
    pub model: Option<String>,
    #[serde(default)]
    pub additional_flags: Vec<String>,
}

#[derive(Debug, Default)]
pub struct OpencodeAgent {
    options: OpencodeOptions,
}

impl OpencodeAgent {
    pub fn new(options: OpencodeOptions) -> Self {
        Self { options }
    }
}

impl Agent for OpencodeAgent {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn display_name(&self) -> &'static str {
        "OpenCode"
    }

    fn cli_program(&self) -> &str {
        "opencode"
    }

    fn build_command(&self, prompt: &str, cwd: &Path) -> SpawnSpec {
        let mut args = vec!["run".to_string()];

        if let Some(model) = &self.options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
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
