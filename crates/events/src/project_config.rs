use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Optional per-project file, read from the project directory.
pub const PROJECT_CONFIG_FILE: &str = "terrapin.yaml";

#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Shell commands run before `terraform init`.
    pub pre_init: Vec<String>,
    pub pre_plan: Vec<String>,
    pub pre_apply: Vec<String>,
    /// Run only after a successful apply.
    pub post_apply: Vec<String>,
    pub extra_arguments: Vec<ExtraArguments>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraArguments {
    /// `init`, `plan` or `apply`.
    pub command_name: String,
    pub arguments: Vec<String>,
}

impl ProjectConfig {
    /// A missing file yields the default config.
    pub async fn read(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(PROJECT_CONFIG_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {PROJECT_CONFIG_FILE}"))
    }

    pub fn extra_arguments(&self, command_name: &str) -> Vec<String> {
        self.extra_arguments
            .iter()
            .filter(|extra| extra.command_name == command_name)
            .flat_map(|extra| extra.arguments.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_project_config() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ProjectConfig::read(dir.path()).await.unwrap(), ProjectConfig::default());

        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            r#"
pre_plan:
  - make generate
extra_arguments:
  - command_name: plan
    arguments: ["-lock=false"]
  - command_name: plan
    arguments: ["-parallelism=4"]
  - command_name: apply
    arguments: ["-auto-approve"]
"#,
        )
        .unwrap();
        let config = ProjectConfig::read(dir.path()).await.unwrap();
        assert_eq!(config.pre_plan, ["make generate"]);
        assert!(config.pre_init.is_empty());
        assert_eq!(config.extra_arguments("plan"), ["-lock=false", "-parallelism=4"]);
        assert_eq!(config.extra_arguments("apply"), ["-auto-approve"]);
        assert!(config.extra_arguments("init").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), "pre_destroy: [rm]\n").unwrap();
        assert!(ProjectConfig::read(dir.path()).await.is_err());
    }
}
