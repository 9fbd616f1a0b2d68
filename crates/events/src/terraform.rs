use std::{
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum TerraformError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("terraform {command} exited with code {code}:\n{output}")]
    Exit { command: String, code: i32, output: String },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlanOutput {
    pub output: String,
    pub changes_present: bool,
}

/// The provisioning tool, run against a project directory.
#[async_trait]
pub trait Terraform: Send + Sync {
    async fn init(&self, dir: &Path, args: &[String]) -> Result<String, TerraformError>;

    /// Selects the workspace, creating it if needed.
    async fn select_workspace(&self, dir: &Path, workspace: &str)
    -> Result<String, TerraformError>;

    async fn plan(&self, dir: &Path, args: &[String]) -> Result<PlanOutput, TerraformError>;

    async fn apply(&self, dir: &Path, args: &[String]) -> Result<String, TerraformError>;
}

/// Runs the `terraform` binary as a subprocess.
pub struct TerraformClient {
    binary: PathBuf,
}

/// `terraform plan -detailed-exitcode` exits with this when changes are pending.
const PLAN_CHANGES_EXIT_CODE: i32 = 2;

impl Default for TerraformClient {
    fn default() -> Self { Self { binary: PathBuf::from("terraform") } }
}

impl TerraformClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self { Self { binary: binary.into() } }

    async fn run(&self, dir: &Path, args: &[String]) -> Result<(i32, String), TerraformError> {
        tracing::debug!(dir = %dir.display(), "Running terraform {}", args.join(" "));
        let Output { status, stdout, stderr } = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "true")
            .env("TF_INPUT", "false")
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|source| TerraformError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;
        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        // Killed by a signal if there's no code
        Ok((status.code().unwrap_or(-1), output))
    }

    async fn run_checked(&self, dir: &Path, args: Vec<String>) -> Result<String, TerraformError> {
        let (code, output) = self.run(dir, &args).await?;
        if code != 0 {
            return Err(exit_error(&args, code, output));
        }
        Ok(output)
    }
}

fn exit_error(args: &[String], code: i32, output: String) -> TerraformError {
    TerraformError::Exit { command: args.first().cloned().unwrap_or_default(), code, output }
}

fn with_args(base: &[&str], args: &[String]) -> Vec<String> {
    base.iter().map(|s| s.to_string()).chain(args.iter().cloned()).collect()
}

#[async_trait]
impl Terraform for TerraformClient {
    async fn init(&self, dir: &Path, args: &[String]) -> Result<String, TerraformError> {
        self.run_checked(dir, with_args(&["init", "-input=false", "-no-color"], args)).await
    }

    async fn select_workspace(
        &self,
        dir: &Path,
        workspace: &str,
    ) -> Result<String, TerraformError> {
        let args = ["workspace", "select", "-or-create=true", workspace];
        self.run_checked(dir, args.iter().map(|s| s.to_string()).collect()).await
    }

    async fn plan(&self, dir: &Path, args: &[String]) -> Result<PlanOutput, TerraformError> {
        let args = with_args(&["plan", "-input=false", "-no-color", "-detailed-exitcode"], args);
        match self.run(dir, &args).await? {
            (0, output) => Ok(PlanOutput { output, changes_present: false }),
            (PLAN_CHANGES_EXIT_CODE, output) => Ok(PlanOutput { output, changes_present: true }),
            (code, output) => Err(exit_error(&args, code, output)),
        }
    }

    async fn apply(&self, dir: &Path, args: &[String]) -> Result<String, TerraformError> {
        self.run_checked(dir, with_args(&["apply", "-input=false", "-no-color"], args)).await
    }
}
