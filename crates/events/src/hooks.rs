use std::path::Path;

use anyhow::{Context, Result, bail};
use terrapin_core::models::Project;
use tokio::process::Command;

use crate::context::CommandContext;

/// Environment passed to every project hook.
pub fn hook_env(ctx: &CommandContext, project: &Project) -> Vec<(&'static str, String)> {
    vec![
        ("WORKSPACE", ctx.command.workspace().to_string()),
        ("DIR", project.path.clone()),
        ("BASE_REPO_NAME", ctx.base_repo.full_name.clone()),
        ("HEAD_REPO_NAME", ctx.head_repo.full_name.clone()),
        ("HEAD_BRANCH_NAME", ctx.pull.branch.clone()),
        ("HEAD_COMMIT", ctx.pull.head_commit.clone()),
        ("PULL_NUM", ctx.pull.num.to_string()),
        ("PULL_AUTHOR", ctx.pull.author.clone()),
        ("USER_NAME", ctx.user.username.clone()),
    ]
}

/// Runs each command with `sh -c` in `dir`, stopping at the first failure.
/// Returns the combined output of every command that ran.
pub async fn run_hooks(dir: &Path, commands: &[String], env: &[(&str, String)]) -> Result<String> {
    let mut log = String::new();
    for command in commands {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .output()
            .await
            .with_context(|| format!("Failed to run `{command}`"))?;
        log.push_str(&String::from_utf8_lossy(&output.stdout));
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            bail!("`{command}` exited with {}:\n{log}", output.status);
        }
    }
    Ok(log)
}
