use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use terrapin_core::{
    models::{PullRequest, Repo},
    util::join_normalized,
};
use tokio::process::Command;

/// Checkouts of pull requests on local disk, one per workspace so commands in
/// different workspaces of the same pull request don't share terraform state.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Makes a fresh checkout of the pull request head, replacing any
    /// existing one, and returns its path.
    async fn checkout(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf>;

    /// Path of an existing checkout.
    async fn get_workspace(
        &self,
        base_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf>;

    /// Deletes every checkout of the pull request.
    async fn delete(&self, base_repo: &Repo, pull: &PullRequest) -> Result<()>;
}

/// Clones with the `git` binary under `<data_dir>/repos/<repo>/<pull>/<workspace>`.
pub struct FileWorkspace {
    data_dir: PathBuf,
}

impl FileWorkspace {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self { Self { data_dir: data_dir.into() } }

    fn pull_dir(&self, base_repo: &Repo, pull: &PullRequest) -> PathBuf {
        join_normalized(self.data_dir.join("repos"), &base_repo.full_name)
            .join(pull.num.to_string())
    }

    fn workspace_dir(&self, base_repo: &Repo, pull: &PullRequest, workspace: &str) -> PathBuf {
        join_normalized(self.pull_dir(base_repo, pull), workspace)
    }
}

async fn git(dir: &Path, args: &[&str], repo: &Repo) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .context("Failed to run git")?;
    if !output.status.success() {
        // Clone URLs carry credentials; keep them out of errors
        let stderr = String::from_utf8_lossy(&output.stderr)
            .replace(&repo.clone_url, &repo.sanitized_clone_url);
        let command = args
            .iter()
            .map(|a| if *a == repo.clone_url { repo.sanitized_clone_url.as_str() } else { *a })
            .collect::<Vec<_>>()
            .join(" ");
        bail!("git {command} failed: {}", stderr.trim());
    }
    Ok(())
}

#[async_trait]
impl Workspace for FileWorkspace {
    async fn checkout(
        &self,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf> {
        let dir = self.workspace_dir(base_repo, pull, workspace);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        let parent = dir.parent().ok_or_else(|| anyhow!("Invalid checkout dir"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let dir_str = dir.to_string_lossy();
        tracing::info!(
            "Cloning {} branch {} into {}",
            head_repo.sanitized_clone_url,
            pull.branch,
            dir.display()
        );
        let mut args = vec!["clone", "--quiet", "--single-branch"];
        if !pull.branch.is_empty() {
            args.extend(["--branch", pull.branch.as_str()]);
        }
        args.extend([head_repo.clone_url.as_str(), dir_str.as_ref()]);
        git(parent, &args, head_repo).await?;
        if !pull.head_commit.is_empty() {
            let args = ["checkout", "--quiet", "--detach", pull.head_commit.as_str()];
            git(&dir, &args, head_repo).await?;
        }
        Ok(dir)
    }

    async fn get_workspace(
        &self,
        base_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf> {
        let dir = self.workspace_dir(base_repo, pull, workspace);
        if !tokio::fs::try_exists(&dir).await? {
            bail!("No checkout for workspace `{workspace}` of pull #{}; run plan first", pull.num);
        }
        Ok(dir)
    }

    async fn delete(&self, base_repo: &Repo, pull: &PullRequest) -> Result<()> {
        let dir = self.pull_dir(base_repo, pull);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}
