use std::{collections::BTreeMap, fmt::Write, sync::Arc};

use anyhow::{Context, Result};
use terrapin_core::{
    models::{Lock, PullRequest, Repo},
    vcs::VcsClient,
};

use crate::{locking::LockingClient, workspace::Workspace};

/// Cleans up after a pull request is closed or merged.
pub struct PullClosedExecutor {
    pub locker: LockingClient,
    pub workspace: Arc<dyn Workspace>,
    pub vcs_client: Arc<dyn VcsClient>,
}

impl PullClosedExecutor {
    /// Releases every lock and plan the pull request holds and deletes its
    /// checkouts. Comments on the pull request if any locks were released.
    pub async fn clean_up_pull(&self, repo: &Repo, pull: &PullRequest) -> Result<Vec<Lock>> {
        let locks = self
            .locker
            .unlock_by_pull(&repo.full_name, pull.num)
            .await
            .context("Failed to release locks")?;
        self.workspace.delete(repo, pull).await.context("Failed to delete checkouts")?;
        tracing::info!(repo = %repo.full_name, pull = pull.num, "Released {} locks", locks.len());
        if !locks.is_empty() {
            self.vcs_client.create_comment(repo, pull, &render_cleanup(&locks)).await?;
        }
        Ok(locks)
    }
}

fn render_cleanup(locks: &[Lock]) -> String {
    let mut by_path = BTreeMap::<&str, Vec<&str>>::new();
    for lock in locks {
        by_path.entry(&lock.project.path).or_default().push(&lock.workspace);
    }
    let mut out = "Locks and plans deleted for the projects and workspaces modified in this pull request:\n".to_string();
    for (path, mut workspaces) in by_path {
        workspaces.sort_unstable();
        let workspaces = workspaces.iter().map(|w| format!("`{w}`")).collect::<Vec<_>>().join(", ");
        let _ = write!(out, "\n- dir: `{path}` workspaces: {workspaces}");
    }
    out
}
