use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{PullRequest, Repo};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommitStatus {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        })
    }
}

/// Operations the command engine needs from a VCS host.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Fetches a pull request and the repository its head branch lives in.
    async fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<(PullRequest, Repo)>;

    /// Paths of every file modified by the pull request, relative to the repo root.
    async fn get_modified_files(&self, repo: &Repo, pull: &PullRequest) -> Result<Vec<String>>;

    async fn create_comment(&self, repo: &Repo, pull: &PullRequest, body: &str) -> Result<()>;

    async fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        status: CommitStatus,
        description: &str,
    ) -> Result<()>;

    async fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool>;
}
