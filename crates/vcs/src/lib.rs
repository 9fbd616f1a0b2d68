pub mod github;
pub mod gitlab;
pub mod webhook;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use terrapin_core::{
    config::Config,
    models::{PullRequest, Repo, VcsHost},
    vcs::{CommitStatus, VcsClient},
};

use crate::{github::GitHubClient, gitlab::GitLabClient};

/// Routes each call to the client for the repo's host.
#[derive(Clone, Default)]
pub struct VcsClientProxy {
    pub github: Option<GitHubClient>,
    pub gitlab: Option<GitLabClient>,
}

impl VcsClientProxy {
    pub async fn new(config: &Config, http: reqwest::Client) -> Result<Self> {
        let github = match &config.github {
            Some(github) => Some(GitHubClient::new(github).await?),
            None => None,
        };
        let gitlab = config.gitlab.as_ref().map(|c| GitLabClient::new(c, http)).transpose()?;
        if github.is_none() && gitlab.is_none() {
            tracing::warn!("Neither GitHub nor GitLab is configured");
        }
        Ok(Self { github, gitlab })
    }

    fn client(&self, host: VcsHost) -> Result<&dyn VcsClient> {
        let client: Option<&dyn VcsClient> = match host {
            VcsHost::GitHub => self.github.as_ref().map(|c| c as &dyn VcsClient),
            VcsHost::GitLab => self.gitlab.as_ref().map(|c| c as &dyn VcsClient),
        };
        client.ok_or_else(|| anyhow!("{host} is not configured"))
    }
}

#[async_trait]
impl VcsClient for VcsClientProxy {
    async fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<(PullRequest, Repo)> {
        self.client(repo.host)?.get_pull_request(repo, num).await
    }

    async fn get_modified_files(&self, repo: &Repo, pull: &PullRequest) -> Result<Vec<String>> {
        self.client(repo.host)?.get_modified_files(repo, pull).await
    }

    async fn create_comment(&self, repo: &Repo, pull: &PullRequest, body: &str) -> Result<()> {
        self.client(repo.host)?.create_comment(repo, pull, body).await
    }

    async fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        self.client(repo.host)?.update_status(repo, pull, status, description).await
    }

    async fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool> {
        self.client(repo.host)?.pull_is_approved(repo, pull).await
    }
}
