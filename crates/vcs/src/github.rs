use std::future::Future;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use terrapin_core::{
    config::GitHubConfig,
    models::{PullRequest, PullState, Repo, VcsHost},
    vcs::{CommitStatus, VcsClient},
};

/// Commit status context shown on pull requests.
pub const STATUS_CONTEXT: &str = "terrapin";

const PAGE_SIZE: u8 = 100;

#[derive(Clone)]
pub struct GitHubClient {
    pub client: Octocrab,
    config: GitHubConfig,
}

#[derive(Deserialize)]
pub(crate) struct Login {
    pub login: String,
}

#[derive(Deserialize)]
pub(crate) struct RepositoryPayload {
    pub full_name: String,
    pub clone_url: String,
}

#[derive(Deserialize)]
struct HeadPayload {
    sha: String,
    #[serde(rename = "ref")]
    ref_field: String,
    repo: Option<RepositoryPayload>,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    number: u64,
    state: String,
    html_url: String,
    user: Option<Login>,
    head: HeadPayload,
}

#[derive(Debug, Clone, Deserialize)]
struct DiffEntry {
    filename: String,
    previous_filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Review {
    state: String,
}

#[derive(Serialize)]
struct PageParams {
    per_page: u8,
    page: u32,
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    state: &'a str,
    description: &'a str,
    context: &'a str,
}

fn github_state(status: CommitStatus) -> &'static str {
    match status {
        CommitStatus::Pending => "pending",
        CommitStatus::Success => "success",
        CommitStatus::Failed => "failure",
    }
}

impl GitHubClient {
    pub async fn new(config: &GitHubConfig) -> Result<Self> {
        let mut builder = Octocrab::builder().personal_token(config.token.clone());
        if config.hostname != "github.com" {
            builder = builder
                .base_uri(format!("https://{}/api/v3", config.hostname))
                .context("Invalid GitHub hostname")?;
        }
        let client = builder.build().context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("GitHub: logged in as {}", profile.login);
        Ok(Self { client, config: config.clone() })
    }

    /// Fetches every page of a listing endpoint.
    async fn get_all<T: DeserializeOwned + Send>(&self, route: &str) -> Result<Vec<T>> {
        collect_pages(|page| async move {
            let entries: Vec<T> = self
                .client
                .get(route, Some(&PageParams { per_page: PAGE_SIZE, page }))
                .await
                .with_context(|| format!("Failed to fetch {route} page {page}"))?;
            Ok::<_, anyhow::Error>(entries)
        })
        .await
    }

    /// Builds a repo model with this client's credentials for cloning.
    pub fn repo(&self, full_name: &str, clone_url: &str) -> Result<Repo> {
        Repo::new(VcsHost::GitHub, full_name, clone_url, &self.config.user, &self.config.token)
    }
}

/// Requests pages starting at 1 until one comes back short.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut items = vec![];
    let mut page = 1;
    loop {
        let entries = fetch(page).await?;
        let done = entries.len() < PAGE_SIZE as usize;
        items.extend(entries);
        if done {
            return Ok(items);
        }
        page += 1;
    }
}

fn is_approved(reviews: &[Review]) -> bool { reviews.iter().any(|r| r.state == "APPROVED") }

pub(crate) fn pull_state(state: &str) -> PullState {
    if state == "closed" { PullState::Closed } else { PullState::Open }
}

#[async_trait]
impl VcsClient for GitHubClient {
    async fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<(PullRequest, Repo)> {
        let pull: PullRequestPayload = self
            .client
            .get(format!("/repos/{}/pulls/{num}", repo.full_name), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch pull request {}#{num}", repo.full_name))?;
        // The head repo is gone if the fork was deleted
        let head_repo = pull
            .head
            .repo
            .ok_or_else(|| anyhow!("Head repository of pull #{num} no longer exists"))?;
        let head_repo = self.repo(&head_repo.full_name, &head_repo.clone_url)?;
        Ok((
            PullRequest {
                num: pull.number,
                head_commit: pull.head.sha,
                branch: pull.head.ref_field,
                author: pull.user.map(|u| u.login).unwrap_or_default(),
                url: pull.html_url,
                state: pull_state(&pull.state),
            },
            head_repo,
        ))
    }

    async fn get_modified_files(&self, repo: &Repo, pull: &PullRequest) -> Result<Vec<String>> {
        let route = format!("/repos/{}/pulls/{}/files", repo.full_name, pull.num);
        let entries: Vec<DiffEntry> =
            self.get_all(&route).await.context("Failed to fetch modified files")?;
        let mut files = vec![];
        for entry in entries {
            // Renamed files count for both the old and new location
            files.extend(entry.previous_filename);
            files.push(entry.filename);
        }
        Ok(files)
    }

    async fn create_comment(&self, repo: &Repo, pull: &PullRequest, body: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post(
                format!("/repos/{}/issues/{}/comments", repo.full_name, pull.num),
                Some(&CommentBody { body }),
            )
            .await
            .context("Failed to create comment")?;
        Ok(())
    }

    async fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post(
                format!("/repos/{}/statuses/{}", repo.full_name, pull.head_commit),
                Some(&StatusBody {
                    state: github_state(status),
                    description,
                    context: STATUS_CONTEXT,
                }),
            )
            .await
            .context("Failed to update commit status")?;
        Ok(())
    }

    async fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool> {
        let route = format!("/repos/{}/pulls/{}/reviews", repo.full_name, pull.num);
        let reviews: Vec<Review> = self.get_all(&route).await.context("Failed to fetch reviews")?;
        Ok(is_approved(&reviews))
    }
}
