use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use terrapin_core::{
    config::GitLabConfig,
    models::{PullRequest, PullState, Repo, VcsHost},
    vcs::{CommitStatus, VcsClient},
};
use url::{Url, form_urlencoded};

use crate::github::STATUS_CONTEXT;

/// GitLab REST API v4 client. Merge requests map onto pull requests.
#[derive(Clone)]
pub struct GitLabClient {
    client: reqwest::Client,
    api_url: Url,
    config: GitLabConfig,
}

#[derive(Deserialize)]
struct Username {
    username: String,
}

#[derive(Deserialize)]
struct MergeRequestPayload {
    iid: u64,
    sha: String,
    source_branch: String,
    source_project_id: u64,
    target_project_id: u64,
    author: Option<Username>,
    web_url: String,
    state: String,
}

#[derive(Deserialize)]
struct ProjectPayload {
    path_with_namespace: String,
    http_url_to_repo: String,
}

#[derive(Deserialize)]
struct ChangesPayload {
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct Change {
    old_path: String,
    new_path: String,
}

#[derive(Deserialize)]
struct ApprovalsPayload {
    approved: bool,
}

#[derive(Serialize)]
struct NoteBody<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    state: &'a str,
    name: &'a str,
    description: &'a str,
    #[serde(rename = "ref")]
    ref_field: &'a str,
}

fn gitlab_state(status: CommitStatus) -> &'static str {
    match status {
        CommitStatus::Pending => "pending",
        CommitStatus::Success => "success",
        CommitStatus::Failed => "failed",
    }
}

pub(crate) fn merge_request_state(state: &str) -> PullState {
    match state {
        "opened" | "locked" => PullState::Open,
        _ => PullState::Closed,
    }
}

/// Project ids in API paths are the URL-encoded full path.
fn project_id(full_name: &str) -> String {
    form_urlencoded::byte_serialize(full_name.as_bytes()).collect()
}

impl GitLabClient {
    pub fn new(config: &GitLabConfig, client: reqwest::Client) -> Result<Self> {
        let api_url = Url::parse(&format!("https://{}/api/v4/", config.hostname))
            .context("Invalid GitLab hostname")?;
        Ok(Self { client, api_url, config: config.clone() })
    }

    pub fn repo(&self, full_name: &str, clone_url: &str) -> Result<Repo> {
        Repo::new(VcsHost::GitLab, full_name, clone_url, &self.config.user, &self.config.token)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.api_url.join(path).with_context(|| format!("Invalid API path {path}"))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        let response = self
            .client
            .get(url)
            .header("PRIVATE-TOKEN", &self.config.token)
            .send()
            .await
            .with_context(|| format!("GitLab request GET {path} failed"))?;
        if !response.status().is_success() {
            bail!("GitLab request GET {path} failed with {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path)?;
        let response = self
            .client
            .post(url)
            .header("PRIVATE-TOKEN", &self.config.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("GitLab request POST {path} failed"))?;
        if !response.status().is_success() {
            bail!("GitLab request POST {path} failed with {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl VcsClient for GitLabClient {
    async fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<(PullRequest, Repo)> {
        let mr: MergeRequestPayload = self
            .get(&format!("projects/{}/merge_requests/{num}", project_id(&repo.full_name)))
            .await?;
        let head_repo = if mr.source_project_id == mr.target_project_id {
            repo.clone()
        } else {
            let project: ProjectPayload =
                self.get(&format!("projects/{}", mr.source_project_id)).await?;
            self.repo(&project.path_with_namespace, &project.http_url_to_repo)?
        };
        Ok((
            PullRequest {
                num: mr.iid,
                head_commit: mr.sha,
                branch: mr.source_branch,
                author: mr.author.map(|a| a.username).unwrap_or_default(),
                url: mr.web_url,
                state: merge_request_state(&mr.state),
            },
            head_repo,
        ))
    }

    async fn get_modified_files(&self, repo: &Repo, pull: &PullRequest) -> Result<Vec<String>> {
        let changes: ChangesPayload = self
            .get(&format!(
                "projects/{}/merge_requests/{}/changes",
                project_id(&repo.full_name),
                pull.num
            ))
            .await?;
        let mut files = vec![];
        for change in changes.changes {
            if change.old_path != change.new_path {
                files.push(change.old_path);
            }
            files.push(change.new_path);
        }
        Ok(files)
    }

    async fn create_comment(&self, repo: &Repo, pull: &PullRequest, body: &str) -> Result<()> {
        self.post(
            &format!("projects/{}/merge_requests/{}/notes", project_id(&repo.full_name), pull.num),
            &NoteBody { body },
        )
        .await
    }

    async fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        self.post(
            &format!("projects/{}/statuses/{}", project_id(&repo.full_name), pull.head_commit),
            &StatusBody {
                state: gitlab_state(status),
                name: STATUS_CONTEXT,
                description,
                ref_field: &pull.branch,
            },
        )
        .await
    }

    async fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool> {
        let approvals: ApprovalsPayload = self
            .get(&format!(
                "projects/{}/merge_requests/{}/approvals",
                project_id(&repo.full_name),
                pull.num
            ))
            .await?;
        Ok(approvals.approved)
    }
}
