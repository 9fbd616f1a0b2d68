use std::{fmt::Display, sync::Arc};

use anyhow::{Result, anyhow};
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use terrapin_core::{
    config::{Config, GitHubConfig, GitLabConfig},
    models::{CommentEvent, PullRequest, PullState, Repo, User, VcsHost},
};

use crate::github::{Login, RepositoryPayload};

/// What a webhook delivery asks of us.
#[derive(Debug, Clone)]
pub enum VcsEvent {
    /// A comment on a pull request.
    Comment(CommentEvent),
    /// A pull request was closed or merged.
    PullClosed { repo: Repo, pull: PullRequest },
    /// Anything else; the reason is logged.
    Ignored(String),
}

/// Verify and extract a GitHub or GitLab webhook delivery.
#[derive(Debug, Clone)]
#[must_use]
pub struct VcsWebhook {
    pub host: VcsHost,
    pub event: VcsEvent,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl<S> FromRequest<S> for VcsWebhook
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let config = <Arc<Config>>::from_ref(state);
        let headers = req.headers().clone();
        if let Some(event) = header(&headers, "X-GitHub-Event") {
            let github = config.github.as_ref().ok_or_else(|| err("GitHub is not configured"))?;
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            if !github.webhook_secret.is_empty() {
                let signature = header(&headers, "X-Hub-Signature-256")
                    .ok_or_else(|| err("X-Hub-Signature-256 missing"))?;
                verify_github_signature(&github.webhook_secret, signature, &body).map_err(err)?;
            }
            let event = parse_github_event(event, &body, github).map_err(err)?;
            Ok(VcsWebhook { host: VcsHost::GitHub, event })
        } else if let Some(event) = header(&headers, "X-Gitlab-Event") {
            let gitlab = config.gitlab.as_ref().ok_or_else(|| err("GitLab is not configured"))?;
            if !gitlab.webhook_secret.is_empty() {
                let token = header(&headers, "X-Gitlab-Token")
                    .ok_or_else(|| err("X-Gitlab-Token missing"))?;
                if !constant_time_eq(token.as_bytes(), gitlab.webhook_secret.as_bytes()) {
                    return Err(err("token mismatch"));
                }
            }
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            tracing::debug!("Received GitLab event {event}");
            let event = parse_gitlab_event(&body, gitlab).map_err(err)?;
            Ok(VcsWebhook { host: VcsHost::GitLab, event })
        } else {
            Err(err("X-GitHub-Event or X-Gitlab-Event header missing"))
        }
    }
}

fn verify_github_signature(secret: &str, signature: &str, body: &[u8]) -> Result<()> {
    let signature = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow!("X-Hub-Signature-256 sha256= prefix missing"))?;
    let signature =
        hex::decode(signature).map_err(|_| anyhow!("X-Hub-Signature-256 malformed"))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("invalid webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| anyhow!("signature mismatch"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: IssuePayload,
    comment: CommentPayload,
    repository: RepositoryPayload,
}

#[derive(Deserialize)]
struct IssuePayload {
    number: u64,
    /// Present when the issue is a pull request.
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CommentPayload {
    body: String,
    user: Login,
}

#[derive(Deserialize)]
struct PullRequestEventPayload {
    action: String,
    number: u64,
    repository: RepositoryPayload,
}

pub fn parse_github_event(event: &str, body: &[u8], config: &GitHubConfig) -> Result<VcsEvent> {
    let repo = |payload: &RepositoryPayload| {
        Repo::new(
            VcsHost::GitHub,
            &payload.full_name,
            &payload.clone_url,
            &config.user,
            &config.token,
        )
    };
    match event {
        "issue_comment" => {
            let payload: IssueCommentPayload = serde_json::from_slice(body)?;
            if payload.action != "created" {
                return Ok(VcsEvent::Ignored(format!("comment {}", payload.action)));
            }
            if payload.issue.pull_request.is_none() {
                return Ok(VcsEvent::Ignored("comment on an issue".to_string()));
            }
            Ok(VcsEvent::Comment(CommentEvent {
                base_repo: repo(&payload.repository)?,
                user: User { username: payload.comment.user.login },
                pull_num: payload.issue.number,
                comment: payload.comment.body,
            }))
        }
        "pull_request" => {
            let payload: PullRequestEventPayload = serde_json::from_slice(body)?;
            if payload.action != "closed" {
                return Ok(VcsEvent::Ignored(format!("pull request {}", payload.action)));
            }
            Ok(VcsEvent::PullClosed {
                repo: repo(&payload.repository)?,
                pull: PullRequest {
                    num: payload.number,
                    state: PullState::Closed,
                    ..Default::default()
                },
            })
        }
        other => Ok(VcsEvent::Ignored(format!("event {other}"))),
    }
}

#[derive(Deserialize)]
#[serde(tag = "object_kind", rename_all = "snake_case")]
enum GitLabPayload {
    Note(NotePayload),
    MergeRequest(MergeRequestEventPayload),
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct GitLabProject {
    path_with_namespace: String,
    git_http_url: String,
}

#[derive(Deserialize)]
struct GitLabUser {
    username: String,
}

#[derive(Deserialize)]
struct NotePayload {
    user: GitLabUser,
    project: GitLabProject,
    object_attributes: NoteAttributes,
    merge_request: Option<MergeRequestRef>,
}

#[derive(Deserialize)]
struct NoteAttributes {
    note: String,
    noteable_type: String,
}

#[derive(Deserialize)]
struct MergeRequestRef {
    iid: u64,
}

#[derive(Deserialize)]
struct MergeRequestEventPayload {
    project: GitLabProject,
    object_attributes: MergeRequestAttributes,
}

#[derive(Deserialize)]
struct MergeRequestAttributes {
    iid: u64,
    action: Option<String>,
}

pub fn parse_gitlab_event(body: &[u8], config: &GitLabConfig) -> Result<VcsEvent> {
    let repo = |project: &GitLabProject| {
        Repo::new(
            VcsHost::GitLab,
            &project.path_with_namespace,
            &project.git_http_url,
            &config.user,
            &config.token,
        )
    };
    match serde_json::from_slice(body)? {
        GitLabPayload::Note(note) => {
            let Some(merge_request) =
                note.merge_request.filter(|_| note.object_attributes.noteable_type == "MergeRequest")
            else {
                return Ok(VcsEvent::Ignored(format!(
                    "note on {}",
                    note.object_attributes.noteable_type
                )));
            };
            Ok(VcsEvent::Comment(CommentEvent {
                base_repo: repo(&note.project)?,
                user: User { username: note.user.username },
                pull_num: merge_request.iid,
                comment: note.object_attributes.note,
            }))
        }
        GitLabPayload::MergeRequest(payload) => match payload.object_attributes.action.as_deref() {
            Some("close" | "merge") => Ok(VcsEvent::PullClosed {
                repo: repo(&payload.project)?,
                pull: PullRequest {
                    num: payload.object_attributes.iid,
                    state: PullState::Closed,
                    ..Default::default()
                },
            }),
            action => Ok(VcsEvent::Ignored(format!(
                "merge request {}",
                action.unwrap_or("update")
            ))),
        },
        GitLabPayload::Other => Ok(VcsEvent::Ignored("unsupported object kind".to_string())),
    }
}
