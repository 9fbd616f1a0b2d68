use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    /// Root directory for pull request checkouts.
    pub data_dir: PathBuf,
    pub github: Option<GitHubConfig>,
    pub gitlab: Option<GitLabConfig>,
    #[serde(default)]
    pub require_approval: bool,
    pub slack_token: Option<String>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Externally reachable URL, used to link to lock pages from comments.
    pub url: Url,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_hostname")]
    pub hostname: String,
    pub user: String,
    pub token: String,
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_github_hostname() -> String { "github.com".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabConfig {
    #[serde(default = "default_gitlab_hostname")]
    pub hostname: String,
    pub user: String,
    pub token: String,
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_gitlab_hostname() -> String { "gitlab.com".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Only `apply` is supported.
    pub event: String,
    /// Workspaces matching this regex are reported. Empty matches everything.
    #[serde(default)]
    pub workspace_regex: String,
    pub kind: WebhookKind,
    /// Slack channel, for `kind: slack`.
    pub channel: Option<String>,
    /// Target URL, for `kind: http`.
    pub url: Option<Url>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Slack,
    Http,
}

impl Config {
    /// Names the bot answers to in comments: `terrapin` plus `@user` for each configured host.
    pub fn bot_names(&self) -> Vec<String> {
        let mut names = vec!["terrapin".to_string()];
        if let Some(github) = &self.github {
            names.push(format!("@{}", github.user));
        }
        if let Some(gitlab) = &self.gitlab {
            names.push(format!("@{}", gitlab.user));
        }
        names
    }

    /// Accounts the bot comments as. Their comments are never commands.
    pub fn bot_users(&self) -> Vec<String> {
        let github = self.github.iter().map(|github| github.user.clone());
        github.chain(self.gitlab.iter().map(|gitlab| gitlab.user.clone())).collect()
    }
}
