use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use terrapin_core::{
    config::{WebhookConfig, WebhookKind},
    models::{PullRequest, Repo, User},
};
use url::Url;

const APPLY_EVENT: &str = "apply";
const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
/// Upper bound on a single webhook delivery.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Sent to webhooks after every apply, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub workspace: String,
    pub repo: Repo,
    pub pull: PullRequest,
    pub user: User,
    pub success: bool,
    pub directory: String,
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, result: &ApplyResult) -> Result<()>;
}

/// Fans an apply result out to every configured webhook. Failures and
/// deliveries that outlast the timeout are logged and never fail the apply.
pub struct MultiWebhookSender {
    webhooks: Vec<Box<dyn WebhookSender>>,
    timeout: Duration,
}

impl MultiWebhookSender {
    pub fn new(
        configs: &[WebhookConfig],
        slack_token: Option<&str>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let mut webhooks: Vec<Box<dyn WebhookSender>> = Vec::with_capacity(configs.len());
        for (idx, config) in configs.iter().enumerate() {
            if config.event != APPLY_EVENT {
                bail!("webhooks[{idx}]: unsupported event `{}`, only `apply` is supported", config.event);
            }
            let workspace_regex = Regex::new(&config.workspace_regex)
                .with_context(|| format!("webhooks[{idx}]: invalid workspace_regex"))?;
            match config.kind {
                WebhookKind::Slack => {
                    let token = slack_token
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| anyhow!("webhooks[{idx}]: slack webhooks need slack_token"))?;
                    let channel = config
                        .channel
                        .clone()
                        .filter(|c| !c.is_empty())
                        .ok_or_else(|| anyhow!("webhooks[{idx}]: slack webhooks need a channel"))?;
                    webhooks.push(Box::new(SlackWebhook {
                        workspace_regex,
                        channel,
                        token: token.to_string(),
                        client: client.clone(),
                    }));
                }
                WebhookKind::Http => {
                    let url = config
                        .url
                        .clone()
                        .ok_or_else(|| anyhow!("webhooks[{idx}]: http webhooks need a url"))?;
                    webhooks.push(Box::new(HttpWebhook { workspace_regex, url, client: client.clone() }));
                }
            }
        }
        Ok(Self { webhooks, timeout: DEFAULT_SEND_TIMEOUT })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self { Self { timeout, ..self } }

    pub fn len(&self) -> usize { self.webhooks.len() }

    pub fn is_empty(&self) -> bool { self.webhooks.is_empty() }
}

#[async_trait]
impl WebhookSender for MultiWebhookSender {
    async fn send(&self, result: &ApplyResult) -> Result<()> {
        for webhook in &self.webhooks {
            match tokio::time::timeout(self.timeout, webhook.send(result)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Failed to send apply webhook: {e:?}"),
                Err(_) => tracing::warn!("Apply webhook timed out after {:?}", self.timeout),
            }
        }
        Ok(())
    }
}

pub struct SlackWebhook {
    workspace_regex: Regex,
    channel: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    channel: &'a str,
    text: String,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    error: Option<String>,
}

fn slack_text(result: &ApplyResult) -> String {
    let outcome = if result.success { "succeeded" } else { "failed" };
    format!(
        "Apply {outcome} for <{}|{}#{}> in `{}` workspace `{}` by {}",
        result.pull.url,
        result.repo.full_name,
        result.pull.num,
        result.directory,
        result.workspace,
        result.user.username,
    )
}

#[async_trait]
impl WebhookSender for SlackWebhook {
    async fn send(&self, result: &ApplyResult) -> Result<()> {
        if !self.workspace_regex.is_match(&result.workspace) {
            return Ok(());
        }
        let message = SlackMessage { channel: &self.channel, text: slack_text(result) };
        let response: SlackResponse = self
            .client
            .post(SLACK_POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.ok {
            bail!("Slack rejected message: {}", response.error.unwrap_or_default());
        }
        Ok(())
    }
}

/// Posts the apply result as JSON.
pub struct HttpWebhook {
    workspace_regex: Regex,
    url: Url,
    client: reqwest::Client,
}

#[async_trait]
impl WebhookSender for HttpWebhook {
    async fn send(&self, result: &ApplyResult) -> Result<()> {
        if !self.workspace_regex.is_match(&result.workspace) {
            return Ok(());
        }
        self.client
            .post(self.url.clone())
            .json(result)
            .send()
            .await
            .with_context(|| format!("Failed to post to {}", self.url))?
            .error_for_status()?;
        Ok(())
    }
}
