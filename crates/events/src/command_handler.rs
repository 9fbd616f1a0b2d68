use std::sync::Arc;

use anyhow::{Context, Result};
use terrapin_core::{
    models::{CommentEvent, PullRequest, PullState},
    vcs::{CommitStatus, VcsClient},
};
use tracing::Instrument;

use crate::{
    apply::ApplyExecutor,
    command::{CommandName, CommentParseResult, CommentParser},
    context::CommandContext,
    env_locker::EnvLocker,
    plan::PlanExecutor,
    render::{HELP_COMMENT, render_already_running, render_command_result},
    result::CommandResult,
};

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The same command was already running for this pull request and workspace.
    AlreadyRunning,
    Completed(CommandResult),
}

/// Turns pull request comments into plan and apply runs.
pub struct CommandHandler {
    pub plan_executor: Arc<PlanExecutor>,
    pub apply_executor: Arc<ApplyExecutor>,
    pub vcs_client: Arc<dyn VcsClient>,
    pub env_locker: Arc<EnvLocker>,
    pub parser: CommentParser,
    /// Comments by these users are the bot's own output.
    pub bot_users: Vec<String>,
}

impl CommandHandler {
    /// Returns `None` when the comment wasn't a command to run.
    pub async fn handle_comment(&self, event: CommentEvent) -> Result<Option<DispatchOutcome>> {
        if self.bot_users.iter().any(|user| user.eq_ignore_ascii_case(&event.user.username)) {
            tracing::debug!("Ignoring comment by {}", event.user.username);
            return Ok(None);
        }
        let command = match self.parser.parse(&event.comment) {
            CommentParseResult::Ignore => return Ok(None),
            CommentParseResult::Help => {
                let pull = PullRequest { num: event.pull_num, ..Default::default() };
                self.vcs_client.create_comment(&event.base_repo, &pull, HELP_COMMENT).await?;
                return Ok(None);
            }
            CommentParseResult::Invalid(message) => {
                let pull = PullRequest { num: event.pull_num, ..Default::default() };
                let body = format!("{message}\n\nComment `terrapin help` for usage.");
                self.vcs_client.create_comment(&event.base_repo, &pull, &body).await?;
                return Ok(None);
            }
            CommentParseResult::Command(command) => command,
        };
        let (pull, head_repo) = self
            .vcs_client
            .get_pull_request(&event.base_repo, event.pull_num)
            .await
            .with_context(|| format!("Failed to get pull request #{}", event.pull_num))?;
        if pull.state == PullState::Closed {
            self.vcs_client
                .create_comment(
                    &event.base_repo,
                    &pull,
                    "Commands can't be run on closed pull requests.",
                )
                .await?;
            return Ok(None);
        }
        let ctx = CommandContext::new(event.base_repo, head_repo, pull, event.user, command);
        let span = ctx.log.clone();
        Ok(Some(self.execute_command(&ctx).instrument(span).await))
    }

    /// Runs a parsed command, reporting status and results on the pull request.
    pub async fn execute_command(&self, ctx: &CommandContext) -> DispatchOutcome {
        let name = ctx.command.name;
        if name == CommandName::Help {
            self.comment(ctx, HELP_COMMENT).await;
            return DispatchOutcome::Completed(CommandResult::default());
        }
        let workspace = ctx.command.workspace();
        let Some(_guard) = self.env_locker.try_lock(&ctx.base_repo.full_name, workspace, ctx.pull.num)
        else {
            tracing::info!("{name} already running, rejecting");
            self.comment(ctx, &render_already_running(name, workspace)).await;
            return DispatchOutcome::AlreadyRunning;
        };

        tracing::info!(user = %ctx.user.username, "Running {name}");
        self.update_status(ctx, CommitStatus::Pending, &format!("{name} in progress")).await;
        let result = match name {
            CommandName::Plan => self.plan_executor.execute(ctx).await,
            CommandName::Apply => self.apply_executor.execute(ctx).await,
            CommandName::Help => CommandResult::default(),
        };
        let status = result.status();
        let description = match status {
            CommitStatus::Success => format!("{name} succeeded"),
            _ => format!("{name} failed"),
        };
        self.update_status(ctx, status, &description).await;
        self.comment(ctx, &render_command_result(&ctx.command, &result)).await;
        tracing::info!("{name} finished: {status}");
        DispatchOutcome::Completed(result)
    }

    async fn update_status(&self, ctx: &CommandContext, status: CommitStatus, description: &str) {
        if let Err(e) =
            self.vcs_client.update_status(&ctx.base_repo, &ctx.pull, status, description).await
        {
            tracing::warn!("Failed to update commit status: {e:?}");
        }
    }

    async fn comment(&self, ctx: &CommandContext, body: &str) {
        if let Err(e) = self.vcs_client.create_comment(&ctx.base_repo, &ctx.pull, body).await {
            tracing::warn!("Failed to comment on pull request: {e:?}");
        }
    }
}
