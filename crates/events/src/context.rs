use terrapin_core::models::{PullRequest, Repo, User};
use tracing::Span;

use crate::command::Command;

/// Everything a command needs while it runs.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Repository the pull request is merging into. Locks belong to it.
    pub base_repo: Repo,
    /// Repository holding the head branch; differs from `base_repo` for forks.
    pub head_repo: Repo,
    pub pull: PullRequest,
    pub user: User,
    pub command: Command,
    pub log: Span,
}

impl CommandContext {
    pub fn new(
        base_repo: Repo,
        head_repo: Repo,
        pull: PullRequest,
        user: User,
        command: Command,
    ) -> Self {
        let log = tracing::info_span!(
            "command",
            repo = %base_repo.full_name,
            pull = pull.num,
            command = command.name.as_str(),
            workspace = command.workspace(),
        );
        Self { base_repo, head_repo, pull, user, command, log }
    }
}
