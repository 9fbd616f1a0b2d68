use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use terrapin_core::AppError;
use terrapin_vcs::webhook::{VcsEvent, VcsWebhook};

use crate::AppState;

/// Comments are answered immediately and handled in the background, since a
/// plan can outlast the VCS webhook timeout. Closed pull requests are
/// cleaned up before responding.
pub async fn post_events(
    State(state): State<AppState>,
    VcsWebhook { host, event }: VcsWebhook,
) -> Result<Response, AppError> {
    match event {
        VcsEvent::Comment(comment) => {
            tracing::info!(
                "Received {host} comment from @{} on {}#{}",
                comment.user.username,
                comment.base_repo.full_name,
                comment.pull_num
            );
            let handler = state.command_handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_comment(comment).await {
                    tracing::error!("Failed to handle comment: {e:?}");
                }
            });
            Ok((StatusCode::OK, "Processing...").into_response())
        }
        VcsEvent::PullClosed { repo, pull } => {
            tracing::info!("Received {host} close of {}#{}", repo.full_name, pull.num);
            let locks = state
                .pull_closed
                .clean_up_pull(&repo, &pull)
                .await
                .context("Failed to clean up closed pull request")?;
            Ok((StatusCode::OK, format!("Pull request cleaned up, released {} locks", locks.len()))
                .into_response())
        }
        VcsEvent::Ignored(reason) => {
            tracing::debug!("Ignoring {host} event: {reason}");
            Ok((StatusCode::OK, format!("Ignoring event: {reason}")).into_response())
        }
    }
}
