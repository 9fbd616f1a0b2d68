use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use terrapin_core::{
    AppError,
    models::{Project, PullRequest, Repo, User, VcsHost},
};
use terrapin_events::{
    command::{Command, CommandName},
    context::CommandContext,
    plan::DetachedPlan,
    result::{CommandResult, ProjectOutcome},
};

use crate::AppState;

/// Username recorded on locks taken by API plans.
const API_USER: &str = "terrapin-api";

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    /// `owner/name` on the configured GitHub host.
    pub repo: String,
    /// Empty plans the default branch.
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub workspace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub output: String,
    pub success: bool,
    pub changes: bool,
}

/// Plans one directory of a branch outside of any pull request. The plan is
/// never kept: its lock is released as soon as terraform finishes.
pub async fn post_plan(
    State(state): State<AppState>,
    Json(request): Json<PlanRequest>,
) -> Result<Response, AppError> {
    let Some(github) = &state.config.github else {
        return Ok((StatusCode::BAD_REQUEST, "GitHub is not configured").into_response());
    };
    let clone_url = format!("https://{}/{}.git", github.hostname, request.repo);
    let repo =
        match Repo::new(VcsHost::GitHub, &request.repo, &clone_url, &github.user, &github.token) {
            Ok(repo) => repo,
            Err(e) => return Ok((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
        };
    let project = Project::new(&repo.full_name, &request.path);
    let pull = PullRequest { num: 0, branch: request.branch, ..Default::default() };
    let command = Command {
        workspace: request.workspace,
        verbose: true,
        ..Command::new(CommandName::Plan)
    };
    let workspace = command.workspace().to_string();
    let user = User { username: API_USER.to_string() };
    let ctx = CommandContext::new(repo.clone(), repo, pull, user, command);
    let full_name = ctx.base_repo.full_name.clone();
    let result = match state
        .plan_executor
        .plan_detached(state.env_locker.clone(), ctx, project)
        .await?
    {
        DetachedPlan::Finished(result) => result,
        DetachedPlan::AlreadyRunning => {
            return Ok((
                StatusCode::CONFLICT,
                format!("A plan is already running for {full_name} in workspace {workspace}"),
            )
                .into_response());
        }
    };
    match plan_response(result) {
        Some(response) => Ok(Json(response).into_response()),
        None => Err(AppError::Internal(anyhow::anyhow!("No project results from plan"))),
    }
}

fn plan_response(result: CommandResult) -> Option<PlanResponse> {
    if let Some(error) = result.error {
        return Some(PlanResponse { output: format!("{error:#}"), success: false, changes: false });
    }
    if let Some(failure) = result.failure {
        return Some(PlanResponse { output: failure, success: false, changes: false });
    }
    let project_result = result.project_results.into_iter().next()?;
    Some(match project_result.outcome {
        ProjectOutcome::PlanSuccess(plan) => PlanResponse {
            output: plan.terraform_output,
            success: true,
            changes: plan.changes_present,
        },
        ProjectOutcome::ApplySuccess(output) => {
            PlanResponse { output, success: true, changes: false }
        }
        ProjectOutcome::Failure(message) => {
            PlanResponse { output: message, success: false, changes: false }
        }
        ProjectOutcome::Error(error) => {
            PlanResponse { output: format!("{error:#}"), success: false, changes: false }
        }
    })
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use terrapin_events::result::{PlanSuccess, ProjectResult};

    use super::*;

    #[test]
    fn test_plan_response() {
        let project = Project::new("owner/repo", ".");
        let result = CommandResult::from_projects(vec![ProjectResult::new(
            &project,
            "default",
            ProjectOutcome::PlanSuccess(PlanSuccess {
                terraform_output: "Plan: 1 to add".to_string(),
                changes_present: true,
                lock_url: String::new(),
            }),
        )]);
        let response = plan_response(result).unwrap();
        assert!(response.success);
        assert!(response.changes);
        assert_eq!(response.output, "Plan: 1 to add");

        let result = CommandResult::from_projects(vec![ProjectResult::error(
            &project,
            "default",
            anyhow!("exit status 1").context("terraform plan failed"),
        )]);
        let response = plan_response(result).unwrap();
        assert!(!response.success);
        assert_eq!(response.output, "terraform plan failed: exit status 1");

        let response = plan_response(CommandResult::error(anyhow!("clone failed"))).unwrap();
        assert!(!response.success);
        assert_eq!(response.output, "clone failed");

        assert!(plan_response(CommandResult::default()).is_none());
    }
}
