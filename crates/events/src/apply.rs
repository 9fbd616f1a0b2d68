use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use terrapin_core::{
    locking::PlanStore,
    models::{PlanRecord, Project, lock_id},
    vcs::VcsClient,
};

use crate::{
    context::CommandContext,
    hooks::{hook_env, run_hooks},
    pre_execute::{LockMode, PreExecuteResult, PreExecution, ProjectPreExecute},
    result::{CommandResult, ProjectOutcome, ProjectResult},
    terraform::Terraform,
    webhooks::{ApplyResult, WebhookSender},
    workspace::Workspace,
};

pub struct ApplyExecutor {
    pub vcs_client: Arc<dyn VcsClient>,
    pub terraform: Arc<dyn Terraform>,
    pub workspace: Arc<dyn Workspace>,
    pub pre_execute: ProjectPreExecute,
    pub plan_store: Arc<dyn PlanStore>,
    pub webhooks: Arc<dyn WebhookSender>,
    pub require_approval: bool,
}

fn short_commit(commit: &str) -> &str { commit.get(..8).unwrap_or(commit) }

impl ApplyExecutor {
    /// Applies the plan for the directory given with `-d`, or every plan
    /// this pull request holds in the workspace.
    pub async fn execute(&self, ctx: &CommandContext) -> CommandResult {
        let workspace = ctx.command.workspace();
        let projects = if let Some(dir) = &ctx.command.dir {
            vec![Project::new(&ctx.base_repo.full_name, dir)]
        } else {
            match self.plan_store.plans_for_pull(&ctx.base_repo.full_name, ctx.pull.num, workspace).await {
                Ok(plans) if plans.is_empty() => {
                    return CommandResult::failure(format!(
                        "No plans found for workspace `{workspace}`. Run plan first."
                    ));
                }
                Ok(plans) => plans.into_iter().map(|plan| plan.project).collect::<Vec<_>>(),
                Err(e) => return CommandResult::error(e.context("Failed to load plans")),
            }
        };

        if self.require_approval {
            match self.vcs_client.pull_is_approved(&ctx.base_repo, &ctx.pull).await {
                Ok(true) => {}
                Ok(false) => {
                    let results = projects
                        .iter()
                        .map(|project| {
                            ProjectResult::failure(
                                project,
                                workspace,
                                "Pull request must be approved before running apply.",
                            )
                        })
                        .collect();
                    return CommandResult::from_projects(results);
                }
                Err(e) => {
                    return CommandResult::error(e.context("Failed to check pull request approval"));
                }
            }
        }

        let repo_dir =
            match self.workspace.get_workspace(&ctx.base_repo, &ctx.pull, workspace).await {
                Ok(dir) => dir,
                Err(e) => return CommandResult::error(e),
            };
        let mut results = Vec::with_capacity(projects.len());
        for project in &projects {
            results.push(self.apply_project(ctx, &repo_dir, project).await);
        }
        CommandResult::from_projects(results)
    }

    /// Checks a project's plan is current before applying it. Stale or
    /// missing plans fail without touching the lock.
    async fn check_plan(
        &self,
        ctx: &CommandContext,
        project: &Project,
    ) -> Result<PlanRecord, ProjectResult> {
        let workspace = ctx.command.workspace();
        let plan = match self.plan_store.get_plan(&lock_id(project, workspace)).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                return Err(ProjectResult::failure(
                    project,
                    workspace,
                    format!(
                        "No plan found for `{}` workspace `{workspace}`. Run plan first.",
                        project.path
                    ),
                ));
            }
            Err(e) => return Err(ProjectResult::error(project, workspace, e)),
        };
        if plan.pull_num != ctx.pull.num {
            return Err(ProjectResult::failure(
                project,
                workspace,
                format!("The plan for `{}` belongs to pull #{}.", project.path, plan.pull_num),
            ));
        }
        if plan.head_commit != ctx.pull.head_commit {
            return Err(ProjectResult::failure(
                project,
                workspace,
                format!(
                    "The plan for `{}` was made at commit {} but the pull request is now at {}. \
                     Run plan again.",
                    project.path,
                    short_commit(&plan.head_commit),
                    short_commit(&ctx.pull.head_commit),
                ),
            ));
        }
        if !tokio::fs::try_exists(&plan.plan_path).await.unwrap_or(false) {
            return Err(ProjectResult::failure(
                project,
                workspace,
                format!("The plan file for `{}` is missing. Run plan again.", project.path),
            ));
        }
        Ok(plan)
    }

    async fn apply_project(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
        project: &Project,
    ) -> ProjectResult {
        let workspace = ctx.command.workspace();
        let plan = match self.check_plan(ctx, project).await {
            Ok(plan) => plan,
            Err(result) => return result,
        };
        let PreExecuteResult { lock, project_dir, config, mut log } =
            match self.pre_execute.execute(ctx, repo_dir, project, LockMode::Existing).await {
                PreExecution::Ready(ready) => ready,
                PreExecution::Stopped(result) => return result,
            };

        let env = hook_env(ctx, project);
        let result: Result<String> = async {
            if !config.pre_apply.is_empty() {
                let output = run_hooks(&project_dir, &config.pre_apply, &env)
                    .await
                    .context("Failed to run pre_apply commands")?;
                log.push_str(&output);
            }
            let mut args = config.extra_arguments("apply");
            args.extend(ctx.command.flags.iter().cloned());
            args.push(plan.plan_path.clone());
            let output = self.terraform.apply(&project_dir, &args).await?;
            if !config.post_apply.is_empty() {
                let hook_output = run_hooks(&project_dir, &config.post_apply, &env)
                    .await
                    .context("Failed to run post_apply commands")?;
                log.push_str(&hook_output);
            }
            Ok(output)
        }
        .await;

        // Applied or not, the plan is spent
        if let Err(e) = lock.release().await {
            tracing::error!("Failed to release lock after apply: {e:?}");
        }
        if let Err(e) = self.plan_store.delete_plan(&plan.lock_id()).await {
            tracing::error!("Failed to delete plan after apply: {e:?}");
        }

        let apply_result = ApplyResult {
            workspace: workspace.to_string(),
            repo: ctx.base_repo.clone(),
            pull: ctx.pull.clone(),
            user: ctx.user.clone(),
            success: result.is_ok(),
            directory: project.path.clone(),
        };
        if let Err(e) = self.webhooks.send(&apply_result).await {
            tracing::warn!("Failed to send apply webhooks: {e:?}");
        }

        let project_result = match result {
            Ok(output) => {
                tracing::info!("Applied {} in {workspace}", project.path);
                ProjectResult::new(project, workspace, ProjectOutcome::ApplySuccess(output))
            }
            Err(e) => ProjectResult::error(project, workspace, e),
        };
        project_result.with_log(log)
    }
}
