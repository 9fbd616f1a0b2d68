use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use terrapin_core::{
    locking::PlanStore,
    models::{PlanRecord, Project, lock_id},
    util::lock_url,
    vcs::VcsClient,
};
use time::OffsetDateTime;
use tracing::Instrument;
use url::Url;

use crate::{
    context::CommandContext,
    env_locker::EnvLocker,
    hooks::{hook_env, run_hooks},
    pre_execute::{LockMode, PreExecuteResult, PreExecution, ProjectPreExecute},
    project_finder::ProjectFinder,
    result::{CommandResult, PlanSuccess, ProjectOutcome, ProjectResult},
    terraform::{PlanOutput, Terraform},
    workspace::Workspace,
};

/// Outcome of [`PlanExecutor::plan_detached`].
#[derive(Debug)]
pub enum DetachedPlan {
    /// Another plan for the same repo and workspace is still running.
    AlreadyRunning,
    Finished(CommandResult),
}

pub struct PlanExecutor {
    pub vcs_client: Arc<dyn VcsClient>,
    pub terraform: Arc<dyn Terraform>,
    pub workspace: Arc<dyn Workspace>,
    pub pre_execute: ProjectPreExecute,
    pub plan_store: Arc<dyn PlanStore>,
    pub project_finder: ProjectFinder,
    /// Base for links to lock pages.
    pub server_url: Url,
}

impl PlanExecutor {
    /// Plans the directory given with `-d`, or every project the pull
    /// request modifies.
    pub async fn execute(&self, ctx: &CommandContext) -> CommandResult {
        let projects = if let Some(dir) = &ctx.command.dir {
            vec![Project::new(&ctx.base_repo.full_name, dir)]
        } else {
            let modified_files =
                match self.vcs_client.get_modified_files(&ctx.base_repo, &ctx.pull).await {
                    Ok(files) => files,
                    Err(e) => {
                        return CommandResult::error(e.context("Failed to get modified files"));
                    }
                };
            let projects =
                self.project_finder.find_modified_projects(&ctx.base_repo.full_name, &modified_files);
            tracing::info!(
                "{} modified files map to {} projects",
                modified_files.len(),
                projects.len()
            );
            if projects.is_empty() {
                return CommandResult::failure("No terraform files were modified.");
            }
            projects
        };
        self.run_plan(ctx, &projects).await
    }

    /// Checks out the pull request and plans each project in order.
    pub async fn run_plan(&self, ctx: &CommandContext, projects: &[Project]) -> CommandResult {
        let repo_dir = match self
            .workspace
            .checkout(&ctx.base_repo, &ctx.head_repo, &ctx.pull, ctx.command.workspace())
            .await
        {
            Ok(dir) => dir,
            Err(e) => return CommandResult::error(e.context("Failed to check out pull request")),
        };
        let mut results = Vec::with_capacity(projects.len());
        for project in projects {
            results.push(self.plan_project(ctx, &repo_dir, project).await);
        }
        CommandResult::from_projects(results)
    }

    /// Plans a single project outside of a pull request review, then releases
    /// its lock. The plan runs on its own task and keeps its guards until
    /// terraform exits, even if the caller stops waiting.
    pub async fn plan_detached(
        self: &Arc<Self>,
        env_locker: Arc<EnvLocker>,
        ctx: CommandContext,
        project: Project,
    ) -> Result<DetachedPlan> {
        let executor = self.clone();
        let task = tokio::spawn(async move {
            let workspace = ctx.command.workspace().to_string();
            let Some(_guard) =
                env_locker.try_lock(&ctx.base_repo.full_name, &workspace, ctx.pull.num)
            else {
                return Ok(DetachedPlan::AlreadyRunning);
            };
            let span = ctx.log.clone();
            let result =
                executor.run_plan(&ctx, std::slice::from_ref(&project)).instrument(span).await;
            let planned = result
                .project_results
                .iter()
                .any(|r| matches!(r.outcome, ProjectOutcome::PlanSuccess(_)));
            if planned {
                executor.pre_execute.locker.unlock(&lock_id(&project, &workspace)).await?;
            }
            Ok::<_, anyhow::Error>(DetachedPlan::Finished(result))
        });
        task.await.context("Plan task failed")?
    }

    async fn plan_project(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
        project: &Project,
    ) -> ProjectResult {
        let workspace = ctx.command.workspace();
        let PreExecuteResult { lock, project_dir, config, mut log } =
            match self.pre_execute.execute(ctx, repo_dir, project, LockMode::Acquire).await {
                PreExecution::Ready(ready) => ready,
                PreExecution::Stopped(result) => return result,
            };
        let plan_path = project_dir.join(format!("{workspace}.tfplan"));

        let result: Result<PlanOutput> = async {
            if !config.pre_plan.is_empty() {
                let output = run_hooks(&project_dir, &config.pre_plan, &hook_env(ctx, project))
                    .await
                    .context("Failed to run pre_plan commands")?;
                log.push_str(&output);
            }
            let mut args = config.extra_arguments("plan");
            let var_file = project_dir.join("env").join(format!("{workspace}.tfvars"));
            if tokio::fs::try_exists(&var_file).await.unwrap_or(false) {
                args.push(format!("-var-file={}", var_file.display()));
            }
            args.push(format!("-out={}", plan_path.display()));
            args.extend(ctx.command.flags.iter().cloned());
            Ok(self.terraform.plan(&project_dir, &args).await?)
        }
        .await;

        let plan = match result {
            Ok(plan) => plan,
            Err(e) => {
                if let Err(unlock_err) = lock.release().await {
                    tracing::error!("Failed to release lock after failed plan: {unlock_err:?}");
                }
                return ProjectResult::error(project, workspace, e).with_log(log);
            }
        };

        let record = PlanRecord {
            project: project.clone(),
            workspace: workspace.to_string(),
            pull_num: ctx.pull.num,
            head_commit: ctx.pull.head_commit.clone(),
            plan_path: plan_path.to_string_lossy().into_owned(),
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.plan_store.save_plan(&record).await {
            if let Err(unlock_err) = lock.release().await {
                tracing::error!("Failed to release lock after failed plan: {unlock_err:?}");
            }
            return ProjectResult::error(project, workspace, e.context("Failed to save plan"))
                .with_log(log);
        }
        let lock = lock.retain();
        tracing::info!(changes = plan.changes_present, "Planned {} in {workspace}", project.path);
        ProjectResult::new(
            project,
            workspace,
            ProjectOutcome::PlanSuccess(PlanSuccess {
                terraform_output: plan.output,
                changes_present: plan.changes_present,
                lock_url: lock_url(&self.server_url, &lock.id()).to_string(),
            }),
        )
        .with_log(log)
    }
}
