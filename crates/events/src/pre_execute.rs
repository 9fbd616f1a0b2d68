use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use terrapin_core::models::{Lock, Project, lock_id};

use crate::{
    context::CommandContext,
    hooks::{hook_env, run_hooks},
    locking::{HeldLock, LockingClient},
    project_config::ProjectConfig,
    result::ProjectResult,
    terraform::Terraform,
};

/// How the gate obtains the project lock.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LockMode {
    /// Take the lock, or reuse it if this pull request already holds it (plan).
    Acquire,
    /// Require the lock to be held by this pull request already (apply).
    Existing,
}

/// A project that passed the gate: locked, initialized and on the right workspace.
pub struct PreExecuteResult {
    pub lock: HeldLock,
    pub project_dir: PathBuf,
    pub config: ProjectConfig,
    /// Hook and init output.
    pub log: String,
}

pub enum PreExecution {
    Ready(PreExecuteResult),
    /// The project can't run; the result says why.
    Stopped(ProjectResult),
}

/// Checks run before any plan or apply of a project.
#[derive(Clone)]
pub struct ProjectPreExecute {
    pub locker: LockingClient,
    pub terraform: Arc<dyn Terraform>,
}

impl ProjectPreExecute {
    pub fn new(locker: LockingClient, terraform: Arc<dyn Terraform>) -> Self {
        Self { locker, terraform }
    }

    /// Validates the project directory, takes the lock and initializes
    /// terraform. If initialization fails the lock is released again.
    pub async fn execute(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
        project: &Project,
        mode: LockMode,
    ) -> PreExecution {
        let workspace = ctx.command.workspace();
        let project_dir = match validate_project_dir(repo_dir, project).await {
            Ok(dir) => dir,
            Err(stop) => return PreExecution::Stopped(ProjectResult::failure(project, workspace, stop)),
        };
        let lock = match self.lock(ctx, project, mode).await {
            Ok(lock) => lock,
            Err(stopped) => return PreExecution::Stopped(stopped),
        };
        match self.initialize(ctx, &project_dir, project).await {
            Ok((config, log)) => {
                PreExecution::Ready(PreExecuteResult { lock, project_dir, config, log })
            }
            Err(e) => {
                tracing::warn!("Initializing {} failed, releasing lock {}", project.path, lock.id());
                if let Err(unlock_err) = lock.release().await {
                    tracing::error!("Failed to release lock: {unlock_err:?}");
                }
                PreExecution::Stopped(ProjectResult::error(project, workspace, e))
            }
        }
    }

    async fn lock(
        &self,
        ctx: &CommandContext,
        project: &Project,
        mode: LockMode,
    ) -> Result<HeldLock, ProjectResult> {
        let workspace = ctx.command.workspace();
        let lock = match mode {
            LockMode::Acquire => {
                let response = self
                    .locker
                    .try_lock(project, workspace, &ctx.pull, &ctx.user)
                    .await
                    .map_err(|e| ProjectResult::error(project, workspace, e))?;
                if response.lock_acquired {
                    response.current_lock
                } else if held_by_pull(&response.current_lock, ctx) {
                    let lock = Lock {
                        pull: ctx.pull.clone(),
                        user: ctx.user.clone(),
                        ..response.current_lock
                    };
                    match self.locker.refresh(&lock).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!("Lock {} changed hands while re-planning", lock.id())
                        }
                        Err(e) => tracing::warn!("Failed to refresh lock {}: {e:?}", lock.id()),
                    }
                    lock
                } else {
                    return Err(ProjectResult::failure(
                        project,
                        workspace,
                        lock_conflict_message(&response.current_lock),
                    ));
                }
            }
            LockMode::Existing => {
                let id = lock_id(project, workspace);
                match self.locker.get_lock(&id).await {
                    Ok(Some(lock)) if held_by_pull(&lock, ctx) => lock,
                    Ok(Some(lock)) => {
                        return Err(ProjectResult::failure(
                            project,
                            workspace,
                            lock_conflict_message(&lock),
                        ));
                    }
                    Ok(None) => {
                        return Err(ProjectResult::failure(
                            project,
                            workspace,
                            format!(
                                "No lock is held for `{}` workspace `{workspace}`. Run plan first.",
                                project.path
                            ),
                        ));
                    }
                    Err(e) => return Err(ProjectResult::error(project, workspace, e)),
                }
            }
        };
        Ok(HeldLock::new(self.locker.clone(), lock))
    }

    async fn initialize(
        &self,
        ctx: &CommandContext,
        project_dir: &Path,
        project: &Project,
    ) -> Result<(ProjectConfig, String)> {
        let config = ProjectConfig::read(project_dir).await?;
        let mut log = String::new();
        if !config.pre_init.is_empty() {
            let env = hook_env(ctx, project);
            let output = run_hooks(project_dir, &config.pre_init, &env)
                .await
                .context("Failed to run pre_init commands")?;
            log.push_str(&output);
        }
        log.push_str(&self.terraform.init(project_dir, &config.extra_arguments("init")).await?);
        log.push_str(&self.terraform.select_workspace(project_dir, ctx.command.workspace()).await?);
        Ok((config, log))
    }
}

fn held_by_pull(lock: &Lock, ctx: &CommandContext) -> bool {
    lock.pull.num == ctx.pull.num && lock.project.repo_full_name == ctx.base_repo.full_name
}

pub fn lock_conflict_message(lock: &Lock) -> String {
    format!(
        "This project is currently locked by an unapplied plan from pull #{} ({}) by {}. \
         To continue, apply that plan and merge the pull request, or delete its lock. \
         Then comment `terrapin plan` here again.",
        lock.pull.num, lock.pull.url, lock.user.username
    )
}

/// Resolves the project directory within the checkout. Returns a user-facing
/// message when it can't be run.
async fn validate_project_dir(repo_dir: &Path, project: &Project) -> Result<PathBuf, String> {
    if project.path.split('/').any(|c| c == "..") {
        return Err(format!("Directory `{}` can't contain `..`.", project.path));
    }
    let dir = if project.path == "." { repo_dir.to_path_buf() } else { repo_dir.join(&project.path) };
    if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(format!("Directory `{}` does not exist.", project.path));
    }
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| format!("Failed to read directory `{}`: {e}", project.path))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().ends_with(".tf") {
            return Ok(dir);
        }
    }
    Err(format!("Directory `{}` contains no terraform files.", project.path))
}
