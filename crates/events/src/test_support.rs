//! In-memory collaborators for exercising the command engine without a
//! database, VCS host or terraform binary.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use terrapin_core::{
    locking::{LockBackend, PlanStore},
    models::{CommentEvent, Lock, PlanRecord, PullRequest, PullState, Repo, User, VcsHost},
    vcs::{CommitStatus, VcsClient},
};
use tokio::sync::Notify;
use url::Url;

use crate::{
    apply::ApplyExecutor,
    command::{Command, CommandName, CommentParser},
    command_handler::CommandHandler,
    context::CommandContext,
    env_locker::EnvLocker,
    locking::LockingClient,
    plan::PlanExecutor,
    pre_execute::ProjectPreExecute,
    project_finder::ProjectFinder,
    terraform::{PlanOutput, Terraform, TerraformError},
    webhooks::{ApplyResult, WebhookSender},
    workspace::Workspace,
};

pub const HEAD_COMMIT: &str = "0123456789abcdef";

pub fn repo(full_name: &str) -> Repo {
    Repo::new(
        VcsHost::GitHub,
        full_name,
        &format!("https://github.com/{full_name}.git"),
        "terrapin-bot",
        "token",
    )
    .unwrap()
}

pub fn pull(num: u64) -> PullRequest {
    PullRequest {
        num,
        head_commit: HEAD_COMMIT.to_string(),
        branch: "feature".to_string(),
        author: "alice".to_string(),
        url: format!("https://github.com/owner/repo/pull/{num}"),
        state: PullState::Open,
    }
}

pub fn user(username: &str) -> User { User { username: username.to_string() } }

pub fn context(name: CommandName, pull_num: u64, username: &str) -> CommandContext {
    CommandContext::new(
        repo("owner/repo"),
        repo("owner/repo"),
        pull(pull_num),
        user(username),
        Command::new(name),
    )
}

pub fn comment_event(comment: &str, pull_num: u64) -> CommentEvent {
    CommentEvent {
        base_repo: repo("owner/repo"),
        user: user("alice"),
        pull_num,
        comment: comment.to_string(),
    }
}

pub fn write_files(dir: &Path, files: &[&str]) {
    for file in files {
        let path = dir.join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "# test\n").unwrap();
    }
}

#[derive(Default)]
struct MemoryState {
    locks: BTreeMap<String, Lock>,
    plans: BTreeMap<String, PlanRecord>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    try_lock_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn contains(&self, id: &str) -> bool { self.state.lock().unwrap().locks.contains_key(id) }

    pub fn is_empty(&self) -> bool { self.state.lock().unwrap().locks.is_empty() }

    pub fn lock(&self, id: &str) -> Option<Lock> { self.state.lock().unwrap().locks.get(id).cloned() }

    pub fn plan(&self, id: &str) -> Option<PlanRecord> {
        self.state.lock().unwrap().plans.get(id).cloned()
    }

    pub fn try_lock_calls(&self) -> usize { self.try_lock_calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn try_lock(&self, lock: &Lock) -> Result<(bool, Lock)> {
        self.try_lock_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.locks.get(&lock.id()) {
            return Ok((false, existing.clone()));
        }
        state.locks.insert(lock.id(), lock.clone());
        Ok((true, lock.clone()))
    }

    async fn unlock(&self, id: &str) -> Result<Option<Lock>> {
        let mut state = self.state.lock().unwrap();
        state.plans.remove(id);
        Ok(state.locks.remove(id))
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        Ok(self.state.lock().unwrap().locks.values().cloned().collect())
    }

    async fn get_lock(&self, id: &str) -> Result<Option<Lock>> { Ok(self.lock(id)) }

    async fn refresh(&self, lock: &Lock) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.locks.get_mut(&lock.id()) {
            Some(existing) if existing.pull.num == lock.pull.num => {
                existing.pull = lock.pull.clone();
                existing.user = lock.user.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<Lock>> {
        let mut state = self.state.lock().unwrap();
        let ids = state
            .locks
            .values()
            .filter(|l| l.project.repo_full_name == repo_full_name && l.pull.num == pull_num)
            .map(Lock::id)
            .collect::<Vec<_>>();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            state.plans.remove(&id);
            removed.extend(state.locks.remove(&id));
        }
        Ok(removed)
    }
}

#[async_trait]
impl PlanStore for MemoryBackend {
    async fn save_plan(&self, plan: &PlanRecord) -> Result<()> {
        self.state.lock().unwrap().plans.insert(plan.lock_id(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, lock_id: &str) -> Result<Option<PlanRecord>> { Ok(self.plan(lock_id)) }

    async fn plans_for_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<Vec<PlanRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .plans
            .values()
            .filter(|p| {
                p.project.repo_full_name == repo_full_name
                    && p.pull_num == pull_num
                    && p.workspace == workspace
            })
            .cloned()
            .collect())
    }

    async fn delete_plan(&self, lock_id: &str) -> Result<()> {
        self.state.lock().unwrap().plans.remove(lock_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeVcs {
    modified_files: Mutex<Vec<String>>,
    pub approved: AtomicBool,
    closed: AtomicBool,
    comments: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(CommitStatus, String)>>,
}

impl FakeVcs {
    pub fn set_modified_files(&self, files: &[&str]) {
        *self.modified_files.lock().unwrap() = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn close_pull(&self) { self.closed.store(true, Ordering::SeqCst) }

    pub fn comments(&self) -> Vec<String> { self.comments.lock().unwrap().clone() }

    pub fn statuses(&self) -> Vec<(CommitStatus, String)> { self.statuses.lock().unwrap().clone() }
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<(PullRequest, Repo)> {
        let mut pull = pull(num);
        if self.closed.load(Ordering::SeqCst) {
            pull.state = PullState::Closed;
        }
        Ok((pull, repo.clone()))
    }

    async fn get_modified_files(&self, _repo: &Repo, _pull: &PullRequest) -> Result<Vec<String>> {
        Ok(self.modified_files.lock().unwrap().clone())
    }

    async fn create_comment(&self, _repo: &Repo, _pull: &PullRequest, body: &str) -> Result<()> {
        self.comments.lock().unwrap().push(body.to_string());
        Ok(())
    }

    async fn update_status(
        &self,
        _repo: &Repo,
        _pull: &PullRequest,
        status: CommitStatus,
        description: &str,
    ) -> Result<()> {
        self.statuses.lock().unwrap().push((status, description.to_string()));
        Ok(())
    }

    async fn pull_is_approved(&self, _repo: &Repo, _pull: &PullRequest) -> Result<bool> {
        Ok(self.approved.load(Ordering::SeqCst))
    }
}

/// Lets a test hold a plan mid-run.
#[derive(Default)]
pub struct Blocker {
    pub started: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct FakeTerraform {
    pub init_calls: AtomicUsize,
    pub apply_calls: AtomicUsize,
    pub fail_init: AtomicBool,
    pub fail_apply: AtomicBool,
    fail_plan_dirs: Mutex<Vec<String>>,
    plan_args: Mutex<Vec<Vec<String>>>,
    blocker: Mutex<Option<Arc<Blocker>>>,
}

impl FakeTerraform {
    /// Plans fail in project directories ending with `dir`.
    pub fn fail_plan_in(&self, dir: &str) { self.fail_plan_dirs.lock().unwrap().push(dir.to_string()) }

    pub fn plan_args(&self) -> Vec<Vec<String>> { self.plan_args.lock().unwrap().clone() }

    pub fn block_plans(&self) -> Arc<Blocker> {
        let blocker = Arc::new(Blocker::default());
        *self.blocker.lock().unwrap() = Some(blocker.clone());
        blocker
    }

    fn exit_error(command: &str) -> TerraformError {
        TerraformError::Exit {
            command: command.to_string(),
            code: 1,
            output: format!("{command} failed"),
        }
    }
}

#[async_trait]
impl Terraform for FakeTerraform {
    async fn init(&self, _dir: &Path, _args: &[String]) -> Result<String, TerraformError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Self::exit_error("init"));
        }
        Ok("Terraform has been successfully initialized!\n".to_string())
    }

    async fn select_workspace(
        &self,
        _dir: &Path,
        _workspace: &str,
    ) -> Result<String, TerraformError> {
        Ok(String::new())
    }

    async fn plan(&self, dir: &Path, args: &[String]) -> Result<PlanOutput, TerraformError> {
        self.plan_args.lock().unwrap().push(args.to_vec());
        let blocker = self.blocker.lock().unwrap().clone();
        if let Some(blocker) = blocker {
            blocker.started.notify_one();
            blocker.release.notified().await;
        }
        let fail = self.fail_plan_dirs.lock().unwrap().iter().any(|d| dir.ends_with(d));
        if fail {
            return Err(Self::exit_error("plan"));
        }
        if let Some(out) = args.iter().find_map(|a| a.strip_prefix("-out=")) {
            std::fs::write(out, "plan").unwrap();
        }
        Ok(PlanOutput { output: "+ resource \"null_resource\" \"a\"".to_string(), changes_present: true })
    }

    async fn apply(&self, _dir: &Path, _args: &[String]) -> Result<String, TerraformError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Self::exit_error("apply"));
        }
        Ok("Apply complete! Resources: 1 added, 0 changed, 0 destroyed.".to_string())
    }
}

/// Checkouts under a temporary directory, populated with a fixed file list.
pub struct FakeWorkspace {
    root: tempfile::TempDir,
    files: Vec<String>,
    deleted: Mutex<Vec<u64>>,
}

impl FakeWorkspace {
    pub fn new(files: &[&str]) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            files: files.iter().map(|f| f.to_string()).collect(),
            deleted: Mutex::default(),
        }
    }

    pub fn deleted(&self) -> Vec<u64> { self.deleted.lock().unwrap().clone() }

    fn dir(&self, pull: &PullRequest, workspace: &str) -> PathBuf {
        self.root.path().join(pull.num.to_string()).join(workspace)
    }
}

#[async_trait]
impl Workspace for FakeWorkspace {
    async fn checkout(
        &self,
        _base_repo: &Repo,
        _head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf> {
        let dir = self.dir(pull, workspace);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        let files = self.files.iter().map(String::as_str).collect::<Vec<_>>();
        write_files(&dir, &files);
        Ok(dir)
    }

    async fn get_workspace(
        &self,
        _base_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf> {
        let dir = self.dir(pull, workspace);
        if !dir.exists() {
            bail!("No checkout for pull #{}", pull.num);
        }
        Ok(dir)
    }

    async fn delete(&self, _base_repo: &Repo, pull: &PullRequest) -> Result<()> {
        self.deleted.lock().unwrap().push(pull.num);
        let dir = self.root.path().join(pull.num.to_string());
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWebhooks {
    sent: Mutex<Vec<ApplyResult>>,
}

impl FakeWebhooks {
    pub fn sent(&self) -> Vec<ApplyResult> { self.sent.lock().unwrap().clone() }
}

#[async_trait]
impl WebhookSender for FakeWebhooks {
    async fn send(&self, result: &ApplyResult) -> Result<()> {
        self.sent.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Shared handles to the fakes behind a [`CommandHandler`].
pub struct Fakes {
    pub backend: Arc<MemoryBackend>,
    pub vcs: Arc<FakeVcs>,
    pub terraform: Arc<FakeTerraform>,
    pub workspace: Arc<FakeWorkspace>,
    pub webhooks: Arc<FakeWebhooks>,
}

/// Plan and apply executors wired to fakes.
pub struct TestEnv {
    pub backend: Arc<MemoryBackend>,
    pub vcs: Arc<FakeVcs>,
    pub terraform: Arc<FakeTerraform>,
    pub workspace: Arc<FakeWorkspace>,
    pub webhooks: Arc<FakeWebhooks>,
    pub plan: PlanExecutor,
    pub apply: ApplyExecutor,
}

impl TestEnv {
    /// Every checkout contains `files`.
    pub fn new(files: &[&str]) -> Self {
        let backend = Arc::new(MemoryBackend::default());
        let vcs = Arc::new(FakeVcs::default());
        let terraform = Arc::new(FakeTerraform::default());
        let workspace = Arc::new(FakeWorkspace::new(files));
        let webhooks = Arc::new(FakeWebhooks::default());
        let pre_execute =
            ProjectPreExecute::new(LockingClient::new(backend.clone()), terraform.clone());
        let plan = PlanExecutor {
            vcs_client: vcs.clone(),
            terraform: terraform.clone(),
            workspace: workspace.clone(),
            pre_execute: pre_execute.clone(),
            plan_store: backend.clone(),
            project_finder: ProjectFinder,
            server_url: Url::parse("https://terrapin.example.com").unwrap(),
        };
        let apply = ApplyExecutor {
            vcs_client: vcs.clone(),
            terraform: terraform.clone(),
            workspace: workspace.clone(),
            pre_execute,
            plan_store: backend.clone(),
            webhooks: webhooks.clone(),
            require_approval: false,
        };
        Self { backend, vcs, terraform, workspace, webhooks, plan, apply }
    }

    pub async fn checkout(&self, ctx: &CommandContext) -> PathBuf {
        self.workspace
            .checkout(&ctx.base_repo, &ctx.head_repo, &ctx.pull, ctx.command.workspace())
            .await
            .unwrap()
    }

    pub fn handler(self) -> (CommandHandler, Fakes) {
        let handler = CommandHandler {
            plan_executor: Arc::new(self.plan),
            apply_executor: Arc::new(self.apply),
            vcs_client: self.vcs.clone(),
            env_locker: Arc::new(EnvLocker::new()),
            parser: CommentParser::new(vec!["terrapin".to_string(), "@terrapin-bot".to_string()]),
            bot_users: vec!["terrapin-bot".to_string()],
        };
        let fakes = Fakes {
            backend: self.backend,
            vcs: self.vcs,
            terraform: self.terraform,
            workspace: self.workspace,
            webhooks: self.webhooks,
        };
        (handler, fakes)
    }
}
