use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use terrapin_core::{
    locking::LockBackend,
    models::{Lock, Project, PullRequest, User, lock_id},
};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct TryLockResponse {
    /// Whether this call created the lock.
    pub lock_acquired: bool,
    /// The lock now held for the key: ours if acquired, otherwise the holder's.
    pub current_lock: Lock,
    pub lock_id: String,
}

/// Durable locks on project workspaces, shared by every server process
/// using the same backend.
#[derive(Clone)]
pub struct LockingClient {
    backend: Arc<dyn LockBackend>,
}

impl LockingClient {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self { Self { backend } }

    /// Never succeeds while a lock exists for the key, even for the pull
    /// request that holds it.
    pub async fn try_lock(
        &self,
        project: &Project,
        workspace: &str,
        pull: &PullRequest,
        user: &User,
    ) -> Result<TryLockResponse> {
        let lock = Lock {
            project: project.clone(),
            workspace: workspace.to_string(),
            pull: pull.clone(),
            user: user.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        let (lock_acquired, current_lock) = self.backend.try_lock(&lock).await?;
        Ok(TryLockResponse { lock_acquired, current_lock, lock_id: lock_id(project, workspace) })
    }

    pub async fn unlock(&self, id: &str) -> Result<Option<Lock>> { self.backend.unlock(id).await }

    pub async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<Lock>> {
        self.backend.unlock_by_pull(repo_full_name, pull_num).await
    }

    pub async fn list(&self) -> Result<BTreeMap<String, Lock>> {
        Ok(self.backend.list().await?.into_iter().map(|lock| (lock.id(), lock)).collect())
    }

    pub async fn get_lock(&self, id: &str) -> Result<Option<Lock>> {
        self.backend.get_lock(id).await
    }

    /// Records the latest commit and user on a lock its pull request re-took.
    pub async fn refresh(&self, lock: &Lock) -> Result<bool> { self.backend.refresh(lock).await }
}

/// A durable lock held on behalf of a running command.
///
/// Call [`HeldLock::retain`] to keep it past the command (a successful plan)
/// or [`HeldLock::release`] to drop it. If neither happens, for instance
/// because the task panicked, dropping the value schedules the unlock.
#[must_use]
pub struct HeldLock {
    client: LockingClient,
    lock: Lock,
    armed: bool,
}

impl HeldLock {
    pub fn new(client: LockingClient, lock: Lock) -> Self { Self { client, lock, armed: true } }

    pub fn id(&self) -> String { self.lock.id() }

    pub fn lock(&self) -> &Lock { &self.lock }

    pub fn retain(mut self) -> Lock {
        self.armed = false;
        self.lock.clone()
    }

    pub async fn release(mut self) -> Result<Option<Lock>> {
        self.armed = false;
        self.client.unlock(&self.lock.id()).await
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.lock.id();
        let client = self.client.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Releasing lock {id} left held by an interrupted command");
                handle.spawn(async move {
                    if let Err(e) = client.unlock(&id).await {
                        tracing::error!("Failed to release lock {id}: {e:?}");
                    }
                });
            }
            Err(_) => tracing::error!("Lock {id} left held: no runtime to release it"),
        }
    }
}
