use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Lock, PlanRecord};

/// Durable storage for locks. Implementations must make `try_lock` a single
/// atomic insert-if-absent.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Stores `lock` unless a lock with the same id exists. Returns whether
    /// the lock was stored, and the lock now held for that id.
    async fn try_lock(&self, lock: &Lock) -> Result<(bool, Lock)>;

    /// Removes a lock and any plan saved under it. Returns `None` if there
    /// was no such lock.
    async fn unlock(&self, id: &str) -> Result<Option<Lock>>;

    async fn list(&self) -> Result<Vec<Lock>>;

    async fn get_lock(&self, id: &str) -> Result<Option<Lock>>;

    /// Overwrites the pull request details and user of a lock, provided the
    /// same pull request still holds it. Returns whether a lock was updated.
    async fn refresh(&self, lock: &Lock) -> Result<bool>;

    /// Removes every lock and plan held by a pull request.
    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<Lock>>;
}

/// Durable storage for plans awaiting apply, keyed like locks.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save_plan(&self, plan: &PlanRecord) -> Result<()>;

    async fn get_plan(&self, lock_id: &str) -> Result<Option<PlanRecord>>;

    async fn plans_for_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<Vec<PlanRecord>>;

    async fn delete_plan(&self, lock_id: &str) -> Result<()>;
}
