use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// In-memory guard against running the same command twice at once, e.g. when
/// a webhook is delivered twice. Keyed by repo, workspace and pull request.
///
/// State lives only as long as the process; the durable lock in
/// [`crate::locking::LockingClient`] is what keeps different pull requests apart.
#[derive(Default)]
pub struct EnvLocker {
    held: Mutex<HashSet<String>>,
}

/// Releases its key when dropped.
#[must_use]
pub struct EnvLockGuard<'a> {
    locker: &'a EnvLocker,
    key: String,
}

impl Drop for EnvLockGuard<'_> {
    fn drop(&mut self) { self.locker.held().remove(&self.key); }
}

fn key(repo_full_name: &str, workspace: &str, pull_num: u64) -> String {
    format!("{repo_full_name}/{workspace}/{pull_num}")
}

impl EnvLocker {
    pub fn new() -> Self { Self::default() }

    /// Returns `None` if the key is already held.
    pub fn try_lock(
        &self,
        repo_full_name: &str,
        workspace: &str,
        pull_num: u64,
    ) -> Option<EnvLockGuard<'_>> {
        let key = key(repo_full_name, workspace, pull_num);
        if !self.held().insert(key.clone()) {
            return None;
        }
        Some(EnvLockGuard { locker: self, key })
    }

    /// Releases a key without a guard. Safe to call when it isn't held.
    pub fn unlock(&self, repo_full_name: &str, workspace: &str, pull_num: u64) {
        self.held().remove(&key(repo_full_name, workspace, pull_num));
    }

    pub fn is_locked(&self, repo_full_name: &str, workspace: &str, pull_num: u64) -> bool {
        self.held().contains(&key(repo_full_name, workspace, pull_num))
    }

    // The set stays consistent even if a holder panicked.
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
