use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Sqlite, SqlitePool, migrate::MigrateDatabase};
use terrapin_core::{
    config::DbConfig,
    locking::{LockBackend, PlanStore},
    models::{Lock, PlanRecord, Project, PullRequest, PullState, User},
};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

#[derive(sqlx::FromRow)]
struct LockRow {
    repo_full_name: String,
    path: String,
    workspace: String,
    pull_num: i64,
    pull_head_commit: String,
    pull_branch: String,
    pull_author: String,
    pull_url: String,
    username: String,
    created_at: OffsetDateTime,
}

impl From<LockRow> for Lock {
    fn from(row: LockRow) -> Self {
        Lock {
            project: Project { repo_full_name: row.repo_full_name, path: row.path },
            workspace: row.workspace,
            pull: PullRequest {
                num: row.pull_num as u64,
                head_commit: row.pull_head_commit,
                branch: row.pull_branch,
                author: row.pull_author,
                url: row.pull_url,
                state: PullState::Open,
            },
            user: User { username: row.username },
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    repo_full_name: String,
    path: String,
    workspace: String,
    pull_num: i64,
    head_commit: String,
    plan_path: String,
    created_at: OffsetDateTime,
}

impl From<PlanRow> for PlanRecord {
    fn from(row: PlanRow) -> Self {
        PlanRecord {
            project: Project { repo_full_name: row.repo_full_name, path: row.path },
            workspace: row.workspace,
            pull_num: row.pull_num as u64,
            head_commit: row.head_commit,
            plan_path: row.plan_path,
            created_at: row.created_at,
        }
    }
}

const LOCK_COLUMNS: &str = "repo_full_name, path, workspace, pull_num, pull_head_commit, \
                            pull_branch, pull_author, pull_url, username, created_at";

const PLAN_COLUMNS: &str =
    "repo_full_name, path, workspace, pull_num, head_commit, plan_path, created_at";

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

#[async_trait]
impl LockBackend for Database {
    async fn try_lock(&self, lock: &Lock) -> Result<(bool, Lock)> {
        let id = lock.id();
        // The insert takes the write lock, so the read below sees the row that won.
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO locks (id, repo_full_name, path, workspace, pull_num, pull_head_commit,
                               pull_branch, pull_author, pull_url, username, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&lock.project.repo_full_name)
        .bind(&lock.project.path)
        .bind(&lock.workspace)
        .bind(lock.pull.num as i64)
        .bind(&lock.pull.head_commit)
        .bind(&lock.pull.branch)
        .bind(&lock.pull.author)
        .bind(&lock.pull.url)
        .bind(&lock.user.username)
        .bind(lock.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert lock")?
        .rows_affected()
            == 1;
        let current = if inserted {
            lock.clone()
        } else {
            sqlx::query_as::<_, LockRow>(&format!("SELECT {LOCK_COLUMNS} FROM locks WHERE id = ?"))
                .bind(&id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to fetch existing lock")?
                .into()
        };
        tx.commit().await?;
        Ok((inserted, current))
    }

    async fn unlock(&self, id: &str) -> Result<Option<Lock>> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query_as::<_, LockRow>(&format!(
            "DELETE FROM locks WHERE id = ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to delete lock")?;
        sqlx::query("DELETE FROM plans WHERE lock_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete plan")?;
        tx.commit().await?;
        Ok(removed.map(Lock::from))
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        let rows = sqlx::query_as::<_, LockRow>(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list locks")?;
        Ok(rows.into_iter().map(Lock::from).collect())
    }

    async fn get_lock(&self, id: &str) -> Result<Option<Lock>> {
        let row =
            sqlx::query_as::<_, LockRow>(&format!("SELECT {LOCK_COLUMNS} FROM locks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch lock")?;
        Ok(row.map(Lock::from))
    }

    async fn refresh(&self, lock: &Lock) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE locks
            SET pull_head_commit = ?, pull_branch = ?, pull_author = ?, pull_url = ?, username = ?
            WHERE id = ? AND repo_full_name = ? AND pull_num = ?
            "#,
        )
        .bind(&lock.pull.head_commit)
        .bind(&lock.pull.branch)
        .bind(&lock.pull.author)
        .bind(&lock.pull.url)
        .bind(&lock.user.username)
        .bind(lock.id())
        .bind(&lock.project.repo_full_name)
        .bind(lock.pull.num as i64)
        .execute(&self.pool)
        .await
        .context("Failed to refresh lock")?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<Lock>> {
        let pull_num = pull_num as i64;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query_as::<_, LockRow>(&format!(
            "DELETE FROM locks WHERE repo_full_name = ? AND pull_num = ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(repo_full_name)
        .bind(pull_num)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to delete pull request locks")?;
        sqlx::query("DELETE FROM plans WHERE repo_full_name = ? AND pull_num = ?")
            .bind(repo_full_name)
            .bind(pull_num)
            .execute(&mut *tx)
            .await
            .context("Failed to delete pull request plans")?;
        tx.commit().await?;
        Ok(removed.into_iter().map(Lock::from).collect())
    }
}

#[async_trait]
impl PlanStore for Database {
    async fn save_plan(&self, plan: &PlanRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (lock_id, repo_full_name, path, workspace, pull_num, head_commit,
                               plan_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (lock_id) DO UPDATE
            SET pull_num = EXCLUDED.pull_num,
                head_commit = EXCLUDED.head_commit,
                plan_path = EXCLUDED.plan_path,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(plan.lock_id())
        .bind(&plan.project.repo_full_name)
        .bind(&plan.project.path)
        .bind(&plan.workspace)
        .bind(plan.pull_num as i64)
        .bind(&plan.head_commit)
        .bind(&plan.plan_path)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save plan")?;
        Ok(())
    }

    async fn get_plan(&self, lock_id: &str) -> Result<Option<PlanRecord>> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE lock_id = ?"
        ))
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch plan")?;
        Ok(row.map(PlanRecord::from))
    }

    async fn plans_for_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        workspace: &str,
    ) -> Result<Vec<PlanRecord>> {
        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans
             WHERE repo_full_name = ? AND pull_num = ? AND workspace = ?
             ORDER BY path"
        ))
        .bind(repo_full_name)
        .bind(pull_num as i64)
        .bind(workspace)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list plans")?;
        Ok(rows.into_iter().map(PlanRecord::from).collect())
    }

    async fn delete_plan(&self, lock_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM plans WHERE lock_id = ?")
            .bind(lock_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete plan")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;
    use terrapin_core::models::lock_id;

    use super::*;

    async fn open(dir: &tempfile::TempDir) -> Database {
        let url = format!("sqlite://{}", dir.path().join("terrapin.db").display());
        Database::new(&DbConfig { url }).await.unwrap()
    }

    fn lock(path: &str, workspace: &str, pull_num: u64, username: &str) -> Lock {
        Lock {
            project: Project::new("owner/repo", path),
            workspace: workspace.to_string(),
            pull: PullRequest {
                num: pull_num,
                head_commit: format!("sha{pull_num}"),
                branch: format!("branch-{pull_num}"),
                author: username.to_string(),
                url: format!("https://github.com/owner/repo/pull/{pull_num}"),
                state: PullState::Open,
            },
            user: User { username: username.to_string() },
            created_at: OffsetDateTime::now_utc().replace_nanosecond(0).unwrap(),
        }
    }

    fn plan(path: &str, workspace: &str, pull_num: u64) -> PlanRecord {
        PlanRecord {
            project: Project::new("owner/repo", path),
            workspace: workspace.to_string(),
            pull_num,
            head_commit: format!("sha{pull_num}"),
            plan_path: format!("/data/{path}/{workspace}.tfplan"),
            created_at: OffsetDateTime::now_utc().replace_nanosecond(0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir).await;

        let alice = lock("project-a", "default", 5, "alice");
        let (acquired, current) = db.try_lock(&alice).await.unwrap();
        assert!(acquired);
        assert_eq!(current, alice);

        let bob = lock("project-a", "default", 7, "bob");
        let (acquired, current) = db.try_lock(&bob).await.unwrap();
        assert!(!acquired);
        assert_eq!(current, alice);

        // Same pull, same user still can't double-acquire
        let (acquired, _) = db.try_lock(&alice).await.unwrap();
        assert!(!acquired);

        let removed = db.unlock(&alice.id()).await.unwrap();
        assert_eq!(removed, Some(alice));
        let (acquired, current) = db.try_lock(&bob).await.unwrap();
        assert!(acquired);
        assert_eq!(current, bob);
    }

    #[tokio::test]
    async fn test_unlock_missing() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir).await;
        assert_eq!(db.unlock("owner/repo/./default").await.unwrap(), None);
        assert_eq!(db.get_lock("owner/repo/./default").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_try_lock() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open(&dir).await);
        let results = join_all((0..16).map(|i| {
            let db = db.clone();
            async move { db.try_lock(&lock("contended", "default", i, "user")).await }
        }))
        .await;
        let results = results.into_iter().collect::<Result<Vec<_>>>().unwrap();
        let winners = results.iter().filter(|(acquired, _)| *acquired).collect::<Vec<_>>();
        assert_eq!(winners.len(), 1);
        let holder = &winners[0].1;
        assert!(results.iter().all(|(_, current)| current == holder));
    }

    #[tokio::test]
    async fn test_unlock_by_pull() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir).await;

        assert!(db.unlock_by_pull("owner/repo", 5).await.unwrap().is_empty());

        db.try_lock(&lock("a", "default", 5, "alice")).await.unwrap();
        db.try_lock(&lock("b", "default", 5, "alice")).await.unwrap();
        db.try_lock(&lock("b", "staging", 5, "alice")).await.unwrap();
        db.try_lock(&lock("c", "default", 6, "bob")).await.unwrap();
        db.save_plan(&plan("a", "default", 5)).await.unwrap();

        let removed = db.unlock_by_pull("owner/repo", 5).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(removed.iter().all(|l| l.pull.num == 5));
        assert_eq!(db.get_plan(&lock_id(&Project::new("owner/repo", "a"), "default")).await.unwrap(), None);

        let remaining = db.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pull.num, 6);

        assert!(db.unlock_by_pull("owner/repo", 5).await.unwrap().is_empty());

        // A pull holding a single lock
        let removed = db.unlock_by_pull("owner/repo", 6).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), "owner/repo/c/default");
        assert!(db.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir).await;

        let held = lock("a", "default", 5, "alice");
        assert!(!db.refresh(&held).await.unwrap());
        db.try_lock(&held).await.unwrap();

        let mut newer = lock("a", "default", 5, "carol");
        newer.pull.head_commit = "sha5-next".to_string();
        assert!(db.refresh(&newer).await.unwrap());
        let stored = db.get_lock(&held.id()).await.unwrap().unwrap();
        assert_eq!(stored.user.username, "carol");
        assert_eq!(stored.pull.head_commit, "sha5-next");
        assert_eq!(stored.created_at, held.created_at);

        // Another pull can't overwrite the holder
        assert!(!db.refresh(&lock("a", "default", 7, "bob")).await.unwrap());
        assert_eq!(db.get_lock(&held.id()).await.unwrap().unwrap().pull.num, 5);
    }

    #[tokio::test]
    async fn test_plans() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(&dir).await;

        let held = lock("a", "default", 5, "alice");
        db.try_lock(&held).await.unwrap();
        let saved = plan("a", "default", 5);
        db.save_plan(&saved).await.unwrap();
        db.save_plan(&plan("b", "default", 5)).await.unwrap();
        db.save_plan(&plan("b", "staging", 5)).await.unwrap();

        assert_eq!(db.get_plan(&held.id()).await.unwrap(), Some(saved.clone()));
        let plans = db.plans_for_pull("owner/repo", 5, "default").await.unwrap();
        assert_eq!(plans.iter().map(|p| p.project.path.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        // Unlocking drops the plan saved under the lock
        db.unlock(&held.id()).await.unwrap();
        assert_eq!(db.get_plan(&held.id()).await.unwrap(), None);

        db.delete_plan(&plan("b", "default", 5).lock_id()).await.unwrap();
        assert!(db.plans_for_pull("owner/repo", 5, "default").await.unwrap().is_empty());
        assert_eq!(db.plans_for_pull("owner/repo", 5, "staging").await.unwrap().len(), 1);
    }
}
