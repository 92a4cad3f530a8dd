use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{Job, JobId};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub entity_id: String,
    pub status: String,
    pub name: String,
    pub labels: String,
    pub runner_name: Option<String>,
    pub runner_id: Option<i64>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = String;

    fn try_from(value: JobRecord) -> Result<Self, Self::Error> {
        let labels: Vec<String> = serde_json::from_str(&value.labels)
            .map_err(|e| format!("invalid job labels: {e}"))?;
        Ok(Job {
            id: JobId(value.id),
            entity_id: parse_uuid(&value.entity_id, "entity id")?.into(),
            status: parse_enum(&value.status, "job status")?,
            name: value.name,
            labels,
            runner_name: value.runner_name,
            runner_id: value.runner_id,
            locked_by: value
                .locked_by
                .map(|id| parse_uuid(&id, "locked_by").map(Into::into))
                .transpose()?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<Job> for JobRecord {
    fn from(value: Job) -> Self {
        JobRecord {
            id: value.id.0,
            entity_id: value.entity_id.to_string(),
            status: value.status.to_string(),
            name: value.name,
            labels: serde_json::to_string(&value.labels).unwrap_or_else(|_| "[]".to_string()),
            runner_name: value.runner_name,
            runner_id: value.runner_id,
            locked_by: value.locked_by.map(|id| id.to_string()),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[async_trait]
pub trait JobRepo {
    /// Creates the job on first delivery, updates status and runner fields on
    /// subsequent ones. The advisory lock is never touched here.
    async fn upsert(&self, job: &JobRecord) -> Result<(), RepoError>;

    async fn get(&self, id: i64) -> Result<Option<JobRecord>, RepoError>;

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<JobRecord>, RepoError>;

    async fn list_queued(&self, entity_id: &str) -> Result<Vec<JobRecord>, RepoError>;

    /// Atomic conditional lock. Succeeds only when the row is unlocked or
    /// already locked by the same entity.
    async fn lock(&self, id: i64, entity_id: &str) -> Result<bool, RepoError>;

    async fn unlock(&self, id: i64, entity_id: &str) -> Result<(), RepoError>;

    /// Clears the lock when the job is observed back in `queued`.
    async fn break_lock_if_queued(&self, id: i64) -> Result<(), RepoError>;

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
}

pub struct DbJobRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbJobRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl JobRepo for DbJobRepo<sqlx::Sqlite> {
    async fn upsert(&self, job: &JobRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO jobs
                (id, entity_id, status, name, labels, runner_name, runner_id, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (id) DO UPDATE
              SET status = $3,
                  runner_name = COALESCE($6, runner_name),
                  runner_id = COALESCE($7, runner_id),
                  updated_at = $9
            "#,
        )
        .bind(job.id)
        .bind(&job.entity_id)
        .bind(&job.status)
        .bind(&job.name)
        .bind(&job.labels)
        .bind(&job.runner_name)
        .bind(job.runner_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<JobRecord>, RepoError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<JobRecord>, RepoError> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE entity_id = $1 ORDER BY created_at",
        )
        .bind(entity_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_queued(&self, entity_id: &str) -> Result<Vec<JobRecord>, RepoError> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE entity_id = $1 AND status = 'queued' ORDER BY created_at",
        )
        .bind(entity_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn lock(&self, id: i64, entity_id: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE jobs
              SET locked_by = $2, updated_at = $3
              WHERE id = $1 AND (locked_by IS NULL OR locked_by = $2)
            "#,
        )
        .bind(id)
        .bind(entity_id)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unlock(&self, id: i64, entity_id: &str) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE jobs SET locked_by = NULL, updated_at = $3 WHERE id = $1 AND locked_by = $2",
        )
        .bind(id)
        .bind(entity_id)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn break_lock_if_queued(&self, id: i64) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE jobs SET locked_by = NULL, updated_at = $2 WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND updated_at < $1")
                .bind(cutoff)
                .execute(self.db_pool.deref())
                .await?;

        Ok(result.rows_affected())
    }
}
