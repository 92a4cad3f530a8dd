use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{Pool as RunnerPool, PoolId};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct PoolRecord {
    pub id: String,
    pub entity_id: String,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: String,
    pub os_arch: String,
    pub tags: String,
    pub min_idle_runners: i64,
    pub max_runners: i64,
    pub runner_bootstrap_timeout: i64,
    pub runner_prefix: String,
    pub enabled: bool,
    pub github_runner_group: Option<String>,
    pub extra_specs: Option<String>,
    pub priority: i64,
    pub disable_jit_config: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PoolRecord> for RunnerPool {
    type Error = String;

    fn try_from(value: PoolRecord) -> Result<Self, Self::Error> {
        let tags: Vec<String> = serde_json::from_str(&value.tags)
            .map_err(|e| format!("invalid pool tags: {e}"))?;
        let extra_specs = value
            .extra_specs
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| format!("invalid extra specs: {e}"))
            })
            .transpose()?;
        Ok(RunnerPool {
            id: PoolId(parse_uuid(&value.id, "pool id")?),
            entity_id: parse_uuid(&value.entity_id, "entity id")?.into(),
            provider_name: value.provider_name,
            image: value.image,
            flavor: value.flavor,
            os_type: parse_enum(&value.os_type, "os type")?,
            os_arch: parse_enum(&value.os_arch, "os arch")?,
            tags,
            min_idle_runners: value.min_idle_runners as u32,
            max_runners: value.max_runners as u32,
            runner_bootstrap_timeout: value.runner_bootstrap_timeout as u32,
            runner_prefix: value.runner_prefix,
            enabled: value.enabled,
            github_runner_group: value.github_runner_group,
            extra_specs,
            priority: value.priority as u32,
            disable_jit_config: value.disable_jit_config,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<RunnerPool> for PoolRecord {
    fn from(value: RunnerPool) -> Self {
        PoolRecord {
            id: value.id.to_string(),
            entity_id: value.entity_id.to_string(),
            provider_name: value.provider_name,
            image: value.image,
            flavor: value.flavor,
            os_type: value.os_type.to_string(),
            os_arch: value.os_arch.to_string(),
            tags: serde_json::to_string(&value.tags).unwrap_or_else(|_| "[]".to_string()),
            min_idle_runners: value.min_idle_runners as i64,
            max_runners: value.max_runners as i64,
            runner_bootstrap_timeout: value.runner_bootstrap_timeout as i64,
            runner_prefix: value.runner_prefix,
            enabled: value.enabled,
            github_runner_group: value.github_runner_group,
            extra_specs: value
                .extra_specs
                .map(|specs| specs.to_string()),
            priority: value.priority as i64,
            disable_jit_config: value.disable_jit_config,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[async_trait]
pub trait PoolRepo {
    async fn create(&self, pool: &PoolRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &str) -> Result<Option<PoolRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<PoolRecord>, RepoError>;

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<PoolRecord>, RepoError>;

    async fn update(&self, pool: &PoolRecord) -> Result<(), RepoError>;

    /// Refuses deletion while the pool owns instances that are not deleted.
    async fn delete(&self, id: &str) -> Result<(), RepoError>;
}

pub struct DbPoolRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbPoolRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl PoolRepo for DbPoolRepo<sqlx::Sqlite> {
    async fn create(&self, pool: &PoolRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO pools
                (id, entity_id, provider_name, image, flavor, os_type, os_arch, tags,
                 min_idle_runners, max_runners, runner_bootstrap_timeout, runner_prefix,
                 enabled, github_runner_group, extra_specs, priority, disable_jit_config,
                 created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&pool.id)
        .bind(&pool.entity_id)
        .bind(&pool.provider_name)
        .bind(&pool.image)
        .bind(&pool.flavor)
        .bind(&pool.os_type)
        .bind(&pool.os_arch)
        .bind(&pool.tags)
        .bind(pool.min_idle_runners)
        .bind(pool.max_runners)
        .bind(pool.runner_bootstrap_timeout)
        .bind(&pool.runner_prefix)
        .bind(pool.enabled)
        .bind(&pool.github_runner_group)
        .bind(&pool.extra_specs)
        .bind(pool.priority)
        .bind(pool.disable_jit_config)
        .bind(pool.created_at)
        .bind(pool.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PoolRecord>, RepoError> {
        sqlx::query_as::<_, PoolRecord>("SELECT * FROM pools WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<PoolRecord>, RepoError> {
        sqlx::query_as::<_, PoolRecord>("SELECT * FROM pools ORDER BY created_at")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<PoolRecord>, RepoError> {
        sqlx::query_as::<_, PoolRecord>(
            "SELECT * FROM pools WHERE entity_id = $1 ORDER BY created_at",
        )
        .bind(entity_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn update(&self, pool: &PoolRecord) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE pools
              SET provider_name = $2,
                  image = $3,
                  flavor = $4,
                  tags = $5,
                  min_idle_runners = $6,
                  max_runners = $7,
                  runner_bootstrap_timeout = $8,
                  runner_prefix = $9,
                  enabled = $10,
                  github_runner_group = $11,
                  extra_specs = $12,
                  priority = $13,
                  disable_jit_config = $14,
                  updated_at = $15
              WHERE id = $1
            "#,
        )
        .bind(&pool.id)
        .bind(&pool.provider_name)
        .bind(&pool.image)
        .bind(&pool.flavor)
        .bind(&pool.tags)
        .bind(pool.min_idle_runners)
        .bind(pool.max_runners)
        .bind(pool.runner_bootstrap_timeout)
        .bind(&pool.runner_prefix)
        .bind(pool.enabled)
        .bind(&pool.github_runner_group)
        .bind(&pool.extra_specs)
        .bind(pool.priority)
        .bind(pool.disable_jit_config)
        .bind(pool.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let (live,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE pool_id = $1 AND status != 'deleted'",
        )
        .bind(id)
        .fetch_one(self.db_pool.deref())
        .await?;
        if live > 0 {
            return Err(RepoError::Conflict(format!(
                "pool still owns {live} non-deleted instance(s)"
            )));
        }

        sqlx::query("DELETE FROM pools WHERE id = $1")
            .bind(id)
            .execute(self.db_pool.deref())
            .await?;

        Ok(())
    }
}
