use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{ScaleSet, ScaleSetId};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ScaleSetRecord {
    pub id: String,
    pub scale_set_id: i64,
    pub name: String,
    pub entity_id: String,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: String,
    pub os_arch: String,
    pub min_runners: i64,
    pub max_runners: i64,
    pub runner_bootstrap_timeout: i64,
    pub runner_prefix: String,
    pub enabled: bool,
    pub github_runner_group: Option<String>,
    pub extra_specs: Option<String>,
    pub desired_runner_count: i64,
    pub last_message_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ScaleSetRecord> for ScaleSet {
    type Error = String;

    fn try_from(value: ScaleSetRecord) -> Result<Self, Self::Error> {
        let extra_specs = value
            .extra_specs
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| format!("invalid extra specs: {e}"))
            })
            .transpose()?;
        Ok(ScaleSet {
            id: ScaleSetId(parse_uuid(&value.id, "scale set id")?),
            scale_set_id: value.scale_set_id,
            name: value.name,
            entity_id: parse_uuid(&value.entity_id, "entity id")?.into(),
            provider_name: value.provider_name,
            image: value.image,
            flavor: value.flavor,
            os_type: parse_enum(&value.os_type, "os type")?,
            os_arch: parse_enum(&value.os_arch, "os arch")?,
            min_runners: value.min_runners as u32,
            max_runners: value.max_runners as u32,
            runner_bootstrap_timeout: value.runner_bootstrap_timeout as u32,
            runner_prefix: value.runner_prefix,
            enabled: value.enabled,
            github_runner_group: value.github_runner_group,
            extra_specs,
            desired_runner_count: value.desired_runner_count,
            last_message_id: value.last_message_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<ScaleSet> for ScaleSetRecord {
    fn from(value: ScaleSet) -> Self {
        ScaleSetRecord {
            id: value.id.to_string(),
            scale_set_id: value.scale_set_id,
            name: value.name,
            entity_id: value.entity_id.to_string(),
            provider_name: value.provider_name,
            image: value.image,
            flavor: value.flavor,
            os_type: value.os_type.to_string(),
            os_arch: value.os_arch.to_string(),
            min_runners: value.min_runners as i64,
            max_runners: value.max_runners as i64,
            runner_bootstrap_timeout: value.runner_bootstrap_timeout as i64,
            runner_prefix: value.runner_prefix,
            enabled: value.enabled,
            github_runner_group: value.github_runner_group,
            extra_specs: value.extra_specs.map(|specs| specs.to_string()),
            desired_runner_count: value.desired_runner_count,
            last_message_id: value.last_message_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[async_trait]
pub trait ScaleSetRepo {
    async fn create(&self, scale_set: &ScaleSetRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &str) -> Result<Option<ScaleSetRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<ScaleSetRecord>, RepoError>;

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<ScaleSetRecord>, RepoError>;

    async fn update(&self, scale_set: &ScaleSetRecord) -> Result<(), RepoError>;

    async fn set_desired_runner_count(&self, id: &str, count: i64) -> Result<(), RepoError>;

    /// Conditional write: succeeds only when `message_id` is strictly greater
    /// than the stored cursor. Returns whether the cursor advanced.
    async fn set_last_message_id(&self, id: &str, message_id: i64) -> Result<bool, RepoError>;

    async fn delete(&self, id: &str) -> Result<(), RepoError>;
}

pub struct DbScaleSetRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbScaleSetRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ScaleSetRepo for DbScaleSetRepo<sqlx::Sqlite> {
    async fn create(&self, scale_set: &ScaleSetRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO scale_sets
                (id, scale_set_id, name, entity_id, provider_name, image, flavor, os_type,
                 os_arch, min_runners, max_runners, runner_bootstrap_timeout, runner_prefix,
                 enabled, github_runner_group, extra_specs, desired_runner_count,
                 last_message_id, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(&scale_set.id)
        .bind(scale_set.scale_set_id)
        .bind(&scale_set.name)
        .bind(&scale_set.entity_id)
        .bind(&scale_set.provider_name)
        .bind(&scale_set.image)
        .bind(&scale_set.flavor)
        .bind(&scale_set.os_type)
        .bind(&scale_set.os_arch)
        .bind(scale_set.min_runners)
        .bind(scale_set.max_runners)
        .bind(scale_set.runner_bootstrap_timeout)
        .bind(&scale_set.runner_prefix)
        .bind(scale_set.enabled)
        .bind(&scale_set.github_runner_group)
        .bind(&scale_set.extra_specs)
        .bind(scale_set.desired_runner_count)
        .bind(scale_set.last_message_id)
        .bind(scale_set.created_at)
        .bind(scale_set.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScaleSetRecord>, RepoError> {
        sqlx::query_as::<_, ScaleSetRecord>("SELECT * FROM scale_sets WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<ScaleSetRecord>, RepoError> {
        sqlx::query_as::<_, ScaleSetRecord>("SELECT * FROM scale_sets ORDER BY created_at")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<ScaleSetRecord>, RepoError> {
        sqlx::query_as::<_, ScaleSetRecord>(
            "SELECT * FROM scale_sets WHERE entity_id = $1 ORDER BY created_at",
        )
        .bind(entity_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn update(&self, scale_set: &ScaleSetRecord) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE scale_sets
              SET name = $2,
                  provider_name = $3,
                  image = $4,
                  flavor = $5,
                  min_runners = $6,
                  max_runners = $7,
                  runner_bootstrap_timeout = $8,
                  runner_prefix = $9,
                  enabled = $10,
                  github_runner_group = $11,
                  extra_specs = $12,
                  updated_at = $13
              WHERE id = $1
            "#,
        )
        .bind(&scale_set.id)
        .bind(&scale_set.name)
        .bind(&scale_set.provider_name)
        .bind(&scale_set.image)
        .bind(&scale_set.flavor)
        .bind(scale_set.min_runners)
        .bind(scale_set.max_runners)
        .bind(scale_set.runner_bootstrap_timeout)
        .bind(&scale_set.runner_prefix)
        .bind(scale_set.enabled)
        .bind(&scale_set.github_runner_group)
        .bind(&scale_set.extra_specs)
        .bind(scale_set.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn set_desired_runner_count(&self, id: &str, count: i64) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE scale_sets SET desired_runner_count = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(count)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn set_last_message_id(&self, id: &str, message_id: i64) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE scale_sets
              SET last_message_id = $2, updated_at = $3
              WHERE id = $1 AND last_message_id < $2
            "#,
        )
        .bind(id)
        .bind(message_id)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let (live,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM instances WHERE scale_set_id = $1 AND status != 'deleted'",
        )
        .bind(id)
        .fetch_one(self.db_pool.deref())
        .await?;
        if live > 0 {
            return Err(RepoError::Conflict(format!(
                "scale set still owns {live} non-deleted instance(s)"
            )));
        }

        sqlx::query("DELETE FROM scale_sets WHERE id = $1")
            .bind(id)
            .execute(self.db_pool.deref())
            .await?;

        Ok(())
    }
}
