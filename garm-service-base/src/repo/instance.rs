use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{
    Address, EventLevel, Instance, InstanceId, InstanceStatus, RunnerStatus, StatusEvent,
};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub provider_id: Option<String>,
    pub pool_id: Option<String>,
    pub scale_set_id: Option<String>,
    pub os_type: String,
    pub os_arch: String,
    pub status: String,
    pub runner_status: String,
    pub create_attempt: i64,
    pub agent_id: Option<i64>,
    pub token_fetched: bool,
    pub jit_configuration: Option<String>,
    pub addresses: String,
    pub heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct InstanceEventRecord {
    pub instance_id: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<InstanceEventRecord> for StatusEvent {
    type Error = String;

    fn try_from(value: InstanceEventRecord) -> Result<Self, Self::Error> {
        Ok(StatusEvent {
            level: parse_enum(&value.level, "event level")?,
            message: value.message,
            created_at: value.created_at,
        })
    }
}

impl InstanceRecord {
    pub fn into_model(self, events: Vec<StatusEvent>) -> Result<Instance, String> {
        let jit_configuration: Option<HashMap<String, String>> = self
            .jit_configuration
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| format!("invalid jit configuration: {e}"))
            })
            .transpose()?;
        let addresses: Vec<Address> = serde_json::from_str(&self.addresses)
            .map_err(|e| format!("invalid addresses: {e}"))?;
        Ok(Instance {
            id: InstanceId(parse_uuid(&self.id, "instance id")?),
            name: self.name,
            provider_id: self.provider_id,
            pool_id: self
                .pool_id
                .map(|id| parse_uuid(&id, "pool id").map(Into::into))
                .transpose()?,
            scale_set_id: self
                .scale_set_id
                .map(|id| parse_uuid(&id, "scale set id").map(Into::into))
                .transpose()?,
            os_type: parse_enum(&self.os_type, "os type")?,
            os_arch: parse_enum(&self.os_arch, "os arch")?,
            status: parse_enum(&self.status, "instance status")?,
            runner_status: parse_enum(&self.runner_status, "runner status")?,
            create_attempt: self.create_attempt as u32,
            agent_id: self.agent_id,
            token_fetched: self.token_fetched,
            jit_configuration,
            addresses,
            heartbeat: self.heartbeat,
            status_events: events,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct UpdateInstanceParams {
    pub provider_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub runner_status: Option<RunnerStatus>,
    pub create_attempt: Option<u32>,
    pub agent_id: Option<i64>,
    pub token_fetched: Option<bool>,
    pub jit_configuration: Option<HashMap<String, String>>,
    pub addresses: Option<Vec<Address>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait InstanceRepo {
    async fn create(&self, instance: &InstanceRecord) -> Result<InstanceRecord, RepoError>;

    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>, RepoError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, RepoError>;

    async fn get_by_agent_id(&self, agent_id: i64) -> Result<Option<InstanceRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<InstanceRecord>, RepoError>;

    async fn list_by_pool(&self, pool_id: &str) -> Result<Vec<InstanceRecord>, RepoError>;

    async fn list_by_scale_set(&self, scale_set_id: &str)
        -> Result<Vec<InstanceRecord>, RepoError>;

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<InstanceRecord>, RepoError>;

    async fn update(
        &self,
        id: &str,
        params: &UpdateInstanceParams,
    ) -> Result<InstanceRecord, RepoError>;

    async fn delete_by_name(&self, name: &str) -> Result<InstanceRecord, RepoError>;

    async fn add_event(
        &self,
        id: &str,
        level: EventLevel,
        message: &str,
        ring_size: usize,
    ) -> Result<(), RepoError>;

    async fn events(&self, id: &str) -> Result<Vec<InstanceEventRecord>, RepoError>;
}

pub struct DbInstanceRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbInstanceRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl InstanceRepo for DbInstanceRepo<sqlx::Sqlite> {
    async fn create(&self, instance: &InstanceRecord) -> Result<InstanceRecord, RepoError> {
        sqlx::query(
            r#"
              INSERT INTO instances
                (id, name, provider_id, pool_id, scale_set_id, os_type, os_arch, status,
                 runner_status, create_attempt, agent_id, token_fetched, jit_configuration,
                 addresses, heartbeat, created_at, updated_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.provider_id)
        .bind(&instance.pool_id)
        .bind(&instance.scale_set_id)
        .bind(&instance.os_type)
        .bind(&instance.os_arch)
        .bind(&instance.status)
        .bind(&instance.runner_status)
        .bind(instance.create_attempt)
        .bind(instance.agent_id)
        .bind(instance.token_fetched)
        .bind(&instance.jit_configuration)
        .bind(&instance.addresses)
        .bind(instance.heartbeat)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(self.db_pool.deref())
        .await?;

        self.get(&instance.id).await?.ok_or(RepoError::NotFound)
    }

    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>("SELECT * FROM instances WHERE name = $1")
            .bind(name)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_agent_id(&self, agent_id: i64) -> Result<Option<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>("SELECT * FROM instances WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>("SELECT * FROM instances ORDER BY created_at")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_by_pool(&self, pool_id: &str) -> Result<Vec<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>(
            "SELECT * FROM instances WHERE pool_id = $1 ORDER BY created_at",
        )
        .bind(pool_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_by_scale_set(
        &self,
        scale_set_id: &str,
    ) -> Result<Vec<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>(
            "SELECT * FROM instances WHERE scale_set_id = $1 ORDER BY created_at",
        )
        .bind(scale_set_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<InstanceRecord>, RepoError> {
        sqlx::query_as::<_, InstanceRecord>(
            r#"
              SELECT i.* FROM instances i
              LEFT JOIN pools p ON i.pool_id = p.id
              LEFT JOIN scale_sets s ON i.scale_set_id = s.id
              WHERE p.entity_id = $1 OR s.entity_id = $1
              ORDER BY i.created_at
            "#,
        )
        .bind(entity_id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn update(
        &self,
        id: &str,
        params: &UpdateInstanceParams,
    ) -> Result<InstanceRecord, RepoError> {
        let jit = params
            .jit_configuration
            .as_ref()
            .map(|jit| serde_json::to_string(jit).unwrap_or_else(|_| "{}".to_string()));
        let addresses = params
            .addresses
            .as_ref()
            .map(|addresses| {
                serde_json::to_string(addresses).unwrap_or_else(|_| "[]".to_string())
            });

        let result = sqlx::query(
            r#"
              UPDATE instances
              SET provider_id = COALESCE($2, provider_id),
                  status = COALESCE($3, status),
                  runner_status = COALESCE($4, runner_status),
                  create_attempt = COALESCE($5, create_attempt),
                  agent_id = COALESCE($6, agent_id),
                  token_fetched = COALESCE($7, token_fetched),
                  jit_configuration = COALESCE($8, jit_configuration),
                  addresses = COALESCE($9, addresses),
                  heartbeat = COALESCE($10, heartbeat),
                  updated_at = $11
              WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&params.provider_id)
        .bind(params.status.map(|s| s.to_string()))
        .bind(params.runner_status.map(|s| s.to_string()))
        .bind(params.create_attempt.map(|a| a as i64))
        .bind(params.agent_id)
        .bind(params.token_fetched)
        .bind(jit)
        .bind(addresses)
        .bind(params.heartbeat)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        self.get(id).await?.ok_or(RepoError::NotFound)
    }

    async fn delete_by_name(&self, name: &str) -> Result<InstanceRecord, RepoError> {
        let record = self.get_by_name(name).await?.ok_or(RepoError::NotFound)?;

        sqlx::query("DELETE FROM instances WHERE name = $1")
            .bind(name)
            .execute(self.db_pool.deref())
            .await?;

        Ok(record)
    }

    async fn add_event(
        &self,
        id: &str,
        level: EventLevel,
        message: &str,
        ring_size: usize,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO instance_events (instance_id, level, message, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(level.to_string())
        .bind(message)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        // trim the ring to the configured bound
        sqlx::query(
            r#"
              DELETE FROM instance_events
              WHERE instance_id = $1
                AND id NOT IN (
                  SELECT id FROM instance_events
                  WHERE instance_id = $1
                  ORDER BY id DESC
                  LIMIT $2
                )
            "#,
        )
        .bind(id)
        .bind(ring_size as i64)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn events(&self, id: &str) -> Result<Vec<InstanceEventRecord>, RepoError> {
        sqlx::query_as::<_, InstanceEventRecord>(
            "SELECT instance_id, level, message, created_at FROM instance_events WHERE instance_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }
}
