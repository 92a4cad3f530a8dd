use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{Entity, EntityId, EntityKind, PoolManagerStatus};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct EntityRecord {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub endpoint_name: String,
    pub credentials_id: String,
    pub webhook_secret: String,
    pub pool_balancer_type: String,
    pub is_running: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EntityRecord> for Entity {
    type Error = String;

    fn try_from(value: EntityRecord) -> Result<Self, Self::Error> {
        Ok(Entity {
            id: EntityId(parse_uuid(&value.id, "entity id")?),
            kind: parse_enum(&value.kind, "entity kind")?,
            name: value.name,
            endpoint_name: value.endpoint_name,
            credentials_id: parse_uuid(&value.credentials_id, "credentials id")?.into(),
            webhook_secret: value.webhook_secret,
            pool_balancer_type: parse_enum(&value.pool_balancer_type, "pool balancer type")?,
            status: PoolManagerStatus {
                is_running: value.is_running,
                failure_reason: value.failure_reason,
            },
            created_at: value.created_at,
        })
    }
}

impl From<Entity> for EntityRecord {
    fn from(value: Entity) -> Self {
        EntityRecord {
            id: value.id.to_string(),
            kind: value.kind.to_string(),
            name: value.name,
            endpoint_name: value.endpoint_name,
            credentials_id: value.credentials_id.to_string(),
            webhook_secret: value.webhook_secret,
            pool_balancer_type: value.pool_balancer_type.to_string(),
            is_running: value.status.is_running,
            failure_reason: value.status.failure_reason,
            created_at: value.created_at,
        }
    }
}

#[async_trait]
pub trait EntityRepo {
    async fn create(&self, entity: &EntityRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &str) -> Result<Option<EntityRecord>, RepoError>;

    async fn get_by_name(
        &self,
        kind: EntityKind,
        name: &str,
        endpoint_name: &str,
    ) -> Result<Option<EntityRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<EntityRecord>, RepoError>;

    async fn update(&self, entity: &EntityRecord) -> Result<(), RepoError>;

    async fn update_status(
        &self,
        id: &str,
        is_running: bool,
        failure_reason: Option<&str>,
    ) -> Result<(), RepoError>;

    /// Refuses deletion while pools or scale sets still reference the entity.
    async fn delete(&self, id: &str) -> Result<(), RepoError>;
}

pub struct DbEntityRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbEntityRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl EntityRepo for DbEntityRepo<sqlx::Sqlite> {
    async fn create(&self, entity: &EntityRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO entities
                (id, kind, name, endpoint_name, credentials_id, webhook_secret,
                 pool_balancer_type, is_running, failure_reason, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.kind)
        .bind(&entity.name)
        .bind(&entity.endpoint_name)
        .bind(&entity.credentials_id)
        .bind(&entity.webhook_secret)
        .bind(&entity.pool_balancer_type)
        .bind(entity.is_running)
        .bind(&entity.failure_reason)
        .bind(entity.created_at)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<EntityRecord>, RepoError> {
        sqlx::query_as::<_, EntityRecord>("SELECT * FROM entities WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_name(
        &self,
        kind: EntityKind,
        name: &str,
        endpoint_name: &str,
    ) -> Result<Option<EntityRecord>, RepoError> {
        sqlx::query_as::<_, EntityRecord>(
            "SELECT * FROM entities WHERE kind = $1 AND name = $2 AND endpoint_name = $3",
        )
        .bind(kind.to_string())
        .bind(name)
        .bind(endpoint_name)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<EntityRecord>, RepoError> {
        sqlx::query_as::<_, EntityRecord>("SELECT * FROM entities ORDER BY created_at")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn update(&self, entity: &EntityRecord) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE entities
              SET credentials_id = $2,
                  webhook_secret = $3,
                  pool_balancer_type = $4
              WHERE id = $1
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.credentials_id)
        .bind(&entity.webhook_secret)
        .bind(&entity.pool_balancer_type)
        .execute(self.db_pool.deref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        is_running: bool,
        failure_reason: Option<&str>,
    ) -> Result<(), RepoError> {
        let result =
            sqlx::query("UPDATE entities SET is_running = $2, failure_reason = $3 WHERE id = $1")
                .bind(id)
                .bind(is_running)
                .bind(failure_reason)
                .execute(self.db_pool.deref())
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RepoError> {
        let (pools,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pools WHERE entity_id = $1")
                .bind(id)
                .fetch_one(self.db_pool.deref())
                .await?;
        let (scale_sets,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scale_sets WHERE entity_id = $1")
                .bind(id)
                .fetch_one(self.db_pool.deref())
                .await?;
        if pools > 0 || scale_sets > 0 {
            return Err(RepoError::Conflict(format!(
                "entity still owns {pools} pool(s) and {scale_sets} scale set(s)"
            )));
        }

        sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(id)
            .execute(self.db_pool.deref())
            .await?;

        Ok(())
    }
}
