use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use garm_common::model::{ControllerId, ControllerInfo};
use sqlx::{Database, Pool};

use crate::repo::{parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ControllerRecord {
    pub controller_id: String,
    pub webhook_url: Option<String>,
    pub metadata_url: Option<String>,
    pub callback_url: Option<String>,
    pub version: String,
}

impl TryFrom<ControllerRecord> for ControllerInfo {
    type Error = String;

    fn try_from(value: ControllerRecord) -> Result<Self, Self::Error> {
        Ok(ControllerInfo {
            controller_id: ControllerId(parse_uuid(&value.controller_id, "controller id")?),
            webhook_url: value.webhook_url,
            metadata_url: value.metadata_url,
            callback_url: value.callback_url,
            version: value.version,
        })
    }
}

#[async_trait]
pub trait ControllerRepo {
    async fn get(&self) -> Result<Option<ControllerRecord>, RepoError>;

    /// Creates the singleton controller row when missing and returns the
    /// stored state. The controller id is stable across restarts.
    async fn ensure(&self, info: &ControllerInfo) -> Result<ControllerRecord, RepoError>;

    async fn update_urls(
        &self,
        webhook_url: Option<&str>,
        metadata_url: Option<&str>,
        callback_url: Option<&str>,
    ) -> Result<(), RepoError>;
}

pub struct DbControllerRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbControllerRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ControllerRepo for DbControllerRepo<sqlx::Sqlite> {
    async fn get(&self) -> Result<Option<ControllerRecord>, RepoError> {
        sqlx::query_as::<_, ControllerRecord>(
            "SELECT controller_id, webhook_url, metadata_url, callback_url, version FROM controller_info WHERE singleton = 1",
        )
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn ensure(&self, info: &ControllerInfo) -> Result<ControllerRecord, RepoError> {
        sqlx::query(
            r#"
              INSERT INTO controller_info (singleton, controller_id, webhook_url, metadata_url, callback_url, version)
              VALUES (1, $1, $2, $3, $4, $5)
              ON CONFLICT (singleton) DO UPDATE
              SET version = $5
            "#,
        )
        .bind(info.controller_id.to_string())
        .bind(&info.webhook_url)
        .bind(&info.metadata_url)
        .bind(&info.callback_url)
        .bind(&info.version)
        .execute(self.db_pool.deref())
        .await?;

        self.get().await?.ok_or(RepoError::NotFound)
    }

    async fn update_urls(
        &self,
        webhook_url: Option<&str>,
        metadata_url: Option<&str>,
        callback_url: Option<&str>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              UPDATE controller_info
              SET webhook_url = COALESCE($1, webhook_url),
                  metadata_url = COALESCE($2, metadata_url),
                  callback_url = COALESCE($3, callback_url)
              WHERE singleton = 1
            "#,
        )
        .bind(webhook_url)
        .bind(metadata_url)
        .bind(callback_url)
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }
}
