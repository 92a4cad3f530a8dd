use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{CredentialsId, ForgeAuth, ForgeCredentials, ForgeEndpoint};
use sqlx::{Database, Pool};

use crate::repo::{parse_enum, parse_uuid, RepoError};

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct EndpointRecord {
    pub name: String,
    pub forge_type: String,
    pub base_url: String,
    pub api_base_url: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EndpointRecord> for ForgeEndpoint {
    type Error = String;

    fn try_from(value: EndpointRecord) -> Result<Self, Self::Error> {
        Ok(ForgeEndpoint {
            name: value.name,
            forge_type: parse_enum(&value.forge_type, "forge type")?,
            base_url: value.base_url,
            api_base_url: value.api_base_url,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CredentialsRecord {
    pub id: String,
    pub name: String,
    pub endpoint_name: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
}

impl CredentialsRecord {
    pub fn into_model(self, endpoint: ForgeEndpoint) -> Result<ForgeCredentials, String> {
        let auth: ForgeAuth = serde_json::from_str(&self.auth)
            .map_err(|e| format!("invalid credentials auth: {e}"))?;
        Ok(ForgeCredentials {
            id: CredentialsId(parse_uuid(&self.id, "credentials id")?),
            name: self.name,
            endpoint,
            auth,
        })
    }
}

#[async_trait]
pub trait CredentialsRepo {
    async fn upsert_endpoint(&self, endpoint: &ForgeEndpoint) -> Result<(), RepoError>;

    async fn get_endpoint(&self, name: &str) -> Result<Option<EndpointRecord>, RepoError>;

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, RepoError>;

    async fn upsert_credentials(&self, credentials: &ForgeCredentials) -> Result<(), RepoError>;

    async fn get_credentials(&self, id: &str) -> Result<Option<CredentialsRecord>, RepoError>;

    async fn get_credentials_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CredentialsRecord>, RepoError>;

    async fn list_credentials(&self) -> Result<Vec<CredentialsRecord>, RepoError>;
}

pub struct DbCredentialsRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbCredentialsRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl CredentialsRepo for DbCredentialsRepo<sqlx::Sqlite> {
    async fn upsert_endpoint(&self, endpoint: &ForgeEndpoint) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO endpoints (name, forge_type, base_url, api_base_url, created_at)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (name) DO UPDATE
              SET forge_type = $2, base_url = $3, api_base_url = $4
            "#,
        )
        .bind(&endpoint.name)
        .bind(endpoint.forge_type.to_string())
        .bind(&endpoint.base_url)
        .bind(&endpoint.api_base_url)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get_endpoint(&self, name: &str) -> Result<Option<EndpointRecord>, RepoError> {
        sqlx::query_as::<_, EndpointRecord>("SELECT * FROM endpoints WHERE name = $1")
            .bind(name)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, RepoError> {
        sqlx::query_as::<_, EndpointRecord>("SELECT * FROM endpoints ORDER BY name")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn upsert_credentials(&self, credentials: &ForgeCredentials) -> Result<(), RepoError> {
        let auth = serde_json::to_string(&credentials.auth)
            .map_err(|e| RepoError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
              INSERT INTO credentials (id, name, endpoint_name, auth, created_at)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (id) DO UPDATE
              SET name = $2, endpoint_name = $3, auth = $4
            "#,
        )
        .bind(credentials.id.to_string())
        .bind(&credentials.name)
        .bind(&credentials.endpoint.name)
        .bind(auth)
        .bind(Utc::now())
        .execute(self.db_pool.deref())
        .await?;

        Ok(())
    }

    async fn get_credentials(&self, id: &str) -> Result<Option<CredentialsRecord>, RepoError> {
        sqlx::query_as::<_, CredentialsRecord>("SELECT * FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_credentials_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CredentialsRecord>, RepoError> {
        sqlx::query_as::<_, CredentialsRecord>("SELECT * FROM credentials WHERE name = $1")
            .bind(name)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialsRecord>, RepoError> {
        sqlx::query_as::<_, CredentialsRecord>("SELECT * FROM credentials ORDER BY name")
            .fetch_all(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }
}
