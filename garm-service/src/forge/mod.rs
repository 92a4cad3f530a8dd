pub mod github;
pub mod scaleset;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garm_common::model::{
    CredentialsId, Entity, EntityId, ForgeCredentials, Pool, RunnerApplicationDownload,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited")]
    RateLimited,
    #[error("transient forge error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl ForgeError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ForgeError::Transient(_) | ForgeError::RateLimited)
    }
}

/// Forge-side view of a registered runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub os: String,
    pub status: String,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<RunnerLabel>,
}

impl ForgeRunner {
    pub fn is_offline(&self) -> bool {
        self.status != "online"
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerLabel {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct JitConfig {
    pub config: HashMap<String, String>,
    pub runner_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForgeHook {
    pub id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct HookSpec {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub insecure_ssl: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ForgeWorkflowJob {
    pub id: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub status: String,
}

/// Uniform forge operations, scoped to the entity the client was built for.
/// Implementations absorb forge differences in URL structure and pagination.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError>;

    /// Idempotent: removing an unknown runner is success.
    async fn remove_runner(&self, runner_id: i64) -> Result<(), ForgeError>;

    async fn create_registration_token(&self) -> Result<RegistrationToken, ForgeError>;

    async fn get_jit_config(
        &self,
        runner_name: &str,
        pool: &Pool,
        labels: &[String],
    ) -> Result<JitConfig, ForgeError>;

    async fn list_runner_application_downloads(
        &self,
    ) -> Result<Vec<RunnerApplicationDownload>, ForgeError>;

    async fn list_hooks(&self) -> Result<Vec<ForgeHook>, ForgeError>;

    async fn get_hook(&self, hook_id: i64) -> Result<ForgeHook, ForgeError>;

    async fn create_hook(&self, spec: &HookSpec) -> Result<ForgeHook, ForgeError>;

    async fn delete_hook(&self, hook_id: i64) -> Result<(), ForgeError>;

    async fn ping_hook(&self, hook_id: i64) -> Result<(), ForgeError>;

    /// Used to reconstruct labels when a webhook omitted them. Repository
    /// entities only.
    async fn get_workflow_job(&self, job_id: i64) -> Result<ForgeWorkflowJob, ForgeError>;
}

pub trait ForgeClientFactory: Send + Sync {
    fn create(
        &self,
        entity: &Entity,
        credentials: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError>;
}

pub struct DefaultForgeClientFactory {
    config: crate::config::ForgeConfig,
}

impl DefaultForgeClientFactory {
    pub fn new(config: crate::config::ForgeConfig) -> Self {
        Self { config }
    }
}

impl ForgeClientFactory for DefaultForgeClientFactory {
    fn create(
        &self,
        entity: &Entity,
        credentials: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError> {
        // gitea implements the same runner API shape; only the URLs differ,
        // and those come from the endpoint record
        Ok(Arc::new(github::GithubClient::new(
            entity.clone(),
            credentials.clone(),
            self.config.clone(),
        )?))
    }
}

struct CachedClient {
    credentials_id: CredentialsId,
    auth_fingerprint: u64,
    client: Arc<dyn ForgeClient>,
}

/// Process-wide forge client cache. Rotation replaces the cached entry
/// atomically; calls already running keep the client they started with.
pub struct ForgeClientCache {
    factory: Arc<dyn ForgeClientFactory>,
    clients: RwLock<HashMap<EntityId, CachedClient>>,
}

impl ForgeClientCache {
    pub fn new(factory: Arc<dyn ForgeClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn client_for(
        &self,
        entity: &Entity,
        credentials: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError> {
        let fingerprint = auth_fingerprint(credentials);
        {
            let clients = self.clients.read().await;
            if let Some(cached) = clients.get(&entity.id) {
                if cached.credentials_id == credentials.id
                    && cached.auth_fingerprint == fingerprint
                {
                    return Ok(cached.client.clone());
                }
            }
        }

        let client = self.factory.create(entity, credentials)?;
        let mut clients = self.clients.write().await;
        clients.insert(
            entity.id,
            CachedClient {
                credentials_id: credentials.id,
                auth_fingerprint: fingerprint,
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Drops every cached client built from the given credentials.
    pub async fn invalidate_credentials(&self, credentials_id: CredentialsId) {
        let mut clients = self.clients.write().await;
        clients.retain(|_, cached| cached.credentials_id != credentials_id);
    }

    pub async fn invalidate_entity(&self, entity_id: EntityId) {
        let mut clients = self.clients.write().await;
        clients.remove(&entity_id);
    }
}

fn auth_fingerprint(credentials: &ForgeCredentials) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(&credentials.auth)
        .unwrap_or_default()
        .hash(&mut hasher);
    credentials.endpoint.api_base_url.hash(&mut hasher);
    hasher.finish()
}
