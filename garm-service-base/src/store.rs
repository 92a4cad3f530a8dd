use std::sync::Arc;

use chrono::{DateTime, Utc};
use garm_common::model::{
    ControllerInfo, Entity, EntityId, EntityKind, EventLevel, ForgeCredentials, ForgeEndpoint,
    Instance, InstanceId, Job, JobId, Pool, PoolId, ScaleSet, ScaleSetId, StateTransitionError,
    DEFAULT_EVENT_RING_SIZE,
};
use sqlx::Sqlite;
use tokio::sync::broadcast;

use crate::repo::controller::{ControllerRepo, DbControllerRepo};
use crate::repo::credentials::{CredentialsRepo, DbCredentialsRepo};
use crate::repo::entity::{DbEntityRepo, EntityRepo};
use crate::repo::instance::{DbInstanceRepo, InstanceRepo, UpdateInstanceParams};
use crate::repo::job::{DbJobRepo, JobRepo};
use crate::repo::pool::{DbPoolRepo, PoolRepo};
use crate::repo::scale_set::{DbScaleSetRepo, ScaleSetRepo};
use crate::repo::RepoError;
use crate::watcher::{ChangeOperation, ChangePayload, ChangeRecord, Watcher};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Repo(RepoError::NotFound))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Repo(RepoError::Unique))
    }
}

/// Typed gateway over the persistence layer. All mutations go through here so
/// that instance state transitions are validated and interested components
/// are notified of changes.
#[derive(Clone)]
pub struct Store {
    entity_repo: Arc<dyn EntityRepo + Send + Sync>,
    pool_repo: Arc<dyn PoolRepo + Send + Sync>,
    scale_set_repo: Arc<dyn ScaleSetRepo + Send + Sync>,
    instance_repo: Arc<dyn InstanceRepo + Send + Sync>,
    job_repo: Arc<dyn JobRepo + Send + Sync>,
    credentials_repo: Arc<dyn CredentialsRepo + Send + Sync>,
    controller_repo: Arc<dyn ControllerRepo + Send + Sync>,
    watcher: Watcher,
    event_ring_size: usize,
}

impl Store {
    pub fn sqlite(db_pool: Arc<sqlx::Pool<Sqlite>>) -> Self {
        Self {
            entity_repo: Arc::new(DbEntityRepo::new(db_pool.clone())),
            pool_repo: Arc::new(DbPoolRepo::new(db_pool.clone())),
            scale_set_repo: Arc::new(DbScaleSetRepo::new(db_pool.clone())),
            instance_repo: Arc::new(DbInstanceRepo::new(db_pool.clone())),
            job_repo: Arc::new(DbJobRepo::new(db_pool.clone())),
            credentials_repo: Arc::new(DbCredentialsRepo::new(db_pool.clone())),
            controller_repo: Arc::new(DbControllerRepo::new(db_pool)),
            watcher: Watcher::default(),
            event_ring_size: DEFAULT_EVENT_RING_SIZE,
        }
    }

    pub fn with_event_ring_size(mut self, event_ring_size: usize) -> Self {
        self.event_ring_size = event_ring_size;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.watcher.subscribe()
    }

    // --- entities ---------------------------------------------------------

    pub async fn create_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entity_repo.create(&entity.clone().into()).await?;
        self.watcher.publish(
            ChangeOperation::Create,
            ChangePayload::Entity(entity.clone()),
        );
        Ok(())
    }

    pub async fn get_entity(&self, id: EntityId) -> Result<Entity, StoreError> {
        let record = self
            .entity_repo
            .get(&id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn get_entity_by_name(
        &self,
        kind: EntityKind,
        name: &str,
        endpoint_name: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let record = self
            .entity_repo
            .get_by_name(kind, name, endpoint_name)
            .await?;
        record
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .transpose()
    }

    pub async fn list_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let records = self.entity_repo.list().await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn update_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entity_repo.update(&entity.clone().into()).await?;
        self.watcher.publish(
            ChangeOperation::Update,
            ChangePayload::Entity(entity.clone()),
        );
        Ok(())
    }

    /// Pool manager status flips are written by the controller itself, so no
    /// change record is published for them.
    pub async fn set_entity_pool_manager_status(
        &self,
        id: EntityId,
        is_running: bool,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.entity_repo
            .update_status(&id.to_string(), is_running, failure_reason)
            .await?;
        Ok(())
    }

    pub async fn delete_entity(&self, id: EntityId) -> Result<(), StoreError> {
        let entity = self.get_entity(id).await?;
        self.entity_repo.delete(&id.to_string()).await?;
        self.watcher
            .publish(ChangeOperation::Delete, ChangePayload::Entity(entity));
        Ok(())
    }

    // --- endpoints and credentials ----------------------------------------

    pub async fn upsert_endpoint(&self, endpoint: &ForgeEndpoint) -> Result<(), StoreError> {
        self.credentials_repo.upsert_endpoint(endpoint).await?;
        Ok(())
    }

    pub async fn get_endpoint(&self, name: &str) -> Result<ForgeEndpoint, StoreError> {
        let record = self
            .credentials_repo
            .get_endpoint(name)
            .await?
            .ok_or(RepoError::NotFound)?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn upsert_credentials(
        &self,
        credentials: &ForgeCredentials,
    ) -> Result<(), StoreError> {
        let existing = self
            .credentials_repo
            .get_credentials(&credentials.id.to_string())
            .await?;
        self.credentials_repo
            .upsert_credentials(credentials)
            .await?;
        let operation = if existing.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Create
        };
        self.watcher.publish(
            operation,
            ChangePayload::Credentials(credentials.clone()),
        );
        Ok(())
    }

    pub async fn get_credentials(&self, id: &str) -> Result<ForgeCredentials, StoreError> {
        let record = self
            .credentials_repo
            .get_credentials(id)
            .await?
            .ok_or(RepoError::NotFound)?;
        let endpoint = self.get_endpoint(&record.endpoint_name).await?;
        record.into_model(endpoint).map_err(StoreError::InvalidRecord)
    }

    pub async fn get_credentials_by_name(
        &self,
        name: &str,
    ) -> Result<ForgeCredentials, StoreError> {
        let record = self
            .credentials_repo
            .get_credentials_by_name(name)
            .await?
            .ok_or(RepoError::NotFound)?;
        let endpoint = self.get_endpoint(&record.endpoint_name).await?;
        record.into_model(endpoint).map_err(StoreError::InvalidRecord)
    }

    pub async fn list_credentials(&self) -> Result<Vec<ForgeCredentials>, StoreError> {
        let records = self.credentials_repo.list_credentials().await?;
        let mut result = Vec::with_capacity(records.len());
        for record in records {
            let endpoint = self.get_endpoint(&record.endpoint_name).await?;
            result.push(
                record
                    .into_model(endpoint)
                    .map_err(StoreError::InvalidRecord)?,
            );
        }
        Ok(result)
    }

    // --- pools ------------------------------------------------------------

    pub async fn create_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        pool.validate().map_err(StoreError::InvalidRecord)?;
        self.pool_repo.create(&pool.clone().into()).await?;
        self.watcher
            .publish(ChangeOperation::Create, ChangePayload::Pool(pool.clone()));
        Ok(())
    }

    pub async fn get_pool(&self, id: PoolId) -> Result<Pool, StoreError> {
        let record = self
            .pool_repo
            .get(&id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let records = self.pool_repo.list().await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn list_entity_pools(&self, entity_id: EntityId) -> Result<Vec<Pool>, StoreError> {
        let records = self.pool_repo.list_by_entity(&entity_id.to_string()).await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn update_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        pool.validate().map_err(StoreError::InvalidRecord)?;
        self.pool_repo.update(&pool.clone().into()).await?;
        self.watcher
            .publish(ChangeOperation::Update, ChangePayload::Pool(pool.clone()));
        Ok(())
    }

    pub async fn delete_pool(&self, id: PoolId) -> Result<(), StoreError> {
        let pool = self.get_pool(id).await?;
        self.pool_repo.delete(&id.to_string()).await?;
        self.watcher
            .publish(ChangeOperation::Delete, ChangePayload::Pool(pool));
        Ok(())
    }

    // --- scale sets -------------------------------------------------------

    pub async fn create_scale_set(&self, scale_set: &ScaleSet) -> Result<(), StoreError> {
        self.scale_set_repo
            .create(&scale_set.clone().into())
            .await?;
        self.watcher.publish(
            ChangeOperation::Create,
            ChangePayload::ScaleSet(scale_set.clone()),
        );
        Ok(())
    }

    pub async fn get_scale_set(&self, id: ScaleSetId) -> Result<ScaleSet, StoreError> {
        let record = self
            .scale_set_repo
            .get(&id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn list_scale_sets(&self) -> Result<Vec<ScaleSet>, StoreError> {
        let records = self.scale_set_repo.list().await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn list_entity_scale_sets(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<ScaleSet>, StoreError> {
        let records = self
            .scale_set_repo
            .list_by_entity(&entity_id.to_string())
            .await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn update_scale_set(&self, scale_set: &ScaleSet) -> Result<(), StoreError> {
        self.scale_set_repo
            .update(&scale_set.clone().into())
            .await?;
        self.watcher.publish(
            ChangeOperation::Update,
            ChangePayload::ScaleSet(scale_set.clone()),
        );
        Ok(())
    }

    pub async fn set_scale_set_desired_count(
        &self,
        id: ScaleSetId,
        count: i64,
    ) -> Result<(), StoreError> {
        self.scale_set_repo
            .set_desired_runner_count(&id.to_string(), count)
            .await?;
        Ok(())
    }

    /// Conditional cursor advance; returns false when the store rejected a
    /// non-monotonic value.
    pub async fn set_scale_set_last_message_id(
        &self,
        id: ScaleSetId,
        message_id: i64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .scale_set_repo
            .set_last_message_id(&id.to_string(), message_id)
            .await?)
    }

    pub async fn delete_scale_set(&self, id: ScaleSetId) -> Result<(), StoreError> {
        let scale_set = self.get_scale_set(id).await?;
        self.scale_set_repo.delete(&id.to_string()).await?;
        self.watcher
            .publish(ChangeOperation::Delete, ChangePayload::ScaleSet(scale_set));
        Ok(())
    }

    // --- instances --------------------------------------------------------

    pub async fn create_instance(&self, instance: &Instance) -> Result<Instance, StoreError> {
        if !instance.owner_is_valid() {
            return Err(StoreError::InvalidRecord(
                "instance must belong to exactly one pool or scale set".to_string(),
            ));
        }
        let record = instance_to_record(instance);
        let created = self.instance_repo.create(&record).await?;
        let created = created
            .into_model(vec![])
            .map_err(StoreError::InvalidRecord)?;
        self.watcher.publish(
            ChangeOperation::Create,
            ChangePayload::Instance(created.clone()),
        );
        Ok(created)
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance, StoreError> {
        let record = self
            .instance_repo
            .get(&id.to_string())
            .await?
            .ok_or(RepoError::NotFound)?;
        self.assemble_instance(record).await
    }

    pub async fn get_instance_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        match self.instance_repo.get_by_name(name).await? {
            Some(record) => Ok(Some(self.assemble_instance(record).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_instance_by_agent_id(
        &self,
        agent_id: i64,
    ) -> Result<Option<Instance>, StoreError> {
        match self.instance_repo.get_by_agent_id(agent_id).await? {
            Some(record) => Ok(Some(self.assemble_instance(record).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let records = self.instance_repo.list().await?;
        self.assemble_instances(records).await
    }

    pub async fn list_pool_instances(&self, pool_id: PoolId) -> Result<Vec<Instance>, StoreError> {
        let records = self.instance_repo.list_by_pool(&pool_id.to_string()).await?;
        self.assemble_instances(records).await
    }

    pub async fn list_scale_set_instances(
        &self,
        scale_set_id: ScaleSetId,
    ) -> Result<Vec<Instance>, StoreError> {
        let records = self
            .instance_repo
            .list_by_scale_set(&scale_set_id.to_string())
            .await?;
        self.assemble_instances(records).await
    }

    pub async fn list_entity_instances(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<Instance>, StoreError> {
        let records = self
            .instance_repo
            .list_by_entity(&entity_id.to_string())
            .await?;
        self.assemble_instances(records).await
    }

    /// Applies a partial update, rejecting illegal state machine transitions
    /// before anything is written. Returns the post-image.
    pub async fn update_instance(
        &self,
        id: InstanceId,
        params: UpdateInstanceParams,
    ) -> Result<Instance, StoreError> {
        let current = self.get_instance(id).await?;

        if let Some(next) = params.status {
            current.status.transition(next)?;
        }
        if let Some(next) = params.runner_status {
            current.runner_status.transition(next)?;
        }

        let updated = self.instance_repo.update(&id.to_string(), &params).await?;
        let updated = self.assemble_instance(updated).await?;
        self.watcher.publish(
            ChangeOperation::Update,
            ChangePayload::Instance(updated.clone()),
        );
        Ok(updated)
    }

    pub async fn delete_instance_by_name(&self, name: &str) -> Result<Instance, StoreError> {
        let record = self.instance_repo.delete_by_name(name).await?;
        let deleted = record
            .into_model(vec![])
            .map_err(StoreError::InvalidRecord)?;
        self.watcher.publish(
            ChangeOperation::Delete,
            ChangePayload::Instance(deleted.clone()),
        );
        Ok(deleted)
    }

    pub async fn add_instance_event(
        &self,
        id: InstanceId,
        level: EventLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        self.instance_repo
            .add_event(&id.to_string(), level, message, self.event_ring_size)
            .await?;
        Ok(())
    }

    async fn assemble_instance(
        &self,
        record: crate::repo::instance::InstanceRecord,
    ) -> Result<Instance, StoreError> {
        let events = self.instance_repo.events(&record.id).await?;
        let events = events
            .into_iter()
            .map(|e| e.try_into().map_err(StoreError::InvalidRecord))
            .collect::<Result<Vec<_>, _>>()?;
        record.into_model(events).map_err(StoreError::InvalidRecord)
    }

    async fn assemble_instances(
        &self,
        records: Vec<crate::repo::instance::InstanceRecord>,
    ) -> Result<Vec<Instance>, StoreError> {
        let mut result = Vec::with_capacity(records.len());
        for record in records {
            result.push(self.assemble_instance(record).await?);
        }
        Ok(result)
    }

    // --- jobs -------------------------------------------------------------

    pub async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.job_repo.upsert(&job.clone().into()).await?;
        self.watcher
            .publish(ChangeOperation::Update, ChangePayload::Job(job.clone()));
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let record = self.job_repo.get(id.0).await?;
        record
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .transpose()
    }

    pub async fn list_queued_jobs(&self, entity_id: EntityId) -> Result<Vec<Job>, StoreError> {
        let records = self.job_repo.list_queued(&entity_id.to_string()).await?;
        records
            .into_iter()
            .map(|r| r.try_into().map_err(StoreError::InvalidRecord))
            .collect()
    }

    pub async fn lock_job(&self, id: JobId, entity_id: EntityId) -> Result<bool, StoreError> {
        Ok(self.job_repo.lock(id.0, &entity_id.to_string()).await?)
    }

    pub async fn unlock_job(&self, id: JobId, entity_id: EntityId) -> Result<(), StoreError> {
        self.job_repo.unlock(id.0, &entity_id.to_string()).await?;
        Ok(())
    }

    pub async fn break_lock_if_queued(&self, id: JobId) -> Result<(), StoreError> {
        self.job_repo.break_lock_if_queued(id.0).await?;
        Ok(())
    }

    pub async fn delete_completed_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self.job_repo.delete_completed_before(cutoff).await?)
    }

    // --- controller -------------------------------------------------------

    pub async fn ensure_controller_info(
        &self,
        info: &ControllerInfo,
    ) -> Result<ControllerInfo, StoreError> {
        let record = self.controller_repo.ensure(info).await?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn get_controller_info(&self) -> Result<ControllerInfo, StoreError> {
        let record = self
            .controller_repo
            .get()
            .await?
            .ok_or(RepoError::NotFound)?;
        record.try_into().map_err(StoreError::InvalidRecord)
    }

    pub async fn update_controller_urls(
        &self,
        webhook_url: Option<&str>,
        metadata_url: Option<&str>,
        callback_url: Option<&str>,
    ) -> Result<(), StoreError> {
        self.controller_repo
            .update_urls(webhook_url, metadata_url, callback_url)
            .await?;
        Ok(())
    }
}

fn instance_to_record(instance: &Instance) -> crate::repo::instance::InstanceRecord {
    crate::repo::instance::InstanceRecord {
        id: instance.id.to_string(),
        name: instance.name.clone(),
        provider_id: instance.provider_id.clone(),
        pool_id: instance.pool_id.map(|id| id.to_string()),
        scale_set_id: instance.scale_set_id.map(|id| id.to_string()),
        os_type: instance.os_type.to_string(),
        os_arch: instance.os_arch.to_string(),
        status: instance.status.to_string(),
        runner_status: instance.runner_status.to_string(),
        create_attempt: instance.create_attempt as i64,
        agent_id: instance.agent_id,
        token_fetched: instance.token_fetched,
        jit_configuration: instance
            .jit_configuration
            .as_ref()
            .map(|jit| serde_json::to_string(jit).unwrap_or_else(|_| "{}".to_string())),
        addresses: serde_json::to_string(&instance.addresses)
            .unwrap_or_else(|_| "[]".to_string()),
        heartbeat: instance.heartbeat,
        created_at: instance.created_at,
        updated_at: instance.updated_at,
    }
}
