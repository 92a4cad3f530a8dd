use std::sync::Arc;

use chrono::Utc;
use garm_common::model::{
    BootstrapInstance, ControllerInfo, Entity, EventLevel, Instance, InstanceId, InstanceStatus,
    RunnerStatus, ScaleSet, ScaleSetId,
};
use garm_service_base::repo::instance::UpdateInstanceParams;
use garm_service_base::store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::TokenService;
use crate::config::{ForgeConfig, RunnerConfig};
use crate::forge::scaleset::{
    HttpScaleSetClient, ScaleSetClient, ScaleSetMessage, ScaleSetMessageKind, ScaleSetSession,
};
use crate::forge::{ForgeClient, ForgeClientCache, ForgeError};
use crate::metrics;
use crate::provider::{generate_instance_name, Provider, ProviderError, ProviderRegistry};
use crate::runner::{controller_label, ManagerError};

pub trait ScaleSetClientFactory: Send + Sync {
    fn create(
        &self,
        entity: &Entity,
        credentials: &garm_common::model::ForgeCredentials,
        forge_client: Arc<dyn ForgeClient>,
    ) -> Result<Arc<dyn ScaleSetClient>, ForgeError>;
}

pub struct DefaultScaleSetClientFactory {
    config: ForgeConfig,
}

impl DefaultScaleSetClientFactory {
    pub fn new(config: ForgeConfig) -> Self {
        Self { config }
    }
}

impl ScaleSetClientFactory for DefaultScaleSetClientFactory {
    fn create(
        &self,
        entity: &Entity,
        credentials: &garm_common::model::ForgeCredentials,
        forge_client: Arc<dyn ForgeClient>,
    ) -> Result<Arc<dyn ScaleSetClient>, ForgeError> {
        Ok(Arc::new(HttpScaleSetClient::new(
            entity.clone(),
            credentials.clone(),
            forge_client,
            &self.config,
        )?))
    }
}

pub struct ScaleSetWorkerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ScaleSetWorkerHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// One per enabled scale set. Holds the exclusive long-poll session and
/// creates exactly-sized JIT runners for acquired jobs.
pub struct ScaleSetWorker {
    scale_set_id: ScaleSetId,
    store: Store,
    clients: Arc<ForgeClientCache>,
    scale_set_clients: Arc<dyn ScaleSetClientFactory>,
    providers: Arc<ProviderRegistry>,
    token_service: Arc<TokenService>,
    controller_info: ControllerInfo,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl ScaleSetWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        scale_set: &ScaleSet,
        store: Store,
        clients: Arc<ForgeClientCache>,
        scale_set_clients: Arc<dyn ScaleSetClientFactory>,
        providers: Arc<ProviderRegistry>,
        token_service: Arc<TokenService>,
        controller_info: ControllerInfo,
        config: RunnerConfig,
        parent_cancel: &CancellationToken,
    ) -> ScaleSetWorkerHandle {
        let cancel = parent_cancel.child_token();
        let worker = Arc::new(ScaleSetWorker {
            scale_set_id: scale_set.id,
            store,
            clients,
            scale_set_clients,
            providers,
            token_service,
            controller_info,
            config,
            cancel: cancel.clone(),
        });

        let join = tokio::spawn(worker.run());

        ScaleSetWorkerHandle { cancel, join }
    }

    async fn run(self: Arc<Self>) {
        info!(scale_set = %self.scale_set_id, "scale set worker starting");
        let mut backoff = std::time::Duration::from_secs(1);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_session().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        scale_set = %self.scale_set_id,
                        "scale set session failed: {e}, restarting in {backoff:?}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(std::time::Duration::from_secs(60));
                }
            }
        }
        info!(scale_set = %self.scale_set_id, "scale set worker stopped");
    }

    /// One session: create it, drain messages in order, close it. Returns
    /// `Ok(())` only on cancellation.
    async fn run_session(&self) -> Result<(), ManagerError> {
        let scale_set = self.store.get_scale_set(self.scale_set_id).await?;
        let entity = self.store.get_entity(scale_set.entity_id).await?;
        let credentials = self
            .store
            .get_credentials(&entity.credentials_id.to_string())
            .await?;
        let forge_client = self.clients.client_for(&entity, &credentials).await?;
        let client = self
            .scale_set_clients
            .create(&entity, &credentials, forge_client.clone())?;

        let owner = format!("garm-{}", self.controller_info.controller_id);
        let session = client
            .create_session(scale_set.scale_set_id, &owner)
            .await?;
        info!(
            scale_set = %self.scale_set_id,
            session = session.session_id,
            "scale set session established"
        );

        let mut cursor = scale_set.last_message_id;
        let mut maintenance =
            tokio::time::interval(self.config.reconcile_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break Ok(());
                }
                _ = maintenance.tick() => {
                    if let Err(e) = self.maintain(&entity, &forge_client).await {
                        warn!(scale_set = %self.scale_set_id, "maintenance failed: {e}");
                    }
                    if let Err(e) = self
                        .ensure_min_runners(&entity, &client, &forge_client, &session)
                        .await
                    {
                        warn!(scale_set = %self.scale_set_id, "warm runner top-up failed: {e}");
                    }
                }
                message = client.get_message(&session, cursor) => {
                    match message {
                        Ok(None) => {}
                        Ok(Some(message)) => {
                            match self.handle_message(&entity, &client, &forge_client, &session, &message, cursor).await {
                                Ok(Some(new_cursor)) => cursor = new_cursor,
                                Ok(None) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
            }
        };

        // close the session explicitly in every exit path
        if let Err(e) = client.delete_session(&session).await {
            warn!(scale_set = %self.scale_set_id, "failed to close session: {e}");
        }
        result
    }

    /// Processes one message and advances the cursor. Returns the new cursor,
    /// or `None` when the message was a stale replay.
    async fn handle_message(
        &self,
        entity: &Entity,
        client: &Arc<dyn ScaleSetClient>,
        forge_client: &Arc<dyn ForgeClient>,
        session: &ScaleSetSession,
        message: &ScaleSetMessage,
        cursor: i64,
    ) -> Result<Option<i64>, ManagerError> {
        if message.message_id <= cursor {
            // replayed message; acknowledge so the queue drains, change nothing
            debug!(
                scale_set = %self.scale_set_id,
                message_id = message.message_id,
                "ignoring stale scale set message"
            );
            client.delete_message(session, message.message_id).await?;
            return Ok(None);
        }

        self.process_message(entity, client, forge_client, session, message)
            .await?;

        // the conditional write is the commit point; a rejection means some
        // other actor moved the cursor and this session is no longer
        // authoritative
        let advanced = self
            .store
            .set_scale_set_last_message_id(self.scale_set_id, message.message_id)
            .await?;
        if !advanced {
            return Err(ManagerError::Other(format!(
                "cursor write for message {} rejected",
                message.message_id
            )));
        }

        // acknowledge only after the local state change stuck
        client.delete_message(session, message.message_id).await?;
        Ok(Some(message.message_id))
    }

    async fn process_message(
        &self,
        entity: &Entity,
        client: &Arc<dyn ScaleSetClient>,
        forge_client: &Arc<dyn ForgeClient>,
        session: &ScaleSetSession,
        message: &ScaleSetMessage,
    ) -> Result<(), ManagerError> {
        let scale_set = self.store.get_scale_set(self.scale_set_id).await?;
        let jobs = message.jobs()?;

        let mut available: Vec<i64> = Vec::new();
        for job in &jobs {
            let kind = job.kind();
            metrics::SCALE_SET_MESSAGES
                .with_label_values(&[match kind {
                    ScaleSetMessageKind::JobAvailable => "job_available",
                    ScaleSetMessageKind::JobAssigned => "job_assigned",
                    ScaleSetMessageKind::JobStarted => "job_started",
                    ScaleSetMessageKind::JobCompleted => "job_completed",
                    ScaleSetMessageKind::JobMessageLost => "job_message_lost",
                    ScaleSetMessageKind::Unknown => "unknown",
                }])
                .inc();

            match kind {
                ScaleSetMessageKind::JobAvailable => {
                    available.push(job.runner_request_id);
                }
                ScaleSetMessageKind::JobAssigned => {}
                ScaleSetMessageKind::JobStarted => {
                    if let Some(instance) = self.instance_for(job.runner_id, &job.runner_name).await? {
                        let _ = self
                            .store
                            .update_instance(
                                instance.id,
                                UpdateInstanceParams {
                                    runner_status: Some(RunnerStatus::Active),
                                    agent_id: job.runner_id,
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                }
                ScaleSetMessageKind::JobCompleted => {
                    if let Some(instance) = self.instance_for(job.runner_id, &job.runner_name).await? {
                        let _ = self
                            .store
                            .update_instance(
                                instance.id,
                                UpdateInstanceParams {
                                    runner_status: Some(RunnerStatus::Terminated),
                                    status: Some(InstanceStatus::PendingDelete),
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                }
                ScaleSetMessageKind::JobMessageLost | ScaleSetMessageKind::Unknown => {}
            }
        }

        if let Some(statistics) = &message.statistics {
            let desired = statistics
                .total_assigned_jobs
                .max(scale_set.min_runners as i64)
                .min(scale_set.max_runners as i64);
            let _ = self
                .store
                .set_scale_set_desired_count(self.scale_set_id, desired)
                .await;
        }

        if !available.is_empty() {
            // capacity discipline: never acquire beyond max_runners
            let instances = self
                .store
                .list_scale_set_instances(self.scale_set_id)
                .await?;
            let total = instances
                .iter()
                .filter(|i| i.status != InstanceStatus::Deleted)
                .count() as i64;
            let capacity = (scale_set.max_runners as i64 - total).max(0) as usize;
            if capacity == 0 {
                debug!(
                    scale_set = %self.scale_set_id,
                    "at capacity, leaving jobs on the queue"
                );
            } else {
                available.truncate(capacity);
                let acquired = client
                    .acquire_jobs(scale_set.scale_set_id, session, &available)
                    .await?;
                info!(
                    scale_set = %self.scale_set_id,
                    acquired = acquired.len(),
                    "acquired scale set jobs"
                );
                for _ in &acquired {
                    if let Err(e) = self
                        .provision_instance(entity, &scale_set, client, forge_client, session)
                        .await
                    {
                        error!(scale_set = %self.scale_set_id, "provisioning failed: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    async fn instance_for(
        &self,
        runner_id: Option<i64>,
        runner_name: &Option<String>,
    ) -> Result<Option<Instance>, ManagerError> {
        if let Some(runner_id) = runner_id {
            if let Some(instance) = self.store.get_instance_by_agent_id(runner_id).await? {
                return Ok(Some(instance));
            }
        }
        if let Some(runner_name) = runner_name {
            return Ok(self.store.get_instance_by_name(runner_name).await?);
        }
        Ok(None)
    }

    /// Creates exactly one JIT runner for an acquired job.
    async fn provision_instance(
        &self,
        entity: &Entity,
        scale_set: &ScaleSet,
        client: &Arc<dyn ScaleSetClient>,
        forge_client: &Arc<dyn ForgeClient>,
        session: &ScaleSetSession,
    ) -> Result<(), ManagerError> {
        let provider = self
            .providers
            .get(&scale_set.provider_name)
            .ok_or_else(|| {
                ManagerError::Other(format!(
                    "provider {} is not configured",
                    scale_set.provider_name
                ))
            })?;

        let instance = self.insert_instance_row(scale_set).await?;
        let instance_id = instance.id;

        match self
            .provision_inner(
                entity,
                scale_set,
                client,
                forge_client,
                session,
                provider,
                instance,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self
                    .store
                    .add_instance_event(
                        instance_id,
                        EventLevel::Error,
                        &format!("provisioning failed: {e}"),
                    )
                    .await;
                let _ = self
                    .store
                    .update_instance(
                        instance_id,
                        UpdateInstanceParams {
                            status: Some(InstanceStatus::PendingDelete),
                            ..Default::default()
                        },
                    )
                    .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision_inner(
        &self,
        entity: &Entity,
        scale_set: &ScaleSet,
        client: &Arc<dyn ScaleSetClient>,
        forge_client: &Arc<dyn ForgeClient>,
        session: &ScaleSetSession,
        provider: Arc<dyn Provider>,
        instance: Instance,
    ) -> Result<(), ManagerError> {
        let instance_id = instance.id;

        let mut instance = self
            .store
            .update_instance(
                instance_id,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::Creating),
                    ..Default::default()
                },
            )
            .await?;

        let jit = client
            .generate_jit_config(scale_set.scale_set_id, session, &instance.name)
            .await?;
        instance = self
            .store
            .update_instance(
                instance_id,
                UpdateInstanceParams {
                    agent_id: Some(jit.runner_id),
                    jit_configuration: Some(jit.config),
                    ..Default::default()
                },
            )
            .await?;

        let credentials = self
            .store
            .get_credentials(&entity.credentials_id.to_string())
            .await?;
        let tools = forge_client.list_runner_application_downloads().await?;
        let instance_token = self.token_service.issue_instance_token(
            &instance,
            entity,
            credentials.endpoint.forge_type,
        )?;

        let endpoint_base = credentials.endpoint.base_url.trim_end_matches('/');
        let bootstrap = BootstrapInstance {
            name: instance.name.clone(),
            tools,
            repo_url: format!("{endpoint_base}/{}", entity.name),
            callback_url: self
                .controller_info
                .callback_url
                .clone()
                .unwrap_or_default(),
            metadata_url: self
                .controller_info
                .metadata_url
                .clone()
                .unwrap_or_default(),
            instance_token,
            ssh_keys: vec![],
            os_type: scale_set.os_type,
            os_arch: scale_set.os_arch,
            flavor: scale_set.flavor.clone(),
            image: scale_set.image.clone(),
            labels: vec![controller_label(&self.controller_info)],
            pool_id: scale_set.id.to_string(),
            extra_specs: scale_set.extra_specs.clone(),
            jit_config_enabled: true,
            jit_configuration: instance.jit_configuration.clone(),
        };

        let created = provider
            .create_instance(&scale_set.id.to_string(), &bootstrap, &self.cancel)
            .await?;

        self.store
            .update_instance(
                instance_id,
                UpdateInstanceParams {
                    provider_id: Some(created.provider_id),
                    status: Some(InstanceStatus::Running),
                    addresses: Some(created.addresses),
                    ..Default::default()
                },
            )
            .await?;
        metrics::RUNNERS_CREATED.inc();
        Ok(())
    }

    async fn insert_instance_row(&self, scale_set: &ScaleSet) -> Result<Instance, ManagerError> {
        for _ in 0..5 {
            let now = Utc::now();
            let instance = Instance {
                id: InstanceId::new_v4(),
                name: generate_instance_name(&scale_set.runner_prefix),
                provider_id: None,
                pool_id: None,
                scale_set_id: Some(scale_set.id),
                os_type: scale_set.os_type,
                os_arch: scale_set.os_arch,
                status: InstanceStatus::PendingCreate,
                runner_status: RunnerStatus::Pending,
                create_attempt: 1,
                agent_id: None,
                token_fetched: false,
                jit_configuration: None,
                addresses: vec![],
                heartbeat: None,
                status_events: vec![],
                created_at: now,
                updated_at: now,
            };
            match self.store.create_instance(&instance).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_duplicate() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ManagerError::Other(
            "could not find a free runner name".to_string(),
        ))
    }

    /// Keeps the configured number of warm runners registered even before
    /// any job-assignment traffic arrives.
    async fn ensure_min_runners(
        &self,
        entity: &Entity,
        client: &Arc<dyn ScaleSetClient>,
        forge_client: &Arc<dyn ForgeClient>,
        session: &ScaleSetSession,
    ) -> Result<(), ManagerError> {
        let scale_set = self.store.get_scale_set(self.scale_set_id).await?;
        if !scale_set.enabled || scale_set.min_runners == 0 {
            return Ok(());
        }
        let instances = self
            .store
            .list_scale_set_instances(self.scale_set_id)
            .await?;
        let live = instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Deleted)
            .count() as u32;
        for _ in live..scale_set.min_runners {
            self.provision_instance(entity, &scale_set, client, forge_client, session)
                .await?;
        }
        Ok(())
    }

    /// Reaps finished or failed scale set runners between messages.
    async fn maintain(
        &self,
        entity: &Entity,
        forge_client: &Arc<dyn ForgeClient>,
    ) -> Result<(), ManagerError> {
        let scale_set = self.store.get_scale_set(self.scale_set_id).await?;
        let instances = self
            .store
            .list_scale_set_instances(self.scale_set_id)
            .await?;

        for instance in &instances {
            match instance.status {
                InstanceStatus::PendingDelete | InstanceStatus::Deleting => {
                    if instance.status == InstanceStatus::PendingDelete {
                        self.store
                            .update_instance(
                                instance.id,
                                UpdateInstanceParams {
                                    status: Some(InstanceStatus::Deleting),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }

                    if let Some(provider) = self.providers.get(&scale_set.provider_name) {
                        match provider.delete_instance(&instance.name, &self.cancel).await {
                            Ok(()) | Err(ProviderError::NotFound(_)) => {}
                            Err(e) => {
                                warn!(instance = instance.name, "provider delete failed: {e}");
                                continue;
                            }
                        }
                    }
                    if let Some(agent_id) = instance.agent_id {
                        forge_client.remove_runner(agent_id).await?;
                    }
                    self.store
                        .update_instance(
                            instance.id,
                            UpdateInstanceParams {
                                status: Some(InstanceStatus::Deleted),
                                ..Default::default()
                            },
                        )
                        .await?;
                    metrics::RUNNERS_DELETED.inc();
                }
                InstanceStatus::Deleted => {
                    let age = Utc::now() - instance.updated_at;
                    if age > chrono::Duration::seconds(60) {
                        let _ = self.store.delete_instance_by_name(&instance.name).await;
                    }
                }
                InstanceStatus::Creating | InstanceStatus::Running => {
                    // scale set runners get their agent id at JIT time, so
                    // liveness is judged by the agent actually reporting in
                    let registering = matches!(
                        instance.runner_status,
                        RunnerStatus::Pending | RunnerStatus::Installing
                    );
                    if !registering || instance.heartbeat.is_some() || instance.token_fetched {
                        continue;
                    }
                    let deadline =
                        chrono::Duration::minutes(scale_set.runner_bootstrap_timeout as i64);
                    if Utc::now() - instance.updated_at > deadline {
                        let _ = self
                            .store
                            .update_instance(
                                instance.id,
                                UpdateInstanceParams {
                                    status: Some(InstanceStatus::PendingDelete),
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
