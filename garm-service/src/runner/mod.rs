use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use garm_common::model::{
    BootstrapInstance, ControllerInfo, Entity, EntityId, EventLevel, Instance, InstanceId,
    InstanceStatus, Job, JobId, JobStatus, Pool, PoolBalancerType, RunnerApplicationDownload,
    RunnerStatus,
};
use garm_service_base::repo::instance::UpdateInstanceParams;
use garm_service_base::store::{Store, StoreError};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, TokenService};
use crate::config::RunnerConfig;
use crate::forge::{ForgeClient, ForgeClientCache, ForgeError, HookSpec};
use crate::metrics;
use crate::model::{WorkflowJobAction, WorkflowJobEvent};
use crate::provider::{generate_instance_name, Provider, ProviderError, ProviderRegistry};

/// Label attached to every runner so forge-side orphans can be attributed to
/// this controller.
pub fn controller_label(info: &ControllerInfo) -> String {
    format!("garm-controller-id:{}", info.controller_id)
}

const TOOLS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Forge(#[from] ForgeError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug)]
pub enum PoolManagerEvent {
    WorkflowJob(Box<WorkflowJobEvent>),
    Reconcile,
}

/// Handle owned by the controller; the entity record itself stays inert.
pub struct PoolManagerHandle {
    tx: mpsc::Sender<PoolManagerEvent>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl PoolManagerHandle {
    /// Non-blocking enqueue; a full queue surfaces as an error so the webhook
    /// endpoint can answer 503 and let the forge redeliver.
    pub fn try_send(&self, event: PoolManagerEvent) -> Result<(), PoolManagerEvent> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => event,
            mpsc::error::TrySendError::Closed(event) => event,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

struct ToolsCache {
    tools: Vec<RunnerApplicationDownload>,
    fetched_at: tokio::time::Instant,
}

/// One per entity. Runs the reconciliation loop, serializes webhook events,
/// and owns every instance state transition for its pools.
pub struct PoolManager {
    entity_id: EntityId,
    store: Store,
    clients: Arc<ForgeClientCache>,
    providers: Arc<ProviderRegistry>,
    token_service: Arc<TokenService>,
    controller_info: ControllerInfo,
    config: RunnerConfig,
    provisioning: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    round_robin: AtomicU64,
    tools: RwLock<Option<ToolsCache>>,
    /// Pools already accepted by their provider, keyed by last-seen
    /// update time so edits are re-checked.
    validated_pools: Mutex<HashMap<garm_common::model::PoolId, chrono::DateTime<Utc>>>,
}

impl PoolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        entity: &Entity,
        store: Store,
        clients: Arc<ForgeClientCache>,
        providers: Arc<ProviderRegistry>,
        token_service: Arc<TokenService>,
        controller_info: ControllerInfo,
        config: RunnerConfig,
        parent_cancel: &CancellationToken,
    ) -> PoolManagerHandle {
        let (tx, rx) = mpsc::channel(config.event_queue_size);
        let cancel = parent_cancel.child_token();

        let manager = Arc::new(PoolManager {
            entity_id: entity.id,
            store,
            clients,
            providers,
            token_service,
            controller_info,
            provisioning: Arc::new(Semaphore::new(config.provisioning_workers)),
            config,
            tracker: TaskTracker::new(),
            cancel: cancel.clone(),
            round_robin: AtomicU64::new(0),
            tools: RwLock::new(None),
            validated_pools: Mutex::new(HashMap::new()),
        });

        let join = tokio::spawn(manager.run(rx));

        PoolManagerHandle { tx, cancel, join }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PoolManagerEvent>) {
        info!(entity = %self.entity_id, "pool manager starting");

        if let Err(e) = self
            .store
            .set_entity_pool_manager_status(self.entity_id, true, None)
            .await
        {
            warn!(entity = %self.entity_id, "failed to mark pool manager running: {e}");
        }

        if self.config.manage_webhooks {
            if let Err(e) = self.ensure_webhook().await {
                warn!(entity = %self.entity_id, "webhook installation failed: {e}");
            }
        }

        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_reconcile_round().await;
                }
                event = rx.recv() => {
                    match event {
                        Some(PoolManagerEvent::WorkflowJob(event)) => {
                            if let Err(e) = self.handle_workflow_job(*event).await {
                                warn!(entity = %self.entity_id, "workflow job handling failed: {e}");
                            }
                        }
                        Some(PoolManagerEvent::Reconcile) => {
                            self.run_reconcile_round().await;
                        }
                        None => break,
                    }
                }
            }
        }

        // wait for in-flight provisioning before reporting stopped
        self.tracker.close();
        self.tracker.wait().await;

        if let Err(e) = self
            .store
            .set_entity_pool_manager_status(self.entity_id, false, None)
            .await
        {
            warn!(entity = %self.entity_id, "failed to mark pool manager stopped: {e}");
        }
        info!(entity = %self.entity_id, "pool manager stopped");
    }

    async fn run_reconcile_round(self: &Arc<Self>) {
        let timer = metrics::RECONCILE_DURATION.start_timer();
        match self.reconcile().await {
            Ok(()) => {
                metrics::RECONCILE_RUNS.with_label_values(&["ok"]).inc();
                let _ = self
                    .store
                    .set_entity_pool_manager_status(self.entity_id, true, None)
                    .await;
            }
            Err(e) => {
                metrics::RECONCILE_RUNS.with_label_values(&["error"]).inc();
                error!(entity = %self.entity_id, "reconciliation failed: {e}");
                let _ = self
                    .store
                    .set_entity_pool_manager_status(self.entity_id, true, Some(&e.to_string()))
                    .await;
            }
        }
        timer.observe_duration();
    }

    /// One full pass over declared vs observed state.
    async fn reconcile(self: &Arc<Self>) -> Result<(), ManagerError> {
        let entity = self.store.get_entity(self.entity_id).await?;
        let pools = self.store.list_entity_pools(self.entity_id).await?;

        for pool in &pools {
            if let Err(e) = self.reconcile_pool(&entity, pool).await {
                warn!(entity = %self.entity_id, pool = %pool.id, "pool reconciliation failed: {e}");
            }
        }

        if let Err(e) = self.cross_reference_runners(&entity, &pools).await {
            warn!(entity = %self.entity_id, "runner cross-reference failed: {e}");
        }

        if let Err(e) = self.process_queued_jobs(&entity, &pools).await {
            warn!(entity = %self.entity_id, "queued job processing failed: {e}");
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.job_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.store.delete_completed_jobs_before(cutoff).await?;

        Ok(())
    }

    async fn reconcile_pool(
        self: &Arc<Self>,
        entity: &Entity,
        pool: &Pool,
    ) -> Result<(), ManagerError> {
        let instances = self.store.list_pool_instances(pool.id).await?;

        // reap first so capacity numbers are fresh
        for instance in &instances {
            match instance.status {
                InstanceStatus::PendingDelete | InstanceStatus::Deleting => {
                    self.reap_instance(entity, pool, instance).await;
                }
                InstanceStatus::Deleted => {
                    // retained briefly for audit, then purged
                    let age = Utc::now() - instance.updated_at;
                    if age > chrono::Duration::seconds(60) {
                        let _ = self.store.delete_instance_by_name(&instance.name).await;
                    }
                }
                InstanceStatus::Creating | InstanceStatus::Running => {
                    self.reap_if_bootstrap_timed_out(pool, instance).await;
                }
                _ => {}
            }
        }

        if !pool.enabled {
            return Ok(());
        }

        if let Err(e) = self.ensure_pool_validated(pool).await {
            warn!(pool = %pool.id, "provider rejected the pool configuration: {e}");
            return Ok(());
        }

        let instances = self.store.list_pool_instances(pool.id).await?;
        let live: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Deleted)
            .collect();
        let idle: Vec<&Instance> = live
            .iter()
            .copied()
            .filter(|i| i.counts_as_idle())
            .collect();
        let total_count = live.len() as u32;
        let idle_count = idle.len() as u32;

        if idle_count < pool.min_idle_runners && total_count < pool.max_runners {
            let deficit =
                (pool.min_idle_runners - idle_count).min(pool.max_runners - total_count);
            debug!(pool = %pool.id, deficit, "scaling up to the idle target");
            self.schedule_provision(entity, pool, deficit).await?;
        } else if idle_count > pool.min_idle_runners {
            let surplus = (idle_count - pool.min_idle_runners) as usize;
            // only registered, waiting runners are scale-down candidates; a
            // pending instance may already be promised to a queued job
            let mut candidates: Vec<&Instance> = idle
                .into_iter()
                .filter(|i| {
                    i.runner_status == RunnerStatus::Idle
                        && i.status == InstanceStatus::Running
                })
                .collect();
            candidates.sort_by_key(|i| i.created_at);
            for instance in candidates.into_iter().take(surplus) {
                debug!(instance = instance.name, "scaling down surplus idle runner");
                self.mark_for_deletion(instance, "surplus over idle target")
                    .await;
            }
        }

        Ok(())
    }

    async fn ensure_pool_validated(&self, pool: &Pool) -> Result<(), ManagerError> {
        {
            let validated = self.validated_pools.lock().await;
            if validated.get(&pool.id) == Some(&pool.updated_at) {
                return Ok(());
            }
        }
        let provider = self.provider_for(pool)?;
        provider
            .validate_pool_info(
                &pool.image,
                &pool.flavor,
                pool.extra_specs.as_ref(),
                &self.cancel,
            )
            .await?;
        self.validated_pools
            .lock()
            .await
            .insert(pool.id, pool.updated_at);
        Ok(())
    }

    async fn reap_if_bootstrap_timed_out(&self, pool: &Pool, instance: &Instance) {
        // JIT instances carry an agent id from the start, so progress is
        // judged by the agent reporting in, not by registration
        let registering = matches!(
            instance.runner_status,
            RunnerStatus::Pending | RunnerStatus::Installing
        );
        if !registering || instance.token_fetched || instance.heartbeat.is_some() {
            return;
        }
        let deadline = chrono::Duration::minutes(pool.runner_bootstrap_timeout as i64);
        let age = Utc::now() - instance.updated_at;
        if age <= deadline {
            return;
        }
        warn!(
            instance = instance.name,
            attempt = instance.create_attempt,
            "bootstrap deadline exceeded"
        );
        let _ = self
            .store
            .add_instance_event(
                instance.id,
                EventLevel::Warning,
                &format!(
                    "runner did not call back within {} minute(s)",
                    pool.runner_bootstrap_timeout
                ),
            )
            .await;
        self.mark_for_deletion(instance, "bootstrap timeout").await;
    }

    async fn mark_for_deletion(&self, instance: &Instance, reason: &str) {
        let result = self
            .store
            .update_instance(
                instance.id,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::PendingDelete),
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(_) => {
                let _ = self
                    .store
                    .add_instance_event(
                        instance.id,
                        EventLevel::Info,
                        &format!("scheduled for deletion: {reason}"),
                    )
                    .await;
            }
            Err(e) => {
                warn!(instance = instance.name, "failed to mark for deletion: {e}");
            }
        }
    }

    /// Deletes the provider resource and the forge registration, then either
    /// resets the row for another provisioning attempt or finishes the
    /// deletion.
    async fn reap_instance(self: &Arc<Self>, entity: &Entity, pool: &Pool, instance: &Instance) {
        let failed_bootstrap = instance.runner_status != RunnerStatus::Terminated
            && instance.runner_status != RunnerStatus::Active;
        let exhausted =
            failed_bootstrap && instance.create_attempt >= self.config.max_create_attempts;
        let retry = failed_bootstrap && !exhausted && pool.enabled;

        if retry {
            // the row never enters `deleting`, it goes straight back into
            // provisioning under the next attempt
            if let Err(e) = self.cleanup_resources(entity, pool, instance).await {
                warn!(instance = instance.name, "deprovisioning failed: {e}");
                let _ = self
                    .store
                    .add_instance_event(
                        instance.id,
                        EventLevel::Error,
                        &format!("deprovisioning failed: {e}"),
                    )
                    .await;
                return;
            }
            let next_attempt = instance.create_attempt + 1;
            let result = self
                .store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        status: Some(InstanceStatus::PendingCreate),
                        runner_status: Some(RunnerStatus::Pending),
                        create_attempt: Some(next_attempt),
                        token_fetched: Some(false),
                        ..Default::default()
                    },
                )
                .await;
            match result {
                Ok(updated) => {
                    self.spawn_provisioning_worker(entity.clone(), pool.clone(), updated.id);
                }
                Err(e) => {
                    warn!(instance = instance.name, "failed to reset for retry: {e}");
                }
            }
            return;
        }

        if instance.status == InstanceStatus::PendingDelete {
            if let Err(e) = self
                .store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        status: Some(InstanceStatus::Deleting),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(instance = instance.name, "failed to mark deleting: {e}");
                return;
            }
        }

        if let Err(e) = self.cleanup_resources(entity, pool, instance).await {
            // stays in `deleting`; the next round retries
            warn!(instance = instance.name, "deprovisioning failed: {e}");
            let _ = self
                .store
                .add_instance_event(
                    instance.id,
                    EventLevel::Error,
                    &format!("deprovisioning failed: {e}"),
                )
                .await;
            return;
        }

        if exhausted {
            warn!(
                instance = instance.name,
                "create attempt budget exhausted, operator intervention required"
            );
            let _ = self
                .store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        status: Some(InstanceStatus::Failed),
                        ..Default::default()
                    },
                )
                .await;
            return;
        }

        let _ = self
            .store
            .update_instance(
                instance.id,
                UpdateInstanceParams {
                    status: Some(InstanceStatus::Deleted),
                    ..Default::default()
                },
            )
            .await;
        metrics::RUNNERS_DELETED.inc();
    }

    async fn cleanup_resources(
        &self,
        entity: &Entity,
        pool: &Pool,
        instance: &Instance,
    ) -> Result<(), ManagerError> {
        if instance.provider_id.is_some() {
            let provider = self.provider_for(pool)?;
            match provider.delete_instance(&instance.name, &self.cancel).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            metrics::PROVIDER_OPERATIONS
                .with_label_values(&["DeleteInstance", "ok"])
                .inc();
        }

        if let Some(agent_id) = instance.agent_id {
            let client = self.forge_client(entity).await?;
            client.remove_runner(agent_id).await?;
        }

        Ok(())
    }

    // --- provisioning -----------------------------------------------------

    /// Inserts the instance rows synchronously so capacity accounting stays
    /// exact, then hands the slow provider work to the bounded worker set.
    async fn schedule_provision(
        self: &Arc<Self>,
        entity: &Entity,
        pool: &Pool,
        count: u32,
    ) -> Result<Vec<InstanceId>, ManagerError> {
        let mut scheduled = Vec::new();
        for _ in 0..count {
            let instance = self.insert_instance_row(pool).await?;
            self.spawn_provisioning_worker(entity.clone(), pool.clone(), instance.id);
            scheduled.push(instance.id);
        }
        Ok(scheduled)
    }

    async fn insert_instance_row(&self, pool: &Pool) -> Result<Instance, ManagerError> {
        // name collisions are rare; re-roll a few times before giving up
        for _ in 0..5 {
            let now = Utc::now();
            let instance = Instance {
                id: InstanceId::new_v4(),
                name: generate_instance_name(&pool.runner_prefix),
                provider_id: None,
                pool_id: Some(pool.id),
                scale_set_id: None,
                os_type: pool.os_type,
                os_arch: pool.os_arch,
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

    fn spawn_provisioning_worker(
        self: &Arc<Self>,
        entity: Entity,
        pool: Pool,
        instance_id: InstanceId,
    ) {
        let manager = self.clone();
        self.tracker.spawn(async move {
            let permit = tokio::select! {
                permit = manager.provisioning.clone().acquire_owned() => permit,
                _ = manager.cancel.cancelled() => return,
            };
            let _permit = match permit {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if manager.cancel.is_cancelled() {
                return;
            }

            match manager.provision_instance(&entity, &pool, instance_id).await {
                Ok(()) => {
                    metrics::PROVIDER_OPERATIONS
                        .with_label_values(&["CreateInstance", "ok"])
                        .inc();
                    metrics::RUNNERS_CREATED.inc();
                }
                Err(e) => {
                    error!(instance = %instance_id, "provisioning failed: {e}");
                    metrics::PROVIDER_OPERATIONS
                        .with_label_values(&["CreateInstance", "error"])
                        .inc();
                    let _ = manager
                        .store
                        .add_instance_event(
                            instance_id,
                            EventLevel::Error,
                            &format!("provisioning failed: {e}"),
                        )
                        .await;
                    let _ = manager
                        .store
                        .update_instance(
                            instance_id,
                            UpdateInstanceParams {
                                status: Some(InstanceStatus::PendingDelete),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        });
    }

    /// The full provisioning flow for one instance row: credentials, tools,
    /// bootstrap payload, provider call, state transitions.
    async fn provision_instance(
        &self,
        entity: &Entity,
        pool: &Pool,
        instance_id: InstanceId,
    ) -> Result<(), ManagerError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status != InstanceStatus::PendingCreate {
            // a webhook or reconcile round got here first
            return Ok(());
        }

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

        let credentials = self
            .store
            .get_credentials(&entity.credentials_id.to_string())
            .await?;
        let client = self.clients.client_for(entity, &credentials).await?;
        let provider = self.provider_for(pool)?;

        let mut labels: Vec<String> = pool.effective_labels().into_iter().collect();
        labels.sort();
        labels.push(controller_label(&self.controller_info));

        // JIT when both sides support it; otherwise the runner registers
        // itself at boot with a token fetched from the metadata endpoint
        let use_jit =
            !pool.disable_jit_config && provider.interface_version().await.supports_jit();
        if use_jit {
            let jit = client.get_jit_config(&instance.name, pool, &labels).await?;
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
        }

        let tools = self.tools(entity).await?;
        let instance_token = self.token_service.issue_instance_token(
            &instance,
            entity,
            credentials.endpoint.forge_type,
        )?;

        let endpoint_base = credentials.endpoint.base_url.trim_end_matches('/');
        let repo_url = format!("{endpoint_base}/{}", entity.name);

        let bootstrap = BootstrapInstance {
            name: instance.name.clone(),
            tools,
            repo_url,
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
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            flavor: pool.flavor.clone(),
            image: pool.image.clone(),
            labels,
            pool_id: pool.id.to_string(),
            extra_specs: pool.extra_specs.clone(),
            jit_config_enabled: use_jit,
            jit_configuration: instance.jit_configuration.clone(),
        };

        let result = provider
            .create_instance(&pool.id.to_string(), &bootstrap, &self.cancel)
            .await;

        match result {
            Ok(provider_instance) => {
                self.store
                    .update_instance(
                        instance_id,
                        UpdateInstanceParams {
                            provider_id: Some(provider_instance.provider_id),
                            status: Some(InstanceStatus::Running),
                            addresses: Some(provider_instance.addresses),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .add_instance_event(
                        instance_id,
                        EventLevel::Info,
                        "instance created by provider",
                    )
                    .await?;
                Ok(())
            }
            Err(ProviderError::AlreadyExists(_)) => {
                // a previous attempt left the resource behind; the reap pass
                // deletes it and retries under a fresh attempt
                self.store
                    .add_instance_event(
                        instance_id,
                        EventLevel::Warning,
                        "provider reports a leftover instance with this name",
                    )
                    .await?;
                Err(ManagerError::Other(format!(
                    "instance {} already exists on the provider",
                    instance.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- webhooks ---------------------------------------------------------

    async fn handle_workflow_job(
        self: &Arc<Self>,
        event: WorkflowJobEvent,
    ) -> Result<(), ManagerError> {
        let entity = self.store.get_entity(self.entity_id).await?;
        metrics::WEBHOOK_EVENTS
            .with_label_values(&[match event.action {
                WorkflowJobAction::Queued => "queued",
                WorkflowJobAction::InProgress => "in_progress",
                WorkflowJobAction::Completed => "completed",
                WorkflowJobAction::Waiting => "waiting",
            }])
            .inc();

        match event.action {
            WorkflowJobAction::Queued => self.handle_job_queued(&entity, &event).await,
            WorkflowJobAction::InProgress => self.handle_job_in_progress(&entity, &event).await,
            WorkflowJobAction::Completed => self.handle_job_completed(&entity, &event).await,
            WorkflowJobAction::Waiting => Ok(()),
        }
    }

    async fn handle_job_queued(
        self: &Arc<Self>,
        entity: &Entity,
        event: &WorkflowJobEvent,
    ) -> Result<(), ManagerError> {
        let job_id = JobId(event.workflow_job.id);

        let mut labels = event.workflow_job.labels.clone();
        if labels.is_empty() {
            // some deliveries omit labels; reconstruct them from the forge
            if let Ok(client) = self.forge_client(entity).await {
                if let Ok(job) = client.get_workflow_job(job_id.0).await {
                    labels = job.labels;
                }
            }
        }

        // replaying the same delivery must not provision twice
        let is_replay = matches!(
            self.store.get_job(job_id).await?,
            Some(existing) if existing.status == JobStatus::Queued
        );

        let now = Utc::now();
        self.store
            .upsert_job(&Job {
                id: job_id,
                entity_id: entity.id,
                status: JobStatus::Queued,
                name: event.workflow_job.name.clone(),
                labels: labels.clone(),
                runner_name: None,
                runner_id: None,
                locked_by: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if is_replay {
            debug!(job = %job_id, "duplicate queued delivery ignored");
            return Ok(());
        }

        if !self.store.lock_job(job_id, entity.id).await? {
            debug!(job = %job_id, "job already locked by another controller");
            return Ok(());
        }

        let pools = self.store.list_entity_pools(entity.id).await?;
        match self.select_pool(entity, &pools, &labels).await? {
            Some(pool) => {
                let instances = self.store.list_pool_instances(pool.id).await?;
                let total = instances
                    .iter()
                    .filter(|i| i.status != InstanceStatus::Deleted)
                    .count() as u32;
                let has_idle = instances.iter().any(|i| i.counts_as_idle());
                if has_idle {
                    debug!(job = %job_id, pool = %pool.id, "idle capacity available");
                } else if total < pool.max_runners {
                    self.schedule_provision(entity, &pool, 1).await?;
                } else {
                    debug!(job = %job_id, pool = %pool.id, "pool at capacity, job stays queued");
                }
            }
            None => {
                debug!(job = %job_id, ?labels, "no pool matches the requested labels");
            }
        }
        Ok(())
    }

    async fn handle_job_in_progress(
        &self,
        entity: &Entity,
        event: &WorkflowJobEvent,
    ) -> Result<(), ManagerError> {
        let job_id = JobId(event.workflow_job.id);
        let now = Utc::now();
        self.store
            .upsert_job(&Job {
                id: job_id,
                entity_id: entity.id,
                status: JobStatus::InProgress,
                name: event.workflow_job.name.clone(),
                labels: event.workflow_job.labels.clone(),
                runner_name: event.workflow_job.runner_name.clone(),
                runner_id: event.workflow_job.runner_id,
                locked_by: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Some(instance) = self.instance_for_event(event).await? {
            self.store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        runner_status: Some(RunnerStatus::Active),
                        agent_id: event.workflow_job.runner_id,
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_job_completed(
        &self,
        entity: &Entity,
        event: &WorkflowJobEvent,
    ) -> Result<(), ManagerError> {
        let job_id = JobId(event.workflow_job.id);
        let now = Utc::now();
        self.store
            .upsert_job(&Job {
                id: job_id,
                entity_id: entity.id,
                status: JobStatus::Completed,
                name: event.workflow_job.name.clone(),
                labels: event.workflow_job.labels.clone(),
                runner_name: event.workflow_job.runner_name.clone(),
                runner_id: event.workflow_job.runner_id,
                locked_by: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Some(instance) = self.instance_for_event(event).await? {
            // ephemeral runners are one-shot
            self.store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        runner_status: Some(RunnerStatus::Terminated),
                        status: Some(InstanceStatus::PendingDelete),
                        agent_id: event.workflow_job.runner_id,
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.store.unlock_job(job_id, entity.id).await?;
        Ok(())
    }

    async fn instance_for_event(
        &self,
        event: &WorkflowJobEvent,
    ) -> Result<Option<Instance>, ManagerError> {
        if let Some(runner_id) = event.workflow_job.runner_id {
            if let Some(instance) = self.store.get_instance_by_agent_id(runner_id).await? {
                return Ok(Some(instance));
            }
        }
        if let Some(runner_name) = &event.workflow_job.runner_name {
            return Ok(self.store.get_instance_by_name(runner_name).await?);
        }
        Ok(None)
    }

    // --- pool selection ---------------------------------------------------

    /// Applies the entity's balancer policy across the pools matching the
    /// label set.
    async fn select_pool(
        &self,
        entity: &Entity,
        pools: &[Pool],
        labels: &[String],
    ) -> Result<Option<Pool>, ManagerError> {
        let mut matching: Vec<&Pool> = pools
            .iter()
            .filter(|pool| pool.enabled && pool.matches_labels(labels))
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }

        match entity.pool_balancer_type {
            PoolBalancerType::Pack => {
                let mut scored = Vec::with_capacity(matching.len());
                for pool in matching {
                    let instances = self.store.list_pool_instances(pool.id).await?;
                    let idle_count = instances.iter().filter(|i| i.counts_as_idle()).count();
                    scored.push((pool, idle_count));
                }
                // highest priority wins; within priority, lowest idle count
                scored.sort_by(|(a, a_idle), (b, b_idle)| {
                    b.priority.cmp(&a.priority).then(a_idle.cmp(b_idle))
                });
                Ok(scored.first().map(|(pool, _)| (*pool).clone()))
            }
            PoolBalancerType::Roundrobin => {
                matching.sort_by_key(|pool| pool.id);
                let index =
                    self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % matching.len();
                Ok(Some(matching[index].clone()))
            }
        }
    }

    // --- cross-reference --------------------------------------------------

    /// Detects orphans in both directions: forge runners this controller
    /// created but no longer tracks, and local instances whose runner never
    /// registered.
    async fn cross_reference_runners(
        &self,
        entity: &Entity,
        pools: &[Pool],
    ) -> Result<(), ManagerError> {
        let client = self.forge_client(entity).await?;
        let forge_runners = client.list_runners().await?;
        let instances = self.store.list_entity_instances(entity.id).await?;

        let by_name: HashMap<&str, &Instance> =
            instances.iter().map(|i| (i.name.as_str(), i)).collect();
        let label = controller_label(&self.controller_info);

        let mut forge_names: HashSet<&str> = HashSet::new();
        for runner in &forge_runners {
            forge_names.insert(runner.name.as_str());
            if !runner.has_label(&label) {
                continue;
            }
            match by_name.get(runner.name.as_str()) {
                None => {
                    info!(runner = runner.name, "removing orphaned forge runner");
                    client.remove_runner(runner.id).await?;
                }
                Some(instance) => {
                    if instance.agent_id.is_none() {
                        let _ = self
                            .store
                            .update_instance(
                                instance.id,
                                UpdateInstanceParams {
                                    agent_id: Some(runner.id),
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                    if runner.is_offline()
                        && instance.runner_status == RunnerStatus::Active
                        && instance.status == InstanceStatus::Running
                    {
                        // the job finished and the ephemeral runner went away
                        self.mark_for_deletion(instance, "ephemeral runner went offline")
                            .await;
                    }
                }
            }
        }

        let pool_by_id: HashMap<_, _> = pools.iter().map(|p| (p.id, p)).collect();
        for instance in &instances {
            let registering = matches!(
                instance.runner_status,
                RunnerStatus::Pending | RunnerStatus::Installing
            );
            if instance.status != InstanceStatus::Running
                || !registering
                || forge_names.contains(instance.name.as_str())
            {
                continue;
            }
            let Some(pool) = instance.pool_id.and_then(|id| pool_by_id.get(&id)) else {
                continue;
            };
            let deadline = chrono::Duration::minutes(pool.runner_bootstrap_timeout as i64);
            if Utc::now() - instance.updated_at > deadline {
                self.mark_for_deletion(instance, "no forge registration past bootstrap timeout")
                    .await;
            }
        }

        Ok(())
    }

    // --- queued job follow-up ---------------------------------------------

    /// Jobs that could not be served when their webhook arrived are retried
    /// here once capacity frees up.
    async fn process_queued_jobs(
        self: &Arc<Self>,
        entity: &Entity,
        pools: &[Pool],
    ) -> Result<(), ManagerError> {
        let jobs = self.store.list_queued_jobs(entity.id).await?;
        for job in jobs {
            match job.locked_by {
                Some(locked_by) if locked_by != entity.id => continue,
                _ => {}
            }
            let Some(pool) = self.select_pool(entity, pools, &job.labels).await? else {
                continue;
            };
            let instances = self.store.list_pool_instances(pool.id).await?;
            let total = instances
                .iter()
                .filter(|i| i.status != InstanceStatus::Deleted)
                .count() as u32;
            let has_idle = instances.iter().any(|i| i.counts_as_idle());
            if !has_idle && total < pool.max_runners {
                if self.store.lock_job(job.id, entity.id).await? {
                    self.schedule_provision(entity, &pool, 1).await?;
                }
            }
        }
        Ok(())
    }

    // --- helpers ----------------------------------------------------------

    async fn forge_client(&self, entity: &Entity) -> Result<Arc<dyn ForgeClient>, ManagerError> {
        let credentials = self
            .store
            .get_credentials(&entity.credentials_id.to_string())
            .await?;
        Ok(self.clients.client_for(entity, &credentials).await?)
    }

    fn provider_for(&self, pool: &Pool) -> Result<Arc<dyn Provider>, ManagerError> {
        self.providers.get(&pool.provider_name).ok_or_else(|| {
            ManagerError::Other(format!("provider {} is not configured", pool.provider_name))
        })
    }

    async fn ensure_webhook(&self) -> Result<(), ManagerError> {
        let entity = self.store.get_entity(self.entity_id).await?;
        let Some(webhook_url) = self.controller_info.webhook_url.clone() else {
            return Ok(());
        };
        let client = self.forge_client(&entity).await?;
        let hooks = client.list_hooks().await?;
        if hooks.iter().any(|hook| hook.url == webhook_url) {
            return Ok(());
        }
        let hook = client
            .create_hook(&HookSpec {
                url: webhook_url,
                secret: entity.webhook_secret.clone(),
                events: vec!["workflow_job".to_string()],
                insecure_ssl: false,
            })
            .await?;
        client.ping_hook(hook.id).await?;
        Ok(())
    }

    async fn tools(&self, entity: &Entity) -> Result<Vec<RunnerApplicationDownload>, ManagerError> {
        {
            let cached = self.tools.read().await;
            if let Some(cache) = cached.as_ref() {
                if cache.fetched_at.elapsed() < TOOLS_CACHE_TTL {
                    return Ok(cache.tools.clone());
                }
            }
        }
        let client = self.forge_client(entity).await?;
        let tools = client.list_runner_application_downloads().await?;
        *self.tools.write().await = Some(ToolsCache {
            tools: tools.clone(),
            fetched_at: tokio::time::Instant::now(),
        });
        Ok(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn controller_label_embeds_the_controller_id() {
        let info = ControllerInfo {
            controller_id: garm_common::model::ControllerId::new_v4(),
            webhook_url: None,
            metadata_url: None,
            callback_url: None,
            version: "0.0.0".to_string(),
        };
        let label = controller_label(&info);
        assert!(label.starts_with("garm-controller-id:"));
        assert!(label.contains(&info.controller_id.to_string()));
    }
}
