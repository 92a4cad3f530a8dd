use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use garm_common::model::{
    ControllerInfo, Entity, EntityId, ForgeCredentials, ScaleSet, ScaleSetId,
};
use garm_service_base::store::Store;
use garm_service_base::watcher::{ChangeOperation, ChangePayload, ChangeRecord};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::TokenService;
use crate::config::GarmServiceConfig;
use crate::forge::ForgeClientCache;
use crate::metrics;
use crate::model::WorkflowJobEvent;
use crate::provider::ProviderRegistry;
use crate::runner::{PoolManager, PoolManagerEvent, PoolManagerHandle};
use crate::scaleset::{ScaleSetClientFactory, ScaleSetWorker, ScaleSetWorkerHandle};

/// Grace period for workers to finish in-flight work on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("no entity matches this delivery")]
    UnknownEntity,
    #[error("event queue is full")]
    Busy,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Owns the lifecycle of every pool manager and scale set worker, and routes
/// authenticated webhook deliveries to them. Entities stay inert records;
/// only this map knows which one has a live manager.
pub struct Controller {
    store: Store,
    config: GarmServiceConfig,
    clients: Arc<ForgeClientCache>,
    scale_set_clients: Arc<dyn ScaleSetClientFactory>,
    providers: Arc<ProviderRegistry>,
    token_service: Arc<TokenService>,
    controller_info: ControllerInfo,
    pool_managers: RwLock<HashMap<EntityId, PoolManagerHandle>>,
    scale_set_workers: RwLock<HashMap<ScaleSetId, ScaleSetWorkerHandle>>,
    cancel: CancellationToken,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        config: GarmServiceConfig,
        clients: Arc<ForgeClientCache>,
        scale_set_clients: Arc<dyn ScaleSetClientFactory>,
        providers: Arc<ProviderRegistry>,
        token_service: Arc<TokenService>,
        controller_info: ControllerInfo,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            clients,
            scale_set_clients,
            providers,
            token_service,
            controller_info,
            pool_managers: RwLock::new(HashMap::new()),
            scale_set_workers: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    pub fn controller_info(&self) -> &ControllerInfo {
        &self.controller_info
    }

    /// Spawns workers for everything currently declared in the store.
    pub async fn start(&self) -> Result<(), String> {
        let entities = self.store.list_entities().await.map_err(|e| e.to_string())?;
        for entity in &entities {
            self.start_pool_manager(entity).await;
        }

        let scale_sets = self
            .store
            .list_scale_sets()
            .await
            .map_err(|e| e.to_string())?;
        for scale_set in &scale_sets {
            if scale_set.enabled {
                self.start_scale_set_worker(scale_set).await;
            }
        }

        info!(
            entities = entities.len(),
            scale_sets = scale_sets.len(),
            "controller started"
        );
        Ok(())
    }

    /// Follows the store's change stream until shutdown, keeping the worker
    /// maps in sync with declared state.
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.store.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                change = changes.recv() => {
                    match change {
                        Ok(change) => self.apply_change(change).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change stream lagged, resynchronizing");
                            if let Err(e) = self.resync().await {
                                error!("resynchronization failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn apply_change(&self, change: ChangeRecord) {
        match (&change.operation, &change.payload) {
            (ChangeOperation::Create, ChangePayload::Entity(entity)) => {
                self.start_pool_manager(entity).await;
            }
            (ChangeOperation::Delete, ChangePayload::Entity(entity)) => {
                self.stop_pool_manager(entity.id).await;
            }
            (ChangeOperation::Update, ChangePayload::Entity(entity)) => {
                // managers re-read their entity from the store every round;
                // only the client cache needs a nudge
                self.clients.invalidate_entity(entity.id).await;
            }
            (_, ChangePayload::Credentials(credentials)) => {
                self.on_credentials_changed(credentials).await;
            }
            (ChangeOperation::Create, ChangePayload::ScaleSet(scale_set)) => {
                if scale_set.enabled {
                    self.start_scale_set_worker(scale_set).await;
                }
            }
            (ChangeOperation::Update, ChangePayload::ScaleSet(scale_set)) => {
                // restart atomically so at most one worker holds the session
                self.stop_scale_set_worker(scale_set.id).await;
                if scale_set.enabled {
                    self.start_scale_set_worker(scale_set).await;
                }
            }
            (ChangeOperation::Delete, ChangePayload::ScaleSet(scale_set)) => {
                self.stop_scale_set_worker(scale_set.id).await;
            }
            (_, ChangePayload::Pool(pool)) => {
                // nudge the owning manager so the change takes effect before
                // the next tick
                let managers = self.pool_managers.read().await;
                if let Some(handle) = managers.get(&pool.entity_id) {
                    let _ = handle.try_send(PoolManagerEvent::Reconcile);
                }
            }
            _ => {}
        }
    }

    async fn resync(&self) -> Result<(), String> {
        let entities = self.store.list_entities().await.map_err(|e| e.to_string())?;
        let known: Vec<EntityId> = entities.iter().map(|e| e.id).collect();

        {
            let mut managers = self.pool_managers.write().await;
            let stale: Vec<EntityId> = managers
                .keys()
                .filter(|id| !known.contains(id))
                .copied()
                .collect();
            for id in stale {
                if let Some(handle) = managers.remove(&id) {
                    handle.stop().await;
                }
            }
        }
        for entity in &entities {
            self.start_pool_manager(entity).await;
        }
        Ok(())
    }

    async fn on_credentials_changed(&self, credentials: &ForgeCredentials) {
        info!(credentials = credentials.name, "credentials changed, rotating clients");
        self.clients.invalidate_credentials(credentials.id).await;

        // scale set sessions authenticate with the rotated credentials and
        // must be re-established
        let scale_sets = match self.store.list_scale_sets().await {
            Ok(scale_sets) => scale_sets,
            Err(e) => {
                error!("failed to list scale sets after rotation: {e}");
                return;
            }
        };
        for scale_set in scale_sets {
            let entity = match self.store.get_entity(scale_set.entity_id).await {
                Ok(entity) => entity,
                Err(_) => continue,
            };
            if entity.credentials_id != credentials.id {
                continue;
            }
            self.stop_scale_set_worker(scale_set.id).await;
            if scale_set.enabled {
                self.start_scale_set_worker(&scale_set).await;
            }
        }
    }

    async fn start_pool_manager(&self, entity: &Entity) {
        let mut managers = self.pool_managers.write().await;
        if managers.contains_key(&entity.id) {
            return;
        }
        let handle = PoolManager::start(
            entity,
            self.store.clone(),
            self.clients.clone(),
            self.providers.clone(),
            self.token_service.clone(),
            self.controller_info.clone(),
            self.config.runner.clone(),
            &self.cancel,
        );
        managers.insert(entity.id, handle);
    }

    async fn stop_pool_manager(&self, entity_id: EntityId) {
        let handle = self.pool_managers.write().await.remove(&entity_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    async fn start_scale_set_worker(&self, scale_set: &ScaleSet) {
        let mut workers = self.scale_set_workers.write().await;
        if workers.contains_key(&scale_set.id) {
            return;
        }
        let handle = ScaleSetWorker::start(
            scale_set,
            self.store.clone(),
            self.clients.clone(),
            self.scale_set_clients.clone(),
            self.providers.clone(),
            self.token_service.clone(),
            self.controller_info.clone(),
            self.config.runner.clone(),
            &self.cancel,
        );
        workers.insert(scale_set.id, handle);
    }

    async fn stop_scale_set_worker(&self, scale_set_id: ScaleSetId) {
        let handle = self.scale_set_workers.write().await.remove(&scale_set_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    async fn shutdown(&self) {
        info!("controller shutting down");
        let managers: Vec<PoolManagerHandle> =
            self.pool_managers.write().await.drain().map(|(_, h)| h).collect();
        let workers: Vec<ScaleSetWorkerHandle> = self
            .scale_set_workers
            .write()
            .await
            .drain()
            .map(|(_, h)| h)
            .collect();

        let stop_all = async {
            for handle in managers {
                handle.stop().await;
            }
            for handle in workers {
                handle.stop().await;
            }
        };
        if tokio::time::timeout(DEFAULT_SHUTDOWN_GRACE, stop_all)
            .await
            .is_err()
        {
            error!("workers did not stop within the grace period");
        }
    }

    // --- webhook demux ----------------------------------------------------

    /// Authenticates and routes one webhook delivery. The signature is
    /// computed over the exact received bytes.
    pub async fn dispatch_webhook(
        &self,
        event_type: &str,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<(), WebhookError> {
        match event_type {
            "ping" => return Ok(()),
            "workflow_job" => {}
            other => {
                debug!(event = other, "ignoring webhook event");
                return Ok(());
            }
        }

        let event: WorkflowJobEvent = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::Invalid(e.to_string()))?;

        let (kind, name) = event.entity_ref().ok_or_else(|| {
            WebhookError::Invalid("delivery names no repository, organization or enterprise".into())
        })?;

        let entities = self
            .store
            .list_entities()
            .await
            .map_err(|e| WebhookError::Internal(e.to_string()))?;
        let entity = entities
            .into_iter()
            .find(|e| e.kind == kind && e.name.eq_ignore_ascii_case(&name))
            .ok_or(WebhookError::UnknownEntity)?;

        verify_signature(raw_body, signature, &entity.webhook_secret)?;

        let managers = self.pool_managers.read().await;
        let handle = managers
            .get(&entity.id)
            .ok_or(WebhookError::UnknownEntity)?;
        handle
            .try_send(PoolManagerEvent::WorkflowJob(Box::new(event)))
            .map_err(|_| {
                metrics::WEBHOOK_REJECTED.with_label_values(&["busy"]).inc();
                WebhookError::Busy
            })?;

        Ok(())
    }
}

/// HMAC-SHA256 over the raw body; the header carries `sha256=<hex>`.
fn verify_signature(
    raw_body: &[u8],
    signature: Option<&str>,
    secret: &str,
) -> Result<(), WebhookError> {
    let signature = signature.ok_or(WebhookError::BadSignature)?;
    let hex_digest = signature
        .strip_prefix("sha256=")
        .ok_or(WebhookError::BadSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| WebhookError::BadSignature)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Internal(e.to_string()))?;
    mac.update(raw_body);
    mac.verify_slice(&expected).map_err(|_| {
        metrics::WEBHOOK_REJECTED
            .with_label_values(&["bad_signature"])
            .inc();
        WebhookError::BadSignature
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"action":"queued"}"#;
        let signature = sign(body, "secret");
        assert!(verify_signature(body, Some(&signature), "secret").is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"action":"queued"}"#;
        let signature = sign(body, "other");
        assert!(matches!(
            verify_signature(body, Some(&signature), "secret"),
            Err(WebhookError::BadSignature)
        ));
    }

    #[test]
    fn tampered_body_fails() {
        let body = br#"{"action":"queued"}"#;
        let signature = sign(body, "secret");
        let tampered = br#"{"action":"queued" }"#;
        assert!(matches!(
            verify_signature(tampered, Some(&signature), "secret"),
            Err(WebhookError::BadSignature)
        ));
    }

    #[test]
    fn missing_or_malformed_signature_fails() {
        let body = br#"{}"#;
        assert!(verify_signature(body, None, "secret").is_err());
        assert!(verify_signature(body, Some("sha1=abc"), "secret").is_err());
        assert!(verify_signature(body, Some("sha256=zz"), "secret").is_err());
    }
}
