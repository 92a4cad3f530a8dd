use std::sync::Arc;

use garm_common::config::DbConfig;
use garm_common::model::{
    ControllerId, ControllerInfo, CredentialsId, ForgeCredentials, ForgeEndpoint,
};
use garm_service_base::db;
use garm_service_base::store::Store;
use tracing::info;
use uuid::Uuid;

use crate::auth::TokenService;
use crate::config::GarmServiceConfig;
use crate::forge::{DefaultForgeClientFactory, ForgeClientCache};
use crate::provider::ProviderRegistry;
use crate::scaleset::{DefaultScaleSetClientFactory, ScaleSetClientFactory};

#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub token_service: Arc<TokenService>,
    pub clients: Arc<ForgeClientCache>,
    pub scale_set_clients: Arc<dyn ScaleSetClientFactory>,
    pub providers: Arc<ProviderRegistry>,
    pub controller_info: ControllerInfo,
}

impl Services {
    pub async fn new(config: &GarmServiceConfig) -> Result<Self, String> {
        config.validate()?;

        let DbConfig::Sqlite(db_config) = &config.db;
        db::sqlite_migrate(db_config)
            .await
            .map_err(|e| format!("DB migration failed: {e}"))?;
        let db_pool = db::create_sqlite_pool(db_config)
            .await
            .map_err(|e| format!("DB pool creation failed: {e}"))?;

        let store = Store::sqlite(Arc::new(db_pool))
            .with_event_ring_size(config.runner.event_ring_size);

        seed_credentials(&store, config).await?;

        // the controller id is generated on first boot and stable afterwards
        store
            .ensure_controller_info(&ControllerInfo {
                controller_id: ControllerId::new_v4(),
                webhook_url: Some(config.webhook_url()),
                metadata_url: Some(config.metadata_url()),
                callback_url: Some(config.callback_url()),
                version: crate::VERSION.to_string(),
            })
            .await
            .map_err(|e| e.to_string())?;
        store
            .update_controller_urls(
                Some(&config.webhook_url()),
                Some(&config.metadata_url()),
                Some(&config.callback_url()),
            )
            .await
            .map_err(|e| e.to_string())?;
        let controller_info = store
            .get_controller_info()
            .await
            .map_err(|e| e.to_string())?;
        info!(controller_id = %controller_info.controller_id, "controller identity loaded");

        let token_service = Arc::new(TokenService::new(&config.jwt, store.clone()));
        let clients = Arc::new(ForgeClientCache::new(Arc::new(
            DefaultForgeClientFactory::new(config.forge.clone()),
        )));
        let scale_set_clients: Arc<dyn ScaleSetClientFactory> =
            Arc::new(DefaultScaleSetClientFactory::new(config.forge.clone()));
        let providers = Arc::new(ProviderRegistry::from_config(
            &config.providers,
            controller_info.controller_id,
        ));

        Ok(Self {
            store,
            token_service,
            clients,
            scale_set_clients,
            providers,
            controller_info,
        })
    }
}

/// Endpoints and credentials declared in the config file are synchronized
/// into the store at startup. Ids are derived from the credential name so
/// repeated boots update in place.
async fn seed_credentials(store: &Store, config: &GarmServiceConfig) -> Result<(), String> {
    for credentials_config in &config.credentials {
        let endpoint = ForgeEndpoint {
            name: credentials_config.endpoint.name.clone(),
            forge_type: credentials_config.endpoint.forge_type,
            base_url: credentials_config.endpoint.base_url.clone(),
            api_base_url: credentials_config.endpoint.api_base_url.clone(),
        };
        store
            .upsert_endpoint(&endpoint)
            .await
            .map_err(|e| e.to_string())?;

        let id = CredentialsId(Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            credentials_config.name.as_bytes(),
        ));
        store
            .upsert_credentials(&ForgeCredentials {
                id,
                name: credentials_config.name.clone(),
                endpoint,
                auth: credentials_config.auth.clone(),
            })
            .await
            .map_err(|e| e.to_string())?;
        info!(credentials = credentials_config.name, "credentials loaded");
    }
    Ok(())
}
