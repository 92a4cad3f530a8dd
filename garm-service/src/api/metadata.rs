use std::sync::Arc;

use garm_service_base::repo::instance::UpdateInstanceParams;
use garm_service_base::store::{Store, StoreError};
use poem::web::Data;
use poem_openapi::payload::Json;
use poem_openapi::*;
use tracing::{info, Instrument};

use crate::api::ApiTags;
use crate::auth::AuthenticatedInstance;
use crate::forge::ForgeClientCache;
use crate::model::{ErrorBody, RegistrationTokenResponse};

#[derive(ApiResponse, Debug)]
pub enum MetadataError {
    /// The credential may not be used again
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Invalid request
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

type Result<T> = std::result::Result<T, MetadataError>;

impl From<StoreError> for MetadataError {
    fn from(value: StoreError) -> Self {
        MetadataError::InternalError(Json(ErrorBody {
            error: value.to_string(),
        }))
    }
}

/// Metadata served to booting runners in non-JIT flows.
pub struct MetadataApi {
    pub store: Store,
    pub clients: Arc<ForgeClientCache>,
}

#[OpenApi(prefix_path = "/metadata", tag = ApiTags::Agent)]
impl MetadataApi {
    /// Hand the runner a fresh forge registration token. Each create attempt
    /// may fetch its token exactly once.
    #[oai(
        path = "/runner-registration-token",
        method = "post",
        operation_id = "runner_registration_token"
    )]
    async fn runner_registration_token(
        &self,
        instance: Data<&AuthenticatedInstance>,
    ) -> Result<Json<RegistrationTokenResponse>> {
        let instance = &instance.0 .0;
        let span = tracing::info_span!("registration_token", instance = %instance.name);
        async move {
            if instance.token_fetched {
                return Err(MetadataError::Unauthorized(Json(ErrorBody {
                    error: "registration token was already fetched for this attempt".to_string(),
                })));
            }

            let entity_id = if let Some(pool_id) = instance.pool_id {
                self.store.get_pool(pool_id).await?.entity_id
            } else if let Some(scale_set_id) = instance.scale_set_id {
                self.store.get_scale_set(scale_set_id).await?.entity_id
            } else {
                return Err(MetadataError::BadRequest(Json(ErrorBody {
                    error: "instance has no owner".to_string(),
                })));
            };

            let entity = self.store.get_entity(entity_id).await?;
            let credentials = self
                .store
                .get_credentials(&entity.credentials_id.to_string())
                .await?;
            let client = self
                .clients
                .client_for(&entity, &credentials)
                .await
                .map_err(|e| {
                    MetadataError::InternalError(Json(ErrorBody {
                        error: e.to_string(),
                    }))
                })?;

            let token = client.create_registration_token().await.map_err(|e| {
                MetadataError::InternalError(Json(ErrorBody {
                    error: e.to_string(),
                }))
            })?;

            self.store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        token_fetched: Some(true),
                        ..Default::default()
                    },
                )
                .await?;

            info!(instance = instance.name, "registration token handed out");
            Ok(Json(RegistrationTokenResponse { token: token.token }))
        }
        .instrument(span)
        .await
    }
}
