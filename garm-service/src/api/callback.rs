use garm_common::model::EventLevel;
use garm_service_base::repo::instance::UpdateInstanceParams;
use garm_service_base::store::{Store, StoreError};
use poem::web::Data;
use poem_openapi::payload::Json;
use poem_openapi::*;
use tracing::{info, Instrument};

use crate::api::ApiTags;
use crate::auth::AuthenticatedInstance;
use crate::model::{ErrorBody, InstanceUpdateMessage, SystemInfo};

#[derive(ApiResponse, Debug)]
pub enum CallbackError {
    /// Invalid request
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    /// Conflicting state, e.g. a repeated once-only call
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

type Result<T> = std::result::Result<T, CallbackError>;

impl From<StoreError> for CallbackError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidTransition(e) => CallbackError::BadRequest(Json(ErrorBody {
                error: e.to_string(),
            })),
            other => CallbackError::InternalError(Json(ErrorBody {
                error: other.to_string(),
            })),
        }
    }
}

/// Status reporting surface for booting runners. Identity comes exclusively
/// from the auth middleware; the handlers never look at token claims.
pub struct CallbackApi {
    pub store: Store,
}

#[OpenApi(prefix_path = "/callbacks", tag = ApiTags::Agent)]
impl CallbackApi {
    /// Append a status event to the instance's event ring. Safe to retry;
    /// consecutive identical messages are collapsed.
    #[oai(path = "/status", method = "post", operation_id = "update_status")]
    async fn update_status(
        &self,
        instance: Data<&AuthenticatedInstance>,
        body: Json<InstanceUpdateMessage>,
    ) -> Result<Json<serde_json::Value>> {
        let instance = &instance.0 .0;
        let span = tracing::info_span!("callback_status", instance = %instance.name);
        async move {
            let repeated = instance
                .status_events
                .last()
                .map(|event| event.message == body.message)
                .unwrap_or(false);
            if !repeated {
                self.store
                    .add_instance_event(instance.id, EventLevel::Info, &body.message)
                    .await?;
            }

            if body.status.is_some() || body.agent_id.is_some() {
                self.store
                    .update_instance(
                        instance.id,
                        UpdateInstanceParams {
                            runner_status: body.status,
                            agent_id: body.agent_id,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Ok(Json(serde_json::json!({})))
        }
        .instrument(span)
        .await
    }

    /// Record the agent's capabilities. Accepted once per create attempt.
    #[oai(path = "/system-info", method = "post", operation_id = "system_info")]
    async fn system_info(
        &self,
        instance: Data<&AuthenticatedInstance>,
        body: Json<SystemInfo>,
    ) -> Result<Json<serde_json::Value>> {
        let instance = &instance.0 .0;
        let marker = format!("system info (attempt {}):", instance.create_attempt);
        let already_recorded = instance
            .status_events
            .iter()
            .any(|event| event.message.starts_with(&marker));
        if already_recorded {
            return Err(CallbackError::Conflict(Json(ErrorBody {
                error: "system info was already recorded for this attempt".to_string(),
            })));
        }

        info!(
            instance = instance.name,
            os_name = body.os_name,
            os_version = body.os_version,
            "runner reported system info"
        );
        self.store
            .add_instance_event(
                instance.id,
                EventLevel::Info,
                &format!(
                    "{marker} os={} version={}",
                    body.os_name, body.os_version
                ),
            )
            .await?;

        if body.agent_id.is_some() {
            self.store
                .update_instance(
                    instance.id,
                    UpdateInstanceParams {
                        agent_id: body.agent_id,
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(Json(serde_json::json!({})))
    }

    /// Liveness ping from the runner agent.
    #[oai(path = "/heartbeat", method = "post", operation_id = "heartbeat")]
    async fn heartbeat(
        &self,
        instance: Data<&AuthenticatedInstance>,
    ) -> Result<Json<serde_json::Value>> {
        self.store
            .update_instance(
                instance.0 .0.id,
                UpdateInstanceParams {
                    heartbeat: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Json(serde_json::json!({})))
    }
}
