use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use garm_common::model::{Entity, EntityKind, ForgeCredentials};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::ForgeConfig;
use crate::forge::github::parse_response;
use crate::forge::{ForgeClient, ForgeError};

const API_VERSION: &str = "6.0-preview";

/// A live session against the forge's runner-scale-set service. Sessions are
/// exclusive per scale set; a stale one must be closed before a new one can
/// be opened.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetSession {
    pub session_id: String,
    pub owner_name: String,
    pub message_queue_url: String,
    pub message_queue_access_token: String,
    #[serde(skip)]
    pub actions_service_url: String,
    #[serde(skip)]
    pub actions_token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleSetMessageKind {
    JobAvailable,
    JobAssigned,
    JobStarted,
    JobCompleted,
    JobMessageLost,
    Unknown,
}

impl ScaleSetMessageKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "JobAvailable" | "RunnerScaleSetJobAvailable" => ScaleSetMessageKind::JobAvailable,
            "JobAssigned" | "RunnerScaleSetJobAssigned" => ScaleSetMessageKind::JobAssigned,
            "JobStarted" | "RunnerScaleSetJobStarted" => ScaleSetMessageKind::JobStarted,
            "JobCompleted" | "RunnerScaleSetJobCompleted" => ScaleSetMessageKind::JobCompleted,
            "RunnerScaleSetJobMessageLost" => ScaleSetMessageKind::JobMessageLost,
            _ => ScaleSetMessageKind::Unknown,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetJobMessage {
    pub message_type: String,
    pub runner_request_id: i64,
    #[serde(default)]
    pub runner_id: Option<i64>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub job_display_name: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

impl ScaleSetJobMessage {
    pub fn kind(&self) -> ScaleSetMessageKind {
        ScaleSetMessageKind::parse(&self.message_type)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetStatistics {
    #[serde(default)]
    pub total_available_jobs: i64,
    #[serde(default)]
    pub total_assigned_jobs: i64,
    #[serde(default)]
    pub total_running_jobs: i64,
}

/// One message off the scale-set queue. The job payload arrives as an
/// embedded JSON string and is decoded lazily.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetMessage {
    pub message_id: i64,
    pub message_type: String,
    #[serde(default)]
    pub statistics: Option<ScaleSetStatistics>,
    #[serde(default)]
    pub body: Option<String>,
}

impl ScaleSetMessage {
    pub fn jobs(&self) -> Result<Vec<ScaleSetJobMessage>, ForgeError> {
        match &self.body {
            None => Ok(vec![]),
            Some(body) if body.is_empty() => Ok(vec![]),
            Some(body) => serde_json::from_str(body)
                .map_err(|e| ForgeError::Other(format!("invalid scale set message body: {e}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScaleSetJitConfig {
    pub config: HashMap<String, String>,
    pub runner_id: i64,
}

#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    async fn create_session(
        &self,
        scale_set_id: i64,
        owner_name: &str,
    ) -> Result<ScaleSetSession, ForgeError>;

    async fn delete_session(&self, session: &ScaleSetSession) -> Result<(), ForgeError>;

    /// Long-polls for the next message after `last_message_id`. `None` means
    /// the poll window elapsed without traffic.
    async fn get_message(
        &self,
        session: &ScaleSetSession,
        last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ForgeError>;

    async fn delete_message(
        &self,
        session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError>;

    /// Forge-side atomic acquisition; returns the request ids actually won.
    async fn acquire_jobs(
        &self,
        scale_set_id: i64,
        session: &ScaleSetSession,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError>;

    async fn generate_jit_config(
        &self,
        scale_set_id: i64,
        session: &ScaleSetSession,
        runner_name: &str,
    ) -> Result<ScaleSetJitConfig, ForgeError>;
}

/// HTTP implementation against the GitHub actions service.
pub struct HttpScaleSetClient {
    entity: Entity,
    credentials: ForgeCredentials,
    forge_client: Arc<dyn ForgeClient>,
    http: reqwest::Client,
}

impl HttpScaleSetClient {
    pub fn new(
        entity: Entity,
        credentials: ForgeCredentials,
        forge_client: Arc<dyn ForgeClient>,
        config: &ForgeConfig,
    ) -> Result<Self, ForgeError> {
        let http = reqwest::Client::builder()
            .user_agent("garm-service")
            // long-poll requests must outlive the regular request timeout
            .timeout(config.scale_set_poll_timeout + config.request_timeout)
            .build()
            .map_err(|e| ForgeError::Other(e.to_string()))?;
        Ok(Self {
            entity,
            credentials,
            forge_client,
            http,
        })
    }

    fn entity_url(&self) -> String {
        let base = self.credentials.endpoint.base_url.trim_end_matches('/');
        match self.entity.kind {
            EntityKind::Repository => format!("{base}/{}", self.entity.name),
            EntityKind::Organization => format!("{base}/{}", self.entity.name),
            EntityKind::Enterprise => format!("{base}/enterprises/{}", self.entity.name),
        }
    }

    /// Trades a registration token for an actions-service admin connection.
    async fn admin_connection(&self) -> Result<(String, String), ForgeError> {
        #[derive(Deserialize)]
        struct AdminConnection {
            url: String,
            token: String,
        }

        let registration_token = self.forge_client.create_registration_token().await?;

        let url = format!(
            "{}/actions/runner-registration",
            self.credentials.endpoint.api_base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .request(Method::POST, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("RemoteAuth {}", registration_token.token),
            )
            .json(&json!({
                "url": self.entity_url(),
                "runner_event": "register",
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;
        let connection: AdminConnection = parse_response(response).await?;
        Ok((connection.url, connection.token))
    }
}

#[async_trait]
impl ScaleSetClient for HttpScaleSetClient {
    async fn create_session(
        &self,
        scale_set_id: i64,
        owner_name: &str,
    ) -> Result<ScaleSetSession, ForgeError> {
        let (actions_url, actions_token) = self.admin_connection().await?;

        let url = format!(
            "{}/_apis/runtime/runnerscalesets/{scale_set_id}/sessions?api-version={API_VERSION}",
            actions_url.trim_end_matches('/')
        );
        let response = self
            .http
            .request(Method::POST, &url)
            .header(http::header::AUTHORIZATION, format!("Bearer {actions_token}"))
            .json(&json!({
                "sessionId": Uuid::new_v4().to_string(),
                "ownerName": owner_name,
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;

        if response.status() == StatusCode::CONFLICT {
            return Err(ForgeError::Other(
                "a session for this scale set already exists".to_string(),
            ));
        }

        let mut session: ScaleSetSession = parse_response(response).await?;
        session.actions_service_url = actions_url;
        session.actions_token = actions_token;
        Ok(session)
    }

    async fn delete_session(&self, session: &ScaleSetSession) -> Result<(), ForgeError> {
        let url = format!(
            "{}/_apis/runtime/runnerscalesets/sessions/{}?api-version={API_VERSION}",
            session.actions_service_url.trim_end_matches('/'),
            session.session_id
        );
        let response = self
            .http
            .request(Method::DELETE, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", session.actions_token),
            )
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(ForgeError::Other(format!(
                "failed to close scale set session: {status}"
            ))),
        }
    }

    async fn get_message(
        &self,
        session: &ScaleSetSession,
        last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ForgeError> {
        let separator = if session.message_queue_url.contains('?') {
            '&'
        } else {
            '?'
        };
        let url = format!(
            "{}{separator}sessionId={}&lastMessageId={last_message_id}",
            session.message_queue_url, session.session_id
        );
        let response = self
            .http
            .request(Method::GET, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", session.message_queue_access_token),
            )
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(None),
            StatusCode::UNAUTHORIZED => Err(ForgeError::Unauthorized(
                "message queue token expired".to_string(),
            )),
            status if status.is_success() => {
                let message: ScaleSetMessage = response
                    .json()
                    .await
                    .map_err(|e| ForgeError::Other(format!("invalid message: {e}")))?;
                Ok(Some(message))
            }
            status => Err(ForgeError::Transient(format!(
                "message poll failed: {status}"
            ))),
        }
    }

    async fn delete_message(
        &self,
        session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError> {
        let base = session
            .message_queue_url
            .split('?')
            .next()
            .unwrap_or(&session.message_queue_url);
        let url = format!("{}/{message_id}", base.trim_end_matches('/'));
        let response = self
            .http
            .request(Method::DELETE, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", session.message_queue_access_token),
            )
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(ForgeError::Transient(format!(
                "failed to acknowledge message {message_id}: {status}"
            ))),
        }
    }

    async fn acquire_jobs(
        &self,
        scale_set_id: i64,
        session: &ScaleSetSession,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError> {
        #[derive(Deserialize)]
        struct AcquireResponse {
            #[serde(default)]
            value: Vec<i64>,
        }

        let url = format!(
            "{}/_apis/runtime/runnerscalesets/{scale_set_id}/acquirejobs?api-version={API_VERSION}",
            session.actions_service_url.trim_end_matches('/')
        );
        let response = self
            .http
            .request(Method::POST, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", session.actions_token),
            )
            .json(&request_ids)
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;
        let parsed: AcquireResponse = parse_response(response).await?;
        Ok(parsed.value)
    }

    async fn generate_jit_config(
        &self,
        scale_set_id: i64,
        session: &ScaleSetSession,
        runner_name: &str,
    ) -> Result<ScaleSetJitConfig, ForgeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JitResponse {
            agent: JitAgent,
            #[serde(rename = "encodedJITConfig")]
            encoded_jit_config: String,
        }

        #[derive(Deserialize)]
        struct JitAgent {
            id: i64,
        }

        let url = format!(
            "{}/_apis/runtime/runnerscalesets/{scale_set_id}/generatejitconfig?api-version={API_VERSION}",
            session.actions_service_url.trim_end_matches('/')
        );
        let response = self
            .http
            .request(Method::POST, &url)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", session.actions_token),
            )
            .json(&json!({
                "name": runner_name,
                "workFolder": "_work",
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;
        let parsed: JitResponse = parse_response(response).await?;
        Ok(ScaleSetJitConfig {
            config: HashMap::from([(
                "encoded_jit_config".to_string(),
                parsed.encoded_jit_config,
            )]),
            runner_id: parsed.agent.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn message_kind_parses_both_shapes() {
        assert_eq!(
            ScaleSetMessageKind::parse("JobAvailable"),
            ScaleSetMessageKind::JobAvailable
        );
        assert_eq!(
            ScaleSetMessageKind::parse("RunnerScaleSetJobCompleted"),
            ScaleSetMessageKind::JobCompleted
        );
        assert_eq!(
            ScaleSetMessageKind::parse("something-new"),
            ScaleSetMessageKind::Unknown
        );
    }

    #[test]
    fn message_body_decodes_embedded_jobs() {
        let message = ScaleSetMessage {
            message_id: 7,
            message_type: "RunnerScaleSetJobMessages".to_string(),
            statistics: None,
            body: Some(
                serde_json::json!([
                    {
                        "messageType": "JobAvailable",
                        "runnerRequestId": 42
                    },
                    {
                        "messageType": "JobCompleted",
                        "runnerRequestId": 41,
                        "runnerId": 9,
                        "runnerName": "garm-x1",
                        "result": "succeeded"
                    }
                ])
                .to_string(),
            ),
        };

        let jobs = message.jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].kind(), ScaleSetMessageKind::JobAvailable);
        assert_eq!(jobs[0].runner_request_id, 42);
        assert_eq!(jobs[1].kind(), ScaleSetMessageKind::JobCompleted);
        assert_eq!(jobs[1].runner_name.as_deref(), Some("garm-x1"));
    }

    #[test]
    fn empty_message_body_is_no_jobs() {
        let message = ScaleSetMessage {
            message_id: 1,
            message_type: "RunnerScaleSetJobMessages".to_string(),
            statistics: None,
            body: None,
        };
        assert!(message.jobs().unwrap().is_empty());
    }
}
