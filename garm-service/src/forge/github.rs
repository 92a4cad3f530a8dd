use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use garm_common::model::{
    AppAuth, Entity, EntityKind, ForgeAuth, ForgeCredentials, Pool, RunnerApplicationDownload,
};
use garm_common::retries::with_retries;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::ForgeConfig;
use crate::forge::{
    ForgeClient, ForgeError, ForgeHook, ForgeRunner, ForgeWorkflowJob, HookSpec, JitConfig,
    RegistrationToken,
};

const PER_PAGE: usize = 100;

/// REST client for GitHub-shaped forges. The entity kind decides the URL
/// scope; everything else is shared.
pub struct GithubClient {
    entity: Entity,
    credentials: ForgeCredentials,
    config: ForgeConfig,
    http: reqwest::Client,
    /// Cached installation token for app-based auth.
    app_token: Arc<RwLock<Option<InstallationToken>>>,
}

#[derive(Clone, Debug)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl GithubClient {
    pub fn new(
        entity: Entity,
        credentials: ForgeCredentials,
        config: ForgeConfig,
    ) -> Result<Self, ForgeError> {
        let http = reqwest::Client::builder()
            .user_agent("garm-service")
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ForgeError::Other(e.to_string()))?;
        Ok(Self {
            entity,
            credentials,
            config,
            http,
            app_token: Arc::new(RwLock::new(None)),
        })
    }

    fn api_base(&self) -> &str {
        self.credentials.endpoint.api_base_url.trim_end_matches('/')
    }

    /// URL prefix addressing the owning entity.
    fn scope_url(&self) -> String {
        let base = self.api_base();
        match self.entity.kind {
            EntityKind::Repository => format!("{base}/repos/{}", self.entity.name),
            EntityKind::Organization => format!("{base}/orgs/{}", self.entity.name),
            EntityKind::Enterprise => format!("{base}/enterprises/{}", self.entity.name),
        }
    }

    async fn auth_header(&self) -> Result<String, ForgeError> {
        match &self.credentials.auth {
            ForgeAuth::Pat(pat) => Ok(format!("Bearer {}", pat.token)),
            ForgeAuth::App(app) => {
                {
                    let cached = self.app_token.read().await;
                    if let Some(token) = cached.as_ref() {
                        if token.expires_at > Utc::now() + ChronoDuration::minutes(2) {
                            return Ok(format!("Bearer {}", token.token));
                        }
                    }
                }
                let token = self.exchange_app_token(app).await?;
                let header = format!("Bearer {}", token.token);
                *self.app_token.write().await = Some(token);
                Ok(header)
            }
        }
    }

    /// Exchanges the app key for a short-lived installation token.
    async fn exchange_app_token(&self, app: &AppAuth) -> Result<InstallationToken, ForgeError> {
        #[derive(serde::Serialize)]
        struct AppClaims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 9 * 60,
            iss: app.app_id.to_string(),
        };
        let key = EncodingKey::from_rsa_pem(app.private_key.as_bytes())
            .map_err(|e| ForgeError::Unauthorized(format!("invalid app private key: {e}")))?;
        let app_jwt = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ForgeError::Unauthorized(format!("failed to sign app JWT: {e}")))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base(),
            app.installation_id
        );
        let response = self
            .http
            .post(&url)
            .header(http::header::AUTHORIZATION, format!("Bearer {app_jwt}"))
            .header(http::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.to_string()))?;
        let token: TokenResponse = parse_response(response).await?;
        Ok(InstallationToken {
            token: token.token,
            expires_at: token.expires_at,
        })
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, ForgeError> {
        let auth = self.auth_header().await?;
        Ok(self
            .http
            .request(method, url)
            .header(http::header::AUTHORIZATION, auth)
            .header(http::header::ACCEPT, "application/vnd.github+json"))
    }

    async fn with_forge_retries<R, F>(&self, op_label: &'static str, f: F) -> Result<R, ForgeError>
    where
        R: Send,
        F: for<'a> Fn(
                &'a GithubClient,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<R, ForgeError>> + 'a + Send>,
            > + Send
            + Sync,
    {
        with_retries(
            "forge",
            op_label,
            Some(self.entity.name.clone()),
            &self.config.retries,
            self,
            |client| f(client),
            ForgeError::is_retriable,
        )
        .await
    }
}

#[async_trait]
impl ForgeClient for GithubClient {
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        self.with_forge_retries("list-runners", |client| {
            Box::pin(async move {
                #[derive(Deserialize)]
                struct RunnersPage {
                    runners: Vec<ForgeRunner>,
                }

                let mut all = Vec::new();
                let mut page = 1usize;
                loop {
                    let url = format!(
                        "{}/actions/runners?per_page={PER_PAGE}&page={page}",
                        client.scope_url()
                    );
                    let response = client
                        .request(Method::GET, &url)
                        .await?
                        .send()
                        .await
                        .map_err(|e| ForgeError::Transient(e.to_string()))?;
                    let parsed: RunnersPage = parse_response(response).await?;
                    let count = parsed.runners.len();
                    all.extend(parsed.runners);
                    if count < PER_PAGE {
                        break;
                    }
                    page += 1;
                }
                Ok(all)
            })
        })
        .await
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<(), ForgeError> {
        let result = self
            .with_forge_retries("remove-runner", move |client| {
                Box::pin(async move {
                    let url = format!("{}/actions/runners/{runner_id}", client.scope_url());
                    let response = client
                        .request(Method::DELETE, &url)
                        .await?
                        .send()
                        .await
                        .map_err(|e| ForgeError::Transient(e.to_string()))?;
                    check_status(response).await
                })
            })
            .await;

        match result {
            Err(ForgeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        self.with_forge_retries("create-registration-token", |client| {
            Box::pin(async move {
                let url = format!(
                    "{}/actions/runners/registration-token",
                    client.scope_url()
                );
                let response = client
                    .request(Method::POST, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                parse_response(response).await
            })
        })
        .await
    }

    async fn get_jit_config(
        &self,
        runner_name: &str,
        pool: &Pool,
        labels: &[String],
    ) -> Result<JitConfig, ForgeError> {
        let runner_name = runner_name.to_string();
        let labels = labels.to_vec();
        let runner_group = pool.github_runner_group.clone();

        self.with_forge_retries("generate-jitconfig", move |client| {
            let runner_name = runner_name.clone();
            let labels = labels.clone();
            let runner_group = runner_group.clone();
            Box::pin(async move {
                #[derive(Deserialize)]
                struct JitResponse {
                    runner: JitRunner,
                    encoded_jit_config: String,
                }

                #[derive(Deserialize)]
                struct JitRunner {
                    id: i64,
                }

                let url = format!(
                    "{}/actions/runners/generate-jitconfig",
                    client.scope_url()
                );
                let mut body = json!({
                    "name": runner_name,
                    "labels": labels,
                    "work_folder": "_work",
                });
                if let Some(group) = runner_group {
                    body["runner_group_id"] = json!(group);
                } else {
                    // the default runner group
                    body["runner_group_id"] = json!(1);
                }

                let response = client
                    .request(Method::POST, &url)
                    .await?
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                let parsed: JitResponse = parse_response(response).await?;
                Ok(JitConfig {
                    config: HashMap::from([(
                        "encoded_jit_config".to_string(),
                        parsed.encoded_jit_config,
                    )]),
                    runner_id: parsed.runner.id,
                })
            })
        })
        .await
    }

    async fn list_runner_application_downloads(
        &self,
    ) -> Result<Vec<RunnerApplicationDownload>, ForgeError> {
        self.with_forge_retries("list-runner-downloads", |client| {
            Box::pin(async move {
                let url = format!("{}/actions/runners/downloads", client.scope_url());
                let response = client
                    .request(Method::GET, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                parse_response(response).await
            })
        })
        .await
    }

    async fn list_hooks(&self) -> Result<Vec<ForgeHook>, ForgeError> {
        self.with_forge_retries("list-hooks", |client| {
            Box::pin(async move {
                let url = format!("{}/hooks", client.hooks_scope()?);
                let response = client
                    .request(Method::GET, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                let hooks: Vec<RawHook> = parse_response(response).await?;
                Ok(hooks.into_iter().map(Into::into).collect())
            })
        })
        .await
    }

    async fn get_hook(&self, hook_id: i64) -> Result<ForgeHook, ForgeError> {
        self.with_forge_retries("get-hook", move |client| {
            Box::pin(async move {
                let url = format!("{}/hooks/{hook_id}", client.hooks_scope()?);
                let response = client
                    .request(Method::GET, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                let hook: RawHook = parse_response(response).await?;
                Ok(hook.into())
            })
        })
        .await
    }

    async fn create_hook(&self, spec: &HookSpec) -> Result<ForgeHook, ForgeError> {
        let spec = spec.clone();
        self.with_forge_retries("create-hook", move |client| {
            let spec = spec.clone();
            Box::pin(async move {
                let url = format!("{}/hooks", client.hooks_scope()?);
                let body = json!({
                    "name": "web",
                    "active": true,
                    "events": spec.events,
                    "config": {
                        "url": spec.url,
                        "content_type": "json",
                        "secret": spec.secret,
                        "insecure_ssl": if spec.insecure_ssl { "1" } else { "0" },
                    },
                });
                let response = client
                    .request(Method::POST, &url)
                    .await?
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                let hook: RawHook = parse_response(response).await?;
                Ok(hook.into())
            })
        })
        .await
    }

    async fn delete_hook(&self, hook_id: i64) -> Result<(), ForgeError> {
        let result = self
            .with_forge_retries("delete-hook", move |client| {
                Box::pin(async move {
                    let url = format!("{}/hooks/{hook_id}", client.hooks_scope()?);
                    let response = client
                        .request(Method::DELETE, &url)
                        .await?
                        .send()
                        .await
                        .map_err(|e| ForgeError::Transient(e.to_string()))?;
                    check_status(response).await
                })
            })
            .await;

        match result {
            Err(ForgeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn ping_hook(&self, hook_id: i64) -> Result<(), ForgeError> {
        self.with_forge_retries("ping-hook", move |client| {
            Box::pin(async move {
                let url = format!("{}/hooks/{hook_id}/pings", client.hooks_scope()?);
                let response = client
                    .request(Method::POST, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                check_status(response).await
            })
        })
        .await
    }

    async fn get_workflow_job(&self, job_id: i64) -> Result<ForgeWorkflowJob, ForgeError> {
        if self.entity.kind != EntityKind::Repository {
            return Err(ForgeError::BadRequest(
                "workflow jobs can only be fetched for repositories".to_string(),
            ));
        }
        self.with_forge_retries("get-workflow-job", move |client| {
            Box::pin(async move {
                let url = format!(
                    "{}/repos/{}/actions/jobs/{job_id}",
                    client.api_base(),
                    client.entity.name
                );
                let response = client
                    .request(Method::GET, &url)
                    .await?
                    .send()
                    .await
                    .map_err(|e| ForgeError::Transient(e.to_string()))?;
                parse_response(response).await
            })
        })
        .await
    }
}

impl GithubClient {
    fn hooks_scope(&self) -> Result<String, ForgeError> {
        let base = self.api_base();
        match self.entity.kind {
            EntityKind::Repository => Ok(format!("{base}/repos/{}", self.entity.name)),
            EntityKind::Organization => Ok(format!("{base}/orgs/{}", self.entity.name)),
            EntityKind::Enterprise => Err(ForgeError::BadRequest(
                "enterprises do not support webhooks".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct RawHook {
    id: i64,
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    config: RawHookConfig,
}

#[derive(Deserialize)]
struct RawHookConfig {
    #[serde(default)]
    url: String,
}

impl From<RawHook> for ForgeHook {
    fn from(value: RawHook) -> Self {
        ForgeHook {
            id: value.id,
            url: value.config.url,
            events: value.events,
            active: value.active,
        }
    }
}

pub(crate) async fn check_status(response: Response) -> Result<(), ForgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(error_for_status(status, response).await)
}

pub(crate) async fn parse_response<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, ForgeError> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_for_status(status, response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ForgeError::Other(format!("invalid forge response: {e}")))
}

async fn error_for_status(status: StatusCode, response: Response) -> ForgeError {
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => ForgeError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ForgeError::Unauthorized(body),
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => ForgeError::BadRequest(body),
        StatusCode::TOO_MANY_REQUESTS => ForgeError::RateLimited,
        status if status.is_server_error() => {
            ForgeError::Transient(format!("forge returned {status}: {body}"))
        }
        status => ForgeError::Other(format!("forge returned {status}: {body}")),
    }
}
