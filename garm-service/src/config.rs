use garm_common::config::{
    ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, RetryConfig, TracingConfig,
};
use garm_common::model::{ForgeAuth, ForgeType, PatAuth, DEFAULT_POOL_QUEUE_SIZE};
use garm_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GarmServiceConfig {
    pub tracing: TracingConfig,
    pub db: DbConfig,
    pub http_port: u16,
    /// Externally reachable base URL; callback, metadata and webhook URLs
    /// handed to runners and forges are derived from it.
    pub base_url: String,
    pub jwt: JwtConfig,
    pub runner: RunnerConfig,
    pub forge: ForgeConfig,
    pub providers: Vec<ProviderConfig>,
    pub credentials: Vec<CredentialsConfig>,
}

impl Default for GarmServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("garm-service"),
            db: DbConfig::default(),
            http_port: 9997,
            base_url: "http://localhost:9997".to_string(),
            jwt: JwtConfig::default(),
            runner: RunnerConfig::default(),
            forge: ForgeConfig::default(),
            providers: vec![],
            credentials: vec![],
        }
    }
}

impl GarmServiceConfig {
    pub fn callback_url(&self) -> String {
        format!("{}/api/v1/callbacks", self.base_url.trim_end_matches('/'))
    }

    pub fn metadata_url(&self) -> String {
        format!("{}/api/v1/metadata", self.base_url.trim_end_matches('/'))
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/webhooks", self.base_url.trim_end_matches('/'))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jwt.secret.is_empty() {
            return Err("jwt.secret must not be empty".to_string());
        }
        if self.jwt.user_token_ttl < Duration::from_secs(24 * 60 * 60) {
            return Err("jwt.user_token_ttl must be at least 24h".to_string());
        }
        for provider in &self.providers {
            provider.validate()?;
        }
        Ok(())
    }
}

impl SafeDisplay for GarmServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "base URL: {}", self.base_url);
        let _ = writeln!(&mut result, "JWT:");
        let _ = writeln!(&mut result, "{}", self.jwt.to_safe_string_indented());
        let _ = writeln!(&mut result, "runner:");
        let _ = writeln!(&mut result, "{}", self.runner.to_safe_string_indented());
        let _ = writeln!(&mut result, "forge:");
        let _ = writeln!(&mut result, "{}", self.forge.to_safe_string_indented());
        let _ = writeln!(&mut result, "providers:");
        for provider in &self.providers {
            let _ = writeln!(&mut result, "{}", provider.to_safe_string_indented());
        }
        let _ = writeln!(&mut result, "credentials:");
        for credentials in &self.credentials {
            let _ = writeln!(&mut result, "{}", credentials.to_safe_string_indented());
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(with = "humantime_serde")]
    pub user_token_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub instance_token_ttl: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            user_token_ttl: Duration::from_secs(24 * 60 * 60),
            instance_token_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl SafeDisplay for JwtConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "secret: ****");
        let _ = writeln!(&mut result, "user token TTL: {:?}", self.user_token_ttl);
        let _ = writeln!(
            &mut result,
            "instance token TTL: {:?}",
            self.instance_token_ttl
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    pub provisioning_workers: usize,
    pub max_create_attempts: u32,
    pub event_ring_size: usize,
    /// Completed job rows older than this are garbage collected.
    #[serde(with = "humantime_serde")]
    pub job_retention: Duration,
    /// Size of the per-entity webhook event queue; overflow turns into 503
    /// so the forge redelivers.
    pub event_queue_size: usize,
    /// When set, pool managers install the workflow_job webhook on their
    /// entity at startup.
    pub manage_webhooks: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            provisioning_workers: DEFAULT_POOL_QUEUE_SIZE,
            max_create_attempts: 5,
            event_ring_size: garm_common::model::DEFAULT_EVENT_RING_SIZE,
            job_retention: Duration::from_secs(5 * 60),
            event_queue_size: 128,
            manage_webhooks: false,
        }
    }
}

impl SafeDisplay for RunnerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "reconcile interval: {:?}",
            self.reconcile_interval
        );
        let _ = writeln!(
            &mut result,
            "provisioning workers: {}",
            self.provisioning_workers
        );
        let _ = writeln!(
            &mut result,
            "max create attempts: {}",
            self.max_create_attempts
        );
        let _ = writeln!(&mut result, "event ring size: {}", self.event_ring_size);
        let _ = writeln!(&mut result, "job retention: {:?}", self.job_retention);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForgeConfig {
    pub retries: RetryConfig,
    /// Upper bound on a single scale-set long-poll request.
    #[serde(with = "humantime_serde")]
    pub scale_set_poll_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            retries: RetryConfig::default(),
            scale_set_poll_timeout: Duration::from_secs(50),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for ForgeConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "scale set poll timeout: {:?}",
            self.scale_set_poll_timeout
        );
        let _ = writeln!(&mut result, "request timeout: {:?}", self.request_timeout);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub description: String,
    pub external: ExternalProviderConfig,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("provider name must not be empty".to_string());
        }
        if !self.external.provider_executable.is_absolute() {
            return Err(format!(
                "provider {} executable path must be absolute",
                self.name
            ));
        }
        Ok(())
    }
}

impl SafeDisplay for ProviderConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "name: {}", self.name);
        let _ = writeln!(&mut result, "description: {}", self.description);
        let _ = writeln!(&mut result, "external:");
        let _ = writeln!(&mut result, "{}", self.external.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalProviderConfig {
    pub provider_executable: PathBuf,
    pub config_file: Option<PathBuf>,
    /// Additional environment passed through to the provider process.
    #[serde(default)]
    pub environment_variables: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ExternalProviderConfig {
    fn default() -> Self {
        Self {
            provider_executable: PathBuf::new(),
            config_file: None,
            environment_variables: vec![],
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl SafeDisplay for ExternalProviderConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "executable: {}",
            self.provider_executable.display()
        );
        let _ = writeln!(
            &mut result,
            "config file: {}",
            self.config_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        let _ = writeln!(&mut result, "timeout: {:?}", self.timeout);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub name: String,
    pub endpoint: EndpointConfig,
    pub auth: ForgeAuth,
}

impl SafeDisplay for CredentialsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "name: {}", self.name);
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint.name);
        let _ = writeln!(&mut result, "auth: ****");
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub forge_type: ForgeType,
    pub base_url: String,
    pub api_base_url: String,
}

impl HasConfigExamples<GarmServiceConfig> for GarmServiceConfig {
    fn examples() -> Vec<ConfigExample<GarmServiceConfig>> {
        vec![("default-with-github-pat", {
            let mut config = GarmServiceConfig::default();
            config.jwt.secret = "change-me".to_string();
            config.providers = vec![ProviderConfig {
                name: "lxd".to_string(),
                description: "LXD external provider".to_string(),
                external: ExternalProviderConfig {
                    provider_executable: PathBuf::from("/opt/garm/providers/garm-provider-lxd"),
                    config_file: Some(PathBuf::from("/etc/garm/provider-lxd.toml")),
                    environment_variables: vec![],
                    timeout: Duration::from_secs(600),
                },
            }];
            config.credentials = vec![CredentialsConfig {
                name: "github-pat".to_string(),
                endpoint: EndpointConfig {
                    name: "github.com".to_string(),
                    forge_type: ForgeType::Github,
                    base_url: "https://github.com".to_string(),
                    api_base_url: "https://api.github.com".to_string(),
                },
                auth: ForgeAuth::Pat(PatAuth {
                    token: "ghp_example".to_string(),
                }),
            }];
            config
        })]
    }
}

pub fn make_config_loader() -> ConfigLoader<GarmServiceConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/garm-service.toml"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::path::PathBuf;
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
