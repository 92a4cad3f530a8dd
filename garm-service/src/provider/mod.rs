use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use garm_common::model::{
    BootstrapInstance, ControllerId, ProviderInstance, ProviderInterfaceVersion,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ExternalProviderConfig, ProviderConfig};

/// Exit code a provider uses to signal that the instance does not exist.
pub const EXIT_CODE_NOT_FOUND: i32 = 30;
/// Exit code a provider uses to signal that the instance already exists.
pub const EXIT_CODE_DUPLICATE: i32 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderCommand {
    CreateInstance,
    GetInstance,
    DeleteInstance,
    ListInstances,
    Start,
    Stop,
    RemoveAllInstances,
    GetVersion,
    GetSupportedInterfaceVersions,
    ValidatePoolInfo,
    GetConfigJsonSchema,
    GetExtraSpecsJsonSchema,
}

impl ProviderCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCommand::CreateInstance => "CreateInstance",
            ProviderCommand::GetInstance => "GetInstance",
            ProviderCommand::DeleteInstance => "DeleteInstance",
            ProviderCommand::ListInstances => "ListInstances",
            ProviderCommand::Start => "Start",
            ProviderCommand::Stop => "Stop",
            ProviderCommand::RemoveAllInstances => "RemoveAllInstances",
            ProviderCommand::GetVersion => "GetVersion",
            ProviderCommand::GetSupportedInterfaceVersions => "GetSupportedInterfaceVersions",
            ProviderCommand::ValidatePoolInfo => "ValidatePoolInfo",
            ProviderCommand::GetConfigJsonSchema => "GetConfigJSONSchema",
            ProviderCommand::GetExtraSpecsJsonSchema => "GetExtraSpecsJSONSchema",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("provider call failed (exit code {exit_code}): {stderr}")]
    Failed { exit_code: i32, stderr: String },
    #[error("provider call timed out")]
    Timeout,
    #[error("provider call cancelled")]
    Cancelled,
    #[error("provider produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("failed to run provider: {0}")]
    Io(#[from] std::io::Error),
}

/// Pluggable compute backend. The production implementation shells out to an
/// external executable; tests substitute their own.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Discovered lazily and cached; decides whether JIT configuration can
    /// be passed through.
    async fn interface_version(&self) -> ProviderInterfaceVersion;

    async fn create_instance(
        &self,
        pool_id: &str,
        bootstrap: &BootstrapInstance,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError>;

    async fn get_instance(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError>;

    async fn delete_instance(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn list_instances(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderInstance>, ProviderError>;

    async fn stop(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn start(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn remove_all_instances(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn get_version(&self, cancel: &CancellationToken) -> Result<String, ProviderError>;

    /// v0.1.1 and later; earlier providers accept everything.
    async fn validate_pool_info(
        &self,
        image: &str,
        flavor: &str,
        extra_specs: Option<&serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    async fn get_config_json_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    /// v0.1.1 and later.
    async fn get_extra_specs_json_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Runs an external provider executable once per verb, per the stable
/// environment/stdin/stdout ABI.
pub struct ExternalProvider {
    name: String,
    config: ExternalProviderConfig,
    controller_id: ControllerId,
    version: RwLock<Option<ProviderInterfaceVersion>>,
}

impl ExternalProvider {
    pub fn new(name: &str, config: ExternalProviderConfig, controller_id: ControllerId) -> Self {
        Self {
            name: name.to_string(),
            config,
            controller_id,
            version: RwLock::new(None),
        }
    }

    async fn exec(
        &self,
        command: ProviderCommand,
        pool_id: Option<&str>,
        instance_id: Option<&str>,
        stdin_payload: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProviderError> {
        let interface_version = match command {
            // discovery itself must not recurse
            ProviderCommand::GetSupportedInterfaceVersions | ProviderCommand::GetVersion => {
                ProviderInterfaceVersion::V010
            }
            _ => self.interface_version().await,
        };

        let mut cmd = Command::new(&self.config.provider_executable);
        cmd.env("GARM_COMMAND", command.as_str())
            .env("GARM_CONTROLLER_ID", self.controller_id.to_string())
            .env("GARM_INTERFACE_VERSION", interface_version.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config_file) = &self.config.config_file {
            cmd.env("GARM_PROVIDER_CONFIG_FILE", config_file);
        }
        if let Some(pool_id) = pool_id {
            cmd.env("GARM_POOL_ID", pool_id);
        }
        if let Some(instance_id) = instance_id {
            cmd.env("GARM_INSTANCE_ID", instance_id);
        }
        for name in &self.config.environment_variables {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }

        debug!(
            provider = self.name,
            command = command.as_str(),
            "invoking external provider"
        );

        let mut child = cmd.spawn()?;

        if let Some(payload) = stdin_payload {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                ProviderError::InvalidOutput("provider stdin unavailable".to_string())
            })?;
            stdin.write_all(&payload).await?;
            // close stdin so the provider sees EOF
            drop(stdin);
        } else {
            drop(child.stdin.take());
        }

        let output = tokio::select! {
            result = tokio::time::timeout(self.config.timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(ProviderError::Io(e)),
                    // dropping the future reaps the subprocess
                    Err(_) => return Err(ProviderError::Timeout),
                }
            }
            _ = cancel.cancelled() => {
                return Err(ProviderError::Cancelled);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(EXIT_CODE_NOT_FOUND) => Err(ProviderError::NotFound(stderr)),
            Some(EXIT_CODE_DUPLICATE) => Err(ProviderError::AlreadyExists(stderr)),
            Some(code) => Err(ProviderError::Failed {
                exit_code: code,
                stderr,
            }),
            None => Err(ProviderError::Failed {
                exit_code: -1,
                stderr: format!("terminated by signal; stderr: {stderr}"),
            }),
        }
    }

    async fn discover_interface_version(&self) -> ProviderInterfaceVersion {
        let cancel = CancellationToken::new();
        let result = self
            .exec(
                ProviderCommand::GetSupportedInterfaceVersions,
                None,
                None,
                None,
                &cancel,
            )
            .await;

        match result {
            Ok(stdout) => {
                let versions: Vec<String> =
                    serde_json::from_slice(&stdout).unwrap_or_default();
                versions
                    .iter()
                    .filter_map(|v| v.parse::<ProviderInterfaceVersion>().ok())
                    .max()
                    .unwrap_or(ProviderInterfaceVersion::V010)
            }
            Err(e) => {
                // old providers do not know the verb at all
                warn!(
                    provider = self.name,
                    "interface version discovery failed ({e}), assuming v0.1.0"
                );
                ProviderInterfaceVersion::V010
            }
        }
    }
}

#[async_trait]
impl Provider for ExternalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn interface_version(&self) -> ProviderInterfaceVersion {
        {
            let cached = self.version.read().await;
            if let Some(version) = *cached {
                return version;
            }
        }
        let discovered = self.discover_interface_version().await;
        *self.version.write().await = Some(discovered);
        discovered
    }

    async fn create_instance(
        &self,
        pool_id: &str,
        bootstrap: &BootstrapInstance,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError> {
        let payload = serde_json::to_vec(bootstrap)
            .map_err(|e| ProviderError::InvalidOutput(e.to_string()))?;
        let stdout = self
            .exec(
                ProviderCommand::CreateInstance,
                Some(pool_id),
                Some(&bootstrap.name),
                Some(payload),
                cancel,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::InvalidOutput(format!("bad CreateInstance response: {e}")))
    }

    async fn get_instance(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError> {
        let stdout = self
            .exec(
                ProviderCommand::GetInstance,
                None,
                Some(instance_name),
                None,
                cancel,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::InvalidOutput(format!("bad GetInstance response: {e}")))
    }

    async fn delete_instance(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::DeleteInstance,
            None,
            Some(instance_name),
            None,
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn list_instances(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderInstance>, ProviderError> {
        let stdout = self
            .exec(
                ProviderCommand::ListInstances,
                Some(pool_id),
                None,
                None,
                cancel,
            )
            .await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| ProviderError::InvalidOutput(format!("bad ListInstances response: {e}")))
    }

    async fn stop(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.exec(ProviderCommand::Stop, None, Some(instance_name), None, cancel)
            .await
            .map(|_| ())
    }

    async fn start(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::Start,
            None,
            Some(instance_name),
            None,
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn remove_all_instances(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.exec(
            ProviderCommand::RemoveAllInstances,
            Some(pool_id),
            None,
            None,
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn get_version(&self, cancel: &CancellationToken) -> Result<String, ProviderError> {
        let stdout = self
            .exec(ProviderCommand::GetVersion, None, None, None, cancel)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn validate_pool_info(
        &self,
        image: &str,
        flavor: &str,
        extra_specs: Option<&serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        if !self.interface_version().await.supports_jit() {
            return Ok(());
        }
        let payload = serde_json::json!({
            "image": image,
            "flavor": flavor,
            "extra_specs": extra_specs,
        });
        self.exec(
            ProviderCommand::ValidatePoolInfo,
            None,
            None,
            Some(payload.to_string().into_bytes()),
            cancel,
        )
        .await
        .map(|_| ())
    }

    async fn get_config_json_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let stdout = self
            .exec(ProviderCommand::GetConfigJsonSchema, None, None, None, cancel)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn get_extra_specs_json_schema(
        &self,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let stdout = self
            .exec(
                ProviderCommand::GetExtraSpecsJsonSchema,
                None,
                None,
                None,
                cancel,
            )
            .await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// All configured providers, keyed by name.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn from_config(configs: &[ProviderConfig], controller_id: ControllerId) -> Self {
        let providers = configs
            .iter()
            .map(|config| {
                let provider: Arc<dyn Provider> = Arc::new(ExternalProvider::new(
                    &config.name,
                    config.external.clone(),
                    controller_id,
                ));
                (config.name.clone(), provider)
            })
            .collect();
        Self { providers }
    }

    pub fn with_providers(providers: HashMap<String, Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Used by pool managers when generating runner names; the pool id is not
/// part of the name so collisions across pools are possible and re-rolled.
pub fn generate_instance_name(prefix: &str) -> String {
    const ALPHABET: [char; 36] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
        'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    ];
    format!("{prefix}-{}", nanoid::nanoid!(8, &ALPHABET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use garm_common::model::{OsArch, OsType, PoolId};
    use std::io::Write;
    use std::time::Duration;
    use test_r::test;

    const STUB_PROVIDER: &str = r#"#!/bin/sh
case "$GARM_COMMAND" in
  CreateInstance)
    input=$(cat)
    name=$(printf '%s' "$input" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p')
    printf '{"provider_id":"prov-%s","name":"%s","os_type":"linux","os_arch":"amd64","status":"running","addresses":[]}' "$name" "$name"
    ;;
  GetSupportedInterfaceVersions)
    printf '["v0.1.0","v0.1.1"]'
    ;;
  DeleteInstance)
    echo "no such instance: $GARM_INSTANCE_ID" >&2
    exit 30
    ;;
  GetVersion)
    printf 'v0.0.1-stub'
    ;;
  Sleep)
    sleep 10
    ;;
  *)
    echo "unknown command: $GARM_COMMAND" >&2
    exit 1
    ;;
esac
"#;

    fn write_stub_provider(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("stub-provider.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn stub_external_provider(
        dir: &tempfile::TempDir,
        timeout: Duration,
    ) -> ExternalProvider {
        let executable = write_stub_provider(dir, STUB_PROVIDER);
        ExternalProvider::new(
            "stub",
            ExternalProviderConfig {
                provider_executable: executable,
                config_file: None,
                environment_variables: vec![],
                timeout,
            },
            ControllerId::new_v4(),
        )
    }

    fn test_bootstrap(name: &str) -> BootstrapInstance {
        BootstrapInstance {
            name: name.to_string(),
            tools: vec![],
            repo_url: "https://github.com/acme/widgets".to_string(),
            callback_url: "http://localhost/api/v1/callbacks".to_string(),
            metadata_url: "http://localhost/api/v1/metadata".to_string(),
            instance_token: "token".to_string(),
            ssh_keys: vec![],
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            flavor: "default".to_string(),
            image: "ubuntu".to_string(),
            labels: vec!["self-hosted".to_string()],
            pool_id: PoolId::new_v4().to_string(),
            extra_specs: None,
            jit_config_enabled: false,
            jit_configuration: None,
        }
    }

    #[test]
    async fn create_instance_round_trips_through_the_abi() {
        let dir = tempfile::tempdir().unwrap();
        let provider = stub_external_provider(&dir, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let bootstrap = test_bootstrap("garm-test1234");
        let result = provider
            .create_instance(&bootstrap.pool_id, &bootstrap, &cancel)
            .await
            .unwrap();

        assert_eq!(result.provider_id, "prov-garm-test1234");
        assert_eq!(result.name, "garm-test1234");
        assert_eq!(result.os_type, OsType::Linux);
    }

    #[test]
    async fn exit_code_30_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = stub_external_provider(&dir, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let result = provider.delete_instance("garm-gone", &cancel).await;
        match result {
            Err(ProviderError::NotFound(stderr)) => {
                assert!(stderr.contains("garm-gone"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    async fn unknown_verb_is_a_generic_failure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = stub_external_provider(&dir, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let result = provider.stop("garm-x", &cancel).await;
        match result {
            Err(ProviderError::Failed { exit_code, stderr }) => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("unknown command"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    async fn interface_version_is_discovered_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let provider = stub_external_provider(&dir, Duration::from_secs(10));

        assert_eq!(
            provider.interface_version().await,
            ProviderInterfaceVersion::V011
        );
        // second call hits the cache
        assert_eq!(
            provider.interface_version().await,
            ProviderInterfaceVersion::V011
        );
    }

    #[test]
    async fn get_version_returns_trimmed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let provider = stub_external_provider(&dir, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let version = provider.get_version(&cancel).await.unwrap();
        assert_eq!(version, "v0.0.1-stub");
    }

    #[test]
    async fn slow_provider_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let executable = write_stub_provider(&dir, "#!/bin/sh\nsleep 10\n");
        let provider = ExternalProvider::new(
            "slow",
            ExternalProviderConfig {
                provider_executable: executable,
                config_file: None,
                environment_variables: vec![],
                timeout: Duration::from_millis(250),
            },
            ControllerId::new_v4(),
        );
        let cancel = CancellationToken::new();

        let result = provider.get_version(&cancel).await;
        assert!(matches!(result, Err(ProviderError::Timeout)));
    }

    #[test]
    fn generated_names_carry_the_prefix() {
        let name = generate_instance_name("garm");
        assert!(name.starts_with("garm-"));
        assert_eq!(name.len(), "garm-".len() + 8);

        let other = generate_instance_name("garm");
        assert_ne!(name, other);
    }
}
