use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use garm_common::config::DbSqliteConfig;
use garm_common::model::{
    BootstrapInstance, ControllerId, ControllerInfo, CredentialsId, Entity, EntityId, EntityKind,
    ForgeAuth, ForgeCredentials, ForgeEndpoint, InstanceStatus, OsArch, OsType, PatAuth, Pool,
    PoolBalancerType, PoolId, PoolManagerStatus, ProviderInstance, ProviderInterfaceVersion,
    RunnerApplicationDownload, RunnerStatus, ScaleSet, ScaleSetId,
};
use garm_service::auth::TokenService;
use garm_service::config::{ForgeConfig, GarmServiceConfig, JwtConfig, RunnerConfig};
use garm_service::controller::Controller;
use garm_service::forge::scaleset::{
    ScaleSetClient, ScaleSetJitConfig, ScaleSetMessage, ScaleSetSession,
};
use garm_service::forge::{
    ForgeClient, ForgeClientCache, ForgeClientFactory, ForgeError, ForgeHook, ForgeRunner,
    ForgeWorkflowJob, HookSpec, JitConfig, RegistrationToken,
};
use garm_service::model::{
    RepositoryRef, WorkflowJob, WorkflowJobAction, WorkflowJobEvent,
};
use garm_service::provider::{Provider, ProviderError, ProviderRegistry};
use garm_service::runner::{PoolManager, PoolManagerEvent, PoolManagerHandle};
use garm_service::scaleset::{ScaleSetClientFactory, ScaleSetWorker};
use garm_service_base::db;
use garm_service_base::store::Store;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use test_r::test;

test_r::enable!();

// --- mocks ----------------------------------------------------------------

#[derive(Default)]
struct MockForgeClient {
    runners: Mutex<Vec<ForgeRunner>>,
    removed_runners: Mutex<Vec<i64>>,
    registration_tokens: AtomicU32,
    jit_runner_ids: AtomicI64,
}

impl MockForgeClient {
    async fn removed(&self) -> Vec<i64> {
        self.removed_runners.lock().await.clone()
    }
}

#[async_trait]
impl ForgeClient for MockForgeClient {
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>, ForgeError> {
        Ok(self.runners.lock().await.clone())
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<(), ForgeError> {
        self.removed_runners.lock().await.push(runner_id);
        Ok(())
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken, ForgeError> {
        let n = self.registration_tokens.fetch_add(1, Ordering::SeqCst);
        Ok(RegistrationToken {
            token: format!("reg-token-{n}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn get_jit_config(
        &self,
        runner_name: &str,
        _pool: &Pool,
        _labels: &[String],
    ) -> Result<JitConfig, ForgeError> {
        let runner_id = 1000 + self.jit_runner_ids.fetch_add(1, Ordering::SeqCst);
        Ok(JitConfig {
            config: HashMap::from([(
                "encoded_jit_config".to_string(),
                format!("jit-for-{runner_name}"),
            )]),
            runner_id,
        })
    }

    async fn list_runner_application_downloads(
        &self,
    ) -> Result<Vec<RunnerApplicationDownload>, ForgeError> {
        Ok(vec![RunnerApplicationDownload {
            os: "linux".to_string(),
            architecture: "x64".to_string(),
            download_url: "https://example.com/runner.tar.gz".to_string(),
            filename: "runner.tar.gz".to_string(),
            sha256_checksum: None,
            temp_download_token: None,
        }])
    }

    async fn list_hooks(&self) -> Result<Vec<ForgeHook>, ForgeError> {
        Ok(vec![])
    }

    async fn get_hook(&self, hook_id: i64) -> Result<ForgeHook, ForgeError> {
        Err(ForgeError::NotFound(format!("hook {hook_id}")))
    }

    async fn create_hook(&self, spec: &HookSpec) -> Result<ForgeHook, ForgeError> {
        Ok(ForgeHook {
            id: 1,
            url: spec.url.clone(),
            events: spec.events.clone(),
            active: true,
        })
    }

    async fn delete_hook(&self, _hook_id: i64) -> Result<(), ForgeError> {
        Ok(())
    }

    async fn ping_hook(&self, _hook_id: i64) -> Result<(), ForgeError> {
        Ok(())
    }

    async fn get_workflow_job(&self, job_id: i64) -> Result<ForgeWorkflowJob, ForgeError> {
        Err(ForgeError::NotFound(format!("job {job_id}")))
    }
}

struct MockForgeClientFactory {
    client: Arc<MockForgeClient>,
    creates: AtomicU32,
}

impl ForgeClientFactory for MockForgeClientFactory {
    fn create(
        &self,
        _entity: &Entity,
        _credentials: &ForgeCredentials,
    ) -> Result<Arc<dyn ForgeClient>, ForgeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

struct MockProvider {
    interface_version: ProviderInterfaceVersion,
    create_calls: AtomicU32,
    deleted: Mutex<Vec<String>>,
    bootstraps: Mutex<Vec<BootstrapInstance>>,
}

impl MockProvider {
    fn new(interface_version: ProviderInterfaceVersion) -> Self {
        Self {
            interface_version,
            create_calls: AtomicU32::new(0),
            deleted: Mutex::new(vec![]),
            bootstraps: Mutex::new(vec![]),
        }
    }

    fn creates(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn interface_version(&self) -> ProviderInterfaceVersion {
        self.interface_version
    }

    async fn create_instance(
        &self,
        _pool_id: &str,
        bootstrap: &BootstrapInstance,
        _cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.bootstraps.lock().await.push(bootstrap.clone());
        Ok(ProviderInstance {
            provider_id: format!("prov-{}", bootstrap.name),
            name: bootstrap.name.clone(),
            os_type: bootstrap.os_type,
            os_arch: bootstrap.os_arch,
            status: "running".to_string(),
            addresses: vec![],
        })
    }

    async fn get_instance(
        &self,
        instance_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<ProviderInstance, ProviderError> {
        Err(ProviderError::NotFound(instance_name.to_string()))
    }

    async fn delete_instance(
        &self,
        instance_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.deleted.lock().await.push(instance_name.to_string());
        Ok(())
    }

    async fn list_instances(
        &self,
        _pool_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ProviderInstance>, ProviderError> {
        Ok(vec![])
    }

    async fn stop(
        &self,
        _instance_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn start(
        &self,
        _instance_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn remove_all_instances(
        &self,
        _pool_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn get_version(&self, _cancel: &CancellationToken) -> Result<String, ProviderError> {
        Ok("v0.0.1-mock".to_string())
    }

    async fn validate_pool_info(
        &self,
        _image: &str,
        _flavor: &str,
        _extra_specs: Option<&serde_json::Value>,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn get_config_json_schema(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        Ok("{}".to_string())
    }

    async fn get_extra_specs_json_schema(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        Ok("{}".to_string())
    }
}

struct MockScaleSetClient {
    script: Mutex<VecDeque<ScaleSetMessage>>,
    acked: Mutex<Vec<i64>>,
    sessions_closed: AtomicU32,
}

impl MockScaleSetClient {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            acked: Mutex::new(vec![]),
            sessions_closed: AtomicU32::new(0),
        }
    }

    async fn push_message(&self, message_id: i64) {
        self.script.lock().await.push_back(ScaleSetMessage {
            message_id,
            message_type: "RunnerScaleSetJobMessages".to_string(),
            statistics: None,
            body: None,
        });
    }
}

#[async_trait]
impl ScaleSetClient for MockScaleSetClient {
    async fn create_session(
        &self,
        _scale_set_id: i64,
        owner_name: &str,
    ) -> Result<ScaleSetSession, ForgeError> {
        Ok(ScaleSetSession {
            session_id: "session-1".to_string(),
            owner_name: owner_name.to_string(),
            message_queue_url: "http://localhost/queue".to_string(),
            message_queue_access_token: "queue-token".to_string(),
            actions_service_url: "http://localhost/actions".to_string(),
            actions_token: "actions-token".to_string(),
        })
    }

    async fn delete_session(&self, _session: &ScaleSetSession) -> Result<(), ForgeError> {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_message(
        &self,
        _session: &ScaleSetSession,
        _last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ForgeError> {
        let message = self.script.lock().await.pop_front();
        if message.is_none() {
            // emulate the long poll window
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(message)
    }

    async fn delete_message(
        &self,
        _session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError> {
        self.acked.lock().await.push(message_id);
        Ok(())
    }

    async fn acquire_jobs(
        &self,
        _scale_set_id: i64,
        _session: &ScaleSetSession,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError> {
        Ok(request_ids.to_vec())
    }

    async fn generate_jit_config(
        &self,
        _scale_set_id: i64,
        _session: &ScaleSetSession,
        runner_name: &str,
    ) -> Result<ScaleSetJitConfig, ForgeError> {
        Ok(ScaleSetJitConfig {
            config: HashMap::from([(
                "encoded_jit_config".to_string(),
                format!("jit-for-{runner_name}"),
            )]),
            runner_id: 7000,
        })
    }
}

struct MockScaleSetClientFactory {
    client: Arc<MockScaleSetClient>,
}

impl ScaleSetClientFactory for MockScaleSetClientFactory {
    fn create(
        &self,
        _entity: &Entity,
        _credentials: &ForgeCredentials,
        _forge_client: Arc<dyn ForgeClient>,
    ) -> Result<Arc<dyn ScaleSetClient>, ForgeError> {
        Ok(self.client.clone())
    }
}

// --- fixture --------------------------------------------------------------

struct TestEnv {
    _dir: tempfile::TempDir,
    store: Store,
    forge: Arc<MockForgeClient>,
    forge_factory: Arc<MockForgeClientFactory>,
    provider: Arc<MockProvider>,
    clients: Arc<ForgeClientCache>,
    providers: Arc<ProviderRegistry>,
    token_service: Arc<TokenService>,
    controller_info: ControllerInfo,
    entity: Entity,
    credentials: ForgeCredentials,
    cancel: CancellationToken,
}

async fn setup(provider_version: ProviderInterfaceVersion) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_config = DbSqliteConfig {
        database: dir
            .path()
            .join("garm.db")
            .to_string_lossy()
            .into_owned(),
        max_connections: 5,
        foreign_keys: true,
    };
    db::sqlite_migrate(&db_config).await.expect("migrations");
    let pool = db::create_sqlite_pool(&db_config).await.expect("db pool");
    let store = Store::sqlite(Arc::new(pool));

    let endpoint = ForgeEndpoint::github();
    store.upsert_endpoint(&endpoint).await.expect("endpoint");

    let credentials = ForgeCredentials {
        id: CredentialsId::new_v4(),
        name: "test-pat".to_string(),
        endpoint: endpoint.clone(),
        auth: ForgeAuth::Pat(PatAuth {
            token: "ghp_test".to_string(),
        }),
    };
    store
        .upsert_credentials(&credentials)
        .await
        .expect("credentials");

    let entity = Entity {
        id: EntityId::new_v4(),
        kind: EntityKind::Repository,
        name: "acme/widgets".to_string(),
        endpoint_name: endpoint.name.clone(),
        credentials_id: credentials.id,
        webhook_secret: "hook-secret".to_string(),
        pool_balancer_type: PoolBalancerType::Pack,
        status: PoolManagerStatus::default(),
        created_at: Utc::now(),
    };
    store.create_entity(&entity).await.expect("entity");

    let forge = Arc::new(MockForgeClient::default());
    let forge_factory = Arc::new(MockForgeClientFactory {
        client: forge.clone(),
        creates: AtomicU32::new(0),
    });
    let clients = Arc::new(ForgeClientCache::new(forge_factory.clone()));

    let provider = Arc::new(MockProvider::new(provider_version));
    let mut provider_map: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    provider_map.insert("mock".to_string(), provider.clone());
    let providers = Arc::new(ProviderRegistry::with_providers(provider_map));

    let token_service = Arc::new(TokenService::new(
        &JwtConfig {
            secret: "test-secret".to_string(),
            user_token_ttl: Duration::from_secs(24 * 3600),
            instance_token_ttl: Duration::from_secs(3600),
        },
        store.clone(),
    ));

    let controller_info = ControllerInfo {
        controller_id: ControllerId::new_v4(),
        webhook_url: Some("http://localhost:9997/webhooks".to_string()),
        metadata_url: Some("http://localhost:9997/api/v1/metadata".to_string()),
        callback_url: Some("http://localhost:9997/api/v1/callbacks".to_string()),
        version: "0.0.0-test".to_string(),
    };

    TestEnv {
        _dir: dir,
        store,
        forge,
        forge_factory,
        provider,
        clients,
        providers,
        token_service,
        controller_info,
        entity,
        credentials,
        cancel: CancellationToken::new(),
    }
}

fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        reconcile_interval: Duration::from_millis(50),
        provisioning_workers: 4,
        max_create_attempts: 2,
        event_ring_size: 50,
        job_retention: Duration::from_secs(3600),
        event_queue_size: 16,
        manage_webhooks: false,
    }
}

fn make_pool(entity_id: EntityId, min_idle: u32, max: u32, tags: &[&str]) -> Pool {
    Pool {
        id: PoolId::new_v4(),
        entity_id,
        provider_name: "mock".to_string(),
        image: "ubuntu:22.04".to_string(),
        flavor: "default".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        min_idle_runners: min_idle,
        max_runners: max,
        runner_bootstrap_timeout: 20,
        runner_prefix: "garm".to_string(),
        enabled: true,
        github_runner_group: None,
        extra_specs: None,
        priority: 0,
        disable_jit_config: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn start_manager(env: &TestEnv) -> PoolManagerHandle {
    PoolManager::start(
        &env.entity,
        env.store.clone(),
        env.clients.clone(),
        env.providers.clone(),
        env.token_service.clone(),
        env.controller_info.clone(),
        test_runner_config(),
        &env.cancel,
    )
}

async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn queued_event(job_id: i64, labels: &[&str]) -> WorkflowJobEvent {
    WorkflowJobEvent {
        action: WorkflowJobAction::Queued,
        workflow_job: WorkflowJob {
            id: job_id,
            run_id: 1,
            name: "build".to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            status: Some("queued".to_string()),
            runner_id: None,
            runner_name: None,
        },
        repository: Some(RepositoryRef {
            full_name: "acme/widgets".to_string(),
        }),
        organization: None,
        enterprise: None,
    }
}

fn completed_event(job_id: i64, runner_id: i64, runner_name: &str) -> WorkflowJobEvent {
    WorkflowJobEvent {
        action: WorkflowJobAction::Completed,
        workflow_job: WorkflowJob {
            id: job_id,
            run_id: 1,
            name: "build".to_string(),
            labels: vec![],
            status: Some("completed".to_string()),
            runner_id: Some(runner_id),
            runner_name: Some(runner_name.to_string()),
        },
        repository: Some(RepositoryRef {
            full_name: "acme/widgets".to_string(),
        }),
        organization: None,
        enterprise: None,
    }
}

// --- scenarios ------------------------------------------------------------

/// Cold start with `min_idle = 2, max = 5`: exactly two instances are
/// provisioned and the fleet stays stable afterwards.
#[test]
async fn cold_start_reaches_the_idle_target() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 2, 5, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);

    wait_until("two running instances", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 2
                && instances
                    .iter()
                    .all(|i| i.status == InstanceStatus::Running)
        }
    })
    .await;

    assert_eq!(env.provider.creates(), 2);

    // several more reconcile rounds must not create anything new
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.provider.creates(), 2);
    let instances = env.store.list_pool_instances(pool.id).await.unwrap();
    assert_eq!(instances.len(), 2);

    env.cancel.cancel();
    handle.stop().await;
}

/// A queued job with no idle runners provisions one instance; the completed
/// webhook tears it down through the provider and the forge.
#[test]
async fn job_lifecycle_provisions_and_reaps() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 0, 3, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);
    // give the first reconcile round a chance to settle
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.provider.creates(), 0);

    handle
        .try_send(PoolManagerEvent::WorkflowJob(Box::new(queued_event(
            42,
            &["self-hosted", "linux", "x64", "gpu"],
        ))))
        .unwrap();

    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;
    assert_eq!(env.provider.creates(), 1);

    let instance = env.store.list_pool_instances(pool.id).await.unwrap()[0].clone();

    handle
        .try_send(PoolManagerEvent::WorkflowJob(Box::new(completed_event(
            42,
            4242,
            &instance.name,
        ))))
        .unwrap();

    wait_until("instance reaped", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances
                .iter()
                .all(|i| i.status == InstanceStatus::Deleted)
        }
    })
    .await;

    assert_eq!(env.provider.deleted.lock().await.clone(), vec![instance.name.clone()]);
    assert!(env.forge.removed().await.contains(&4242));

    env.cancel.cancel();
    handle.stop().await;
}

/// Replaying the same queued delivery twice provisions exactly once.
#[test]
async fn webhook_replay_is_idempotent() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 0, 3, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);

    for _ in 0..2 {
        handle
            .try_send(PoolManagerEvent::WorkflowJob(Box::new(queued_event(
                77,
                &["self-hosted", "linux", "x64", "gpu"],
            ))))
            .unwrap();
    }

    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.provider.creates(), 1);
    assert_eq!(
        env.store
            .list_pool_instances(pool.id)
            .await
            .unwrap()
            .len(),
        1
    );
    let job = env
        .store
        .get_job(garm_common::model::JobId(77))
        .await
        .unwrap();
    assert!(job.is_some());

    env.cancel.cancel();
    handle.stop().await;
}

/// JIT-capable providers receive the pre-generated JIT configuration in the
/// bootstrap payload.
#[test]
async fn jit_configuration_flows_to_the_provider() {
    let env = setup(ProviderInterfaceVersion::V011).await;
    let pool = make_pool(env.entity.id, 1, 2, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);

    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;

    let instance = env.store.list_pool_instances(pool.id).await.unwrap()[0].clone();
    assert!(instance.agent_id.is_some());
    assert!(instance.jit_configuration.is_some());

    let bootstraps = env.provider.bootstraps.lock().await;
    assert_eq!(bootstraps.len(), 1);
    assert!(bootstraps[0].jit_config_enabled);
    assert_eq!(
        bootstraps[0]
            .jit_configuration
            .as_ref()
            .and_then(|c| c.get("encoded_jit_config"))
            .map(String::as_str),
        Some(format!("jit-for-{}", instance.name).as_str())
    );
    drop(bootstraps);

    env.cancel.cancel();
    handle.stop().await;
}

/// A runner that never calls back is reaped at the bootstrap deadline, the
/// row is retried under an incremented attempt, and the attempt budget ends
/// in `failed`.
#[test]
async fn bootstrap_timeout_retries_then_fails() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    // max_runners = 1 keeps the idle target from replacing the failed row
    let mut pool = make_pool(env.entity.id, 1, 1, &["gpu"]);
    // expire immediately; the agent never reports in
    pool.runner_bootstrap_timeout = 0;
    env.store.create_pool(&pool).await.unwrap();

    // a slower tick leaves the retry worker room to run between rounds
    let mut config = test_runner_config();
    config.reconcile_interval = Duration::from_millis(200);
    let handle = PoolManager::start(
        &env.entity,
        env.store.clone(),
        env.clients.clone(),
        env.providers.clone(),
        env.token_service.clone(),
        env.controller_info.clone(),
        config,
        &env.cancel,
    );

    wait_until(
        "instance failed after exhausting attempts",
        Duration::from_secs(15),
        || {
            let store = env.store.clone();
            let pool_id = pool.id;
            async move {
                let instances = store.list_pool_instances(pool_id).await.unwrap();
                instances
                    .iter()
                    .any(|i| i.status == InstanceStatus::Failed && i.create_attempt == 2)
            }
        },
    )
    .await;

    // one provider create per attempt
    assert_eq!(env.provider.creates(), 2);
    assert_eq!(env.provider.deleted.lock().await.len(), 2);

    let instances = env.store.list_pool_instances(pool.id).await.unwrap();
    let failed = instances
        .iter()
        .find(|i| i.status == InstanceStatus::Failed)
        .expect("failed instance");
    assert!(failed
        .status_events
        .iter()
        .any(|e| e.message.contains("did not call back")));

    env.cancel.cancel();
    handle.stop().await;
}

/// Scale set cursor handling: in-order messages advance the cursor, stale
/// replays are acknowledged but change nothing.
#[test]
async fn scale_set_cursor_is_monotonic() {
    let env = setup(ProviderInterfaceVersion::V011).await;

    let scale_set = ScaleSet {
        id: ScaleSetId::new_v4(),
        scale_set_id: 12,
        name: "ci".to_string(),
        entity_id: env.entity.id,
        provider_name: "mock".to_string(),
        image: "ubuntu:22.04".to_string(),
        flavor: "default".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        min_runners: 0,
        max_runners: 5,
        runner_bootstrap_timeout: 20,
        runner_prefix: "garm-ss".to_string(),
        enabled: true,
        github_runner_group: None,
        extra_specs: None,
        desired_runner_count: 0,
        last_message_id: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    env.store.create_scale_set(&scale_set).await.unwrap();

    let ss_client = Arc::new(MockScaleSetClient::new());
    ss_client.push_message(7).await;
    ss_client.push_message(8).await;
    ss_client.push_message(10).await;

    let handle = ScaleSetWorker::start(
        &scale_set,
        env.store.clone(),
        env.clients.clone(),
        Arc::new(MockScaleSetClientFactory {
            client: ss_client.clone(),
        }),
        env.providers.clone(),
        env.token_service.clone(),
        env.controller_info.clone(),
        test_runner_config(),
        &env.cancel,
    );

    wait_until("cursor reaches 10", Duration::from_secs(10), || {
        let store = env.store.clone();
        let id = scale_set.id;
        async move {
            store.get_scale_set(id).await.unwrap().last_message_id == 10
        }
    })
    .await;

    // a replayed lower id is acknowledged and ignored
    ss_client.push_message(9).await;
    wait_until("replay acknowledged", Duration::from_secs(10), || {
        let client = ss_client.clone();
        async move { client.acked.lock().await.contains(&9) }
    })
    .await;
    assert_eq!(
        env.store
            .get_scale_set(scale_set.id)
            .await
            .unwrap()
            .last_message_id,
        10
    );

    // the conditional write itself refuses to move backwards
    assert!(!env
        .store
        .set_scale_set_last_message_id(scale_set.id, 9)
        .await
        .unwrap());

    env.cancel.cancel();
    handle.stop().await;
}

/// Rotating credentials swaps the cached client without disturbing anything
/// already running.
#[test]
async fn credential_rotation_swaps_cached_clients() {
    let env = setup(ProviderInterfaceVersion::V010).await;

    let first = env
        .clients
        .client_for(&env.entity, &env.credentials)
        .await
        .unwrap();
    let again = env
        .clients
        .client_for(&env.entity, &env.credentials)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let mut rotated = env.credentials.clone();
    rotated.auth = ForgeAuth::Pat(PatAuth {
        token: "ghp_rotated".to_string(),
    });
    env.store.upsert_credentials(&rotated).await.unwrap();

    let fresh = env.clients.client_for(&env.entity, &rotated).await.unwrap();
    assert_eq!(env.forge_factory.creates.load(Ordering::SeqCst), 2);
    // the in-flight handle stays usable, new calls go through the new entry
    assert!(first.list_runners().await.is_ok());
    assert!(fresh.list_runners().await.is_ok());

    env.cancel.cancel();
}

/// Agent tokens stop verifying once the runner picked up a job.
#[test]
async fn instance_tokens_expire_with_runner_use() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 1, 2, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);
    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;

    let instance = env.store.list_pool_instances(pool.id).await.unwrap()[0].clone();
    let token = env
        .token_service
        .issue_instance_token(&instance, &env.entity, garm_common::model::ForgeType::Github)
        .unwrap();

    assert!(env.token_service.verify_instance_token(&token).await.is_ok());

    env.store
        .update_instance(
            instance.id,
            garm_service_base::repo::instance::UpdateInstanceParams {
                runner_status: Some(RunnerStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(env
        .token_service
        .verify_instance_token(&token)
        .await
        .is_err());

    env.cancel.cancel();
    handle.stop().await;
}

/// The agent callback surface: bearer-token middleware, registration token
/// once per attempt, status events and heartbeat.
#[test]
async fn agent_callback_surface_round_trip() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 1, 2, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let handle = start_manager(&env);
    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;

    let instance = env.store.list_pool_instances(pool.id).await.unwrap()[0].clone();
    let token = env
        .token_service
        .issue_instance_token(&instance, &env.entity, garm_common::model::ForgeType::Github)
        .unwrap();

    let services = garm_service::bootstrap::Services {
        store: env.store.clone(),
        token_service: env.token_service.clone(),
        clients: env.clients.clone(),
        scale_set_clients: Arc::new(MockScaleSetClientFactory {
            client: Arc::new(MockScaleSetClient::new()),
        }),
        providers: env.providers.clone(),
        controller_info: env.controller_info.clone(),
    };
    let mut config = GarmServiceConfig::default();
    config.jwt.secret = "test-secret".to_string();
    let controller = Arc::new(Controller::new(
        env.store.clone(),
        config,
        env.clients.clone(),
        services.scale_set_clients.clone(),
        env.providers.clone(),
        env.token_service.clone(),
        env.controller_info.clone(),
        env.cancel.clone(),
    ));
    let route = garm_service::api::make_route(
        &services,
        controller,
        prometheus::Registry::new(),
    );
    let client = poem::test::TestClient::new(route);

    // no token: refused
    let response = client
        .post("/api/v1/metadata/runner-registration-token")
        .send()
        .await;
    response.assert_status(poem::http::StatusCode::UNAUTHORIZED);

    // first fetch succeeds
    let response = client
        .post("/api/v1/metadata/runner-registration-token")
        .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status_is_ok();
    response
        .json()
        .await
        .value()
        .object()
        .get("token")
        .assert_string("reg-token-0");

    let fetched = env.store.get_instance(instance.id).await.unwrap();
    assert!(fetched.token_fetched);

    // the second fetch for the same attempt is refused
    let response = client
        .post("/api/v1/metadata/runner-registration-token")
        .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status(poem::http::StatusCode::UNAUTHORIZED);

    // status callback appends an event and moves the runner forward
    let response = client
        .post("/api/v1/callbacks/status")
        .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
        .body_json(&serde_json::json!({
            "status": "installing",
            "message": "downloading runner agent"
        }))
        .send()
        .await;
    response.assert_status_is_ok();

    // heartbeat updates the liveness timestamp
    let response = client
        .post("/api/v1/callbacks/heartbeat")
        .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await;
    response.assert_status_is_ok();

    let updated = env.store.get_instance(instance.id).await.unwrap();
    assert_eq!(updated.runner_status, RunnerStatus::Installing);
    assert!(updated.heartbeat.is_some());
    assert!(updated
        .status_events
        .iter()
        .any(|e| e.message == "downloading runner agent"));

    env.cancel.cancel();
    handle.stop().await;
}

/// Full webhook demux through the controller: HMAC over the raw bytes,
/// routing to the owning pool manager, replay safety.
#[test]
async fn controller_webhook_demux_end_to_end() {
    let env = setup(ProviderInterfaceVersion::V010).await;
    let pool = make_pool(env.entity.id, 0, 3, &["gpu"]);
    env.store.create_pool(&pool).await.unwrap();

    let mut config = GarmServiceConfig::default();
    config.jwt.secret = "test-secret".to_string();
    config.runner = test_runner_config();
    config.forge = ForgeConfig::default();

    let controller = Arc::new(Controller::new(
        env.store.clone(),
        config,
        env.clients.clone(),
        Arc::new(MockScaleSetClientFactory {
            client: Arc::new(MockScaleSetClient::new()),
        }),
        env.providers.clone(),
        env.token_service.clone(),
        env.controller_info.clone(),
        env.cancel.clone(),
    ));
    controller.start().await.unwrap();

    let body = serde_json::to_vec(&queued_event(
        99,
        &["self-hosted", "linux", "x64", "gpu"],
    ))
    .unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"hook-secret").unwrap();
    mac.update(&body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    // bad signature is rejected
    let result = controller
        .dispatch_webhook("workflow_job", Some("sha256=00ff"), &body)
        .await;
    assert!(result.is_err());

    // good signature routes to the pool manager
    controller
        .dispatch_webhook("workflow_job", Some(&signature), &body)
        .await
        .unwrap();

    wait_until("one running instance", Duration::from_secs(10), || {
        let store = env.store.clone();
        let pool_id = pool.id;
        async move {
            let instances = store.list_pool_instances(pool_id).await.unwrap();
            instances.len() == 1 && instances[0].status == InstanceStatus::Running
        }
    })
    .await;
    assert_eq!(env.provider.creates(), 1);

    // ping is accepted without a signature check
    controller.dispatch_webhook("ping", None, b"{}").await.unwrap();

    env.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
}
