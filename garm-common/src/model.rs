use crate::newtype_uuid;
use chrono::{DateTime, Utc};
use poem_openapi::Enum;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

newtype_uuid!(EntityId);
newtype_uuid!(PoolId);
newtype_uuid!(InstanceId);
newtype_uuid!(ScaleSetId);
newtype_uuid!(CredentialsId);
newtype_uuid!(ControllerId);

/// Forge-side workflow job identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of status events retained per instance.
pub const DEFAULT_EVENT_RING_SIZE: usize = 50;

/// Number of concurrent provisioning workers per pool manager.
pub const DEFAULT_POOL_QUEUE_SIZE: usize = 10;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ForgeType {
    Github,
    Gitea,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Repository,
    Organization,
    Enterprise,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OsType {
    Linux,
    Windows,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OsArch {
    Amd64,
    Arm64,
    Arm,
}

impl OsArch {
    /// Forge-side label synonyms for this architecture.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            OsArch::Amd64 => &["amd64", "x64", "x86_64"],
            OsArch::Arm64 => &["arm64", "aarch64"],
            OsArch::Arm => &["arm"],
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PoolBalancerType {
    Roundrobin,
    Pack,
}

impl Default for PoolBalancerType {
    fn default() -> Self {
        PoolBalancerType::Roundrobin
    }
}

/// Lifecycle of the compute unit backing a runner. See `can_transition_to`
/// for the allowed moves.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
    PendingCreate,
    Creating,
    Running,
    PendingDelete,
    Deleting,
    Deleted,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (PendingCreate, Creating) => true,
            (PendingCreate, PendingDelete) => true,
            (Creating, Running) => true,
            (Creating, PendingDelete) => true,
            (Running, PendingDelete) => true,
            (PendingDelete, Deleting) => true,
            // re-provisioning under the same row after a failed bootstrap
            (PendingDelete, PendingCreate) => true,
            (Deleting, Deleted) => true,
            // operator cleanup of an instance that exhausted its attempts
            (Failed, PendingDelete) => true,
            (from, Failed) => !matches!(from, Deleted | Failed),
            _ => false,
        }
    }

    pub fn transition(&self, next: InstanceStatus) -> Result<InstanceStatus, StateTransitionError> {
        if *self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateTransitionError::InvalidInstanceStatus {
                from: *self,
                to: next,
            })
        }
    }
}

/// Status of the runner agent on the instance, as observed from callbacks and
/// forge webhooks. Progress is strictly forward along
/// pending → installing → idle → active → terminated.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Installing,
    Idle,
    Active,
    Terminated,
    Failed,
}

impl RunnerStatus {
    fn rank(&self) -> u8 {
        match self {
            RunnerStatus::Pending => 0,
            RunnerStatus::Installing => 1,
            RunnerStatus::Idle => 2,
            RunnerStatus::Active => 3,
            RunnerStatus::Terminated => 4,
            RunnerStatus::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerStatus::Terminated | RunnerStatus::Failed)
    }

    /// Once a job ran on the runner its credentials are no longer trusted.
    pub fn refuses_credentials(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Active | RunnerStatus::Terminated | RunnerStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunnerStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn transition(&self, next: RunnerStatus) -> Result<RunnerStatus, StateTransitionError> {
        if *self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateTransitionError::InvalidRunnerStatus {
                from: *self,
                to: next,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("illegal instance status transition: {from} -> {to}")]
    InvalidInstanceStatus {
        from: InstanceStatus,
        to: InstanceStatus,
    },
    #[error("illegal runner status transition: {from} -> {to}")]
    InvalidRunnerStatus { from: RunnerStatus, to: RunnerStatus },
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Provider ABI version, discovered once per provider via
/// `GetSupportedInterfaceVersions`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProviderInterfaceVersion {
    #[serde(rename = "v0.1.0")]
    V010,
    #[serde(rename = "v0.1.1")]
    V011,
}

impl ProviderInterfaceVersion {
    /// JIT runner configuration can only be passed to providers that speak
    /// v0.1.1 or later.
    pub fn supports_jit(&self) -> bool {
        *self >= ProviderInterfaceVersion::V011
    }
}

impl Display for ProviderInterfaceVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProviderInterfaceVersion::V010 => write!(f, "v0.1.0"),
            ProviderInterfaceVersion::V011 => write!(f, "v0.1.1"),
        }
    }
}

impl FromStr for ProviderInterfaceVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('v') {
            "0.1.0" => Ok(ProviderInterfaceVersion::V010),
            "0.1.1" => Ok(ProviderInterfaceVersion::V011),
            other => Err(format!("unknown provider interface version: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeEndpoint {
    pub name: String,
    pub forge_type: ForgeType,
    pub base_url: String,
    pub api_base_url: String,
}

impl ForgeEndpoint {
    pub fn github() -> Self {
        Self {
            name: "github.com".to_string(),
            forge_type: ForgeType::Github,
            base_url: "https://github.com".to_string(),
            api_base_url: "https://api.github.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ForgeAuth {
    Pat(PatAuth),
    App(AppAuth),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatAuth {
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAuth {
    pub app_id: i64,
    pub installation_id: i64,
    pub private_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeCredentials {
    pub id: CredentialsId,
    pub name: String,
    pub endpoint: ForgeEndpoint,
    pub auth: ForgeAuth,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolManagerStatus {
    pub is_running: bool,
    pub failure_reason: Option<String>,
}

/// A forge-side owner of runners. Entities are inert records; the controller
/// owns the mapping from entity id to the live pool manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// `owner/repo` for repositories, the organization or enterprise slug
    /// otherwise.
    pub name: String,
    pub endpoint_name: String,
    pub credentials_id: CredentialsId,
    pub webhook_secret: String,
    pub pool_balancer_type: PoolBalancerType,
    pub status: PoolManagerStatus,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Repository owner and name, when the entity is a repository.
    pub fn repo_parts(&self) -> Option<(&str, &str)> {
        if self.kind != EntityKind::Repository {
            return None;
        }
        self.name.split_once('/')
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub entity_id: EntityId,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub tags: Vec<String>,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    /// Minutes a freshly created instance has to call back before it is
    /// reaped.
    pub runner_bootstrap_timeout: u32,
    pub runner_prefix: String,
    pub enabled: bool,
    pub github_runner_group: Option<String>,
    pub extra_specs: Option<serde_json::Value>,
    pub priority: u32,
    pub disable_jit_config: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn validate(&self) -> Result<(), String> {
        if self.tags.is_empty() {
            return Err("pool must have at least one tag".to_string());
        }
        if self.min_idle_runners > self.max_runners {
            return Err(format!(
                "min_idle_runners ({}) exceeds max_runners ({})",
                self.min_idle_runners, self.max_runners
            ));
        }
        if self.provider_name.is_empty() {
            return Err("pool must name a provider".to_string());
        }
        Ok(())
    }

    /// The label set this pool's runners register with: the configured tags
    /// plus the implicit system labels.
    pub fn effective_labels(&self) -> HashSet<String> {
        let mut labels: HashSet<String> =
            self.tags.iter().map(|t| t.to_lowercase()).collect();
        labels.insert("self-hosted".to_string());
        labels.insert(self.os_type.to_string());
        for arch in self.os_arch.labels() {
            labels.insert((*arch).to_string());
        }
        labels
    }

    /// A queued job matches when the system labels (`self-hosted`, the
    /// pool's os and one of its arch spellings) are all present and every
    /// remaining requested label is covered by the pool's effective label
    /// set.
    pub fn matches_labels(&self, job_labels: &[String]) -> bool {
        if !job_labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case("self-hosted"))
        {
            return false;
        }
        let os = self.os_type.to_string();
        if !job_labels.iter().any(|l| l.eq_ignore_ascii_case(&os)) {
            return false;
        }
        if !job_labels.iter().any(|l| {
            self.os_arch
                .labels()
                .iter()
                .any(|arch| l.eq_ignore_ascii_case(arch))
        }) {
            return false;
        }
        let effective = self.effective_labels();
        job_labels
            .iter()
            .all(|label| effective.contains(&label.to_lowercase()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSet {
    pub id: ScaleSetId,
    /// Numeric id assigned by the forge's runner-scale-set service.
    pub scale_set_id: i64,
    pub name: String,
    pub entity_id: EntityId,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub min_runners: u32,
    pub max_runners: u32,
    pub runner_bootstrap_timeout: u32,
    pub runner_prefix: String,
    pub enabled: bool,
    pub github_runner_group: Option<String>,
    pub extra_specs: Option<serde_json::Value>,
    pub desired_runner_count: i64,
    /// Monotonically non-decreasing session cursor.
    pub last_message_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub level: EventLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Forge-visible runner name, `prefix-shortid`, globally unique.
    pub name: String,
    /// Identifier returned by the provider on create.
    pub provider_id: Option<String>,
    pub pool_id: Option<PoolId>,
    pub scale_set_id: Option<ScaleSetId>,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    pub create_attempt: u32,
    /// Forge-side numeric runner id, known once the runner registered.
    pub agent_id: Option<i64>,
    /// Set once per create attempt when the agent retrieved its credentials.
    pub token_fetched: bool,
    pub jit_configuration: Option<HashMap<String, String>>,
    pub addresses: Vec<Address>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub status_events: Vec<StatusEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Exactly one of pool id and scale set id must be set.
    pub fn owner_is_valid(&self) -> bool {
        self.pool_id.is_some() != self.scale_set_id.is_some()
    }

    /// Instances that can still pick up a job count toward the idle target.
    pub fn counts_as_idle(&self) -> bool {
        matches!(
            self.runner_status,
            RunnerStatus::Pending | RunnerStatus::Installing | RunnerStatus::Idle
        ) && matches!(
            self.status,
            InstanceStatus::PendingCreate | InstanceStatus::Creating | InstanceStatus::Running
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub entity_id: EntityId,
    pub status: JobStatus,
    pub name: String,
    pub labels: Vec<String>,
    pub runner_name: Option<String>,
    pub runner_id: Option<i64>,
    /// Advisory lock for job dispatch, set only via the store's conditional
    /// write.
    pub locked_by: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub controller_id: ControllerId,
    pub webhook_url: Option<String>,
    pub metadata_url: Option<String>,
    pub callback_url: Option<String>,
    pub version: String,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Enum,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[oai(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressType {
    Public,
    Private,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    #[serde(rename = "type")]
    pub address_type: AddressType,
}

/// One downloadable runner agent build, as advertised by the forge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerApplicationDownload {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_download_token: Option<String>,
}

/// Everything a provider needs to create and bootstrap one instance. Sent
/// JSON-encoded on the provider's standard input for `CreateInstance`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInstance {
    pub name: String,
    pub tools: Vec<RunnerApplicationDownload>,
    pub repo_url: String,
    pub callback_url: String,
    pub metadata_url: String,
    pub instance_token: String,
    pub ssh_keys: Vec<String>,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub flavor: String,
    pub image: String,
    pub labels: Vec<String>,
    pub pool_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_specs: Option<serde_json::Value>,
    pub jit_config_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jit_configuration: Option<HashMap<String, String>>,
}

/// Provider's view of an instance, returned on standard output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub provider_id: String,
    pub name: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub status: String,
    #[serde(default)]
    pub addresses: Vec<Address>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn pool_with_tags(tags: &[&str]) -> Pool {
        Pool {
            id: PoolId::new_v4(),
            entity_id: EntityId::new_v4(),
            provider_name: "lxd".to_string(),
            image: "ubuntu:22.04".to_string(),
            flavor: "default".to_string(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            min_idle_runners: 0,
            max_runners: 5,
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

    #[test]
    fn instance_status_happy_path_is_valid() {
        use InstanceStatus::*;
        let path = [PendingCreate, Creating, Running, PendingDelete, Deleting, Deleted];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn instance_status_rejects_backwards_moves() {
        use InstanceStatus::*;
        assert!(!Running.can_transition_to(Creating));
        assert!(!Deleting.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(PendingDelete));
        assert!(!Deleted.can_transition_to(Failed));
    }

    #[test]
    fn failed_instances_can_be_reaped() {
        assert!(InstanceStatus::Failed.can_transition_to(InstanceStatus::PendingDelete));
    }

    #[test]
    fn runner_status_progress_is_forward_only() {
        use RunnerStatus::*;
        assert!(Pending.can_transition_to(Installing));
        assert!(Installing.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Active));
        assert!(Active.can_transition_to(Terminated));
        // forward skips are fine, a webhook may beat the install callback
        assert!(Pending.can_transition_to(Active));
        assert!(!Active.can_transition_to(Idle));
        assert!(!Terminated.can_transition_to(Idle));
        assert!(!Terminated.can_transition_to(Failed));
    }

    #[test]
    fn transition_helper_allows_noop() {
        assert_eq!(
            InstanceStatus::Running.transition(InstanceStatus::Running),
            Ok(InstanceStatus::Running)
        );
        assert!(InstanceStatus::Running
            .transition(InstanceStatus::Creating)
            .is_err());
    }

    #[test]
    fn label_matching_covers_system_labels() {
        let pool = pool_with_tags(&["gpu"]);
        let job = vec![
            "self-hosted".to_string(),
            "linux".to_string(),
            "x64".to_string(),
            "gpu".to_string(),
        ];
        assert!(pool.matches_labels(&job));
    }

    #[test]
    fn label_matching_rejects_uncovered_labels() {
        let pool = pool_with_tags(&["gpu"]);
        let job = vec![
            "self-hosted".to_string(),
            "linux".to_string(),
            "x64".to_string(),
            "cuda-12".to_string(),
        ];
        assert!(!pool.matches_labels(&job));
    }

    #[test]
    fn label_matching_rejects_wrong_os() {
        let pool = pool_with_tags(&["gpu"]);
        let job = vec![
            "self-hosted".to_string(),
            "windows".to_string(),
            "x64".to_string(),
            "gpu".to_string(),
        ];
        assert!(!pool.matches_labels(&job));
    }

    #[test]
    fn label_matching_requires_self_hosted() {
        let pool = pool_with_tags(&["gpu"]);
        let job = vec!["linux".to_string(), "x64".to_string(), "gpu".to_string()];
        assert!(!pool.matches_labels(&job));
    }

    #[test]
    fn label_matching_requires_os_and_arch_labels() {
        let pool = pool_with_tags(&["gpu"]);
        // a bare self-hosted job names no os or arch and must not match
        let job = vec!["self-hosted".to_string(), "gpu".to_string()];
        assert!(!pool.matches_labels(&job));

        let job = vec![
            "self-hosted".to_string(),
            "linux".to_string(),
            "gpu".to_string(),
        ];
        assert!(!pool.matches_labels(&job));

        let job = vec![
            "self-hosted".to_string(),
            "x64".to_string(),
            "gpu".to_string(),
        ];
        assert!(!pool.matches_labels(&job));
    }

    #[test]
    fn label_matching_accepts_arch_synonyms() {
        let pool = pool_with_tags(&["gpu"]);
        for arch in ["x64", "amd64", "x86_64"] {
            let job = vec![
                "self-hosted".to_string(),
                "linux".to_string(),
                arch.to_string(),
                "gpu".to_string(),
            ];
            assert!(pool.matches_labels(&job), "{arch} should satisfy amd64");
        }
    }

    #[test]
    fn label_matching_is_case_insensitive() {
        let pool = pool_with_tags(&["GPU"]);
        let job = vec![
            "Self-Hosted".to_string(),
            "Linux".to_string(),
            "X64".to_string(),
            "gpu".to_string(),
        ];
        assert!(pool.matches_labels(&job));
    }

    #[test]
    fn pool_validation() {
        let mut pool = pool_with_tags(&["gpu"]);
        assert!(pool.validate().is_ok());

        pool.min_idle_runners = 10;
        assert!(pool.validate().is_err());

        pool.min_idle_runners = 0;
        pool.tags.clear();
        assert!(pool.validate().is_err());
    }

    #[test]
    fn interface_version_parsing() {
        assert_eq!(
            "v0.1.0".parse::<ProviderInterfaceVersion>(),
            Ok(ProviderInterfaceVersion::V010)
        );
        assert_eq!(
            "0.1.1".parse::<ProviderInterfaceVersion>(),
            Ok(ProviderInterfaceVersion::V011)
        );
        assert!("v0.2.0".parse::<ProviderInterfaceVersion>().is_err());
        assert!(ProviderInterfaceVersion::V011.supports_jit());
        assert!(!ProviderInterfaceVersion::V010.supports_jit());
    }

    #[test]
    fn bootstrap_instance_round_trip() {
        let bootstrap = BootstrapInstance {
            name: "garm-k9f2m1x7".to_string(),
            tools: vec![RunnerApplicationDownload {
                os: "linux".to_string(),
                architecture: "x64".to_string(),
                download_url: "https://example.com/runner.tar.gz".to_string(),
                filename: "runner.tar.gz".to_string(),
                sha256_checksum: Some("abc123".to_string()),
                temp_download_token: None,
            }],
            repo_url: "https://github.com/acme/widgets".to_string(),
            callback_url: "https://garm.example.com/api/v1/callbacks".to_string(),
            metadata_url: "https://garm.example.com/api/v1/metadata".to_string(),
            instance_token: "token".to_string(),
            ssh_keys: vec!["ssh-ed25519 AAAA".to_string()],
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            flavor: "m1.small".to_string(),
            image: "ubuntu:22.04".to_string(),
            labels: vec!["self-hosted".to_string(), "gpu".to_string()],
            pool_id: PoolId::new_v4().to_string(),
            extra_specs: Some(serde_json::json!({"disk": 50})),
            jit_config_enabled: true,
            jit_configuration: Some(HashMap::from([(
                ".runner".to_string(),
                "eyJhZ2VudCI6MX0=".to_string(),
            )])),
        };

        let encoded = serde_json::to_string(&bootstrap).unwrap();
        let decoded: BootstrapInstance = serde_json::from_str(&encoded).unwrap();
        assert_eq!(bootstrap, decoded);
    }

    #[test]
    fn instance_owner_validity() {
        let now = Utc::now();
        let mut instance = Instance {
            id: InstanceId::new_v4(),
            name: "garm-abc123".to_string(),
            provider_id: None,
            pool_id: Some(PoolId::new_v4()),
            scale_set_id: None,
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
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
        assert!(instance.owner_is_valid());
        assert!(instance.counts_as_idle());

        instance.scale_set_id = Some(ScaleSetId::new_v4());
        assert!(!instance.owner_is_valid());

        instance.scale_set_id = None;
        instance.runner_status = RunnerStatus::Active;
        assert!(!instance.counts_as_idle());
    }
}
