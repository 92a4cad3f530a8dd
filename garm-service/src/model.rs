use garm_common::model::{EntityKind, RunnerStatus};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowJobAction {
    Queued,
    InProgress,
    Completed,
    Waiting,
}

/// Subset of the forge's `workflow_job` webhook payload the controller acts
/// on. Unknown fields are ignored on purpose.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: WorkflowJobAction,
    pub workflow_job: WorkflowJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrganizationRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<EnterpriseRef>,
}

impl WorkflowJobEvent {
    /// The most specific entity the delivery targets.
    pub fn entity_ref(&self) -> Option<(EntityKind, String)> {
        if let Some(repository) = &self.repository {
            return Some((EntityKind::Repository, repository.full_name.clone()));
        }
        if let Some(organization) = &self.organization {
            return Some((EntityKind::Organization, organization.login.clone()));
        }
        if let Some(enterprise) = &self.enterprise {
            return Some((EntityKind::Enterprise, enterprise.slug.clone()));
        }
        None
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub full_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub login: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnterpriseRef {
    pub slug: String,
}

/// Status report posted by the runner agent during bootstrap.
#[derive(Clone, Debug, Object, Serialize, Deserialize)]
pub struct InstanceUpdateMessage {
    #[oai(skip_serializing_if_is_none)]
    pub status: Option<RunnerStatus>,
    pub message: String,
    #[oai(skip_serializing_if_is_none)]
    pub agent_id: Option<i64>,
}

#[derive(Clone, Debug, Object, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os_name: String,
    pub os_version: String,
    #[oai(skip_serializing_if_is_none)]
    pub agent_id: Option<i64>,
}

#[derive(Clone, Debug, Object, Serialize, Deserialize)]
pub struct RegistrationTokenResponse {
    pub token: String,
}

#[derive(Clone, Debug, Object, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Clone, Debug, Object, Serialize, Deserialize)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}
