//! Shared domain types for the dcadm update/rollout engine.
//!
//! Everything that crosses a crate boundary lives here: the service and
//! instance inventory model, images, compute nodes, the change sum type,
//! the serialized update plan, reboot-plan views, and the error taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::{DcadmError, MultiError, Upstream};

/// Kind of a registry service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Vm,
    Agent,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Vm => write!(f, "vm"),
            ServiceKind::Agent => write!(f, "agent"),
        }
    }
}

/// Service parameters as stored in the services registry. Only the default
/// image uuid is interpreted by the engine; everything else passes through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A logical unit of software in the services registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default)]
    pub params: ServiceParams,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Kind of a concrete running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Vm,
    Agent,
}

/// A concrete running entity providing a service on a node.
///
/// VM instances are identified by the VM uuid; agent instances by the
/// composite `<node-uuid>/<service-name>` id, which is stable for the life
/// of the agent on that node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub service: String,
    pub kind: InstanceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Instance {
    /// Composite id for an agent instance.
    pub fn agent_id(server: Uuid, service: &str) -> String {
        format!("{server}/{service}")
    }
}

/// An agent as declared in a compute node's system info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAgent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
}

/// A server in the fleet, as reported by the compute-node manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub uuid: Uuid,
    pub hostname: String,
    pub status: String,
    #[serde(default)]
    pub transitional_status: String,
    pub current_platform: String,
    pub boot_platform: String,
    #[serde(default)]
    pub headnode: bool,
    #[serde(default)]
    pub agents: Vec<NodeAgent>,
}

impl ComputeNode {
    /// A node is settled when no transitional status is reported.
    pub fn is_settled(&self) -> bool {
        self.transitional_status.is_empty()
    }
}

/// A versioned artifact in an image registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub uuid: Uuid,
    pub name: String,
    pub version: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<ImageFile>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub compression: String,
}

impl Image {
    /// Build time from the image tags, if stamped.
    pub fn build_time(&self) -> Option<&str> {
        self.tags.get("buildstamp").map(String::as_str)
    }

    /// Ordering key: semantic version, then publish time, then build time,
    /// ascending. Non-semver versions sort as `0.0.0` so publish time
    /// decides.
    pub fn sort_key(&self) -> (Version, DateTime<Utc>, String) {
        (
            lenient_semver(&self.version),
            self.published_at,
            self.build_time().unwrap_or_default().to_string(),
        )
    }
}

/// Sort images ascending by `(version, publish-time, build-time)`.
pub fn order_images(images: &mut [Image]) {
    images.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Parse a version that may or may not be semver. Anything unparseable
/// becomes `0.0.0-<raw>` so the ordering stays total.
pub fn lenient_semver(raw: &str) -> Version {
    if let Ok(v) = Version::parse(raw) {
        return v;
    }
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut v = Version::new(0, 0, 0);
    if let Ok(pre) = semver::Prerelease::new(&sanitized) {
        v.pre = pre;
    }
    v
}

/// A user-supplied intent against the fleet.
///
/// Exactly one identifier form must be given per change; `image` is
/// accepted everywhere but `delete-service`. Extraneous fields are
/// rejected by the change-set parser, which checks keys before
/// deserializing (the internally tagged representation cannot enforce
/// that itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    CreateInstance {
        service: String,
        server: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    DeleteInstance {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    DeleteService {
        service: String,
    },
    UpdateInstance {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    UpdateService {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
}

impl Change {
    /// Kind tag as it appears in serialized form.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::CreateInstance { .. } => ChangeKind::CreateInstance,
            Change::DeleteInstance { .. } => ChangeKind::DeleteInstance,
            Change::DeleteService { .. } => ChangeKind::DeleteService,
            Change::UpdateInstance { .. } => ChangeKind::UpdateInstance,
            Change::UpdateService { .. } => ChangeKind::UpdateService,
        }
    }

    /// Service token, when the change names a service directly.
    pub fn service_token(&self) -> Option<&str> {
        match self {
            Change::CreateInstance { service, .. } | Change::DeleteService { service } => {
                Some(service)
            }
            Change::UpdateService { service, .. } => Some(service),
            Change::DeleteInstance { service, .. } | Change::UpdateInstance { service, .. } => {
                service.as_deref()
            }
        }
    }

    /// Instance token, when the change names an instance.
    pub fn instance_token(&self) -> Option<&str> {
        match self {
            Change::DeleteInstance { instance, .. } | Change::UpdateInstance { instance, .. } => {
                instance.as_deref()
            }
            _ => None,
        }
    }

    /// Server token, when the change names a node.
    pub fn server_token(&self) -> Option<&str> {
        match self {
            Change::CreateInstance { server, .. } => Some(server),
            Change::DeleteInstance { server, .. } | Change::UpdateInstance { server, .. } => {
                server.as_deref()
            }
            _ => None,
        }
    }

    /// Explicit image token, if the user pinned one.
    pub fn image_token(&self) -> Option<&str> {
        match self {
            Change::CreateInstance { image, .. }
            | Change::DeleteInstance { image, .. }
            | Change::UpdateInstance { image, .. }
            | Change::UpdateService { image, .. } => image.as_deref(),
            Change::DeleteService { .. } => None,
        }
    }

    /// Whether the change targets the service as a whole rather than one
    /// instance.
    pub fn is_service_level(&self) -> bool {
        matches!(
            self,
            Change::DeleteService { .. } | Change::UpdateService { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    CreateInstance,
    DeleteInstance,
    DeleteService,
    UpdateInstance,
    UpdateService,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::CreateInstance => "create-instance",
            ChangeKind::DeleteInstance => "delete-instance",
            ChangeKind::DeleteService => "delete-service",
            ChangeKind::UpdateInstance => "update-instance",
            ChangeKind::UpdateService => "update-service",
        };
        write!(f, "{s}")
    }
}

/// A change after resolution: identifiers swapped for inventory records and
/// a concrete image chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub service: Service,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

/// The serialized update plan. Format version 1.
///
/// The current-inventory snapshot rides along in memory for the procedure
/// coordinator but is not part of the wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub v: u32,
    #[serde(skip)]
    pub curr: Vec<Instance>,
    pub targ: Vec<Instance>,
    pub changes: Vec<ResolvedChange>,
    #[serde(rename = "justImages")]
    pub just_images: bool,
}

pub const PLAN_FORMAT_VERSION: u32 = 1;

/// Per-instance health as reported by the compute-node manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub service: String,
    pub instance: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub healthy: bool,
    #[serde(default)]
    pub health_errors: Vec<String>,
}

/// Filter for health queries. All fields optional; empty matches the fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuids: Option<Vec<String>>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<InstanceKind>,
}

/// Lifecycle state of a remote-owned reboot plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootPlanState {
    Created,
    Pending,
    Running,
    Stopped,
    Canceled,
    Finished,
}

impl fmt::Display for RebootPlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebootPlanState::Created => "created",
            RebootPlanState::Pending => "pending",
            RebootPlanState::Running => "running",
            RebootPlanState::Stopped => "stopped",
            RebootPlanState::Canceled => "canceled",
            RebootPlanState::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// View of a reboot plan owned by the compute-node manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebootPlan {
    pub uuid: Uuid,
    pub state: RebootPlanState,
    pub concurrency: u32,
    #[serde(default)]
    pub single_step: bool,
    #[serde(default)]
    pub reboots: Vec<Reboot>,
}

/// One server's reboot record within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reboot {
    pub server_uuid: Uuid,
    pub server_hostname: String,
    pub current_platform: String,
    pub boot_platform: String,
    #[serde(default)]
    pub headnode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operational_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Reboot {
    /// A reboot no longer needs work once it is operational or canceled.
    pub fn is_done(&self) -> bool {
        self.operational_at.is_some() || self.canceled_at.is_some()
    }
}

/// Execution state of a workflow job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobExecution {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobExecution {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobExecution::Succeeded | JobExecution::Failed | JobExecution::Canceled
        )
    }
}

/// A workflow-engine job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub name: String,
    pub execution: JobExecution,
    #[serde(default)]
    pub params: serde_json::Value,
}
