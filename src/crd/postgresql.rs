use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// postgresql is the Schema for the managed PostgreSQL cluster manifests
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "acid.zalan.do",
    version = "v1",
    kind = "Postgresql",
    plural = "postgresqls",
    singular = "postgresql",
    shortname = "pg",
    namespaced,
    status = "PostgresqlStatus",
    printcolumn = r#"{"name":"Team", "type":"string", "jsonPath":".spec.teamId"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.numberOfInstances"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlSpec {
    /// Team owning the cluster; the cluster name must be prefixed with it
    pub team_id: String,

    /// Desired number of Patroni members, clamped at reconcile time by the
    /// operator's min_instances/max_instances
    #[serde(default = "default_number_of_instances")]
    pub number_of_instances: i32,

    /// Container image; the operator default applies when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// CPU/memory requests and limits for the database container
    #[serde(default)]
    pub resources: Resources,

    /// Persistent volume for PGDATA
    pub volume: Volume,

    /// PostgreSQL version and server parameters
    #[serde(default)]
    pub postgresql: PostgresqlParam,

    /// Patroni bootstrap settings
    #[serde(default)]
    pub patroni: Patroni,

    /// Robot users: role name -> capability flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, UserFlags>,

    /// Databases to provision: name -> owner role
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub databases: BTreeMap<String, String>,

    /// Per-cluster load-balancer toggles; the operator default applies
    /// when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_master_load_balancer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_replica_load_balancer: Option<bool>,

    /// Annotations merged onto both services; the operator's DNS and ELB
    /// annotations always win
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,

    /// Source CIDRs admitted to load-balanced services. Omitted = keep the
    /// observed value; empty = restrict to localhost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_source_ranges: Option<Vec<String>>,

    /// Clone the cluster from another one at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneDescription>,

    /// Extra containers running next to the database
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Sidecar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub enable_logical_backup: bool,

    /// Cron schedule for the logical backup job; the operator default
    /// applies when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_backup_schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_connection_pooler: Option<bool>,
}

fn default_number_of_instances() -> i32 {
    2
}

/// Capability flags of a robot user (`SUPERUSER`, `CREATEDB`, ...)
pub type UserFlags = Vec<String>;

/// CPU and memory, as Kubernetes quantity strings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

/// Per-container resource requests and limits
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, rename = "requests")]
    pub resource_requests: ResourceDescription,
    #[serde(default, rename = "limits")]
    pub resource_limits: ResourceDescription,
}

/// Persistent volume request for PGDATA
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Size of the persistent volume (e.g. "10Gi")
    pub size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
}

/// PostgreSQL server settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlParam {
    #[serde(default, rename = "version")]
    pub pg_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Patroni bootstrap settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Patroni {
    /// initdb options: key -> value, or key -> "true" for bare flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub initdb: BTreeMap<String, String>,

    /// pg_hba lines; replace the defaults wholesale, order matters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pg_hba: Vec<String>,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub loop_wait: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub retry_timeout: u32,
    #[serde(default)]
    pub maximum_lag_on_failover: f32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Source cluster for a clone: basebackup from a live cluster when no end
/// timestamp is given, point-in-time recovery from the WAL archive otherwise
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneDescription {
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

/// A sidecar container declared in the manifest
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub docker_image: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Cluster status, surfaced as a single string on the custom resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
#[schemars(transparent)]
pub struct PostgresqlStatus(pub ClusterStatus);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ClusterStatus {
    #[default]
    Creating,
    Running,
    Updating,
    Invalid,
    SyncFailed,
}

impl ClusterStatus {
    /// Statuses that mark the last reconcile as failed
    pub fn is_failed(&self) -> bool {
        matches!(self, ClusterStatus::Invalid | ClusterStatus::SyncFailed)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Creating => "Creating",
            ClusterStatus::Running => "Running",
            ClusterStatus::Updating => "Updating",
            ClusterStatus::Invalid => "Invalid",
            ClusterStatus::SyncFailed => "SyncFailed",
        };
        f.write_str(s)
    }
}
