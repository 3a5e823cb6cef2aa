//! Operator configuration.
//!
//! All options come from a single config map read once at startup. Values
//! are flat strings; durations use Go-style suffixes (`250ms`, `10s`, `5m`,
//! `1h`), maps are `key:value` pairs and lists are comma-separated.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::NamespacedName;

/// Parse a Go-style duration string (`300ms`, `4s`, `10m`, `1h30m`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration {s:?} is missing a unit"))?;
        if digits == 0 {
            return Err(format!("could not parse duration {s:?}"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|e| format!("could not parse duration {s:?}: {e}"))?;
        let unit_len = if rest[digits..].starts_with("ms") { 2 } else { 1 };
        let unit = &rest[digits..digits + unit_len];
        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
        };
        total += Duration::from_secs_f64(secs);
        rest = &rest[digits + unit_len..];
    }
    Ok(total)
}

/// Format a duration in the shortest whole unit, the inverse of
/// [`parse_duration`] for everything the operator emits.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    if millis != 0 || secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_string {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(D::Error::custom)
    }
}

/// A `{placeholder}` template string, e.g. `{cluster}.{team}.{hostedzone}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringTemplate(pub String);

impl StringTemplate {
    /// Substitute `{key}` placeholders from the given pairs.
    pub fn format(&self, pairs: &[(&str, &str)]) -> String {
        let mut out = self.0.clone();
        for (key, value) in pairs {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

impl From<&str> for StringTemplate {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for StringTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Operator configuration, one field per recognized config-map key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // namespace & pipeline
    pub watched_namespace: String,
    pub workers: u32,
    #[serde(with = "duration_string")]
    pub resync_period: Duration,
    #[serde(with = "duration_string")]
    pub repair_period: Duration,

    // instance bounds (-1 disables the respective bound)
    pub min_instances: i32,
    pub max_instances: i32,

    // labels & identity of owned objects
    pub cluster_labels: BTreeMap<String, String>,
    pub cluster_name_label: String,
    pub pod_role_label: String,
    pub node_readiness_label: BTreeMap<String, String>,

    // pod identity installed in target namespaces
    pub pod_service_account_name: String,
    pub pod_service_account_definition: String,
    pub pod_service_account_role_binding_definition: String,

    // reserved and protected role names
    pub super_username: String,
    pub replication_username: String,
    pub protected_role_names: Vec<String>,

    // human-user provisioning
    pub pam_role_name: String,
    pub pam_configuration: String,
    pub teams_api_url: String,
    pub enable_teams_api: bool,
    pub enable_team_superuser: bool,
    pub postgres_superuser_teams: Vec<String>,
    pub oauth_token_secret_name: NamespacedName,

    // infrastructure roles & pod environment
    pub infrastructure_roles_secret_name: Option<NamespacedName>,
    pub pod_environment_configmap: String,

    // load balancing & DNS
    pub enable_master_load_balancer: bool,
    pub enable_replica_load_balancer: bool,
    pub custom_service_annotations: BTreeMap<String, String>,
    pub master_dns_name_format: StringTemplate,
    pub replica_dns_name_format: StringTemplate,
    pub db_hosted_zone: String,

    // topology
    pub enable_pod_disruption_budget: bool,
    pub enable_pod_antiaffinity: bool,
    pub pod_antiaffinity_topology_key: String,
    pub pod_toleration: BTreeMap<String, String>,

    // workload defaults
    pub docker_image: String,
    pub default_cpu_request: String,
    pub default_memory_request: String,
    pub default_cpu_limit: String,
    pub default_memory_limit: String,
    #[serde(with = "duration_string")]
    pub pod_terminate_grace_period: Duration,
    pub secret_name_template: StringTemplate,
    pub pdb_name_format: StringTemplate,

    // logical backup
    pub logical_backup_schedule: String,
    pub logical_backup_docker_image: String,

    // waits & retries
    #[serde(with = "duration_string")]
    pub resource_check_interval: Duration,
    #[serde(with = "duration_string")]
    pub resource_check_timeout: Duration,
    #[serde(with = "duration_string")]
    pub pod_label_wait_timeout: Duration,
    #[serde(with = "duration_string")]
    pub pod_deletion_wait_timeout: Duration,
    #[serde(with = "duration_string")]
    pub crd_ready_wait_interval: Duration,
    #[serde(with = "duration_string")]
    pub crd_ready_wait_timeout: Duration,
    #[serde(with = "duration_string")]
    pub postgres_connect_timeout: Duration,
    #[serde(with = "duration_string")]
    pub postgres_connect_retry_timeout: Duration,
    #[serde(with = "duration_string")]
    pub ebs_resize_wait_interval: Duration,
    #[serde(with = "duration_string")]
    pub ebs_resize_wait_timeout: Duration,

    // observability
    pub debug_logging: bool,
    pub ring_log_lines: usize,
    pub cluster_history_entries: usize,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watched_namespace: "*".to_string(),
            workers: 4,
            resync_period: Duration::from_secs(30 * 60),
            repair_period: Duration::from_secs(5 * 60),
            min_instances: -1,
            max_instances: -1,
            cluster_labels: BTreeMap::from([("application".to_string(), "spilo".to_string())]),
            cluster_name_label: "cluster-name".to_string(),
            pod_role_label: "spilo-role".to_string(),
            node_readiness_label: BTreeMap::new(),
            pod_service_account_name: "postgres-pod".to_string(),
            pod_service_account_definition: String::new(),
            pod_service_account_role_binding_definition: String::new(),
            super_username: "postgres".to_string(),
            replication_username: "standby".to_string(),
            protected_role_names: vec!["admin".to_string()],
            pam_role_name: "zalandos".to_string(),
            pam_configuration:
                "https://info.example.com/oauth2/tokeninfo?access_token= uid realm=/employees"
                    .to_string(),
            teams_api_url: "https://teams.example.com/api/".to_string(),
            enable_teams_api: true,
            enable_team_superuser: false,
            postgres_superuser_teams: Vec::new(),
            oauth_token_secret_name: NamespacedName::new("default", "postgresql-operator"),
            infrastructure_roles_secret_name: None,
            pod_environment_configmap: String::new(),
            enable_master_load_balancer: true,
            enable_replica_load_balancer: false,
            custom_service_annotations: BTreeMap::new(),
            master_dns_name_format: "{cluster}.{team}.{hostedzone}".into(),
            replica_dns_name_format: "{cluster}-repl.{team}.{hostedzone}".into(),
            db_hosted_zone: "db.example.com".to_string(),
            enable_pod_disruption_budget: true,
            enable_pod_antiaffinity: false,
            pod_antiaffinity_topology_key: "kubernetes.io/hostname".to_string(),
            pod_toleration: BTreeMap::new(),
            docker_image: "registry.opensource.zalan.do/acid/spilo-17:4.0-p2".to_string(),
            default_cpu_request: "100m".to_string(),
            default_memory_request: "100Mi".to_string(),
            default_cpu_limit: "3".to_string(),
            default_memory_limit: "1Gi".to_string(),
            pod_terminate_grace_period: Duration::from_secs(5 * 60),
            secret_name_template: "{username}.{cluster}.credentials.{tprkind}.{tprgroup}".into(),
            pdb_name_format: "postgres-{cluster}-pdb".into(),
            logical_backup_schedule: "30 00 * * *".to_string(),
            logical_backup_docker_image:
                "registry.opensource.zalan.do/acid/logical-backup:v1.0".to_string(),
            resource_check_interval: Duration::from_secs(3),
            resource_check_timeout: Duration::from_secs(10 * 60),
            pod_label_wait_timeout: Duration::from_secs(10 * 60),
            pod_deletion_wait_timeout: Duration::from_secs(10 * 60),
            crd_ready_wait_interval: Duration::from_secs(4),
            crd_ready_wait_timeout: Duration::from_secs(30),
            postgres_connect_timeout: Duration::from_secs(15),
            postgres_connect_retry_timeout: Duration::from_secs(2 * 60),
            ebs_resize_wait_interval: Duration::from_secs(2),
            ebs_resize_wait_timeout: Duration::from_secs(30),
            debug_logging: true,
            ring_log_lines: 100,
            cluster_history_entries: 1000,
            api_port: 8080,
        }
    }
}

/// A config-map value failed to parse.
#[derive(thiserror::Error, Debug)]
#[error("invalid value {value:?} for option {key:?}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

fn parse_map(value: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for pair in value.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| format!("map entry {pair:?} is missing a colon"))?;
        out.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(out)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Build a configuration from raw config-map data. Unknown keys are
    /// ignored; a malformed value for a known key is a startup error.
    pub fn from_map(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        let err = |key: &str, value: &str, reason: String| ConfigError {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        };

        for (key, value) in data {
            match key.as_str() {
                "watched_namespace" => cfg.watched_namespace = value.clone(),
                "workers" => {
                    cfg.workers = value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "resync_period" => {
                    cfg.resync_period = parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "repair_period" => {
                    cfg.repair_period = parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "min_instances" => {
                    cfg.min_instances =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "max_instances" => {
                    cfg.max_instances =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "cluster_labels" => {
                    cfg.cluster_labels = parse_map(value).map_err(|e| err(key, value, e))?;
                }
                "cluster_name_label" => cfg.cluster_name_label = value.clone(),
                "pod_role_label" => cfg.pod_role_label = value.clone(),
                "node_readiness_label" => {
                    cfg.node_readiness_label = parse_map(value).map_err(|e| err(key, value, e))?;
                }
                "pod_service_account_name" => cfg.pod_service_account_name = value.clone(),
                "pod_service_account_definition" => {
                    cfg.pod_service_account_definition = value.clone();
                }
                "pod_service_account_role_binding_definition" => {
                    cfg.pod_service_account_role_binding_definition = value.clone();
                }
                "super_username" => cfg.super_username = value.clone(),
                "replication_username" => cfg.replication_username = value.clone(),
                "protected_role_names" => cfg.protected_role_names = parse_list(value),
                "pam_role_name" => cfg.pam_role_name = value.clone(),
                "pam_configuration" => cfg.pam_configuration = value.clone(),
                "teams_api_url" => cfg.teams_api_url = value.clone(),
                "enable_teams_api" => {
                    cfg.enable_teams_api =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "enable_team_superuser" => {
                    cfg.enable_team_superuser =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "postgres_superuser_teams" => cfg.postgres_superuser_teams = parse_list(value),
                "oauth_token_secret_name" => {
                    cfg.oauth_token_secret_name =
                        NamespacedName::decode(value).map_err(|e| err(key, value, e))?;
                }
                "infrastructure_roles_secret_name" => {
                    cfg.infrastructure_roles_secret_name =
                        Some(NamespacedName::decode(value).map_err(|e| err(key, value, e))?);
                }
                "pod_environment_configmap" => cfg.pod_environment_configmap = value.clone(),
                "enable_master_load_balancer" => {
                    cfg.enable_master_load_balancer =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "enable_replica_load_balancer" => {
                    cfg.enable_replica_load_balancer =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "custom_service_annotations" => {
                    cfg.custom_service_annotations =
                        parse_map(value).map_err(|e| err(key, value, e))?;
                }
                "master_dns_name_format" => {
                    cfg.master_dns_name_format = value.as_str().into();
                }
                "replica_dns_name_format" => {
                    cfg.replica_dns_name_format = value.as_str().into();
                }
                "db_hosted_zone" => cfg.db_hosted_zone = value.clone(),
                "enable_pod_disruption_budget" => {
                    cfg.enable_pod_disruption_budget =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "enable_pod_antiaffinity" => {
                    cfg.enable_pod_antiaffinity =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "pod_antiaffinity_topology_key" => {
                    cfg.pod_antiaffinity_topology_key = value.clone();
                }
                "pod_toleration" => {
                    cfg.pod_toleration = parse_map(value).map_err(|e| err(key, value, e))?;
                }
                "docker_image" => cfg.docker_image = value.clone(),
                "default_cpu_request" => cfg.default_cpu_request = value.clone(),
                "default_memory_request" => cfg.default_memory_request = value.clone(),
                "default_cpu_limit" => cfg.default_cpu_limit = value.clone(),
                "default_memory_limit" => cfg.default_memory_limit = value.clone(),
                "pod_terminate_grace_period" => {
                    cfg.pod_terminate_grace_period =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "secret_name_template" => cfg.secret_name_template = value.as_str().into(),
                "pdb_name_format" => cfg.pdb_name_format = value.as_str().into(),
                "logical_backup_schedule" => cfg.logical_backup_schedule = value.clone(),
                "logical_backup_docker_image" => cfg.logical_backup_docker_image = value.clone(),
                "resource_check_interval" => {
                    cfg.resource_check_interval =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "resource_check_timeout" => {
                    cfg.resource_check_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "pod_label_wait_timeout" => {
                    cfg.pod_label_wait_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "pod_deletion_wait_timeout" => {
                    cfg.pod_deletion_wait_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "crd_ready_wait_interval" => {
                    cfg.crd_ready_wait_interval =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "crd_ready_wait_timeout" => {
                    cfg.crd_ready_wait_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "postgres_connect_timeout" => {
                    cfg.postgres_connect_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "postgres_connect_retry_timeout" => {
                    cfg.postgres_connect_retry_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "ebs_resize_wait_interval" => {
                    cfg.ebs_resize_wait_interval =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "ebs_resize_wait_timeout" => {
                    cfg.ebs_resize_wait_timeout =
                        parse_duration(value).map_err(|e| err(key, value, e))?;
                }
                "debug_logging" => {
                    cfg.debug_logging =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "ring_log_lines" => {
                    cfg.ring_log_lines =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "cluster_history_entries" => {
                    cfg.cluster_history_entries =
                        value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                "api_port" => {
                    cfg.api_port = value.parse().map_err(|e| err(key, value, format!("{e}")))?;
                }
                _ => {}
            }
        }

        Ok(cfg)
    }

    /// True when the operator watches every namespace.
    pub fn watches_all_namespaces(&self) -> bool {
        self.watched_namespace == "*"
    }

    /// Render the config as JSON for the startup log.
    pub fn must_marshal(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serializes")
    }
}
