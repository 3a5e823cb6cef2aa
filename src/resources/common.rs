//! Naming, labelling and ownership shared by all child-object renderers.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::config::Config;
use crate::crd::{API_GROUP, API_VERSION, KIND, Postgresql};

/// Data directory of the database container
pub const POSTGRES_DATA_PATH: &str = "/home/postgres/pgdata";

/// Name of the PGDATA volume and its claim template
pub const DATA_VOLUME_NAME: &str = "pgdata";

/// DNS annotation consumed by external-dns
pub const DNS_NAME_ANNOTATION: &str = "external-dns.alpha.kubernetes.io/hostname";

/// ELB idle-timeout annotation placed on load-balanced services
pub const ELB_TIMEOUT_ANNOTATION: &str =
    "service.beta.kubernetes.io/aws-load-balancer-connection-idle-timeout";
pub const ELB_TIMEOUT_VALUE: &str = "3600";

/// Marker set on the statefulset while a rolling update is pending
pub const ROLLING_UPDATE_ANNOTATION: &str = "zalando-postgres-operator-rolling-update-required";

/// Role a pod plays inside the cluster, as published in the pod role label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostgresRole {
    Master,
    Replica,
}

impl PostgresRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostgresRole::Master => "master",
            PostgresRole::Replica => "replica",
        }
    }

    /// Parse a pod role label value; anything else is "no role yet".
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "master" => Some(PostgresRole::Master),
            "replica" => Some(PostgresRole::Replica),
            _ => None,
        }
    }
}

impl fmt::Display for PostgresRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrowed view over a manifest plus the operator configuration, carrying
/// the naming and labelling rules every renderer needs.
#[derive(Clone, Copy)]
pub struct ClusterInfo<'a> {
    pub cluster: &'a Postgresql,
    pub config: &'a Config,
}

impl<'a> ClusterInfo<'a> {
    pub fn new(cluster: &'a Postgresql, config: &'a Config) -> Self {
        Self { cluster, config }
    }

    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn team_name(&self) -> String {
        self.cluster.spec.team_id.to_lowercase()
    }

    /// Labels carried by every owned child object.
    pub fn labels_set(&self) -> BTreeMap<String, String> {
        let mut labels = self.config.cluster_labels.clone();
        labels.insert(self.config.cluster_name_label.clone(), self.name());
        labels
    }

    /// [`Self::labels_set`] plus the pod role label.
    pub fn role_labels_set(&self, role: PostgresRole) -> BTreeMap<String, String> {
        let mut labels = self.labels_set();
        labels.insert(self.config.pod_role_label.clone(), role.as_str().to_string());
        labels
    }

    /// Label selector string matching all pods of this cluster.
    pub fn label_selector(&self) -> String {
        self.labels_set()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn statefulset_name(&self) -> String {
        self.name()
    }

    /// Master objects carry the bare cluster name, replica objects the
    /// `-repl` suffix.
    pub fn service_name(&self, role: PostgresRole) -> String {
        match role {
            PostgresRole::Master => self.name(),
            PostgresRole::Replica => format!("{}-repl", self.name()),
        }
    }

    pub fn endpoint_name(&self, role: PostgresRole) -> String {
        self.service_name(role)
    }

    pub fn pod_disruption_budget_name(&self) -> String {
        self.config.pdb_name_format.format(&[("cluster", &self.name())])
    }

    pub fn logical_backup_job_name(&self) -> String {
        format!("logical-backup-{}", self.name())
    }

    /// Secret name for a role's credentials. Usernames may contain
    /// underscores; secret names may not, so they become dashes.
    pub fn credential_secret_name(&self, username: &str) -> String {
        self.credential_secret_name_for_cluster(username, &self.name())
    }

    pub fn credential_secret_name_for_cluster(&self, username: &str, cluster_name: &str) -> String {
        self.config.secret_name_template.format(&[
            ("username", &username.replace('_', "-")),
            ("cluster", cluster_name),
            ("tprkind", KIND),
            ("tprgroup", API_GROUP),
        ])
    }

    pub fn master_dns_name(&self) -> String {
        self.config
            .master_dns_name_format
            .format(&[
                ("cluster", &self.name()),
                ("team", &self.team_name()),
                ("hostedzone", &self.config.db_hosted_zone),
            ])
            .to_lowercase()
    }

    pub fn replica_dns_name(&self) -> String {
        self.config
            .replica_dns_name_format
            .format(&[
                ("cluster", &self.name()),
                ("team", &self.team_name()),
                ("hostedzone", &self.config.db_hosted_zone),
            ])
            .to_lowercase()
    }

    /// Service DNS name the role/database synchronizer connects to.
    pub fn database_host(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name(), self.namespace())
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{API_GROUP}/{API_VERSION}"),
            kind: "postgresql".to_string(),
            name: self.name(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fixtures::test_cluster;

    #[test]
    fn labels_carry_cluster_identity() {
        let cluster = test_cluster("acid-test", "acid");
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);

        let labels = info.labels_set();
        assert_eq!(labels.get("application"), Some(&"spilo".to_string()));
        assert_eq!(labels.get("cluster-name"), Some(&"acid-test".to_string()));

        let role_labels = info.role_labels_set(PostgresRole::Master);
        assert_eq!(role_labels.get("spilo-role"), Some(&"master".to_string()));
    }

    #[test]
    fn object_names() {
        let cluster = test_cluster("acid-test", "acid");
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);

        assert_eq!(info.service_name(PostgresRole::Master), "acid-test");
        assert_eq!(info.service_name(PostgresRole::Replica), "acid-test-repl");
        assert_eq!(info.pod_disruption_budget_name(), "postgres-acid-test-pdb");
        assert_eq!(
            info.credential_secret_name("zalando"),
            "zalando.acid-test.credentials.postgresql.acid.zalan.do"
        );
        // underscores in usernames become dashes
        assert_eq!(
            info.credential_secret_name("robot_zmon"),
            "robot-zmon.acid-test.credentials.postgresql.acid.zalan.do"
        );
    }

    #[test]
    fn dns_names_follow_the_templates() {
        let cluster = test_cluster("test", "ACID");
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);

        assert_eq!(info.master_dns_name(), "test.acid.db.example.com");
        assert_eq!(info.replica_dns_name(), "test-repl.acid.db.example.com");
        assert_eq!(info.database_host(), "test.default.svc.cluster.local");
    }
}
