//! Pod disruption budget.
//!
//! Voluntary evictions must never take the last master down, so the budget
//! selects master pods and keeps `minAvailable = 1`.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::resources::common::{ClusterInfo, PostgresRole};

pub fn generate_pod_disruption_budget(info: &ClusterInfo<'_>) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(info.pod_disruption_budget_name()),
            namespace: Some(info.namespace()),
            labels: Some(info.labels_set()),
            owner_references: Some(vec![info.owner_reference()]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(info.role_labels_set(PostgresRole::Master)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::fixtures::test_cluster;

    #[test]
    fn budget_keeps_one_master_available() {
        let cluster = test_cluster("acid-test", "acid");
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);

        let pdb = generate_pod_disruption_budget(&info);
        assert_eq!(pdb.metadata.name.as_deref(), Some("postgres-acid-test-pdb"));

        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(1)));
        let selector = spec.selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.get("spilo-role"), Some(&"master".to_string()));
        assert_eq!(selector.get("cluster-name"), Some(&"acid-test".to_string()));
    }
}
