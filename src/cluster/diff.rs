//! Object-diff engine.
//!
//! Compares a desired child object against the observed one and classifies
//! the required action. Each kind has a table of rules; a rule is a
//! predicate plus the actions it triggers, and ambiguous rules union their
//! classifications. All predicates are symmetric, so the classification
//! relation is too.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, ResourceRequirements, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::resources::common::{DNS_NAME_ANNOTATION, ELB_TIMEOUT_ANNOTATION};
use crate::util::quantities_equal;

/// Union of the actions a comparison calls for. `Recreate` keeps the
/// volumes: the statefulset is deleted (orphaning its pods) and re-created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub needs_patch: bool,
    pub needs_rolling_update: bool,
    pub needs_recreate: bool,
    pub reasons: Vec<String>,
}

impl Classification {
    pub fn is_equal(&self) -> bool {
        !self.needs_patch && !self.needs_rolling_update && !self.needs_recreate
    }

    fn record(&mut self, reason: &str, patch: bool, rolling: bool, recreate: bool) {
        self.needs_patch |= patch;
        self.needs_rolling_update |= rolling;
        self.needs_recreate |= recreate;
        self.reasons.push(reason.to_string());
    }
}

struct StatefulSetCheck {
    reason: &'static str,
    condition: fn(&StatefulSet, &StatefulSet) -> bool,
    patch: bool,
    rolling: bool,
    recreate: bool,
}

struct ContainerCheck {
    reason: &'static str,
    condition: fn(&Container, &Container) -> bool,
}

struct VolumeClaimCheck {
    reason: &'static str,
    condition: fn(&PersistentVolumeClaim, &PersistentVolumeClaim) -> bool,
    rolling: bool,
    recreate: bool,
}

fn template_labels(s: &StatefulSet) -> Option<&BTreeMap<String, String>> {
    s.spec
        .as_ref()
        .and_then(|sp| sp.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
}

fn template_annotations(s: &StatefulSet) -> Option<&BTreeMap<String, String>> {
    s.spec
        .as_ref()
        .and_then(|sp| sp.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
}

fn pod_spec<'a>(
    s: &'a StatefulSet,
) -> Option<&'a k8s_openapi::api::core::v1::PodSpec> {
    s.spec.as_ref().and_then(|sp| sp.template.spec.as_ref())
}

fn containers(s: &StatefulSet) -> &[Container] {
    pod_spec(s).map(|p| p.containers.as_slice()).unwrap_or(&[])
}

fn volume_claims(s: &StatefulSet) -> &[PersistentVolumeClaim] {
    s.spec
        .as_ref()
        .and_then(|sp| sp.volume_claim_templates.as_deref())
        .unwrap_or(&[])
}

/// Resource requirements compare by canonical quantity, so `1G` equals
/// `1e9` and differs from `1Gi`.
fn resources_equal(a: &Option<ResourceRequirements>, b: &Option<ResourceRequirements>) -> bool {
    fn list_equal(
        a: &Option<BTreeMap<String, Quantity>>,
        b: &Option<BTreeMap<String, Quantity>>,
    ) -> bool {
        let empty = BTreeMap::new();
        let a = a.as_ref().unwrap_or(&empty);
        let b = b.as_ref().unwrap_or(&empty);
        a.len() == b.len()
            && a.iter().all(|(k, av)| {
                b.get(k).is_some_and(|bv| quantities_equal(&av.0, &bv.0))
            })
    }
    let (a, b) = match (a, b) {
        (None, None) => return true,
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    list_equal(&a.requests, &b.requests) && list_equal(&a.limits, &b.limits)
}

fn statefulset_checks() -> Vec<StatefulSetCheck> {
    vec![
        StatefulSetCheck {
            reason: "new statefulset's number of replicas doesn't match the current one",
            condition: |a, b| {
                a.spec.as_ref().and_then(|s| s.replicas) != b.spec.as_ref().and_then(|s| s.replicas)
            },
            patch: true,
            rolling: false,
            recreate: false,
        },
        StatefulSetCheck {
            reason: "new statefulset's annotations don't match the current one",
            condition: |a, b| a.metadata.annotations != b.metadata.annotations,
            patch: true,
            rolling: false,
            recreate: false,
        },
        StatefulSetCheck {
            reason: "new statefulset's number of containers doesn't match the current one",
            condition: |a, b| containers(a).len() != containers(b).len(),
            patch: false,
            rolling: true,
            recreate: false,
        },
        StatefulSetCheck {
            reason: "new statefulset's service account name doesn't match the current one",
            condition: |a, b| {
                pod_spec(a).and_then(|p| p.service_account_name.as_ref())
                    != pod_spec(b).and_then(|p| p.service_account_name.as_ref())
            },
            patch: false,
            rolling: true,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's terminationGracePeriodSeconds doesn't match the current one",
            condition: |a, b| {
                pod_spec(a).and_then(|p| p.termination_grace_period_seconds)
                    != pod_spec(b).and_then(|p| p.termination_grace_period_seconds)
            },
            patch: false,
            rolling: true,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's pod affinity doesn't match the current one",
            condition: |a, b| {
                pod_spec(a).and_then(|p| p.affinity.as_ref())
                    != pod_spec(b).and_then(|p| p.affinity.as_ref())
            },
            patch: false,
            rolling: true,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's pod template metadata labels don't match the current one",
            condition: |a, b| template_labels(a) != template_labels(b),
            patch: false,
            rolling: true,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's pod template metadata annotations don't match the current one",
            condition: |a, b| template_annotations(a) != template_annotations(b),
            patch: true,
            rolling: true,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's volumeClaimTemplates contains a different number of volumes to the old one",
            condition: |a, b| volume_claims(a).len() != volume_claims(b).len(),
            patch: false,
            rolling: false,
            recreate: true,
        },
        StatefulSetCheck {
            reason: "new statefulset's selector doesn't match the current one",
            condition: |a, b| {
                let sel = |s: &StatefulSet| {
                    s.spec.as_ref().map(|sp| sp.selector.match_labels.clone())
                };
                match (sel(a), sel(b)) {
                    (Some(a), Some(b)) => a != b,
                    _ => false,
                }
            },
            patch: false,
            rolling: false,
            recreate: true,
        },
    ]
}

fn container_checks() -> Vec<ContainerCheck> {
    vec![
        ContainerCheck {
            reason: "name doesn't match the current one",
            condition: |a, b| a.name != b.name,
        },
        ContainerCheck {
            reason: "image doesn't match the current one",
            condition: |a, b| a.image != b.image,
        },
        ContainerCheck {
            reason: "ports don't match the current one",
            condition: |a, b| a.ports != b.ports,
        },
        ContainerCheck {
            reason: "resources don't match the current ones",
            condition: |a, b| !resources_equal(&a.resources, &b.resources),
        },
        ContainerCheck {
            reason: "environment doesn't match the current one",
            condition: |a, b| a.env != b.env,
        },
        ContainerCheck {
            reason: "environment sources don't match the current one",
            condition: |a, b| a.env_from != b.env_from,
        },
    ]
}

fn volume_claim_checks() -> Vec<VolumeClaimCheck> {
    vec![
        VolumeClaimCheck {
            reason: "name doesn't match the current one",
            condition: |a, b| a.metadata.name != b.metadata.name,
            rolling: false,
            recreate: true,
        },
        VolumeClaimCheck {
            reason: "annotations don't match the current one",
            condition: |a, b| a.metadata.annotations != b.metadata.annotations,
            rolling: false,
            recreate: true,
        },
        VolumeClaimCheck {
            reason: "specification doesn't match the current one",
            condition: |a, b| a.spec != b.spec,
            rolling: true,
            recreate: false,
        },
    ]
}

/// Classify the difference between two statefulset renderings.
pub fn compare_statefulsets(current: &StatefulSet, desired: &StatefulSet) -> Classification {
    let mut result = Classification::default();

    for check in statefulset_checks() {
        if (check.condition)(current, desired) {
            result.record(check.reason, check.patch, check.rolling, check.recreate);
        }
    }

    for (index, (a, b)) in containers(current).iter().zip(containers(desired)).enumerate() {
        for check in container_checks() {
            if (check.condition)(a, b) {
                result.record(
                    &format!("new statefulset's container {index} {}", check.reason),
                    false,
                    true,
                    false,
                );
            }
        }
    }

    for (a, b) in volume_claims(current).iter().zip(volume_claims(desired)) {
        let volume = a.metadata.name.clone().unwrap_or_default();
        for check in volume_claim_checks() {
            if (check.condition)(a, b) {
                result.record(
                    &format!("new statefulset's volume claim {volume:?} {}", check.reason),
                    false,
                    check.rolling,
                    check.recreate,
                );
            }
        }
    }

    result
}

/// `nil` and `[]` mean the same thing on the wire for source ranges.
fn source_ranges_equal(a: &Option<Vec<String>>, b: &Option<Vec<String>>) -> bool {
    let empty = Vec::new();
    a.as_ref().unwrap_or(&empty) == b.as_ref().unwrap_or(&empty)
}

fn service_annotation<'a>(service: &'a Service, key: &str) -> Option<&'a String> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
}

/// Classify the difference between two service renderings; services only
/// ever patch.
pub fn compare_services(current: &Service, desired: &Service) -> Classification {
    let mut result = Classification::default();

    let type_of =
        |s: &Service| s.spec.as_ref().and_then(|sp| sp.type_.clone()).unwrap_or_default();
    if type_of(current) != type_of(desired) {
        result.record(
            &format!(
                "new service's type {:?} doesn't match the current one {:?}",
                type_of(desired),
                type_of(current)
            ),
            true,
            false,
            false,
        );
    }

    let ranges =
        |s: &Service| s.spec.as_ref().and_then(|sp| sp.load_balancer_source_ranges.clone());
    if !source_ranges_equal(&ranges(current), &ranges(desired)) {
        result.record(
            "new service's LoadBalancerSourceRange doesn't match the current one",
            true,
            false,
            false,
        );
    }

    if service_annotation(current, DNS_NAME_ANNOTATION)
        != service_annotation(desired, DNS_NAME_ANNOTATION)
    {
        result.record(
            "new service's DNS annotation doesn't match the current one",
            true,
            false,
            false,
        );
    }

    if service_annotation(current, ELB_TIMEOUT_ANNOTATION)
        != service_annotation(desired, ELB_TIMEOUT_ANNOTATION)
    {
        result.record(
            "new service's ELB idle-timeout annotation doesn't match the current one",
            true,
            false,
            false,
        );
    }

    result
}

/// Disruption budgets compare by deep equality of the spec.
pub fn compare_pod_disruption_budgets(
    current: &PodDisruptionBudget,
    desired: &PodDisruptionBudget,
) -> Classification {
    let mut result = Classification::default();
    if current.spec != desired.spec {
        result.record(
            "new PDB's spec doesn't match the current one",
            true,
            false,
            false,
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::config::Config;
    use crate::fixtures::test_cluster;
    use crate::resources::common::{ClusterInfo, PostgresRole};
    use crate::resources::pdb::generate_pod_disruption_budget;
    use crate::resources::service::generate_service;
    use crate::resources::statefulset::generate_statefulset;

    fn rendered_statefulset(mutate: impl FnOnce(&mut crate::crd::Postgresql)) -> StatefulSet {
        let mut cluster = test_cluster("acid-test", "acid");
        cluster.spec.number_of_instances = 2;
        mutate(&mut cluster);
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);
        generate_statefulset(&info, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn identical_statefulsets_are_equal() {
        let a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|_| {});
        assert!(compare_statefulsets(&a, &b).is_equal());
    }

    #[test]
    fn replica_delta_is_a_patch() {
        let a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|c| c.spec.number_of_instances = 3);
        let result = compare_statefulsets(&a, &b);
        assert!(result.needs_patch);
        assert!(!result.needs_rolling_update);
        assert!(!result.needs_recreate);
    }

    #[test]
    fn image_delta_is_a_rolling_update() {
        let a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|c| c.spec.docker_image = Some("spilo:new".to_string()));
        let result = compare_statefulsets(&a, &b);
        assert!(result.needs_rolling_update);
        assert!(!result.needs_recreate);
    }

    #[test]
    fn resource_delta_compares_canonical_quantities() {
        let a = rendered_statefulset(|c| {
            c.spec.resources.resource_requests.memory = "1G".to_string();
        });
        let b = rendered_statefulset(|c| {
            c.spec.resources.resource_requests.memory = "1e9".to_string();
        });
        assert!(compare_statefulsets(&a, &b).is_equal());

        let c = rendered_statefulset(|c| {
            c.spec.resources.resource_requests.memory = "1Gi".to_string();
        });
        assert!(compare_statefulsets(&a, &c).needs_rolling_update);
    }

    #[test]
    fn grace_period_delta_rolls_and_recreates() {
        let mut a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|_| {});
        a.spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .termination_grace_period_seconds = Some(600);
        let result = compare_statefulsets(&a, &b);
        assert!(result.needs_rolling_update);
        assert!(result.needs_recreate);
    }

    #[test]
    fn selector_delta_recreates() {
        let mut a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|_| {});
        a.spec
            .as_mut()
            .unwrap()
            .selector
            .match_labels
            .as_mut()
            .unwrap()
            .insert("extra".to_string(), "label".to_string());
        let result = compare_statefulsets(&a, &b);
        assert!(result.needs_recreate);
        assert!(!result.needs_rolling_update);
    }

    #[test]
    fn volume_claim_count_delta_recreates() {
        let mut a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|_| {});
        a.spec
            .as_mut()
            .unwrap()
            .volume_claim_templates
            .as_mut()
            .unwrap()
            .clear();
        assert!(compare_statefulsets(&a, &b).needs_recreate);
    }

    #[test]
    fn template_annotation_delta_unions_all_three() {
        let mut a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|_| {});
        a.spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations = Some(BTreeMap::from([("restarted-at".to_string(), "now".to_string())]));
        let result = compare_statefulsets(&a, &b);
        assert!(result.needs_patch);
        assert!(result.needs_rolling_update);
        assert!(result.needs_recreate);
    }

    #[test]
    fn classification_is_symmetric() {
        let a = rendered_statefulset(|_| {});
        let b = rendered_statefulset(|c| {
            c.spec.docker_image = Some("spilo:new".to_string());
            c.spec.number_of_instances = 5;
        });
        let ab = compare_statefulsets(&a, &b);
        let ba = compare_statefulsets(&b, &a);
        assert_eq!(ab.needs_patch, ba.needs_patch);
        assert_eq!(ab.needs_rolling_update, ba.needs_rolling_update);
        assert_eq!(ab.needs_recreate, ba.needs_recreate);
    }

    fn rendered_service(mutate: impl FnOnce(&mut crate::crd::Postgresql)) -> Service {
        let mut cluster = test_cluster("test", "acid");
        cluster.spec.enable_master_load_balancer = Some(true);
        mutate(&mut cluster);
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);
        generate_service(&info, PostgresRole::Master)
    }

    #[test]
    fn service_type_change_patches() {
        let a = rendered_service(|_| {});
        let b = rendered_service(|c| c.spec.enable_master_load_balancer = Some(false));
        let result = compare_services(&a, &b);
        assert!(result.needs_patch);
        assert!(!result.needs_rolling_update && !result.needs_recreate);
    }

    #[test]
    fn nil_and_empty_source_ranges_compare_equal() {
        let mut a = rendered_service(|_| {});
        let b = rendered_service(|_| {});
        a.spec.as_mut().unwrap().load_balancer_source_ranges = Some(vec![]);
        // a has Some([]), b has None
        assert!(compare_services(&a, &b).is_equal());
    }

    #[test]
    fn source_range_change_patches() {
        let a = rendered_service(|c| {
            c.spec.allowed_source_ranges = Some(vec!["10.0.0.0/8".to_string()]);
        });
        let b = rendered_service(|c| {
            c.spec.allowed_source_ranges = Some(vec!["192.168.0.0/16".to_string()]);
        });
        assert!(compare_services(&a, &b).needs_patch);
    }

    #[test]
    fn pdb_compares_spec_deeply() {
        let cluster = test_cluster("acid-test", "acid");
        let config = Config::default();
        let info = ClusterInfo::new(&cluster, &config);

        let a = generate_pod_disruption_budget(&info);
        let mut b = generate_pod_disruption_budget(&info);
        assert!(compare_pod_disruption_budgets(&a, &b).is_equal());

        b.spec.as_mut().unwrap().min_available =
            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(2));
        assert!(compare_pod_disruption_budgets(&a, &b).needs_patch);
    }
}
