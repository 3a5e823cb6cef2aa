//! Master and replica services plus their endpoints.
//!
//! The master service carries no selector: Patroni manages the master
//! endpoint itself. The replica service selects pods by role label.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::resources::common::{
    ClusterInfo, DNS_NAME_ANNOTATION, ELB_TIMEOUT_ANNOTATION, ELB_TIMEOUT_VALUE, PostgresRole,
};

/// Default source range of a load-balanced service: localhost only, unless
/// the manifest widens it explicitly.
pub const LOCAL_HOST_RANGE: &str = "127.0.0.1/32";

/// Whether the given role gets a load balancer: the manifest toggle wins,
/// the operator default applies otherwise.
pub fn should_create_load_balancer(info: &ClusterInfo<'_>, role: PostgresRole) -> bool {
    let spec = &info.cluster.spec;
    match role {
        PostgresRole::Master => spec
            .enable_master_load_balancer
            .unwrap_or(info.config.enable_master_load_balancer),
        PostgresRole::Replica => spec
            .enable_replica_load_balancer
            .unwrap_or(info.config.enable_replica_load_balancer),
    }
}

/// Effective source ranges of a load-balanced service. `None` in the
/// manifest means "leave the observed value alone" and renders as absent;
/// an explicit empty list falls back to localhost.
fn load_balancer_source_ranges(info: &ClusterInfo<'_>) -> Option<Vec<String>> {
    match &info.cluster.spec.allowed_source_ranges {
        None => None,
        Some(ranges) if ranges.is_empty() => Some(vec![LOCAL_HOST_RANGE.to_string()]),
        Some(ranges) => Some(ranges.clone()),
    }
}

/// Compose service annotations: operator-level annotations first, manifest
/// annotations on top, and the externally-managed DNS and ELB annotations
/// last — present iff the role is load-balanced, and never overridable.
pub fn service_annotations(info: &ClusterInfo<'_>, role: PostgresRole) -> BTreeMap<String, String> {
    let mut annotations = info.config.custom_service_annotations.clone();
    annotations.extend(info.cluster.spec.service_annotations.clone());
    annotations.remove(DNS_NAME_ANNOTATION);
    annotations.remove(ELB_TIMEOUT_ANNOTATION);

    if should_create_load_balancer(info, role) {
        let dns_name = match role {
            PostgresRole::Master => info.master_dns_name(),
            PostgresRole::Replica => info.replica_dns_name(),
        };
        annotations.insert(DNS_NAME_ANNOTATION.to_string(), dns_name);
        annotations.insert(
            ELB_TIMEOUT_ANNOTATION.to_string(),
            ELB_TIMEOUT_VALUE.to_string(),
        );
    }
    annotations
}

/// Render the service for one role.
pub fn generate_service(info: &ClusterInfo<'_>, role: PostgresRole) -> Service {
    let mut spec = ServiceSpec {
        ports: Some(vec![ServicePort {
            name: Some("postgresql".to_string()),
            port: 5432,
            target_port: Some(IntOrString::Int(5432)),
            ..Default::default()
        }]),
        type_: Some("ClusterIP".to_string()),
        ..Default::default()
    };

    if role == PostgresRole::Replica {
        spec.selector = Some(info.role_labels_set(role));
    }

    if should_create_load_balancer(info, role) {
        spec.type_ = Some("LoadBalancer".to_string());
        spec.load_balancer_source_ranges = load_balancer_source_ranges(info);
    }

    let annotations = service_annotations(info, role);

    Service {
        metadata: ObjectMeta {
            name: Some(info.service_name(role)),
            namespace: Some(info.namespace()),
            labels: Some(info.role_labels_set(role)),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![info.owner_reference()]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Render the endpoints object for one role. The master endpoint is created
/// with no subsets; Patroni fills it in during leader election.
pub fn generate_endpoint(info: &ClusterInfo<'_>, role: PostgresRole) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(info.endpoint_name(role)),
            namespace: Some(info.namespace()),
            labels: Some(info.role_labels_set(role)),
            owner_references: Some(vec![info.owner_reference()]),
            ..Default::default()
        },
        subsets: None,
    }
}
