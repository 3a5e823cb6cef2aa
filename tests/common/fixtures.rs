//! Shared builders for unit and property tests.

use k8s_openapi::api::core::v1::Pod;
use kube::core::ObjectMeta;

use postgresql_operator::crd::{Postgresql, PostgresqlSpec};

/// A minimal valid manifest.
pub fn manifest(name: &str, team: &str, instances: i32) -> Postgresql {
    let spec: PostgresqlSpec = serde_json::from_value(serde_json::json!({
        "teamId": team,
        "numberOfInstances": instances,
        "volume": {"size": "1Gi"},
        "postgresql": {"version": "17"}
    }))
    .expect("valid test manifest");

    Postgresql {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some("e23c71e1-7c1c-4d26-a235-a04ea35f1d32".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// A pod with the operator's labels, optionally carrying a role.
pub fn cluster_pod(cluster: &str, name: &str, role: Option<&str>) -> Pod {
    let mut labels = std::collections::BTreeMap::from([
        ("application".to_string(), "spilo".to_string()),
        ("cluster-name".to_string(), cluster.to_string()),
    ]);
    if let Some(role) = role {
        labels.insert("spilo-role".to_string(), role.to_string());
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}
