//! Stateful workload rendering: the Spilo container configuration, the pod
//! template and the statefulset with its volume claim template.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResourceRequirements, SecretKeySelector, SecurityContext,
    Toleration, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::crd::{CloneDescription, Patroni, PostgresqlParam, ResourceDescription, Resources, Sidecar};
use crate::resources::common::{
    ClusterInfo, DATA_VOLUME_NAME, POSTGRES_DATA_PATH, PostgresRole, ROLLING_UPDATE_ANNOTATION,
};
use crate::util::parse_quantity;

const PG_BINARIES_TEMPLATE: &str = "/usr/lib/postgresql/{version}/bin";

/// GUCs that Patroni only accepts in the cluster-wide bootstrap section,
/// never in the per-node configuration.
pub fn is_bootstrap_only_parameter(param: &str) -> bool {
    matches!(
        param,
        "max_connections"
            | "max_locks_per_transaction"
            | "max_worker_processes"
            | "max_prepared_transactions"
            | "wal_level"
            | "wal_log_hints"
            | "track_commit_timestamp"
    )
}

/// Effective replica count: the manifest value clamped by the operator's
/// instance bounds, `-1` disabling the respective bound.
pub fn effective_number_of_instances(requested: i32, min: i32, max: i32) -> i32 {
    let mut cur = requested;
    if max >= 0 && cur > max {
        cur = max;
    }
    if min >= 0 && cur < min {
        cur = min;
    }
    if cur != requested {
        info!(
            "adjusted number of instances from {requested} to {cur} (min: {min}, max: {max})"
        );
    }
    cur
}

#[derive(Serialize)]
struct SpiloUser {
    password: String,
    options: Vec<String>,
}

#[derive(Serialize, Default)]
struct PatroniDcs {
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loop_wait: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    maximum_lag_on_failover: Option<f32>,
    #[serde(rename = "postgresql", skip_serializing_if = "Option::is_none")]
    pg_bootstrap_configuration: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct SpiloBootstrap {
    initdb: Vec<serde_json::Value>,
    users: BTreeMap<String, SpiloUser>,
    pg_hba: Vec<String>,
    dcs: PatroniDcs,
}

#[derive(Serialize)]
struct SpiloConfiguration {
    postgresql: serde_json::Value,
    bootstrap: SpiloBootstrap,
}

/// Build the `SPILO_CONFIGURATION` JSON: initdb options (manifest wins over
/// the defaults, known bare flags collapse), pg_hba (manifest replaces the
/// defaults wholesale), DCS settings, and server parameters routed between
/// the per-node section and the bootstrap section.
pub fn generate_spilo_configuration(
    info: &ClusterInfo<'_>,
    pg: &PostgresqlParam,
    patroni: &Patroni,
) -> String {
    let mut initdb: Vec<serde_json::Value> = vec![
        json!({"auth-host": "md5"}),
        json!({"auth-local": "trust"}),
    ];

    'options: for (key, value) in &patroni.initdb {
        for existing in initdb.iter_mut() {
            match existing {
                serde_json::Value::Object(map) if map.contains_key(key) => {
                    map.insert(key.clone(), json!(value));
                    continue 'options;
                }
                serde_json::Value::String(s) if s == value => continue 'options,
                _ => {}
            }
        }
        // bare flags take no value
        if value == "true"
            && matches!(
                key.as_str(),
                "data-checksums" | "debug" | "no-locale" | "noclean" | "nosync" | "sync-only"
            )
        {
            initdb.push(json!(key));
            continue;
        }
        initdb.push(json!({key.clone(): value}));
    }

    let pg_hba = if patroni.pg_hba.is_empty() {
        vec![
            "hostnossl all all all reject".to_string(),
            format!("hostssl   all +{} all pam", info.config.pam_role_name),
            "hostssl   all all all md5".to_string(),
        ]
    } else {
        patroni.pg_hba.clone()
    };

    let mut dcs = PatroniDcs {
        ttl: (patroni.ttl != 0).then_some(patroni.ttl),
        loop_wait: (patroni.loop_wait != 0).then_some(patroni.loop_wait),
        retry_timeout: (patroni.retry_timeout != 0).then_some(patroni.retry_timeout),
        maximum_lag_on_failover: (patroni.maximum_lag_on_failover > 0.0)
            .then_some(patroni.maximum_lag_on_failover),
        pg_bootstrap_configuration: None,
    };

    let mut local = serde_json::Map::new();
    local.insert(
        "bin_dir".to_string(),
        json!(PG_BINARIES_TEMPLATE.replace("{version}", &pg.pg_version)),
    );
    if !pg.parameters.is_empty() {
        let mut local_params = BTreeMap::new();
        let mut bootstrap_params = BTreeMap::new();
        for (param, value) in &pg.parameters {
            if is_bootstrap_only_parameter(param) {
                bootstrap_params.insert(param.clone(), value.clone());
            } else {
                local_params.insert(param.clone(), value.clone());
            }
        }
        if !local_params.is_empty() {
            local.insert("parameters".to_string(), json!(local_params));
        }
        if !bootstrap_params.is_empty() {
            dcs.pg_bootstrap_configuration = Some(json!({"parameters": bootstrap_params}));
        }
    }

    let config = SpiloConfiguration {
        postgresql: serde_json::Value::Object(local),
        bootstrap: SpiloBootstrap {
            initdb,
            users: BTreeMap::from([(
                info.config.pam_role_name.clone(),
                SpiloUser {
                    password: String::new(),
                    options: vec!["CREATEDB".to_string(), "NOLOGIN".to_string()],
                },
            )]),
            pg_hba,
            dcs,
        },
    };

    serde_json::to_string(&config).unwrap_or_else(|e| {
        warn!("cannot convert spilo configuration into JSON: {e}");
        String::new()
    })
}

fn fill_resource_list(
    spec: &ResourceDescription,
    defaults: (&str, &str),
) -> Result<BTreeMap<String, Quantity>, String> {
    let cpu = if spec.cpu.is_empty() {
        defaults.0
    } else {
        spec.cpu.as_str()
    };
    let memory = if spec.memory.is_empty() {
        defaults.1
    } else {
        spec.memory.as_str()
    };
    parse_quantity(cpu).map_err(|e| format!("could not parse CPU quantity: {e}"))?;
    parse_quantity(memory).map_err(|e| format!("could not parse memory quantity: {e}"))?;
    Ok(BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]))
}

/// Resolve container resources against the operator defaults, validating
/// the quantities on the way.
pub fn resource_requirements(
    info: &ClusterInfo<'_>,
    resources: &Resources,
) -> Result<K8sResourceRequirements, String> {
    let config = info.config;
    Ok(K8sResourceRequirements {
        requests: Some(fill_resource_list(
            &resources.resource_requests,
            (&config.default_cpu_request, &config.default_memory_request),
        )?),
        limits: Some(fill_resource_list(
            &resources.resource_limits,
            (&config.default_cpu_limit, &config.default_memory_limit),
        )?),
        ..Default::default()
    })
}

/// Pods only schedule onto nodes carrying every readiness label.
fn node_affinity(info: &ClusterInfo<'_>) -> Option<Affinity> {
    if info.config.node_readiness_label.is_empty() {
        return None;
    }
    let match_expressions = info
        .config
        .node_readiness_label
        .iter()
        .map(|(k, v)| NodeSelectorRequirement {
            key: k.clone(),
            operator: "In".to_string(),
            values: Some(vec![v.clone()]),
        })
        .collect();

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(match_expressions),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_anti_affinity(info: &ClusterInfo<'_>) -> Option<PodAntiAffinity> {
    if !info.config.enable_pod_antiaffinity {
        return None;
    }
    Some(PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(info.labels_set()),
                ..Default::default()
            }),
            topology_key: info.config.pod_antiaffinity_topology_key.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Manifest tolerations override the single operator-level toleration.
fn tolerations(info: &ClusterInfo<'_>) -> Vec<Toleration> {
    if !info.cluster.spec.tolerations.is_empty() {
        return info.cluster.spec.tolerations.clone();
    }
    let t = &info.config.pod_toleration;
    if t.is_empty() {
        return Vec::new();
    }
    vec![Toleration {
        key: t.get("key").cloned(),
        operator: t.get("operator").cloned(),
        value: t.get("value").cloned(),
        effect: t.get("effect").cloned(),
        ..Default::default()
    }]
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_key_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment for cloning from another cluster: basebackup from the live
/// source when no end timestamp is given, point-in-time recovery from the
/// WAL archive otherwise.
pub fn generate_clone_environment(
    info: &ClusterInfo<'_>,
    clone: &CloneDescription,
) -> Vec<EnvVar> {
    if clone.cluster.is_empty() {
        return Vec::new();
    }
    let mut env = vec![value_env("CLONE_SCOPE", clone.cluster.clone())];
    if clone.timestamp.is_empty() {
        env.push(value_env("CLONE_METHOD", "CLONE_WITH_BASEBACKUP"));
        env.push(value_env("CLONE_HOST", clone.cluster.clone()));
        env.push(value_env("CLONE_PORT", "5432"));
        env.push(value_env(
            "CLONE_USER",
            info.config.replication_username.clone(),
        ));
        env.push(secret_key_env(
            "CLONE_PASSWORD",
            &info.credential_secret_name_for_cluster(
                &info.config.replication_username,
                &clone.cluster,
            ),
            "password",
        ));
    } else {
        env.push(value_env("CLONE_METHOD", "CLONE_WITH_WALE"));
        env.push(value_env("CLONE_TARGET_TIME", clone.timestamp.clone()));
        if !clone.uid.is_empty() {
            env.push(value_env(
                "CLONE_WAL_BUCKET_SCOPE_SUFFIX",
                format!("/{}", clone.uid),
            ));
        }
    }
    env
}

fn sidecar_container(
    info: &ClusterInfo<'_>,
    sidecar: &Sidecar,
    index: usize,
    volume_mounts: &[VolumeMount],
) -> Result<Container, String> {
    let name = if sidecar.name.is_empty() {
        format!("sidecar-{index}")
    } else {
        sidecar.name.clone()
    };
    let mut env = vec![
        field_ref_env("POD_NAME", "metadata.name"),
        field_ref_env("POD_NAMESPACE", "metadata.namespace"),
        value_env("POSTGRES_USER", info.config.super_username.clone()),
        secret_key_env(
            "POSTGRES_PASSWORD",
            &info.credential_secret_name(&info.config.super_username),
            "password",
        ),
    ];
    for (k, v) in &sidecar.env {
        env.push(value_env(k, v.clone()));
    }
    Ok(Container {
        name,
        image: Some(sidecar.docker_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(resource_requirements(info, &sidecar.resources)?),
        volume_mounts: Some(volume_mounts.to_vec()),
        env: Some(env),
        ..Default::default()
    })
}

/// Render the pod template. `custom_pod_env` comes from the operator's
/// pod-environment config map; explicit operator variables win on conflict.
pub fn generate_pod_template(
    info: &ClusterInfo<'_>,
    custom_pod_env: &BTreeMap<String, String>,
) -> Result<PodTemplateSpec, String> {
    let spec = &info.cluster.spec;
    let spilo_configuration =
        generate_spilo_configuration(info, &spec.postgresql, &spec.patroni);

    let mut env = vec![
        value_env("SCOPE", info.name()),
        value_env("PGROOT", POSTGRES_DATA_PATH),
        field_ref_env("POD_IP", "status.podIP"),
        field_ref_env("POD_NAMESPACE", "metadata.namespace"),
        value_env("PGUSER_SUPERUSER", info.config.super_username.clone()),
        secret_key_env(
            "PGPASSWORD_SUPERUSER",
            &info.credential_secret_name(&info.config.super_username),
            "password",
        ),
        value_env("PGUSER_STANDBY", info.config.replication_username.clone()),
        secret_key_env(
            "PGPASSWORD_STANDBY",
            &info.credential_secret_name(&info.config.replication_username),
            "password",
        ),
        value_env("PAM_OAUTH2", info.config.pam_configuration.clone()),
        value_env("DCS_ENABLE_KUBERNETES_API", "true"),
        value_env("KUBERNETES_LABELS", serde_json::to_string(&info.config.cluster_labels).unwrap_or_default()),
        value_env(
            "KUBERNETES_ROLE_LABEL",
            info.config.pod_role_label.clone(),
        ),
    ];
    if !spilo_configuration.is_empty() {
        env.push(value_env("SPILO_CONFIGURATION", spilo_configuration));
    }
    if let Some(clone) = &spec.clone {
        env.extend(generate_clone_environment(info, clone));
    }

    // pod-environment variables must not shadow operator-defined ones
    let defined: Vec<String> = env.iter().map(|e| e.name.clone()).collect();
    for (name, value) in custom_pod_env {
        if defined.contains(name) {
            warn!(
                variable = %name,
                "variable from the pod environment config map is ignored: \
                 conflict with the definition from the operator"
            );
            continue;
        }
        env.push(value_env(name, value.clone()));
    }

    let volume_mounts = vec![VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: POSTGRES_DATA_PATH.to_string(),
        ..Default::default()
    }];

    let container = Container {
        name: "postgres".to_string(),
        image: Some(
            spec.docker_image
                .clone()
                .unwrap_or_else(|| info.config.docker_image.clone()),
        ),
        image_pull_policy: Some("IfNotPresent".to_string()),
        resources: Some(resource_requirements(info, &spec.resources)?),
        ports: Some(vec![
            ContainerPort {
                container_port: 8008,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: 5432,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: 8080,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(volume_mounts.clone()),
        env: Some(env),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut containers = vec![container];
    for (index, sidecar) in spec.sidecars.iter().enumerate() {
        containers.push(sidecar_container(info, sidecar, index, &volume_mounts)?);
    }

    let mut affinity = node_affinity(info);
    if let Some(anti) = pod_anti_affinity(info) {
        affinity
            .get_or_insert_with(Affinity::default)
            .pod_anti_affinity = Some(anti);
    }

    let pod_spec = PodSpec {
        service_account_name: Some(info.config.pod_service_account_name.clone()),
        termination_grace_period_seconds: Some(
            info.config.pod_terminate_grace_period.as_secs() as i64
        ),
        containers,
        tolerations: {
            let t = tolerations(info);
            if t.is_empty() { None } else { Some(t) }
        },
        affinity,
        ..Default::default()
    };

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(info.labels_set()),
            namespace: Some(info.namespace()),
            ..Default::default()
        }),
        spec: Some(pod_spec),
    })
}

/// Volume claim template for PGDATA.
pub fn generate_persistent_volume_claim_template(
    info: &ClusterInfo<'_>,
) -> Result<PersistentVolumeClaim, String> {
    let volume = &info.cluster.spec.volume;
    parse_quantity(&volume.size).map_err(|e| format!("could not parse volume size: {e}"))?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: (!volume.storage_class.is_empty())
                .then(|| volume.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(volume.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Render the stateful workload.
pub fn generate_statefulset(
    info: &ClusterInfo<'_>,
    custom_pod_env: &BTreeMap<String, String>,
) -> Result<StatefulSet, String> {
    let replicas = effective_number_of_instances(
        info.cluster.spec.number_of_instances,
        info.config.min_instances,
        info.config.max_instances,
    );

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(info.statefulset_name()),
            namespace: Some(info.namespace()),
            labels: Some(info.labels_set()),
            annotations: Some(BTreeMap::from([(
                ROLLING_UPDATE_ANNOTATION.to_string(),
                "false".to_string(),
            )])),
            owner_references: Some(vec![info.owner_reference()]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(info.labels_set()),
                ..Default::default()
            },
            service_name: Some(info.service_name(PostgresRole::Master)),
            template: generate_pod_template(info, custom_pod_env)?,
            volume_claim_templates: Some(vec![generate_persistent_volume_claim_template(info)?]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
