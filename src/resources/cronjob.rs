//! Logical-backup cron job rendering.
//!
//! The job runs the logical-backup image on a schedule and dumps every
//! database of the cluster; execution and retention live inside the image.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::core::ObjectMeta;

use crate::resources::common::ClusterInfo;

pub fn generate_logical_backup_job(info: &ClusterInfo<'_>) -> CronJob {
    let spec = &info.cluster.spec;
    let schedule = spec
        .logical_backup_schedule
        .clone()
        .unwrap_or_else(|| info.config.logical_backup_schedule.clone());

    let container = Container {
        name: "logical-backup".to_string(),
        image: Some(info.config.logical_backup_docker_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![
            k8s_openapi::api::core::v1::EnvVar {
                name: "SCOPE".to_string(),
                value: Some(info.name()),
                ..Default::default()
            },
            k8s_openapi::api::core::v1::EnvVar {
                name: "CLUSTER_NAME_LABEL".to_string(),
                value: Some(info.config.cluster_name_label.clone()),
                ..Default::default()
            },
            k8s_openapi::api::core::v1::EnvVar {
                name: "PG_VERSION".to_string(),
                value: Some(spec.postgresql.pg_version.clone()),
                ..Default::default()
            },
            k8s_openapi::api::core::v1::EnvVar {
                name: "PGHOST".to_string(),
                value: Some(info.database_host()),
                ..Default::default()
            },
            k8s_openapi::api::core::v1::EnvVar {
                name: "PGUSER".to_string(),
                value: Some(info.config.super_username.clone()),
                ..Default::default()
            },
            k8s_openapi::api::core::v1::EnvVar {
                name: "PGPASSWORD".to_string(),
                value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                    secret_key_ref: Some(k8s_openapi::api::core::v1::SecretKeySelector {
                        name: info.credential_secret_name(&info.config.super_username),
                        key: "password".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    CronJob {
        metadata: ObjectMeta {
            name: Some(info.logical_backup_job_name()),
            namespace: Some(info.namespace()),
            labels: Some(info.labels_set()),
            owner_references: Some(vec![info.owner_reference()]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule,
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(info.labels_set()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(info.labels_set()),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container],
                            restart_policy: Some("Never".to_string()),
                            service_account_name: Some(
                                info.config.pod_service_account_name.clone(),
                            ),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
