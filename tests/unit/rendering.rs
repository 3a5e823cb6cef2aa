//! Rendering scenarios: a minimal manifest produces the full child-object
//! set, and spec changes classify the way the reconciler acts on them.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use postgresql_operator::cluster::diff;
use postgresql_operator::cluster::users::{self, PgUserMap};
use postgresql_operator::config::Config;
use postgresql_operator::resources::common::{ClusterInfo, PostgresRole};
use postgresql_operator::resources::{pdb, secret, service, statefulset};

use crate::common::fixtures::manifest;

/// A new two-instance cluster renders secrets for both system roles, a
/// two-replica statefulset, both services and a PDB with minAvailable=1.
#[test]
fn minimal_manifest_renders_all_children() {
    let cluster = manifest("acid-minimal", "acid", 2);
    let config = Config::default();
    let info = ClusterInfo::new(&cluster, &config);

    let system_users = users::init_system_users(&config);
    let mut all_users = PgUserMap::new();
    for user in system_users.values() {
        all_users.insert(user.name.clone(), user.clone());
    }
    let secrets = secret::generate_user_secrets(&info, &all_users);
    let secret_names: Vec<_> = secrets
        .iter()
        .map(|s| s.metadata.name.clone().unwrap())
        .collect();
    assert!(
        secret_names
            .contains(&"postgres.acid-minimal.credentials.postgresql.acid.zalan.do".to_string())
    );
    assert!(
        secret_names
            .contains(&"standby.acid-minimal.credentials.postgresql.acid.zalan.do".to_string())
    );

    let sts = statefulset::generate_statefulset(&info, &BTreeMap::new()).unwrap();
    assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(2));

    let master = service::generate_service(&info, PostgresRole::Master);
    let replica = service::generate_service(&info, PostgresRole::Replica);
    assert_eq!(master.metadata.name.as_deref(), Some("acid-minimal"));
    assert_eq!(replica.metadata.name.as_deref(), Some("acid-minimal-repl"));

    let budget = pdb::generate_pod_disruption_budget(&info);
    assert_eq!(
        budget.spec.unwrap().min_available,
        Some(IntOrString::Int(1))
    );
}

/// Scaling from 2 to 3 instances is an in-place patch, no rolling update.
#[test]
fn scale_out_patches_in_place() {
    let config = Config::default();

    let two = manifest("acid-minimal", "acid", 2);
    let three = manifest("acid-minimal", "acid", 3);

    let current =
        statefulset::generate_statefulset(&ClusterInfo::new(&two, &config), &BTreeMap::new())
            .unwrap();
    let desired =
        statefulset::generate_statefulset(&ClusterInfo::new(&three, &config), &BTreeMap::new())
            .unwrap();

    let result = diff::compare_statefulsets(&current, &desired);
    assert!(result.needs_patch);
    assert!(!result.needs_rolling_update);
    assert!(!result.needs_recreate);
}

/// Changing the image requires replacing every pod.
#[test]
fn image_change_requires_a_rolling_update() {
    let config = Config::default();

    let current_manifest = manifest("acid-minimal", "acid", 2);
    let mut desired_manifest = manifest("acid-minimal", "acid", 2);
    desired_manifest.spec.docker_image = Some("spilo:next".to_string());

    let current = statefulset::generate_statefulset(
        &ClusterInfo::new(&current_manifest, &config),
        &BTreeMap::new(),
    )
    .unwrap();
    let desired = statefulset::generate_statefulset(
        &ClusterInfo::new(&desired_manifest, &config),
        &BTreeMap::new(),
    )
    .unwrap();

    let result = diff::compare_statefulsets(&current, &desired);
    assert!(result.needs_rolling_update);
    assert!(!result.needs_recreate);
    assert!(
        result
            .reasons
            .iter()
            .any(|r| r.contains("image doesn't match"))
    );
}

/// Robot users render a credentials secret with a generated password.
#[test]
fn robot_user_gets_a_secret() {
    let mut cluster = manifest("acid-minimal", "acid", 2);
    cluster.spec.users =
        BTreeMap::from([("app".to_string(), vec!["login".to_string(), "createdb".to_string()])]);
    let config = Config::default();
    let info = ClusterInfo::new(&cluster, &config);

    let mut pg_users = PgUserMap::new();
    users::init_robot_users(&config, &cluster.spec.users, &mut pg_users).unwrap();

    let app = &pg_users["app"];
    assert_eq!(app.flags, vec!["CREATEDB", "LOGIN"]);
    assert!(!app.password.is_empty());

    let app_secret = secret::generate_single_user_secret(&info, app).unwrap();
    assert_eq!(
        app_secret.metadata.name.as_deref(),
        Some("app.acid-minimal.credentials.postgresql.acid.zalan.do")
    );
}
