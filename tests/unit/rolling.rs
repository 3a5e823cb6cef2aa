//! Rolling-update ordering: replicas first in deterministic order, the
//! master last, and never two masters in the plan.

use std::time::Duration;

use postgresql_operator::cluster::pod::{
    PodEvent, PodEventType, PodSubscribers, rolling_update_order, wait_for_pod_deletion,
    wait_for_pod_label,
};
use postgresql_operator::resources::common::PostgresRole;
use postgresql_operator::util::NamespacedName;

use crate::common::fixtures::cluster_pod;

#[test]
fn replicas_first_master_last() {
    let pods = vec![
        cluster_pod("acid-minimal", "acid-minimal-2", Some("replica")),
        cluster_pod("acid-minimal", "acid-minimal-0", Some("master")),
        cluster_pod("acid-minimal", "acid-minimal-1", Some("replica")),
        cluster_pod("acid-minimal", "acid-minimal-3", Some("replica")),
    ];

    let (replicas, master) = rolling_update_order(&pods, "spilo-role").unwrap();

    // k replicas plus the master: k+1 deletions, master strictly last
    assert_eq!(replicas.len(), 3);
    assert_eq!(
        replicas.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        vec!["acid-minimal-1", "acid-minimal-2", "acid-minimal-3"]
    );
    assert_eq!(master.unwrap().name, "acid-minimal-0");
}

#[test]
fn unlabelled_pods_count_as_replicas() {
    let pods = vec![
        cluster_pod("acid-minimal", "acid-minimal-0", Some("master")),
        cluster_pod("acid-minimal", "acid-minimal-1", None),
    ];
    let (replicas, master) = rolling_update_order(&pods, "spilo-role").unwrap();
    assert_eq!(replicas.len(), 1);
    assert!(master.is_some());
}

#[test]
fn two_masters_are_rejected() {
    let pods = vec![
        cluster_pod("acid-minimal", "acid-minimal-0", Some("master")),
        cluster_pod("acid-minimal", "acid-minimal-1", Some("master")),
    ];
    assert!(rolling_update_order(&pods, "spilo-role").is_err());
}

fn pod_event(pod: &str, event_type: PodEventType, role: Option<&str>) -> PodEvent {
    PodEvent {
        cluster_name: Some(NamespacedName::new("default", "acid-minimal")),
        pod_name: NamespacedName::new("default", pod),
        event_type,
        cur_pod: cluster_pod("acid-minimal", pod, role),
    }
}

/// One full pod replacement cycle as the reconciler observes it: the
/// deletion event, then the unlabelled replacement, then the role label.
#[tokio::test]
async fn pod_replacement_cycle() {
    let subscribers = PodSubscribers::default();
    let pod = NamespacedName::new("default", "acid-minimal-1");
    let mut subscription = subscribers.subscribe(pod.clone()).unwrap();

    subscribers.dispatch(&pod_event("acid-minimal-1", PodEventType::Delete, None));
    subscribers.dispatch(&pod_event("acid-minimal-1", PodEventType::Add, None));
    subscribers.dispatch(&pod_event(
        "acid-minimal-1",
        PodEventType::Update,
        Some("replica"),
    ));

    wait_for_pod_deletion(&mut subscription, Duration::from_secs(1))
        .await
        .unwrap();
    let role = wait_for_pod_label(&mut subscription, "spilo-role", None, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(role, PostgresRole::Replica);
}

/// A replacement that comes back as master is visible to the caller, which
/// ends the replica phase.
#[tokio::test]
async fn replacement_may_take_over_as_master() {
    let subscribers = PodSubscribers::default();
    let pod = NamespacedName::new("default", "acid-minimal-1");
    let mut subscription = subscribers.subscribe(pod.clone()).unwrap();

    subscribers.dispatch(&pod_event("acid-minimal-1", PodEventType::Delete, None));
    subscribers.dispatch(&pod_event(
        "acid-minimal-1",
        PodEventType::Update,
        Some("master"),
    ));

    wait_for_pod_deletion(&mut subscription, Duration::from_secs(1))
        .await
        .unwrap();
    let role = wait_for_pod_label(&mut subscription, "spilo-role", None, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(role, PostgresRole::Master);
}
