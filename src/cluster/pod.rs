//! Pod lifecycle: subscriber channels, delete-and-wait, the rolling-update
//! algorithm and node-drain migrations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams};
use kube::ResourceExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterError, Result};
use crate::resources::common::PostgresRole;
use crate::util::NamespacedName;
use crate::util::retry::retry;

/// Capacity of one pod subscriber channel; late events past it are dropped.
const SUBSCRIBER_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodEventType {
    Add,
    Update,
    Delete,
}

/// A pod watch event routed to the owning cluster.
#[derive(Clone, Debug)]
pub struct PodEvent {
    pub cluster_name: Option<NamespacedName>,
    pub pod_name: NamespacedName,
    pub event_type: PodEventType,
    pub cur_pod: Pod,
}

type SubscriberMap = HashMap<NamespacedName, mpsc::Sender<PodEvent>>;

/// Per-cluster registry of pod subscribers. At most one subscriber exists
/// per pod; registration is released unconditionally when the subscription
/// guard drops, so an errored reconcile cannot leak it.
#[derive(Default)]
pub struct PodSubscribers {
    inner: Arc<StdMutex<SubscriberMap>>,
}

impl PodSubscribers {
    /// Subscribe to one pod's events for the duration of a wait.
    pub fn subscribe(&self, pod_name: NamespacedName) -> Result<PodSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut map = self.inner.lock().expect("pod subscribers");
        if map.contains_key(&pod_name) {
            return Err(ClusterError::Reconcile(format!(
                "pod {pod_name} is already subscribed"
            )));
        }
        map.insert(pod_name.clone(), tx);
        Ok(PodSubscription {
            pod_name,
            receiver: rx,
            registry: Arc::clone(&self.inner),
        })
    }

    /// Deliver an event to the pod's subscriber, if any. Orphaned events
    /// are dropped without fuss.
    pub fn dispatch(&self, event: &PodEvent) {
        let sender = {
            let map = self.inner.lock().expect("pod subscribers");
            map.get(&event.pod_name).cloned()
        };
        if let Some(sender) = sender
            && sender.try_send(event.clone()).is_err()
        {
            debug!(pod = %event.pod_name, "dropping pod event for a slow subscriber");
        }
    }
}

/// RAII subscription; dropping it removes the registry entry.
pub struct PodSubscription {
    pod_name: NamespacedName,
    receiver: mpsc::Receiver<PodEvent>,
    registry: Arc<StdMutex<SubscriberMap>>,
}

impl PodSubscription {
    pub async fn recv(&mut self) -> Option<PodEvent> {
        self.receiver.recv().await
    }
}

impl Drop for PodSubscription {
    fn drop(&mut self) {
        self.registry
            .lock()
            .expect("pod subscribers")
            .remove(&self.pod_name);
    }
}

/// Deletion order of a rolling update: replicas in name order first, the
/// master (at most one) last. Two masters mean the cluster is in a state
/// no rolling update should touch.
pub fn rolling_update_order(
    pods: &[Pod],
    pod_role_label: &str,
) -> Result<(Vec<NamespacedName>, Option<NamespacedName>)> {
    let mut master: Option<NamespacedName> = None;
    let mut replicas: Vec<NamespacedName> = Vec::new();
    for pod in pods {
        let role = pod
            .labels()
            .get(pod_role_label)
            .and_then(|v| PostgresRole::from_label(v));
        match role {
            Some(PostgresRole::Master) => {
                if master.is_some() {
                    return Err(ClusterError::Reconcile("too many master pods".to_string()));
                }
                master = Some(NamespacedName::from_object(pod));
            }
            _ => replicas.push(NamespacedName::from_object(pod)),
        }
    }
    replicas.sort();
    Ok((replicas, master))
}

/// Wait until the subscription observes the pod's deletion.
pub async fn wait_for_pod_deletion(
    subscription: &mut PodSubscription,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(e) if e.event_type == PodEventType::Delete => return Ok(()),
                Some(_) => {}
                None => return Err(ClusterError::Reconcile(
                    "pod event channel closed while waiting for deletion".to_string(),
                )),
            },
            _ = &mut deadline => {
                return Err(ClusterError::Timeout("pod deletion wait timeout".to_string()));
            }
        }
    }
}

/// Wait until the replacement pod carries a role label. With a target role
/// the wait continues until that exact role appears; without one, any role
/// ends the wait and is returned.
pub async fn wait_for_pod_label(
    subscription: &mut PodSubscription,
    pod_role_label: &str,
    target: Option<PostgresRole>,
    timeout: Duration,
) -> Result<PostgresRole> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(e) => {
                    let role = e
                        .cur_pod
                        .labels()
                        .get(pod_role_label)
                        .and_then(|v| PostgresRole::from_label(v));
                    if let Some(role) = role {
                        match target {
                            None => return Ok(role),
                            Some(t) if t == role => return Ok(role),
                            Some(_) => {}
                        }
                    }
                }
                None => return Err(ClusterError::Reconcile(
                    "pod event channel closed while waiting for the role label".to_string(),
                )),
            },
            _ = &mut deadline => {
                return Err(ClusterError::Timeout("pod label wait timeout".to_string()));
            }
        }
    }
}

impl Cluster {
    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.cluster_name.namespace)
    }

    /// Route an incoming pod event to the waiting subscriber, if any.
    pub fn receive_pod_event(&self, event: &PodEvent) {
        self.pod_subscribers.dispatch(event);
    }

    pub(crate) fn pod_role(&self, pod: &Pod) -> Option<PostgresRole> {
        pod.labels()
            .get(&self.config.pod_role_label)
            .and_then(|v| PostgresRole::from_label(v))
    }

    /// Pods carrying this cluster's labels.
    pub(crate) async fn list_pods(&self) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&self.label_selector());
        Ok(self.pods_api().list(&lp).await?.items)
    }

    /// Delete a pod and wait for its replacement to pick up a role label.
    /// Returns the replacement's role.
    pub(crate) async fn recreate_pod(&self, pod_name: &NamespacedName) -> Result<PostgresRole> {
        let mut subscription = self.pod_subscribers.subscribe(pod_name.clone())?;
        self.pods_api()
            .delete(&pod_name.name, &DeleteParams::default())
            .await?;
        wait_for_pod_deletion(&mut subscription, self.config.pod_deletion_wait_timeout).await?;
        let role = wait_for_pod_label(
            &mut subscription,
            &self.config.pod_role_label,
            None,
            self.config.pod_label_wait_timeout,
        )
        .await?;
        info!(cluster = %self.cluster_name, pod = %pod_name, "pod is ready");
        Ok(role)
    }

    /// Rolling update: replicas first in name order, then a switchover away
    /// from the master, then the old master pod.
    pub(crate) async fn recreate_pods(&self) -> Result<()> {
        let pods = self.list_pods().await?;
        info!(
            cluster = %self.cluster_name,
            "there are {} pods in the cluster to recreate",
            pods.len()
        );

        let (replicas, master) = rolling_update_order(&pods, &self.config.pod_role_label)?;

        let mut replaced: Vec<NamespacedName> = Vec::new();
        let mut new_master_emerged = false;
        for pod_name in &replicas {
            info!(cluster = %self.cluster_name, pod = %pod_name, "deleting replica pod");
            let role = self.recreate_pod(pod_name).await?;
            replaced.push(pod_name.clone());
            if role == PostgresRole::Master {
                info!(
                    cluster = %self.cluster_name,
                    pod = %pod_name,
                    "replacement pod took over as master, ending the replica phase"
                );
                new_master_emerged = true;
                break;
            }
        }

        match master {
            None => warn!(cluster = %self.cluster_name, "no master pod in the cluster"),
            Some(master_name) => {
                if !new_master_emerged {
                    if let Some(candidate) = replaced.first() {
                        self.switchover(&master_name, candidate).await?;
                    } else {
                        warn!(
                            cluster = %self.cluster_name,
                            "no replicas to switch over to, master will fail over on deletion"
                        );
                    }
                }
                info!(cluster = %self.cluster_name, pod = %master_name, "deleting master pod");
                self.recreate_pod(&master_name).await?;
            }
        }

        Ok(())
    }

    /// Controlled master handover, delegated to the management endpoint
    /// inside the master pod.
    pub(crate) async fn switchover(
        &self,
        master: &NamespacedName,
        candidate: &NamespacedName,
    ) -> Result<()> {
        info!(
            cluster = %self.cluster_name,
            master = %master,
            candidate = %candidate,
            "switching over the master"
        );
        let command = vec![
            "patronictl".to_string(),
            "switchover".to_string(),
            self.cluster_name.name.clone(),
            "--master".to_string(),
            master.name.clone(),
            "--candidate".to_string(),
            candidate.name.clone(),
            "--force".to_string(),
        ];
        let output = self.exec_in_pod(&master.name, command).await?;
        debug!(cluster = %self.cluster_name, "switchover output: {output}");
        Ok(())
    }

    async fn exec_in_pod(&self, pod_name: &str, command: Vec<String>) -> Result<String> {
        let ap = AttachParams {
            container: Some("postgres".to_string()),
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut attached = self.pods_api().exec(pod_name, command, &ap).await?;

        let mut stdout = String::new();
        if let Some(mut out) = attached.stdout() {
            let mut buf = Vec::new();
            out.read_to_end(&mut buf)
                .await
                .map_err(|e| ClusterError::Reconcile(format!("exec read failed: {e}")))?;
            stdout = String::from_utf8_lossy(&buf).to_string();
        }
        let mut stderr = String::new();
        if let Some(mut err) = attached.stderr() {
            let mut buf = Vec::new();
            err.read_to_end(&mut buf)
                .await
                .map_err(|e| ClusterError::Reconcile(format!("exec read failed: {e}")))?;
            stderr = String::from_utf8_lossy(&buf).to_string();
        }

        if let Some(status_future) = attached.take_status() {
            if let Some(status) = status_future.await {
                if status.status.as_deref() != Some("Success") {
                    let message = if stderr.is_empty() {
                        format!("command failed with status {:?}", status.status)
                    } else {
                        stderr
                    };
                    return Err(ClusterError::Reconcile(message));
                }
            }
        }

        Ok(stdout)
    }

    /// Move a replica pod off a draining node: delete it and wait for the
    /// replacement, which node affinity keeps away from unready nodes.
    pub async fn migrate_replica_pod(
        &self,
        pod_name: NamespacedName,
        from_node: &str,
    ) -> Result<()> {
        info!(
            cluster = %self.cluster_name,
            pod = %pod_name,
            node = %from_node,
            "migrating replica pod off the node"
        );
        self.recreate_pod(&pod_name).await?;
        Ok(())
    }

    /// Move the master off a draining node: switch over to a replica on a
    /// different node, then recreate the old master pod.
    pub async fn migrate_master_pod(&self, pod_name: NamespacedName) -> Result<()> {
        let pods = self.list_pods().await?;
        let draining_node = pods
            .iter()
            .find(|p| NamespacedName::from_object(*p) == pod_name)
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.node_name.clone());

        let candidate = pods
            .iter()
            .filter(|p| self.pod_role(p) == Some(PostgresRole::Replica))
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_ref()) != draining_node.as_ref()
            })
            .min_by_key(|p| p.name_any())
            .map(|p| NamespacedName::from_object(p));

        let Some(candidate) = candidate else {
            return Err(ClusterError::Reconcile(format!(
                "could not migrate master pod {pod_name}: no replica on another node"
            )));
        };

        self.switchover(&pod_name, &candidate).await?;
        self.recreate_pod(&pod_name).await?;
        Ok(())
    }

    /// Wait for the statefulset to report all replicas, then for the role
    /// labels to converge: at most one master, the rest replicas. A cluster
    /// where no pod claims master within the wait is flagged master-less
    /// rather than failed.
    pub(crate) async fn wait_statefulset_pods_ready(&self) -> Result<()> {
        let manifest = self.manifest();
        let info = crate::resources::common::ClusterInfo::new(&manifest, &self.config);
        let sts_api: Api<k8s_openapi::api::apps::v1::StatefulSet> =
            Api::namespaced(self.client.clone(), &info.namespace());
        let name = info.statefulset_name();

        retry(
            self.config.resource_check_interval,
            self.config.resource_check_timeout,
            || {
                let sts_api = sts_api.clone();
                let name = name.clone();
                async move {
                    let Some(sts) = sts_api.get_opt(&name).await? else {
                        return Ok(false);
                    };
                    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                    let actual = sts.status.as_ref().map(|s| s.replicas).unwrap_or(0);
                    Ok::<_, kube::Error>(desired == actual)
                }
            },
        )
        .await?;

        self.wait_pod_labels_ready().await
    }

    async fn wait_pod_labels_ready(&self) -> Result<()> {
        let total = self.list_pods().await?.len();
        let interval = self.config.resource_check_interval;
        let deadline = tokio::time::Instant::now() + self.config.pod_label_wait_timeout;
        let mut master_less = false;

        loop {
            let pods = self.list_pods().await?;
            let masters = pods
                .iter()
                .filter(|p| self.pod_role(p) == Some(PostgresRole::Master))
                .count();
            let replicas = pods
                .iter()
                .filter(|p| self.pod_role(p) == Some(PostgresRole::Replica))
                .count();

            if masters > 1 {
                return Err(ClusterError::Reconcile("too many masters".to_string()));
            }
            if total > 0 && replicas == total {
                master_less = true;
                break;
            }
            if masters + replicas == total {
                break;
            }
            if tokio::time::Instant::now() + interval > deadline {
                // no master within the wait: flag the cluster, don't fail,
                // unless no pod picked up any label at all
                if masters + replicas == 0 {
                    return Err(ClusterError::Timeout("pod label wait timeout".to_string()));
                }
                master_less = masters == 0;
                break;
            }
            tokio::time::sleep(interval).await;
        }

        if master_less {
            warn!(cluster = %self.cluster_name, "no master pod in the cluster");
        }
        self.state.lock().expect("cluster state").master_less = master_less;
        Ok(())
    }

    /// Remove the cluster's volume claims so a future same-named cluster
    /// starts from scratch.
    pub(crate) async fn delete_persistent_volume_claims(&self) -> Result<()> {
        let api: Api<k8s_openapi::api::core::v1::PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.cluster_name.namespace);
        let lp = ListParams::default().labels(&self.label_selector());
        for pvc in api.list(&lp).await? {
            debug!(cluster = %self.cluster_name, pvc = %pvc.name_any(), "deleting PVC");
            if let Err(e) = api.delete(&pvc.name_any(), &DeleteParams::default()).await {
                warn!(cluster = %self.cluster_name, "could not delete PVC: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_event(pod: &str, event_type: PodEventType, labels: &[(&str, &str)]) -> PodEvent {
        let mut pod_obj = Pod::default();
        pod_obj.metadata.name = Some(pod.to_string());
        pod_obj.metadata.namespace = Some("default".to_string());
        pod_obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        PodEvent {
            cluster_name: Some(NamespacedName::new("default", "acid-test")),
            pod_name: NamespacedName::new("default", pod),
            event_type,
            cur_pod: pod_obj,
        }
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let _first = subscribers.subscribe(pod.clone()).unwrap();
        assert!(subscribers.subscribe(pod).is_err());
    }

    #[test]
    fn dropping_the_subscription_unregisters() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        {
            let _sub = subscribers.subscribe(pod.clone()).unwrap();
        }
        // the slot is free again
        assert!(subscribers.subscribe(pod).is_ok());
    }

    #[tokio::test]
    async fn dispatch_reaches_the_subscriber() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let mut sub = subscribers.subscribe(pod.clone()).unwrap();

        subscribers.dispatch(&pod_event("acid-test-0", PodEventType::Delete, &[]));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, PodEventType::Delete);
    }

    #[test]
    fn orphan_events_are_dropped() {
        let subscribers = PodSubscribers::default();
        // no subscriber registered; must not panic
        subscribers.dispatch(&pod_event("acid-test-9", PodEventType::Add, &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_wait_ignores_other_events() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let mut sub = subscribers.subscribe(pod.clone()).unwrap();

        subscribers.dispatch(&pod_event("acid-test-0", PodEventType::Update, &[]));
        subscribers.dispatch(&pod_event("acid-test-0", PodEventType::Delete, &[]));

        wait_for_pod_deletion(&mut sub, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_wait_times_out() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let mut sub = subscribers.subscribe(pod.clone()).unwrap();

        let err = wait_for_pod_deletion(&mut sub, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn label_wait_returns_the_observed_role() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let mut sub = subscribers.subscribe(pod.clone()).unwrap();

        subscribers.dispatch(&pod_event("acid-test-0", PodEventType::Update, &[]));
        subscribers.dispatch(&pod_event(
            "acid-test-0",
            PodEventType::Update,
            &[("spilo-role", "replica")],
        ));

        let role = wait_for_pod_label(&mut sub, "spilo-role", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(role, PostgresRole::Replica);
    }

    #[tokio::test(start_paused = true)]
    async fn label_wait_with_target_skips_other_roles() {
        let subscribers = PodSubscribers::default();
        let pod = NamespacedName::new("default", "acid-test-0");
        let mut sub = subscribers.subscribe(pod.clone()).unwrap();

        subscribers.dispatch(&pod_event(
            "acid-test-0",
            PodEventType::Update,
            &[("spilo-role", "replica")],
        ));
        subscribers.dispatch(&pod_event(
            "acid-test-0",
            PodEventType::Update,
            &[("spilo-role", "master")],
        ));

        let role = wait_for_pod_label(
            &mut sub,
            "spilo-role",
            Some(PostgresRole::Master),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(role, PostgresRole::Master);
    }
}
