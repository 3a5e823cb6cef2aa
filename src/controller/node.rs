//! Node-drain handler.
//!
//! A node that turns unschedulable and loses its readiness label gets its
//! cluster pods migrated away, replicas by recreation and masters by
//! switchover, with per-cluster locks taken in deterministic order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use futures::pin_mut;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::controller::Controller;
use crate::util::{NamespacedName, map_contains};

fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Drain trigger: the node just turned unschedulable while not carrying
/// the readiness label. Nodes labelled `master: "true"` are exempt.
pub fn node_needs_drain(
    readiness_label: &BTreeMap<String, String>,
    prev: &Node,
    cur: &Node,
) -> bool {
    let master_node = BTreeMap::from([("master".to_string(), "true".to_string())]);
    if map_contains(&node_labels(cur), &master_node) {
        return false;
    }
    // skip nodes that should have already triggered a drain, and nodes
    // where only one of the two criteria holds
    if is_unschedulable(prev) && !map_contains(&node_labels(prev), readiness_label) {
        return false;
    }
    is_unschedulable(cur) && !map_contains(&node_labels(cur), readiness_label)
}

impl Controller {
    /// Migrate every cluster pod off the draining node. Failures are
    /// counted and logged; the handler does not retry, the next resync
    /// will.
    pub(crate) async fn move_pods_off_node(&self, node: &Node) {
        let node_name = node.name_any();
        info!(
            node = %node_name,
            "moving pods: node became unschedulable and does not have a ready label: {:?}",
            self.config.node_readiness_label
        );

        let selector = self
            .config
            .cluster_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods_api: Api<Pod> = if self.config.watches_all_namespaces() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.watched_namespace)
        };
        let pod_list = match pods_api
            .list(&ListParams::default().labels(&selector))
            .await
        {
            Ok(list) => list.items,
            Err(e) => {
                error!("could not fetch the list of pods: {e}");
                return;
            }
        };

        let node_pods: Vec<Pod> = pod_list
            .into_iter()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name.as_str())
            })
            .collect();
        let total_pods = node_pods.len();

        let mut master_pods: Vec<(NamespacedName, Arc<Cluster>)> = Vec::new();
        let mut replica_pods: Vec<(NamespacedName, Arc<Cluster>)> = Vec::new();
        let mut involved: HashMap<NamespacedName, Arc<Cluster>> = HashMap::new();
        let mut moved_pods = 0usize;

        for pod in &node_pods {
            let pod_name = NamespacedName::from_object(pod);
            let Some(role) = pod.labels().get(&self.config.pod_role_label) else {
                warn!(pod = %pod_name, "could not move pod: pod has no role");
                continue;
            };

            let Some(cluster_name) = self.pod_cluster_name(pod) else {
                warn!(pod = %pod_name, "could not move pod: pod has no cluster label");
                continue;
            };
            let Some(cluster) = self.cluster(&cluster_name) else {
                warn!(
                    pod = %pod_name,
                    "could not move pod: pod does not belong to a known cluster"
                );
                continue;
            };

            moved_pods += 1;
            involved.insert(cluster_name, Arc::clone(&cluster));
            if role == "master" {
                master_pods.push((pod_name, cluster));
            } else {
                replica_pods.push((pod_name, cluster));
            }
        }

        // lock the involved clusters in deterministic order
        let mut ordered: Vec<(NamespacedName, Arc<Cluster>)> = involved.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        let mut guards = Vec::with_capacity(ordered.len());
        for (name, cluster) in &ordered {
            debug!(cluster = %name, "locking cluster for the node drain");
            // the guard borrows the Arc we keep in `ordered`
            guards.push(cluster.lock().await);
        }

        for (pod_name, cluster) in &master_pods {
            if let Err(e) = cluster.migrate_master_pod(pod_name.clone()).await {
                error!(pod = %pod_name, "could not move master pod: {e}");
                moved_pods -= 1;
            }
        }
        for (pod_name, cluster) in &replica_pods {
            if let Err(e) = cluster
                .migrate_replica_pod(pod_name.clone(), &node_name)
                .await
            {
                error!(pod = %pod_name, "could not move replica pod: {e}");
                moved_pods -= 1;
            }
        }

        drop(guards);

        info!(
            node = %node_name,
            "{moved_pods}/{total_pods} pods have been moved out from the node"
        );
        let left_pods = total_pods - moved_pods;
        if left_pods > 0 {
            warn!(
                node = %node_name,
                "could not move {left_pods}/{total_pods} pods from the node"
            );
        }
    }
}

/// Watch nodes and fire the drain handler on the unschedulable
/// transition.
pub async fn run_node_watcher(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let api: Api<Node> = Api::all(controller.client.clone());
    let stream = watcher(api, watcher::Config::default().any_semantic());
    pin_mut!(stream);

    let mut cache: HashMap<String, Node> = HashMap::new();

    loop {
        let item = tokio::select! {
            _ = stop.changed() => return,
            item = stream.next() => item,
        };
        match item {
            None => return,
            Some(Err(e)) => warn!("node watch stream error: {e}"),
            Some(Ok(event)) => match event {
                watcher::Event::Init | watcher::Event::InitDone => {}
                watcher::Event::InitApply(node) => {
                    let uid = node.metadata.uid.clone().unwrap_or_default();
                    cache.insert(uid, node);
                }
                watcher::Event::Apply(node) => {
                    let uid = node.metadata.uid.clone().unwrap_or_default();
                    let prev = cache.insert(uid, node.clone());
                    if let Some(prev) = prev {
                        if node_needs_drain(&controller.config.node_readiness_label, &prev, &node)
                        {
                            controller.move_pods_off_node(&node).await;
                        }
                    } else {
                        debug!(node = %node.name_any(), "new node has been added");
                    }
                }
                watcher::Event::Delete(node) => {
                    let uid = node.metadata.uid.clone().unwrap_or_default();
                    cache.remove(&uid);
                    debug!(node = %node.name_any(), "node has been deleted");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(unschedulable: bool, labels: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        });
        node
    }

    fn readiness() -> BTreeMap<String, String> {
        BTreeMap::from([("lifecycle-status".to_string(), "ready".to_string())])
    }

    #[test]
    fn drain_fires_on_the_unschedulable_transition() {
        let prev = node(false, &[("lifecycle-status", "ready")]);
        let cur = node(true, &[]);
        assert!(node_needs_drain(&readiness(), &prev, &cur));
    }

    #[test]
    fn drain_skips_nodes_that_stay_ready() {
        // cordoned but still carrying the readiness label
        let prev = node(false, &[("lifecycle-status", "ready")]);
        let cur = node(true, &[("lifecycle-status", "ready")]);
        assert!(!node_needs_drain(&readiness(), &prev, &cur));

        // not cordoned at all
        let cur = node(false, &[]);
        assert!(!node_needs_drain(&readiness(), &prev, &cur));
    }

    #[test]
    fn drain_skips_already_draining_nodes() {
        let prev = node(true, &[]);
        let cur = node(true, &[]);
        assert!(!node_needs_drain(&readiness(), &prev, &cur));
    }

    #[test]
    fn drain_exempts_master_nodes() {
        let prev = node(false, &[("lifecycle-status", "ready"), ("master", "true")]);
        let cur = node(true, &[("master", "true")]);
        assert!(!node_needs_drain(&readiness(), &prev, &cur));
    }
}
