//! Pod watch stream, fanned out to the owning cluster's subscribers.

use std::sync::Arc;

use futures::StreamExt;
use futures::pin_mut;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cluster::pod::{PodEvent, PodEventType};
use crate::controller::Controller;
use crate::util::NamespacedName;

impl Controller {
    fn pods_api(&self) -> Api<Pod> {
        if self.config.watches_all_namespaces() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.watched_namespace)
        }
    }

    /// The cluster a pod belongs to, derived from the cluster name label.
    pub(crate) fn pod_cluster_name(&self, pod: &Pod) -> Option<NamespacedName> {
        let name = pod.labels().get(&self.config.cluster_name_label)?;
        Some(NamespacedName::new(
            &pod.namespace().unwrap_or_else(|| "default".to_string()),
            name,
        ))
    }

    fn route_pod_event(&self, pod: Pod, event_type: PodEventType) {
        let Some(cluster_name) = self.pod_cluster_name(&pod) else {
            return;
        };
        let Some(cluster) = self.cluster(&cluster_name) else {
            return;
        };
        let event = PodEvent {
            cluster_name: Some(cluster_name.clone()),
            pod_name: NamespacedName::from_object(&pod),
            event_type,
            cur_pod: pod,
        };
        debug!(
            cluster = %cluster_name,
            pod = %event.pod_name,
            "routing {event_type:?} pod event to the cluster"
        );
        cluster.receive_pod_event(&event);
    }
}

/// Watch pods carrying the operator's cluster labels and deliver their
/// events to whichever cluster wait is subscribed.
pub async fn run_pod_watcher(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let selector = controller
        .config
        .cluster_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let stream = watcher(
        controller.pods_api(),
        watcher::Config::default().labels(&selector).any_semantic(),
    );
    pin_mut!(stream);

    loop {
        let item = tokio::select! {
            _ = stop.changed() => return,
            item = stream.next() => item,
        };
        match item {
            None => return,
            Some(Err(e)) => warn!("pod watch stream error: {e}"),
            Some(Ok(event)) => match event {
                watcher::Event::Init | watcher::Event::InitDone => {}
                watcher::Event::InitApply(pod) => {
                    controller.route_pod_event(pod, PodEventType::Add);
                }
                watcher::Event::Apply(pod) => {
                    controller.route_pod_event(pod, PodEventType::Update);
                }
                watcher::Event::Delete(pod) => {
                    controller.route_pod_event(pod, PodEventType::Delete);
                }
            },
        }
    }
}
