//! Dispatcher and worker pool.
//!
//! Each worker owns one FIFO queue. Queue keys are `(event_type, uid)`:
//! a newer event with the same key replaces the queued one, a Delete
//! flushes everything queued for its cluster first. Workers pop serially,
//! which together with the stable cluster-to-worker hash gives strict
//! per-cluster ordering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::controller::{ClusterEvent, Controller, EventType};

#[derive(Default)]
pub struct WorkerQueue {
    events: Mutex<VecDeque<ClusterEvent>>,
    notify: Notify,
}

impl WorkerQueue {
    /// Enqueue with coalescing: same `(event_type, uid)` replaces in
    /// place; a Delete drops every earlier event of the cluster.
    pub fn add(&self, event: ClusterEvent) {
        {
            let mut events = self.events.lock().expect("worker queue");
            match event.event_type {
                EventType::Delete => {
                    events.retain(|e| e.uid != event.uid);
                    events.push_back(event);
                }
                _ => {
                    let key = (event.event_type, event.uid.clone());
                    match events
                        .iter_mut()
                        .find(|e| (e.event_type, e.uid.clone()) == key)
                    {
                        Some(existing) => *existing = event,
                        None => events.push_back(event),
                    }
                }
            }
        }
        self.notify.notify_one();
    }

    /// Wait for the next event.
    pub async fn pop(&self) -> ClusterEvent {
        loop {
            if let Some(event) = self.events.lock().expect("worker queue").pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().expect("worker queue").is_empty()
    }

    /// Snapshot of the queued keys and events, for the debug interface.
    pub fn dump(&self) -> Vec<ClusterEvent> {
        self.events.lock().expect("worker queue").iter().cloned().collect()
    }
}

/// One worker: pop, process, recover from panics, repeat until shutdown.
pub async fn worker_loop(
    controller: Arc<Controller>,
    worker_id: u32,
    mut stop: watch::Receiver<bool>,
) {
    let queue = Arc::clone(&controller.queues[worker_id as usize]);
    loop {
        let event = tokio::select! {
            _ = stop.changed() => {
                debug!(worker = worker_id, "worker shutting down");
                return;
            }
            event = queue.pop() => event,
        };

        let cluster_name = event.cluster_name.clone();
        let processing = std::panic::AssertUnwindSafe(controller.process_event(event));
        if let Err(panic) = processing.catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                worker = worker_id,
                cluster = %cluster_name,
                "panic while processing cluster event, dropping it: {message}"
            );
            controller.publish_progress(
                worker_id,
                &cluster_name,
                "error",
                format!("panic while processing event: {message}"),
            );
        }
    }
}

impl Controller {
    /// Run one event through the per-cluster state machine.
    pub(crate) async fn process_event(self: &Arc<Self>, event: ClusterEvent) {
        let worker = event.worker_id;
        let cluster_name = event.cluster_name.clone();
        let existing = self.cluster(&cluster_name);

        match event.event_type {
            EventType::Add => {
                if existing.is_some() {
                    debug!(cluster = %cluster_name, "cluster already exists");
                    return;
                }
                let Some(new_spec) = event.new_spec else {
                    return;
                };
                info!(worker, cluster = %cluster_name, "creation of the cluster started");
                self.publish_progress(worker, &cluster_name, "info", "creation started");

                let cluster = self.register_cluster(*new_spec);
                match cluster.create().await {
                    Ok(()) => {
                        info!(worker, cluster = %cluster_name, "cluster has been created");
                        self.publish_progress(worker, &cluster_name, "info", "cluster created");
                    }
                    Err(e) => {
                        error!(worker, cluster = %cluster_name, "could not create cluster: {e}");
                        self.publish_progress(
                            worker,
                            &cluster_name,
                            "error",
                            format!("could not create cluster: {e}"),
                        );
                    }
                }
            }
            EventType::Update => {
                let Some(cluster) = existing else {
                    warn!(cluster = %cluster_name, "cluster does not exist");
                    return;
                };
                let Some(new_spec) = event.new_spec else {
                    return;
                };
                info!(worker, cluster = %cluster_name, "update of the cluster started");
                self.record_history(&cluster_name, event.old_spec.as_deref(), &new_spec);

                match cluster.update(*new_spec).await {
                    Ok(()) => {
                        info!(worker, cluster = %cluster_name, "cluster has been updated");
                        self.publish_progress(worker, &cluster_name, "info", "cluster updated");
                    }
                    Err(e) => {
                        error!(worker, cluster = %cluster_name, "could not update cluster: {e}");
                        self.publish_progress(
                            worker,
                            &cluster_name,
                            "error",
                            format!("could not update cluster: {e}"),
                        );
                    }
                }
            }
            EventType::Sync => {
                let Some(new_spec) = event.new_spec else {
                    return;
                };
                info!(worker, cluster = %cluster_name, "syncing of the cluster started");
                let cluster = match existing {
                    Some(cluster) => cluster,
                    // no race here, a cluster is always processed by a
                    // single worker
                    None => self.register_cluster((*new_spec).clone()),
                };

                match cluster.sync(*new_spec).await {
                    Ok(()) => {
                        info!(worker, cluster = %cluster_name, "cluster has been synced");
                        self.publish_progress(worker, &cluster_name, "info", "cluster synced");
                    }
                    Err(e) => {
                        error!(worker, cluster = %cluster_name, "could not sync cluster: {e}");
                        self.publish_progress(
                            worker,
                            &cluster_name,
                            "error",
                            format!("could not sync cluster: {e}"),
                        );
                    }
                }
            }
            EventType::Delete => {
                let Some(cluster) = existing else {
                    error!(cluster = %cluster_name, "unknown cluster");
                    return;
                };
                info!(worker, cluster = %cluster_name, "deletion of the cluster started");
                let team = cluster.team_id();

                match cluster.delete().await {
                    Ok(()) => {
                        self.unregister_cluster(&cluster_name, &team);
                        info!(worker, cluster = %cluster_name, "cluster has been deleted");
                    }
                    Err(e) => {
                        error!(worker, cluster = %cluster_name, "could not delete cluster: {e}");
                        self.publish_progress(
                            worker,
                            &cluster_name,
                            "error",
                            format!("could not delete cluster: {e}"),
                        );
                    }
                }
            }
        }
    }

    /// Keep a structural diff of every accepted spec change in the
    /// cluster's history ring.
    fn record_history(
        &self,
        cluster_name: &crate::util::NamespacedName,
        old: Option<&crate::crd::Postgresql>,
        new: &crate::crd::Postgresql,
    ) {
        let Some(history) = self
            .cluster_history
            .read()
            .expect("cluster history")
            .get(cluster_name)
            .cloned()
        else {
            return;
        };
        let diff = match old {
            Some(old) => crate::util::pretty_diff(&old.spec, &new.spec),
            None => String::new(),
        };
        history.insert(
            crate::util::ringlog::LogEntry::new("info", format!("spec changed\n{diff}"))
                .with_cluster(cluster_name.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::util::NamespacedName;

    fn event(event_type: EventType, uid: &str) -> ClusterEvent {
        ClusterEvent {
            event_type,
            uid: uid.to_string(),
            cluster_name: NamespacedName::new("default", "acid-test"),
            old_spec: None,
            new_spec: None,
            worker_id: 0,
        }
    }

    #[test]
    fn same_key_events_coalesce() {
        let queue = WorkerQueue::default();
        queue.add(event(EventType::Sync, "uid-1"));
        queue.add(event(EventType::Sync, "uid-1"));
        queue.add(event(EventType::Add, "uid-1"));
        assert_eq!(queue.dump().len(), 2);
    }

    #[test]
    fn delete_flushes_earlier_events() {
        let queue = WorkerQueue::default();
        queue.add(event(EventType::Add, "uid-1"));
        queue.add(event(EventType::Update, "uid-1"));
        queue.add(event(EventType::Sync, "uid-2"));
        queue.add(event(EventType::Delete, "uid-1"));

        let dump = queue.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].uid, "uid-2");
        assert_eq!(dump[1].event_type, EventType::Delete);
        assert_eq!(dump[1].uid, "uid-1");
    }

    #[tokio::test]
    async fn pop_preserves_fifo_order() {
        let queue = WorkerQueue::default();
        queue.add(event(EventType::Add, "uid-1"));
        queue.add(event(EventType::Sync, "uid-2"));

        assert_eq!(queue.pop().await.uid, "uid-1");
        assert_eq!(queue.pop().await.uid, "uid-2");
        assert!(queue.is_empty());
    }
}
