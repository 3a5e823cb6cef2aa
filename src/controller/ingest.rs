//! Custom-resource ingestion: the watch stream and the resync/repair
//! tickers.
//!
//! The watcher owns reconnection with backoff; every restart replays a
//! full list, which surfaces as synthetic Sync events. Live updates are
//! filtered against a small cache so no-op changes never reach a worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use futures::pin_mut;
use kube::ResourceExt;
use kube::runtime::watcher;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::controller::{Controller, EventType, specs_equal};
use crate::crd::Postgresql;

/// Watch the custom resource and convert raw watch events into typed
/// cluster events.
pub async fn run_postgresql_watcher(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let api = controller.postgresql_api();
    let stream = watcher(api, watcher::Config::default().any_semantic());
    pin_mut!(stream);

    // last seen object per UID, to tell Add from Update and to suppress
    // no-op updates
    let mut cache: HashMap<String, Postgresql> = HashMap::new();
    let mut relist_seen: HashSet<String> = HashSet::new();

    loop {
        let item = tokio::select! {
            _ = stop.changed() => return,
            item = stream.next() => item,
        };
        match item {
            None => return,
            Some(Err(e)) => {
                // the watcher reconnects with backoff on its own
                warn!("postgresql watch stream error: {e}");
            }
            Some(Ok(event)) => match event {
                watcher::Event::Init => {
                    relist_seen.clear();
                }
                watcher::Event::InitApply(pg) => {
                    let uid = pg.metadata.uid.clone().unwrap_or_default();
                    relist_seen.insert(uid.clone());
                    cache.insert(uid, pg.clone());
                    controller.queue_cluster_event(None, Some(pg), EventType::Sync);
                }
                watcher::Event::InitDone => {
                    // deletions missed while disconnected
                    let vanished: Vec<Postgresql> = cache
                        .iter()
                        .filter(|(uid, _)| !relist_seen.contains(*uid))
                        .map(|(_, pg)| pg.clone())
                        .collect();
                    cache.retain(|uid, _| relist_seen.contains(uid));
                    for pg in vanished {
                        controller.queue_cluster_event(Some(pg), None, EventType::Delete);
                    }
                }
                watcher::Event::Apply(pg) => {
                    let uid = pg.metadata.uid.clone().unwrap_or_default();
                    match cache.get(&uid) {
                        None => {
                            // we will not get multiple Add events for the
                            // same cluster
                            cache.insert(uid, pg.clone());
                            controller.queue_cluster_event(None, Some(pg), EventType::Add);
                        }
                        Some(old) => {
                            if specs_equal(old, &pg) {
                                debug!(
                                    cluster = %pg.name_any(),
                                    "suppressing a no-op update"
                                );
                                cache.insert(uid, pg);
                                continue;
                            }
                            let old = old.clone();
                            cache.insert(uid, pg.clone());
                            controller.queue_cluster_event(
                                Some(old),
                                Some(pg),
                                EventType::Update,
                            );
                        }
                    }
                }
                watcher::Event::Delete(pg) => {
                    let uid = pg.metadata.uid.clone().unwrap_or_default();
                    cache.remove(&uid);
                    controller.queue_cluster_event(Some(pg), None, EventType::Delete);
                }
            },
        }
    }
}

/// Enqueue a synthetic Sync for every listed cluster, every
/// `resync_period`.
pub async fn run_resync_ticker(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(controller.config.resync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }

        let api = controller.postgresql_api();
        match api.list(&Default::default()).await {
            Err(e) => error!("could not list clusters: {e}"),
            Ok(list) => {
                let count = list.items.len();
                if count == 0 {
                    info!("no clusters running");
                } else {
                    info!("there are {count} clusters running");
                }
                for pg in list {
                    controller.queue_cluster_event(None, Some(pg), EventType::Sync);
                }
            }
        }
    }
}

/// Enqueue a Sync only for clusters whose last reconcile errored, every
/// `repair_period`.
pub async fn run_repair_ticker(controller: Arc<Controller>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(controller.config.repair_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {}
        }

        let failed: Vec<Arc<crate::cluster::Cluster>> = {
            let clusters = controller.clusters.read().expect("cluster registry");
            clusters
                .values()
                .filter(|c| c.error().is_some())
                .cloned()
                .collect()
        };
        for cluster in failed {
            debug!(cluster = %cluster.cluster_name, "repairing a failed cluster");
            controller.queue_cluster_event(
                None,
                Some(cluster.manifest_snapshot()),
                EventType::Sync,
            );
        }
    }
}
