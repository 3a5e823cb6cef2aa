//! Operator controller: cluster registry, event queues and background
//! tasks (watchers, tickers, workers, drain handler, debug API).

pub mod dispatch;
pub mod ingest;
pub mod node;
pub mod pod;
pub mod status;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::ResourceExt;
use kube::api::Api;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::cluster::users::{PgUserMap, parse_infrastructure_roles};
use crate::config::Config;
use crate::controller::dispatch::WorkerQueue;
use crate::crd::Postgresql;
use crate::teams::{DisabledTeamsApi, HttpTeamsApi, TeamsApi};
use crate::util::ringlog::RingLog;
use crate::util::{NamespacedName, cluster_worker_id};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Add,
    Update,
    Delete,
    Sync,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Add => "ADD",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Sync => "SYNC",
        };
        f.write_str(s)
    }
}

/// One unit of work for a worker, keyed by `(event_type, uid)` in its
/// queue.
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub event_type: EventType,
    pub uid: String,
    pub cluster_name: NamespacedName,
    pub old_spec: Option<Box<Postgresql>>,
    pub new_spec: Option<Box<Postgresql>>,
    pub worker_id: u32,
}

/// The long-running operator state shared by every background task.
pub struct Controller {
    pub(crate) client: Client,
    pub(crate) config: Arc<Config>,
    teams_api: Arc<dyn TeamsApi>,
    infrastructure_roles: PgUserMap,

    pub(crate) clusters: RwLock<HashMap<NamespacedName, Arc<Cluster>>>,
    pub(crate) team_clusters: RwLock<HashMap<String, Vec<NamespacedName>>>,
    pub(crate) cluster_logs: RwLock<HashMap<NamespacedName, Arc<RingLog>>>,
    pub(crate) cluster_history: RwLock<HashMap<NamespacedName, Arc<RingLog>>>,
    pub(crate) worker_logs: Vec<Arc<RingLog>>,
    pub(crate) queues: Vec<Arc<WorkerQueue>>,
}

impl Controller {
    /// Build the controller: resolve the teams client and read the
    /// infrastructure-roles secret once.
    pub async fn new(client: Client, config: Config) -> Result<Arc<Self>, crate::OperatorError> {
        let config = Arc::new(config);

        let teams_api: Arc<dyn TeamsApi> = if config.enable_teams_api {
            Arc::new(HttpTeamsApi::new(
                config.teams_api_url.clone(),
                config.oauth_token_secret_name.clone(),
                client.clone(),
            ))
        } else {
            Arc::new(DisabledTeamsApi)
        };

        let infrastructure_roles = match &config.infrastructure_roles_secret_name {
            None => PgUserMap::new(),
            Some(secret_name) => {
                let api: Api<Secret> = Api::namespaced(client.clone(), &secret_name.namespace);
                match api.get(&secret_name.name).await {
                    Ok(secret) => {
                        let data = secret
                            .data
                            .unwrap_or_default()
                            .into_iter()
                            .map(|(k, v)| (k, v.0))
                            .collect();
                        parse_infrastructure_roles(&data)
                            .map_err(crate::OperatorError::Config)?
                    }
                    Err(e) => {
                        warn!("could not get infrastructure roles: {e}");
                        PgUserMap::new()
                    }
                }
            }
        };

        let workers = config.workers.max(1) as usize;
        let worker_logs = (0..workers)
            .map(|_| Arc::new(RingLog::new(config.ring_log_lines)))
            .collect();
        let queues = (0..workers).map(|_| Arc::new(WorkerQueue::default())).collect();

        Ok(Arc::new(Self {
            client,
            config,
            teams_api,
            infrastructure_roles,
            clusters: RwLock::new(HashMap::new()),
            team_clusters: RwLock::new(HashMap::new()),
            cluster_logs: RwLock::new(HashMap::new()),
            cluster_history: RwLock::new(HashMap::new()),
            worker_logs,
            queues,
        }))
    }

    pub fn workers(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Stable worker assignment for a cluster.
    pub fn cluster_worker_id(&self, cluster_name: &NamespacedName) -> u32 {
        cluster_worker_id(cluster_name, self.workers())
    }

    /// The CR api handle, namespaced or cluster-wide per configuration.
    pub(crate) fn postgresql_api(&self) -> Api<Postgresql> {
        if self.config.watches_all_namespaces() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.watched_namespace)
        }
    }

    pub(crate) fn cluster(&self, name: &NamespacedName) -> Option<Arc<Cluster>> {
        self.clusters.read().expect("cluster registry").get(name).cloned()
    }

    /// Instantiate and register the in-memory entry for a cluster.
    pub(crate) fn register_cluster(&self, postgresql: Postgresql) -> Arc<Cluster> {
        let cluster = Arc::new(Cluster::new(
            self.client.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.teams_api),
            self.infrastructure_roles.clone(),
            postgresql,
        ));
        let name = cluster.cluster_name.clone();
        let team = cluster.team_id().to_lowercase();

        self.clusters
            .write()
            .expect("cluster registry")
            .insert(name.clone(), Arc::clone(&cluster));
        self.team_clusters
            .write()
            .expect("team index")
            .entry(team)
            .or_default()
            .push(name.clone());
        self.cluster_logs
            .write()
            .expect("cluster logs")
            .entry(name.clone())
            .or_insert_with(|| Arc::new(RingLog::new(self.config.ring_log_lines)));
        self.cluster_history
            .write()
            .expect("cluster history")
            .entry(name)
            .or_insert_with(|| Arc::new(RingLog::new(self.config.cluster_history_entries)));

        cluster
    }

    /// Drop a cluster from the registry after a successful Delete.
    pub(crate) fn unregister_cluster(&self, name: &NamespacedName, team: &str) {
        self.clusters.write().expect("cluster registry").remove(name);
        self.cluster_logs.write().expect("cluster logs").remove(name);
        self.cluster_history.write().expect("cluster history").remove(name);

        let team = team.to_lowercase();
        let mut teams = self.team_clusters.write().expect("team index");
        if let Some(members) = teams.get_mut(&team) {
            members.retain(|n| n != name);
            if members.is_empty() {
                teams.remove(&team);
            }
        }
    }

    /// Classify, shard and enqueue a cluster event.
    pub fn queue_cluster_event(
        &self,
        old: Option<Postgresql>,
        new: Option<Postgresql>,
        mut event_type: EventType,
    ) {
        let source = match event_type {
            EventType::Add | EventType::Sync => new.as_ref(),
            EventType::Update | EventType::Delete => old.as_ref(),
        };
        let Some(source) = source else {
            warn!("dropping {event_type} event without an object");
            return;
        };
        let cluster_name = NamespacedName::from_object(source);
        let uid = source.metadata.uid.clone().unwrap_or_default();

        // a cluster whose previous reconcile failed gets a full sync
        // instead of an incremental update
        if event_type == EventType::Update
            && self
                .cluster(&cluster_name)
                .is_some_and(|c| c.error().is_some())
        {
            event_type = EventType::Sync;
        }

        let worker_id = self.cluster_worker_id(&cluster_name);
        let event = ClusterEvent {
            event_type,
            uid,
            cluster_name: cluster_name.clone(),
            old_spec: old.map(Box::new),
            new_spec: new.map(Box::new),
            worker_id,
        };

        self.queues[worker_id as usize].add(event);
        info!(
            worker = worker_id,
            cluster = %cluster_name,
            "{event_type:?} event has been queued"
        );
    }

    /// Spawn every background task and run until the stop signal fires,
    /// then wait for the workers to finish their in-flight events.
    pub async fn run(self: &Arc<Self>, stop: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        tasks.spawn(ingest::run_postgresql_watcher(Arc::clone(self), stop.clone()));
        tasks.spawn(ingest::run_resync_ticker(Arc::clone(self), stop.clone()));
        tasks.spawn(ingest::run_repair_ticker(Arc::clone(self), stop.clone()));
        tasks.spawn(pod::run_pod_watcher(Arc::clone(self), stop.clone()));
        tasks.spawn(node::run_node_watcher(Arc::clone(self), stop.clone()));
        tasks.spawn(crate::api::run_api_server(Arc::clone(self), stop.clone()));

        for worker_id in 0..self.workers() {
            tasks.spawn(dispatch::worker_loop(
                Arc::clone(self),
                worker_id,
                stop.clone(),
            ));
        }

        info!("started working in background");
        while tasks.join_next().await.is_some() {}
    }

    pub(crate) fn worker_ring_log(&self, worker_id: u32) -> Option<Arc<RingLog>> {
        self.worker_logs.get(worker_id as usize).cloned()
    }

    pub(crate) fn cluster_ring_log(&self, name: &NamespacedName) -> Option<Arc<RingLog>> {
        self.cluster_logs.read().expect("cluster logs").get(name).cloned()
    }

    /// Record one line of reconcile progress in the worker and cluster
    /// rings; `ResourceExt` names identify the cluster.
    pub(crate) fn publish_progress(
        &self,
        worker_id: u32,
        cluster_name: &NamespacedName,
        level: &str,
        message: impl Into<String>,
    ) {
        let entry = crate::util::ringlog::LogEntry::new(level, message)
            .with_worker(worker_id)
            .with_cluster(cluster_name.clone());
        if let Some(log) = self.worker_ring_log(worker_id) {
            log.insert(entry.clone());
        }
        if let Some(log) = self.cluster_ring_log(cluster_name) {
            log.insert(entry);
        }
    }
}

/// Suppress no-op CR updates: unchanged resource version or structurally
/// equal specs.
pub(crate) fn specs_equal(old: &Postgresql, new: &Postgresql) -> bool {
    if old.resource_version() == new.resource_version() {
        return true;
    }
    serde_json::to_value(&old.spec).ok() == serde_json::to_value(&new.spec).ok()
}
