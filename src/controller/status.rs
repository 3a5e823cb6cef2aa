//! Read-only views over controller state, served by the debug interface.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::controller::Controller;
use crate::util::NamespacedName;
use crate::util::ringlog::LogEntry;

/// One cluster as presented by `/clusters/...`.
#[derive(Serialize)]
pub struct ClusterStatusView {
    pub team: String,
    pub cluster: NamespacedName,
    pub status: String,
    pub worker: u32,
    pub master_less: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One worker queue as presented by `/workers/:id/queue`.
#[derive(Serialize)]
pub struct QueueDump {
    pub keys: Vec<String>,
    pub size: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum StatusError {
    #[error("could not find cluster")]
    ClusterNotFound,

    #[error("could not find clusters for the team")]
    TeamNotFound,

    #[error("could not find worker")]
    WorkerNotFound,
}

impl Controller {
    fn cluster_view(&self, name: &NamespacedName) -> Option<ClusterStatusView> {
        let cluster = self.cluster(name)?;
        Some(ClusterStatusView {
            team: cluster.team_id(),
            cluster: name.clone(),
            status: cluster.status().to_string(),
            worker: self.cluster_worker_id(name),
            master_less: cluster.master_less(),
            error: cluster.error(),
        })
    }

    /// All known clusters.
    pub fn list_clusters(&self) -> Vec<ClusterStatusView> {
        let names: Vec<NamespacedName> = {
            let clusters = self.clusters.read().expect("cluster registry");
            let mut names: Vec<_> = clusters.keys().cloned().collect();
            names.sort();
            names
        };
        names.iter().filter_map(|n| self.cluster_view(n)).collect()
    }

    /// Clusters of one team.
    pub fn team_clusters_status(&self, team: &str) -> Result<Vec<ClusterStatusView>, StatusError> {
        let names = self
            .team_clusters
            .read()
            .expect("team index")
            .get(&team.to_lowercase())
            .cloned()
            .ok_or(StatusError::TeamNotFound)?;
        Ok(names.iter().filter_map(|n| self.cluster_view(n)).collect())
    }

    /// One cluster, addressed by team and short name as the debug routes
    /// do: the full cluster name is `{team}-{name}`.
    pub fn cluster_status(&self, team: &str, name: &str) -> Result<ClusterStatusView, StatusError> {
        let cluster_name = self.resolve_cluster(team, name)?;
        self.cluster_view(&cluster_name)
            .ok_or(StatusError::ClusterNotFound)
    }

    fn resolve_cluster(&self, team: &str, name: &str) -> Result<NamespacedName, StatusError> {
        let full_name = format!("{team}-{name}");
        let clusters = self.clusters.read().expect("cluster registry");
        clusters
            .keys()
            .find(|n| n.name == full_name)
            .cloned()
            .ok_or(StatusError::ClusterNotFound)
    }

    /// Ring log of one cluster.
    pub fn cluster_log_entries(&self, team: &str, name: &str) -> Result<Vec<LogEntry>, StatusError> {
        let cluster_name = self.resolve_cluster(team, name)?;
        let log = self
            .cluster_ring_log(&cluster_name)
            .ok_or(StatusError::ClusterNotFound)?;
        Ok(log.walk())
    }

    /// Spec-change history of one cluster.
    pub fn cluster_history_entries(
        &self,
        team: &str,
        name: &str,
    ) -> Result<Vec<LogEntry>, StatusError> {
        let cluster_name = self.resolve_cluster(team, name)?;
        let log = self
            .cluster_history
            .read()
            .expect("cluster history")
            .get(&cluster_name)
            .cloned()
            .ok_or(StatusError::ClusterNotFound)?;
        Ok(log.walk())
    }

    /// Ring log of one worker.
    pub fn worker_log_entries(&self, worker_id: u32) -> Result<Vec<LogEntry>, StatusError> {
        let log = self
            .worker_ring_log(worker_id)
            .ok_or(StatusError::WorkerNotFound)?;
        Ok(log.walk())
    }

    /// Queue dump of one worker.
    pub fn worker_queue_dump(&self, worker_id: u32) -> Result<QueueDump, StatusError> {
        let queue = self
            .queues
            .get(worker_id as usize)
            .ok_or(StatusError::WorkerNotFound)?;
        let events = queue.dump();
        Ok(QueueDump {
            keys: events
                .iter()
                .map(|e| format!("{}-{}", e.event_type, e.uid))
                .collect(),
            size: events.len(),
        })
    }

    /// Declared databases of every cluster, keyed by cluster name.
    pub fn databases(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let clusters = self.clusters.read().expect("cluster registry");
        clusters
            .iter()
            .map(|(name, cluster)| (name.to_string(), cluster.declared_databases()))
            .collect()
    }
}
