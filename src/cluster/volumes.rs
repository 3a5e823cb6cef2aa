//! Persistent volume growth.
//!
//! A larger volume request in the manifest is applied to every claim of the
//! cluster and the resize is awaited through the claim's status. Requests
//! are never shrunk.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{info, warn};

use crate::cluster::{Cluster, ClusterError, Result};
use crate::resources::common::ClusterInfo;
use crate::util::parse_quantity;
use crate::util::retry::retry;

fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
}

fn actual_capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .map(|q| q.0.clone())
}

impl Cluster {
    /// Grow every claim whose request is below the manifest size, then wait
    /// for the resize to finish.
    pub(crate) async fn sync_volumes(&self, info: &ClusterInfo<'_>) -> Result<()> {
        let desired_size = info.cluster.spec.volume.size.clone();
        let desired = parse_quantity(&desired_size).map_err(ClusterError::Render)?;

        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &info.namespace());
        let lp = ListParams::default().labels(&info.label_selector());
        let claims = api.list(&lp).await?.items;

        let mut resized = Vec::new();
        for pvc in &claims {
            let name = pvc.name_any();
            let Some(current_request) = requested_storage(pvc) else {
                continue;
            };
            let current = parse_quantity(&current_request).map_err(ClusterError::Render)?;

            if desired < current {
                warn!(
                    cluster = %self.cluster_name,
                    pvc = %name,
                    "volume size {desired_size} is smaller than the current {current_request}, \
                     volumes are never shrunk"
                );
                continue;
            }
            if desired == current {
                continue;
            }

            info!(
                cluster = %self.cluster_name,
                pvc = %name,
                "resizing volume from {current_request} to {desired_size}"
            );
            let patch = serde_json::json!({
                "spec": { "resources": { "requests": {
                    "storage": Quantity(desired_size.clone())
                }}}
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            resized.push(name);
        }

        for name in resized {
            self.wait_volume_resized(&api, &name, desired).await?;
        }
        Ok(())
    }

    async fn wait_volume_resized(
        &self,
        api: &Api<PersistentVolumeClaim>,
        name: &str,
        desired: f64,
    ) -> Result<()> {
        retry(
            self.config.ebs_resize_wait_interval,
            self.config.ebs_resize_wait_timeout,
            || {
                let api = api.clone();
                let name = name.to_string();
                async move {
                    let pvc = api.get(&name).await?;
                    let capacity = actual_capacity(&pvc)
                        .and_then(|c| parse_quantity(&c).ok())
                        .unwrap_or(0.0);
                    Ok::<_, kube::Error>(capacity >= desired)
                }
            },
        )
        .await
        .map_err(|e| match e {
            crate::util::retry::RetryError::Timeout(t) => ClusterError::Timeout(format!(
                "volume {name} was not resized within {t:?}"
            )),
            crate::util::retry::RetryError::Inner(e) => ClusterError::Kube(e),
        })?;
        Ok(())
    }
}
