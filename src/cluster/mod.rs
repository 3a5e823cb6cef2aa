//! Per-cluster reconciler.
//!
//! One [`Cluster`] exists in memory per custom resource. A cluster is only
//! ever mutated by the worker its events hash to, plus the node-drain
//! handler, which serializes against the worker through [`Cluster::lock`].

pub mod diff;
pub mod pg;
pub mod pod;
pub mod users;
pub mod volumes;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cluster::pg::{PgConnection, PgError, plan_database_sync, plan_role_sync};
use crate::cluster::pod::PodSubscribers;
use crate::cluster::users::{
    PgUserMap, UserError, init_human_users, init_robot_users, init_system_users,
};
use crate::config::Config;
use crate::crd::{ClusterStatus, Postgresql, PostgresqlStatus};
use crate::resources::common::{ClusterInfo, PostgresRole, ROLLING_UPDATE_ANNOTATION};
use crate::resources::{cronjob, pdb, secret, service, statefulset};
use crate::teams::TeamsApi;
use crate::util::retry::RetryError;
use crate::util::{NamespacedName, pretty_diff};

/// Field manager used for server-side patches.
pub(crate) const FIELD_MANAGER: &str = "postgres-operator";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("could not render resource: {0}")]
    Render(String),

    #[error(transparent)]
    User(#[from] UserError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PgError),

    #[error("{0}")]
    Timeout(String),

    #[error("invalid manifest: {0}")]
    Validation(String),

    #[error("{0}")]
    Reconcile(String),
}

impl From<RetryError<kube::Error>> for ClusterError {
    fn from(err: RetryError<kube::Error>) -> Self {
        match err {
            RetryError::Timeout(t) => ClusterError::Timeout(format!("wait timed out after {t:?}")),
            RetryError::Inner(e) => ClusterError::Kube(e),
        }
    }
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Mutable per-cluster state, touched only under [`Cluster::lock`] or by
/// the owning worker.
pub struct ClusterData {
    pub postgresql: Postgresql,
    pub pg_users: PgUserMap,
    pub system_users: PgUserMap,
    pub master_less: bool,
    pub error: Option<String>,
}

/// One managed PostgreSQL cluster.
pub struct Cluster {
    pub cluster_name: NamespacedName,
    client: Client,
    config: Arc<Config>,
    teams_api: Arc<dyn TeamsApi>,
    infrastructure_roles: PgUserMap,
    pod_subscribers: PodSubscribers,
    mu: Mutex<()>,
    state: StdMutex<ClusterData>,
}

impl Cluster {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        teams_api: Arc<dyn TeamsApi>,
        infrastructure_roles: PgUserMap,
        postgresql: Postgresql,
    ) -> Self {
        let cluster_name = NamespacedName::from_object(&postgresql);
        Self {
            cluster_name,
            client,
            config,
            teams_api,
            infrastructure_roles,
            pod_subscribers: PodSubscribers::default(),
            mu: Mutex::new(()),
            state: StdMutex::new(ClusterData {
                postgresql,
                pg_users: PgUserMap::new(),
                system_users: PgUserMap::new(),
                master_less: false,
                error: None,
            }),
        }
    }

    /// Serialize against the owning worker; held by the drain handler for
    /// the duration of a migration.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mu.lock().await
    }

    pub fn team_id(&self) -> String {
        self.state.lock().expect("cluster state").postgresql.spec.team_id.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().expect("cluster state").error.clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.lock().expect("cluster state").error = error;
    }

    pub fn master_less(&self) -> bool {
        self.state.lock().expect("cluster state").master_less
    }

    fn manifest(&self) -> Postgresql {
        self.state.lock().expect("cluster state").postgresql.clone()
    }

    /// Copy of the stored manifest, for synthetic Sync events.
    pub fn manifest_snapshot(&self) -> Postgresql {
        self.manifest()
    }

    fn set_manifest(&self, postgresql: Postgresql) {
        self.state.lock().expect("cluster state").postgresql = postgresql;
    }

    pub fn status(&self) -> ClusterStatus {
        self.state
            .lock()
            .expect("cluster state")
            .postgresql
            .status
            .map(|s| s.0)
            .unwrap_or_default()
    }

    /// Databases declared in the manifest.
    pub fn declared_databases(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .expect("cluster state")
            .postgresql
            .spec
            .databases
            .clone()
    }

    pub(crate) fn label_selector(&self) -> String {
        let manifest = self.manifest();
        ClusterInfo::new(&manifest, &self.config).label_selector()
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn set_status(&self, status: ClusterStatus) {
        self.state.lock().expect("cluster state").postgresql.status =
            Some(PostgresqlStatus(status));

        let api: Api<Postgresql> =
            Api::namespaced(self.client.clone(), &self.cluster_name.namespace);
        let patch = serde_json::json!({ "status": PostgresqlStatus(status) });
        if let Err(e) = api
            .patch_status(
                &self.cluster_name.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(cluster = %self.cluster_name, "could not set cluster status: {e}");
        }
    }

    /// Build the full role set for the current manifest: system roles,
    /// infrastructure roles, manifest robot users, team members.
    async fn init_users(&self) -> Result<()> {
        let manifest = self.manifest();
        let system_users = init_system_users(&self.config);

        let mut pg_users = self.infrastructure_roles.clone();
        init_robot_users(&self.config, &manifest.spec.users, &mut pg_users)?;

        if self.config.enable_teams_api {
            match self.teams_api.team_members(&manifest.spec.team_id).await {
                Ok(members) => {
                    init_human_users(&self.config, &manifest.spec.team_id, &members, &mut pg_users)?
                }
                Err(e) => warn!(
                    cluster = %self.cluster_name,
                    "could not get team members: {e}"
                ),
            }
        }

        let mut state = self.state.lock().expect("cluster state");
        // generated passwords survive re-initialization
        for (name, user) in &state.pg_users {
            if !user.password.is_empty()
                && let Some(new) = pg_users.get_mut(name)
                && new.origin == users::RoleOrigin::Manifest
            {
                new.password = user.password.clone();
            }
        }
        if state.system_users.is_empty() {
            state.system_users = system_users;
        }
        state.pg_users = pg_users;
        Ok(())
    }

    /// All managed roles keyed by actual role name, for the SQL phase.
    fn combined_users(&self) -> PgUserMap {
        let state = self.state.lock().expect("cluster state");
        let mut combined = PgUserMap::new();
        for user in state.system_users.values() {
            combined.insert(user.name.clone(), user.clone());
        }
        for user in state.pg_users.values() {
            combined.insert(user.name.clone(), user.clone());
        }
        combined
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create all child objects in a fixed order and wait for the pods to
    /// come up with role labels.
    pub async fn create(&self) -> Result<()> {
        let _guard = self.lock().await;
        self.set_status(ClusterStatus::Creating).await;

        let result = self.create_inner().await;
        self.record_outcome(&result).await;
        result
    }

    async fn create_inner(&self) -> Result<()> {
        validate_manifest(&self.manifest())?;
        self.init_users().await?;
        let manifest = self.manifest();
        let info = ClusterInfo::new(&manifest, &self.config);
        let ns = info.namespace();

        self.ensure_pod_service_account(&ns).await?;

        // secrets first, the pod template references them
        self.sync_secrets(&info).await?;

        // the master endpoint exists before its service so Patroni can take
        // it over for leader election
        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), &ns);
        for role in [PostgresRole::Master, PostgresRole::Replica] {
            let endpoint = service::generate_endpoint(&info, role);
            create_if_missing(&endpoints_api, endpoint).await?;
        }

        let services_api: Api<Service> = Api::namespaced(self.client.clone(), &ns);
        for role in [PostgresRole::Master, PostgresRole::Replica] {
            let svc = service::generate_service(&info, role);
            create_if_missing(&services_api, svc).await?;
        }

        let custom_pod_env = self.custom_pod_environment(&ns).await?;
        let sts = statefulset::generate_statefulset(&info, &custom_pod_env)
            .map_err(ClusterError::Render)?;
        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        create_if_missing(&sts_api, sts).await?;

        if self.config.enable_pod_disruption_budget {
            let budget = pdb::generate_pod_disruption_budget(&info);
            let pdb_api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), &ns);
            create_if_missing(&pdb_api, budget).await?;
        }

        if manifest.spec.enable_logical_backup {
            let job = cronjob::generate_logical_backup_job(&info);
            let jobs_api: Api<CronJob> = Api::namespaced(self.client.clone(), &ns);
            create_if_missing(&jobs_api, job).await?;
        }

        self.wait_statefulset_pods_ready().await?;

        self.sync_roles_and_databases().await?;

        info!(cluster = %self.cluster_name, "cluster has been created");
        Ok(())
    }

    /// Install the pod service account (and its role binding) into the
    /// target namespace when missing.
    async fn ensure_pod_service_account(&self, namespace: &str) -> Result<()> {
        if self.config.pod_service_account_definition.is_empty() {
            return Ok(());
        }
        let account: ServiceAccount =
            serde_json::from_str(&self.config.pod_service_account_definition)
                .map_err(|e| ClusterError::Render(format!("pod service account: {e}")))?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        create_if_missing(&api, account).await?;

        if self.config.pod_service_account_role_binding_definition.is_empty() {
            return Ok(());
        }
        let binding: RoleBinding =
            serde_json::from_str(&self.config.pod_service_account_role_binding_definition)
                .map_err(|e| ClusterError::Render(format!("pod service account binding: {e}")))?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        create_if_missing(&api, binding).await?;
        Ok(())
    }

    async fn custom_pod_environment(&self, ns: &str) -> Result<BTreeMap<String, String>> {
        if self.config.pod_environment_configmap.is_empty() {
            return Ok(BTreeMap::new());
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        let cm = api.get(&self.config.pod_environment_configmap).await?;
        Ok(cm.data.unwrap_or_default())
    }

    /// Create missing credential secrets; for secrets that already exist,
    /// adopt the stored password so generated credentials stay stable.
    async fn sync_secrets(&self, info: &ClusterInfo<'_>) -> Result<()> {
        let ns = info.namespace();
        let secrets_api: Api<Secret> = Api::namespaced(self.client.clone(), &ns);

        let users = {
            let state = self.state.lock().expect("cluster state");
            let mut all = state.pg_users.clone();
            for user in state.system_users.values() {
                all.insert(user.name.clone(), user.clone());
            }
            all
        };

        for user in users.values() {
            let Some(desired) = secret::generate_single_user_secret(info, user) else {
                continue;
            };
            let name = desired.name_any();
            match secrets_api.create(&PostParams::default(), &desired).await {
                Ok(_) => debug!(secret = %name, "created secret"),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    let existing = secrets_api.get(&name).await?;
                    if let Some(password) = existing
                        .data
                        .as_ref()
                        .and_then(|d| d.get("password"))
                        .and_then(|b| String::from_utf8(b.0.clone()).ok())
                    {
                        let mut state = self.state.lock().expect("cluster state");
                        let data = &mut *state;
                        for user in data
                            .pg_users
                            .values_mut()
                            .chain(data.system_users.values_mut())
                        {
                            if info.credential_secret_name(&user.name) == name {
                                user.password = password.clone();
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update & Sync
    // ------------------------------------------------------------------

    /// Converge the cluster from its current manifest to `new_spec`.
    pub async fn update(&self, new_spec: Postgresql) -> Result<()> {
        let _guard = self.lock().await;
        self.set_status(ClusterStatus::Updating).await;

        let result = self.apply_spec(new_spec).await;
        self.record_outcome(&result).await;
        result
    }

    /// Idempotent update against the stored manifest: the recovery path for
    /// drift and for clusters the operator has not seen yet.
    pub async fn sync(&self, new_spec: Postgresql) -> Result<()> {
        let _guard = self.lock().await;

        let result = self.apply_spec(new_spec).await;
        self.record_outcome(&result).await;
        result
    }

    async fn record_outcome(&self, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.set_error(None);
                self.set_status(ClusterStatus::Running).await;
            }
            Err(ClusterError::Validation(e)) => {
                self.set_error(Some(e.clone()));
                self.set_status(ClusterStatus::Invalid).await;
            }
            Err(e) => {
                self.set_error(Some(e.to_string()));
                self.set_status(ClusterStatus::SyncFailed).await;
            }
        }
    }

    async fn apply_spec(&self, new_spec: Postgresql) -> Result<()> {
        validate_manifest(&new_spec)?;
        self.set_manifest(new_spec);
        self.init_users().await?;

        let manifest = self.manifest();
        let info = ClusterInfo::new(&manifest, &self.config);

        self.sync_secrets(&info).await?;
        self.sync_services(&info).await?;
        self.sync_statefulset(&info).await?;
        self.sync_pod_disruption_budget(&info).await?;
        self.sync_logical_backup_job(&info).await?;
        self.sync_volumes(&info).await?;
        self.sync_roles_and_databases().await?;

        Ok(())
    }

    /// Patch services and endpoints in place where the diff engine says so.
    async fn sync_services(&self, info: &ClusterInfo<'_>) -> Result<()> {
        let ns = info.namespace();
        let services_api: Api<Service> = Api::namespaced(self.client.clone(), &ns);
        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), &ns);

        for role in [PostgresRole::Master, PostgresRole::Replica] {
            if endpoints_api.get_opt(&info.endpoint_name(role)).await?.is_none() {
                create_if_missing(&endpoints_api, service::generate_endpoint(info, role)).await?;
            }

            let mut desired = service::generate_service(info, role);
            match services_api.get_opt(&info.service_name(role)).await? {
                None => {
                    create_if_missing(&services_api, desired).await?;
                }
                Some(current) => {
                    // an omitted source-range list leaves the observed one alone
                    if info.cluster.spec.allowed_source_ranges.is_none()
                        && let (Some(desired_spec), Some(current_spec)) =
                            (desired.spec.as_mut(), current.spec.as_ref())
                    {
                        desired_spec.load_balancer_source_ranges =
                            current_spec.load_balancer_source_ranges.clone();
                    }

                    let result = diff::compare_services(&current, &desired);
                    if result.needs_patch {
                        info!(
                            cluster = %self.cluster_name,
                            service = %info.service_name(role),
                            "{} service is not in the desired state and needs to be updated",
                            role,
                        );
                        debug!("diff\n{}", pretty_diff(&current.spec, &desired.spec));
                        for reason in &result.reasons {
                            info!("reason: {reason}");
                        }
                        services_api
                            .patch(
                                &info.service_name(role),
                                &self.patch_params(),
                                &Patch::Apply(&strip_managed_fields(desired.clone())),
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Converge the stateful workload, performing a rolling update or a
    /// recreate when the diff engine requires one.
    async fn sync_statefulset(&self, info: &ClusterInfo<'_>) -> Result<()> {
        let ns = info.namespace();
        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);

        let custom_pod_env = self.custom_pod_environment(&ns).await?;
        let mut desired = statefulset::generate_statefulset(info, &custom_pod_env)
            .map_err(ClusterError::Render)?;

        let Some(current) = sts_api.get_opt(&info.statefulset_name()).await? else {
            info!(cluster = %self.cluster_name, "could not find the statefulset, creating it");
            create_if_missing(&sts_api, desired).await?;
            self.wait_statefulset_pods_ready().await?;
            return Ok(());
        };

        let result = diff::compare_statefulsets(&current, &desired);
        if result.is_equal() {
            return Ok(());
        }

        info!(
            cluster = %self.cluster_name,
            "statefulset is not in the desired state and needs to be updated"
        );
        debug!("diff\n{}", pretty_diff(&current.spec, &desired.spec));
        for reason in &result.reasons {
            info!("reason: {reason}");
        }

        if result.needs_rolling_update {
            desired
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ROLLING_UPDATE_ANNOTATION.to_string(), "true".to_string());
        }

        if result.needs_recreate {
            // keep the pods (and volumes): delete without cascading, then
            // post the new rendering
            let dp = DeleteParams {
                propagation_policy: Some(kube::api::PropagationPolicy::Orphan),
                ..Default::default()
            };
            sts_api.delete(&info.statefulset_name(), &dp).await?;
            let name = info.statefulset_name();
            crate::util::retry::retry(
                self.config.resource_check_interval,
                self.config.resource_check_timeout,
                || {
                    let sts_api = sts_api.clone();
                    let name = name.clone();
                    async move { Ok::<_, kube::Error>(sts_api.get_opt(&name).await?.is_none()) }
                },
            )
            .await?;
            sts_api.create(&PostParams::default(), &desired).await?;
        } else {
            sts_api
                .patch(
                    &info.statefulset_name(),
                    &self.patch_params(),
                    &Patch::Apply(&strip_managed_fields(desired.clone())),
                )
                .await?;
        }

        if result.needs_rolling_update {
            self.recreate_pods().await?;
            // rolling update finished, clear the marker
            let clear = serde_json::json!({
                "metadata": { "annotations": { ROLLING_UPDATE_ANNOTATION: "false" } }
            });
            sts_api
                .patch(
                    &info.statefulset_name(),
                    &PatchParams::default(),
                    &Patch::Merge(&clear),
                )
                .await?;
        }

        self.wait_statefulset_pods_ready().await?;
        Ok(())
    }

    async fn sync_pod_disruption_budget(&self, info: &ClusterInfo<'_>) -> Result<()> {
        if !self.config.enable_pod_disruption_budget {
            return Ok(());
        }
        let ns = info.namespace();
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), &ns);
        let desired = pdb::generate_pod_disruption_budget(info);

        match api.get_opt(&info.pod_disruption_budget_name()).await? {
            None => {
                create_if_missing(&api, desired).await?;
            }
            Some(current) => {
                let result = diff::compare_pod_disruption_budgets(&current, &desired);
                if result.needs_patch {
                    info!(
                        cluster = %self.cluster_name,
                        "PDB is not in the desired state and needs to be updated"
                    );
                    api.patch(
                        &info.pod_disruption_budget_name(),
                        &self.patch_params(),
                        &Patch::Apply(&strip_managed_fields(desired.clone())),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_logical_backup_job(&self, info: &ClusterInfo<'_>) -> Result<()> {
        let ns = info.namespace();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &ns);
        let name = info.logical_backup_job_name();

        if info.cluster.spec.enable_logical_backup {
            let desired = cronjob::generate_logical_backup_job(info);
            match api.get_opt(&name).await? {
                None => {
                    create_if_missing(&api, desired).await?;
                }
                Some(current) => {
                    let schedule_of = |j: &CronJob| {
                        j.spec.as_ref().map(|s| s.schedule.clone()).unwrap_or_default()
                    };
                    if schedule_of(&current) != schedule_of(&desired) {
                        api.patch(
                            &name,
                            &self.patch_params(),
                            &Patch::Apply(&strip_managed_fields(desired.clone())),
                        )
                        .await?;
                    }
                }
            }
        } else if api.get_opt(&name).await?.is_some() {
            api.delete(&name, &DeleteParams::default()).await?;
        }
        Ok(())
    }

    /// Open one SQL connection, converge roles then databases, close.
    pub async fn sync_roles_and_databases(&self) -> Result<()> {
        let manifest = self.manifest();
        let info = ClusterInfo::new(&manifest, &self.config);

        let desired = self.combined_users();
        let superuser = {
            let state = self.state.lock().expect("cluster state");
            state
                .system_users
                .get(users::SUPERUSER_KEY)
                .cloned()
                .ok_or_else(|| ClusterError::Reconcile("no superuser credentials".to_string()))?
        };

        let conn = PgConnection::connect(
            &self.config,
            &info.database_host(),
            &superuser.name,
            &superuser.password,
        )
        .await?;

        let names: Vec<String> = desired.keys().cloned().collect();
        let present = conn.read_pg_users(&names).await?;
        let ddl = plan_role_sync(&desired, &present);
        for statement in &ddl {
            info!(cluster = %self.cluster_name, "role sync: {statement}");
            conn.execute(statement).await?;
        }

        let databases = manifest.spec.databases.clone();
        if !databases.is_empty() {
            let present = conn.get_databases().await?;
            let pg_users = desired;
            for statement in plan_database_sync(&databases, &present, &pg_users) {
                info!(cluster = %self.cluster_name, "database sync: {statement}");
                conn.execute(&statement).await?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete all child objects in reverse creation order, then the
    /// persistent volume claims, so a same-named successor starts clean.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock().await;
        let manifest = self.manifest();
        let info = ClusterInfo::new(&manifest, &self.config);
        let ns = info.namespace();
        let dp = DeleteParams::default();

        let jobs_api: Api<CronJob> = Api::namespaced(self.client.clone(), &ns);
        if jobs_api.get_opt(&info.logical_backup_job_name()).await?.is_some() {
            jobs_api.delete(&info.logical_backup_job_name(), &dp).await?;
        }

        let pdb_api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), &ns);
        if pdb_api
            .get_opt(&info.pod_disruption_budget_name())
            .await?
            .is_some()
        {
            pdb_api.delete(&info.pod_disruption_budget_name(), &dp).await?;
        }

        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        if sts_api.get_opt(&info.statefulset_name()).await?.is_some() {
            sts_api.delete(&info.statefulset_name(), &dp).await?;
        }

        let services_api: Api<Service> = Api::namespaced(self.client.clone(), &ns);
        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), &ns);
        for role in [PostgresRole::Replica, PostgresRole::Master] {
            if services_api.get_opt(&info.service_name(role)).await?.is_some() {
                services_api.delete(&info.service_name(role), &dp).await?;
            }
            if endpoints_api.get_opt(&info.endpoint_name(role)).await?.is_some() {
                endpoints_api.delete(&info.endpoint_name(role), &dp).await?;
            }
        }

        let secrets_api: Api<Secret> = Api::namespaced(self.client.clone(), &ns);
        let lp = ListParams::default().labels(&info.label_selector());
        for secret in secrets_api.list(&lp).await? {
            secrets_api.delete(&secret.name_any(), &dp).await?;
        }

        self.delete_persistent_volume_claims().await?;

        info!(cluster = %self.cluster_name, "cluster has been deleted");
        Ok(())
    }
}

/// A manifest the operator refuses to act on: missing team, or a cluster
/// name that is not prefixed with its team.
fn validate_manifest(manifest: &Postgresql) -> Result<()> {
    let team = manifest.spec.team_id.to_lowercase();
    if team.is_empty() {
        return Err(ClusterError::Validation("no teamId specified".to_string()));
    }
    let name = manifest.name_any();
    if !name.starts_with(&format!("{team}-")) {
        return Err(ClusterError::Validation(format!(
            "cluster name {name:?} must start with the team name {team:?}"
        )));
    }
    Ok(())
}

/// POST the object; a 409 means someone (usually an earlier reconcile)
/// already created it, which is fine.
pub(crate) async fn create_if_missing<K>(api: &Api<K>, object: K) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), &object).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Server-side apply rejects objects that still carry managedFields.
fn strip_managed_fields<K: kube::Resource>(mut object: K) -> K {
    object.meta_mut().managed_fields = None;
    object
}
