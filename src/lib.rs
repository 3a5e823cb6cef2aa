pub mod api;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod resources;
pub mod teams;
pub mod util;

pub use config::Config;
pub use controller::Controller;
pub use crd::Postgresql;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing::info;

use crate::util::retry::{RetryError, retry};

/// Startup failures; all of them terminate the process with exit code 1.
#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("could not register the custom resource definition: {0}")]
    CrdRegistration(String),

    #[error("could not find the watched namespace {0:?}")]
    NamespaceNotFound(String),
}

/// Ensure the `postgresql` CRD exists and wait for the API server to
/// establish it.
pub async fn register_crd(client: &Client, config: &Config) -> Result<(), OperatorError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = Postgresql::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    api.patch(
        &name,
        &PatchParams::apply("postgres-operator").force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| OperatorError::CrdRegistration(e.to_string()))?;

    retry(
        config.crd_ready_wait_interval,
        config.crd_ready_wait_timeout,
        || {
            let api = api.clone();
            let name = name.clone();
            async move {
                let crd = api.get(&name).await?;
                Ok::<_, kube::Error>(crd_established(&crd))
            }
        },
    )
    .await
    .map_err(|e| match e {
        RetryError::Timeout(t) => {
            OperatorError::CrdRegistration(format!("CRD was not established within {t:?}"))
        }
        RetryError::Inner(e) => OperatorError::CrdRegistration(e.to_string()),
    })?;

    info!("custom resource definition {name} is established");
    Ok(())
}

fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Run the operator until the stop signal fires.
pub async fn run_operator(
    client: Client,
    config: Config,
    stop: watch::Receiver<bool>,
) -> Result<(), OperatorError> {
    if !config.watches_all_namespaces() {
        let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
        if namespaces.get_opt(&config.watched_namespace).await?.is_none() {
            return Err(OperatorError::NamespaceNotFound(
                config.watched_namespace.clone(),
            ));
        }
        info!("listening to the namespace {:?}", config.watched_namespace);
    } else {
        info!("listening to all namespaces");
    }

    register_crd(&client, &config).await?;

    let controller = Controller::new(client, config).await?;
    controller.run(stop).await;
    Ok(())
}
