use std::collections::BTreeMap;
use std::process::ExitCode;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use postgresql_operator::config::Config;
use postgresql_operator::run_operator;
use postgresql_operator::util::NamespacedName;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

async fn run() -> Result<(), ()> {
    // the TLS provider must be installed before any TLS use (kube client,
    // database connections)
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        eprintln!("failed to install the rustls crypto provider");
        return Err(());
    }

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("could not create the Kubernetes client: {e}");
            return Err(());
        }
    };

    // configuration comes from one config map, resolved from the
    // environment; a bare name lands in the operator's own namespace
    let config_map_data = match load_config_map(&client).await {
        Ok(data) => data,
        Err(e) => {
            eprintln!("could not read the operator config map: {e}");
            return Err(());
        }
    };
    let mut config = match Config::from_map(&config_map_data) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not parse the operator configuration: {e}");
            return Err(());
        }
    };
    if let Ok(namespace) = std::env::var("WATCHED_NAMESPACE") {
        config.watched_namespace = namespace;
    }

    let default_level = if config.debug_logging { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "postgresql_operator={default_level},kube=info"
                ))
            }),
        )
        .init();

    info!("starting postgres operator");
    info!("config: {}", config.must_marshal());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal, stopping");
        let _ = stop_tx.send(true);
    });

    match run_operator(client, config, stop_rx).await {
        Ok(()) => {
            info!("operator stopped");
            Ok(())
        }
        Err(e) => {
            error!("operator failed to start: {e}");
            Err(())
        }
    }
}

fn operator_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

/// Resolve and read the operator config map. No `CONFIG_MAP_NAME` means
/// running on defaults; a named but unreadable config map is fatal.
async fn load_config_map(client: &Client) -> Result<BTreeMap<String, String>, String> {
    let raw_name = match std::env::var("CONFIG_MAP_NAME") {
        Ok(name) if !name.is_empty() => name,
        _ => {
            eprintln!("no config map specified, loading default values");
            return Ok(BTreeMap::new());
        }
    };

    let mut name = NamespacedName::decode(&raw_name)?;
    if !raw_name.contains('/') {
        name.namespace = operator_namespace();
    }

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &name.namespace);
    let config_map = api.get(&name.name).await.map_err(|e| e.to_string())?;
    Ok(config_map.data.unwrap_or_default())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
