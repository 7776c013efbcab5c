//! Kubernetes client construction and error helpers using kube-rs

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How the process reaches the management cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterConnection {
    /// Service account credentials mounted into the pod
    InCluster,
    /// A kubeconfig file; `None` falls back to the usual discovery rules
    /// (`KUBECONFIG`, then `~/.kube/config`)
    Kubeconfig(Option<PathBuf>),
}

/// Create a kube client for the given connection mode with default timeouts
pub async fn create_client(connection: &ClusterConnection) -> Result<Client, Error> {
    create_client_with_timeout(connection, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client for the given connection mode with custom timeouts
pub async fn create_client_with_timeout(
    connection: &ClusterConnection,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match connection {
        ClusterConnection::InCluster => Config::incluster().map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load in-cluster config: {}", e),
            )
        })?,
        ClusterConnection::Kubeconfig(Some(path)) => load_kubeconfig(path).await?,
        ClusterConnection::Kubeconfig(None) => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    info!(cluster_url = %config.cluster_url, "connecting to management cluster");
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })
}

/// Whether the API server answered "already exists"
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Whether the API server answered "not found"
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
