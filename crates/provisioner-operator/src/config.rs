//! Command line and environment configuration
//!
//! Every flag can also be set through a `PROVISIONER_*` environment variable,
//! which is how the in-cluster deployment configures the service.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use provisioner_cluster::AllocatorConfig;
use provisioner_common::kube_utils::ClusterConnection;
use provisioner_common::telemetry::LogFormat;
use provisioner_common::{NODE_PORT_MAX, NODE_PORT_MIN};
use provisioner_queue::amqp::DEFAULT_QUEUE;
use provisioner_queue::{AckPolicy, AmqpConfig, DEFAULT_MAX_REQUEUES};
use provisioner_tenant::environment::{
    DEFAULT_DATASTORE, DEFAULT_INGRESS_CLASS, DEFAULT_KUBERNETES_VERSION,
};
use provisioner_tenant::EnvironmentConfig;

use crate::pool::PoolConfig;

/// Tenant provisioner - turns queued orders into tenant control planes
#[derive(Parser, Debug)]
#[command(name = "tenant-provisioner", version, about, long_about = None)]
pub struct Cli {
    /// Print the TenantControlPlane CRD this service submits against and exit
    #[arg(long)]
    pub crd: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        env = "PROVISIONER_LOG_FORMAT",
        default_value_t = LogFormatArg::Json,
        global = true
    )]
    pub log_format: LogFormatArg,

    /// Mode to run in; `run` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operating modes
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume orders and provision tenants (default mode)
    Run(RunArgs),

    /// Print the tenant document an order would produce, without a cluster
    Render(RenderArgs),
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// One JSON object per event
    Json,
    /// Human readable
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

/// How to reach the management cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConnectionMode {
    /// Service account credentials of the pod
    InCluster,
    /// A kubeconfig file
    Kubeconfig,
}

/// Deployment-wide inputs to every tenant document
#[derive(Args, Debug, Clone)]
pub struct EnvironmentArgs {
    /// Base domain tenant hostnames are built under
    #[arg(long, env = "PROVISIONER_DOMAIN")]
    pub domain: String,

    /// Externally reachable address of the management cluster nodes
    #[arg(long, env = "PROVISIONER_EXPOSED_ADDRESS")]
    pub exposed_address: IpAddr,

    /// Datastore backing tenant control planes
    #[arg(long, env = "PROVISIONER_DATASTORE", default_value = DEFAULT_DATASTORE)]
    pub datastore: String,

    /// Kubernetes version of new tenants
    #[arg(
        long,
        env = "PROVISIONER_KUBERNETES_VERSION",
        default_value = DEFAULT_KUBERNETES_VERSION
    )]
    pub kubernetes_version: String,

    /// Ingress class of the tenant API server ingress
    #[arg(long, env = "PROVISIONER_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,
}

impl EnvironmentArgs {
    /// Tenant builder settings
    pub fn to_environment(&self) -> EnvironmentConfig {
        EnvironmentConfig::new(self.domain.clone(), self.exposed_address.to_string())
            .with_datastore(self.datastore.clone())
            .with_kubernetes_version(self.kubernetes_version.clone())
            .with_ingress_class(self.ingress_class.clone())
    }
}

/// Arguments of the `run` mode
#[derive(Parser, Debug, Clone)]
#[command(name = "tenant-provisioner")]
pub struct RunArgs {
    /// Tenant document inputs
    #[command(flatten)]
    pub environment: EnvironmentArgs,

    /// How to reach the management cluster
    #[arg(
        long,
        value_enum,
        env = "PROVISIONER_CLUSTER_CONNECTION",
        default_value_t = ConnectionMode::InCluster
    )]
    pub cluster_connection: ConnectionMode,

    /// Kubeconfig path when connecting with a kubeconfig
    #[arg(long, env = "PROVISIONER_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Maximum orders processed at once
    #[arg(
        long,
        env = "PROVISIONER_CONCURRENCY",
        default_value_t = 5,
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    pub concurrency: u16,

    /// Deadline of a single order, in seconds
    #[arg(
        long,
        env = "PROVISIONER_JOB_TIMEOUT_SECS",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..=86_400)
    )]
    pub job_timeout_secs: u64,

    /// How long port allocation may search, in seconds
    #[arg(
        long,
        env = "PROVISIONER_ALLOCATION_TIMEOUT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=3_600)
    )]
    pub allocation_timeout_secs: u64,

    /// Requeues of a transiently failing order before it is dropped
    #[arg(long, env = "PROVISIONER_MAX_REQUEUES", default_value_t = DEFAULT_MAX_REQUEUES)]
    pub max_requeues: u32,

    /// Broker connection
    #[command(flatten)]
    pub amqp: AmqpArgs,
}

impl RunArgs {
    /// Management cluster connection
    pub fn connection(&self) -> ClusterConnection {
        match self.cluster_connection {
            ConnectionMode::InCluster => ClusterConnection::InCluster,
            ConnectionMode::Kubeconfig => ClusterConnection::Kubeconfig(self.kubeconfig.clone()),
        }
    }

    /// Worker pool settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: usize::from(self.concurrency),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
        }
    }

    /// Allocator settings
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig::with_deadline(Duration::from_secs(self.allocation_timeout_secs))
    }

    /// Settlement policy
    pub fn ack_policy(&self) -> AckPolicy {
        AckPolicy::new(self.max_requeues)
    }

    /// Broker connection; prefetch matches the worker count
    pub fn amqp_config(&self) -> AmqpConfig {
        AmqpConfig {
            host: self.amqp.amqp_host.clone(),
            user: self.amqp.amqp_user.clone(),
            password: self.amqp.amqp_password.clone(),
            vhost: self.amqp.amqp_vhost.clone(),
            queue: self.amqp.queue.clone(),
            prefetch: self.concurrency,
            consumer_tag: self.amqp.consumer_tag.clone(),
        }
    }
}

/// Broker connection parameters
#[derive(Args, Clone)]
pub struct AmqpArgs {
    /// Broker host, optionally with a port
    #[arg(long, env = "PROVISIONER_AMQP_HOST", default_value = "localhost:5672")]
    pub amqp_host: String,

    /// Broker user
    #[arg(long, env = "PROVISIONER_AMQP_USER", default_value = "guest")]
    pub amqp_user: String,

    /// Broker password
    #[arg(
        long,
        env = "PROVISIONER_AMQP_PASSWORD",
        default_value = "guest",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub amqp_password: String,

    /// Broker virtual host
    #[arg(long, env = "PROVISIONER_AMQP_VHOST", default_value = "/")]
    pub amqp_vhost: String,

    /// Queue orders are consumed from
    #[arg(long, env = "PROVISIONER_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Consumer tag announced to the broker
    #[arg(long, env = "PROVISIONER_CONSUMER_TAG", default_value = "tenant-provisioner")]
    pub consumer_tag: String,
}

impl std::fmt::Debug for AmqpArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpArgs")
            .field("amqp_host", &self.amqp_host)
            .field("amqp_user", &self.amqp_user)
            .field("amqp_vhost", &self.amqp_vhost)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Arguments of the `render` mode
#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Order document (JSON) to render
    #[arg(long)]
    pub order: PathBuf,

    /// Node port to place in the document
    #[arg(
        long,
        value_parser = clap::value_parser!(u16).range(i64::from(NODE_PORT_MIN)..=i64::from(NODE_PORT_MAX))
    )]
    pub port: u16,

    /// Tenant document inputs
    #[command(flatten)]
    pub environment: EnvironmentArgs,
}
