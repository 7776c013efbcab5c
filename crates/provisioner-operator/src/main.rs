//! Tenant provisioner - consumes provisioning orders and submits tenant control planes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use provisioner::config::{Cli, Command, RenderArgs, RunArgs};
use provisioner::{PoolStats, Provisioner, WorkerPool};
use provisioner_cluster::{ClusterGateway, KubeGateway, NodePortAllocator, PortInventory};
use provisioner_common::crd::TenantControlPlane;
use provisioner_common::kube_utils::create_client;
use provisioner_common::retry::{retry_with_backoff, RetryConfig};
use provisioner_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use provisioner_common::{NodePort, Order};
use provisioner_queue::AmqpOrderSource;
use provisioner_tenant::build_tenant;

/// Pause between a lost subscription and the next connection attempt
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TenantControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Command::Render(args)) => render(args).await,
        Some(Command::Run(args)) => {
            init_logging(cli.log_format.into())?;
            run(args).await
        }
        None => {
            // Without a subcommand every setting comes from the environment.
            let args = RunArgs::try_parse_from(["tenant-provisioner"])?;
            init_logging(cli.log_format.into())?;
            run(args).await
        }
    }
}

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        format,
        filter: None,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))
}

/// Print the tenant document an order would produce
async fn render(args: RenderArgs) -> anyhow::Result<()> {
    let payload = tokio::fs::read(&args.order)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read order file {:?}: {}", args.order, e))?;

    let order = Order::decode(&payload)?;
    order.validate()?;
    let port = NodePort::new(args.port)
        .ok_or_else(|| anyhow::anyhow!("{} is not a node port", args.port))?;

    let descriptor = build_tenant(&order, port, &args.environment.to_environment())?;
    let yaml = serde_yaml::to_string(&descriptor.resource)
        .map_err(|e| anyhow::anyhow!("Failed to serialize tenant: {}", e))?;
    println!("{yaml}");
    Ok(())
}

/// Consume orders until SIGINT/SIGTERM, reconnecting to the broker as needed
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let client = create_client(&args.connection()).await?;
    let gateway = Arc::new(KubeGateway::new(client));

    let inventory: Arc<dyn PortInventory> = gateway.clone();
    let allocator = Arc::new(NodePortAllocator::new(inventory, args.allocator_config()));
    let cluster: Arc<dyn ClusterGateway> = gateway;
    let provisioner = Provisioner::new(cluster, allocator, args.environment.to_environment());

    let pool = WorkerPool::new(provisioner, args.pool_config(), args.ack_policy());
    let amqp = args.amqp_config();
    info!(
        domain = %args.environment.domain,
        concurrency = args.concurrency,
        queue = %amqp.queue,
        "tenant provisioner starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut totals = PoolStats::default();
    while !shutdown.is_cancelled() {
        let retry_config = RetryConfig::default();
        let source = tokio::select! {
            _ = shutdown.cancelled() => break,
            source = retry_with_backoff(&retry_config, "amqp_connect", || {
                AmqpOrderSource::connect(&amqp)
            }) => source?,
        };

        match pool.run(source, shutdown.clone()).await {
            Ok(stats) => {
                totals += stats;
                if !shutdown.is_cancelled() {
                    warn!("broker subscription ended, reconnecting");
                }
            }
            Err(e) => warn!(error = %e, "broker subscription failed, reconnecting"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
        }
    }

    info!(
        dispatched = totals.dispatched,
        acknowledged = totals.acknowledged,
        rejected = totals.rejected,
        requeued = totals.requeued,
        "tenant provisioner stopped"
    );
    Ok(())
}

/// Cancel `token` on the first SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
    info!("shutting down: no new orders, draining in-flight jobs");
    token.cancel();
}
