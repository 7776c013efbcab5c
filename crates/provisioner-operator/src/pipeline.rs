//! The provisioning job
//!
//! decode → validate → ensure namespace → pick port → build → submit.
//!
//! Nothing touches the cluster before the order has decoded and validated.
//! Every cluster step is idempotent, so a redelivered order repeats the whole
//! sequence safely: the port recorded on an existing tenant is reused, the
//! rebuilt descriptor is identical and submission reports it as already
//! present.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, field, info, instrument, Span};

use provisioner_cluster::{ClusterGateway, NodePortAllocator, SubmitOutcome};
use provisioner_common::{Error, NodePort, Order, OrderId};
use provisioner_tenant::{build_tenant, tenant_hostname, EnvironmentConfig};

use crate::pool::Job;

/// What a successful job did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Order that was provisioned
    pub order: OrderId,
    /// Tenant namespace
    pub namespace: String,
    /// Tenant control plane name
    pub name: String,
    /// API server hostname
    pub hostname: String,
    /// API server node port
    pub port: NodePort,
    /// Whether the port came from an existing tenant resource
    pub reused_port: bool,
    /// Result of the submission
    pub outcome: SubmitOutcome,
}

/// Runs orders against the management cluster
///
/// All collaborators are injected at construction and shared by every job.
pub struct Provisioner {
    gateway: Arc<dyn ClusterGateway>,
    allocator: Arc<NodePortAllocator>,
    environment: Arc<EnvironmentConfig>,
}

impl Provisioner {
    /// Create a provisioner
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        allocator: Arc<NodePortAllocator>,
        environment: EnvironmentConfig,
    ) -> Self {
        Self {
            gateway,
            allocator,
            environment: Arc::new(environment),
        }
    }

    /// Decode, validate and provision one raw order payload
    pub async fn provision(&self, payload: &[u8]) -> Result<ProvisionReport, Error> {
        let order = Order::decode(payload)?;
        order.validate()?;
        self.provision_order(&order).await
    }

    /// Provision an order that has already been validated
    #[instrument(
        skip_all,
        fields(
            order = %order.id,
            cluster = %order.cluster_name,
            namespace = field::Empty,
            port = field::Empty
        )
    )]
    pub async fn provision_order(&self, order: &Order) -> Result<ProvisionReport, Error> {
        let namespace = order.namespace();
        Span::current().record("namespace", namespace.as_str());

        // Refuse an unusable hostname before anything is written to the cluster.
        tenant_hostname(order, &self.environment)?;
        self.gateway.ensure_namespace(&namespace).await?;

        let existing = self
            .gateway
            .get_tenant(&namespace, &order.cluster_name)
            .await?
            .and_then(|tenant| tenant.spec.network_profile.node_port());

        // The lease must outlive submission so no other job can pick the port
        // before the tenant resource records it.
        let (port, lease) = match existing {
            Some(port) => {
                debug!(port = port.get(), "reusing port of existing tenant");
                (port, None)
            }
            None => {
                let lease = self.allocator.allocate().await?;
                (lease.port(), Some(lease))
            }
        };
        Span::current().record("port", port.get());

        let descriptor = build_tenant(order, port, &self.environment)?;
        let outcome = self.gateway.submit_tenant(&descriptor).await?;
        drop(lease);

        info!(
            hostname = %descriptor.hostname,
            outcome = ?outcome,
            "tenant control plane submitted"
        );

        Ok(ProvisionReport {
            order: order.id.clone(),
            namespace,
            name: descriptor.name().to_string(),
            hostname: descriptor.hostname,
            port,
            reused_port: existing.is_some(),
            outcome,
        })
    }
}

#[async_trait]
impl Job for Provisioner {
    async fn run(&self, payload: &[u8]) -> Result<(), Error> {
        self.provision(payload).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use provisioner_cluster::{AllocatorConfig, PortInventory};
    use provisioner_common::crd::{TenantControlPlane, TenantDescriptor};
    use provisioner_common::{NODE_PORT_MAX, NODE_PORT_MIN};

    /// Cluster double counting every call
    #[derive(Default)]
    struct Cluster {
        tenants: Mutex<BTreeMap<(String, String), TenantControlPlane>>,
        namespaces: Mutex<BTreeSet<String>>,
        calls: AtomicUsize,
        inventory_calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterGateway for Cluster {
        async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.namespaces.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        async fn get_tenant(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<TenantControlPlane>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = (namespace.to_string(), name.to_string());
            Ok(self.tenants.lock().unwrap().get(&key).cloned())
        }

        async fn submit_tenant(
            &self,
            descriptor: &TenantDescriptor,
        ) -> Result<SubmitOutcome, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = (
                descriptor.namespace().to_string(),
                descriptor.name().to_string(),
            );
            let mut tenants = self.tenants.lock().unwrap();
            match tenants.get(&key) {
                Some(existing) if descriptor.is_satisfied_by(existing) => {
                    Ok(SubmitOutcome::AlreadyPresent)
                }
                Some(_) => Err(Error::conflict(&key.0, &key.1, "spec differs")),
                None => {
                    tenants.insert(key, descriptor.resource.clone());
                    Ok(SubmitOutcome::Created)
                }
            }
        }
    }

    #[async_trait]
    impl PortInventory for Cluster {
        async fn bound_node_ports(&self) -> Result<BTreeSet<u16>, Error> {
            self.inventory_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .tenants
                .lock()
                .unwrap()
                .values()
                .filter_map(|t| t.spec.network_profile.node_port())
                .map(NodePort::get)
                .collect())
        }
    }

    fn provisioner(cluster: &Arc<Cluster>) -> Provisioner {
        let allocator = NodePortAllocator::new(
            Arc::clone(cluster) as Arc<dyn PortInventory>,
            AllocatorConfig::default(),
        );
        Provisioner::new(
            Arc::clone(cluster) as Arc<dyn ClusterGateway>,
            Arc::new(allocator),
            EnvironmentConfig::new("example.com", "203.0.113.5"),
        )
    }

    const ORDER: &str = r#"{
        "id": 1,
        "user_id": "u-123",
        "cluster_name": "acme-prod",
        "has_control_plane": true,
        "images_storage": 10,
        "monitoring_storage": 5
    }"#;

    /// Story: a valid order ends with one tenant control plane in the tenant namespace
    #[tokio::test]
    async fn story_valid_order_is_provisioned() {
        let cluster = Arc::new(Cluster::default());
        let report = provisioner(&cluster).provision(ORDER.as_bytes()).await.unwrap();

        assert_eq!(report.namespace, "u-123");
        assert_eq!(report.name, "acme-prod");
        assert_eq!(report.hostname, "acme-prod.u-123.example.com");
        assert!((NODE_PORT_MIN..=NODE_PORT_MAX).contains(&report.port.get()));
        assert!(!report.reused_port);
        assert_eq!(report.outcome, SubmitOutcome::Created);
        assert!(cluster.namespaces.lock().unwrap().contains("u-123"));
    }

    /// Story: a redelivered order keeps its port and resolves to "already present"
    #[tokio::test]
    async fn story_redelivery_reuses_the_recorded_port() {
        let cluster = Arc::new(Cluster::default());
        let provisioner = provisioner(&cluster);

        let first = provisioner.provision(ORDER.as_bytes()).await.unwrap();
        let inventory_calls = cluster.inventory_calls.load(Ordering::SeqCst);
        let second = provisioner.provision(ORDER.as_bytes()).await.unwrap();

        assert_eq!(second.port, first.port);
        assert!(second.reused_port);
        assert_eq!(second.outcome, SubmitOutcome::AlreadyPresent);
        assert_eq!(
            cluster.inventory_calls.load(Ordering::SeqCst),
            inventory_calls
        );
        assert_eq!(cluster.tenants.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_the_cluster() {
        let cluster = Arc::new(Cluster::default());
        let err = provisioner(&cluster)
            .provision(b"{\"id\": 1, \"cluster_name\": ")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Decode { .. }));
        assert_eq!(cluster.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.inventory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_order_never_reaches_the_cluster() {
        let cluster = Arc::new(Cluster::default());
        let payload = ORDER.replace("acme-prod", "Acme_Prod");
        let err = provisioner(&cluster)
            .provision(payload.as_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(cluster.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hostname_too_long_for_dns_never_reaches_the_cluster() {
        let cluster = Arc::new(Cluster::default());
        let allocator = NodePortAllocator::new(
            Arc::clone(&cluster) as Arc<dyn PortInventory>,
            AllocatorConfig::default(),
        );
        let provisioner = Provisioner::new(
            Arc::clone(&cluster) as Arc<dyn ClusterGateway>,
            Arc::new(allocator),
            EnvironmentConfig::new(format!("{}.example.com", "d".repeat(230)), "203.0.113.5"),
        );

        let err = provisioner.provision(ORDER.as_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(cluster.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.inventory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn same_cluster_name_from_another_order_is_a_conflict() {
        let cluster = Arc::new(Cluster::default());
        let provisioner = provisioner(&cluster);
        provisioner.provision(ORDER.as_bytes()).await.unwrap();

        let other = ORDER.replace("\"id\": 1", "\"id\": 2");
        let err = provisioner.provision(other.as_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn lease_is_released_after_submission() {
        let cluster = Arc::new(Cluster::default());
        let allocator = Arc::new(NodePortAllocator::new(
            Arc::clone(&cluster) as Arc<dyn PortInventory>,
            AllocatorConfig::default(),
        ));
        let provisioner = Provisioner::new(
            Arc::clone(&cluster) as Arc<dyn ClusterGateway>,
            Arc::clone(&allocator),
            EnvironmentConfig::new("example.com", "203.0.113.5"),
        );

        provisioner.provision(ORDER.as_bytes()).await.unwrap();
        assert_eq!(allocator.reserved_count(), 0);
    }
}
