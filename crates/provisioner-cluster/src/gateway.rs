//! Idempotent operations against the management cluster
//!
//! Both write operations can be repeated safely: a namespace that already
//! exists is success, and a tenant resource that already exists is success
//! when it is equivalent to the desired one and a conflict otherwise.

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use provisioner_common::crd::{TenantControlPlane, TenantDescriptor};
use provisioner_common::kube_utils::{is_already_exists, is_not_found};
use provisioner_common::{Error, FIELD_MANAGER, MANAGED_BY_LABEL_KEY};

/// Page size used when listing objects cluster-wide
const LIST_PAGE_SIZE: u32 = 500;

/// Source of the node ports currently claimed in the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PortInventory: Send + Sync {
    /// Every node port bound by a live Service or recorded on an existing
    /// tenant control plane
    async fn bound_node_ports(&self) -> Result<BTreeSet<u16>, Error>;
}

/// Result of a successful tenant submission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The resource was created by this call
    Created,
    /// An equivalent resource already existed
    AlreadyPresent,
}

/// Operations the provisioning job performs against the management cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Create the namespace if it does not exist
    async fn ensure_namespace(&self, name: &str) -> Result<(), Error>;

    /// Fetch a tenant control plane, `None` if absent
    async fn get_tenant(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TenantControlPlane>, Error>;

    /// Create the tenant control plane if no equivalent one exists
    async fn submit_tenant(&self, descriptor: &TenantDescriptor) -> Result<SubmitOutcome, Error>;
}

/// Minimal get/create surface of a typed kube API
///
/// Lets the idempotency rules below run against an in-memory store in tests.
#[async_trait]
pub(crate) trait ObjectStore<K>: Send + Sync {
    async fn get_opt(&self, name: &str) -> Result<Option<K>, kube::Error>;
    async fn create(&self, object: &K) -> Result<K, kube::Error>;
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> Result<Option<K>, kube::Error> {
        Api::get_opt(self, name).await
    }

    async fn create(&self, object: &K) -> Result<K, kube::Error> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Api::create(self, &params, object).await
    }
}

/// Get-then-create; a lost creation race still counts as success
pub(crate) async fn ensure_namespace_in<S>(store: &S, name: &str) -> Result<(), Error>
where
    S: ObjectStore<Namespace> + ?Sized,
{
    match store.get_opt(name).await {
        Ok(Some(_)) => {
            debug!(namespace = %name, "namespace already exists");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) => return Err(Error::from_kube("get_namespace", e)),
    }

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(std::collections::BTreeMap::from([(
                MANAGED_BY_LABEL_KEY.to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };

    match store.create(&ns).await {
        Ok(_) => {
            info!(namespace = %name, "namespace created");
            Ok(())
        }
        Err(e) if is_already_exists(&e) => {
            debug!(namespace = %name, "namespace created concurrently");
            Ok(())
        }
        Err(e) => Err(Error::from_kube("create_namespace", e)),
    }
}

/// Create-then-compare; an existing object must contain the desired state
pub(crate) async fn submit_tenant_in<S>(
    store: &S,
    descriptor: &TenantDescriptor,
) -> Result<SubmitOutcome, Error>
where
    S: ObjectStore<TenantControlPlane> + ?Sized,
{
    let (namespace, name) = (descriptor.namespace(), descriptor.name());

    let err = match store.create(&descriptor.resource).await {
        Ok(_) => {
            info!(%namespace, %name, port = %descriptor.port, "tenant control plane created");
            return Ok(SubmitOutcome::Created);
        }
        Err(e) if is_already_exists(&e) => e,
        Err(e) => return Err(Error::from_kube("create_tenant", e)),
    };
    debug!(%namespace, %name, error = %err, "tenant control plane exists, comparing");

    match store.get_opt(name).await {
        Ok(Some(existing)) if descriptor.is_satisfied_by(&existing) => {
            info!(%namespace, %name, "equivalent tenant control plane already present");
            Ok(SubmitOutcome::AlreadyPresent)
        }
        Ok(Some(existing)) => {
            let existing_port = existing.spec.network_profile.port;
            Err(Error::conflict(
                namespace,
                name,
                format!(
                    "existing tenant control plane differs from the order (existing port {}, desired {})",
                    existing_port, descriptor.port
                ),
            ))
        }
        // Deleted between our create and get; the next delivery will create it.
        Ok(None) => Err(Error::transient(
            "submit_tenant",
            format!("{}/{} vanished after reporting AlreadyExists", namespace, name),
        )),
        Err(e) => Err(Error::from_kube("get_tenant", e)),
    }
}

/// kube-rs backed gateway
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Create a gateway over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_all<K, F>(&self, api: Api<K>, mut visit: F) -> Result<(), kube::Error>
    where
        K: Clone + DeserializeOwned + Debug + Resource,
        F: FnMut(&K),
    {
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        loop {
            let page = api.list(&params).await?;
            page.items.iter().for_each(&mut visit);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl PortInventory for KubeGateway {
    async fn bound_node_ports(&self) -> Result<BTreeSet<u16>, Error> {
        let mut ports = BTreeSet::new();

        let services: Api<Service> = Api::all(self.client.clone());
        self.list_all(services, |svc: &Service| {
            let node_ports = svc
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .filter_map(|p| p.node_port)
                .filter_map(|p| u16::try_from(p).ok());
            ports.extend(node_ports);
        })
        .await
        .map_err(|e| Error::from_kube("list_services", e))?;

        // The control-plane operator creates the tenant Service asynchronously,
        // so ports already promised to tenants count as taken too.
        let tenants: Api<TenantControlPlane> = Api::all(self.client.clone());
        let listed = self
            .list_all(tenants, |tcp: &TenantControlPlane| {
                if let Some(port) = tcp.spec.network_profile.node_port() {
                    ports.insert(port.get());
                }
            })
            .await;
        match listed {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                warn!("TenantControlPlane CRD not installed, using Service ports only");
            }
            Err(e) => return Err(Error::from_kube("list_tenants", e)),
        }

        debug!(bound = ports.len(), "collected bound node ports");
        Ok(ports)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ensure_namespace_in(&api, name).await
    }

    async fn get_tenant(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TenantControlPlane>, Error> {
        let api: Api<TenantControlPlane> = Api::namespaced(self.client.clone(), namespace);
        ObjectStore::get_opt(&api, name)
            .await
            .map_err(|e| Error::from_kube("get_tenant", e))
    }

    async fn submit_tenant(&self, descriptor: &TenantDescriptor) -> Result<SubmitOutcome, Error> {
        let api: Api<TenantControlPlane> =
            Api::namespaced(self.client.clone(), descriptor.namespace());
        submit_tenant_in(&api, descriptor).await
    }
}
