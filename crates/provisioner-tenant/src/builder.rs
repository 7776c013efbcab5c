//! Order to TenantControlPlane mapping
//!
//! [`build_tenant`] is a pure function: identical inputs always produce an
//! identical descriptor, down to the serialized bytes (all maps are ordered).

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use provisioner_common::crd::{
    AdditionalMetadata, AddonSpec, AddonsSpec, ComponentResources, ControlPlaneSpec,
    DeploymentSpec, IngressSpec, KonnectivityAgentSpec, KonnectivityServerSpec, KonnectivitySpec,
    KubeletSpec, KubernetesSpec, NetworkProfileSpec, ServiceSpec, TenantControlPlane,
    TenantControlPlaneSpec, TenantDescriptor, SERVICE_TYPE_NODE_PORT,
};
use provisioner_common::{Error, NodePort, Order};

use crate::environment::{
    EnvironmentConfig, ADMISSION_CONTROLLERS, KONNECTIVITY_SERVER_PORT, KUBELET_CGROUP_DRIVER,
};
use crate::hostname::TenantHostname;

/// Label carrying the tenant cluster name
pub const LABEL_TENANT: &str = "tenant";
/// Label identifying the workload kind
pub const LABEL_APP: &str = "app";
/// Label carrying the owning tenant (customer)
pub const LABEL_CLIENT: &str = "client";
/// Label carrying the originating order id
pub const LABEL_ORDER: &str = "order";
/// Value of [`LABEL_APP`] on every tenant control plane
pub const APP_TENANT_CONTROL_PLANE: &str = "tenant-control-plane";

/// Prefix of the annotations recording the order's requested features
pub const ANNOTATION_PREFIX: &str = "provisioner.tenant.dev";

/// Hostname the tenant for `order` is reachable under
///
/// Fails with a validation error when the combined name is too long for DNS.
pub fn tenant_hostname(order: &Order, env: &EnvironmentConfig) -> Result<String, Error> {
    TenantHostname::new(&env.domain, order.tenant(), &order.cluster_name)
        .checked_fqdn()
        .map_err(|message| {
            Error::validation_for_field(order.id.to_string(), "cluster_name", message)
        })
}

/// Build the tenant control plane for `order` exposed on `port`
///
/// `order` must already be validated.
pub fn build_tenant(
    order: &Order,
    port: NodePort,
    env: &EnvironmentConfig,
) -> Result<TenantDescriptor, Error> {
    let tenant = order.tenant();
    let hostname = tenant_hostname(order, env)?;

    let labels = tenant_labels(order, &tenant);
    let annotations = order_annotations(order, &hostname);
    let additional_metadata = AdditionalMetadata {
        labels: labels.clone(),
        annotations: annotations.clone(),
    };

    let spec = TenantControlPlaneSpec {
        data_store: env.datastore.clone(),
        control_plane: ControlPlaneSpec {
            deployment: DeploymentSpec {
                replicas: Some(1),
                additional_metadata: additional_metadata.clone(),
                resources: Some(ComponentResources {
                    api_server: Some(env.resources.api_server.clone()),
                    controller_manager: Some(env.resources.controller_manager.clone()),
                    scheduler: Some(env.resources.scheduler.clone()),
                }),
            },
            service: ServiceSpec {
                additional_metadata: additional_metadata.clone(),
                service_type: SERVICE_TYPE_NODE_PORT.to_string(),
            },
            ingress: Some(IngressSpec {
                additional_metadata,
                ingress_class_name: env.ingress_class.clone(),
                hostname: hostname.clone(),
            }),
        },
        kubernetes: KubernetesSpec {
            version: env.kubernetes_version.clone(),
            kubelet: KubeletSpec {
                cgroupfs: KUBELET_CGROUP_DRIVER.to_string(),
            },
            admission_controllers: ADMISSION_CONTROLLERS.iter().map(|s| s.to_string()).collect(),
        },
        network_profile: NetworkProfileSpec {
            address: env.exposed_address.clone(),
            port: i32::from(port.get()),
            cert_sans: vec![hostname.clone()],
            service_cidr: env.network.service_cidr.clone(),
            pod_cidr: env.network.pod_cidr.clone(),
            dns_service_ips: env.network.dns_service_ips.clone(),
        },
        addons: addons(env),
    };

    let mut resource = TenantControlPlane::new(&order.cluster_name, spec);
    resource.metadata = ObjectMeta {
        name: Some(order.cluster_name.clone()),
        namespace: Some(order.namespace()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    };

    Ok(TenantDescriptor {
        hostname,
        port,
        resource,
    })
}

fn tenant_labels(order: &Order, tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TENANT.to_string(), order.cluster_name.clone()),
        (LABEL_APP.to_string(), APP_TENANT_CONTROL_PLANE.to_string()),
        (LABEL_CLIENT.to_string(), tenant.to_string()),
        (LABEL_ORDER.to_string(), order.id.to_string()),
    ])
}

fn order_annotations(order: &Order, hostname: &str) -> BTreeMap<String, String> {
    let key = |name: &str| format!("{}/{}", ANNOTATION_PREFIX, name);
    BTreeMap::from([
        (key("hostname"), hostname.to_string()),
        (key("monitoring"), order.has_monitoring.to_string()),
        (key("alerting"), order.has_alerting.to_string()),
        (key("image-storage"), format!("{}Gi", order.image_storage)),
        (
            key("monitoring-storage"),
            format!("{}Gi", order.monitoring_storage),
        ),
    ])
}

fn addons(env: &EnvironmentConfig) -> AddonsSpec {
    AddonsSpec {
        core_dns: env.core_dns.then(AddonSpec::default),
        kube_proxy: env.kube_proxy.then(AddonSpec::default),
        konnectivity: env.konnectivity.then(|| KonnectivitySpec {
            server: KonnectivityServerSpec {
                port: KONNECTIVITY_SERVER_PORT,
                resources: Some(env.resources.konnectivity_server.clone()),
            },
            agent: KonnectivityAgentSpec::default(),
        }),
    }
}
