//! Static, per-deployment inputs to the tenant builder

use provisioner_common::crd::ResourceRequirements;

/// Default Kubernetes version for new tenant control planes
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.28.2";
/// Default ingress class for the tenant API server ingress
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";
/// Default datastore name
pub const DEFAULT_DATASTORE: &str = "default";
/// Port the konnectivity server sidecar listens on
pub const KONNECTIVITY_SERVER_PORT: i32 = 8132;
/// Cgroup driver pushed to tenant kubelets
pub const KUBELET_CGROUP_DRIVER: &str = "systemd";
/// Admission controllers enabled on every tenant API server
pub const ADMISSION_CONTROLLERS: [&str; 2] = ["ResourceQuota", "LimitRanger"];

/// Deployment-wide settings injected into every built tenant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Base domain tenant hostnames are built under
    pub domain: String,
    /// Externally reachable address of the management cluster nodes
    pub exposed_address: String,
    /// Datastore backing tenant control planes
    pub datastore: String,
    /// Kubernetes version for new tenants
    pub kubernetes_version: String,
    /// Ingress class for the API server ingress
    pub ingress_class: String,
    /// Tenant network layout
    pub network: NetworkDefaults,
    /// Control plane resource requests
    pub resources: ControlPlaneResources,
    /// Install CoreDNS into tenant clusters
    pub core_dns: bool,
    /// Install kube-proxy into tenant clusters
    pub kube_proxy: bool,
    /// Run konnectivity between control plane and tenant nodes
    pub konnectivity: bool,
}

impl EnvironmentConfig {
    /// Settings for `domain` and `exposed_address` with defaults everywhere else
    pub fn new(domain: impl Into<String>, exposed_address: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            exposed_address: exposed_address.into(),
            datastore: DEFAULT_DATASTORE.to_string(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            network: NetworkDefaults::default(),
            resources: ControlPlaneResources::default(),
            core_dns: true,
            kube_proxy: true,
            konnectivity: true,
        }
    }

    /// Use `datastore` for tenant storage
    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = datastore.into();
        self
    }

    /// Provision tenants at `version`
    pub fn with_kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = version.into();
        self
    }

    /// Use `class` for the API server ingress
    pub fn with_ingress_class(mut self, class: impl Into<String>) -> Self {
        self.ingress_class = class.into();
        self
    }
}

/// Tenant cluster network layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkDefaults {
    /// Service CIDR
    pub service_cidr: String,
    /// Pod CIDR
    pub pod_cidr: String,
    /// Cluster DNS service addresses (inside the service CIDR)
    pub dns_service_ips: Vec<String>,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            service_cidr: "10.96.0.0/16".to_string(),
            pod_cidr: "10.244.0.0/16".to_string(),
            dns_service_ips: vec!["10.96.0.10".to_string()],
        }
    }
}

/// Resource requests for each control plane container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneResources {
    /// kube-apiserver
    pub api_server: ResourceRequirements,
    /// kube-controller-manager
    pub controller_manager: ResourceRequirements,
    /// kube-scheduler
    pub scheduler: ResourceRequirements,
    /// konnectivity server sidecar
    pub konnectivity_server: ResourceRequirements,
}

impl Default for ControlPlaneResources {
    fn default() -> Self {
        Self {
            api_server: ResourceRequirements::requests("250m", "512Mi"),
            controller_manager: ResourceRequirements::requests("125m", "256Mi"),
            scheduler: ResourceRequirements::requests("125m", "256Mi"),
            konnectivity_server: ResourceRequirements::requests("100m", "128Mi"),
        }
    }
}
