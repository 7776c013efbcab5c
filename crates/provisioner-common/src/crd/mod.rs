//! Custom resource types submitted to the management cluster

mod tenant_control_plane;

pub use tenant_control_plane::{
    AdditionalMetadata, AddonSpec, AddonsSpec, ComponentResources, ControlPlaneSpec,
    DeploymentSpec, IngressSpec, KonnectivityAgentSpec, KonnectivityServerSpec, KonnectivitySpec,
    KubeletSpec, KubernetesSpec, NetworkProfileSpec, ResourceRequirements, ServiceSpec,
    TenantControlPlane, TenantControlPlaneSpec, TenantDescriptor, SERVICE_TYPE_NODE_PORT,
    TENANT_API_GROUP, TENANT_API_VERSION, TENANT_KIND, TENANT_PLURAL,
};
