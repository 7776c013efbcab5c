//! TenantControlPlane custom resource (kamaji.clastix.io/v1alpha1)
//!
//! Only the fields this service sets are modelled. Fields the control-plane
//! operator defaults server-side are tolerated when reading objects back:
//! unknown keys are ignored on deserialization and equivalence checks compare
//! the desired document as a subset of the stored one.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NodePort;

/// API group of the tenant control plane resource
pub const TENANT_API_GROUP: &str = "kamaji.clastix.io";
/// API version of the tenant control plane resource
pub const TENANT_API_VERSION: &str = "v1alpha1";
/// Kind of the tenant control plane resource
pub const TENANT_KIND: &str = "TenantControlPlane";
/// Plural resource name used in API paths
pub const TENANT_PLURAL: &str = "tenantcontrolplanes";
/// Service type exposing the tenant API server on a NodePort
pub const SERVICE_TYPE_NODE_PORT: &str = "NodePort";

/// Desired state of a managed tenant control plane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kamaji.clastix.io",
    version = "v1alpha1",
    kind = "TenantControlPlane",
    plural = "tenantcontrolplanes",
    shortname = "tcp",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetes.version"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.networkProfile.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneSpec {
    /// Datastore backing the tenant's etcd-compatible storage
    #[serde(default)]
    pub data_store: String,
    /// Control plane deployment, service and ingress
    #[serde(default)]
    pub control_plane: ControlPlaneSpec,
    /// Kubernetes version and component settings
    #[serde(default)]
    pub kubernetes: KubernetesSpec,
    /// How the tenant API server is reached
    #[serde(default)]
    pub network_profile: NetworkProfileSpec,
    /// Addons installed into the tenant cluster
    #[serde(default)]
    pub addons: AddonsSpec,
}

/// Labels and annotations propagated onto generated objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AdditionalMetadata {
    /// Labels to add
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations to add
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Control plane objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Control plane Deployment
    #[serde(default)]
    pub deployment: DeploymentSpec,
    /// Service exposing the API server
    #[serde(default)]
    pub service: ServiceSpec,
    /// Optional ingress in front of the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

/// Control plane Deployment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Number of control plane replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Metadata added to the Deployment
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
    /// Per-component resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComponentResources>,
}

/// Resource requirements for each control plane container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResources {
    /// kube-apiserver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<ResourceRequirements>,
    /// kube-controller-manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager: Option<ResourceRequirements>,
    /// kube-scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<ResourceRequirements>,
}

/// Container resource requests and limits as quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Requested resources (e.g., cpu: "250m", memory: "512Mi")
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    /// Resource limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    /// Requests for cpu and memory with no limits
    pub fn requests(cpu: &str, memory: &str) -> Self {
        Self {
            requests: BTreeMap::from([
                ("cpu".to_string(), cpu.to_string()),
                ("memory".to_string(), memory.to_string()),
            ]),
            limits: BTreeMap::new(),
        }
    }
}

/// Service exposing the tenant API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Metadata added to the Service
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
    /// Kubernetes Service type
    #[serde(default)]
    pub service_type: String,
}

/// Ingress in front of the tenant API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Metadata added to the Ingress
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
    /// Ingress class
    #[serde(default)]
    pub ingress_class_name: String,
    /// Hostname routed to the API server
    #[serde(default)]
    pub hostname: String,
}

/// Tenant Kubernetes settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Kubernetes version (e.g., "v1.28.2")
    #[serde(default)]
    pub version: String,
    /// Kubelet settings pushed to joining nodes
    #[serde(default)]
    pub kubelet: KubeletSpec,
    /// Enabled admission controllers
    #[serde(default)]
    pub admission_controllers: Vec<String>,
}

/// Kubelet settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KubeletSpec {
    /// Cgroup driver
    #[serde(default)]
    pub cgroupfs: String,
}

/// Network exposure of the tenant control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfileSpec {
    /// Externally reachable address of the API server
    #[serde(default)]
    pub address: String,
    /// NodePort the API server is exposed on
    #[serde(default)]
    pub port: i32,
    /// Extra certificate subject alternative names
    #[serde(default, rename = "certSANs")]
    pub cert_sans: Vec<String>,
    /// Tenant service CIDR
    #[serde(default)]
    pub service_cidr: String,
    /// Tenant pod CIDR
    #[serde(default)]
    pub pod_cidr: String,
    /// Cluster DNS service addresses
    #[serde(default, rename = "dnsServiceIPs")]
    pub dns_service_ips: Vec<String>,
}

impl NetworkProfileSpec {
    /// The allocated port, if it is a valid NodePort
    pub fn node_port(&self) -> Option<NodePort> {
        u16::try_from(self.port).ok().and_then(NodePort::new)
    }
}

/// Addons installed into the tenant cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonsSpec {
    /// CoreDNS addon
    #[serde(default, rename = "coreDNS", skip_serializing_if = "Option::is_none")]
    pub core_dns: Option<AddonSpec>,
    /// kube-proxy addon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_proxy: Option<AddonSpec>,
    /// Konnectivity addon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub konnectivity: Option<KonnectivitySpec>,
}

/// Marker for an enabled addon with default settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AddonSpec {}

/// Konnectivity server and agent settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KonnectivitySpec {
    /// Server sidecar running next to the API server
    #[serde(default)]
    pub server: KonnectivityServerSpec,
    /// Agent running in the tenant cluster
    #[serde(default)]
    pub agent: KonnectivityAgentSpec,
}

/// Konnectivity server sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KonnectivityServerSpec {
    /// Port the server listens on
    #[serde(default)]
    pub port: i32,
    /// Sidecar resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Konnectivity agent, left at operator defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KonnectivityAgentSpec {}

/// A fully built tenant control plane ready for submission
///
/// Produced once per order by the tenant builder and handed over to the
/// cluster gateway. Never mutated after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantDescriptor {
    /// Hostname the tenant API server is reachable at
    pub hostname: String,
    /// NodePort allocated to the tenant API server
    pub port: NodePort,
    /// The resource to submit
    pub resource: TenantControlPlane,
}

impl TenantDescriptor {
    /// Namespace the resource is submitted into
    pub fn namespace(&self) -> &str {
        self.resource.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Name of the resource
    pub fn name(&self) -> &str {
        self.resource.metadata.name.as_deref().unwrap_or_default()
    }

    /// Canonical JSON encoding of the resource
    ///
    /// Maps are ordered, so equal descriptors encode to identical bytes.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.resource)
    }

    /// Whether `existing` already carries everything this descriptor asks for
    ///
    /// The `spec` and the labels of the descriptor must be contained in the
    /// existing object. Extra fields defaulted by the server do not count as
    /// a difference.
    pub fn is_satisfied_by(&self, existing: &TenantControlPlane) -> bool {
        let (Ok(desired_spec), Ok(existing_spec)) = (
            serde_json::to_value(&self.resource.spec),
            serde_json::to_value(&existing.spec),
        ) else {
            return false;
        };
        if !json_contains(&existing_spec, &desired_spec) {
            return false;
        }

        let existing_labels = existing.metadata.labels.clone().unwrap_or_default();
        self.resource
            .metadata
            .labels
            .iter()
            .flatten()
            .all(|(k, v)| existing_labels.get(k) == Some(v))
    }
}

/// Recursive subset check: every key of `desired` is present in `actual` with
/// a contained value. Arrays and scalars must match exactly.
fn json_contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
        (Value::Object(actual), Value::Object(desired)) => desired
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| json_contains(a, v))),
        _ => actual == desired,
    }
}
