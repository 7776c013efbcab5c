//! Common types for the tenant provisioner: orders, errors, custom resources and kube helpers

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod order;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use order::{NodePort, Order, OrderId};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Lowest port Kubernetes hands out for NodePort services
pub const NODE_PORT_MIN: u16 = 30000;

/// Highest port Kubernetes hands out for NodePort services
pub const NODE_PORT_MAX: u16 = 32767;

/// Field manager recorded on every object this service writes
pub const FIELD_MANAGER: &str = "tenant-provisioner";

/// Label key marking namespaces created by this service
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
