//! Tenant control plane construction
//!
//! Turns a validated [`Order`](provisioner_common::Order) and an allocated
//! port into a [`TenantDescriptor`](provisioner_common::crd::TenantDescriptor).
//! Nothing in this crate touches the network or process-wide state: every
//! environment-specific value arrives through [`EnvironmentConfig`].

#![deny(missing_docs)]

pub mod builder;
pub mod environment;
pub mod hostname;

pub use builder::{build_tenant, tenant_hostname};
pub use environment::{ControlPlaneResources, EnvironmentConfig, NetworkDefaults};
pub use hostname::TenantHostname;
