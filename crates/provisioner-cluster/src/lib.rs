//! Management cluster access for the provisioner
//!
//! - [`gateway`]: idempotent namespace and tenant resource submission
//! - [`allocator`]: exclusive NodePort allocation against live cluster state

#![deny(missing_docs)]

pub mod allocator;
pub mod gateway;

pub use allocator::{AllocatorConfig, NodePortAllocator, PortLease};
pub use gateway::{ClusterGateway, KubeGateway, PortInventory, SubmitOutcome};
