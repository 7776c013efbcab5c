//! Tenant control plane provisioner
//!
//! Pulls orders from the broker through a bounded [`pool::WorkerPool`], runs
//! each one through the [`pipeline::Provisioner`] and settles the delivery
//! according to the outcome.

#![deny(missing_docs)]

pub mod config;
pub mod pipeline;
pub mod pool;

pub use pipeline::{ProvisionReport, Provisioner};
pub use pool::{Job, PoolConfig, PoolStats, WorkerPool};
