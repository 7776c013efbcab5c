//! NodePort allocation
//!
//! Picking a free port is a read-then-decide against live cluster state, and
//! the Service that finally binds the port appears only after the tenant is
//! submitted. Two rules keep concurrent jobs from picking the same port:
//!
//! 1. Allocations are linearized: the sampling loop runs under one async lock
//!    for the whole process.
//! 2. A chosen port is recorded in an in-process reservation set until the
//!    job drops its [`PortLease`], which it does after submission. From then
//!    on the port is visible in the cluster through the tenant resource.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use provisioner_common::{Error, NodePort, NODE_PORT_MAX, NODE_PORT_MIN};

use crate::gateway::PortInventory;

/// Default upper bound on one allocation
pub const DEFAULT_ALLOCATION_DEADLINE: Duration = Duration::from_secs(10);

/// Longest deadline honoured; larger values are treated as this
pub const MAX_ALLOCATION_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Default pause between a collision and the next candidate
pub const DEFAULT_RESAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Allocator settings
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// How long one allocation may search before failing
    pub deadline: Duration,
    /// Pause after a collision before sampling again
    pub resample_interval: Duration,
    /// Candidate ports; must lie inside the NodePort range
    pub range: RangeInclusive<u16>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_ALLOCATION_DEADLINE,
            resample_interval: DEFAULT_RESAMPLE_INTERVAL,
            range: NODE_PORT_MIN..=NODE_PORT_MAX,
        }
    }
}

impl AllocatorConfig {
    /// Default settings with a custom deadline
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Default::default()
        }
    }

    /// Restrict candidates to `range`, clamped to the NodePort range
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        let start = (*range.start()).clamp(NODE_PORT_MIN, NODE_PORT_MAX);
        let end = (*range.end()).clamp(start, NODE_PORT_MAX);
        self.range = start..=end;
        self
    }
}

/// Single-owner NodePort allocator shared by all jobs of the process
pub struct NodePortAllocator {
    inventory: Arc<dyn PortInventory>,
    config: AllocatorConfig,
    /// The random source doubles as the allocation lock
    rng: Mutex<Box<dyn RngCore + Send>>,
    reserved: Arc<DashSet<u16>>,
}

impl NodePortAllocator {
    /// Create an allocator seeded from the operating system
    pub fn new(inventory: Arc<dyn PortInventory>, config: AllocatorConfig) -> Self {
        Self::with_rng(inventory, config, StdRng::from_entropy())
    }

    /// Create an allocator drawing candidates from `rng`
    pub fn with_rng(
        inventory: Arc<dyn PortInventory>,
        config: AllocatorConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        Self {
            inventory,
            config,
            rng: Mutex::new(Box::new(rng)),
            reserved: Arc::new(DashSet::new()),
        }
    }

    /// Allocate a port within the configured deadline
    pub async fn allocate(&self) -> Result<PortLease, Error> {
        self.allocate_within(self.config.deadline).await
    }

    /// Allocate a port, failing with [`Error::AllocationTimeout`] after `deadline`
    ///
    /// Waiting for the allocation lock counts against the deadline. Inventory
    /// failures are returned as-is; only collisions are resampled.
    pub async fn allocate_within(&self, deadline: Duration) -> Result<PortLease, Error> {
        let started = Instant::now();
        let deadline_at = started
            .checked_add(deadline.min(MAX_ALLOCATION_DEADLINE))
            .unwrap_or(started + DEFAULT_ALLOCATION_DEADLINE);
        let mut attempts = 0u32;
        let timed_out = |attempts: u32| Error::AllocationTimeout {
            waited: started.elapsed(),
            attempts,
        };

        let mut rng = timeout_at(deadline_at, self.rng.lock())
            .await
            .map_err(|_| timed_out(attempts))?;

        loop {
            if Instant::now() >= deadline_at {
                warn!(attempts, reserved = self.reserved.len(), "node port allocation timed out");
                return Err(timed_out(attempts));
            }

            let candidate = rng.gen_range(self.config.range.clone());
            attempts += 1;

            let bound = timeout_at(deadline_at, self.inventory.bound_node_ports())
                .await
                .map_err(|_| timed_out(attempts))??;

            if !bound.contains(&candidate) && self.reserved.insert(candidate) {
                if let Some(port) = NodePort::new(candidate) {
                    debug!(port = candidate, attempts, "allocated node port");
                    return Ok(PortLease {
                        port,
                        reserved: Arc::clone(&self.reserved),
                    });
                }
                self.reserved.remove(&candidate);
            }

            trace!(port = candidate, attempts, "node port taken, resampling");
            let next = (Instant::now() + self.config.resample_interval).min(deadline_at);
            tokio::time::sleep_until(next).await;
        }
    }

    /// Number of ports currently held by outstanding leases
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }
}

impl fmt::Debug for NodePortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePortAllocator")
            .field("config", &self.config)
            .field("reserved", &self.reserved.len())
            .finish()
    }
}

/// A port reserved for one job until submission completes
///
/// Dropping the lease returns the port to the pool of candidates; by then the
/// submitted tenant resource records it.
pub struct PortLease {
    port: NodePort,
    reserved: Arc<DashSet<u16>>,
}

impl PortLease {
    /// The reserved port
    pub fn port(&self) -> NodePort {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved.remove(&self.port.get());
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortLease").field(&self.port.get()).finish()
    }
}
