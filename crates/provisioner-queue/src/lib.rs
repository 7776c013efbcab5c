//! Order delivery for the provisioner
//!
//! - [`source`]: the [`OrderSource`] subscription and its [`Delivery`] handles
//! - [`ack`]: mapping job outcomes onto a single settlement per delivery
//! - [`amqp`]: AMQP 0-9-1 source backed by `lapin`
//! - [`memory`]: in-process source for tests and local runs

#![deny(missing_docs)]

pub mod ack;
pub mod amqp;
pub mod memory;
pub mod source;

pub use ack::{AckPolicy, Decision, RedeliveryTracker, DEFAULT_MAX_REQUEUES};
pub use amqp::{AmqpConfig, AmqpOrderSource};
pub use memory::{MemoryBroker, MemorySource, Settlement, SettlementRecord};
pub use source::{Delivery, DeliveryHandle, Disposition, OrderSource};
