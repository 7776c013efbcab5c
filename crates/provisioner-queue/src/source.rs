//! Order subscription and delivery handles
//!
//! A [`Delivery`] carries one raw payload and exactly one pending terminal
//! action. Settling consumes the delivery, so acknowledging twice or
//! acknowledging after a reject cannot be expressed.

use std::fmt;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use provisioner_common::Error;

/// Terminal action taken on a delivery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The order was handled; remove it from the queue
    Acknowledge,
    /// The order was not handled; requeue it or drop it
    Reject {
        /// Hand the message back to the broker for redelivery
        requeue: bool,
    },
}

impl Disposition {
    /// Stable label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "ack",
            Disposition::Reject { requeue: true } => "requeue",
            Disposition::Reject { requeue: false } => "drop",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-specific side of a delivery
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// Raw message body
    fn payload(&self) -> &[u8];

    /// Number of earlier deliveries of this message, when the broker reports it
    fn delivery_count(&self) -> Option<u32>;

    /// Remove the message from the queue
    async fn ack(self: Box<Self>) -> Result<(), Error>;

    /// Return the message to the broker, or discard it when `requeue` is false
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), Error>;
}

/// One message taken from an [`OrderSource`], pending settlement
pub struct Delivery {
    handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    /// Wrap a broker handle
    pub fn new(handle: impl DeliveryHandle + 'static) -> Self {
        Self {
            handle: Box::new(handle),
        }
    }

    /// Raw message body
    pub fn payload(&self) -> &[u8] {
        self.handle.payload()
    }

    /// Number of earlier deliveries, when known
    pub fn delivery_count(&self) -> Option<u32> {
        self.handle.delivery_count()
    }

    /// Apply the terminal action
    pub async fn settle(self, disposition: Disposition) -> Result<(), Error> {
        match disposition {
            Disposition::Acknowledge => self.handle.ack().await,
            Disposition::Reject { requeue } => self.handle.reject(requeue).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload().len())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}

/// A subscription yielding order deliveries
///
/// Reading a delivery removes nothing from the broker; the message stays
/// outstanding until the delivery is settled.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrderSource: Send {
    /// Wait for the next delivery, or `None` once the subscription has ended
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, Error>;
}
