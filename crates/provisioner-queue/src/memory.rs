//! In-process order source
//!
//! Behaves like a single broker queue: rejected-with-requeue messages go back
//! to the tail with their delivery count bumped, and every settlement is
//! recorded so callers can inspect what happened to each payload. Useful for
//! tests and for running the pipeline against a local cluster without a broker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

use provisioner_common::Error;

use crate::source::{Delivery, DeliveryHandle, OrderSource};

/// How a delivery ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged
    Acknowledged,
    /// Rejected, with or without requeue
    Rejected {
        /// Whether the message went back to the queue
        requeue: bool,
    },
    /// Dropped without any terminal action
    Abandoned,
}

/// One settlement observed by the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Message body
    pub payload: Vec<u8>,
    /// Earlier deliveries of this message at the time it was settled
    pub delivery_count: u32,
    /// What the consumer did
    pub settlement: Settlement,
}

struct Message {
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Message>,
    outstanding: usize,
    closed: bool,
    log: Vec<SettlementRecord>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
    report_delivery_count: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the queue itself consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, message: Message, settlement: Settlement) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.log.push(SettlementRecord {
            payload: message.payload.clone(),
            delivery_count: message.delivery_count,
            settlement,
        });
        if settlement == (Settlement::Rejected { requeue: true }) {
            state.queue.push_back(Message {
                payload: message.payload,
                delivery_count: message.delivery_count + 1,
            });
        }
        drop(state);
        self.changed.notify_waiters();
    }
}

/// Producer side of the in-process queue
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Queue that reports delivery counts the way quorum queues do
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Queue that never reports delivery counts
    pub fn without_delivery_count() -> Self {
        Self::build(false)
    }

    fn build(report_delivery_count: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                report_delivery_count,
                ..Default::default()
            }),
        }
    }

    /// Enqueue a message
    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.shared.lock().queue.push_back(Message {
            payload: payload.into(),
            delivery_count: 0,
        });
        self.shared.changed.notify_waiters();
    }

    /// End the subscription once the queue is empty and nothing is outstanding
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Consumer side of the queue
    pub fn subscribe(&self) -> MemorySource {
        MemorySource {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Settlements observed so far, in order
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.shared.lock().log.clone()
    }

    /// Messages waiting to be delivered
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a [`MemoryBroker`]
pub struct MemorySource {
    shared: Arc<Shared>,
}

#[async_trait]
impl OrderSource for MemorySource {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, Error> {
        loop {
            let changed = self.shared.changed.notified();
            {
                let mut state = self.shared.lock();
                if let Some(message) = state.queue.pop_front() {
                    state.outstanding += 1;
                    return Ok(Some(Delivery::new(MemoryDelivery {
                        shared: Arc::clone(&self.shared),
                        message: Some(message),
                    })));
                }
                if state.closed && state.outstanding == 0 {
                    return Ok(None);
                }
            }
            changed.await;
        }
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    message: Option<Message>,
}

impl MemoryDelivery {
    fn finish(mut self: Box<Self>, settlement: Settlement) -> Result<(), Error> {
        let message = self
            .message
            .take()
            .ok_or_else(|| Error::broker("settle", "delivery already settled"))?;
        self.shared.settle(message, settlement);
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandle for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map_or(&[][..], |m| m.payload.as_slice())
    }

    fn delivery_count(&self) -> Option<u32> {
        if !self.shared.report_delivery_count {
            return None;
        }
        self.message.as_ref().map(|m| m.delivery_count)
    }

    async fn ack(self: Box<Self>) -> Result<(), Error> {
        self.finish(Settlement::Acknowledged)
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), Error> {
        self.finish(Settlement::Rejected { requeue })
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            warn!(bytes = message.payload.len(), "delivery dropped without settlement");
            self.shared.settle(message, Settlement::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::source::Disposition;

    #[tokio::test]
    async fn requeued_messages_come_back_with_a_higher_count() {
        let broker = MemoryBroker::new();
        broker.publish("order");
        let mut source = broker.subscribe();

        let first = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.delivery_count(), Some(0));
        first
            .settle(Disposition::Reject { requeue: true })
            .await
            .unwrap();

        let second = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.delivery_count(), Some(1));
        second.settle(Disposition::Acknowledge).await.unwrap();

        broker.close();
        assert!(source.next_delivery().await.unwrap().is_none());
        assert_eq!(
            broker
                .settlements()
                .iter()
                .map(|r| r.settlement)
                .collect::<Vec<_>>(),
            vec![
                Settlement::Rejected { requeue: true },
                Settlement::Acknowledged
            ]
        );
    }

    #[tokio::test]
    async fn dropping_an_unsettled_delivery_is_recorded() {
        let broker = MemoryBroker::without_delivery_count();
        broker.publish("order");
        let mut source = broker.subscribe();

        let delivery = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count(), None);
        drop(delivery);

        assert_eq!(broker.settlements()[0].settlement, Settlement::Abandoned);
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        broker.publish("order");
        let mut source = broker.subscribe();
        let delivery = source.next_delivery().await.unwrap().unwrap();
        broker.close();

        let settle = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            delivery
                .settle(Disposition::Reject { requeue: true })
                .await
                .unwrap();
        };
        let (next, ()) = tokio::join!(source.next_delivery(), settle);

        // The requeued message is delivered again before the source ends.
        let again = next.unwrap().unwrap();
        again.settle(Disposition::Acknowledge).await.unwrap();
        assert!(source.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_wakes_a_waiting_consumer() {
        let broker = MemoryBroker::new();
        let mut source = broker.subscribe();
        let producer = broker.clone();

        let waiter = tokio::spawn(async move { source.next_delivery().await });
        tokio::task::yield_now().await;
        producer.publish("late order");

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload(), b"late order");
        delivery.settle(Disposition::Acknowledge).await.unwrap();
    }
}
