//! Settlement policy
//!
//! Maps a job outcome and its attempt number onto exactly one [`Disposition`].
//! Transient failures are requeued a bounded number of times; everything else
//! is settled immediately.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use provisioner_common::Error;

use crate::source::{Delivery, Disposition};

/// Default number of requeues before a transiently failing order is dropped
pub const DEFAULT_MAX_REQUEUES: u32 = 5;

/// What to do with a delivery once its job has finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Terminal action for the delivery
    pub disposition: Disposition,
    /// Whether an operator must be told about this outcome
    pub alert: bool,
    /// Short label explaining the decision
    pub reason: &'static str,
}

/// Outcome to settlement mapping with a bounded requeue budget
#[derive(Clone, Copy, Debug)]
pub struct AckPolicy {
    max_requeues: u32,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEUES)
    }
}

impl AckPolicy {
    /// Policy allowing `max_requeues` redeliveries of a transiently failing order
    pub fn new(max_requeues: u32) -> Self {
        Self { max_requeues }
    }

    /// Decide the settlement for a job outcome
    ///
    /// `attempt` is 1 on first delivery. A retryable failure is requeued while
    /// `attempt <= max_requeues` and dropped with an alert afterwards.
    pub fn decide<T>(&self, outcome: &Result<T, Error>, attempt: u32) -> Decision {
        let err = match outcome {
            Ok(_) => {
                return Decision {
                    disposition: Disposition::Acknowledge,
                    alert: false,
                    reason: "provisioned",
                }
            }
            Err(err) => err,
        };

        if err.is_retryable() {
            if attempt <= self.max_requeues {
                return Decision {
                    disposition: Disposition::Reject { requeue: true },
                    alert: false,
                    reason: "retryable",
                };
            }
            return Decision {
                disposition: Disposition::Reject { requeue: false },
                alert: true,
                reason: "requeue_budget_exhausted",
            };
        }

        match err {
            Error::Decode { .. } | Error::Validation { .. } => Decision {
                disposition: Disposition::Reject { requeue: false },
                alert: false,
                reason: "invalid_order",
            },
            _ => Decision {
                disposition: Disposition::Reject { requeue: false },
                alert: true,
                reason: "permanent_failure",
            },
        }
    }
}

/// Default time a payload is remembered after its last delivery
pub const DEFAULT_TRACKER_TTL: Duration = Duration::from_secs(60 * 60);

/// Default number of payloads remembered at once
pub const DEFAULT_TRACKER_CAPACITY: usize = 10_000;

/// Attempt counting for brokers that do not report redeliveries
///
/// Keyed by a hash of the payload, so identical payloads share a count.
/// Entries are removed once a message is settled for good here. A message
/// requeued here and settled by another consumer is never seen again, so
/// entries also expire `ttl` after their last delivery, and the oldest are
/// evicted once more than `capacity` payloads are tracked.
#[derive(Debug)]
pub struct RedeliveryTracker {
    seen: DashMap<u64, Seen>,
    ttl: Duration,
    capacity: usize,
}

#[derive(Clone, Copy, Debug)]
struct Seen {
    deliveries: u32,
    last: Instant,
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::with_limits(DEFAULT_TRACKER_TTL, DEFAULT_TRACKER_CAPACITY)
    }
}

impl RedeliveryTracker {
    /// Create an empty tracker with the default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty tracker remembering at most `capacity` payloads for `ttl` each
    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record one more delivery of `delivery` and return its attempt number
    ///
    /// The broker's own count wins when it is higher than what this process
    /// has observed.
    pub fn attempt(&self, delivery: &Delivery) -> u32 {
        let now = Instant::now();
        let deliveries = {
            let mut seen = self.seen.entry(key(delivery.payload())).or_insert(Seen {
                deliveries: 0,
                last: now,
            });
            if now.saturating_duration_since(seen.last) > self.ttl {
                seen.deliveries = 0;
            }
            seen.deliveries += 1;
            seen.last = now;
            seen.deliveries
        };
        if self.seen.len() > self.capacity {
            self.evict(now);
        }

        let from_broker = delivery.delivery_count().map_or(0, |n| n.saturating_add(1));
        deliveries.max(from_broker)
    }

    /// Drop the record for a payload
    pub fn forget(&self, payload: &[u8]) {
        self.seen.remove(&key(payload));
    }

    /// Number of payloads currently tracked
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&self, now: Instant) {
        self.seen
            .retain(|_, seen| now.saturating_duration_since(seen.last) <= self.ttl);

        let excess = self.seen.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(Instant, u64)> =
            self.seen.iter().map(|e| (e.value().last, *e.key())).collect();
        by_age.sort_unstable();
        for (_, key) in by_age.into_iter().take(excess) {
            self.seen.remove(&key);
        }
        debug!(evicted = excess, "redelivery tracker over capacity");
    }
}

fn key(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::source::DeliveryHandle;

    struct Counted(Vec<u8>, Option<u32>);

    #[async_trait]
    impl DeliveryHandle for Counted {
        fn payload(&self) -> &[u8] {
            &self.0
        }
        fn delivery_count(&self) -> Option<u32> {
            self.1
        }
        async fn ack(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
        async fn reject(self: Box<Self>, _requeue: bool) -> Result<(), Error> {
            Ok(())
        }
    }

    const DROP: Disposition = Disposition::Reject { requeue: false };
    const REQUEUE: Disposition = Disposition::Reject { requeue: true };

    #[test]
    fn success_is_acknowledged() {
        let decision = AckPolicy::default().decide(&Ok::<(), Error>(()), 1);
        assert_eq!(decision.disposition, Disposition::Acknowledge);
        assert!(!decision.alert);
    }

    #[test]
    fn outcome_table() {
        let policy = AckPolicy::default();
        let cases: Vec<(Error, Disposition, bool)> = vec![
            (Error::decode("expected value"), DROP, false),
            (Error::validation("cluster_name is empty"), DROP, false),
            (
                Error::AllocationTimeout {
                    waited: Duration::from_secs(10),
                    attempts: 200,
                },
                REQUEUE,
                false,
            ),
            (Error::transient("list_services", "503"), REQUEUE, false),
            (
                Error::JobTimeout {
                    deadline: Duration::from_secs(120),
                },
                REQUEUE,
                false,
            ),
            (Error::conflict("u-123", "acme-prod", "spec differs"), DROP, true),
            (Error::fatal("create_tenant", "forbidden"), DROP, true),
        ];

        for (err, disposition, alert) in cases {
            let label = err.kind();
            let decision = policy.decide(&Err::<(), _>(err), 1);
            assert_eq!(decision.disposition, disposition, "{label}");
            assert_eq!(decision.alert, alert, "{label}");
        }
    }

    /// Story: a poison message that keeps failing transiently is eventually dropped
    #[test]
    fn story_requeue_budget_is_bounded() {
        let policy = AckPolicy::new(3);
        let outcome = Err::<(), _>(Error::transient("create_namespace", "timeout"));

        let dispositions: Vec<_> = (1..=5)
            .map(|attempt| policy.decide(&outcome, attempt))
            .collect();

        assert!(dispositions[..3].iter().all(|d| d.disposition == REQUEUE));
        assert_eq!(dispositions[3].disposition, DROP);
        assert!(dispositions[3].alert);
        assert_eq!(dispositions[3].reason, "requeue_budget_exhausted");
    }

    #[test]
    fn zero_budget_drops_on_first_failure() {
        let decision =
            AckPolicy::new(0).decide(&Err::<(), _>(Error::transient("x", "y")), 1);
        assert_eq!(decision.disposition, DROP);
    }

    #[test]
    fn tracker_counts_redeliveries_without_broker_help() {
        let tracker = RedeliveryTracker::new();
        let first = Delivery::new(Counted(b"order-1".to_vec(), None));
        let again = Delivery::new(Counted(b"order-1".to_vec(), None));
        let other = Delivery::new(Counted(b"order-2".to_vec(), None));

        assert_eq!(tracker.attempt(&first), 1);
        assert_eq!(tracker.attempt(&again), 2);
        assert_eq!(tracker.attempt(&other), 1);

        tracker.forget(b"order-1");
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_expire() {
        let tracker = RedeliveryTracker::with_limits(Duration::from_secs(60), 100);
        let payload = || Delivery::new(Counted(b"order-1".to_vec(), None));

        assert_eq!(tracker.attempt(&payload()), 1);
        assert_eq!(tracker.attempt(&payload()), 2);

        // Settled by another consumer; this one only sees it again much later.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.attempt(&payload()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_entries_are_evicted_over_capacity() {
        let tracker = RedeliveryTracker::with_limits(Duration::from_secs(3600), 3);
        for i in 0..5 {
            let delivery = Delivery::new(Counted(format!("order-{i}").into_bytes(), None));
            tracker.attempt(&delivery);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(tracker.len(), 3);
        let oldest = Delivery::new(Counted(b"order-0".to_vec(), None));
        let newest = Delivery::new(Counted(b"order-4".to_vec(), None));
        assert_eq!(tracker.attempt(&newest), 2);
        assert_eq!(tracker.attempt(&oldest), 1);
    }

    #[test]
    fn broker_count_wins_when_higher() {
        let tracker = RedeliveryTracker::new();
        let delivery = Delivery::new(Counted(b"order-1".to_vec(), Some(4)));
        assert_eq!(tracker.attempt(&delivery), 5);
    }
}
