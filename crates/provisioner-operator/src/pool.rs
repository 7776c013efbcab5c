//! Bounded-concurrency worker pool
//!
//! One dispatch loop pulls deliveries and fans them out to at most N jobs.
//! A permit is taken *before* the next delivery is read, so when all workers
//! are busy the unread orders stay queued at the broker.
//!
//! Jobs are isolated from each other: each runs in its own task under its own
//! deadline, and a failing job only affects its own delivery. The shutdown
//! token stops dispatching; it is never passed to running jobs, which are
//! drained to completion.

use std::any::Any;
use std::fmt;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use provisioner_common::Error;
use provisioner_queue::{AckPolicy, Delivery, Disposition, OrderSource, RedeliveryTracker};

/// Default number of jobs in flight
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default per-job deadline
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Work performed for each delivery
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Handle one raw payload
    async fn run(&self, payload: &[u8]) -> Result<(), Error>;
}

/// Pool settings
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum jobs in flight
    pub concurrency: usize,
    /// Deadline of each job, from dispatch to settlement decision
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Counters for one run of the pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Deliveries handed to a job
    pub dispatched: u64,
    /// Deliveries acknowledged
    pub acknowledged: u64,
    /// Deliveries rejected without requeue
    pub rejected: u64,
    /// Deliveries rejected with requeue
    pub requeued: u64,
    /// Settlements the broker did not accept
    pub settle_failures: u64,
    /// Jobs whose task panicked before settling
    pub panicked: u64,
}

impl PoolStats {
    fn record(&mut self, finished: Result<Settled, JoinError>) {
        match finished {
            Ok(settled) => {
                match settled.disposition {
                    Disposition::Acknowledge => self.acknowledged += 1,
                    Disposition::Reject { requeue: true } => self.requeued += 1,
                    Disposition::Reject { requeue: false } => self.rejected += 1,
                }
                if !settled.confirmed {
                    self.settle_failures += 1;
                }
            }
            Err(e) => {
                error!(error = %e, alert = true, "job task failed before settling its delivery");
                self.panicked += 1;
            }
        }
    }

    /// Deliveries that reached a terminal action
    pub fn settled(&self) -> u64 {
        self.acknowledged + self.rejected + self.requeued
    }
}

impl AddAssign for PoolStats {
    fn add_assign(&mut self, rhs: Self) {
        self.dispatched += rhs.dispatched;
        self.acknowledged += rhs.acknowledged;
        self.rejected += rhs.rejected;
        self.requeued += rhs.requeued;
        self.settle_failures += rhs.settle_failures;
        self.panicked += rhs.panicked;
    }
}

struct Settled {
    disposition: Disposition,
    confirmed: bool,
}

/// Fans deliveries out to a [`Job`] with bounded concurrency
pub struct WorkerPool<J> {
    job: Arc<J>,
    config: PoolConfig,
    policy: AckPolicy,
    tracker: Arc<RedeliveryTracker>,
}

impl<J> fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<J: Job> WorkerPool<J> {
    /// Create a pool running `job`; concurrency is at least one
    pub fn new(job: J, config: PoolConfig, policy: AckPolicy) -> Self {
        Self {
            job: Arc::new(job),
            config: PoolConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            policy,
            tracker: Arc::new(RedeliveryTracker::new()),
        }
    }

    /// Consume `source` until it ends or `shutdown` is cancelled
    ///
    /// Returns once every dispatched job has settled its delivery. A source
    /// failure stops dispatching and is returned after the drain.
    pub async fn run<S: OrderSource>(
        &self,
        mut source: S,
        shutdown: CancellationToken,
    ) -> Result<PoolStats, Error> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut stats = PoolStats::default();

        info!(
            concurrency = self.config.concurrency,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "worker pool started"
        );

        let stopped = loop {
            while let Some(finished) = tasks.try_join_next() {
                stats.record(finished);
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(Error::internal_with_context("worker_pool", "permits closed")),
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = source.next_delivery() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        info!("order source ended");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            };

            stats.dispatched += 1;
            let job = Arc::clone(&self.job);
            let tracker = Arc::clone(&self.tracker);
            let policy = self.policy;
            let timeout = self.config.job_timeout;
            let span = info_span!("job", seq = stats.dispatched, attempt = tracing::field::Empty);

            tasks.spawn(
                async move {
                    let settled = process(job.as_ref(), &tracker, policy, timeout, delivery).await;
                    drop(permit);
                    settled
                }
                .instrument(span),
            );
        };

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight jobs");
        }
        while let Some(finished) = tasks.join_next().await {
            stats.record(finished);
        }

        info!(
            dispatched = stats.dispatched,
            acknowledged = stats.acknowledged,
            rejected = stats.rejected,
            requeued = stats.requeued,
            "worker pool stopped"
        );

        match stopped {
            Ok(()) => Ok(stats),
            Err(e) => {
                error!(error = %e, "order source failed");
                Err(e)
            }
        }
    }
}

/// Run one job and settle its delivery exactly once
async fn process<J: Job + ?Sized>(
    job: &J,
    tracker: &RedeliveryTracker,
    policy: AckPolicy,
    timeout: Duration,
    delivery: Delivery,
) -> Settled {
    let attempt = tracker.attempt(&delivery);
    tracing::Span::current().record("attempt", attempt);

    // A panicking job still owes its delivery a settlement.
    let run = AssertUnwindSafe(job.run(delivery.payload())).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => Err(Error::internal_with_context(
            "job",
            format!("job panicked: {}", panic_message(panic.as_ref())),
        )),
        Err(_) => Err(Error::JobTimeout { deadline: timeout }),
    };
    let decision = policy.decide(&outcome, attempt);

    match &outcome {
        Ok(()) => debug!(disposition = %decision.disposition, "job succeeded"),
        Err(e) if decision.alert => error!(
            error = %e,
            kind = e.kind(),
            reason = decision.reason,
            disposition = %decision.disposition,
            alert = true,
            "order dropped"
        ),
        Err(e) => warn!(
            error = %e,
            kind = e.kind(),
            reason = decision.reason,
            disposition = %decision.disposition,
            "job failed"
        ),
    }

    if decision.disposition != (Disposition::Reject { requeue: true }) {
        tracker.forget(delivery.payload());
    }

    let confirmed = match delivery.settle(decision.disposition).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, disposition = %decision.disposition, "failed to settle delivery");
            false
        }
    };

    Settled {
        disposition: decision.disposition,
        confirmed,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use provisioner_queue::{MemoryBroker, Settlement};

    struct Sleepy {
        running: AtomicUsize,
        peak: AtomicUsize,
        pause: Duration,
    }

    #[async_trait]
    impl Job for Arc<Sleepy> {
        async fn run(&self, _payload: &[u8]) -> Result<(), Error> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.pause).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sleepy(pause: Duration) -> Arc<Sleepy> {
        Arc::new(Sleepy {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            pause,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let broker = MemoryBroker::new();
        for i in 0..12 {
            broker.publish(format!("order-{i}"));
        }
        broker.close();

        let job = sleepy(Duration::from_millis(100));
        let pool = WorkerPool::new(
            Arc::clone(&job),
            PoolConfig {
                concurrency: 3,
                job_timeout: Duration::from_secs(5),
            },
            AckPolicy::default(),
        );

        let stats = pool
            .run(broker.subscribe(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.dispatched, 12);
        assert_eq!(stats.acknowledged, 12);
        assert_eq!(job.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_is_requeued_after_its_deadline() {
        let broker = MemoryBroker::new();
        broker.publish("slow");

        let pool = WorkerPool::new(
            sleepy(Duration::from_secs(600)),
            PoolConfig {
                concurrency: 1,
                job_timeout: Duration::from_secs(1),
            },
            AckPolicy::new(0),
        );
        broker.close();

        let stats = pool
            .run(broker.subscribe(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.rejected, 1);
        assert_eq!(
            broker.settlements()[0].settlement,
            Settlement::Rejected { requeue: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_dispatch_and_drains_in_flight_jobs() {
        let broker = MemoryBroker::new();
        for i in 0..4 {
            broker.publish(format!("order-{i}"));
        }

        let pool = WorkerPool::new(
            sleepy(Duration::from_secs(2)),
            PoolConfig {
                concurrency: 2,
                job_timeout: Duration::from_secs(10),
            },
            AckPolicy::default(),
        );
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let stats = pool.run(broker.subscribe(), shutdown).await.unwrap();

        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.acknowledged, 2);
        assert_eq!(broker.pending(), 2);
        assert!(broker
            .settlements()
            .iter()
            .all(|r| r.settlement == Settlement::Acknowledged));
    }

    struct Panicky;

    #[async_trait]
    impl Job for Panicky {
        async fn run(&self, payload: &[u8]) -> Result<(), Error> {
            if payload == b"boom" {
                panic!("tenant template missing");
            }
            Ok(())
        }
    }

    /// Story: a job that panics still gets its delivery dropped, and its siblings finish
    #[tokio::test]
    async fn story_panicking_job_still_settles_its_delivery() {
        let broker = MemoryBroker::new();
        broker.publish("ok-1");
        broker.publish("boom");
        broker.publish("ok-2");
        broker.close();

        let pool = WorkerPool::new(
            Panicky,
            PoolConfig {
                concurrency: 2,
                job_timeout: Duration::from_secs(5),
            },
            AckPolicy::default(),
        );

        let stats = pool
            .run(broker.subscribe(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.acknowledged, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.panicked, 0);

        let settlements = broker.settlements();
        assert_eq!(settlements.len(), 3);
        let boom = settlements
            .iter()
            .find(|r| r.payload == b"boom")
            .expect("panicking delivery settled");
        assert_eq!(boom.settlement, Settlement::Rejected { requeue: false });
        assert!(settlements
            .iter()
            .all(|r| r.settlement != Settlement::Abandoned));
    }

    #[test]
    fn panic_payloads_are_described() {
        let literal: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(literal.as_ref()), "static message");

        let owned: Box<dyn Any + Send> = Box::new(String::from("formatted message"));
        assert_eq!(panic_message(owned.as_ref()), "formatted message");

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn stats_accumulate() {
        let mut total = PoolStats {
            dispatched: 2,
            acknowledged: 1,
            requeued: 1,
            ..Default::default()
        };
        total += PoolStats {
            dispatched: 1,
            rejected: 1,
            ..Default::default()
        };
        assert_eq!(total.dispatched, 3);
        assert_eq!(total.settled(), 3);
    }
}
