use likely_stable::unlikely;
use log::{error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tally_core::ack::{AckTracker, FailureKind};
use tally_core::error_bail;
use tally_core::partition::Partitioner;
use tally_core::record::Keyed;
use tally_core::tool::backoff_ms;

/// `KeyedRouter` sends every item to the inbound queue of the worker owning its key.
///
/// The worker is chosen by `Partitioner`, so a key always lands on the same worker. Sending
/// blocks while the target queue is full, which is how backpressure reaches the upstream
/// stage.
///
/// A closed queue means the target worker is unreachable. The send is retried with backoff up
/// to `retry_budget` attempts, then the item's record is failed with `FailureKind::Routing`.
/// Once a worker is given up, later items for it are failed without waiting.
///
/// Every upstream worker owns its own router, cloned from the same senders. Clones share
/// the set of workers given up.
pub struct KeyedRouter<T: Keyed> {
    senders: Vec<async_channel::Sender<T>>,

    partitioner: Partitioner,

    tracker: Arc<AckTracker>,

    retry_budget: u32,

    retry_backoff: Duration,

    /// Workers given up after exhausting the retry budget.
    down: Arc<Vec<AtomicBool>>,
}

impl<T: Keyed> KeyedRouter<T> {
    pub fn new(
        senders: Vec<async_channel::Sender<T>>,
        tracker: Arc<AckTracker>,
        retry_budget: u32,
        retry_backoff: Duration,
    ) -> Result<Self> {
        if retry_budget == 0 {
            error_bail!("retry_budget must be positive");
        }

        let partitioner = Partitioner::new(senders.len())?;
        let down = Arc::new(
            (0..senders.len())
                .map(|_| AtomicBool::new(false))
                .collect::<Vec<_>>(),
        );

        Ok(Self {
            senders,
            partitioner,
            tracker,
            retry_budget,
            retry_backoff,
            down,
        })
    }

    #[inline]
    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Route `item` to its worker. Returns false if the item's record was failed.
    pub async fn route(&mut self, item: T) -> bool {
        let target = self.partitioner.partition_of(item.routing_key());

        if unlikely(self.down[target].load(Ordering::Relaxed)) {
            self.tracker.fail(item.handle(), FailureKind::Routing);
            return false;
        }

        let mut item = item;

        for attempt in 1..=self.retry_budget {
            match self.senders[target].send(item).await {
                Ok(()) => return true,
                Err(async_channel::SendError(back)) => {
                    item = back;

                    warn!(
                        "route failed, worker is unreachable, target: {}, key: {}, attempt: {}",
                        target,
                        item.routing_key(),
                        attempt
                    );
                }
            }

            if attempt < self.retry_budget {
                let backoff = backoff_ms(self.retry_backoff.as_millis() as u64, attempt);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        error!(
            "give up worker after {} attempts, target: {}, failing handle: {}",
            self.retry_budget,
            target,
            item.handle()
        );

        self.down[target].store(true, Ordering::Relaxed);
        self.tracker.fail(item.handle(), FailureKind::Routing);

        false
    }
}

impl<T: Keyed> Clone for KeyedRouter<T> {
    fn clone(&self) -> Self {
        Self {
            senders: self.senders.clone(),
            partitioner: self.partitioner,
            tracker: self.tracker.clone(),
            retry_budget: self.retry_budget,
            retry_backoff: self.retry_backoff,
            down: self.down.clone(),
        }
    }
}
