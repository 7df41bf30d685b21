use anyhow::Result;
use fnv::FnvHashMap;
use likely_stable::unlikely;
use log::{error, info};
use tokio_graceful_shutdown::SubsystemHandle;

use tally_core::partition::Partitioner;
use tally_core::record::{CountEntry, Token, WriteEntry};

use crate::router::KeyedRouter;

/// Running word counts of one partition.
///
/// The map is owned by exactly one worker, so it needs no lock. It starts empty, and counts
/// only grow until the process restarts. The key space is assumed bounded: nothing is ever
/// evicted.
#[derive(Debug)]
pub struct Aggregator {
    partition_id: usize,

    partitioner: Partitioner,

    counts: FnvHashMap<String, u64>,
}

impl Aggregator {
    pub fn new(partition_id: usize, partitioner: Partitioner) -> Self {
        Self {
            partition_id,
            partitioner,
            counts: FnvHashMap::default(),
        }
    }

    #[inline]
    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    /// Increment the count of the token's key by one and return the new count.
    ///
    /// The returned entry carries the token's handle; the token is not acked here.
    pub fn observe(&mut self, token: Token) -> CountEntry {
        if unlikely(self.partitioner.partition_of(&token.value) != self.partition_id) {
            error!(
                "aggregator {} observes a key owned by partition {}, key: {}",
                self.partition_id,
                self.partitioner.partition_of(&token.value),
                token.value
            );
        }

        let count = match self.counts.get_mut(&token.value) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                self.counts.insert(token.value.clone(), 1);
                1
            }
        };

        CountEntry {
            key: token.value,
            count,
            handle: token.handle,
        }
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        self.counts.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Worker of one partition: observes tokens in arrival order and routes every updated count
/// to the sink writer owning the key.
pub struct AggregatorWorker {
    aggregator: Aggregator,

    router: KeyedRouter<WriteEntry>,

    /// Column family of count rows.
    family: String,
}

impl AggregatorWorker {
    pub fn new(aggregator: Aggregator, router: KeyedRouter<WriteEntry>, family: &str) -> Self {
        Self {
            aggregator,
            router,
            family: family.to_string(),
        }
    }

    /// Observe tokens until the partition queue is closed and drained.
    pub async fn run(
        mut self,
        receiver: async_channel::Receiver<Token>,
        _subsys: SubsystemHandle,
    ) -> Result<()> {
        let partition_id = self.aggregator.partition_id();
        info!("aggregator {} started", partition_id);

        let mut total: u64 = 0;

        while let Ok(token) = receiver.recv().await {
            let entry = self.aggregator.observe(token);
            self.router
                .route(WriteEntry::from_count(entry, &self.family))
                .await;

            total += 1;
        }

        info!(
            "aggregator {} done, tokens: {}, keys: {}",
            partition_id,
            total,
            self.aggregator.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tally_core::record::DeliveryHandle;

    fn token(value: &str) -> Token {
        Token::new(value, DeliveryHandle(0))
    }

    #[test]
    fn test_word_counts() -> Result<()> {
        let mut aggregator = Aggregator::new(0, Partitioner::new(1)?);

        let counts: Vec<(String, u64)> = ["the", "quick", "the", "fox", "the"]
            .iter()
            .map(|w| aggregator.observe(token(w)))
            .map(|e| (e.key, e.count))
            .collect();

        assert_eq!(
            counts,
            vec![
                ("the".to_string(), 1),
                ("quick".to_string(), 1),
                ("the".to_string(), 2),
                ("fox".to_string(), 1),
                ("the".to_string(), 3),
            ]
        );

        assert_eq!(aggregator.count("the"), Some(3));
        assert_eq!(aggregator.count("quick"), Some(1));
        assert_eq!(aggregator.count("fox"), Some(1));
        assert_eq!(aggregator.count("dog"), None);
        assert_eq!(aggregator.len(), 3);

        Ok(())
    }

    #[test]
    fn test_entry_keeps_handle() -> Result<()> {
        let mut aggregator = Aggregator::new(0, Partitioner::new(1)?);
        let entry = aggregator.observe(Token::new("fox", DeliveryHandle(42)));

        assert_eq!(entry.handle, DeliveryHandle(42));

        Ok(())
    }

    proptest! {
        #[test]
        fn prop_counts_grow_by_one(words in prop::collection::vec("[a-c]{1,2}", 0..200)) {
            let mut aggregator = Aggregator::new(0, Partitioner::new(1).unwrap());
            let mut last: FnvHashMap<String, u64> = FnvHashMap::default();

            for word in words.iter() {
                let entry = aggregator.observe(token(word));
                let prev = last.insert(entry.key.clone(), entry.count).unwrap_or(0);
                prop_assert_eq!(entry.count, prev + 1);
            }

            prop_assert_eq!(aggregator.len(), last.len());
        }

        #[test]
        fn prop_redelivery_only_adds(words in prop::collection::vec("[a-c]{1,2}", 1..50)) {
            let mut aggregator = Aggregator::new(0, Partitioner::new(1).unwrap());

            for word in words.iter() {
                aggregator.observe(token(word));
            }
            let before: FnvHashMap<String, u64> = aggregator
                .keys()
                .map(|k| (k.to_string(), aggregator.count(k).unwrap_or(0)))
                .collect();

            // The same record delivered again.
            for word in words.iter() {
                aggregator.observe(token(word));
            }

            for (key, count) in before.iter() {
                prop_assert_eq!(aggregator.count(key), Some(count * 2));
            }
            prop_assert_eq!(aggregator.len(), before.len());
        }
    }
}
