use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use tokio_graceful_shutdown::SubsystemHandle;

use tally_core::ack::{AckTracker, FailureKind};
use tally_core::record::{Record, Token};

use crate::router::KeyedRouter;

/// Split `text` on every non-letter character and lowercase the words.
///
/// Lazy and finite. Empty words between consecutive separators are skipped.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
}

/// `Normalizer` turns records into tokens and routes each token to the aggregator owning it.
///
/// All normalizer workers share the inbound record queue, so a record goes to whichever
/// worker is free. The record's handle is opened with a guard reference, retained once per
/// token, and the guard is released after the last token is routed. A record with no words
/// is acked as soon as the guard is released.
///
/// A payload that is not valid `utf-8` is failed at once, without any token.
pub struct Normalizer {
    worker_id: usize,

    tracker: Arc<AckTracker>,

    router: KeyedRouter<Token>,

    /// Records processed.
    total: u64,

    /// Tokens routed.
    tokens: u64,
}

impl Normalizer {
    pub fn new(worker_id: usize, tracker: Arc<AckTracker>, router: KeyedRouter<Token>) -> Self {
        Self {
            worker_id,
            tracker,
            router,
            total: 0,
            tokens: 0,
        }
    }

    /// Normalize one record. Returns the number of tokens routed.
    pub async fn process(&mut self, record: Record) -> usize {
        let handle = record.handle;
        self.tracker.open(handle);
        self.total += 1;

        let text = match std::str::from_utf8(&record.payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "normalizer {} cannot decode record, handle: {}, error: {}",
                    self.worker_id, handle, e
                );
                self.tracker.fail(handle, FailureKind::Decode);
                return 0;
            }
        };

        let mut routed = 0;

        for word in tokenize(text) {
            self.tracker.retain(handle);

            if self.router.route(Token::new(word, handle)).await {
                routed += 1;
            }
        }

        self.tracker.release(handle);
        self.tokens += routed as u64;

        routed
    }

    /// Process records until the inbound queue is closed and drained.
    pub async fn run(
        mut self,
        receiver: async_channel::Receiver<Record>,
        _subsys: SubsystemHandle,
    ) -> Result<()> {
        info!("normalizer {} started", self.worker_id);

        while let Ok(record) = receiver.recv().await {
            self.process(record).await;
        }

        info!(
            "normalizer {} done, records: {}, tokens: {}",
            self.worker_id, self.total, self.tokens
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_core::ack::AckEvent;
    use tally_core::record::DeliveryHandle;
    use tally_core::tool::setup_log;

    fn words(text: &str) -> Vec<String> {
        tokenize(text).collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(words("The quick, brown FOX!"), vec!["the", "quick", "brown", "fox"]);
        assert_eq!(words("it's 42nd--street"), vec!["it", "s", "nd", "street"]);
        assert_eq!(words("Straße café"), vec!["straße", "café"]);
        assert!(words("").is_empty());
        assert!(words(" 123 ... ").is_empty());
    }

    #[test]
    fn test_tokenize_is_lazy() {
        let mut tokens = tokenize("a b c");

        assert_eq!(tokens.next(), Some("a".to_string()));
        assert_eq!(tokens.next(), Some("b".to_string()));
    }

    fn normalizer(
        partitions: usize,
    ) -> Result<(
        Normalizer,
        Vec<async_channel::Receiver<Token>>,
        Arc<AckTracker>,
        async_channel::Receiver<AckEvent>,
    )> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..partitions).map(|_| async_channel::bounded(64)).unzip();

        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);

        let router = KeyedRouter::new(senders, tracker.clone(), 1, Duration::ZERO)?;

        Ok((Normalizer::new(0, tracker.clone(), router), receivers, tracker, acks))
    }

    #[tokio::test]
    async fn test_decode_failure() -> Result<()> {
        setup_log();

        let (mut normalizer, receivers, _tracker, acks) = normalizer(2)?;

        let routed = normalizer
            .process(Record::new(DeliveryHandle(5), vec![0xff, 0xfe, b'a']))
            .await;

        assert_eq!(routed, 0);
        assert!(receivers.iter().all(|r| r.is_empty()));
        assert_eq!(
            acks.try_recv()?,
            AckEvent::Fail(DeliveryHandle(5), FailureKind::Decode)
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_record_acked_after_every_token_released() -> Result<()> {
        let (mut normalizer, receivers, tracker, acks) = normalizer(2)?;

        let routed = normalizer
            .process(Record::new(DeliveryHandle(1), "the quick the"))
            .await;
        assert_eq!(routed, 3);
        assert!(acks.try_recv().is_err());

        let mut tokens = Vec::new();
        for receiver in receivers.iter() {
            while let Ok(token) = receiver.try_recv() {
                tokens.push(token);
            }
        }
        assert_eq!(tokens.len(), 3);

        for token in tokens {
            assert!(acks.try_recv().is_err());
            tracker.release(token.handle);
        }

        assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(1)));

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_record_acked_at_once() -> Result<()> {
        let (mut normalizer, _receivers, _tracker, acks) = normalizer(1)?;

        assert_eq!(normalizer.process(Record::new(DeliveryHandle(2), "  42 ")).await, 0);
        assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(2)));

        Ok(())
    }
}
