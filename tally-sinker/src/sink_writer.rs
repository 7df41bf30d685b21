use anyhow::Result;
use fnv::FnvHashMap;
use likely_stable::unlikely;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_graceful_shutdown::SubsystemHandle;

use tally_core::ack::{AckTracker, FailureKind};
use tally_core::config::PipelineConfig;
use tally_core::error_bail;
use tally_core::record::{Row, WriteEntry};
use tally_core::store::{RowResult, SinkStore};
use tally_core::tool::backoff_ms;

/// Settings of one `SinkWriter`.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkWriterConfig {
    /// Buffer length that triggers a flush.
    pub flush_threshold: usize,

    /// Flush a non-empty buffer that has not been flushed for this long.
    pub flush_interval: Option<Duration>,

    /// Timeout of one write call.
    pub flush_timeout: Duration,

    /// Write attempts per flush.
    pub retry_budget: u32,

    pub retry_backoff: Duration,

    /// Deadline of the final flush once shutdown is requested.
    pub shutdown_timeout: Duration,

    /// Log throughput every `log_every` entries. `0` disables it.
    pub log_every: u64,
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1000,
            flush_interval: Some(Duration::from_millis(1000)),
            flush_timeout: Duration::from_millis(3000),
            retry_budget: 3,
            retry_backoff: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(5000),
            log_every: 20000,
        }
    }
}

impl SinkWriterConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            flush_threshold: config.sink.flush_threshold,
            flush_interval: config.sink.flush_interval(),
            flush_timeout: config.sink.flush_timeout(),
            retry_budget: config.pipeline.retry_budget,
            retry_backoff: config.retry_backoff(),
            shutdown_timeout: config.shutdown_timeout(),
            log_every: config.sink.log_every,
        }
    }
}

/// Result of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Entries confirmed written, their records released.
    pub written: usize,

    /// Entries given up, their records failed.
    pub failed: usize,

    /// Write calls issued.
    pub attempts: u32,
}

/// `SinkWriter` buffers write entries and writes them to the sink store in batches.
///
/// One `SinkWriter` owns one buffer. The store handle is passed in at construction and may
/// be shared with other writers, but every batch is issued as one request by the writer that
/// owns it.
///
/// A flush is triggered when the buffer reaches `flush_threshold`, when the buffer has not
/// been flushed for `flush_interval`, and once more when the writer stops. The buffer is
/// always empty after a flush: entries are either written and their records released to the
/// `AckTracker`, or failed after `retry_budget` attempts.
///
/// Entries with the same key in one batch are written as one row carrying the latest
/// value. The outcome of that row applies to every entry that mapped to it.
pub struct SinkWriter {
    writer_id: usize,

    store: Arc<dyn SinkStore>,

    tracker: Arc<AckTracker>,

    config: SinkWriterConfig,

    /// Pending entries, in arrival order.
    buffer: Vec<WriteEntry>,

    last_flush: coarsetime::Instant,

    /// Entries appended so far.
    total: u64,

    /// Start of the current throughput window.
    window_start: coarsetime::Instant,

    /// Set once shutdown is requested. Every flush after that ends by this instant.
    deadline: Option<Instant>,
}

impl SinkWriter {
    pub fn new(
        writer_id: usize,
        store: Arc<dyn SinkStore>,
        tracker: Arc<AckTracker>,
        config: SinkWriterConfig,
    ) -> Result<Self> {
        if config.flush_threshold == 0 {
            error_bail!("flush_threshold must be positive, writer_id: {}", writer_id);
        }

        if config.retry_budget == 0 {
            error_bail!("retry_budget must be positive, writer_id: {}", writer_id);
        }

        if config.flush_threshold > store.max_batch_rows() {
            error_bail!(
                "flush_threshold exceeds store max_batch_rows, writer_id: {}, flush_threshold: {}, max_batch_rows: {}",
                writer_id,
                config.flush_threshold,
                store.max_batch_rows()
            );
        }

        let now = coarsetime::Instant::now();

        Ok(Self {
            writer_id,
            store,
            tracker,
            buffer: Vec::with_capacity(config.flush_threshold),
            config,
            last_flush: now,
            total: 0,
            window_start: now,
            deadline: None,
        })
    }

    #[inline]
    pub fn writer_id(&self) -> usize {
        self.writer_id
    }

    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bound every following flush by `shutdown_timeout` from now. Entries not written by
    /// then are failed with `FailureKind::Shutdown`. Calling it again keeps the first deadline.
    pub fn start_shutdown(&mut self) -> Instant {
        let timeout = self.config.shutdown_timeout;
        *self.deadline.get_or_insert_with(|| Instant::now() + timeout)
    }

    /// Append one entry. Flushes if the buffer reaches `flush_threshold`.
    pub async fn append(&mut self, entry: WriteEntry) -> Option<FlushOutcome> {
        self.buffer.push(entry);
        self.total += 1;

        if self.config.log_every > 0 && self.total % self.config.log_every == 0 {
            let now = coarsetime::Instant::now();
            info!(
                "[RESULT] sink writer {}, the time of {} entries is [{}] ms, total: {}",
                self.writer_id,
                self.config.log_every,
                now.duration_since(self.window_start).as_millis(),
                self.total
            );
            self.window_start = now;
        }

        if self.buffer.len() >= self.config.flush_threshold {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Write every buffered entry, retrying up to `retry_budget` attempts.
    ///
    /// After `start_shutdown`, the flush also ends at the shutdown deadline.
    pub async fn flush(&mut self) -> FlushOutcome {
        self.flush_until(self.deadline).await
    }

    /// Flush if the buffer is not empty and `flush_interval` passed since the last flush.
    pub async fn flush_if_idle(&mut self) -> Option<FlushOutcome> {
        let interval = self.config.flush_interval?;

        if self.buffer.is_empty() {
            return None;
        }

        let elapsed = self.last_flush.elapsed().as_millis();
        if u128::from(elapsed) >= interval.as_millis() {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Run the writer until its input is closed and drained.
    ///
    /// Shutdown is not an exit condition by itself: upstream stages close the input once
    /// they are drained. After a shutdown request, whatever is still buffered or queued when
    /// `shutdown_timeout` expires is failed.
    pub async fn run(
        mut self,
        receiver: async_channel::Receiver<WriteEntry>,
        subsys: SubsystemHandle,
    ) -> Result<()> {
        info!("sink writer {} started", self.writer_id);

        let interval = self
            .config
            .flush_interval
            .map(|d| d.max(Duration::from_millis(1)));

        let mut ticker = tokio::time::interval(interval.unwrap_or(Duration::from_secs(3600)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let has_interval = interval.is_some();

        loop {
            // The request may have arrived while a flush was running.
            if self.deadline.is_none() && subsys.is_shutdown_requested() {
                info!("sink writer {} shutdown requested, draining", self.writer_id);
                self.start_shutdown();
            }

            let deadline = self.deadline;

            tokio::select! {
                entry = receiver.recv() => {
                    match entry {
                        Ok(entry) => {
                            if let Some(outcome) = self.append(entry).await {
                                self.log_outcome("threshold", &outcome);
                            }
                        }
                        Err(_) => {
                            info!("sink writer {} input closed", self.writer_id);
                            break;
                        }
                    }
                },
                _ = ticker.tick(), if has_interval => {
                    if let Some(outcome) = self.flush_if_idle().await {
                        self.log_outcome("interval", &outcome);
                    }
                },
                _ = subsys.on_shutdown_requested(), if deadline.is_none() => {
                    info!("sink writer {} shutdown requested, draining", self.writer_id);
                    self.start_shutdown();
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    warn!("sink writer {} shutdown deadline reached while draining", self.writer_id);
                    receiver.close();
                    break;
                }
            }
        }

        // Entries left in the queue after the deadline are never written.
        while let Ok(entry) = receiver.try_recv() {
            self.tracker.fail(entry.handle, FailureKind::Shutdown);
        }

        let deadline = self.start_shutdown();
        let outcome = self.flush_until(Some(deadline)).await;
        self.log_outcome("final", &outcome);

        info!(
            "sink writer {} done, total entries: {}",
            self.writer_id, self.total
        );

        Ok(())
    }

    fn log_outcome(&self, trigger: &str, outcome: &FlushOutcome) {
        if outcome.attempts == 0 && outcome.failed == 0 {
            return;
        }

        if unlikely(outcome.failed > 0) {
            error!(
                "sink writer {} {} flush, written: {}, failed: {}, attempts: {}",
                self.writer_id, trigger, outcome.written, outcome.failed, outcome.attempts
            );
        } else {
            info!(
                "sink writer {} {} flush, written: {}, attempts: {}",
                self.writer_id, trigger, outcome.written, outcome.attempts
            );
        }
    }

    async fn flush_until(&mut self, deadline: Option<Instant>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        if self.buffer.is_empty() {
            return outcome;
        }

        let mut pending = std::mem::take(&mut self.buffer);
        let mut failure_kind = FailureKind::Sink;

        for attempt in 1..=self.config.retry_budget {
            let timeout = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        failure_kind = FailureKind::Shutdown;
                        break;
                    }

                    left.min(self.config.flush_timeout)
                }
                None => self.config.flush_timeout,
            };

            outcome.attempts = attempt;

            let (rows, groups) = coalesce(&pending);

            match tokio::time::timeout(timeout, self.store.write_batch(&rows)).await {
                Ok(Ok(results)) if results.len() == rows.len() => {
                    pending = self.release_written(pending, &results, &groups, &mut outcome);
                }
                Ok(Ok(results)) => {
                    error!(
                        "sink writer {} store returned {} results for {} rows, attempt: {}",
                        self.writer_id,
                        results.len(),
                        rows.len(),
                        attempt
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        "sink writer {} write failed, rows: {}, attempt: {}, error: {}",
                        self.writer_id,
                        rows.len(),
                        attempt,
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "sink writer {} write timed out, rows: {}, attempt: {}, timeout: {:?}",
                        self.writer_id,
                        rows.len(),
                        attempt,
                        timeout
                    );
                }
            }

            if pending.is_empty() {
                break;
            }

            if attempt < self.config.retry_budget {
                let backoff = Duration::from_millis(backoff_ms(
                    self.config.retry_backoff.as_millis() as u64,
                    attempt,
                ));

                if let Some(deadline) = deadline {
                    if Instant::now() + backoff >= deadline {
                        failure_kind = FailureKind::Shutdown;
                        break;
                    }
                }

                tokio::time::sleep(backoff).await;
            }
        }

        for entry in pending {
            self.tracker.fail(entry.handle, failure_kind);
            outcome.failed += 1;
        }

        self.last_flush = coarsetime::Instant::now();

        outcome
    }

    /// Release entries whose row was written. Returns the entries to retry.
    fn release_written(
        &self,
        pending: Vec<WriteEntry>,
        results: &[RowResult],
        groups: &[Vec<usize>],
        outcome: &mut FlushOutcome,
    ) -> Vec<WriteEntry> {
        let mut written = vec![false; pending.len()];

        for (result, group) in results.iter().zip(groups.iter()) {
            match result {
                Ok(()) => {
                    for &i in group {
                        written[i] = true;
                    }
                }
                Err(e) => {
                    warn!(
                        "sink writer {} row rejected, key: {}, error: {}",
                        self.writer_id,
                        pending[group[0]].key(),
                        e
                    );
                }
            }
        }

        let mut remaining = Vec::new();

        for (entry, written) in pending.into_iter().zip(written) {
            if written {
                self.tracker.release(entry.handle);
                outcome.written += 1;
            } else {
                remaining.push(entry);
            }
        }

        remaining
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One row per key, in order of first appearance, carrying the latest row of that key.
///
/// Also returns, for every row, the indices of the entries it covers.
pub fn coalesce(entries: &[WriteEntry]) -> (Vec<Row>, Vec<Vec<usize>>) {
    let mut index: FnvHashMap<&str, usize> = FnvHashMap::default();
    let mut rows: Vec<Row> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        match index.get(entry.key()) {
            Some(&pos) => {
                rows[pos] = entry.row.clone();
                groups[pos].push(i);
            }
            None => {
                index.insert(entry.key(), rows.len());
                rows.push(entry.row.clone());
                groups.push(vec![i]);
            }
        }
    }

    (rows, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ack::AckEvent;
    use tally_core::record::DeliveryHandle;
    use tally_core::store::MemorySinkStore;
    use tally_core::tool::setup_log;

    fn entry(key: &str, count: u64, handle: u64) -> WriteEntry {
        WriteEntry::new(Row::count(key, "wc", count), DeliveryHandle(handle))
    }

    fn config(threshold: usize, budget: u32) -> SinkWriterConfig {
        SinkWriterConfig {
            flush_threshold: threshold,
            flush_interval: None,
            flush_timeout: Duration::from_millis(500),
            retry_budget: budget,
            retry_backoff: Duration::from_millis(0),
            shutdown_timeout: Duration::from_millis(500),
            log_every: 0,
        }
    }

    #[test]
    fn test_coalesce_keeps_latest_value_per_key() {
        let entries = vec![entry("the", 1, 0), entry("fox", 1, 0), entry("the", 2, 1)];

        let (rows, groups) = coalesce(&entries);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "the");
        assert_eq!(rows[0].field("count"), Some("2"));
        assert_eq!(rows[1].key, "fox");
        assert_eq!(groups, vec![vec![0, 2], vec![1]]);
    }

    #[tokio::test]
    async fn test_threshold_flush() -> Result<()> {
        setup_log();

        let store = Arc::new(MemorySinkStore::new(10));
        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);

        for h in 0..3 {
            tracker.open(DeliveryHandle(h));
        }

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), config(3, 1))?;

        assert!(writer.append(entry("a", 1, 0)).await.is_none());
        assert!(writer.append(entry("b", 1, 1)).await.is_none());
        assert_eq!(writer.buffer_len(), 2);

        let outcome = writer.append(entry("c", 1, 2)).await.unwrap();

        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(writer.buffer_len(), 0);
        assert_eq!(
            store.writes(),
            vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
        );

        for h in 0..3 {
            assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(h)));
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_partial_failure_retries_only_rejected_rows() -> Result<()> {
        setup_log();

        let store = Arc::new(MemorySinkStore::new(10));
        store.reject_key_once("b");

        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);
        tracker.open(DeliveryHandle(0));
        tracker.open(DeliveryHandle(1));

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), config(2, 2))?;

        writer.append(entry("a", 1, 0)).await;
        let outcome = writer.append(entry("b", 1, 1)).await.unwrap();

        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            store.writes(),
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );

        assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(0)));
        assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(1)));

        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() -> Result<()> {
        setup_log();

        let store = Arc::new(MemorySinkStore::new(10));
        store.set_delay(Some(Duration::from_millis(300)));

        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);
        tracker.open(DeliveryHandle(0));

        let mut cfg = config(1, 2);
        cfg.flush_timeout = Duration::from_millis(20);

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), cfg)?;
        let outcome = writer.append(entry("a", 1, 0)).await.unwrap();

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(writer.buffer_len(), 0);
        assert_eq!(
            acks.try_recv()?,
            AckEvent::Fail(DeliveryHandle(0), FailureKind::Sink)
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_same_record_acked_once_after_all_entries_written() -> Result<()> {
        setup_log();

        let store = Arc::new(MemorySinkStore::new(10));
        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);

        // One record, two derived entries.
        let handle = DeliveryHandle(9);
        tracker.open(handle);
        tracker.retain(handle);
        tracker.retain(handle);
        tracker.release(handle);

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), config(4, 1))?;
        writer.append(entry("x", 1, 9)).await;
        writer.append(entry("y", 1, 9)).await;
        assert!(acks.try_recv().is_err());

        let outcome = writer.flush().await;
        assert_eq!(outcome.written, 2);
        assert_eq!(acks.try_recv()?, AckEvent::Ack(handle));
        assert!(acks.try_recv().is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_flush_if_idle() -> Result<()> {
        let store = Arc::new(MemorySinkStore::new(10));
        let (tracker, _acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);
        tracker.open(DeliveryHandle(0));

        let mut cfg = config(10, 1);
        cfg.flush_interval = Some(Duration::from_millis(0));

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), cfg)?;

        // Nothing buffered.
        assert!(writer.flush_if_idle().await.is_none());

        writer.append(entry("a", 1, 0)).await;
        let outcome = writer.flush_if_idle().await.unwrap();

        assert_eq!(outcome.written, 1);
        assert_eq!(store.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_flush_after_start_shutdown_ends_at_deadline() -> Result<()> {
        setup_log();

        let store = Arc::new(MemorySinkStore::new(10));
        store.set_delay(Some(Duration::from_millis(1000)));

        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);
        tracker.open(DeliveryHandle(0));
        tracker.open(DeliveryHandle(1));

        let mut cfg = config(1, 3);
        cfg.flush_timeout = Duration::from_millis(300);
        cfg.shutdown_timeout = Duration::from_millis(100);

        let mut writer = SinkWriter::new(0, store.clone(), tracker.clone(), cfg)?;

        let start = Instant::now();
        let deadline = writer.start_shutdown();
        assert_eq!(writer.start_shutdown(), deadline);

        let outcome = writer.append(entry("a", 1, 0)).await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(
            acks.try_recv()?,
            AckEvent::Fail(DeliveryHandle(0), FailureKind::Shutdown)
        );

        // Past the deadline, nothing is written anymore.
        let outcome = writer.append(entry("b", 1, 1)).await.unwrap();

        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(store.attempts(), 1);
        assert_eq!(
            acks.try_recv()?,
            AckEvent::Fail(DeliveryHandle(1), FailureKind::Shutdown)
        );

        Ok(())
    }

    #[test]
    fn test_threshold_above_store_limit() {
        let store = Arc::new(MemorySinkStore::new(2));
        let (tracker, _acks) = AckTracker::channel();

        assert!(SinkWriter::new(0, store, Arc::new(tracker), config(3, 1)).is_err());
    }
}
