use anyhow::{anyhow, Result};
use log::{error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use tally_core::ack::{AckEvent, AckTracker};
use tally_core::config::{PipelineConfig, PipelineKind, SinkConfig, StoreKind};
use tally_core::error_bail;
use tally_core::record::{Record, Token, WriteEntry};
use tally_core::source::Source;
use tally_core::store::{LocalFileSinkStore, LogSinkStore, MemorySinkStore, SinkStore};
use tally_sinker::sink_writer::{SinkWriter, SinkWriterConfig};

use crate::aggregator::{Aggregator, AggregatorWorker};
use crate::field_rows::{FieldRowMapper, FieldRowWorker};
use crate::normalizer::Normalizer;
use crate::router::KeyedRouter;

/// Extra time given to the stages on top of `shutdown_timeout` before they are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(1000);

type StopSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What happened to the records of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Records pulled from the source, redeliveries included.
    pub pulled: u64,

    pub acked: u64,

    pub failed: u64,
}

/// Build the sink store selected in `[sink]`.
pub fn build_store(config: &SinkConfig) -> Result<Arc<dyn SinkStore>> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(MemorySinkStore::new(config.max_batch_rows))),
        StoreKind::Log => Ok(Arc::new(LogSinkStore::new(config.max_batch_rows))),
        StoreKind::File => match config.path.as_ref() {
            Some(path) => Ok(Arc::new(LocalFileSinkStore::new(
                path,
                config.max_batch_rows,
            )?)),
            None => {
                error_bail!("sink.path is required for the file store");
            }
        },
    }
}

/// `Pipeline` wires all stages of one topology and runs them until the source is done.
///
/// Word count: source -> normalizers -> aggregators -> sink writers.
/// Field rows: source -> field row workers -> sink writers.
///
/// Every stage instance is one subsystem of a `Toplevel`, connected to the next stage by
/// bounded queues. Normalizers share one queue. Aggregators and sink writers have one queue
/// each and receive by key.
///
/// How does the pipeline stop?
///
/// Stages never stop on their own: each one runs until its inbound queue is closed and
/// drained, then drops its senders, which closes the queues of the next stage. The source
/// stage starts the chain. It closes the record queue when the source is exhausted and
/// every record it delivered is resolved, or at once when a stop is requested.
///
/// The source stage keeps resolving acks until the ack channel is closed, which happens
/// after the last stage holding the `AckTracker` is done. So every record handed to the
/// stages is acked or failed back to the source before `run` returns.
pub struct Pipeline {
    config: PipelineConfig,

    store: Arc<dyn SinkStore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn SinkStore>) -> Result<Self> {
        config.validate()?;

        Ok(Self { config, store })
    }

    /// Pipeline writing to the store selected by `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = build_store(&config.sink)?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SinkStore> {
        self.store.clone()
    }

    /// Run until `source` is exhausted and every record is resolved.
    pub async fn run<S: Source + 'static>(self, source: S) -> Result<PipelineReport> {
        self.run_until(source, std::future::pending::<()>()).await
    }

    /// Run until `source` is exhausted, or until `stop` completes.
    ///
    /// After `stop`, no record is pulled anymore. The records already pulled are drained
    /// through the stages, and whatever the sink writers cannot flush within
    /// `shutdown_timeout` is failed.
    pub async fn run_until<S, F>(self, source: S, stop: F) -> Result<PipelineReport>
    where
        S: Source + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let stage = &self.config.pipeline;
        let capacity = stage.queue_capacity;
        let retry_backoff = self.config.retry_backoff();

        info!(
            "start pipeline, kind: {}, partition_count: {}, normalizer_workers: {}, sink_writers: {}",
            stage.kind, stage.partition_count, stage.normalizer_workers, stage.sink_writers
        );

        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);

        let (record_sender, record_receiver) = async_channel::bounded::<Record>(capacity);

        let writer_config = SinkWriterConfig::from_config(&self.config);

        let mut writers = Vec::with_capacity(stage.sink_writers);
        let mut entry_senders = Vec::with_capacity(stage.sink_writers);

        for writer_id in 0..stage.sink_writers {
            let (sender, receiver) = async_channel::bounded::<WriteEntry>(capacity);

            let writer = SinkWriter::new(
                writer_id,
                self.store.clone(),
                tracker.clone(),
                writer_config.clone(),
            )?;

            entry_senders.push(sender);
            writers.push((writer, receiver));
        }

        let entry_router =
            KeyedRouter::new(entry_senders, tracker.clone(), stage.retry_budget, retry_backoff)?;

        let mut normalizers = Vec::new();
        let mut aggregators = Vec::new();
        let mut field_row_workers = Vec::new();

        match stage.kind {
            PipelineKind::WordCount => {
                let (token_senders, token_receivers): (Vec<_>, Vec<_>) = (0..stage.partition_count)
                    .map(|_| async_channel::bounded::<Token>(capacity))
                    .unzip();

                let token_router = KeyedRouter::new(
                    token_senders,
                    tracker.clone(),
                    stage.retry_budget,
                    retry_backoff,
                )?;
                let partitioner = *token_router.partitioner();

                for (partition_id, receiver) in token_receivers.into_iter().enumerate() {
                    let worker = AggregatorWorker::new(
                        Aggregator::new(partition_id, partitioner),
                        entry_router.clone(),
                        &self.config.sink.family,
                    );

                    aggregators.push((worker, receiver));
                }

                for worker_id in 0..stage.normalizer_workers {
                    normalizers.push(Normalizer::new(
                        worker_id,
                        tracker.clone(),
                        token_router.clone(),
                    ));
                }
            }
            PipelineKind::FieldRows => {
                let mapper = FieldRowMapper::new(self.config.field_rows.clone())?;

                for worker_id in 0..stage.normalizer_workers {
                    field_row_workers.push(FieldRowWorker::new(
                        worker_id,
                        mapper.clone(),
                        tracker.clone(),
                        entry_router.clone(),
                    ));
                }
            }
        }

        // Only the stages may keep queues and the ack channel open.
        drop(entry_router);
        drop(tracker);

        let output = Arc::new(Mutex::new(PipelineReport::default()));
        let source_stage = SourceStage::new(source, record_sender, acks, output.clone());
        let stop: StopSignal = Box::pin(stop);

        Toplevel::new(move |s| async move {
            s.start(SubsystemBuilder::new("source", move |a| {
                source_stage.run(stop, a)
            }));

            for (worker_id, normalizer) in normalizers.into_iter().enumerate() {
                let receiver = record_receiver.clone();
                s.start(SubsystemBuilder::new(
                    format!("normalizer_{}", worker_id),
                    move |a| normalizer.run(receiver, a),
                ));
            }

            for (worker_id, worker) in field_row_workers.into_iter().enumerate() {
                let receiver = record_receiver.clone();
                s.start(SubsystemBuilder::new(
                    format!("field_row_{}", worker_id),
                    move |a| worker.run(receiver, a),
                ));
            }

            for (partition_id, (worker, receiver)) in aggregators.into_iter().enumerate() {
                s.start(SubsystemBuilder::new(
                    format!("aggregator_{}", partition_id),
                    move |a| worker.run(receiver, a),
                ));
            }

            for (writer_id, (writer, receiver)) in writers.into_iter().enumerate() {
                s.start(SubsystemBuilder::new(
                    format!("sink_writer_{}", writer_id),
                    move |a| writer.run(receiver, a),
                ));
            }
        })
        .handle_shutdown_requests(self.config.shutdown_timeout() + SHUTDOWN_GRACE)
        .await
        .map_err(|e| anyhow!("pipeline stopped with errors: {:?}", e))?;

        let report = output
            .lock()
            .map(|report| report.clone())
            .map_err(|_| anyhow!("pipeline report lock poisoned"))?;

        info!(
            "[RESULT] pipeline done, pulled: {}, acked: {}, failed: {}",
            report.pulled, report.acked, report.failed
        );

        Ok(report)
    }
}

/// Pulls records from the source into the record queue and hands every resolution back to
/// the source.
struct SourceStage<S: Source> {
    source: S,

    /// `None` once the record queue is closed.
    records: Option<async_channel::Sender<Record>>,

    acks: async_channel::Receiver<AckEvent>,

    /// Records handed to the stages and not resolved yet.
    in_flight: u64,

    /// The last pull returned nothing.
    exhausted: bool,

    stopping: bool,

    report: PipelineReport,

    output: Arc<Mutex<PipelineReport>>,
}

impl<S: Source> SourceStage<S> {
    fn new(
        source: S,
        records: async_channel::Sender<Record>,
        acks: async_channel::Receiver<AckEvent>,
        output: Arc<Mutex<PipelineReport>>,
    ) -> Self {
        Self {
            source,
            records: Some(records),
            acks,
            in_flight: 0,
            exhausted: false,
            stopping: false,
            report: PipelineReport::default(),
            output,
        }
    }

    #[inline]
    fn can_pull(&self) -> bool {
        self.records.is_some() && !self.exhausted && !self.stopping
    }

    async fn run(mut self, mut stop: StopSignal, subsys: SubsystemHandle) -> Result<()> {
        info!("source stage started");

        loop {
            while let Ok(event) = self.acks.try_recv() {
                self.resolve(event).await?;
            }

            if self.records.is_some() && self.exhausted && self.in_flight == 0 {
                info!(
                    "source exhausted and all records resolved, pulled: {}",
                    self.report.pulled
                );
                self.records = None;
            }

            if self.can_pull() {
                tokio::select! {
                    biased;
                    _ = &mut stop, if !self.stopping => {
                        self.stop("stop signal", &subsys);
                    },
                    _ = subsys.on_shutdown_requested(), if !self.stopping => {
                        self.stop("shutdown requested", &subsys);
                    },
                    pulled = self.source.pull() => {
                        match pulled? {
                            Some(record) => self.dispatch(record).await?,
                            None => self.exhausted = true,
                        }
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = &mut stop, if !self.stopping => {
                        self.stop("stop signal", &subsys);
                    },
                    _ = subsys.on_shutdown_requested(), if !self.stopping => {
                        self.stop("shutdown requested", &subsys);
                    },
                    event = self.acks.recv() => {
                        match event {
                            Ok(event) => self.resolve(event).await?,
                            Err(_) => break,
                        }
                    }
                }
            }
        }

        if self.in_flight > 0 {
            error!(
                "ack channel closed with records in flight, in_flight: {}",
                self.in_flight
            );
        }

        info!(
            "source stage done, pulled: {}, acked: {}, failed: {}",
            self.report.pulled, self.report.acked, self.report.failed
        );

        if let Ok(mut output) = self.output.lock() {
            *output = self.report.clone();
        }

        Ok(())
    }

    /// Stop pulling and let the stages drain.
    fn stop(&mut self, reason: &str, subsys: &SubsystemHandle) {
        info!(
            "source stage stopping, reason: {}, in_flight: {}",
            reason, self.in_flight
        );

        self.stopping = true;
        self.records = None;

        // The sink writers start their shutdown deadline.
        subsys.request_shutdown();
    }

    async fn dispatch(&mut self, record: Record) -> Result<()> {
        let handle = record.handle;
        self.report.pulled += 1;

        let sent = match self.records.as_ref() {
            Some(sender) => sender.send(record).await.is_ok(),
            None => false,
        };

        if sent {
            self.in_flight += 1;
        } else {
            error!("record queue is closed, failing handle: {}", handle);
            self.report.failed += 1;
            self.source.fail(handle).await?;
        }

        Ok(())
    }

    async fn resolve(&mut self, event: AckEvent) -> Result<()> {
        self.in_flight = self.in_flight.saturating_sub(1);

        match event {
            AckEvent::Ack(handle) => {
                self.report.acked += 1;
                self.source.ack(handle).await?;
            }
            AckEvent::Fail(handle, kind) => {
                warn!("record failed, handle: {}, kind: {}", handle, kind);
                self.report.failed += 1;
                self.source.fail(handle).await?;

                // The source may redeliver it.
                self.exhausted = false;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_store() -> Result<()> {
        let mut config = SinkConfig::default();
        assert_eq!(build_store(&config)?.max_batch_rows(), 1000);

        config.store = StoreKind::Log;
        config.max_batch_rows = 10;
        assert_eq!(build_store(&config)?.max_batch_rows(), 10);

        config.store = StoreKind::File;
        assert!(build_store(&config).is_err());

        let dir = tempfile::tempdir()?;
        config.path = Some(dir.path().join("rows.txt").to_string_lossy().to_string());
        assert!(build_store(&config).is_ok());

        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.pipeline.partition_count = 0;

        let store = Arc::new(MemorySinkStore::new(1000));
        assert!(Pipeline::new(config, store).is_err());
    }
}
