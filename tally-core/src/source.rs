//! Source feed interface and local implementations.
//!
//! A source is pulled for records and told the outcome of each delivered record. The
//! redelivery policy of failed records belongs to the source, not to the pipeline.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};

use crate::config::SourceConfig;
use crate::local_file_reader::LocalFileReader;
use crate::record::{DeliveryHandle, Record};

/// Pull based record feed.
#[async_trait]
pub trait Source: Send {
    /// Next record to deliver.
    ///
    /// `None` means the feed has nothing more to deliver, except records that are failed
    /// later and redelivered.
    async fn pull(&mut self) -> Result<Option<Record>>;

    /// All work derived from the record is durably applied.
    async fn ack(&mut self, handle: DeliveryHandle) -> Result<()>;

    /// The record could not be processed.
    async fn fail(&mut self, handle: DeliveryHandle) -> Result<()>;
}

/// Delivered records kept until they are acked, for redelivery on failure.
struct Redelivery {
    max_redeliveries: u32,

    /// Payload and number of redeliveries so far.
    in_flight: HashMap<DeliveryHandle, (Vec<u8>, u32)>,

    queue: VecDeque<(Record, u32)>,
}

impl Redelivery {
    fn new(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            in_flight: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn next_redelivery(&mut self) -> Option<Record> {
        self.queue.pop_front().map(|(record, attempts)| {
            self.in_flight
                .insert(record.handle, (record.payload.clone(), attempts));
            record
        })
    }

    fn delivered(&mut self, record: &Record) {
        self.in_flight
            .insert(record.handle, (record.payload.clone(), 0));
    }

    fn ack(&mut self, handle: DeliveryHandle) {
        self.in_flight.remove(&handle);
    }

    /// Returns false if the record is given up.
    fn fail(&mut self, handle: DeliveryHandle) -> bool {
        match self.in_flight.remove(&handle) {
            Some((payload, attempts)) => {
                if attempts >= self.max_redeliveries {
                    warn!(
                        "record exhausted redeliveries, handle: {}, redeliveries: {}",
                        handle, attempts
                    );
                    false
                } else {
                    self.queue
                        .push_back((Record::new(handle, payload), attempts + 1));
                    true
                }
            }
            None => {
                warn!("fail on unknown delivery handle, handle: {}", handle);
                false
            }
        }
    }
}

/// Source reading newline delimited records from local files.
///
/// Each line is one record. Handles are assigned in reading order.
pub struct LocalFileSource {
    consumer_group: String,
    reader: LocalFileReader,
    next_handle: u64,
    redelivery: Redelivery,
}

impl LocalFileSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let reader = LocalFileReader::new(&config.feed, config.start_from_beginning)?;

        info!(
            "open local feed, files: {:?}, consumer_group: {}, start_from_beginning: {}",
            config.feed, config.consumer_group, config.start_from_beginning
        );

        Ok(Self {
            consumer_group: config.consumer_group.clone(),
            reader,
            next_handle: 0,
            redelivery: Redelivery::new(config.max_redeliveries),
        })
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

#[async_trait]
impl Source for LocalFileSource {
    async fn pull(&mut self) -> Result<Option<Record>> {
        if let Some(record) = self.redelivery.next_redelivery() {
            return Ok(Some(record));
        }

        match self.reader.next() {
            Some(line) => {
                let record = Record::new(DeliveryHandle(self.next_handle), line?);
                self.next_handle += 1;
                self.redelivery.delivered(&record);

                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<()> {
        self.redelivery.ack(handle);
        Ok(())
    }

    async fn fail(&mut self, handle: DeliveryHandle) -> Result<()> {
        self.redelivery.fail(handle);
        Ok(())
    }
}

/// What happened to the records of a `MemorySource`.
#[derive(Debug, Default, Clone)]
pub struct SourceLog {
    pub delivered: Vec<DeliveryHandle>,
    pub acked: Vec<DeliveryHandle>,
    pub failed: Vec<DeliveryHandle>,
}

/// In memory source, for tests and local runs.
///
/// The log of deliveries and outcomes is shared, so it can be inspected after the source
/// is moved into a pipeline.
pub struct MemorySource {
    records: VecDeque<Record>,
    redelivery: Redelivery,
    log: Arc<Mutex<SourceLog>>,
}

impl MemorySource {
    /// One record per payload, handles `0..n`.
    pub fn new<P: Into<Vec<u8>>>(payloads: Vec<P>, max_redeliveries: u32) -> Self {
        let records = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Record::new(DeliveryHandle(i as u64), payload))
            .collect();

        Self {
            records,
            redelivery: Redelivery::new(max_redeliveries),
            log: Arc::new(Mutex::new(SourceLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<SourceLog>> {
        self.log.clone()
    }

    fn with_log(&self, f: impl FnOnce(&mut SourceLog)) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn pull(&mut self) -> Result<Option<Record>> {
        let record = match self.redelivery.next_redelivery() {
            Some(record) => Some(record),
            None => self.records.pop_front().inspect(|record| {
                self.redelivery.delivered(record);
            }),
        };

        if let Some(record) = &record {
            self.with_log(|log| log.delivered.push(record.handle));
        }

        Ok(record)
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<()> {
        self.redelivery.ack(handle);
        self.with_log(|log| log.acked.push(handle));
        Ok(())
    }

    async fn fail(&mut self, handle: DeliveryHandle) -> Result<()> {
        self.redelivery.fail(handle);
        self.with_log(|log| log.failed.push(handle));
        Ok(())
    }
}
