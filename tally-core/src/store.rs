//! Sink store interface and local implementations.
//!
//! A sink store persists rows: a row key and named string fields under one family. One
//! `write_batch` call is one request; it returns the outcome of every row in the order the
//! rows were given. An `Err` from the call itself means no row was written.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::{DashMap, DashSet};
use log::info;

use crate::error_bail;
use crate::record::Row;

/// Outcome of one row in a batch.
pub type RowResult = std::result::Result<(), String>;

#[async_trait]
pub trait SinkStore: Send + Sync {
    /// Max rows accepted per `write_batch` call.
    fn max_batch_rows(&self) -> usize;

    /// Write all `rows` in one request.
    async fn write_batch(&self, rows: &[Row]) -> Result<Vec<RowResult>>;
}

/// In memory store.
///
/// Rows are upserted by key. Every call is recorded, and failures can be scripted, so it
/// doubles as the store of tests.
pub struct MemorySinkStore {
    max_batch_rows: usize,

    rows: DashMap<String, Row>,

    /// Number of `write_batch` calls, including failed ones.
    attempts: AtomicUsize,

    /// Keys of every call that wrote at least one row.
    writes: Mutex<Vec<Vec<String>>>,

    /// The next `n` calls fail as a whole.
    fail_next: AtomicUsize,

    /// Rows with these keys are rejected.
    rejected_keys: DashSet<String>,

    /// Rows with these keys are rejected once, then accepted.
    rejected_once: DashSet<String>,

    delay: Mutex<Option<Duration>>,
}

impl MemorySinkStore {
    pub fn new(max_batch_rows: usize) -> Self {
        Self {
            max_batch_rows,
            rows: DashMap::new(),
            attempts: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            rejected_keys: DashSet::new(),
            rejected_once: DashSet::new(),
            delay: Mutex::new(None),
        }
    }

    /// Fail the next `n` calls.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every row with `key`.
    pub fn reject_key(&self, key: &str) {
        self.rejected_keys.insert(key.to_string());
    }

    /// Reject the next row with `key`.
    pub fn reject_key_once(&self, key: &str) {
        self.rejected_once.insert(key.to_string());
    }

    /// Sleep before answering every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.delay.lock() {
            *d = delay;
        }
    }

    pub fn get(&self, key: &str) -> Option<Row> {
        self.rows.get(key).map(|row| row.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Keys of every call that wrote at least one row, in call order.
    pub fn writes(&self) -> Vec<Vec<String>> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn upsert(&self, row: &Row) {
        match self.rows.get_mut(&row.key) {
            Some(mut existing) => {
                existing.family = row.family.clone();

                for (name, value) in row.fields.iter() {
                    match existing.fields.iter_mut().find(|(n, _)| n == name) {
                        Some(field) => field.1 = value.clone(),
                        None => existing.fields.push((name.clone(), value.clone())),
                    }
                }
            }
            None => {
                self.rows.insert(row.key.clone(), row.clone());
            }
        }
    }
}

#[async_trait]
impl SinkStore for MemorySinkStore {
    fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }

    async fn write_batch(&self, rows: &[Row]) -> Result<Vec<RowResult>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if rows.len() > self.max_batch_rows {
            error_bail!(
                "batch too large, rows: {}, max_batch_rows: {}",
                rows.len(),
                self.max_batch_rows
            );
        }

        if self.take_failure() {
            return Err(anyhow!("memory store unavailable"));
        }

        let mut written = Vec::with_capacity(rows.len());

        let results: Vec<RowResult> = rows
            .iter()
            .map(|row| {
                if self.rejected_keys.contains(&row.key)
                    || self.rejected_once.remove(&row.key).is_some()
                {
                    Err(format!("row rejected, key: {}", row.key))
                } else {
                    self.upsert(row);
                    written.push(row.key.clone());
                    Ok(())
                }
            })
            .collect();

        if !written.is_empty() {
            if let Ok(mut writes) = self.writes.lock() {
                writes.push(written);
            }
        }

        Ok(results)
    }
}

/// Store that only logs the rows. Every row succeeds.
pub struct LogSinkStore {
    max_batch_rows: usize,
}

impl LogSinkStore {
    pub fn new(max_batch_rows: usize) -> Self {
        Self { max_batch_rows }
    }
}

#[async_trait]
impl SinkStore for LogSinkStore {
    fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }

    async fn write_batch(&self, rows: &[Row]) -> Result<Vec<RowResult>> {
        for row in rows {
            info!("row: {}, family: {}, fields: {:?}", row.key, row.family, row.fields);
        }

        Ok(vec![Ok(()); rows.len()])
    }
}

/// Store appending rows to a local file, one line per row.
///
/// Line format: `base64(key) \t base64(family) \t base64(name):base64(value);...`.
/// Every part is base64 encoded, so it may contain any character. The separators are
/// outside of the base64 alphabet.
pub struct LocalFileSinkStore {
    path: String,
    max_batch_rows: usize,
    writer: Mutex<BufWriter<File>>,
}

impl LocalFileSinkStore {
    pub fn new(path: &str, max_batch_rows: usize) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_string(),
            max_batch_rows,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn encode_row(row: &Row) -> String {
        let fields = row
            .fields
            .iter()
            .map(|(name, value)| format!("{}:{}", STANDARD.encode(name), STANDARD.encode(value)))
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}\t{}\t{}",
            STANDARD.encode(&row.key),
            STANDARD.encode(&row.family),
            fields
        )
    }

    pub fn decode_row(line: &str) -> Result<Row> {
        let parts = line.split('\t').collect::<Vec<_>>();
        if parts.len() != 3 {
            error_bail!("invalid row line: {}", line);
        }

        let key = decode_text(parts[0])?;
        let mut row = Row::new(key, decode_text(parts[1])?);

        for field in parts[2].split(';').filter(|f| !f.is_empty()) {
            match field.split_once(':') {
                Some((name, value)) => {
                    row.push_field(decode_text(name)?, decode_text(value)?);
                }
                None => {
                    error_bail!("invalid field in row line: {}", field);
                }
            }
        }

        Ok(row)
    }
}

fn decode_text(part: &str) -> Result<String> {
    Ok(String::from_utf8(STANDARD.decode(part)?)?)
}

#[async_trait]
impl SinkStore for LocalFileSinkStore {
    fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }

    async fn write_batch(&self, rows: &[Row]) -> Result<Vec<RowResult>> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("file store lock poisoned, path: {}", self.path))?;

        for row in rows {
            writer.write_all(Self::encode_row(row).as_bytes())?;
            writer.write_all(b"\n")?;
        }

        writer.flush()?;

        Ok(vec![Ok(()); rows.len()])
    }
}
