//! Field row topology.
//!
//! Each record is a json object describing one shipment. It is written to the sink store as
//! one row: the row key is the key fields joined by the separator, for example
//! `logisticProviderID:mailNo`, and every configured field becomes one column of the family.
//!
//! Why not count anything?
//!
//! The row is the aggregate. There is no per-key state between the transform and the sink
//! writer, so the rows are routed straight to the sink writers by row key.
use anyhow::{anyhow, Result};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio_graceful_shutdown::SubsystemHandle;

use tally_core::ack::{AckTracker, FailureKind};
use tally_core::config::FieldRowConfig;
use tally_core::error_bail;
use tally_core::record::{Record, Row, WriteEntry};

use crate::router::KeyedRouter;

/// Maps one json payload to one `Row`.
#[derive(Debug, Clone)]
pub struct FieldRowMapper {
    config: FieldRowConfig,
}

impl FieldRowMapper {
    pub fn new(config: FieldRowConfig) -> Result<Self> {
        if config.key_fields.is_empty() {
            error_bail!("key_fields must not be empty");
        }

        Ok(Self { config })
    }

    /// Every key field and the json field of every column must be present. Non string
    /// values are kept as their json text.
    pub fn to_row(&self, payload: &[u8]) -> Result<Row> {
        let value: Value = serde_json::from_slice(payload)?;

        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("record is not a json object"))?;

        let field_text = |name: &str| -> Result<String> {
            object
                .get(name)
                .map(json_text)
                .ok_or_else(|| anyhow!("missing field: {}", name))
        };

        let key = self
            .config
            .key_fields
            .iter()
            .map(|name| field_text(name.as_str()))
            .collect::<Result<Vec<_>>>()?
            .join(self.config.key_separator.as_str());

        let mut row = Row::new(key, self.config.family.as_str());

        for name in self.config.fields.iter() {
            row.push_field(name.as_str(), field_text(self.config.json_field(name))?);
        }

        Ok(row)
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Worker turning records into rows, routed to the sink writer owning the row key.
///
/// Like the normalizer, workers share the inbound record queue.
pub struct FieldRowWorker {
    worker_id: usize,

    mapper: FieldRowMapper,

    tracker: Arc<AckTracker>,

    router: KeyedRouter<WriteEntry>,
}

impl FieldRowWorker {
    pub fn new(
        worker_id: usize,
        mapper: FieldRowMapper,
        tracker: Arc<AckTracker>,
        router: KeyedRouter<WriteEntry>,
    ) -> Self {
        Self {
            worker_id,
            mapper,
            tracker,
            router,
        }
    }

    /// Returns false if the record was failed.
    pub async fn process(&mut self, record: Record) -> bool {
        let handle = record.handle;
        self.tracker.open(handle);

        match self.mapper.to_row(&record.payload) {
            Ok(row) => {
                self.tracker.retain(handle);
                let routed = self.router.route(WriteEntry::new(row, handle)).await;
                self.tracker.release(handle);

                routed
            }
            Err(e) => {
                warn!(
                    "field row worker {} cannot decode record, handle: {}, error: {}",
                    self.worker_id, handle, e
                );
                self.tracker.fail(handle, FailureKind::Decode);

                false
            }
        }
    }

    pub async fn run(
        mut self,
        receiver: async_channel::Receiver<Record>,
        _subsys: SubsystemHandle,
    ) -> Result<()> {
        info!("field row worker {} started", self.worker_id);

        let mut total: u64 = 0;
        let mut failed: u64 = 0;

        while let Ok(record) = receiver.recv().await {
            if !self.process(record).await {
                failed += 1;
            }

            total += 1;
        }

        info!(
            "field row worker {} done, records: {}, failed: {}",
            self.worker_id, total, failed
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

    fn mapper(fields: &[&str]) -> Result<FieldRowMapper> {
        FieldRowMapper::new(FieldRowConfig {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_to_row() -> Result<()> {
        let mapper = mapper(&["mailType", "weight", "recCity"])?;

        let payload = br#"{
            "logisticProviderID": "sf",
            "mailNo": "1234567",
            "mailType": "1",
            "weight": 2.5,
            "recCity": "hangzhou",
            "ignored": "x"
        }"#;

        let row = mapper.to_row(payload)?;

        assert_eq!(row.key, "sf:1234567");
        assert_eq!(row.family, "info");
        assert_eq!(
            row.fields,
            vec![
                ("mailType".to_string(), "1".to_string()),
                ("weight".to_string(), "2.5".to_string()),
                ("recCity".to_string(), "hangzhou".to_string()),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_invalid_payloads() -> Result<()> {
        let mapper = mapper(&["mailType"])?;

        let cases: [&[u8]; 5] = [
            b"not json",
            b"[1, 2]",
            br#"{"logisticProviderID": "sf", "mailType": "1"}"#,
            br#"{"logisticProviderID": "sf", "mailNo": "1"}"#,
            &[0xff, 0xfe],
        ];

        for case in cases {
            assert!(mapper.to_row(case).is_err());
        }

        Ok(())
    }

    #[test]
    fn test_default_layout_has_all_fields() -> Result<()> {
        let config = FieldRowConfig::default();
        let mut object = serde_json::Map::new();

        object.insert("logisticProviderID".to_string(), Value::from("yto"));
        object.insert("mailNo".to_string(), Value::from(42));
        for name in config.fields.iter() {
            let field = config.json_field(name);
            object.insert(field.to_string(), Value::from(field));
        }

        let payload = serde_json::to_vec(&Value::Object(object))?;
        let row = FieldRowMapper::new(config)?.to_row(&payload)?;

        assert_eq!(row.key, "yto:42");
        assert_eq!(row.fields.len(), 25);
        assert_eq!(row.field("senAddress"), Some("senAddress"));
        assert_eq!(row.field("senProv"), Some("senProvCode"));
        assert_eq!(row.field("senProvCode"), None);

        Ok(())
    }

    #[tokio::test]
    async fn test_worker_fails_bad_record() -> Result<()> {
        let (sender, receiver) = async_channel::bounded(4);
        let (tracker, acks) = AckTracker::channel();
        let tracker = Arc::new(tracker);

        let router = KeyedRouter::new(vec![sender], tracker.clone(), 1, Duration::ZERO)?;
        let mut worker = FieldRowWorker::new(0, mapper(&[])?, tracker.clone(), router);

        assert!(!worker.process(Record::new(DeliveryHandle(0), "{}")).await);
        assert_eq!(
            acks.try_recv()?,
            AckEvent::Fail(DeliveryHandle(0), FailureKind::Decode)
        );

        let payload = r#"{"logisticProviderID": "sf", "mailNo": "9"}"#;
        assert!(worker.process(Record::new(DeliveryHandle(1), payload)).await);

        let entry: WriteEntry = receiver.try_recv()?;
        assert_eq!(entry.key(), "sf:9");

        tracker.release(entry.handle);
        assert_eq!(acks.try_recv()?, AckEvent::Ack(DeliveryHandle(1)));

        Ok(())
    }
}
