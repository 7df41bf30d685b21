//! Sinker is the last stage of the pipeline. It is responsible for writing the results of the
//! aggregators into the sink store, in batches.
//!
//! Each `SinkWriter` owns a buffer of write entries. Every entry carries the delivery handle of
//! the record it derives from. The record is acked only after the entry is confirmed written,
//! so a batch that is lost before the write never loses records: the source redelivers them.
//!
//! When is a batch written?
//!
//! 1. The buffer reaches `flush_threshold`. This is the normal case under load.
//! 2. The buffer is not empty and nothing was flushed for `flush_interval`. Without it, a
//!    writer of a quiet partition may hold entries forever, and their records are never acked.
//! 3. The writer stops, either because its input is closed or because shutdown is requested.
//!
//! What if the write fails?
//!
//! The store answers each row separately. Rows written are released, the rest are retried with
//! exponential backoff, up to `retry_budget` attempts in total. A write call that errors or
//! times out counts as one attempt where no row was written. After the last attempt, the
//! remaining entries are failed and removed from the buffer, so one bad batch never blocks the
//! writer.
//!
//! Can a record be written twice?
//!
//! Yes. If the store applied a write but the answer was lost, the record is failed and
//! redelivered, and its counts are applied again. The pipeline is at-least-once; counts are
//! approximate under replay.

pub mod sink_writer;
