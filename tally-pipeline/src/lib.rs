//! Stages of the tally pipeline and the wiring between them.
//!
//! Record flow of the word count topology:
//!
//! `Source` -> `Normalizer` -> `KeyedRouter` -> `Aggregator` -> `KeyedRouter` -> `SinkWriter`
//!
//! Acks flow the other way: every record is resolved to the source once all the tokens and
//! write entries derived from it are written, or failed once any of them is abandoned.
//!
//! Why route aggregator output by key again?
//!
//! One aggregator emits increasing counts for a key. If two sink writers could hold entries
//! of the same key, an older count may be written after a newer one. Routing by key keeps
//! every key on one writer, and the writer writes its buffer in order.

pub mod aggregator;
pub mod field_rows;
pub mod normalizer;
pub mod pipeline;
pub mod router;
