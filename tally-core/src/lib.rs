//! Core of tally: the data model flowing between stages, fields grouping, ack tracking,
//! and the source and sink store interfaces the pipeline is built against.

pub mod ack;
pub mod config;
pub mod local_file_reader;
pub mod partition;
pub mod record;
pub mod source;
pub mod store;
pub mod tool;
