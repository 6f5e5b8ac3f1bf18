//! Sample persistence.

pub mod storage;

pub use storage::{CsvDataSink, DataSink, MemorySink};
