//! Concrete data sinks.
//!
//! - [`ConsoleSink`] - progress log through `tracing`
//! - [`BroadcastSink`] - every protocol call as a [`SinkEvent`] on a broadcast channel
//! - [`CsvScanSink`] - one CSV file per scan (feature `storage_csv`)

pub mod broadcast;
pub mod console;
#[cfg(feature = "storage_csv")]
pub mod csv;

pub use broadcast::{BroadcastSink, SinkEvent};
pub use console::ConsoleSink;
#[cfg(feature = "storage_csv")]
pub use self::csv::CsvScanSink;
