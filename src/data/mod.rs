//! Dataset model, acquisition context and data sinks.
pub mod counters;
pub mod dataset;
pub mod filenames;
pub mod manager;
pub mod sink;
pub mod sinks;
pub mod value;

pub use dataset::{BlockDataset, Dataset, PointDataset, ScanDataset, SetType};
pub use manager::{AcquisitionContext, AcquisitionContextBuilder, DataLayout};
pub use sink::{DataSink, DataSinkHandler, SessionMode, SinkSettings};
