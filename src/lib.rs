//! # daq_scan
//!
//! Scan execution engine and data-management core for instrument control at
//! scientific facilities. A scan moves devices, counts with detectors, samples
//! environment devices and hands everything it records to an
//! [`AcquisitionContext`](data::AcquisitionContext), which builds the dataset
//! hierarchy (block → scan → point) and fans every event out to the registered
//! data sinks.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`config/scan.toml` plus `DAQ_SCAN_*`
//!   environment overrides).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `ScanError`, the device error classification and scan phases.
//! - **`hardware`**: the `Device`/`Detector` capability traits and mock devices.
//! - **`data`**: values, datasets, the acquisition context, counters, file names
//!   and the sink protocol with its concrete sinks.
//! - **`scan`**: the scan kinds (`Scan`, `SweepScan`, `ContinuousScan`,
//!   `ManualScan`, `QScan`) and their shared engine.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use daq_scan::data::AcquisitionContext;
//! use daq_scan::hardware::mock::{MockDetector, MockMotor};
//! use daq_scan::scan::{line_positions, Scan, ScanOptions};
//!
//! let ctx = AcquisitionContext::builder()
//!     .data_root("/data")
//!     .detector(Arc::new(MockDetector::new("det")))
//!     .build();
//! let scan = Scan::builder(vec![Arc::new(MockMotor::new("x"))], line_positions(&[0.0], &[0.1], 11))
//!     .options(ScanOptions::new().preset("t", 1.0))
//!     .build(&ctx)?;
//! let dataset = scan.run(&ctx).await?;
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;

pub use error::{ScanError, ScanResult};
