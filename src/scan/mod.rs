//! Scan kinds.
//!
//! - [`Scan`] - step scan through a list of positions
//! - [`SweepScan`] - counting while devices sweep towards a target (or a time scan)
//! - [`ContinuousScan`] - single axis at constant speed, read out at fixed intervals
//! - [`ManualScan`] - points triggered by the caller
//! - [`QScan`] - step scan of a triple-axis instrument in `(h, k, l, E)`
//!
//! All of them are built from [`ScanCore`] and share its error policy,
//! [`handle_error`].

pub mod continuous;
pub mod engine;
pub mod manual;
pub mod qscan;
pub mod step;
pub mod sweep;

pub use continuous::ContinuousScan;
pub use engine::{handle_error, ErrorAction, Move, PointOutcome, ScanCore, ScanOptions};
pub use manual::ManualScan;
pub use qscan::{QScan, QScanBuilder};
pub use step::{line_positions, EndMotion, Scan, ScanBuilder, ScanHooks};
pub use sweep::{ElapsedTime, SweepScan, SweepScanBuilder};
