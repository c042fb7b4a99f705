//! Device interfaces
//!
//! The scan engine talks to hardware only through the capability traits in
//! [`capabilities`]. Drivers live outside this crate; [`mock`] provides
//! simulated devices for tests and dry runs.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Detector, Device, DeviceStatus, StatusCode};
