//! Error types for the scan engine and data manager.
//!
//! Two layers of errors exist:
//!
//! - **Device errors** travel as `anyhow::Error` through the capability traits in
//!   [`crate::hardware::capabilities`], exactly like driver errors do. Drivers that want
//!   the scan engine to recover from a failure attach a [`DeviceError`] carrying a
//!   [`DeviceErrorKind`]; the kind decides whether a point continues, is skipped, or the
//!   scan stops (see [`ErrorClass`]).
//! - **Engine errors** are [`ScanError`] values returned from the data manager and from
//!   `run()` of every scan kind. These are the errors a script sees.
//!
//! ## Error taxonomy
//!
//! 1. **Transient** (`ErrorClass::Continue`): logged, the point is still recorded.
//! 2. **Point-fatal** (`ErrorClass::Skip`): the current point is abandoned, the scan
//!    proceeds with the next position.
//! 3. **Scan-fatal** (`ErrorClass::Stop`): remaining points are abandoned, the dataset
//!    is still finalized.
//! 4. **Programming errors** (`ScanError::Programming`): invalid mode transitions or
//!    missing stack state, returned immediately.

use std::fmt;
use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

/// Failure categories a device driver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// Device did not reach the requested position.
    Position,
    /// Motion was refused or interrupted by the hardware.
    Move,
    /// Operation did not complete in time.
    Timeout,
    /// Target value rejected by the device.
    InvalidValue,
    /// Target outside the configured limits.
    Limit,
    /// Communication with the controller failed.
    Communication,
    /// A derived value could not be computed.
    Computation,
    /// The device observed a stop request.
    Stopped,
    /// Hardware fault that must not be ignored.
    Hardware,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceErrorKind::Position => "position",
            DeviceErrorKind::Move => "move",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::InvalidValue => "invalid_value",
            DeviceErrorKind::Limit => "limit",
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Computation => "computation",
            DeviceErrorKind::Stopped => "stopped",
            DeviceErrorKind::Hardware => "hardware",
        };
        write!(f, "{}", label)
    }
}

/// How the scan engine treats an error of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log and carry on with the point.
    Continue,
    /// Log and abandon the current point.
    Skip,
    /// Abandon the remaining points.
    Stop,
    /// Propagate out of the scan.
    Fatal,
}

impl DeviceErrorKind {
    /// Recovery class used by the scan error policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceErrorKind::Position | DeviceErrorKind::Move | DeviceErrorKind::Timeout => {
                ErrorClass::Continue
            }
            DeviceErrorKind::InvalidValue
            | DeviceErrorKind::Limit
            | DeviceErrorKind::Communication
            | DeviceErrorKind::Computation => ErrorClass::Skip,
            DeviceErrorKind::Stopped => ErrorClass::Stop,
            DeviceErrorKind::Hardware => ErrorClass::Fatal,
        }
    }
}

/// Typed error a driver attaches to its `anyhow::Error`.
#[derive(Error, Debug, Clone)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    /// Name of the failing device
    pub device: String,
    /// Failure category
    pub kind: DeviceErrorKind,
    /// Human-readable description
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(device: impl Into<String>, kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Classify an arbitrary device error.
///
/// Errors without a [`DeviceError`] anywhere in their chain are fatal.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<DeviceError>())
        .map(|dev_err| dev_err.kind.class())
        .unwrap_or(ErrorClass::Fatal)
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Scan phase an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Moving devices to the scan's first position, before any data is recorded.
    Prepare,
    /// Starting or waiting for device motion.
    Move,
    /// Reading device or environment values.
    Read,
    /// Detector counting.
    Count,
    /// Anything else.
    Other,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Prepare => "prepare",
            Phase::Move => "move",
            Phase::Read => "read",
            Phase::Count => "count",
            Phase::Other => "other",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the engine error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type of the scan engine.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A device failed in a way the error policy does not recover from.
    ///
    /// **Error Type**: Scan-fatal, propagates out of `run()`.
    #[error("{phase} failed for '{device}': {source}")]
    Device {
        /// Phase the scan was in
        phase: Phase,
        /// Device (or detector) name
        device: String,
        /// Original driver error
        #[source]
        source: anyhow::Error,
    },

    /// Invalid use of the engine (mode violation, missing stack state).
    ///
    /// **Error Type**: Permanent - indicates a bug in the calling script.
    #[error("Programming error: {0}")]
    Programming(String),

    /// Scan parameters failed validation at construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A data sink could not be registered or set up.
    #[error("Sink error: {0}")]
    Sink(String),

    /// File name template could not be expanded.
    #[error("Template error: {0}")]
    Template(String),

    /// Standard I/O operation failed (counter files, data files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScanError {
    /// Wrap a device error that the policy decided not to handle.
    pub fn device(phase: Phase, device: impl Into<String>, source: anyhow::Error) -> Self {
        ScanError::Device {
            phase,
            device: device.into(),
            source,
        }
    }
}
