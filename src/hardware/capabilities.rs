//! Device and Detector Capabilities
//!
//! The scan engine talks to hardware exclusively through the two traits in this
//! module. Drivers implement them; the engine never knows which protocol sits
//! underneath.
//!
//! - A motor implements [`Device`] including `start`/`wait`.
//! - A temperature controller recorded as sample environment implements [`Device`]
//!   with only `read`/`status`.
//! - A counter card or area detector implements [`Detector`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Provides default bodies for optional capabilities
//!
//! Drivers that want the scan engine to recover from a failure attach a
//! [`crate::error::DeviceError`] to the returned error.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Slit { width: RwLock<f64> }
//!
//! #[async_trait]
//! impl Device for Slit {
//!     fn name(&self) -> &str { "slit" }
//!
//!     async fn read(&self, _maxage: Option<Duration>) -> Result<Value> {
//!         Ok(Value::Number(*self.width.read().await))
//!     }
//!
//!     async fn status(&self, _maxage: Option<Duration>) -> Result<DeviceStatus> {
//!         Ok(DeviceStatus::ok())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::data::value::{
    ArrayData, ArrayInfo, DetectorResult, MetaEntry, Preset, Quality, Value, ValueInfo,
};

// =============================================================================
// Device Status
// =============================================================================

/// Coarse device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Idle and healthy
    Ok,
    /// Usable, but something needs attention
    Warn,
    /// Moving or counting
    Busy,
    /// Target was not reached
    NotReached,
    /// Switched off
    Disabled,
    /// Faulty
    Error,
    /// State cannot be determined
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusCode::Ok => "ok",
            StatusCode::Warn => "warn",
            StatusCode::Busy => "busy",
            StatusCode::NotReached => "notreached",
            StatusCode::Disabled => "disabled",
            StatusCode::Error => "error",
            StatusCode::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Status code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Coarse state
    pub code: StatusCode,
    /// Detail text
    pub message: String,
}

impl DeviceStatus {
    /// Create a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Idle status with the conventional "idle" message.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "idle")
    }

    /// Busy status.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, message)
    }

    /// Whether the device is still moving or counting.
    pub fn is_busy(&self) -> bool {
        self.code == StatusCode::Busy
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Readable, optionally positionable device
///
/// # Contract
/// - `read` returns the current value; `maxage` allows cached values that are
///   not older than the given duration (`None`: any age, `Some(ZERO)`: fresh)
/// - `start` initiates motion and returns before completion
/// - `wait` blocks until motion completes and returns the settled value
/// - `value_info` is static metadata and must not touch the hardware
///
/// # Thread Safety
/// - All methods take `&self`; drivers use interior mutability for state
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device name
    fn name(&self) -> &str;

    /// Descriptors of the columns `read` delivers
    ///
    /// # Default Implementation
    /// One unnamed-unit column named like the device.
    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(self.name())]
    }

    /// Header entries `(parameter, entry)` describing the device configuration
    fn info(&self) -> Vec<(String, MetaEntry)> {
        Vec::new()
    }

    /// Read the current value
    async fn read(&self, maxage: Option<Duration>) -> Result<Value>;

    /// Query the device state
    async fn status(&self, maxage: Option<Duration>) -> Result<DeviceStatus>;

    /// Start moving to `target`
    ///
    /// # Default Implementation
    /// Returns an error: read-only devices cannot be positioned.
    async fn start(&self, target: &Value) -> Result<()> {
        let _ = target;
        anyhow::bail!("Device '{}' cannot be moved", self.name())
    }

    /// Wait until the device is idle and return its settled value
    ///
    /// # Default Implementation
    /// Read-only devices are always settled; returns a fresh reading.
    async fn wait(&self) -> Result<Value> {
        self.read(Some(Duration::ZERO)).await
    }

    /// Stop motion or counting
    ///
    /// # Default Implementation
    /// Nothing to stop.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Current motion speed
    ///
    /// # Default Implementation
    /// Returns an error indicating speed control is not supported.
    async fn speed(&self) -> Result<f64> {
        anyhow::bail!("Speed not supported by device '{}'", self.name())
    }

    /// Change motion speed
    ///
    /// # Default Implementation
    /// Returns an error indicating speed control is not supported.
    async fn set_speed(&self, speed: f64) -> Result<()> {
        let _ = speed;
        anyhow::bail!("Speed not supported by device '{}'", self.name())
    }
}

/// Capability: Counting detector
///
/// # Contract
/// - `set_preset` configures the stopping condition, `prepare` arms the hardware,
///   `start_counting` begins acquisition
/// - `is_completed` becomes true once the preset is reached
/// - `during_measure_hook` is polled while counting; returning a quality requests
///   a live or intermediate readout at that moment
/// - `finish` is called once counting completed, before the final readout
/// - `stop` (from [`Device`]) interrupts counting
#[async_trait]
pub trait Detector: Device {
    /// Preset keys this detector accepts (`t`, `m`, ...)
    fn preset_keys(&self) -> Vec<String>;

    /// Descriptors of the arrays `read_arrays` delivers
    fn array_info(&self) -> Vec<ArrayInfo> {
        Vec::new()
    }

    /// Configure the counting conditions
    async fn set_preset(&self, preset: &Preset) -> Result<()>;

    /// Prepare the hardware for the next acquisition
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Begin counting
    async fn start_counting(&self) -> Result<()>;

    /// Whether the preset has been reached
    async fn is_completed(&self) -> Result<bool>;

    /// Called periodically while counting
    ///
    /// # Default Implementation
    /// Never requests an intermediate readout.
    async fn during_measure_hook(&self, elapsed: Duration) -> Option<Quality> {
        let _ = elapsed;
        None
    }

    /// Read array data with the given quality
    async fn read_arrays(&self, quality: Quality) -> Result<Vec<Option<ArrayData>>> {
        let _ = quality;
        Ok(Vec::new())
    }

    /// Read scalars and arrays with the given quality
    ///
    /// # Default Implementation
    /// Scalars from [`Device::read`] (split into `value_info` columns) and arrays
    /// from [`Detector::read_arrays`].
    async fn read_results(&self, quality: Quality) -> Result<DetectorResult> {
        let value = self.read(Some(Duration::ZERO)).await?;
        let mut scalars = Vec::new();
        value.flatten_into(self.value_info().len(), &mut scalars);
        let arrays = self.read_arrays(quality).await?;
        Ok(DetectorResult { scalars, arrays })
    }

    /// Finish counting after completion
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}
