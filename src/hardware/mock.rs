//! Mock Hardware Implementations
//!
//! Provides simulated devices for running scans without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - Positionable axis with scripted failures and busy polls
//! - `MockSensor` - Read-only environment device
//! - `MockDetector` - Counting detector with scripted cumulative readings
//! - `MockTas` - Triple-axis instrument positioned in `(h, k, l, E)`
//!
//! # Performance Characteristics
//!
//! - MockMotor: 1000 units/sec motion speed, motion time spent in `wait()`
//! - MockDetector: completes after a configurable number of completion polls

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::data::value::{
    ArrayData, ArrayInfo, DetectorResult, MetaEntry, Preset, Quality, Value, ValueInfo, ValueType,
};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::hardware::capabilities::{Detector, Device, DeviceStatus};

// =============================================================================
// MockMotor - Simulated Axis
// =============================================================================

/// Mock motor with scripted behaviour
///
/// Simulates an axis with:
/// - Motion time proportional to distance, spent in `wait()`
/// - One-shot start failures for given targets (position stays unchanged)
/// - A number of `Busy` status polls after every `start()`, each advancing the
///   position towards the target
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::new("x").fail_at(2.0, DeviceErrorKind::Position);
/// motor.start(&Value::Number(1.0)).await?;
/// motor.wait().await?;
/// assert!(motor.start(&Value::Number(2.0)).await.is_err());
/// ```
pub struct MockMotor {
    name: String,
    unit: String,
    position: Arc<RwLock<f64>>,
    target: Arc<RwLock<f64>>,
    speed: Mutex<f64>,
    busy_polls: usize,
    busy_remaining: AtomicUsize,
    failures: Mutex<Vec<(f64, DeviceErrorKind)>>,
    read_failures: Mutex<VecDeque<DeviceErrorKind>>,
    started: Mutex<Vec<f64>>,
}

impl MockMotor {
    /// Create new mock motor at position 0.0
    pub fn new(name: &str) -> Self {
        Self::with_position(name, 0.0)
    }

    /// Create new mock motor at specified initial position
    pub fn with_position(name: &str, initial_position: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: "mm".to_string(),
            position: Arc::new(RwLock::new(initial_position)),
            target: Arc::new(RwLock::new(initial_position)),
            speed: Mutex::new(1000.0),
            busy_polls: 0,
            busy_remaining: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            read_failures: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `start()` towards `target` with the given kind
    pub fn fail_at(self, target: f64, kind: DeviceErrorKind) -> Self {
        self.failures.lock().push((target, kind));
        self
    }

    /// Fail the next `read()` with the given kind
    pub fn fail_next_read(self, kind: DeviceErrorKind) -> Self {
        self.read_failures.lock().push_back(kind);
        self
    }

    /// Report `Busy` for `polls` status queries after every start
    pub fn with_busy_polls(mut self, polls: usize) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Targets passed to `start()` so far (including failed ones)
    pub fn started_targets(&self) -> Vec<f64> {
        self.started.lock().clone()
    }

    async fn current(&self) -> f64 {
        *self.position.read().await
    }
}

fn number(target: &Value, device: &str) -> Result<f64> {
    target.as_f64().ok_or_else(|| {
        anyhow!(DeviceError::new(
            device,
            DeviceErrorKind::InvalidValue,
            format!("target {} is not a number", target),
        ))
    })
}

#[async_trait]
impl Device for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(&self.name).with_unit(&self.unit)]
    }

    fn info(&self) -> Vec<(String, MetaEntry)> {
        let speed = *self.speed.lock();
        vec![(
            "speed".to_string(),
            MetaEntry {
                value: Value::Number(speed),
                text: format!("{:.3}", speed),
                unit: format!("{}/s", self.unit),
                category: "instrument".to_string(),
            },
        )]
    }

    async fn read(&self, _maxage: Option<Duration>) -> Result<Value> {
        if let Some(kind) = self.read_failures.lock().pop_front() {
            return Err(anyhow!(DeviceError::new(&self.name, kind, "position not readable")));
        }
        Ok(Value::Number(self.current().await))
    }

    async fn status(&self, _maxage: Option<Duration>) -> Result<DeviceStatus> {
        let remaining = self.busy_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            // Each busy poll covers an equal share of the remaining distance.
            let target = *self.target.read().await;
            let mut position = self.position.write().await;
            *position += (target - *position) / remaining as f64;
            self.busy_remaining.store(remaining - 1, Ordering::SeqCst);
            return Ok(DeviceStatus::busy("moving"));
        }
        Ok(DeviceStatus::ok())
    }

    async fn start(&self, target: &Value) -> Result<()> {
        let target = number(target, &self.name)?;
        self.started.lock().push(target);

        let failure = {
            let mut failures = self.failures.lock();
            failures
                .iter()
                .position(|(t, _)| (*t - target).abs() < f64::EPSILON)
                .map(|idx| failures.remove(idx).1)
        };
        if let Some(kind) = failure {
            return Err(anyhow!(DeviceError::new(
                &self.name,
                kind,
                format!("cannot reach {:.3}", target),
            )));
        }

        *self.target.write().await = target;
        self.busy_remaining.store(self.busy_polls, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self) -> Result<Value> {
        let target = *self.target.read().await;
        let distance = (target - self.current().await).abs();
        let speed = *self.speed.lock();
        if speed > 0.0 && distance > 0.0 {
            sleep(Duration::from_secs_f64(distance / speed)).await;
        }
        *self.position.write().await = target;
        self.busy_remaining.store(0, Ordering::SeqCst);
        Ok(Value::Number(target))
    }

    async fn stop(&self) -> Result<()> {
        let here = self.current().await;
        *self.target.write().await = here;
        self.busy_remaining.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn speed(&self) -> Result<f64> {
        Ok(*self.speed.lock())
    }

    async fn set_speed(&self, speed: f64) -> Result<()> {
        if speed <= 0.0 {
            return Err(anyhow!(DeviceError::new(
                &self.name,
                DeviceErrorKind::InvalidValue,
                "speed must be positive",
            )));
        }
        *self.speed.lock() = speed;
        Ok(())
    }
}

// =============================================================================
// MockSensor - Simulated Environment Device
// =============================================================================

/// Read-only mock device (thermometer, field sensor)
pub struct MockSensor {
    name: String,
    unit: String,
    value: Mutex<f64>,
    read_failures: Mutex<VecDeque<DeviceErrorKind>>,
}

impl MockSensor {
    /// Create new mock sensor with a fixed reading
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: "K".to_string(),
            value: Mutex::new(value),
            read_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Fail the next read with the given kind
    pub fn fail_next_read(self, kind: DeviceErrorKind) -> Self {
        self.read_failures.lock().push_back(kind);
        self
    }

    /// Change the reading
    pub fn set_value(&self, value: f64) {
        *self.value.lock() = value;
    }
}

#[async_trait]
impl Device for MockSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new(&self.name).with_unit(&self.unit)]
    }

    async fn read(&self, _maxage: Option<Duration>) -> Result<Value> {
        if let Some(kind) = self.read_failures.lock().pop_front() {
            return Err(anyhow!(DeviceError::new(&self.name, kind, "readout failed")));
        }
        Ok(Value::Number(*self.value.lock()))
    }

    async fn status(&self, _maxage: Option<Duration>) -> Result<DeviceStatus> {
        Ok(DeviceStatus::ok())
    }
}

// =============================================================================
// MockDetector - Simulated Counter
// =============================================================================

/// Mock counting detector
///
/// Delivers two scalar columns, `<name>.time` and `<name>.counts`, and
/// optionally one spectrum array. Readings are either derived from the preset
/// (`counts = rate * t`) or taken from a scripted sequence of cumulative values.
pub struct MockDetector {
    name: String,
    rate: f64,
    polls_to_complete: usize,
    polls: AtomicUsize,
    counting: AtomicBool,
    stopped: AtomicBool,
    preset: Mutex<Preset>,
    readings: Mutex<VecDeque<DetectorResult>>,
    last_reading: Mutex<Option<DetectorResult>>,
    with_array: bool,
    live_every: usize,
    count_failures: Mutex<VecDeque<DeviceErrorKind>>,
    readout_failure: Mutex<Option<(usize, DeviceErrorKind)>>,
    readouts: AtomicUsize,
    starts: AtomicUsize,
}

impl MockDetector {
    /// Create new mock detector counting `rate` counts per second of preset time
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rate: 100.0,
            polls_to_complete: 1,
            polls: AtomicUsize::new(0),
            counting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            preset: Mutex::new(Preset::new()),
            readings: Mutex::new(VecDeque::new()),
            last_reading: Mutex::new(None),
            with_array: false,
            live_every: 0,
            count_failures: Mutex::new(VecDeque::new()),
            readout_failure: Mutex::new(None),
            readouts: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    /// Counting rate used when no scripted readings are configured
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Number of `is_completed` polls until counting completes
    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls_to_complete = polls.max(1);
        self
    }

    /// Deliver a one-dimensional spectrum array alongside the scalars
    pub fn with_array(mut self) -> Self {
        self.with_array = true;
        self
    }

    /// Request a live readout every `polls` polls
    pub fn with_live_every(mut self, polls: usize) -> Self {
        self.live_every = polls;
        self
    }

    /// Scripted cumulative readings, consumed one per readout (the last repeats)
    pub fn with_readings(self, readings: Vec<DetectorResult>) -> Self {
        self.readings.lock().extend(readings);
        self
    }

    /// Fail the next `start_counting` with the given kind
    pub fn fail_next_count(self, kind: DeviceErrorKind) -> Self {
        self.count_failures.lock().push_back(kind);
        self
    }

    /// Fail the readout after `ok_reads` successful ones with the given kind.
    ///
    /// The failed readout still consumes one scripted reading.
    pub fn fail_readout_after(self, ok_reads: usize, kind: DeviceErrorKind) -> Self {
        *self.readout_failure.lock() = Some((ok_reads + 1, kind));
        self
    }

    /// How often counting was started
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Whether the last acquisition was stopped
    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn computed_reading(&self) -> DetectorResult {
        let t = self.preset.lock().get("t").copied().unwrap_or(1.0);
        let counts = (self.rate * t).round();
        let arrays = if self.with_array {
            vec![Some(ArrayData::from_vec(vec![counts / 2.0, counts / 2.0]))]
        } else {
            Vec::new()
        };
        DetectorResult {
            scalars: vec![Value::Number(t), Value::Number(counts)],
            arrays,
        }
    }

    fn next_reading(&self) -> DetectorResult {
        let scripted = {
            let mut readings = self.readings.lock();
            if readings.len() > 1 {
                readings.pop_front()
            } else {
                readings.front().cloned()
            }
        };
        let reading = scripted.unwrap_or_else(|| self.computed_reading());
        *self.last_reading.lock() = Some(reading.clone());
        reading
    }
}

#[async_trait]
impl Device for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![
            ValueInfo::new(format!("{}.time", self.name))
                .with_unit("s")
                .with_type(ValueType::Time),
            ValueInfo::new(format!("{}.counts", self.name))
                .with_unit("cts")
                .with_type(ValueType::Counter)
                .with_errors("sqrt"),
        ]
    }

    async fn read(&self, _maxage: Option<Duration>) -> Result<Value> {
        let reading = self.last_reading.lock().clone().unwrap_or_default();
        Ok(Value::Sequence(reading.scalars))
    }

    async fn status(&self, _maxage: Option<Duration>) -> Result<DeviceStatus> {
        if self.counting.load(Ordering::SeqCst) {
            Ok(DeviceStatus::busy("counting"))
        } else {
            Ok(DeviceStatus::ok())
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.counting.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn preset_keys(&self) -> Vec<String> {
        vec!["t".to_string(), "m".to_string()]
    }

    fn array_info(&self) -> Vec<ArrayInfo> {
        if self.with_array {
            vec![ArrayInfo {
                name: format!("{}.spectrum", self.name),
                shape: vec![2],
                dtype: "float64".to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    async fn set_preset(&self, preset: &Preset) -> Result<()> {
        let mut own = self.preset.lock();
        own.clear();
        for (key, value) in preset {
            if self.preset_keys().contains(key) {
                own.insert(key.clone(), *value);
            }
        }
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        self.polls.store(0, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start_counting(&self) -> Result<()> {
        if let Some(kind) = self.count_failures.lock().pop_front() {
            return Err(anyhow!(DeviceError::new(&self.name, kind, "counter did not start")));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.counting.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_completed(&self) -> Result<bool> {
        if !self.counting.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls >= self.polls_to_complete {
            self.counting.store(false, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    async fn during_measure_hook(&self, _elapsed: Duration) -> Option<Quality> {
        let polls = self.polls.load(Ordering::SeqCst);
        (self.live_every > 0 && polls > 0 && polls % self.live_every == 0).then_some(Quality::Live)
    }

    async fn read_results(&self, _quality: Quality) -> Result<DetectorResult> {
        let readout = self.readouts.fetch_add(1, Ordering::SeqCst) + 1;
        let reading = self.next_reading();
        let mut failure = self.readout_failure.lock();
        if let Some((at, kind)) = *failure {
            if at == readout {
                *failure = None;
                return Err(anyhow!(DeviceError::new(&self.name, kind, "readout failed")));
            }
        }
        Ok(reading)
    }

    async fn finish(&self) -> Result<()> {
        self.counting.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockTas - Simulated Triple-Axis Instrument
// =============================================================================

/// Mock triple-axis spectrometer positioned in reciprocal space
///
/// Value is the four-component sequence `(h, k, l, E)`.
pub struct MockTas {
    name: String,
    position: Mutex<[f64; 4]>,
}

impl MockTas {
    /// Create a new instrument at `(0, 0, 0, 0)`
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            position: Mutex::new([0.0; 4]),
        }
    }
}

#[async_trait]
impl Device for MockTas {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![
            ValueInfo::new(format!("{}.h", self.name)).with_unit("rlu"),
            ValueInfo::new(format!("{}.k", self.name)).with_unit("rlu"),
            ValueInfo::new(format!("{}.l", self.name)).with_unit("rlu"),
            ValueInfo::new(format!("{}.E", self.name)).with_unit("meV"),
        ]
    }

    async fn read(&self, _maxage: Option<Duration>) -> Result<Value> {
        Ok(Value::from(self.position.lock().to_vec()))
    }

    async fn status(&self, _maxage: Option<Duration>) -> Result<DeviceStatus> {
        Ok(DeviceStatus::ok())
    }

    async fn start(&self, target: &Value) -> Result<()> {
        let components = match target {
            Value::Sequence(items) if items.len() == 4 => items
                .iter()
                .map(|v| number(v, &self.name))
                .collect::<Result<Vec<f64>>>()?,
            other => {
                return Err(anyhow!(DeviceError::new(
                    &self.name,
                    DeviceErrorKind::InvalidValue,
                    format!("expected (h, k, l, E), got {}", other),
                )))
            }
        };
        let mut position = self.position.lock();
        position.copy_from_slice(&components);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_motor_move() {
        let motor = MockMotor::new("x");
        assert_eq!(motor.read(None).await.unwrap(), Value::Number(0.0));

        motor.start(&Value::Number(5.0)).await.unwrap();
        assert_eq!(motor.wait().await.unwrap(), Value::Number(5.0));
        assert_eq!(motor.read(None).await.unwrap(), Value::Number(5.0));
    }

    #[tokio::test]
    async fn test_mock_motor_scripted_failure_is_one_shot() {
        let motor = MockMotor::new("x").fail_at(2.0, DeviceErrorKind::Position);

        let err = motor.start(&Value::Number(2.0)).await.unwrap_err();
        let dev_err = err.downcast_ref::<DeviceError>().unwrap();
        assert_eq!(dev_err.kind, DeviceErrorKind::Position);
        assert_eq!(motor.read(None).await.unwrap(), Value::Number(0.0));

        motor.start(&Value::Number(2.0)).await.unwrap();
        assert_eq!(motor.started_targets(), vec![2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_mock_motor_busy_polls() {
        let motor = MockMotor::new("x").with_busy_polls(2);
        motor.start(&Value::Number(1.0)).await.unwrap();

        assert!(motor.status(None).await.unwrap().is_busy());
        assert_eq!(motor.read(None).await.unwrap(), Value::Number(0.5));
        assert!(motor.status(None).await.unwrap().is_busy());
        assert!(!motor.status(None).await.unwrap().is_busy());
        assert_eq!(motor.read(None).await.unwrap(), Value::Number(1.0));
    }

    #[tokio::test]
    async fn test_mock_detector_counts_from_preset() {
        let det = MockDetector::new("det").with_rate(50.0).with_polls(2);
        let preset = Preset::from([("t".to_string(), 2.0), ("x".to_string(), 1.0)]);
        det.set_preset(&preset).await.unwrap();
        det.prepare().await.unwrap();
        det.start_counting().await.unwrap();

        assert!(!det.is_completed().await.unwrap());
        assert!(det.is_completed().await.unwrap());

        let result = det.read_results(Quality::Final).await.unwrap();
        assert_eq!(result.scalars, vec![Value::Number(2.0), Value::Number(100.0)]);
    }

    #[tokio::test]
    async fn test_mock_detector_scripted_readings() {
        let reading = |c: f64| DetectorResult {
            scalars: vec![Value::Number(0.0), Value::Number(c)],
            arrays: vec![],
        };
        let det = MockDetector::new("det").with_readings(vec![reading(1.0), reading(5.0)]);

        assert_eq!(det.read_results(Quality::Final).await.unwrap(), reading(1.0));
        assert_eq!(det.read_results(Quality::Final).await.unwrap(), reading(5.0));
        assert_eq!(det.read_results(Quality::Final).await.unwrap(), reading(5.0));
    }

    #[tokio::test]
    async fn test_mock_tas_position() {
        let tas = MockTas::new("tas");
        tas.start(&Value::from(vec![1.0, 0.0, 0.0, 2.5])).await.unwrap();
        assert_eq!(tas.read(None).await.unwrap(), Value::from(vec![1.0, 0.0, 0.0, 2.5]));
        assert!(tas.start(&Value::Number(1.0)).await.is_err());
    }
}
