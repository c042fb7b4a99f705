//! Sweep scan.
//!
//! Devices are started once towards their end targets; the scan counts
//! repeatedly while they move, either a fixed number of times or (negative
//! `numpoints`) until the devices are no longer busy. The preset keys `delay`
//! (seconds between points) and `minstep` (minimum change of the first swept
//! device between points) pace the measurement.
//!
//! Without devices the sweep is a plain time scan: it records an
//! [`ElapsedTime`] pseudo device in the environment and counts until
//! `numpoints` is reached or a stop is requested.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::data::dataset::ScanDataset;
use crate::data::manager::AcquisitionContext;
use crate::data::value::{Value, ValueInfo, ValueType};
use crate::error::{Phase, ScanResult};
use crate::hardware::capabilities::{Device, DeviceStatus};
use crate::scan::engine::{handle_error, ErrorAction, Move, PointOutcome, ScanCore, ScanOptions};

/// Pseudo device reporting the seconds since the sweep started.
pub struct ElapsedTime {
    started: Mutex<Instant>,
}

impl ElapsedTime {
    /// New clock, started now.
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Instant::now()),
        }
    }

    /// Restart the clock.
    pub fn reset(&self) {
        *self.started.lock() = Instant::now();
    }
}

impl Default for ElapsedTime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for ElapsedTime {
    fn name(&self) -> &str {
        "etime"
    }

    fn value_info(&self) -> Vec<ValueInfo> {
        vec![ValueInfo::new("etime")
            .with_unit("s")
            .with_type(ValueType::Time)]
    }

    async fn read(&self, _maxage: Option<Duration>) -> anyhow::Result<Value> {
        Ok(Value::Number(self.started.lock().elapsed().as_secs_f64()))
    }

    async fn status(&self, _maxage: Option<Duration>) -> anyhow::Result<DeviceStatus> {
        Ok(DeviceStatus::ok())
    }
}

/// A sweep scan.
pub struct SweepScan {
    core: ScanCore,
    sweeps: Vec<Move>,
    numpoints: i64,
    delay: Option<Duration>,
    minstep: Option<f64>,
    clock: Option<Arc<ElapsedTime>>,
}

/// Builder for [`SweepScan`].
pub struct SweepScanBuilder {
    devices: Vec<Arc<dyn Device>>,
    starts: Option<Vec<Value>>,
    ends: Vec<Value>,
    numpoints: i64,
    options: ScanOptions,
}

impl SweepScanBuilder {
    /// Approach these start positions before sweeping.
    pub fn starts(mut self, starts: Vec<Value>) -> Self {
        self.starts = Some(starts);
        self
    }

    /// Common scan options; `delay` and `minstep` preset keys configure pacing.
    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and create the sweep.
    pub fn build(self, ctx: &AcquisitionContext) -> ScanResult<SweepScan> {
        use crate::error::ScanError;

        if self.ends.len() != self.devices.len() {
            return Err(ScanError::Configuration(format!(
                "{} end position(s) for {} device(s)",
                self.ends.len(),
                self.devices.len()
            )));
        }
        let mut options = self.options;
        if let Some(starts) = self.starts {
            if starts.len() != self.devices.len() {
                return Err(ScanError::Configuration(format!(
                    "{} start position(s) for {} device(s)",
                    starts.len(),
                    self.devices.len()
                )));
            }
            for (device, start) in self.devices.iter().zip(starts) {
                options = options.first_move(Arc::clone(device), start);
            }
        }

        let delay = options
            .take_preset("delay")
            .filter(|d| *d > 0.0)
            .map(Duration::from_secs_f64);
        let minstep = options.take_preset("minstep").filter(|m| *m > 0.0);

        let clock = if self.devices.is_empty() {
            let clock = Arc::new(ElapsedTime::new());
            options.prepend_environment(vec![clock.clone() as Arc<dyn Device>], ctx);
            Some(clock)
        } else {
            options.prepend_environment(self.devices.clone(), ctx);
            None
        };

        let sweeps = self.devices.into_iter().zip(self.ends).collect();
        let core = ScanCore::new(Vec::new(), options, ctx)?;
        Ok(SweepScan {
            core,
            sweeps,
            numpoints: self.numpoints,
            delay,
            minstep,
            clock,
        })
    }
}

impl SweepScan {
    /// Sweep `devices` to `ends`, counting `numpoints` times (negative: until idle).
    pub fn builder(devices: Vec<Arc<dyn Device>>, ends: Vec<Value>, numpoints: i64) -> SweepScanBuilder {
        SweepScanBuilder {
            devices,
            starts: None,
            ends,
            numpoints,
            options: ScanOptions::default(),
        }
    }

    /// Time scan: count `numpoints` times (negative: until stopped).
    pub fn time_scan(numpoints: i64) -> SweepScanBuilder {
        Self::builder(Vec::new(), Vec::new(), numpoints)
    }

    fn npoints(&self) -> Option<usize> {
        usize::try_from(self.numpoints).ok()
    }

    /// Execute the sweep.
    pub async fn run(&self, ctx: &AcquisitionContext) -> ScanResult<Option<Arc<ScanDataset>>> {
        let prepared = self
            .core
            .move_devices(&self.core.firstmoves, true, Phase::Prepare)
            .await?;
        let skip_first = match prepared.action {
            Some(ErrorAction::Stop(reason)) => {
                warn!(%reason, "Sweep could not reach its start position");
                return Ok(None);
            }
            Some(ErrorAction::Skip(reason)) => {
                warn!(%reason, "Skipping first point");
                true
            }
            _ => false,
        };

        if let Some(clock) = &self.clock {
            clock.reset();
        }
        ctx.begin_scan(self.core.scan_params(self.npoints(), 0))?;
        info!(npoints = ?self.npoints(), sweeps = self.sweeps.len(), "Sweep started");

        let outcome = self.run_points(ctx, skip_first).await;
        for (device, _) in &self.sweeps {
            if let Err(e) = device.stop().await {
                warn!(device = %device.name(), error = %e, "Stopping swept device failed");
            }
        }
        let dataset = ctx.finish_scan();
        outcome?;
        Ok(dataset)
    }

    async fn run_points(&self, ctx: &AcquisitionContext, skip_first: bool) -> ScanResult<()> {
        let started = self.core.move_devices(&self.sweeps, false, Phase::Move).await?;
        if let Some(outcome) = started.action.as_ref().and_then(ErrorAction::outcome) {
            warn!(?outcome, "Sweep could not be started");
            return Ok(());
        }

        let mut last_position: Option<f64> = None;
        let mut first_recorded = true;
        let mut num = 0usize;
        loop {
            num += 1;
            if self.npoints().is_some_and(|n| num > n) {
                break;
            }
            if ctx.stop_requested() {
                warn!(point = num, "Sweep stopped on request");
                break;
            }
            if !self.sweeps.is_empty() && !self.any_busy().await? {
                debug!(point = num, "Swept devices idle, sweep finished");
                break;
            }
            if num == 1 && skip_first {
                continue;
            }
            if num > 1 {
                if let Some(delay) = self.delay {
                    sleep(delay).await;
                }
                if let Some(minstep) = self.minstep {
                    last_position = self.wait_for_step(ctx, last_position, minstep).await?;
                }
            }

            ctx.begin_point(self.core.point_params())?;
            if first_recorded {
                ctx.put_metainfo(&self.core.collect_metainfo());
                first_recorded = false;
            }
            let counted = self.count_point(ctx).await;
            ctx.finish_point();
            let outcome = counted?;

            if last_position.is_none() && self.minstep.is_some() {
                last_position = self.position().await;
            }
            match outcome {
                PointOutcome::Aborted(reason) => {
                    warn!(point = num, %reason, "Sweep aborted");
                    break;
                }
                PointOutcome::Skipped(reason) => warn!(point = num, %reason, "Point skipped"),
                PointOutcome::Completed => {}
            }
        }
        Ok(())
    }

    async fn count_point(&self, ctx: &AcquisitionContext) -> ScanResult<PointOutcome> {
        match self.core.read_environment(ctx).await? {
            Some(action) => Ok(action.outcome().unwrap_or(PointOutcome::Completed)),
            None => self.core.acquire(ctx, &self.core.preset).await,
        }
    }

    /// One status query per swept device.
    async fn any_busy(&self) -> ScanResult<bool> {
        let mut busy = false;
        for (device, _) in &self.sweeps {
            match device.status(None).await {
                Ok(status) => busy |= status.is_busy(),
                Err(e) => match handle_error(Phase::Read, device.name(), e)? {
                    ErrorAction::Stop(_) => return Ok(false),
                    _ => busy = true,
                },
            }
        }
        Ok(busy)
    }

    async fn position(&self) -> Option<f64> {
        let (device, _) = self.sweeps.first()?;
        device.read(None).await.ok().and_then(|v| v.as_f64())
    }

    /// Poll until the first swept device moved at least `minstep`.
    async fn wait_for_step(
        &self,
        ctx: &AcquisitionContext,
        last: Option<f64>,
        minstep: f64,
    ) -> ScanResult<Option<f64>> {
        let Some(last) = last else {
            return Ok(self.position().await);
        };
        loop {
            let current = self.position().await;
            match current {
                Some(pos) if (pos - last).abs() >= minstep => return Ok(Some(pos)),
                None => return Ok(None),
                _ => {}
            }
            if ctx.stop_requested() || !self.any_busy().await? {
                return Ok(current);
            }
            sleep(ctx.poll_interval()).await;
        }
    }
}
