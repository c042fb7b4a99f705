//! Continuous scan.
//!
//! One device moves from `start` to `end` at reduced speed while the detectors
//! count without interruption. Every `timedelta` the detectors are read out and
//! a point is recorded at the midpoint of the interval, holding the counts
//! accumulated since the previous readout.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::data::dataset::ScanDataset;
use crate::data::manager::AcquisitionContext;
use crate::data::value::{Quality, ResultMap, TimedValue, Value, ValueMap};
use crate::error::{Phase, ScanError, ScanResult};
use crate::hardware::capabilities::Device;
use crate::scan::engine::{handle_error, ErrorAction, PointOutcome, ScanCore, ScanOptions};

/// A continuous scan of a single device.
pub struct ContinuousScan {
    core: ScanCore,
    device: Arc<dyn Device>,
    start: Value,
    end: Value,
    speed: f64,
    timedelta: Duration,
}

impl ContinuousScan {
    /// Move `device` from `start` to `end` at `speed`, reading out every `timedelta`.
    pub fn new(
        device: Arc<dyn Device>,
        start: Value,
        end: Value,
        speed: f64,
        timedelta: Duration,
        options: ScanOptions,
        ctx: &AcquisitionContext,
    ) -> ScanResult<Self> {
        if speed <= 0.0 || !speed.is_finite() {
            return Err(ScanError::Configuration(format!(
                "continuous scan speed must be positive, got {}",
                speed
            )));
        }
        if timedelta.is_zero() {
            return Err(ScanError::Configuration(
                "continuous scan readout interval must not be zero".to_string(),
            ));
        }
        let core = ScanCore::new(vec![Arc::clone(&device)], options, ctx)?;
        Ok(Self {
            core,
            device,
            start,
            end,
            speed,
            timedelta,
        })
    }

    /// Execute the scan.
    ///
    /// The original device speed is restored and the detectors are stopped no
    /// matter how the scan ends.
    pub async fn run(&self, ctx: &AcquisitionContext) -> ScanResult<Option<Arc<ScanDataset>>> {
        let mut prepare = self.core.firstmoves.clone();
        prepare.push((Arc::clone(&self.device), self.start.clone()));
        let prepared = self.core.move_devices(&prepare, true, Phase::Prepare).await?;
        match prepared.action {
            Some(ErrorAction::Stop(reason)) => {
                warn!(%reason, "Continuous scan could not reach its start position");
                return Ok(None);
            }
            Some(ErrorAction::Skip(reason)) => {
                warn!(%reason, "Start position not reached, scanning from here");
            }
            _ => {}
        }

        let original_speed = match self.device.speed().await {
            Ok(speed) => Some(speed),
            Err(e) => {
                debug!(device = %self.device.name(), error = %e, "Speed not readable");
                None
            }
        };
        if let Err(e) = self.device.set_speed(self.speed).await {
            if let Some(outcome) = handle_error(Phase::Prepare, self.device.name(), e)?.outcome() {
                warn!(?outcome, "Continuous scan could not set the speed");
                return Ok(None);
            }
        }

        ctx.begin_scan(self.core.scan_params(None, 0))?;
        info!(
            device = %self.device.name(),
            start = %self.start,
            end = %self.end,
            speed = self.speed,
            "Continuous scan started"
        );

        let outcome = self.run_points(ctx).await;

        if let Some(speed) = original_speed {
            if let Err(e) = self.device.set_speed(speed).await {
                warn!(device = %self.device.name(), error = %e, "Restoring speed failed");
            }
        }
        if let Err(e) = self.device.stop().await {
            warn!(device = %self.device.name(), error = %e, "Stopping device failed");
        }
        for det in &self.core.detectors {
            if let Err(e) = det.stop().await {
                warn!(device = %det.name(), error = %e, "Stopping detector failed");
            }
            if let Err(e) = det.finish().await {
                warn!(device = %det.name(), error = %e, "Finishing detector failed");
            }
        }
        let dataset = ctx.finish_scan();
        outcome?;
        Ok(dataset)
    }

    async fn start_detectors(&self) -> ScanResult<Option<ErrorAction>> {
        for det in &self.core.detectors {
            let started = match det.set_preset(&self.core.preset).await {
                Ok(()) => match det.prepare().await {
                    Ok(()) => det.start_counting().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                if let ErrorAction::Stop(r) = handle_error(Phase::Count, det.name(), e)? {
                    return Ok(Some(ErrorAction::Stop(r)));
                }
            }
        }
        Ok(None)
    }

    async fn run_points(&self, ctx: &AcquisitionContext) -> ScanResult<()> {
        if let Some(ErrorAction::Stop(reason)) = self.start_detectors().await? {
            warn!(%reason, "Detectors could not be started");
            return Ok(());
        }

        let moving = self
            .core
            .move_devices(&[(Arc::clone(&self.device), self.end.clone())], false, Phase::Move)
            .await?;
        if let Some(outcome) = moving.action.as_ref().and_then(ErrorAction::outcome) {
            warn!(?outcome, "Continuous move could not be started");
            return Ok(());
        }

        let mut last_position = match self.device.read(None).await {
            Ok(value) => value,
            Err(e) => {
                handle_error(Phase::Read, self.device.name(), e)?;
                self.start.clone()
            }
        };
        let (mut last_results, _) = self.core.read_results(Quality::Intermediate).await?;

        let mut num = 0usize;
        loop {
            sleep(self.timedelta).await;
            num += 1;
            if ctx.stop_requested() {
                warn!(point = num, "Continuous scan stopped on request");
                break;
            }

            let busy = match self.device.status(None).await {
                Ok(status) => status.is_busy(),
                Err(e) => match handle_error(Phase::Read, self.device.name(), e)? {
                    ErrorAction::Stop(reason) => {
                        warn!(point = num, %reason, "Continuous scan aborted");
                        break;
                    }
                    _ => true,
                },
            };
            let position = match self.device.read(None).await {
                Ok(value) => value,
                Err(e) => match handle_error(Phase::Read, self.device.name(), e)? {
                    ErrorAction::Stop(reason) => {
                        warn!(point = num, %reason, "Continuous scan aborted");
                        break;
                    }
                    _ => Value::Missing,
                },
            };
            let (results, _) = self.core.read_results(Quality::Intermediate).await?;

            let midpoint = if position.is_missing() {
                Value::Missing
            } else {
                last_position.midpoint(&position)
            };
            let mut deltas = ResultMap::new();
            for (name, result) in &results {
                let delta = match last_results.get(name) {
                    Some(previous) => result.difference(previous),
                    None => result.clone(),
                };
                deltas.insert(name.clone(), delta);
            }

            ctx.begin_point(self.core.point_params())?;
            ctx.put_values(&ValueMap::from([(
                self.device.name().to_string(),
                TimedValue::canonical(midpoint),
            )]));
            if num == 1 {
                ctx.put_metainfo(&self.core.collect_metainfo());
            }
            let sampled = self.core.read_environment(ctx).await;
            if sampled.is_ok() {
                ctx.put_results(Quality::Final, &deltas);
            }
            ctx.finish_point();
            let outcome = sampled?.and_then(|action| action.outcome());

            if let Some(PointOutcome::Aborted(reason)) = outcome {
                warn!(point = num, %reason, "Continuous scan aborted");
                break;
            }
            if !position.is_missing() {
                last_position = position;
            }
            last_results.extend(results);
            if !busy {
                debug!(points = num, "Continuous move finished");
                break;
            }
        }
        Ok(())
    }
}
