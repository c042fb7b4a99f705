//! Manual scan.
//!
//! No positioning of its own: the caller opens the scan, counts one point per
//! [`ManualScan::step`] (moving devices in between as it sees fit) and closes it
//! again. The recorded devices are read back at every step.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::dataset::ScanDataset;
use crate::data::manager::AcquisitionContext;
use crate::data::value::{Preset, ResultMap, ValueMap};
use crate::error::{Phase, ScanError, ScanResult};
use crate::hardware::capabilities::Device;
use crate::scan::engine::{ErrorAction, Move, PointOutcome, ScanCore, ScanOptions};

/// A scan whose points are triggered by the caller.
pub struct ManualScan {
    core: ScanCore,
    active: AtomicBool,
    points: AtomicUsize,
}

impl ManualScan {
    /// Record `devices` at every step.
    pub fn new(
        devices: Vec<Arc<dyn Device>>,
        options: ScanOptions,
        ctx: &AcquisitionContext,
    ) -> ScanResult<Self> {
        Ok(Self {
            core: ScanCore::new(devices, options, ctx)?,
            active: AtomicBool::new(false),
            points: AtomicUsize::new(0),
        })
    }

    /// Number of points recorded so far.
    pub fn points(&self) -> usize {
        self.points.load(Ordering::SeqCst)
    }

    /// Open the scan dataset.
    pub async fn manual_begin(&self, ctx: &AcquisitionContext) -> ScanResult<()> {
        if self.active.load(Ordering::SeqCst) {
            return Err(ScanError::Programming("manual scan already begun".to_string()));
        }
        let prepared = self
            .core
            .move_devices(&self.core.firstmoves, true, Phase::Prepare)
            .await?;
        match prepared.action {
            Some(ErrorAction::Stop(reason)) => warn!(%reason, "First moves of manual scan failed"),
            Some(ErrorAction::Skip(reason)) => {
                warn!(%reason, "First moves of manual scan incomplete")
            }
            _ => {}
        }
        ctx.begin_scan(self.core.scan_params(None, 0))?;
        self.active.store(true, Ordering::SeqCst);
        info!("Manual scan started");
        Ok(())
    }

    /// Count one point, or one point per multistep combination.
    ///
    /// `preset` entries override the scan's preset for this step only. Returns
    /// the detector results of every recorded point; skipped points contribute
    /// nothing.
    pub async fn step(
        &self,
        ctx: &AcquisitionContext,
        preset: Option<Preset>,
    ) -> ScanResult<Vec<ResultMap>> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(ScanError::Programming(
                "step() called outside manual_begin()/manual_end()".to_string(),
            ));
        }
        let mut merged = self.core.preset.clone();
        if let Some(overrides) = preset {
            merged.extend(overrides);
        }

        let combos: Vec<Vec<Move>> = if self.core.multistep.is_empty() {
            vec![Vec::new()]
        } else {
            self.core.multistep.clone()
        };
        let mut collected = Vec::with_capacity(combos.len());
        for combo in &combos {
            if ctx.stop_requested() {
                warn!("Manual step stopped on request");
                break;
            }
            match self.step_point(ctx, combo, &merged, &mut collected).await? {
                PointOutcome::Completed => {}
                PointOutcome::Skipped(reason) => warn!(%reason, "Point skipped"),
                PointOutcome::Aborted(reason) => {
                    warn!(%reason, "Manual step aborted");
                    break;
                }
            }
        }
        Ok(collected)
    }

    async fn step_point(
        &self,
        ctx: &AcquisitionContext,
        combo: &[Move],
        preset: &Preset,
        collected: &mut Vec<ResultMap>,
    ) -> ScanResult<PointOutcome> {
        let moved = self.core.move_devices(combo, true, Phase::Move).await?;
        if let Some(outcome) = moved.action.as_ref().and_then(ErrorAction::outcome) {
            return Ok(outcome);
        }

        ctx.begin_point(self.core.point_params())?;
        let num = self.points.fetch_add(1, Ordering::SeqCst) + 1;
        if num == 1 {
            ctx.put_metainfo(&self.core.collect_metainfo());
        }
        let counted = self.count_point(ctx, &moved.values, preset).await;
        if let Some(results) = ctx
            .with_current(|dataset| dataset.as_point().map(|point| point.results.clone()))
            .flatten()
        {
            if counted.is_ok() {
                collected.push(results);
            }
        }
        ctx.finish_point();
        counted
    }

    async fn count_point(
        &self,
        ctx: &AcquisitionContext,
        moved: &ValueMap,
        preset: &Preset,
    ) -> ScanResult<PointOutcome> {
        let read_action = self.core.read_devices(ctx, &self.core.devices).await?;
        ctx.put_values(moved);

        let action = match self.core.read_environment(ctx).await? {
            Some(env) => Some(match read_action {
                Some(read) => read.merge(env),
                None => env,
            }),
            None => read_action,
        };
        match action.as_ref().and_then(ErrorAction::outcome) {
            Some(outcome) => Ok(outcome),
            None => self.core.acquire(ctx, preset).await,
        }
    }

    /// Close the scan dataset.
    pub fn manual_end(&self, ctx: &AcquisitionContext) -> Option<Arc<ScanDataset>> {
        if !self.active.swap(false, Ordering::SeqCst) {
            warn!("manual_end() without manual_begin()");
            return None;
        }
        info!(points = self.points(), "Manual scan finished");
        ctx.finish_scan()
    }
}
