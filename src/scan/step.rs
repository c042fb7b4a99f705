//! Step scan.
//!
//! Moves devices through a list of positions and counts at each of them.
//!
//! # Lifecycle
//!
//! 1. **Prepare**: first moves and the first position are approached before the
//!    dataset opens. A skip here skips the first point; a stop ends the scan
//!    without a dataset.
//! 2. **Begin**: the scan dataset is opened.
//! 3. **Points**: for each position (and each multistep combination) the devices
//!    are moved, a point is opened, positions, metadata and environment are
//!    recorded, the detectors count and the point is finished.
//! 4. **End**: the scan dataset is always finished, also after an abort or a
//!    fatal error.
//!
//! # Example
//!
//! ```rust,ignore
//! let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[0.5], 11))
//!     .options(ScanOptions::new().preset("t", 1.0))
//!     .build(&ctx)?;
//! let dataset = scan.run(&ctx).await?;
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::dataset::ScanDataset;
use crate::data::manager::AcquisitionContext;
use crate::data::value::Value;
use crate::error::{Phase, ScanError, ScanResult};
use crate::hardware::capabilities::Device;
use crate::scan::engine::{guess_xindex, handle_error, ErrorAction, Move, PointOutcome, ScanCore, ScanOptions};

/// When to approach end positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndMotion {
    /// Move to the end position after counting and wait for it
    #[default]
    Sequential,
    /// Start moving to the end position before counting, count while moving
    Overlapped,
}

/// Per-point customization of a step scan.
#[async_trait]
pub trait ScanHooks: Send + Sync {
    /// Called before point `num` (1-based) is approached.
    async fn prepare_point(&self, num: usize, targets: &[Value]) -> anyhow::Result<()> {
        let _ = (num, targets);
        Ok(())
    }
}

/// Equally spaced positions: `starts[i] + k * steps[i]` for `k` in `0..npoints`.
pub fn line_positions(starts: &[f64], steps: &[f64], npoints: usize) -> Vec<Vec<Value>> {
    (0..npoints)
        .map(|k| {
            starts
                .iter()
                .zip(steps)
                .map(|(start, step)| Value::Number(start + k as f64 * step))
                .collect()
        })
        .collect()
}

/// One point to be measured.
struct PointSpec {
    primary: usize,
    moves: Vec<Move>,
    end_moves: Vec<Move>,
}

/// A step scan.
pub struct Scan {
    core: ScanCore,
    positions: Vec<Vec<Value>>,
    endpositions: Option<Vec<Vec<Value>>>,
    end_motion: EndMotion,
    hooks: Option<Arc<dyn ScanHooks>>,
    xindex: usize,
}

/// Builder for [`Scan`].
pub struct ScanBuilder {
    devices: Vec<Arc<dyn Device>>,
    positions: Vec<Vec<Value>>,
    endpositions: Option<Vec<Vec<Value>>>,
    end_motion: EndMotion,
    hooks: Option<Arc<dyn ScanHooks>>,
    options: ScanOptions,
}

impl ScanBuilder {
    /// Common scan options.
    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Per-point end positions, one row per position.
    pub fn end_positions(mut self, endpositions: Vec<Vec<Value>>) -> Self {
        self.endpositions = Some(endpositions);
        self
    }

    /// How end positions are approached.
    pub fn end_motion(mut self, motion: EndMotion) -> Self {
        self.end_motion = motion;
        self
    }

    /// Per-point hooks.
    pub fn hooks(mut self, hooks: Arc<dyn ScanHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validate and create the scan.
    pub fn build(self, ctx: &AcquisitionContext) -> ScanResult<Scan> {
        if self.positions.is_empty() {
            return Err(ScanError::Configuration("scan has no positions".to_string()));
        }
        let ndev = self.devices.len();
        if let Some(row) = self.positions.iter().find(|row| row.len() != ndev) {
            return Err(ScanError::Configuration(format!(
                "position {:?} does not match {} device(s)",
                row, ndev
            )));
        }
        if let Some(ends) = &self.endpositions {
            if ends.len() != self.positions.len() || ends.iter().any(|row| row.len() != ndev) {
                return Err(ScanError::Configuration(
                    "end positions must match the positions".to_string(),
                ));
            }
        }

        let xindex = match self.positions.get(1) {
            Some(second) => guess_xindex(&self.devices, &self.positions[0], second),
            None => 0,
        };
        let core = ScanCore::new(self.devices, self.options, ctx)?;
        Ok(Scan {
            core,
            positions: self.positions,
            endpositions: self.endpositions,
            end_motion: self.end_motion,
            hooks: self.hooks,
            xindex,
        })
    }
}

impl Scan {
    /// Scan `devices` through `positions` (one row of targets per point).
    pub fn builder(devices: Vec<Arc<dyn Device>>, positions: Vec<Vec<Value>>) -> ScanBuilder {
        ScanBuilder {
            devices,
            positions,
            endpositions: None,
            end_motion: EndMotion::default(),
            hooks: None,
            options: ScanOptions::default(),
        }
    }

    /// Number of points including multistep repetitions.
    pub fn npoints(&self) -> usize {
        self.positions.len() * self.core.multistep_count()
    }

    fn point_specs(&self) -> Vec<PointSpec> {
        let combos: Vec<Vec<Move>> = if self.core.multistep.is_empty() {
            vec![Vec::new()]
        } else {
            self.core.multistep.clone()
        };
        let mut specs = Vec::with_capacity(self.npoints());
        for (i, row) in self.positions.iter().enumerate() {
            for combo in &combos {
                let mut moves: Vec<Move> = self
                    .core
                    .devices
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                moves.extend(combo.iter().cloned());
                let end_moves = match &self.endpositions {
                    Some(ends) => self
                        .core
                        .devices
                        .iter()
                        .cloned()
                        .zip(ends[i].iter().cloned())
                        .collect(),
                    None => Vec::new(),
                };
                specs.push(PointSpec {
                    primary: i,
                    moves,
                    end_moves,
                });
            }
        }
        specs
    }

    /// Execute the scan.
    ///
    /// Returns the finished dataset, or `None` when the scan was stopped before
    /// any dataset was opened.
    pub async fn run(&self, ctx: &AcquisitionContext) -> ScanResult<Option<Arc<ScanDataset>>> {
        let specs = self.point_specs();

        // Prepare: approach the first position before opening the dataset.
        let mut prepare_moves = self.core.firstmoves.clone();
        if let Some(first) = specs.first() {
            prepare_moves.extend(first.moves.iter().cloned());
        }
        let prepared = self.core.move_devices(&prepare_moves, true, Phase::Prepare).await?;
        let skip_first = match prepared.action {
            Some(ErrorAction::Stop(reason)) => {
                warn!(%reason, "Scan stopped before the first point");
                return Ok(None);
            }
            Some(ErrorAction::Skip(reason)) => {
                warn!(%reason, "Skipping first point");
                true
            }
            _ => false,
        };

        ctx.begin_scan(self.core.scan_params(Some(specs.len()), self.xindex))?;
        info!(npoints = specs.len(), "Scan started");
        let outcome = self.run_points(ctx, &specs, skip_first).await;
        let dataset = ctx.finish_scan();
        outcome?;
        Ok(dataset)
    }

    async fn run_points(
        &self,
        ctx: &AcquisitionContext,
        specs: &[PointSpec],
        skip_first: bool,
    ) -> ScanResult<()> {
        let mut first_recorded = true;
        for (i, spec) in specs.iter().enumerate() {
            let num = i + 1;
            if ctx.stop_requested() {
                warn!(point = num, "Scan stopped on request");
                break;
            }
            if i == 0 && skip_first {
                continue;
            }
            match self.run_point(ctx, num, spec, &mut first_recorded).await? {
                PointOutcome::Completed => {}
                PointOutcome::Skipped(reason) => warn!(point = num, %reason, "Point skipped"),
                PointOutcome::Aborted(reason) => {
                    warn!(point = num, %reason, "Scan aborted");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_point(
        &self,
        ctx: &AcquisitionContext,
        num: usize,
        spec: &PointSpec,
        first_recorded: &mut bool,
    ) -> ScanResult<PointOutcome> {
        if let Some(hooks) = &self.hooks {
            if let Err(e) = hooks.prepare_point(num, &self.positions[spec.primary]).await {
                if let Some(outcome) = handle_error(Phase::Other, "prepare_point", e)?.outcome() {
                    return Ok(outcome);
                }
            }
        }

        let moved = self.core.move_devices(&spec.moves, true, Phase::Move).await?;
        if let Some(outcome) = moved.action.as_ref().and_then(ErrorAction::outcome) {
            return Ok(outcome);
        }

        if self.end_motion == EndMotion::Overlapped && !spec.end_moves.is_empty() {
            let started = self.core.move_devices(&spec.end_moves, false, Phase::Move).await?;
            if let Some(outcome) = started.action.as_ref().and_then(ErrorAction::outcome) {
                return Ok(outcome);
            }
        }

        ctx.begin_point(self.core.point_params())?;
        ctx.put_values(&moved.values);
        if *first_recorded {
            ctx.put_metainfo(&self.core.collect_metainfo());
            *first_recorded = false;
        }

        let counted = self.count_point(ctx).await;
        ctx.finish_point();
        let outcome = counted?;

        if matches!(outcome, PointOutcome::Aborted(_)) {
            return Ok(outcome);
        }
        match self.end_motion {
            EndMotion::Sequential if !spec.end_moves.is_empty() => {
                let ended = self.core.move_devices(&spec.end_moves, true, Phase::Move).await?;
                if let Some(ErrorAction::Stop(reason)) = ended.action {
                    return Ok(PointOutcome::Aborted(reason));
                }
            }
            EndMotion::Overlapped => {
                for (device, _) in &spec.end_moves {
                    if let Err(e) = device.wait().await {
                        if let ErrorAction::Stop(reason) = handle_error(Phase::Move, device.name(), e)? {
                            return Ok(PointOutcome::Aborted(reason));
                        }
                    }
                }
            }
            EndMotion::Sequential => {}
        }
        Ok(outcome)
    }

    /// Environment readout and counting for the open point.
    async fn count_point(&self, ctx: &AcquisitionContext) -> ScanResult<PointOutcome> {
        match self.core.read_environment(ctx).await? {
            Some(action) => Ok(action.outcome().unwrap_or(PointOutcome::Completed)),
            None => self.core.acquire(ctx, &self.core.preset).await,
        }
    }
}
