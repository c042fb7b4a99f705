//! Machinery shared by all scan kinds.
//!
//! [`ScanOptions`] carries what every scan accepts (detectors, environment,
//! preset, first moves, multistep axes, ...). [`ScanCore`] is the validated form
//! of those options and implements the per-point building blocks: moving devices,
//! sampling the environment and counting with the detectors. Every device error
//! passes through [`handle_error`].

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::dataset::{DeviceRef, PointParams, ScanParams};
use crate::data::manager::AcquisitionContext;
use crate::data::value::{
    Metainfo, MetaEntry, Preset, Quality, ResultMap, TimedValue, Value, ValueMap,
};
use crate::error::{classify, ErrorClass, Phase, ScanError, ScanResult};
use crate::hardware::capabilities::{Detector, Device};

// =============================================================================
// Outcomes and error policy
// =============================================================================

/// How a single point ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointOutcome {
    /// The point was measured
    Completed,
    /// The point was abandoned; the scan goes on
    Skipped(String),
    /// The scan must not continue
    Aborted(String),
}

/// What the error policy decided for one device error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Carry on with the point
    Continue,
    /// Abandon the point
    Skip(String),
    /// Abandon the scan
    Stop(String),
}

impl ErrorAction {
    /// The more severe of two actions.
    pub fn merge(self, other: ErrorAction) -> ErrorAction {
        match (self, other) {
            (ErrorAction::Stop(r), _) | (_, ErrorAction::Stop(r)) => ErrorAction::Stop(r),
            (ErrorAction::Skip(r), _) | (_, ErrorAction::Skip(r)) => ErrorAction::Skip(r),
            _ => ErrorAction::Continue,
        }
    }

    /// Outcome of a point that ended with this action.
    pub fn outcome(&self) -> Option<PointOutcome> {
        match self {
            ErrorAction::Continue => None,
            ErrorAction::Skip(r) => Some(PointOutcome::Skipped(r.clone())),
            ErrorAction::Stop(r) => Some(PointOutcome::Aborted(r.clone())),
        }
    }
}

/// Decide how to go on after a device error.
///
/// | class    | prepare | move / read / other | count    |
/// |----------|---------|---------------------|----------|
/// | continue | skip    | continue            | continue |
/// | skip     | skip    | skip                | continue |
/// | stop     | stop    | stop                | stop     |
/// | fatal    | error   | error               | error    |
pub fn handle_error(
    phase: Phase,
    device: &str,
    err: anyhow::Error,
) -> Result<ErrorAction, ScanError> {
    let reason = format!("{} failed for '{}': {:#}", phase, device, err);
    match classify(&err) {
        ErrorClass::Continue if phase == Phase::Prepare => {
            warn!(%phase, device, error = %err, "Skipping point");
            Ok(ErrorAction::Skip(reason))
        }
        ErrorClass::Continue => {
            warn!(%phase, device, error = %err, "Continuing after device error");
            Ok(ErrorAction::Continue)
        }
        ErrorClass::Skip if phase == Phase::Count => {
            warn!(%phase, device, error = %err, "Counting error, point recorded as is");
            Ok(ErrorAction::Continue)
        }
        ErrorClass::Skip => {
            warn!(%phase, device, error = %err, "Skipping point");
            Ok(ErrorAction::Skip(reason))
        }
        ErrorClass::Stop => {
            warn!(%phase, device, error = %err, "Stopping scan");
            Ok(ErrorAction::Stop(reason))
        }
        ErrorClass::Fatal => Err(ScanError::device(phase, device, err)),
    }
}

// =============================================================================
// ScanOptions
// =============================================================================

/// A device paired with its target.
pub type Move = (Arc<dyn Device>, Value);

/// Options accepted by every scan kind.
#[derive(Clone, Default)]
pub struct ScanOptions {
    detectors: Option<Vec<Arc<dyn Detector>>>,
    environment: Option<Vec<Arc<dyn Device>>>,
    preset: Preset,
    info: String,
    subscan: bool,
    xindex: Option<usize>,
    firstmoves: Vec<Move>,
    multistep: Vec<(Arc<dyn Device>, Vec<Value>)>,
    continuation: Vec<Uuid>,
    cont_direction: i32,
}

impl ScanOptions {
    /// Empty options: context detectors and environment, no preset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count with these detectors instead of the context's defaults.
    pub fn detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = Some(detectors);
        self
    }

    /// Record these environment devices; an empty list records none.
    pub fn environment(mut self, environment: Vec<Arc<dyn Device>>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Add a preset entry (`t`, `m`, ...).
    pub fn preset(mut self, key: &str, value: f64) -> Self {
        self.preset.insert(key.to_string(), value);
        self
    }

    /// Free text stored with the scan.
    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Record as a subscan.
    pub fn subscan(mut self, subscan: bool) -> Self {
        self.subscan = subscan;
        self
    }

    /// Explicit plot x column.
    pub fn xindex(mut self, xindex: usize) -> Self {
        self.xindex = Some(xindex);
        self
    }

    /// Move a device before the first point.
    pub fn first_move(mut self, device: Arc<dyn Device>, target: Value) -> Self {
        self.firstmoves.push((device, target));
        self
    }

    /// Repeat every point for each of these positions of a secondary axis.
    ///
    /// Several axes combine as a cross product.
    pub fn multistep(mut self, device: Arc<dyn Device>, positions: Vec<Value>) -> Self {
        self.multistep.push((device, positions));
        self
    }

    /// Mark the scan as continuing earlier scans.
    pub fn continuation(mut self, uids: Vec<Uuid>, direction: i32) -> Self {
        self.continuation = uids;
        self.cont_direction = direction;
        self
    }

    pub(crate) fn take_preset(&mut self, key: &str) -> Option<f64> {
        self.preset.shift_remove(key)
    }

    pub(crate) fn prepend_environment(
        &mut self,
        devices: Vec<Arc<dyn Device>>,
        ctx: &AcquisitionContext,
    ) {
        let rest = self
            .environment
            .take()
            .unwrap_or_else(|| ctx.default_environment().to_vec());
        let mut environment = devices;
        for dev in rest {
            if !environment.iter().any(|d| d.name() == dev.name()) {
                environment.push(dev);
            }
        }
        self.environment = Some(environment);
    }
}

// =============================================================================
// ScanCore
// =============================================================================

/// Result of [`ScanCore::move_devices`].
#[derive(Debug, Default)]
pub struct MoveResult {
    /// Settled (canonical) values of the moved devices
    pub values: ValueMap,
    /// Most severe action any device asked for
    pub action: Option<ErrorAction>,
}

/// Validated scan options plus the per-point building blocks.
pub struct ScanCore {
    /// Positioned (or recorded) devices
    pub devices: Vec<Arc<dyn Device>>,
    /// Counting detectors
    pub detectors: Vec<Arc<dyn Detector>>,
    /// Environment devices
    pub environment: Vec<Arc<dyn Device>>,
    /// Counting conditions
    pub preset: Preset,
    /// Free text
    pub info: String,
    /// Record as subscan
    pub subscan: bool,
    /// Explicit plot x column
    pub xindex: Option<usize>,
    /// Moves before the first point
    pub firstmoves: Vec<Move>,
    /// Secondary axis combinations, applied at every primary point
    pub multistep: Vec<Vec<Move>>,
    /// Continued scans
    pub continuation: Vec<Uuid>,
    /// Continuation direction
    pub cont_direction: i32,
    poll_interval: std::time::Duration,
}

fn cross_product(axes: &[(Arc<dyn Device>, Vec<Value>)]) -> Vec<Vec<Move>> {
    let mut combos: Vec<Vec<Move>> = vec![Vec::new()];
    for (device, positions) in axes {
        let mut next = Vec::with_capacity(combos.len() * positions.len());
        for combo in &combos {
            for pos in positions {
                let mut extended = combo.clone();
                extended.push((Arc::clone(device), pos.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

impl ScanCore {
    /// Validate options against the context.
    pub fn new(
        devices: Vec<Arc<dyn Device>>,
        options: ScanOptions,
        ctx: &AcquisitionContext,
    ) -> ScanResult<Self> {
        let detectors = match options.detectors {
            Some(dets) => dets,
            None => {
                let dets = ctx.default_detectors().to_vec();
                if dets.is_empty() {
                    warn!("No detectors configured, scan will only record positions");
                }
                dets
            }
        };
        let environment = options
            .environment
            .unwrap_or_else(|| ctx.default_environment().to_vec());

        if let Some((device, _)) = options.multistep.iter().find(|(_, p)| p.is_empty()) {
            return Err(ScanError::Configuration(format!(
                "multistep axis '{}' has no positions",
                device.name()
            )));
        }

        let known: Vec<String> = detectors.iter().flat_map(|d| d.preset_keys()).collect();
        for key in options.preset.keys() {
            if !known.contains(key) {
                warn!(key = %key, "Preset key not used by any detector");
            }
        }

        Ok(Self {
            devices,
            detectors,
            environment,
            preset: options.preset,
            info: options.info,
            subscan: options.subscan,
            xindex: options.xindex,
            firstmoves: options.firstmoves,
            multistep: cross_product(&options.multistep),
            continuation: options.continuation,
            cont_direction: options.cont_direction,
            poll_interval: ctx.poll_interval(),
        })
    }

    /// Number of secondary combinations per primary point (at least 1).
    pub fn multistep_count(&self) -> usize {
        self.multistep.len().max(1)
    }

    /// Devices recorded in the dataset: primary devices followed by multistep axes.
    fn recorded_devices(&self) -> Vec<DeviceRef> {
        let mut refs: Vec<DeviceRef> = self.devices.iter().map(|d| DeviceRef::of(d.as_ref())).collect();
        if let Some(first) = self.multistep.first() {
            for (device, _) in first {
                if !refs.iter().any(|r| r.name == device.name()) {
                    refs.push(DeviceRef::of(device.as_ref()));
                }
            }
        }
        refs
    }

    /// Parameters for `begin_scan`.
    pub fn scan_params(&self, npoints: Option<usize>, xindex: usize) -> ScanParams {
        ScanParams {
            subscan: self.subscan,
            devices: self.recorded_devices(),
            environment: self.environment.iter().map(|d| DeviceRef::of(d.as_ref())).collect(),
            detectors: self.detectors.iter().map(|d| DeviceRef::of(d.as_ref())).collect(),
            preset: self.preset.clone(),
            info: self.info.clone(),
            npoints,
            xindex: self.xindex.unwrap_or(xindex),
            continuation: self.continuation.clone(),
            cont_direction: self.cont_direction,
        }
    }

    /// Parameters for `begin_point`; everything else is inherited from the scan.
    pub fn point_params(&self) -> PointParams {
        PointParams::default()
    }

    /// Header snapshot of every involved device.
    pub fn collect_metainfo(&self) -> Metainfo {
        let mut metainfo = Metainfo::new();
        metainfo.insert(
            ("Exp".to_string(), "scaninfo".to_string()),
            MetaEntry {
                value: Value::Text(self.info.clone()),
                text: self.info.clone(),
                unit: String::new(),
                category: "general".to_string(),
            },
        );
        let devices = self
            .devices
            .iter()
            .chain(self.environment.iter())
            .map(|d| (d.name().to_string(), d.info()));
        let detectors = self
            .detectors
            .iter()
            .map(|d| (d.name().to_string(), d.info()));
        for (name, entries) in devices.chain(detectors) {
            for (param, entry) in entries {
                metainfo.insert((name.clone(), param), entry);
            }
        }
        metainfo
    }

    /// Move devices and optionally wait for them.
    ///
    /// All devices are started first. Waiting happens concurrently and only for
    /// devices that started; devices whose start failed but may continue are read
    /// back instead. A skip or stop requested by any device is reported once all
    /// waits finished.
    pub async fn move_devices(&self, moves: &[Move], wait: bool, phase: Phase) -> ScanResult<MoveResult> {
        let mut result = MoveResult::default();
        let mut started: Vec<&Arc<dyn Device>> = Vec::new();
        let mut read_back: Vec<&Arc<dyn Device>> = Vec::new();

        for (device, target) in moves {
            debug!(device = %device.name(), %target, "Starting move");
            match device.start(target).await {
                Ok(()) => started.push(device),
                Err(e) => match handle_error(phase, device.name(), e)? {
                    ErrorAction::Continue => read_back.push(device),
                    action => result.merge(action),
                },
            }
        }

        if !wait {
            return Ok(result);
        }

        let settled = join_all(started.iter().map(|d| d.wait())).await;
        for (device, outcome) in started.into_iter().zip(settled) {
            match outcome {
                Ok(value) => {
                    result
                        .values
                        .insert(device.name().to_string(), TimedValue::canonical(value));
                }
                Err(e) => match handle_error(phase, device.name(), e)? {
                    ErrorAction::Continue => read_back.push(device),
                    action => result.merge(action),
                },
            }
        }

        for device in read_back {
            match device.read(None).await {
                Ok(value) => {
                    result
                        .values
                        .insert(device.name().to_string(), TimedValue::canonical(value));
                }
                Err(e) => match handle_error(Phase::Read, device.name(), e)? {
                    ErrorAction::Continue => {}
                    action => result.merge(action),
                },
            }
        }
        Ok(result)
    }

    /// Read devices and deliver their values as canonical point values.
    pub async fn read_devices(&self, ctx: &AcquisitionContext, devices: &[Arc<dyn Device>]) -> ScanResult<Option<ErrorAction>> {
        let mut values = ValueMap::new();
        let mut action = None;
        for device in devices {
            match device.read(None).await {
                Ok(v) => {
                    values.insert(device.name().to_string(), TimedValue::canonical(v));
                }
                Err(e) => match handle_error(Phase::Read, device.name(), e)? {
                    ErrorAction::Continue => {}
                    other => action = Some(merge_opt(action, other)),
                },
            }
        }
        ctx.put_values(&values);
        Ok(action)
    }

    /// Sample every environment device once.
    pub async fn read_environment(&self, ctx: &AcquisitionContext) -> ScanResult<Option<ErrorAction>> {
        let mut values = ValueMap::new();
        let mut action = None;
        for device in &self.environment {
            match device.read(None).await {
                Ok(v) => {
                    values.insert(device.name().to_string(), TimedValue::sampled(v));
                }
                Err(e) => match handle_error(Phase::Read, device.name(), e)? {
                    ErrorAction::Continue => {}
                    other => action = Some(merge_opt(action, other)),
                },
            }
        }
        if !values.is_empty() {
            ctx.put_values(&values);
        }
        Ok(action)
    }

    /// Read all detectors with the given quality.
    ///
    /// Detectors that fail with a recoverable error are left out.
    pub async fn read_results(&self, quality: Quality) -> ScanResult<(ResultMap, Option<ErrorAction>)> {
        let mut results = ResultMap::new();
        let mut action = None;
        for det in &self.detectors {
            match det.read_results(quality).await {
                Ok(r) => {
                    results.insert(det.name().to_string(), r);
                }
                Err(e) => match handle_error(Phase::Count, det.name(), e)? {
                    ErrorAction::Continue => {}
                    other => action = Some(merge_opt(action, other)),
                },
            }
        }
        Ok((results, action))
    }

    async fn stop_detectors(&self) {
        for det in &self.detectors {
            if let Err(e) = det.stop().await {
                warn!(device = %det.name(), error = %e, "Stopping detector failed");
            }
        }
    }

    async fn interrupt(&self, ctx: &AcquisitionContext, reason: String) -> ScanResult<PointOutcome> {
        self.stop_detectors().await;
        let (results, _) = self.read_results(Quality::Interrupted).await?;
        ctx.put_results(Quality::Interrupted, &results);
        Ok(PointOutcome::Aborted(reason))
    }

    /// Configure, start and poll the detectors until done, then store the results.
    pub async fn acquire(&self, ctx: &AcquisitionContext, preset: &Preset) -> ScanResult<PointOutcome> {
        if self.detectors.is_empty() {
            return Ok(PointOutcome::Completed);
        }

        for det in &self.detectors {
            let setup = match det.set_preset(preset).await {
                Ok(()) => det.prepare().await,
                Err(e) => Err(e),
            };
            if let Err(e) = setup {
                if let ErrorAction::Stop(r) = handle_error(Phase::Count, det.name(), e)? {
                    return self.interrupt(ctx, r).await;
                }
            }
        }

        let mut pending: Vec<&Arc<dyn Detector>> = Vec::new();
        for det in &self.detectors {
            match det.start_counting().await {
                Ok(()) => pending.push(det),
                Err(e) => {
                    if let ErrorAction::Stop(r) = handle_error(Phase::Count, det.name(), e)? {
                        return self.interrupt(ctx, r).await;
                    }
                }
            }
        }

        let started = Instant::now();
        while !pending.is_empty() {
            if ctx.stop_requested() {
                info!("Counting interrupted by stop request");
                return self.interrupt(ctx, "stop requested".to_string()).await;
            }

            let mut still_counting = Vec::with_capacity(pending.len());
            for det in pending {
                match det.is_completed().await {
                    Ok(true) => {}
                    Ok(false) => still_counting.push(det),
                    Err(e) => {
                        if let ErrorAction::Stop(r) = handle_error(Phase::Count, det.name(), e)? {
                            return self.interrupt(ctx, r).await;
                        }
                    }
                }
            }
            pending = still_counting;
            if pending.is_empty() {
                break;
            }

            for det in &pending {
                if let Some(quality) = det.during_measure_hook(started.elapsed()).await {
                    match det.read_results(quality).await {
                        Ok(r) => ctx.put_results(quality, &ResultMap::from([(det.name().to_string(), r)])),
                        Err(e) => debug!(device = %det.name(), error = %e, "Intermediate readout failed"),
                    }
                }
            }
            sleep(self.poll_interval).await;
        }

        for det in &self.detectors {
            if let Err(e) = det.finish().await {
                if let ErrorAction::Stop(r) = handle_error(Phase::Count, det.name(), e)? {
                    return self.interrupt(ctx, r).await;
                }
            }
        }

        let (results, action) = self.read_results(Quality::Final).await?;
        ctx.put_results(Quality::Final, &results);
        Ok(match action {
            Some(ErrorAction::Stop(r)) => PointOutcome::Aborted(r),
            _ => PointOutcome::Completed,
        })
    }
}

impl MoveResult {
    fn merge(&mut self, action: ErrorAction) {
        self.action = Some(merge_opt(self.action.take(), action));
    }
}

fn merge_opt(current: Option<ErrorAction>, action: ErrorAction) -> ErrorAction {
    match current {
        Some(existing) => existing.merge(action),
        None => action,
    }
}

/// Plot x column: the first column whose value differs between two positions.
pub fn guess_xindex(devices: &[Arc<dyn Device>], first: &[Value], second: &[Value]) -> usize {
    let mut a = Vec::new();
    let mut b = Vec::new();
    for ((device, x), y) in devices.iter().zip(first).zip(second) {
        let width = device.value_info().len();
        x.flatten_into(width, &mut a);
        y.flatten_into(width, &mut b);
    }
    a.iter().zip(&b).position(|(x, y)| x != y).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, DeviceErrorKind};
    use crate::hardware::mock::{MockMotor, MockTas};

    fn dev_err(kind: DeviceErrorKind) -> anyhow::Error {
        anyhow::Error::new(DeviceError::new("m", kind, "boom"))
    }

    #[test]
    fn error_policy_table() {
        use DeviceErrorKind::*;
        assert_eq!(handle_error(Phase::Move, "m", dev_err(Position)).unwrap(), ErrorAction::Continue);
        assert!(matches!(handle_error(Phase::Prepare, "m", dev_err(Timeout)).unwrap(), ErrorAction::Skip(_)));
        assert!(matches!(handle_error(Phase::Move, "m", dev_err(Limit)).unwrap(), ErrorAction::Skip(_)));
        assert_eq!(handle_error(Phase::Count, "m", dev_err(Communication)).unwrap(), ErrorAction::Continue);
        assert!(matches!(handle_error(Phase::Read, "m", dev_err(Stopped)).unwrap(), ErrorAction::Stop(_)));
        assert!(matches!(
            handle_error(Phase::Move, "m", dev_err(Hardware)),
            Err(ScanError::Device { phase: Phase::Move, .. })
        ));
    }

    #[test]
    fn merge_prefers_the_more_severe_action() {
        let skip = ErrorAction::Skip("a".into());
        let stop = ErrorAction::Stop("b".into());
        assert_eq!(ErrorAction::Continue.merge(skip.clone()), skip);
        assert_eq!(skip.clone().merge(stop.clone()), stop);
        assert_eq!(stop.clone().merge(ErrorAction::Continue), stop);
    }

    #[test]
    fn multistep_axes_combine_as_cross_product() {
        let a: Arc<dyn Device> = Arc::new(MockMotor::new("a"));
        let b: Arc<dyn Device> = Arc::new(MockMotor::new("b"));
        let combos = cross_product(&[
            (a, vec![Value::Number(1.0), Value::Number(2.0)]),
            (b, vec![Value::Number(10.0), Value::Number(20.0), Value::Number(30.0)]),
        ]);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[1][1].1, Value::Number(20.0));
        assert_eq!(combos[3][0].1, Value::Number(2.0));
    }

    #[test]
    fn xindex_is_first_varying_column() {
        let x: Arc<dyn Device> = Arc::new(MockMotor::new("x"));
        let tas: Arc<dyn Device> = Arc::new(MockTas::new("tas"));
        let devices = vec![x, tas];
        let p0 = vec![Value::Number(1.0), Value::from(vec![1.0, 0.0, 0.0, 0.0])];
        let p1 = vec![Value::Number(1.0), Value::from(vec![1.0, 0.0, 0.0, 0.5])];
        assert_eq!(guess_xindex(&devices, &p0, &p1), 4);
        assert_eq!(guess_xindex(&devices, &p0, &p0), 0);
    }

    #[tokio::test]
    async fn move_devices_reads_back_continued_failures() {
        let ctx = AcquisitionContext::builder().build();
        let good: Arc<dyn Device> = Arc::new(MockMotor::new("good"));
        let bad: Arc<dyn Device> =
            Arc::new(MockMotor::with_position("bad", 0.5).fail_at(2.0, DeviceErrorKind::Move));
        let core = ScanCore::new(vec![], ScanOptions::new().detectors(vec![]), &ctx).unwrap();

        let result = core
            .move_devices(
                &[(good, Value::Number(1.0)), (bad, Value::Number(2.0))],
                true,
                Phase::Move,
            )
            .await
            .unwrap();

        assert!(result.action.is_none());
        assert_eq!(result.values["good"].value, Value::Number(1.0));
        assert_eq!(result.values["bad"].value, Value::Number(0.5));
        assert!(result.values["bad"].time.is_none());
    }

    #[tokio::test]
    async fn move_devices_reports_skip_after_waiting() {
        let ctx = AcquisitionContext::builder().build();
        let good = Arc::new(MockMotor::new("good"));
        let good_dev: Arc<dyn Device> = good.clone();
        let bad: Arc<dyn Device> =
            Arc::new(MockMotor::new("bad").fail_at(3.0, DeviceErrorKind::Limit));
        let core = ScanCore::new(vec![], ScanOptions::new().detectors(vec![]), &ctx).unwrap();

        let result = core
            .move_devices(
                &[(bad, Value::Number(3.0)), (good_dev, Value::Number(1.0))],
                true,
                Phase::Move,
            )
            .await
            .unwrap();

        assert!(matches!(result.action, Some(ErrorAction::Skip(_))));
        assert_eq!(good.read(None).await.unwrap(), Value::Number(1.0));
    }

    #[tokio::test]
    async fn failed_read_back_can_skip_the_point() {
        let ctx = AcquisitionContext::builder().build();
        let bad: Arc<dyn Device> = Arc::new(
            MockMotor::new("bad")
                .fail_at(2.0, DeviceErrorKind::Move)
                .fail_next_read(DeviceErrorKind::Communication),
        );
        let core = ScanCore::new(vec![], ScanOptions::new().detectors(vec![]), &ctx).unwrap();

        let result = core
            .move_devices(&[(bad, Value::Number(2.0))], true, Phase::Move)
            .await
            .unwrap();

        assert!(matches!(result.action, Some(ErrorAction::Skip(_))));
        assert!(result.values.is_empty());
    }
}
