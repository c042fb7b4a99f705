//! Acquisition context: the data manager.
//!
//! The context owns the stack of open datasets (block → scan → point), assigns
//! persistent counters, routes lifecycle events to the handlers of every active
//! [`DataSink`] and keeps a bounded history of finished scans.
//!
//! One context is created per session and handed to every scan by reference:
//!
//! ```rust,ignore
//! let ctx = AcquisitionContext::builder()
//!     .data_root("/data")
//!     .detector(Arc::new(MockDetector::new("det")))
//!     .sink(Arc::new(ConsoleSink::new()))
//!     .build();
//!
//! let mut scan = Scan::builder(vec![motor], positions).build(&ctx)?;
//! let dataset = scan.run(&ctx).await?;
//! ```
//!
//! All state sits behind a single `parking_lot::Mutex`. Sink handlers are
//! synchronous and run under that lock; no lock is ever held across an `.await`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::data::counters::{CounterStore, FileCounterStore};
use crate::data::dataset::{
    BaseDataset, BlockDataset, BlockParams, Dataset, PointDataset, PointParams, ScanDataset,
    ScanParams, SetType,
};
use crate::data::filenames::{DataFile, FileNamer};
use crate::data::sink::{DataSink, DataSinkHandler, SessionMode, SinkEnv};
use crate::data::value::{Metainfo, Quality, ResultMap, TimedValue, Value, ValueMap};
use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{Detector, Device};

// =============================================================================
// Stack frames
// =============================================================================

struct AttachedHandler {
    sink: String,
    handler: Box<dyn DataSinkHandler>,
}

struct Frame {
    dataset: Dataset,
    handlers: Vec<AttachedHandler>,
    temporary: bool,
}

impl Frame {
    fn dispatch<F>(&mut self, call: &'static str, mut f: F)
    where
        F: FnMut(&mut dyn DataSinkHandler, &Dataset) -> anyhow::Result<()>,
    {
        let Frame {
            dataset, handlers, ..
        } = self;
        for attached in handlers.iter_mut() {
            if let Err(e) = f(attached.handler.as_mut(), dataset) {
                warn!(
                    sink = %attached.sink,
                    call,
                    settype = %dataset.settype(),
                    error = %e,
                    "Data sink handler failed"
                );
            }
        }
    }
}

#[derive(Default)]
struct State {
    stack: Vec<Frame>,
    history: VecDeque<Arc<ScanDataset>>,
}

/// What `finish_top` produced.
enum Finished {
    Point,
    Scan(Arc<ScanDataset>),
    Block(BlockDataset),
}

// =============================================================================
// Directory layout and experiment setup
// =============================================================================

/// Data directories counters are kept in.
#[derive(Debug, Clone)]
pub struct DataLayout {
    /// Global data root
    pub root: PathBuf,
    /// Proposal directory, relative to the root
    pub proposal_dir: String,
    /// Sample directory, relative to the proposal directory
    pub sample_dir: String,
}

impl DataLayout {
    /// Proposal data directory; data files are named relative to it.
    pub fn proposal_path(&self) -> PathBuf {
        self.root.join(&self.proposal_dir)
    }

    /// Sample data directory.
    pub fn sample_path(&self) -> PathBuf {
        self.proposal_path().join(&self.sample_dir)
    }

    /// Global, proposal and sample directories, in that order.
    pub fn counter_dirs(&self) -> [PathBuf; 3] {
        [self.root.clone(), self.proposal_path(), self.sample_path()]
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            proposal_dir: String::new(),
            sample_dir: String::new(),
        }
    }
}

/// Session-wide defaults used by scans and file naming.
#[derive(Default)]
struct ExperimentSetup {
    detectors: Vec<Arc<dyn Detector>>,
    environment: Vec<Arc<dyn Device>>,
    template_vars: HashMap<String, String>,
    aliases: HashMap<String, String>,
    name_templates: HashMap<String, Vec<String>>,
}

// =============================================================================
// AcquisitionContext
// =============================================================================

/// Session-wide data manager.
pub struct AcquisitionContext {
    state: Mutex<State>,
    sinks: RwLock<Vec<Arc<dyn DataSink>>>,
    counters: Box<dyn CounterStore>,
    layout: DataLayout,
    mode: SessionMode,
    setup: ExperimentSetup,
    stop: AtomicBool,
    history_size: usize,
    poll_interval: Duration,
}

impl AcquisitionContext {
    /// Start configuring a context.
    pub fn builder() -> AcquisitionContextBuilder {
        AcquisitionContextBuilder::default()
    }

    /// Context configured from the application config.
    ///
    /// Devices, detectors and sinks are added on the returned builder.
    pub fn from_config(config: &AppConfig) -> AcquisitionContextBuilder {
        let mode = if config.scan.simulation {
            SessionMode::Simulation
        } else {
            SessionMode::Master
        };
        AcquisitionContextBuilder::default()
            .layout(DataLayout {
                root: config.data.root.clone(),
                proposal_dir: config.data.proposal_dir.clone(),
                sample_dir: config.data.sample_dir.clone(),
            })
            .counter_store(Box::new(FileCounterStore::new(&config.data.counter_file)))
            .mode(mode)
            .history_size(config.data.history_size)
            .poll_interval(Duration::from_millis(config.scan.poll_interval_ms))
            .name_templates(config.data.name_templates.clone())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Session mode.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Directory layout.
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Detectors used when a scan names none.
    pub fn default_detectors(&self) -> &[Arc<dyn Detector>] {
        &self.setup.detectors
    }

    /// Environment devices used when a scan names none.
    pub fn default_environment(&self) -> &[Arc<dyn Device>] {
        &self.setup.environment
    }

    /// Interval between detector completion polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Register another sink.
    pub fn add_sink(&self, sink: Arc<dyn DataSink>) -> ScanResult<()> {
        let mut sinks = self.sinks.write();
        if sinks.iter().any(|s| s.name() == sink.name()) {
            return Err(ScanError::Sink(format!(
                "a sink named '{}' is already registered",
                sink.name()
            )));
        }
        sinks.push(sink);
        Ok(())
    }

    /// Number of open datasets.
    pub fn stack_depth(&self) -> usize {
        self.state.lock().stack.len()
    }

    /// Kinds of the open datasets, outermost first.
    pub fn stack_settypes(&self) -> Vec<SetType> {
        self.state
            .lock()
            .stack
            .iter()
            .map(|f| f.dataset.settype())
            .collect()
    }

    /// Run `f` on the innermost open dataset.
    pub fn with_current<R>(&self, f: impl FnOnce(&Dataset) -> R) -> Option<R> {
        self.state.lock().stack.last().map(|frame| f(&frame.dataset))
    }

    /// Up to `n` most recently finished scans, oldest first.
    pub fn last_scans(&self, n: usize) -> Vec<Arc<ScanDataset>> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Cooperative stop
    // -------------------------------------------------------------------------

    /// Ask running scans to stop at the next opportunity.
    pub fn request_stop(&self) {
        info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Withdraw a stop request.
    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Dataset lifecycle
    // -------------------------------------------------------------------------

    /// Open a block.
    pub fn begin_block(&self, params: BlockParams) -> ScanResult<Uuid> {
        self.begin(Dataset::Block(BlockDataset::from_params(params)), false)
    }

    /// Open a scan or subscan.
    pub fn begin_scan(&self, params: ScanParams) -> ScanResult<Uuid> {
        self.begin(Dataset::Scan(ScanDataset::from_params(params)), false)
    }

    /// Open a point.
    pub fn begin_point(&self, params: PointParams) -> ScanResult<Uuid> {
        self.begin(Dataset::Point(PointDataset::from_params(params)), false)
    }

    /// Open a point that gets neither counters nor sink handlers and is not
    /// recorded in the enclosing scan.
    pub fn begin_temporary_point(&self, params: PointParams) -> ScanResult<Uuid> {
        self.begin(Dataset::Point(PointDataset::from_params(params)), true)
    }

    fn begin(&self, mut dataset: Dataset, temporary: bool) -> ScanResult<Uuid> {
        let settype = dataset.settype();
        let mut state = self.state.lock();

        while let Some(top) = state.stack.last() {
            if top.dataset.settype().level() < settype.level() {
                break;
            }
            warn!(
                stale = %top.dataset.settype(),
                new = %settype,
                "Finishing stale dataset"
            );
            self.finish_top(&mut state);
        }

        if let Some(parent) = state.stack.last() {
            dataset.base_mut().number = parent.dataset.subset_count() + 1;
            if let (Dataset::Point(point), Dataset::Scan(scan)) = (&mut dataset, &parent.dataset) {
                inherit_from_scan(&mut point.base, &scan.base);
            }
        } else {
            dataset.base_mut().number = 1;
        }

        if !temporary && self.mode == SessionMode::Master {
            self.assign_counter(dataset.base_mut())?;
        }

        let uid = dataset.uid();
        debug!(settype = %settype, %uid, number = dataset.base().number, "Begin dataset");
        state.stack.push(Frame {
            dataset,
            handlers: Vec::new(),
            temporary,
        });

        if !temporary {
            self.attach_handlers(&mut state);
        }
        Ok(uid)
    }

    fn attach_handlers(&self, state: &mut State) {
        let counters = counters_of(&state.stack);
        let Some(frame) = state.stack.last_mut() else {
            return;
        };
        let settype = frame.dataset.settype();
        for sink in self.sinks.read().iter() {
            if !sink.is_active(&frame.dataset, self.mode) {
                continue;
            }
            let templates = if sink.settings().filenametemplate.is_empty() {
                self.setup
                    .name_templates
                    .get(settype.as_str())
                    .cloned()
                    .unwrap_or_default()
            } else {
                sink.settings().filenametemplate.clone()
            };
            let env = SinkEnv {
                counters: counters.clone(),
                namer: self.namer(),
                templates,
            };
            for handler in sink.create_handlers(&frame.dataset) {
                let mut attached = AttachedHandler {
                    sink: sink.name().to_string(),
                    handler,
                };
                if let Err(e) = attached.handler.prepare(&frame.dataset, &env) {
                    warn!(sink = %attached.sink, call = "prepare", error = %e, "Data sink handler failed");
                }
                frame.handlers.push(attached);
            }
        }
        frame.dispatch("begin", |h, ds| h.begin(ds));
    }

    /// Pop and finalize the innermost dataset.
    fn finish_top(&self, state: &mut State) -> Option<Finished> {
        let mut frame = state.stack.pop()?;
        frame.dataset.base_mut().mark_finished();
        frame.dispatch("end", |h, ds| h.end(ds));

        if !frame.temporary {
            if let Some(parent) = state.stack.last_mut() {
                let child = &frame.dataset;
                parent.dispatch("add_subset", |h, ds| h.add_subset(ds, child));
            }
        }
        frame.dataset.trim_result();
        debug!(settype = %frame.dataset.settype(), uid = %frame.dataset.uid(), "Finished dataset");

        match frame.dataset {
            Dataset::Point(point) => {
                if !frame.temporary {
                    if let Some(Frame {
                        dataset: Dataset::Scan(scan),
                        ..
                    }) = state.stack.last_mut()
                    {
                        scan.add_point(point);
                    }
                }
                Some(Finished::Point)
            }
            Dataset::Scan(scan) => {
                let scan = Arc::new(scan);
                if let Some(Frame {
                    dataset: Dataset::Block(block),
                    ..
                }) = state.stack.last_mut()
                {
                    block.subsets.push(Arc::clone(&scan));
                }
                state.history.push_back(Arc::clone(&scan));
                while state.history.len() > self.history_size {
                    state.history.pop_front();
                }
                Some(Finished::Scan(scan))
            }
            Dataset::Block(block) => Some(Finished::Block(block)),
        }
    }

    fn finish_expected(&self, accept: &[SetType], call: &str) -> Option<Finished> {
        let mut state = self.state.lock();
        match state.stack.last().map(|f| f.dataset.settype()) {
            Some(top) if accept.contains(&top) => self.finish_top(&mut state),
            top => {
                warn!(call, top = ?top, "No matching dataset open, ignoring");
                None
            }
        }
    }

    /// Finish the open point.
    pub fn finish_point(&self) {
        self.finish_expected(&[SetType::Point], "finish_point");
    }

    /// Finish the open scan or subscan.
    pub fn finish_scan(&self) -> Option<Arc<ScanDataset>> {
        match self.finish_expected(&[SetType::Scan, SetType::Subscan], "finish_scan")? {
            Finished::Scan(scan) => Some(scan),
            _ => None,
        }
    }

    /// Finish the open block.
    pub fn finish_block(&self) -> Option<BlockDataset> {
        match self.finish_expected(&[SetType::Block], "finish_block")? {
            Finished::Block(block) => Some(block),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Data input
    // -------------------------------------------------------------------------

    /// Record the experiment header on the open point.
    pub fn put_metainfo(&self, metainfo: &Metainfo) {
        let mut state = self.state.lock();
        let Some(frame) = open_point(&mut state, "put_metainfo") else {
            return;
        };
        if let Dataset::Point(point) = &mut frame.dataset {
            for (key, entry) in metainfo {
                point.metainfo.insert(key.clone(), entry.clone());
            }
        }
        frame.dispatch("put_metainfo", |h, ds| h.put_metainfo(ds, metainfo));
    }

    /// Record device values on the open point.
    pub fn put_values(&self, values: &ValueMap) {
        let mut state = self.state.lock();
        if let Some(frame) = open_point(&mut state, "put_values") {
            store_values(frame, values);
        }
    }

    /// Record detector readings on the open point.
    ///
    /// Live readings are passed on to the sinks but not stored.
    pub fn put_results(&self, quality: Quality, results: &ResultMap) {
        let mut state = self.state.lock();
        let Some(frame) = open_point(&mut state, "put_results") else {
            return;
        };
        if quality != Quality::Live {
            if let Dataset::Point(point) = &mut frame.dataset {
                for (name, result) in results {
                    point.results.insert(name.clone(), result.clone());
                }
            }
        }
        frame.dispatch("put_results", |h, ds| h.put_results(ds, quality, results));
    }

    /// Feed from the device cache.
    ///
    /// Only `<device>/value` keys are used; the device name is resolved through
    /// the alias table and against the open point's devices, both
    /// case-insensitively. Updates arriving while no point is open are dropped.
    pub fn cache_callback(&self, key: &str, value: Value, time: DateTime<Utc>) {
        let Some((devname, param)) = key.rsplit_once('/') else {
            return;
        };
        if !param.eq_ignore_ascii_case("value") {
            return;
        }
        let devname = devname.to_lowercase();
        let devname = self
            .setup
            .aliases
            .get(&devname)
            .cloned()
            .unwrap_or(devname);

        let mut state = self.state.lock();
        let Some(frame) = state.stack.last_mut() else {
            return;
        };
        let Dataset::Point(point) = &frame.dataset else {
            return;
        };
        if point.base.is_finished() {
            return;
        }
        let name = point
            .base
            .devices
            .iter()
            .chain(&point.base.environment)
            .find(|d| d.name.eq_ignore_ascii_case(&devname))
            .map(|d| d.name.clone())
            .unwrap_or(devname);
        let values = ValueMap::from([(
            name,
            TimedValue {
                time: Some(time),
                value,
            },
        )]);
        store_values(frame, &values);
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Assign global, proposal and sample counters to a dataset.
    ///
    /// Idempotent: a dataset with counters keeps them. Each distinct data
    /// directory has its counter incremented exactly once.
    pub fn assign_counter(&self, dataset: &mut BaseDataset) -> ScanResult<()> {
        if self.mode == SessionMode::Simulation {
            return Err(ScanError::Programming(
                "counters cannot be assigned in simulation mode".to_string(),
            ));
        }
        if dataset.has_counters() {
            return Ok(());
        }
        let key = dataset.settype.counter_key();
        let mut seen: Vec<(PathBuf, u64)> = Vec::new();
        let mut numbers = [0u64; 3];
        for (slot, dir) in self.layout.counter_dirs().iter().enumerate() {
            let resolved = resolve_dir(dir)?;
            let value = match seen.iter().find(|(d, _)| *d == resolved) {
                Some((_, v)) => *v,
                None => {
                    let next = self.counters.read(&resolved, key)? + 1;
                    self.counters.write(&resolved, key, next)?;
                    seen.push((resolved, next));
                    next
                }
            };
            numbers[slot] = value;
        }
        dataset.counter = numbers[0];
        dataset.propcounter = numbers[1];
        dataset.samplecounter = numbers[2];
        debug!(key, counter = dataset.counter, "Assigned counters");
        Ok(())
    }

    /// Counters and numbers of every open dataset.
    ///
    /// Keys are `<settype>counter`, `<settype>propcounter`,
    /// `<settype>samplecounter` and `<settype>number`.
    pub fn get_counters(&self) -> HashMap<String, u64> {
        counters_of(&self.state.lock().stack)
    }

    // -------------------------------------------------------------------------
    // File naming
    // -------------------------------------------------------------------------

    /// File namer rooted at the proposal directory.
    pub fn namer(&self) -> FileNamer {
        FileNamer::new(self.layout.proposal_path(), self.setup.template_vars.clone())
    }

    /// Expand templates against the current counters.
    pub fn expand_name_templates(&self, templates: &[String]) -> ScanResult<Vec<String>> {
        self.namer()
            .expand_name_templates(templates, &self.get_counters())
    }

    /// Canonical short name and full paths for the current counters.
    pub fn get_filenames(
        &self,
        templates: &[String],
        subdirs: &[&str],
    ) -> ScanResult<(String, Vec<PathBuf>)> {
        self.namer()
            .get_filenames(templates, &self.get_counters(), subdirs)
    }

    /// Create a data file named for the current counters.
    pub fn create_data_file(&self, templates: &[String], subdirs: &[&str]) -> ScanResult<DataFile> {
        self.namer()
            .create_data_file(templates, &self.get_counters(), subdirs)
    }

    /// Link further names to an existing data file.
    pub fn link_files(&self, source: &Path, links: &[PathBuf]) {
        crate::data::filenames::link_files(source, links);
    }
}

fn open_point<'a>(state: &'a mut State, call: &str) -> Option<&'a mut Frame> {
    match state.stack.last_mut() {
        Some(frame) if matches!(&frame.dataset, Dataset::Point(p) if !p.base.is_finished()) => {
            Some(frame)
        }
        _ => {
            warn!(call, "No point dataset open, ignoring");
            None
        }
    }
}

fn store_values(frame: &mut Frame, values: &ValueMap) {
    if let Dataset::Point(point) = &mut frame.dataset {
        point.base.update_values(values);
    }
    frame.dispatch("put_values", |h, ds| h.put_values(ds, values));
}

fn inherit_from_scan(point: &mut BaseDataset, scan: &BaseDataset) {
    if point.devices.is_empty() {
        point.devices = scan.devices.clone();
    }
    if point.environment.is_empty() {
        point.environment = scan.environment.clone();
    }
    if point.detectors.is_empty() {
        point.detectors = scan.detectors.clone();
    }
    if point.preset.is_empty() {
        point.preset = scan.preset.clone();
    }
}

fn counters_of(stack: &[Frame]) -> HashMap<String, u64> {
    let mut counters = HashMap::new();
    for frame in stack {
        let base = frame.dataset.base();
        let prefix = base.settype.as_str();
        counters.insert(format!("{}counter", prefix), base.counter);
        counters.insert(format!("{}propcounter", prefix), base.propcounter);
        counters.insert(format!("{}samplecounter", prefix), base.samplecounter);
        counters.insert(format!("{}number", prefix), base.number as u64);
    }
    counters
}

fn resolve_dir(dir: &Path) -> ScanResult<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(fs::canonicalize(dir)?)
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AcquisitionContext`].
pub struct AcquisitionContextBuilder {
    layout: DataLayout,
    mode: SessionMode,
    counters: Option<Box<dyn CounterStore>>,
    sinks: Vec<Arc<dyn DataSink>>,
    setup: ExperimentSetup,
    history_size: usize,
    poll_interval: Duration,
}

impl Default for AcquisitionContextBuilder {
    fn default() -> Self {
        Self {
            layout: DataLayout::default(),
            mode: SessionMode::Master,
            counters: None,
            sinks: Vec::new(),
            setup: ExperimentSetup::default(),
            history_size: 10,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl AcquisitionContextBuilder {
    /// Set the directory layout.
    pub fn layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set only the data root.
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.layout.root = root.into();
        self
    }

    /// Set the session mode.
    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the counter store.
    pub fn counter_store(mut self, store: Box<dyn CounterStore>) -> Self {
        self.counters = Some(store);
        self
    }

    /// Register a sink.
    pub fn sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add a default detector.
    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.setup.detectors.push(detector);
        self
    }

    /// Add a default environment device.
    pub fn environment(mut self, device: Arc<dyn Device>) -> Self {
        self.setup.environment.push(device);
        self
    }

    /// Set a file name template variable.
    pub fn template_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup.template_vars.insert(key.into(), value.into());
        self
    }

    /// Map a cache alias to a device name.
    pub fn alias(mut self, alias: &str, device: impl Into<String>) -> Self {
        self.setup.aliases.insert(alias.to_lowercase(), device.into());
        self
    }

    /// File name templates per set type (`"scan"`, `"point"`, ...).
    pub fn name_templates(mut self, templates: HashMap<String, Vec<String>>) -> Self {
        self.setup.name_templates = templates;
        self
    }

    /// Number of finished scans kept in the history.
    pub fn history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    /// Interval between detector completion polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Finish configuration.
    pub fn build(self) -> AcquisitionContext {
        let counters = self
            .counters
            .unwrap_or_else(|| Box::new(FileCounterStore::default()));
        AcquisitionContext {
            state: Mutex::new(State::default()),
            sinks: RwLock::new(self.sinks),
            counters,
            layout: self.layout,
            mode: self.mode,
            setup: self.setup,
            stop: AtomicBool::new(false),
            history_size: self.history_size,
            poll_interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::DeviceRef;
    use crate::data::sink::SinkSettings;
    use crate::data::value::{DetectorResult, ValueInfo};
    use tempfile::tempdir;

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        settings: SinkSettings,
    }

    struct RecordingHandler {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DataSinkHandler for RecordingHandler {
        fn prepare(&mut self, ds: &Dataset, _env: &SinkEnv) -> anyhow::Result<()> {
            self.log.lock().push(format!("prepare {}", ds.settype()));
            Ok(())
        }

        fn begin(&mut self, ds: &Dataset) -> anyhow::Result<()> {
            self.log.lock().push(format!("begin {}", ds.settype()));
            Ok(())
        }

        fn add_subset(&mut self, ds: &Dataset, sub: &Dataset) -> anyhow::Result<()> {
            self.log
                .lock()
                .push(format!("add_subset {} {}", ds.settype(), sub.settype()));
            Ok(())
        }

        fn end(&mut self, ds: &Dataset) -> anyhow::Result<()> {
            self.log.lock().push(format!("end {}", ds.settype()));
            anyhow::bail!("handler errors must not escape")
        }
    }

    impl DataSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn settings(&self) -> &SinkSettings {
            &self.settings
        }

        fn create_handlers(&self, _dataset: &Dataset) -> Vec<Box<dyn DataSinkHandler>> {
            vec![Box::new(RecordingHandler {
                log: Arc::clone(&self.log),
            })]
        }
    }

    fn context(root: &Path) -> (AcquisitionContext, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ctx = AcquisitionContext::builder()
            .data_root(root)
            .sink(Arc::new(Recorder {
                log: Arc::clone(&log),
                settings: SinkSettings::default(),
            }))
            .build();
        (ctx, log)
    }

    #[test]
    fn points_are_numbered_within_scan() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());

        ctx.begin_scan(ScanParams::default()).unwrap();
        for _ in 0..3 {
            ctx.begin_point(PointParams::default()).unwrap();
            ctx.finish_point();
        }
        let scan = ctx.finish_scan().unwrap();

        let numbers: Vec<usize> = scan.subsets.iter().map(|p| p.base.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(scan.base.counter > 0);
        assert_eq!(ctx.stack_depth(), 0);
        assert_eq!(ctx.last_scans(5).len(), 1);
    }

    #[test]
    fn protocol_order_for_one_point() {
        let dir = tempdir().unwrap();
        let (ctx, log) = context(dir.path());

        ctx.begin_scan(ScanParams::default()).unwrap();
        ctx.begin_point(PointParams::default()).unwrap();
        ctx.finish_point();
        ctx.finish_scan();

        assert_eq!(
            *log.lock(),
            vec![
                "prepare scan",
                "begin scan",
                "prepare point",
                "begin point",
                "end point",
                "add_subset scan point",
                "end scan",
            ]
        );
    }

    #[test]
    fn stale_datasets_are_finished() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());

        ctx.begin_block(BlockParams::default()).unwrap();
        ctx.begin_scan(ScanParams::default()).unwrap();
        ctx.begin_point(PointParams::default()).unwrap();
        assert_eq!(
            ctx.stack_settypes(),
            vec![SetType::Block, SetType::Scan, SetType::Point]
        );

        ctx.begin_scan(ScanParams::default()).unwrap();
        assert_eq!(ctx.stack_settypes(), vec![SetType::Block, SetType::Scan]);

        ctx.finish_scan();
        let block = ctx.finish_block().unwrap();
        assert_eq!(block.subsets.len(), 2);
        assert_eq!(block.subsets[0].subsets.len(), 1);
        assert_eq!(block.subsets[1].base.number, 2);
    }

    #[test]
    fn finishing_the_wrong_kind_is_ignored() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());

        ctx.begin_scan(ScanParams::default()).unwrap();
        ctx.finish_point();
        assert!(ctx.finish_block().is_none());
        assert_eq!(ctx.stack_depth(), 1);
        assert!(ctx.finish_scan().is_some());
        assert!(ctx.finish_scan().is_none());
    }

    #[test]
    fn counter_assignment_is_idempotent() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let store = FileCounterStore::default();

        let mut ds = BaseDataset::new(SetType::Scan);
        ctx.assign_counter(&mut ds).unwrap();
        ctx.assign_counter(&mut ds).unwrap();

        assert_eq!(ds.counter, 1);
        assert_eq!(ds.propcounter, 1);
        assert_eq!(ds.samplecounter, 1);
        assert_eq!(store.read(dir.path(), "scan").unwrap(), 1);
    }

    #[test]
    fn separate_directories_count_separately() {
        let dir = tempdir().unwrap();
        let store = FileCounterStore::default();
        store.write(dir.path(), "scan", 100).unwrap();

        let ctx = AcquisitionContext::builder()
            .layout(DataLayout {
                root: dir.path().to_path_buf(),
                proposal_dir: "p1".to_string(),
                sample_dir: "s1".to_string(),
            })
            .build();
        let mut ds = BaseDataset::new(SetType::Subscan);
        ctx.assign_counter(&mut ds).unwrap();

        assert_eq!((ds.counter, ds.propcounter, ds.samplecounter), (101, 1, 1));
    }

    #[test]
    fn simulation_mode_has_no_counters() {
        let dir = tempdir().unwrap();
        let ctx = AcquisitionContext::builder()
            .data_root(dir.path())
            .mode(SessionMode::Simulation)
            .build();

        let mut ds = BaseDataset::new(SetType::Scan);
        assert!(matches!(
            ctx.assign_counter(&mut ds),
            Err(ScanError::Programming(_))
        ));

        ctx.begin_scan(ScanParams::default()).unwrap();
        assert_eq!(ctx.get_counters()["scancounter"], 0);
    }

    #[test]
    fn get_counters_reports_every_level() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        ctx.begin_scan(ScanParams::default()).unwrap();
        ctx.begin_point(PointParams::default()).unwrap();

        let counters = ctx.get_counters();
        assert_eq!(counters["scancounter"], 1);
        assert_eq!(counters["pointcounter"], 1);
        assert_eq!(counters["pointnumber"], 1);
        assert!(counters.contains_key("scansamplecounter"));
    }

    #[test]
    fn live_results_are_not_stored() {
        let dir = tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        ctx.begin_point(PointParams::default()).unwrap();

        let results = ResultMap::from([(
            "det".to_string(),
            DetectorResult {
                scalars: vec![Value::Number(1.0)],
                arrays: vec![],
            },
        )]);
        ctx.put_results(Quality::Live, &results);
        assert_eq!(ctx.with_current(|ds| ds.as_point().map(|p| p.results.len())), Some(Some(0)));

        ctx.put_results(Quality::Interrupted, &results);
        assert_eq!(ctx.with_current(|ds| ds.as_point().map(|p| p.results.len())), Some(Some(1)));
    }

    #[test]
    fn cache_callback_resolves_aliases() {
        let dir = tempdir().unwrap();
        let ctx = AcquisitionContext::builder()
            .data_root(dir.path())
            .alias("Temp", "T_sample")
            .build();

        ctx.cache_callback("temp/value", Value::Number(3.0), Utc::now());

        ctx.begin_point(PointParams {
            environment: vec![DeviceRef {
                name: "T_sample".to_string(),
                value_info: vec![ValueInfo::new("T_sample")],
            }],
            ..Default::default()
        })
        .unwrap();
        ctx.cache_callback("temp/value", Value::Number(4.0), Utc::now());
        ctx.cache_callback("temp/target", Value::Number(9.0), Utc::now());
        ctx.cache_callback("t_sample/value", Value::Number(6.0), Utc::now());

        let stats = ctx
            .with_current(|ds| ds.base().valuestats.get("T_sample").cloned())
            .flatten()
            .unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean(), Some(5.0));
    }

    #[test]
    fn temporary_points_are_not_recorded() {
        let dir = tempdir().unwrap();
        let (ctx, log) = context(dir.path());
        ctx.begin_scan(ScanParams::default()).unwrap();
        ctx.begin_temporary_point(PointParams::default()).unwrap();
        ctx.finish_point();
        let scan = ctx.finish_scan().unwrap();

        assert!(scan.subsets.is_empty());
        assert!(!log.lock().iter().any(|l| l.contains("point")));
    }
}
