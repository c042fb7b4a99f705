//! Dataset hierarchy.
//!
//! Datasets are passive holders of everything measured during a block, a scan or a
//! single point. They are created and finalized exclusively by the
//! [`AcquisitionContext`](crate::data::manager::AcquisitionContext); scans and sinks
//! only read them.
//!
//! ```text
//! BlockDataset ── subsets: Arc<ScanDataset> ── subsets: PointDataset
//! ```

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::data::value::{
    Metainfo, Preset, ResultMap, Value, ValueInfo, ValueMap, ValueStats,
};
use crate::hardware::capabilities::Device;

// =============================================================================
// Set types and device references
// =============================================================================

/// Kind of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetType {
    /// One measurement point
    Point,
    /// A scan
    Scan,
    /// A scan nested in a point of an outer scan
    Subscan,
    /// Coarse grouping of scans
    Block,
}

impl SetType {
    /// Key used in persistent counter files. Subscans share the scan counter.
    pub fn counter_key(&self) -> &'static str {
        match self {
            SetType::Point => "point",
            SetType::Scan | SetType::Subscan => "scan",
            SetType::Block => "block",
        }
    }

    /// Prefix of the keys [`get_counters`](crate::data::manager::AcquisitionContext::get_counters) reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SetType::Point => "point",
            SetType::Scan => "scan",
            SetType::Subscan => "subscan",
            SetType::Block => "block",
        }
    }

    /// Stack level: blocks at 0, scans and subscans at 1, points at 2.
    pub fn level(&self) -> usize {
        match self {
            SetType::Block => 0,
            SetType::Scan | SetType::Subscan => 1,
            SetType::Point => 2,
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name and value descriptors of a device taking part in a dataset.
///
/// Datasets never own devices; they keep this snapshot instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Device name
    pub name: String,
    /// Columns the device delivers
    pub value_info: Vec<ValueInfo>,
}

impl DeviceRef {
    /// Snapshot a device (or detector).
    pub fn of<D: Device + ?Sized>(device: &D) -> Self {
        Self {
            name: device.name().to_string(),
            value_info: device.value_info(),
        }
    }
}

fn collect_info(refs: &[DeviceRef]) -> Vec<ValueInfo> {
    refs.iter().flat_map(|d| d.value_info.iter().cloned()).collect()
}

// =============================================================================
// BaseDataset
// =============================================================================

/// Fields shared by every dataset kind.
#[derive(Debug, Clone)]
pub struct BaseDataset {
    /// Unique identifier
    pub uid: Uuid,
    /// Creation time
    pub started: DateTime<Utc>,
    /// Finalization time, set once
    pub finished: Option<DateTime<Utc>>,
    /// Dataset kind
    pub settype: SetType,
    /// Global counter (0 until assigned)
    pub counter: u64,
    /// Per-proposal counter
    pub propcounter: u64,
    /// Per-sample counter
    pub samplecounter: u64,
    /// 1-based position within the parent's subsets
    pub number: usize,
    /// Moved devices
    pub devices: Vec<DeviceRef>,
    /// Sample environment devices
    pub environment: Vec<DeviceRef>,
    /// Detectors
    pub detectors: Vec<DeviceRef>,
    /// Counting conditions
    pub preset: Preset,
    /// Latest value per device
    pub values: IndexMap<String, Value>,
    /// Running statistics per device
    pub valuestats: IndexMap<String, ValueStats>,
    /// Values delivered without a timestamp (settled positions)
    pub canonical_values: IndexMap<String, Value>,
    /// Free text
    pub info: String,
}

impl BaseDataset {
    /// Fresh dataset of the given kind, started now.
    pub fn new(settype: SetType) -> Self {
        Self {
            uid: Uuid::new_v4(),
            started: Utc::now(),
            finished: None,
            settype,
            counter: 0,
            propcounter: 0,
            samplecounter: 0,
            number: 0,
            devices: Vec::new(),
            environment: Vec::new(),
            detectors: Vec::new(),
            preset: Preset::new(),
            values: IndexMap::new(),
            valuestats: IndexMap::new(),
            canonical_values: IndexMap::new(),
            info: String::new(),
        }
    }

    /// Merge device values; untimed values also become canonical.
    pub fn update_values(&mut self, values: &ValueMap) {
        for (name, sample) in values {
            if sample.time.is_none() {
                self.canonical_values.insert(name.clone(), sample.value.clone());
            }
            self.values.insert(name.clone(), sample.value.clone());
            self.valuestats
                .entry(name.clone())
                .or_default()
                .update(sample);
        }
    }

    /// Stamp the finish time unless already set.
    pub fn mark_finished(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Utc::now().max(self.started));
        }
    }

    /// Whether the dataset has been finalized.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Whether counters have been assigned.
    pub fn has_counters(&self) -> bool {
        self.counter > 0
    }

    /// Value descriptors of all moved devices.
    pub fn devvalueinfo(&self) -> Vec<ValueInfo> {
        collect_info(&self.devices)
    }

    /// Value descriptors of all environment devices.
    pub fn envvalueinfo(&self) -> Vec<ValueInfo> {
        collect_info(&self.environment)
    }

    /// Value descriptors of all detectors.
    pub fn detvalueinfo(&self) -> Vec<ValueInfo> {
        collect_info(&self.detectors)
    }

    fn clear_data(&mut self) {
        self.values.clear();
        self.valuestats.clear();
        self.canonical_values.clear();
    }
}

// =============================================================================
// PointDataset
// =============================================================================

#[derive(Debug, Clone, Default)]
struct ValueListCache {
    dev: OnceCell<Vec<Value>>,
    env: OnceCell<Vec<Value>>,
    det: OnceCell<Vec<Value>>,
}

/// One measurement point.
///
/// The flat value lists are recomputed on every access while the point is open
/// and computed once after it was finished.
#[derive(Debug, Clone)]
pub struct PointDataset {
    /// Shared fields
    pub base: BaseDataset,
    /// Detector readings
    pub results: ResultMap,
    /// Experiment header snapshot
    pub metainfo: Metainfo,
    cache: ValueListCache,
}

impl PointDataset {
    /// Empty point.
    pub fn new() -> Self {
        Self {
            base: BaseDataset::new(SetType::Point),
            results: ResultMap::new(),
            metainfo: Metainfo::new(),
            cache: ValueListCache::default(),
        }
    }

    fn memoized<'a>(
        &'a self,
        cell: &'a OnceCell<Vec<Value>>,
        compute: impl FnOnce() -> Vec<Value>,
    ) -> Cow<'a, [Value]> {
        if self.base.is_finished() {
            Cow::Borrowed(cell.get_or_init(compute).as_slice())
        } else {
            Cow::Owned(compute())
        }
    }

    /// Values of the moved devices, aligned with [`BaseDataset::devvalueinfo`].
    pub fn devvaluelist(&self) -> Cow<'_, [Value]> {
        self.memoized(&self.cache.dev, || self.compute_devvaluelist())
    }

    /// Values of the environment devices, aligned with [`BaseDataset::envvalueinfo`].
    pub fn envvaluelist(&self) -> Cow<'_, [Value]> {
        self.memoized(&self.cache.env, || self.compute_envvaluelist())
    }

    /// Scalar detector readings, aligned with [`BaseDataset::detvalueinfo`].
    pub fn detvaluelist(&self) -> Cow<'_, [Value]> {
        self.memoized(&self.cache.det, || self.compute_detvaluelist())
    }

    /// Canonical position of each device, falling back to its latest value.
    fn compute_devvaluelist(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for dev in &self.base.devices {
            let value = self
                .base
                .canonical_values
                .get(&dev.name)
                .or_else(|| self.base.values.get(&dev.name))
                .cloned()
                .unwrap_or_default();
            value.flatten_into(dev.value_info.len(), &mut out);
        }
        out
    }

    /// Mean over the point for numeric single-column devices, latest value otherwise.
    fn compute_envvaluelist(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for dev in &self.base.environment {
            let mean = match dev.value_info.len() {
                1 => self
                    .base
                    .valuestats
                    .get(&dev.name)
                    .and_then(ValueStats::mean)
                    .map(Value::Number),
                _ => None,
            };
            let value = mean
                .or_else(|| self.base.values.get(&dev.name).cloned())
                .unwrap_or_default();
            value.flatten_into(dev.value_info.len(), &mut out);
        }
        out
    }

    fn compute_detvaluelist(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for det in &self.base.detectors {
            let width = det.value_info.len();
            let start = out.len();
            if let Some(result) = self.results.get(&det.name) {
                out.extend(result.scalars.iter().take(width).cloned());
            }
            out.resize(start + width, Value::Missing);
        }
        out
    }

    /// Drop array payloads, keeping scalars and metadata.
    pub fn trim_result(&mut self) {
        for result in self.results.values_mut() {
            result.trim_arrays();
        }
    }

    /// Remove all measured data.
    pub fn clear(&mut self) {
        self.base.clear_data();
        self.results.clear();
        self.metainfo.clear();
        self.cache = ValueListCache::default();
    }
}

impl Default for PointDataset {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ScanDataset
// =============================================================================

/// A scan (or subscan) and its points.
#[derive(Debug, Clone)]
pub struct ScanDataset {
    /// Shared fields
    pub base: BaseDataset,
    /// Finished points
    pub subsets: Vec<PointDataset>,
    /// Expected number of points, `None` for open-ended sweeps
    pub npoints: Option<usize>,
    /// Column of `devvaluelist` used as x axis
    pub xindex: usize,
    /// Uids of the scans this one continues
    pub continuation: Vec<Uuid>,
    /// Direction of the continuation (+1 / -1, 0 when not chained)
    pub cont_direction: i32,
    /// Device value list of every point
    pub devvaluelists: Vec<Vec<Value>>,
    /// Environment value list of every point
    pub envvaluelists: Vec<Vec<Value>>,
    /// Detector value list of every point
    pub detvaluelists: Vec<Vec<Value>>,
}

impl ScanDataset {
    /// Empty scan; `subscan` selects the set type.
    pub fn new(subscan: bool) -> Self {
        let settype = if subscan {
            SetType::Subscan
        } else {
            SetType::Scan
        };
        Self {
            base: BaseDataset::new(settype),
            subsets: Vec::new(),
            npoints: None,
            xindex: 0,
            continuation: Vec::new(),
            cont_direction: 0,
            devvaluelists: Vec::new(),
            envvaluelists: Vec::new(),
            detvaluelists: Vec::new(),
        }
    }

    /// Append a finished point, accumulating its value lists.
    pub fn add_point(&mut self, point: PointDataset) {
        self.devvaluelists.push(point.devvaluelist().into_owned());
        self.envvaluelists.push(point.envvaluelist().into_owned());
        self.detvaluelists.push(point.detvaluelist().into_owned());
        self.subsets.push(point);
    }

    /// Header snapshot, taken from the first point.
    pub fn metainfo(&self) -> Option<&Metainfo> {
        self.subsets.first().map(|p| &p.metainfo)
    }

    /// Clear all points but the first; drop the first point's arrays.
    pub fn trim_result(&mut self) {
        let mut points = self.subsets.iter_mut();
        if let Some(first) = points.next() {
            first.trim_result();
        }
        for point in points {
            point.clear();
        }
    }
}

// =============================================================================
// BlockDataset
// =============================================================================

/// Grouping of scans.
#[derive(Debug, Clone)]
pub struct BlockDataset {
    /// Shared fields
    pub base: BaseDataset,
    /// Finished scans
    pub subsets: Vec<Arc<ScanDataset>>,
}

impl BlockDataset {
    /// Empty block.
    pub fn new() -> Self {
        Self {
            base: BaseDataset::new(SetType::Block),
            subsets: Vec::new(),
        }
    }
}

impl Default for BlockDataset {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Dataset
// =============================================================================

/// Any dataset on the context stack.
#[derive(Debug, Clone)]
pub enum Dataset {
    /// A point
    Point(PointDataset),
    /// A scan or subscan
    Scan(ScanDataset),
    /// A block
    Block(BlockDataset),
}

impl Dataset {
    /// Shared fields.
    pub fn base(&self) -> &BaseDataset {
        match self {
            Dataset::Point(p) => &p.base,
            Dataset::Scan(s) => &s.base,
            Dataset::Block(b) => &b.base,
        }
    }

    /// Shared fields, mutably.
    pub fn base_mut(&mut self) -> &mut BaseDataset {
        match self {
            Dataset::Point(p) => &mut p.base,
            Dataset::Scan(s) => &mut s.base,
            Dataset::Block(b) => &mut b.base,
        }
    }

    /// Dataset kind.
    pub fn settype(&self) -> SetType {
        self.base().settype
    }

    /// Dataset uid.
    pub fn uid(&self) -> Uuid {
        self.base().uid
    }

    /// Number of finished children.
    pub fn subset_count(&self) -> usize {
        match self {
            Dataset::Point(_) => 0,
            Dataset::Scan(s) => s.subsets.len(),
            Dataset::Block(b) => b.subsets.len(),
        }
    }

    /// The point, if this is one.
    pub fn as_point(&self) -> Option<&PointDataset> {
        match self {
            Dataset::Point(p) => Some(p),
            _ => None,
        }
    }

    /// The scan, if this is one.
    pub fn as_scan(&self) -> Option<&ScanDataset> {
        match self {
            Dataset::Scan(s) => Some(s),
            _ => None,
        }
    }

    /// Release bulk data after the dataset was handed to the sinks.
    pub fn trim_result(&mut self) {
        match self {
            Dataset::Point(p) => p.trim_result(),
            Dataset::Scan(s) => s.trim_result(),
            Dataset::Block(_) => {}
        }
    }
}

// =============================================================================
// Construction parameters
// =============================================================================

/// Parameters of [`begin_point`](crate::data::manager::AcquisitionContext::begin_point).
///
/// Empty device lists and an empty preset are inherited from the enclosing scan.
#[derive(Debug, Clone, Default)]
pub struct PointParams {
    /// Moved devices
    pub devices: Vec<DeviceRef>,
    /// Environment devices
    pub environment: Vec<DeviceRef>,
    /// Detectors
    pub detectors: Vec<DeviceRef>,
    /// Counting conditions
    pub preset: Preset,
}

/// Parameters of [`begin_scan`](crate::data::manager::AcquisitionContext::begin_scan).
#[derive(Debug, Clone, Default)]
pub struct ScanParams {
    /// Open a subscan instead of a scan
    pub subscan: bool,
    /// Moved devices
    pub devices: Vec<DeviceRef>,
    /// Environment devices
    pub environment: Vec<DeviceRef>,
    /// Detectors
    pub detectors: Vec<DeviceRef>,
    /// Counting conditions
    pub preset: Preset,
    /// Free text
    pub info: String,
    /// Expected number of points
    pub npoints: Option<usize>,
    /// Plot x axis column
    pub xindex: usize,
    /// Uids of continued scans
    pub continuation: Vec<Uuid>,
    /// Continuation direction
    pub cont_direction: i32,
}

/// Parameters of [`begin_block`](crate::data::manager::AcquisitionContext::begin_block).
#[derive(Debug, Clone, Default)]
pub struct BlockParams {
    /// Environment devices recorded for the whole block
    pub environment: Vec<DeviceRef>,
    /// Free text
    pub info: String,
}

impl PointDataset {
    pub(crate) fn from_params(params: PointParams) -> Self {
        let mut point = Self::new();
        point.base.devices = params.devices;
        point.base.environment = params.environment;
        point.base.detectors = params.detectors;
        point.base.preset = params.preset;
        point
    }
}

impl ScanDataset {
    pub(crate) fn from_params(params: ScanParams) -> Self {
        let mut scan = Self::new(params.subscan);
        scan.base.devices = params.devices;
        scan.base.environment = params.environment;
        scan.base.detectors = params.detectors;
        scan.base.preset = params.preset;
        scan.base.info = params.info;
        scan.npoints = params.npoints;
        scan.xindex = params.xindex;
        scan.continuation = params.continuation;
        scan.cont_direction = params.cont_direction;
        scan
    }
}

impl BlockDataset {
    pub(crate) fn from_params(params: BlockParams) -> Self {
        let mut block = Self::new();
        block.base.environment = params.environment;
        block.base.info = params.info;
        block
    }
}
