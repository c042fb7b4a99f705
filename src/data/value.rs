//! Value types exchanged between devices, datasets and sinks.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A device reading or target.
///
/// Most devices deliver plain numbers; composite devices (e.g. a triple-axis
/// instrument positioned in `(h, k, l, E)`) deliver sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Numeric value
    Number(f64),
    /// Textual value (switch positions, states)
    Text(String),
    /// Multi-component value
    Sequence(Vec<Value>),
    /// No value available
    #[default]
    Missing,
}

impl Value {
    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this value holds no data.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Flatten into exactly `width` columns.
    ///
    /// Sequences contribute their elements, everything else one column. Short
    /// values are padded with [`Value::Missing`], long ones truncated.
    pub fn flatten_into(&self, width: usize, out: &mut Vec<Value>) {
        let start = out.len();
        match self {
            Value::Sequence(items) => out.extend(items.iter().take(width).cloned()),
            Value::Missing => {}
            other if width > 0 => out.push(other.clone()),
            _ => {}
        }
        out.resize(start + width, Value::Missing);
    }

    /// `self - previous`, component-wise for sequences.
    ///
    /// Non-numeric components difference to [`Value::Missing`].
    pub fn difference(&self, previous: &Value) -> Value {
        match (self, previous) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a - b),
            (Value::Sequence(a), Value::Sequence(b)) if a.len() == b.len() => {
                Value::Sequence(a.iter().zip(b).map(|(x, y)| x.difference(y)).collect())
            }
            _ => Value::Missing,
        }
    }

    /// Midpoint of two readings, used for positions sampled at both ends of an interval.
    pub fn midpoint(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Value::Number((a + b) / 2.0),
            (Value::Sequence(a), Value::Sequence(b)) if a.len() == b.len() => {
                Value::Sequence(a.iter().zip(b).map(|(x, y)| x.midpoint(y)).collect())
            }
            _ => other.clone(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Sequence(v.into_iter().map(Value::Number).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Sequence(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Missing => write!(f, "-"),
        }
    }
}

/// A value together with the time it was sampled.
///
/// `time == None` marks the authoritative (canonical) position of a device for a
/// point, as opposed to an incidental time-series sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    /// Sample time, `None` for canonical values
    pub time: Option<DateTime<Utc>>,
    /// The value itself
    pub value: Value,
}

impl TimedValue {
    /// Canonical (untimed) value.
    pub fn canonical(value: Value) -> Self {
        Self { time: None, value }
    }

    /// Value sampled now.
    pub fn sampled(value: Value) -> Self {
        Self {
            time: Some(Utc::now()),
            value,
        }
    }
}

/// Device name → value, in insertion order.
pub type ValueMap = IndexMap<String, TimedValue>;

/// Counting conditions, e.g. `t = 1.0` or `m = 10000`.
pub type Preset = IndexMap<String, f64>;

/// Semantic type of a value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Primary (measured or positioned) value
    #[default]
    Other,
    /// Counter reading
    Counter,
    /// Monitor reading
    Monitor,
    /// Elapsed time
    Time,
    /// Derived value
    Calculated,
    /// Shown in files but not in plots
    Info,
}

/// Descriptor of one value column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    /// Column name
    pub name: String,
    /// Physical unit
    pub unit: String,
    /// Format string for display
    pub fmtstr: String,
    /// Error model: "none", "sqrt" (counting statistics) or "next" (error in next column)
    pub errors: String,
    /// Semantic type
    pub value_type: ValueType,
}

impl ValueInfo {
    /// Descriptor with default unit, format and error model.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            fmtstr: "%.3f".to_string(),
            errors: "none".to_string(),
            value_type: ValueType::Other,
        }
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the semantic type.
    pub fn with_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Set the error model.
    pub fn with_errors(mut self, errors: impl Into<String>) -> Self {
        self.errors = errors.into();
        self
    }
}

/// Descriptor of one detector array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInfo {
    /// Array name
    pub name: String,
    /// Array shape
    pub shape: Vec<usize>,
    /// Element type ("uint32", "float64", ...)
    pub dtype: String,
}

/// Array payload delivered by a detector (images, spectra).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayData {
    /// Shape of the array, row-major
    pub shape: Vec<usize>,
    /// Flattened data
    pub data: Vec<f64>,
}

impl ArrayData {
    /// One-dimensional array.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Element-wise `self - previous`; `None` when shapes disagree.
    pub fn difference(&self, previous: &ArrayData) -> Option<ArrayData> {
        if self.shape != previous.shape || self.data.len() != previous.data.len() {
            return None;
        }
        Some(ArrayData {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&previous.data)
                .map(|(a, b)| a - b)
                .collect(),
        })
    }
}

/// Readout quality of detector results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// Live preview during counting, usually ignored by persisting sinks
    Live,
    /// Intermediate readout during counting
    Intermediate,
    /// Final readout after counting completed
    Final,
    /// Readout after counting was interrupted
    Interrupted,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Live => write!(f, "live"),
            Quality::Intermediate => write!(f, "intermediate"),
            Quality::Final => write!(f, "final"),
            Quality::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Readings of one detector: scalar columns plus arrays.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorResult {
    /// Scalar readings, aligned with the detector's value descriptors
    pub scalars: Vec<Value>,
    /// Array readings, aligned with the detector's array descriptors
    pub arrays: Vec<Option<ArrayData>>,
}

impl DetectorResult {
    /// Per-column difference to an earlier cumulative reading.
    ///
    /// Arrays difference element-wise; if either side is unavailable the result
    /// is `None` for that array.
    pub fn difference(&self, previous: &DetectorResult) -> DetectorResult {
        let scalars = self
            .scalars
            .iter()
            .enumerate()
            .map(|(i, v)| match previous.scalars.get(i) {
                Some(prev) => v.difference(prev),
                None => Value::Missing,
            })
            .collect();
        let arrays = self
            .arrays
            .iter()
            .enumerate()
            .map(|(i, arr)| match (arr, previous.arrays.get(i)) {
                (Some(new), Some(Some(old))) => new.difference(old),
                _ => None,
            })
            .collect();
        DetectorResult { scalars, arrays }
    }

    /// Drop array payloads, keeping one empty slot per array.
    pub fn trim_arrays(&mut self) {
        for arr in self.arrays.iter_mut() {
            *arr = None;
        }
    }
}

/// Detector name → readings.
pub type ResultMap = IndexMap<String, DetectorResult>;

/// One entry of the experiment "header" snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Parameter value
    pub value: Value,
    /// Formatted value
    pub text: String,
    /// Unit
    pub unit: String,
    /// Category ("general", "instrument", "sample", ...)
    pub category: String,
}

/// `(device, parameter)` → header entry.
pub type Metainfo = IndexMap<(String, String), MetaEntry>;

/// Running statistics over the values a device delivered during a dataset.
///
/// Updated incrementally with [`ValueStats::update`]; never recomputed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueStats {
    /// Number of numeric samples
    pub count: u64,
    /// Sum of numeric samples
    pub sum: f64,
    /// Sum of squares of numeric samples
    pub sumsq: f64,
    /// Smallest sample
    pub min: Option<f64>,
    /// Largest sample
    pub max: Option<f64>,
    /// Last delivered value (numeric or not)
    pub last: Value,
    /// Time of the last delivered value
    pub last_time: Option<DateTime<Utc>>,
}

impl ValueStats {
    /// Fold in one sample.
    pub fn update(&mut self, sample: &TimedValue) {
        if let Some(v) = sample.value.as_f64() {
            self.count += 1;
            self.sum += v;
            self.sumsq += v * v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        self.last = sample.value.clone();
        if sample.time.is_some() {
            self.last_time = sample.time;
        }
    }

    /// Mean of the numeric samples.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Population standard deviation of the numeric samples.
    pub fn stddev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let var = self.sumsq / self.count as f64 - mean * mean;
        Some(var.max(0.0).sqrt())
    }
}
