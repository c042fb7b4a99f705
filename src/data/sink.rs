//! Data sink protocol.
//!
//! A [`DataSink`] is a registered persistence or notification backend. For every
//! dataset the context opens, each active sink creates zero or more
//! [`DataSinkHandler`]s which then receive the dataset's lifecycle events:
//!
//! ```text
//! prepare → begin → (put_metainfo | put_values | put_results | add_subset)* → end
//! ```
//!
//! - `prepare` always precedes `begin`; `end` is called exactly once.
//! - `put_*` only happen between `begin` and `end`.
//! - `add_subset` is delivered to the parent's handlers once per child, right
//!   after the child's handlers saw `end`.
//! - Handlers must tolerate every [`Quality`].
//!
//! Handler errors are logged by the context and never abort a scan.

use anyhow::Result;
use std::collections::HashMap;

use crate::data::dataset::{Dataset, SetType};
use crate::data::filenames::FileNamer;
use crate::data::value::{Metainfo, Quality, ResultMap, ValueMap};

/// Session mode of the acquisition context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Real measurement: counters are persisted, all sinks run
    #[default]
    Master,
    /// Dry run: no counters, only simulation-capable sinks
    Simulation,
}

/// What a handler gets to know about its surroundings at `prepare` time.
#[derive(Debug, Clone)]
pub struct SinkEnv {
    /// Counters of every dataset on the stack (see `get_counters`)
    pub counters: HashMap<String, u64>,
    /// Namer for data files
    pub namer: FileNamer,
    /// File name templates configured for this dataset kind
    pub templates: Vec<String>,
}

/// Receiver of one dataset's lifecycle events.
///
/// All methods default to doing nothing.
#[allow(unused_variables)]
pub trait DataSinkHandler: Send {
    /// Called once after the dataset was created, before `begin`.
    fn prepare(&mut self, dataset: &Dataset, env: &SinkEnv) -> Result<()> {
        Ok(())
    }

    /// Dataset started.
    fn begin(&mut self, dataset: &Dataset) -> Result<()> {
        Ok(())
    }

    /// Experiment header for the point.
    fn put_metainfo(&mut self, dataset: &Dataset, metainfo: &Metainfo) -> Result<()> {
        Ok(())
    }

    /// New device values.
    fn put_values(&mut self, dataset: &Dataset, values: &ValueMap) -> Result<()> {
        Ok(())
    }

    /// Detector readings of the given quality.
    fn put_results(&mut self, dataset: &Dataset, quality: Quality, results: &ResultMap) -> Result<()> {
        Ok(())
    }

    /// A child dataset was finished.
    fn add_subset(&mut self, dataset: &Dataset, subset: &Dataset) -> Result<()> {
        Ok(())
    }

    /// Dataset finished.
    fn end(&mut self, dataset: &Dataset) -> Result<()> {
        Ok(())
    }
}

/// Settings common to all sinks.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Dataset kinds the sink handles
    pub settypes: Vec<SetType>,
    /// Whether the sink also runs in simulation mode
    pub active_in_simulation: bool,
    /// File name templates
    pub filenametemplate: Vec<String>,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            settypes: vec![SetType::Point, SetType::Scan, SetType::Subscan, SetType::Block],
            active_in_simulation: false,
            filenametemplate: Vec::new(),
        }
    }
}

impl SinkSettings {
    /// Restrict the sink to the given kinds.
    pub fn for_settypes(settypes: &[SetType]) -> Self {
        Self {
            settypes: settypes.to_vec(),
            ..Default::default()
        }
    }
}

/// A registered data backend.
pub trait DataSink: Send + Sync {
    /// Sink name, used in log messages
    fn name(&self) -> &str;

    /// Common settings
    fn settings(&self) -> &SinkSettings;

    /// Whether handlers should be created for `dataset`.
    ///
    /// # Default Implementation
    /// Gated on the settype allow-list and on simulation mode.
    fn is_active(&self, dataset: &Dataset, mode: SessionMode) -> bool {
        let settings = self.settings();
        if mode == SessionMode::Simulation && !settings.active_in_simulation {
            return false;
        }
        settings.settypes.contains(&dataset.settype())
    }

    /// Create the handlers for an active dataset.
    fn create_handlers(&self, dataset: &Dataset) -> Vec<Box<dyn DataSinkHandler>>;
}
