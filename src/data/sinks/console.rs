//! Console sink: a progress log of running scans through `tracing`.

use anyhow::Result;

use crate::data::dataset::{Dataset, SetType};
use crate::data::sink::{DataSink, DataSinkHandler, SinkSettings};
use crate::data::value::Value;

/// Logs a header, one line per point and a summary for each scan.
pub struct ConsoleSink {
    settings: SinkSettings,
}

impl ConsoleSink {
    /// Console sink for scans and subscans.
    pub fn new() -> Self {
        let mut settings = SinkSettings::for_settypes(&[SetType::Scan, SetType::Subscan]);
        settings.active_in_simulation = true;
        Self { settings }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    fn create_handlers(&self, _dataset: &Dataset) -> Vec<Box<dyn DataSinkHandler>> {
        vec![Box::new(ConsoleHandler { points: 0 })]
    }
}

struct ConsoleHandler {
    points: usize,
}

fn join(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::Number(n) => format!("{:.4}", n),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("  ")
}

impl DataSinkHandler for ConsoleHandler {
    fn begin(&mut self, dataset: &Dataset) -> Result<()> {
        let base = dataset.base();
        let columns: Vec<String> = base
            .devvalueinfo()
            .iter()
            .chain(base.envvalueinfo().iter())
            .chain(base.detvalueinfo().iter())
            .map(|info| info.name.clone())
            .collect();
        tracing::info!(
            settype = %base.settype,
            counter = base.counter,
            npoints = ?dataset.as_scan().and_then(|s| s.npoints),
            info = %base.info,
            "Starting scan: {}",
            columns.join("  ")
        );
        Ok(())
    }

    fn add_subset(&mut self, dataset: &Dataset, subset: &Dataset) -> Result<()> {
        let Some(point) = subset.as_point() else {
            return Ok(());
        };
        self.points += 1;
        let total = dataset
            .as_scan()
            .and_then(|s| s.npoints)
            .map_or_else(|| "?".to_string(), |n| n.to_string());
        tracing::info!(
            "{:>4}/{}  {}  |  {}  |  {}",
            point.base.number,
            total,
            join(&point.devvaluelist()),
            join(&point.envvaluelist()),
            join(&point.detvaluelist())
        );
        Ok(())
    }

    fn end(&mut self, dataset: &Dataset) -> Result<()> {
        let base = dataset.base();
        let elapsed = base
            .finished
            .map(|f| (f - base.started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        tracing::info!(
            counter = base.counter,
            points = self.points,
            elapsed_s = elapsed,
            "Scan finished"
        );
        Ok(())
    }
}
