//! CSV scan sink.
//!
//! Writes one file per scan. The file starts with the scan header as `# `-prefixed
//! JSON lines, followed by a CSV table with one row per finished point:
//!
//! ```text
//! # {
//! #   "uid": "…",
//! #   "counter": 17,
//! #   ...
//! # }
//! x,T,det.time,det.counts
//! 1.0,4.2,1.0,100.0
//! ```
//!
//! The header is written together with the first point, so that the experiment
//! metadata recorded on that point can be included.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value as JsonValue};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::data::dataset::{Dataset, PointDataset, SetType};
use crate::data::sink::{DataSink, DataSinkHandler, SinkEnv, SinkSettings};
use crate::data::value::{Metainfo, Value};

/// Sink writing one CSV file per scan.
pub struct CsvScanSink {
    settings: SinkSettings,
}

impl CsvScanSink {
    /// CSV sink for scans with the default file name template.
    pub fn new() -> Self {
        let mut settings = SinkSettings::for_settypes(&[SetType::Scan, SetType::Subscan]);
        settings.filenametemplate = vec!["scan_{scancounter:0>8}.csv".to_string()];
        Self { settings }
    }

    /// Use other file name templates; the first names the file, the rest become links.
    pub fn with_templates(mut self, templates: Vec<String>) -> Self {
        self.settings.filenametemplate = templates;
        self
    }
}

impl Default for CsvScanSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSink for CsvScanSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    fn create_handlers(&self, _dataset: &Dataset) -> Vec<Box<dyn DataSinkHandler>> {
        vec![Box::new(CsvScanHandler::default())]
    }
}

#[derive(Default)]
struct CsvScanHandler {
    path: PathBuf,
    file: Option<File>,
    writer: Option<csv::Writer<File>>,
}

fn cell(value: &Value) -> String {
    match value {
        Value::Missing => String::new(),
        other => other.to_string(),
    }
}

fn metainfo_json(metainfo: &Metainfo) -> JsonValue {
    let mut map = Map::new();
    for ((device, param), entry) in metainfo {
        let text = if entry.unit.is_empty() {
            entry.text.clone()
        } else {
            format!("{} {}", entry.text, entry.unit)
        };
        map.insert(format!("{}.{}", device, param), JsonValue::String(text));
    }
    JsonValue::Object(map)
}

impl CsvScanHandler {
    fn write_header(&mut self, dataset: &Dataset, first: Option<&PointDataset>) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let base = dataset.base();
        let scan = dataset.as_scan();
        let header = json!({
            "uid": base.uid.to_string(),
            "settype": base.settype.as_str(),
            "counter": base.counter,
            "propcounter": base.propcounter,
            "samplecounter": base.samplecounter,
            "started": base.started.to_rfc3339(),
            "info": base.info,
            "preset": base.preset,
            "npoints": scan.and_then(|s| s.npoints),
            "xindex": scan.map(|s| s.xindex),
            "continuation": scan.map(|s| s.continuation.iter().map(|u| u.to_string()).collect::<Vec<_>>()),
            "metainfo": first.map(|p| metainfo_json(&p.metainfo)),
        });
        let text = serde_json::to_string_pretty(&header)?;
        for line in text.lines() {
            writeln!(file, "# {}", line)?;
        }

        let mut writer = csv::Writer::from_writer(file);
        let columns: Vec<String> = base
            .devvalueinfo()
            .into_iter()
            .chain(base.envvalueinfo())
            .chain(base.detvalueinfo())
            .map(|info| {
                if info.unit.is_empty() {
                    info.name
                } else {
                    format!("{} ({})", info.name, info.unit)
                }
            })
            .collect();
        writer.write_record(&columns)?;
        self.writer = Some(writer);
        Ok(())
    }
}

impl DataSinkHandler for CsvScanHandler {
    fn prepare(&mut self, _dataset: &Dataset, env: &SinkEnv) -> Result<()> {
        let data = env
            .namer
            .create_data_file(&env.templates, &env.counters, &[])
            .context("creating CSV data file")?;
        tracing::info!(file = %data.shortpath, "Writing scan data");
        self.path = data.filepath;
        self.file = Some(data.file);
        Ok(())
    }

    fn add_subset(&mut self, dataset: &Dataset, subset: &Dataset) -> Result<()> {
        let Some(point) = subset.as_point() else {
            return Ok(());
        };
        if self.writer.is_none() {
            self.write_header(dataset, Some(point))?;
        }
        if let Some(writer) = self.writer.as_mut() {
            let row: Vec<String> = point
                .devvaluelist()
                .iter()
                .chain(point.envvaluelist().iter())
                .chain(point.detvaluelist().iter())
                .map(cell)
                .collect();
            writer.write_record(&row)?;
            writer.flush()?;
        }
        Ok(())
    }

    fn end(&mut self, dataset: &Dataset) -> Result<()> {
        if self.writer.is_none() {
            self.write_header(dataset, None)?;
        }
        if let Some(writer) = self.writer.take() {
            let mut file = writer.into_inner().context("flushing CSV table")?;
            let finished = dataset
                .base()
                .finished
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            writeln!(file, "# finished: {}", finished)?;
        }
        tracing::debug!(path = %self.path.display(), "CSV file closed");
        Ok(())
    }
}
