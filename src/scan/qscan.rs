//! Scan in reciprocal space.
//!
//! A [`Scan`] of a triple-axis instrument positioned in `(h, k, l, E)`. The
//! monochromator and analyzer are recorded as environment, not as scanned
//! devices, and the plot index is the first Q/E component that varies.

use std::sync::Arc;

use crate::data::dataset::ScanDataset;
use crate::data::manager::AcquisitionContext;
use crate::data::value::Value;
use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::Device;
use crate::scan::engine::ScanOptions;
use crate::scan::step::Scan;

/// A Q/E scan.
pub struct QScan {
    scan: Scan,
}

/// Builder for [`QScan`].
pub struct QScanBuilder {
    instrument: Arc<dyn Device>,
    positions: Vec<[f64; 4]>,
    mono: Option<Arc<dyn Device>>,
    ana: Option<Arc<dyn Device>>,
    options: ScanOptions,
}

impl QScanBuilder {
    /// Monochromator, recorded as environment.
    pub fn mono(mut self, device: Arc<dyn Device>) -> Self {
        self.mono = Some(device);
        self
    }

    /// Analyzer, recorded as environment.
    pub fn ana(mut self, device: Arc<dyn Device>) -> Self {
        self.ana = Some(device);
        self
    }

    /// Common scan options.
    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and create the scan.
    pub fn build(self, ctx: &AcquisitionContext) -> ScanResult<QScan> {
        let width = self.instrument.value_info().len();
        if width != 4 {
            return Err(ScanError::Configuration(format!(
                "'{}' has {} value(s), a Q/E scan needs (h, k, l, E)",
                self.instrument.name(),
                width
            )));
        }

        let mut options = self.options;
        let axes: Vec<Arc<dyn Device>> = self.mono.into_iter().chain(self.ana).collect();
        options.prepend_environment(axes, ctx);

        let positions = self
            .positions
            .iter()
            .map(|q| vec![Value::from(q.to_vec())])
            .collect();
        let scan = Scan::builder(vec![self.instrument], positions)
            .options(options)
            .build(ctx)?;
        Ok(QScan { scan })
    }
}

impl QScan {
    /// Scan `instrument` through `(h, k, l, E)` positions.
    pub fn builder(instrument: Arc<dyn Device>, positions: Vec<[f64; 4]>) -> QScanBuilder {
        QScanBuilder {
            instrument,
            positions,
            mono: None,
            ana: None,
            options: ScanOptions::default(),
        }
    }

    /// Number of points.
    pub fn npoints(&self) -> usize {
        self.scan.npoints()
    }

    /// Execute the scan.
    pub async fn run(&self, ctx: &AcquisitionContext) -> ScanResult<Option<Arc<ScanDataset>>> {
        self.scan.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMotor, MockSensor, MockTas};
    use tempfile::tempdir;

    #[test]
    fn rejects_single_column_instrument() {
        let ctx = AcquisitionContext::builder().build();
        let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));
        let result = QScan::builder(motor, vec![[1.0, 0.0, 0.0, 0.0]]).build(&ctx);
        assert!(matches!(result, Err(ScanError::Configuration(_))));
    }

    #[tokio::test]
    async fn energy_scan_plots_against_energy() {
        let dir = tempdir().unwrap();
        let ctx = AcquisitionContext::builder()
            .data_root(dir.path())
            .environment(Arc::new(MockSensor::new("T", 4.2)))
            .build();
        let tas: Arc<dyn Device> = Arc::new(MockTas::new("tas"));
        let mono: Arc<dyn Device> = Arc::new(MockMotor::with_position("mth", 20.0));
        let ana: Arc<dyn Device> = Arc::new(MockMotor::with_position("ath", -20.0));

        let scan = QScan::builder(
            tas,
            vec![[1.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.5], [1.0, 0.0, 0.0, 1.0]],
        )
        .mono(mono)
        .ana(ana)
        .options(ScanOptions::new().detectors(vec![]))
        .build(&ctx)
        .unwrap();
        let dataset = scan.run(&ctx).await.unwrap().unwrap();

        assert_eq!(dataset.xindex, 3);
        assert_eq!(dataset.subsets.len(), 3);
        let env: Vec<&str> = dataset.base.environment.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(env, vec!["mth", "ath", "T"]);
        assert_eq!(dataset.devvaluelists[2][3], Value::Number(1.0));
    }
}
