//! End-to-end scan scenarios against mock hardware
//!
//! Each test builds its own acquisition context rooted in a temporary
//! directory, so counters never leak between tests.

use async_trait::async_trait;
use daq_scan::data::dataset::BlockParams;
use daq_scan::data::sinks::{BroadcastSink, SinkEvent};
use daq_scan::data::value::{DetectorResult, Quality, Value};
use daq_scan::data::{AcquisitionContext, SetType};
use daq_scan::error::{DeviceErrorKind, Phase};
use daq_scan::hardware::mock::{MockDetector, MockMotor, MockSensor};
use daq_scan::hardware::Device;
use daq_scan::scan::{
    line_positions, ContinuousScan, EndMotion, ManualScan, Scan, ScanHooks, ScanOptions,
    SweepScan,
};
use daq_scan::ScanError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tracing_test::traced_test;

fn context(dir: &TempDir, det: Arc<MockDetector>) -> AcquisitionContext {
    AcquisitionContext::builder()
        .data_root(dir.path())
        .detector(det)
        .environment(Arc::new(MockSensor::new("T", 4.2)))
        .build()
}

// =============================================================================
// Step scans
// =============================================================================

#[tokio::test]
async fn test_step_scan_records_every_point() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    let scan = Scan::builder(vec![motor], line_positions(&[1.0], &[1.0], 3))
        .options(ScanOptions::new().preset("t", 1.0).info("three points"))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 3);
    assert_eq!(dataset.npoints, Some(3));
    assert!(dataset.base.counter > 0);
    let finished = dataset.base.finished.unwrap();
    assert!(finished > dataset.base.started);
    assert_eq!(dataset.base.info, "three points");

    let xs: Vec<Value> = dataset.devvaluelists.iter().map(|row| row[0].clone()).collect();
    assert_eq!(xs, vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
    for row in &dataset.detvaluelists {
        assert_eq!(row, &vec![Value::Number(1.0), Value::Number(100.0)]);
    }
    for row in &dataset.envvaluelists {
        assert_eq!(row, &vec![Value::Number(4.2)]);
    }
    assert_eq!(ctx.stack_depth(), 0);
}

#[tokio::test]
async fn test_value_lists_match_value_info() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det").with_array()));
    let x: Arc<dyn Device> = Arc::new(MockMotor::new("x"));
    let y: Arc<dyn Device> = Arc::new(MockMotor::new("y"));

    let scan = Scan::builder(vec![x, y], line_positions(&[0.0, 5.0], &[0.1, 0.0], 4))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.devvaluelists.len(), 4);
    for i in 0..4 {
        assert_eq!(dataset.devvaluelists[i].len(), dataset.base.devvalueinfo().len());
        assert_eq!(dataset.envvaluelists[i].len(), dataset.base.envvalueinfo().len());
        assert_eq!(dataset.detvaluelists[i].len(), dataset.base.detvalueinfo().len());
    }
    assert_eq!(dataset.xindex, 0);
    // Arrays are not kept once the scan is finished.
    let first = &dataset.subsets[0];
    assert!(first.results["det"].arrays.iter().all(Option::is_none));
}

#[tokio::test]
#[traced_test]
async fn test_continuable_move_error_keeps_point() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> =
        Arc::new(MockMotor::new("x").fail_at(1.0, DeviceErrorKind::Move));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 3))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 3);
    // The motor stayed where it was; the point records the real position.
    assert_eq!(dataset.devvaluelists[1], vec![Value::Number(0.0)]);
    assert_eq!(dataset.devvaluelists[2], vec![Value::Number(2.0)]);
    assert!(logs_contain("Continuing after device error"));
}

#[tokio::test]
async fn test_limit_error_skips_point() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> =
        Arc::new(MockMotor::new("x").fail_at(1.0, DeviceErrorKind::Limit));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 3))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 2);
    assert_eq!(dataset.devvaluelists[1], vec![Value::Number(2.0)]);
}

#[tokio::test]
async fn test_hardware_error_is_fatal_but_scan_is_finished() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> =
        Arc::new(MockMotor::new("x").fail_at(1.0, DeviceErrorKind::Hardware));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 3))
        .build(&ctx)
        .unwrap();
    let err = scan.run(&ctx).await.unwrap_err();

    assert!(matches!(err, ScanError::Device { .. }));
    assert_eq!(ctx.stack_depth(), 0);
    let history = ctx.last_scans(1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].subsets.len(), 1);
}

#[tokio::test]
async fn test_fatal_count_error_still_finishes_point_and_scan() {
    let dir = tempdir().unwrap();
    let det = Arc::new(MockDetector::new("det").fail_next_count(DeviceErrorKind::Hardware));
    let ctx = context(&dir, det);
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 3))
        .build(&ctx)
        .unwrap();
    let err = scan.run(&ctx).await.unwrap_err();

    assert!(matches!(err, ScanError::Device { phase: Phase::Count, .. }));
    assert!(ctx.stack_settypes().is_empty());
    let history = ctx.last_scans(1);
    assert_eq!(history.len(), 1);
    assert!(history[0].base.is_finished());
    assert_eq!(history[0].subsets.len(), 1);
}

#[tokio::test]
async fn test_skip_while_preparing_drops_only_first_point() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> =
        Arc::new(MockMotor::new("x").fail_at(0.0, DeviceErrorKind::Limit));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 3))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.npoints, Some(3));
    let xs: Vec<Value> = dataset.devvaluelists.iter().map(|row| row[0].clone()).collect();
    assert_eq!(xs, vec![Value::Number(1.0), Value::Number(2.0)]);
}

#[tokio::test]
async fn test_overlapped_end_motion_runs_during_counting() {
    let dir = tempdir().unwrap();
    let ctx = AcquisitionContext::builder().data_root(dir.path()).build();
    let motor = Arc::new(MockMotor::new("x"));
    let device: Arc<dyn Device> = motor.clone();

    let scan = Scan::builder(vec![device], line_positions(&[0.0], &[1.0], 2))
        .end_positions(line_positions(&[0.5], &[1.0], 2))
        .end_motion(EndMotion::Overlapped)
        .options(ScanOptions::new().detectors(vec![]))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(motor.started_targets(), vec![0.0, 0.0, 0.5, 1.0, 1.5]);
    assert_eq!(dataset.devvaluelists, vec![vec![Value::Number(0.0)], vec![Value::Number(1.0)]]);
    assert_eq!(motor.read(None).await.unwrap(), Value::Number(1.5));
}

#[tokio::test]
async fn test_overlapped_end_move_failure_skips_point_before_counting() {
    let dir = tempdir().unwrap();
    let ctx = AcquisitionContext::builder().data_root(dir.path()).build();
    let run_with = |motion: EndMotion| {
        let ctx = &ctx;
        async move {
            let motor: Arc<dyn Device> =
                Arc::new(MockMotor::new("x").fail_at(0.5, DeviceErrorKind::Limit));
            let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 2))
                .end_positions(line_positions(&[0.5], &[1.0], 2))
                .end_motion(motion)
                .options(ScanOptions::new().detectors(vec![]))
                .build(ctx)
                .unwrap();
            scan.run(ctx).await.unwrap().unwrap()
        }
    };

    // Sequential end moves happen after the point is recorded.
    assert_eq!(run_with(EndMotion::Sequential).await.subsets.len(), 2);
    let overlapped = run_with(EndMotion::Overlapped).await;
    assert_eq!(overlapped.devvaluelists, vec![vec![Value::Number(1.0)]]);
}

#[tokio::test]
async fn test_live_readouts_reach_sinks_but_not_the_point() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();
    let ctx = AcquisitionContext::builder()
        .data_root(dir.path())
        .detector(Arc::new(MockDetector::new("det").with_polls(3).with_live_every(1)))
        .sink(sink)
        .build();
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 1))
        .options(ScanOptions::new().preset("t", 2.0))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    let mut qualities = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SinkEvent::Results { quality, .. } = event {
            qualities.push(quality);
        }
    }
    assert_eq!(qualities, vec![Quality::Live, Quality::Live, Quality::Final]);
    assert_eq!(dataset.detvaluelists[0], vec![Value::Number(2.0), Value::Number(200.0)]);
}

#[tokio::test]
async fn test_subscan_inside_block() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    ctx.begin_block(BlockParams::default()).unwrap();
    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 2))
        .options(ScanOptions::new().subscan(true))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.base.settype, SetType::Subscan);
    assert_eq!(dataset.subsets.len(), 2);
    assert_eq!(ctx.stack_settypes(), vec![SetType::Block]);
    let block = ctx.finish_block().unwrap();
    assert_eq!(block.subsets.len(), 1);
    assert_eq!(block.subsets[0].base.settype, SetType::Subscan);
}

struct StopAt {
    ctx: Arc<AcquisitionContext>,
    point: usize,
}

#[async_trait]
impl ScanHooks for StopAt {
    async fn prepare_point(&self, num: usize, _targets: &[Value]) -> anyhow::Result<()> {
        if num == self.point {
            self.ctx.request_stop();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_request_interrupts_counting() {
    let dir = tempdir().unwrap();
    let det = Arc::new(MockDetector::new("det").with_polls(5));
    let ctx = Arc::new(context(&dir, det.clone()));
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 5))
        .hooks(Arc::new(StopAt {
            ctx: Arc::clone(&ctx),
            point: 2,
        }))
        .build(&ctx)
        .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 2);
    assert!(dataset.base.is_finished());
    assert!(det.was_stopped());
    assert_eq!(det.start_count(), 2);

    ctx.clear_stop();
    assert!(!ctx.stop_requested());
}

// =============================================================================
// Other scan kinds
// =============================================================================

#[tokio::test]
async fn test_sweep_counts_while_device_is_busy() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x").with_busy_polls(3));

    let sweep = SweepScan::builder(vec![motor], vec![Value::Number(3.0)], -1)
        .build(&ctx)
        .unwrap();
    let dataset = sweep.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 3);
    let names: Vec<&str> = dataset.base.environment.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["x", "T"]);
    let xs: Vec<Value> = dataset.envvaluelists.iter().map(|row| row[0].clone()).collect();
    assert_eq!(xs, vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
}

#[tokio::test]
async fn test_sweep_skips_first_point_when_start_not_reached() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> = Arc::new(
        MockMotor::new("x")
            .with_busy_polls(3)
            .fail_at(0.0, DeviceErrorKind::Limit),
    );

    let sweep = SweepScan::builder(vec![motor], vec![Value::Number(3.0)], -1)
        .starts(vec![Value::Number(0.0)])
        .build(&ctx)
        .unwrap();
    let dataset = sweep.run(&ctx).await.unwrap().unwrap();

    let xs: Vec<Value> = dataset.envvaluelists.iter().map(|row| row[0].clone()).collect();
    assert_eq!(xs, vec![Value::Number(2.0), Value::Number(3.0)]);
}

#[tokio::test]
async fn test_sweep_minstep_spaces_points() {
    let dir = tempdir().unwrap();
    let ctx = AcquisitionContext::builder().data_root(dir.path()).build();
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x").with_busy_polls(8));

    let sweep = SweepScan::builder(vec![motor], vec![Value::Number(8.0)], -1)
        .options(ScanOptions::new().detectors(vec![]).preset("minstep", 3.0))
        .build(&ctx)
        .unwrap();
    let dataset = sweep.run(&ctx).await.unwrap().unwrap();

    let xs: Vec<Value> = dataset.envvaluelists.iter().map(|row| row[0].clone()).collect();
    // The last point is taken when the sweep ends, however short the step.
    assert_eq!(
        xs,
        vec![Value::Number(1.0), Value::Number(4.0), Value::Number(7.0), Value::Number(8.0)]
    );
}

#[tokio::test]
async fn test_continuous_scan_goes_on_when_start_not_reached() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor: Arc<dyn Device> = Arc::new(
        MockMotor::new("x")
            .with_busy_polls(2)
            .fail_at(0.0, DeviceErrorKind::Limit),
    );

    let scan = ContinuousScan::new(
        motor,
        Value::Number(0.0),
        Value::Number(4.0),
        1.0,
        Duration::from_millis(1),
        ScanOptions::new(),
        &ctx,
    )
    .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    assert_eq!(dataset.subsets.len(), 3);
}

#[tokio::test]
async fn test_continuous_scan_delta_survives_failed_readout() {
    let dir = tempdir().unwrap();
    let readings = (0..8)
        .map(|i| DetectorResult {
            scalars: vec![Value::Number(i as f64), Value::Number(10.0 * i as f64)],
            arrays: Vec::new(),
        })
        .collect();
    // Baseline and the first tick succeed, the second tick's readout fails.
    let det = Arc::new(
        MockDetector::new("det")
            .with_readings(readings)
            .fail_readout_after(2, DeviceErrorKind::Communication),
    );
    let ctx = context(&dir, det);
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x").with_busy_polls(4));

    let scan = ContinuousScan::new(
        motor,
        Value::Number(0.0),
        Value::Number(8.0),
        1.0,
        Duration::from_millis(1),
        ScanOptions::new(),
        &ctx,
    )
    .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    let counts: Vec<Value> = dataset.detvaluelists.iter().map(|row| row[1].clone()).collect();
    assert_eq!(
        counts,
        vec![
            Value::Number(10.0),
            Value::Missing,
            Value::Number(20.0),
            Value::Number(10.0),
            Value::Number(10.0),
        ]
    );
}

#[tokio::test]
async fn test_continuous_scan_stores_count_deltas() {
    let dir = tempdir().unwrap();
    let reading = |counts: f64| DetectorResult {
        scalars: vec![Value::Number(counts / 10.0), Value::Number(counts)],
        arrays: Vec::new(),
    };
    let det = Arc::new(MockDetector::new("det").with_readings(vec![
        reading(0.0),
        reading(40.0),
        reading(100.0),
    ]));
    let ctx = context(&dir, det);
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x").with_busy_polls(2));

    let scan = ContinuousScan::new(
        motor,
        Value::Number(0.0),
        Value::Number(4.0),
        1.0,
        Duration::from_millis(2),
        ScanOptions::new(),
        &ctx,
    )
    .unwrap();
    let dataset = scan.run(&ctx).await.unwrap().unwrap();

    let xs: Vec<Value> = dataset.devvaluelists.iter().map(|row| row[0].clone()).collect();
    assert_eq!(xs, vec![Value::Number(1.0), Value::Number(3.0), Value::Number(4.0)]);
    let counts: Vec<Value> = dataset.detvaluelists.iter().map(|row| row[1].clone()).collect();
    assert_eq!(counts, vec![Value::Number(40.0), Value::Number(60.0), Value::Number(0.0)]);
}

#[tokio::test]
async fn test_manual_scan_inside_block() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let motor = Arc::new(MockMotor::new("x"));

    ctx.begin_block(BlockParams::default()).unwrap();
    let scan = ManualScan::new(vec![motor.clone() as Arc<dyn Device>], ScanOptions::new(), &ctx).unwrap();
    scan.manual_begin(&ctx).await.unwrap();
    for target in [0.5, 1.5] {
        motor.start(&Value::Number(target)).await.unwrap();
        motor.wait().await.unwrap();
        let results = scan.step(&ctx, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(ctx.stack_settypes(), vec![SetType::Block, SetType::Scan]);
    }
    let dataset = scan.manual_end(&ctx).unwrap();
    let block = ctx.finish_block().unwrap();

    assert_eq!(dataset.devvaluelists, vec![vec![Value::Number(0.5)], vec![Value::Number(1.5)]]);
    assert_eq!(block.subsets.len(), 1);
    assert_eq!(block.subsets[0].base.uid, dataset.base.uid);
    assert_eq!(dataset.base.number, 1);
}

#[tokio::test]
#[traced_test]
async fn test_manual_scan_reports_incomplete_first_moves() {
    let dir = tempdir().unwrap();
    let ctx = context(&dir, Arc::new(MockDetector::new("det")));
    let slit: Arc<dyn Device> =
        Arc::new(MockMotor::new("slit").fail_at(9.0, DeviceErrorKind::Limit));

    let scan = ManualScan::new(
        vec![],
        ScanOptions::new().first_move(slit, Value::Number(9.0)),
        &ctx,
    )
    .unwrap();
    scan.manual_begin(&ctx).await.unwrap();
    assert_eq!(scan.step(&ctx, None).await.unwrap().len(), 1);
    scan.manual_end(&ctx).unwrap();

    assert!(logs_contain("First moves of manual scan incomplete"));
}

// =============================================================================
// Counters and history
// =============================================================================

#[tokio::test]
async fn test_scan_counters_persist_across_contexts() {
    let dir = tempdir().unwrap();
    let run_one = |ctx: AcquisitionContext| async move {
        let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));
        let scan = Scan::builder(vec![motor], line_positions(&[0.0], &[1.0], 2))
            .options(ScanOptions::new().detectors(vec![]))
            .build(&ctx)
            .unwrap();
        scan.run(&ctx).await.unwrap().unwrap().base.counter
    };

    let first = run_one(AcquisitionContext::builder().data_root(dir.path()).build()).await;
    let second = run_one(AcquisitionContext::builder().data_root(dir.path()).build()).await;

    assert_eq!(first, 1);
    assert_eq!(second, 2);
    let json = std::fs::read_to_string(dir.path().join("counters.json")).unwrap();
    let stored: HashMap<String, u64> = serde_json::from_str(&json).unwrap();
    assert_eq!(stored["scan"], 2);
    assert_eq!(stored["point"], 4);
}

#[tokio::test]
async fn test_history_keeps_latest_scans() {
    let dir = tempdir().unwrap();
    let ctx = AcquisitionContext::builder()
        .data_root(dir.path())
        .history_size(2)
        .build();
    let motor: Arc<dyn Device> = Arc::new(MockMotor::new("x"));

    for i in 0..3 {
        let scan = Scan::builder(vec![Arc::clone(&motor)], line_positions(&[i as f64], &[1.0], 1))
            .options(ScanOptions::new().detectors(vec![]))
            .build(&ctx)
            .unwrap();
        scan.run(&ctx).await.unwrap();
    }

    let history = ctx.last_scans(5);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].base.counter, 2);
    assert_eq!(history[1].base.counter, 3);
}

#[tokio::test]
async fn test_stop_request_before_step_records_nothing() {
    let dir = tempdir().unwrap();
    let det = Arc::new(MockDetector::new("det").with_polls(3));
    let ctx = context(&dir, det);
    ctx.request_stop();

    let scan = ManualScan::new(vec![], ScanOptions::new(), &ctx).unwrap();
    scan.manual_begin(&ctx).await.unwrap();
    assert!(scan.step(&ctx, None).await.unwrap().is_empty());
    let dataset = scan.manual_end(&ctx).unwrap();
    assert!(dataset.subsets.is_empty());
    assert!(dataset.base.is_finished());
}
