//! End-to-end runs of the capture pipeline with the synthetic camera.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use fieldcam::config::{BackendKind, BackendSpec};
use fieldcam::pipeline::{CycleOutcome, HealthReport, StatsSnapshot, StatusSink};
use fieldcam::position::nmea::with_checksum;
use fieldcam::storage::{SpaceProbe, SpaceSample};
use fieldcam::tagging::exif;
use fieldcam::{Config, Pipeline, PipelineState};

const GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug)]
struct RoomyProbe;

impl SpaceProbe for RoomyProbe {
    fn sample(&self, _path: &Path) -> io::Result<SpaceSample> {
        Ok(SpaceSample {
            free_bytes: 100 * GB,
            total_bytes: 200 * GB,
        })
    }
}

/// Cancels the run once `target` images have been stored.
#[derive(Debug)]
struct StopAfter {
    persisted: AtomicUsize,
    target: usize,
    cancel: CancellationToken,
}

impl StatusSink for StopAfter {
    fn cycle(&self, _cycle: u64, outcome: &CycleOutcome) {
        if matches!(outcome, CycleOutcome::Persisted { .. })
            && self.persisted.fetch_add(1, Ordering::SeqCst) + 1 >= self.target
        {
            self.cancel.cancel();
        }
    }

    fn health(&self, _report: &HealthReport) {}
}

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = Some(root.to_path_buf());
    config.storage.retention_days = 0;
    config.capture.rate_hz = 10.0;
    config.capture.width = 64;
    config.capture.height = 48;
    config.capture.backends = vec![BackendSpec {
        kind: BackendKind::Synthetic,
        device_index: 0,
    }];
    config.position.port = None;
    config
}

fn burst(now: DateTime<Utc>, satellites: u8) -> String {
    let time = now.format("%H%M%S.00");
    let date = now.format("%d%m%y");
    let rmc = with_checksum(&format!(
        "GPRMC,{time},A,4807.038,N,01131.000,E,022.4,084.4,{date},003.1,W"
    ));
    let gga = with_checksum(&format!(
        "GPGGA,{time},4807.038,N,01131.000,E,1,{satellites:02},0.9,545.4,M,46.9,M,,"
    ));
    format!("{rmc}\r\n{gga}\r\n")
}

/// Run the pipeline until `images` are stored, with an optional position feed.
async fn run_until(root: &Path, images: usize, satellites: Option<u8>) -> StatsSnapshot {
    let mut config = config(root);
    let cancel = CancellationToken::new();

    let port = satellites.map(|satellites| {
        config.position.startup_fix_wait_secs = 5;
        let (mut sensor, port) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            // Stops once the pipeline drops its end
            while sensor
                .write_all(burst(Utc::now(), satellites).as_bytes())
                .await
                .is_ok()
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
        port
    });

    let mut builder = Pipeline::builder(config)
        .space_probe(Box::new(RoomyProbe))
        .status_sink(Arc::new(StopAfter {
            persisted: AtomicUsize::new(0),
            target: images,
            cancel: cancel.clone(),
        }));
    if let Some(port) = port {
        builder = builder.position_stream(Box::new(port));
    }

    tokio::time::timeout(Duration::from_secs(30), builder.build().run(cancel))
        .await
        .expect("pipeline did not stop in time")
        .expect("pipeline failed")
}

fn stored_files(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for session in fs::read_dir(root).unwrap() {
        let session = session.unwrap().path();
        if !session.is_dir() {
            continue;
        }
        for file in fs::read_dir(&session).unwrap() {
            let path = file.unwrap().path();
            if path.extension().is_some_and(|e| e == extension) {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn sidecars(root: &Path) -> Vec<serde_json::Value> {
    stored_files(root, "json")
        .iter()
        .map(|path| serde_json::from_slice(&fs::read(path).unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_images_without_position_carry_fallback_marker() {
    let dir = tempfile::tempdir().unwrap();
    let stats = run_until(dir.path(), 3, None).await;

    assert_eq!(stats.frames_persisted, 3);
    let records = sidecars(dir.path());
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record["fix"], "FALLBACK");
        assert_eq!(record["latitude"], 0.0);
        assert_eq!(record["longitude"], 0.0);
        assert_eq!(record["satellites"], 0);
    }
    assert_eq!(stored_files(dir.path(), "jpg").len(), 3);
}

#[tokio::test]
async fn test_images_with_position_are_geotagged() {
    let dir = tempfile::tempdir().unwrap();
    let stats = run_until(dir.path(), 3, Some(8)).await;

    assert_eq!(stats.frames_persisted, 3);
    assert_eq!(stats.fallback_tags, 0);
    for record in sidecars(dir.path()) {
        assert_eq!(record["fix"], "REAL");
        assert_eq!(record["satellites"], 8);
        assert!((record["latitude"].as_f64().unwrap() - 48.1173).abs() < 1e-3);
    }

    let jpeg = fs::read(&stored_files(dir.path(), "jpg")[0]).unwrap();
    let (lat, lon) = exif::extract(&jpeg).unwrap().coordinates().unwrap();
    assert!((lat - 48.1173).abs() < 1e-3);
    assert!((lon - 11.5167).abs() < 1e-3);
}

#[tokio::test]
async fn test_partial_fix_is_still_real() {
    let dir = tempfile::tempdir().unwrap();
    run_until(dir.path(), 2, Some(2)).await;

    for record in sidecars(dir.path()) {
        assert_eq!(record["fix"], "REAL");
        assert_eq!(record["satellites"], 2);
    }
}

#[tokio::test]
async fn test_sequence_numbers_strictly_increase_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    run_until(dir.path(), 3, None).await;
    run_until(dir.path(), 3, None).await;

    let sequences: Vec<u64> = sidecars(dir.path())
        .iter()
        .map(|r| r["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences.len(), 6);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_monitor_observes_stop() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::builder(config(dir.path()))
        .space_probe(Box::new(RoomyProbe))
        .build();
    let mut monitor = pipeline.monitor();
    let handle = tokio::spawn(pipeline.run(cancel.clone()));

    // No position sensor, so the pipeline runs degraded
    assert_eq!(monitor.wait_for(PipelineState::Degraded).await, PipelineState::Degraded);
    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(monitor.state(), PipelineState::Stopped);
}
