mod common;

use common::*;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use video_face_extract::pipeline::ModelSet;
use video_face_extract::video::{FrameSource, MemorySource};
use video_face_extract::{
    CancelToken, ExtractError, ExtractResult, FaceRecord, Layout, RunConfig, discover_dataset,
    process_dataset,
};

/// `Abuse/Abuse001_x264.mp4`, `Robbery/Robbery002_x264.avi` (unreadable) and
/// `Robbery/Robbery034_x264.mp4`.
fn dataset(root: &Path) {
    for (class, file) in [
        ("Abuse", "Abuse001_x264.mp4"),
        ("Robbery", "Robbery002_x264.avi"),
        ("Robbery", "Robbery034_x264.mp4"),
    ] {
        fs::create_dir_all(root.join(class)).unwrap();
        fs::write(root.join(class).join(file), b"").unwrap();
    }
}

fn open_stub(path: &Path) -> ExtractResult<Box<dyn FrameSource>> {
    if path.extension().is_some_and(|e| e == "avi") {
        return Err(ExtractError::SourceOpen {
            path: path.to_path_buf(),
            reason: "moov atom not found".to_string(),
        });
    }
    Ok(Box::new(MemorySource::new(path, numbered_frames(4), 30.0)))
}

fn models() -> ExtractResult<ModelSet> {
    Ok(ModelSet::new(Box::new(ScriptedDetector::new(vec![(
        0,
        vec![face(1), face(2)],
    )]))))
}

fn config(scratch: &Path) -> RunConfig {
    RunConfig {
        frame_interval: 2,
        ..test_config(scratch, Layout::Batch)
    }
}

#[test]
fn unreadable_video_does_not_stop_the_batch() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    dataset(data.path());

    let jobs = discover_dataset(data.path(), out.path(), Layout::Batch).unwrap();
    assert_eq!(jobs.len(), 3);

    let report = process_dataset(
        &jobs,
        &config(scratch.path()),
        open_stub,
        models,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(report.videos_processed, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].0.ends_with("Robbery002_x264.avi"));
    assert!(!report.cancelled);
    assert_eq!(report.totals.frames_processed, 8);
    assert_eq!(report.totals.faces_saved, 4);

    let robbery = out.path().join("Robbery").join("Robbery034_x264");
    assert!(robbery.join("frame_0_face_0.png").is_file());
    assert!(robbery.join("frame_0_face_1.png").is_file());
    let records: Vec<FaceRecord> =
        serde_json::from_str(&fs::read_to_string(robbery.join("faces_info.json")).unwrap())
            .unwrap();
    assert_eq!(records.len(), 2);
    assert!(out.path().join("Abuse").join("Abuse001_x264").join("run_stats.json").is_file());
    assert!(!out.path().join("Robbery").join("Robbery002_x264").exists());
}

#[test]
fn completed_videos_are_skipped() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    dataset(data.path());
    let jobs = discover_dataset(data.path(), out.path(), Layout::Batch).unwrap();

    let mut config = config(scratch.path());
    process_dataset(&jobs, &config, open_stub, models, &CancelToken::new()).unwrap();

    config.skip_completed = true;
    let opened = Arc::new(Mutex::new(Vec::new()));
    let log = opened.clone();
    let report = process_dataset(
        &jobs,
        &config,
        move |path: &Path| {
            log.lock().unwrap().push(path.to_path_buf());
            open_stub(path)
        },
        models,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(report.videos_skipped, 2);
    assert_eq!(report.videos_processed, 0);
    assert_eq!(report.failures.len(), 1);
    let opened = opened.lock().unwrap();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].ends_with("Robbery002_x264.avi"));
}

#[test]
fn cancelled_batch_stops_before_the_next_video() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    dataset(data.path());
    let jobs = discover_dataset(data.path(), out.path(), Layout::Batch).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = process_dataset(&jobs, &config(scratch.path()), open_stub, models, &cancel)
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.videos_processed, 0);
    assert!(!out.path().join("Abuse").exists());
}

#[test]
fn model_failure_aborts_the_batch() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    dataset(data.path());
    let jobs = discover_dataset(data.path(), out.path(), Layout::Batch).unwrap();

    let err = process_dataset(
        &jobs,
        &config(scratch.path()),
        open_stub,
        || {
            Err(ExtractError::ModelInit {
                model: "detector",
                reason: "model file missing".to_string(),
            })
        },
        &CancelToken::new(),
    )
    .unwrap_err();

    assert!(matches!(err, ExtractError::ModelInit { .. }));
}

#[test]
fn parallel_groups_cover_every_video() {
    let data = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    dataset(data.path());
    let jobs = discover_dataset(data.path(), out.path(), Layout::Batch).unwrap();

    let config = RunConfig {
        jobs: 2,
        ..config(scratch.path())
    };
    let report = process_dataset(&jobs, &config, open_stub, models, &CancelToken::new()).unwrap();

    assert_eq!(report.videos_processed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.totals.faces_saved, 4);
    assert!(jobs[0].output.is_complete());
    assert!(!jobs[1].output.is_complete());
    assert!(jobs[2].output.is_complete());
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let scratch = TempDir::new().unwrap();
    let config = RunConfig {
        frame_interval: 0,
        ..config(scratch.path())
    };
    let err = process_dataset(&[], &config, open_stub, models, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, ExtractError::Config(_)));
}
