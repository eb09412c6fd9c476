#![cfg(unix)]

mod common;

use common::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use video_face_extract::bridge::ExternalTool;
use video_face_extract::pipeline::ModelSet;
use video_face_extract::video::{DecoderTools, FfmpegSource, FrameSource};
use video_face_extract::{CancelToken, ExtractError, Layout, VideoOutput, process_video};

const PROBE_JSON: &str =
    r#"{"streams":[{"width":16,"height":12,"avg_frame_rate":"30/1","nb_frames":"2"}]}"#;
const FRAME_BYTES: usize = 16 * 12 * 3;

/// Shell scripts standing in for ffprobe and ffmpeg, run through `sh`.
fn fake_tools(dir: &Path, ffmpeg_body: &str) -> DecoderTools {
    let ffprobe = dir.join("ffprobe.sh");
    fs::write(&ffprobe, format!("printf '%s' '{}'\n", PROBE_JSON)).unwrap();
    let ffmpeg = dir.join("ffmpeg.sh");
    fs::write(&ffmpeg, format!("{}\n", ffmpeg_body)).unwrap();

    DecoderTools {
        ffprobe: script(&ffprobe),
        ffmpeg: script(&ffmpeg),
    }
}

fn script(path: &Path) -> ExternalTool {
    ExternalTool::new("sh").with_args([path.to_string_lossy().into_owned()])
}

fn video_file(dir: &Path) -> PathBuf {
    let path = dir.join("Robbery034_x264.mp4");
    fs::write(&path, b"not really a video").unwrap();
    path
}

#[test]
fn clean_exit_ends_the_stream() {
    let dir = TempDir::new().unwrap();
    let tools = fake_tools(
        dir.path(),
        &format!("head -c {} /dev/zero", FRAME_BYTES * 2),
    );
    let mut source = FfmpegSource::open_with(&video_file(dir.path()), &tools).unwrap();

    assert_eq!(source.metadata().total_frames, Some(2));
    assert_eq!(source.read_next().unwrap().unwrap().index, 0);
    assert_eq!(source.read_next().unwrap().unwrap().index, 1);
    assert!(source.read_next().unwrap().is_none());
    source.close();
}

#[test]
fn failed_decoder_is_a_decode_error_with_stderr() {
    let dir = TempDir::new().unwrap();
    let tools = fake_tools(dir.path(), "echo 'moov atom not found' >&2\nexit 1");
    let mut source = FfmpegSource::open_with(&video_file(dir.path()), &tools).unwrap();

    match source.read_next() {
        Err(ExtractError::Decode { frame, reason, .. }) => {
            assert_eq!(frame, 0);
            assert!(reason.contains("moov atom not found"), "{}", reason);
        }
        other => panic!("expected a decode error, got {:?}", other.map(|f| f.is_some())),
    }
}

#[test]
fn truncated_output_is_a_decode_error() {
    let dir = TempDir::new().unwrap();
    let tools = fake_tools(
        dir.path(),
        &format!("head -c {} /dev/zero", FRAME_BYTES + 10),
    );
    let mut source = FfmpegSource::open_with(&video_file(dir.path()), &tools).unwrap();

    assert!(source.read_next().unwrap().is_some());
    let err = source.read_next().unwrap_err();
    assert!(matches!(err, ExtractError::Decode { frame: 1, .. }));
}

#[test]
fn undecodable_video_is_not_marked_complete() {
    let dir = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let tools = fake_tools(dir.path(), "echo 'Invalid data found' >&2\nexit 1");
    let mut source = FfmpegSource::open_with(&video_file(dir.path()), &tools).unwrap();

    let output = VideoOutput::new(out.path(), Layout::Batch);
    let config = test_config(scratch.path(), Layout::Batch);
    let mut models = ModelSet::new(Box::new(ScriptedDetector::new(vec![])));

    let err = process_video(&mut source, &output, &mut models, &config, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, ExtractError::Decode { .. }));
    assert!(!output.is_complete());
    assert!(!out.path().join("faces_info.json").exists());
}
