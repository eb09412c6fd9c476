use crate::bridge::ExternalTool;
use crate::detector::DetectorSpec;
use crate::error::{ExtractError, ExtractResult};
use crate::persist::Layout;
use crate::restore::{RestoreSource, RestorerSpec};
use crate::sampler::DEFAULT_FRAME_INTERVAL;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UPSCALE: f32 = 4.0;
pub const DEFAULT_RESTORE_FRAME_SIZE: u32 = 512;

/// How each video of a run is processed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Process one frame every `frame_interval` frames.
    pub frame_interval: usize,
    pub layout: Layout,
    /// Keep the full frame as `frame.png` (frame-directory layout only).
    pub save_frames: bool,

    pub detector_backend: String,
    pub detector_program: Option<ExternalTool>,
    /// Backend-specific JSON parameters.
    pub detector_params: Option<String>,
    pub model_path: Option<PathBuf>,

    pub enable_restoration: bool,
    pub restorer_backend: String,
    pub restorer_program: Option<ExternalTool>,
    pub restore_source: RestoreSource,
    pub upscale_factor: f32,

    pub enable_analysis: bool,
    pub analyzer_program: Option<ExternalTool>,

    /// Stop reading a video after this many frames.
    pub max_frames: Option<usize>,
    /// Wall-clock budget per video.
    pub video_timeout: Option<Duration>,
    /// Extra attempts for a failed model call.
    pub inference_retries: u32,
    /// Videos processed concurrently.
    pub jobs: usize,
    /// Leave videos with a `run_stats.json` untouched.
    pub skip_completed: bool,
    pub show_progress: bool,
    /// Where scratch files for path-only collaborators go.
    pub scratch_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            layout: Layout::Batch,
            save_frames: false,
            detector_backend: "rustface".to_string(),
            detector_program: None,
            detector_params: None,
            model_path: None,
            enable_restoration: false,
            restorer_backend: "lanczos".to_string(),
            restorer_program: None,
            restore_source: RestoreSource::Face,
            upscale_factor: DEFAULT_UPSCALE,
            enable_analysis: false,
            analyzer_program: None,
            max_frames: None,
            video_timeout: None,
            inference_retries: 1,
            jobs: 1,
            skip_completed: false,
            show_progress: true,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> ExtractResult<()> {
        if self.frame_interval == 0 {
            return Err(ExtractError::Config(
                "frame interval must be at least 1".to_string(),
            ));
        }
        if self.jobs == 0 {
            return Err(ExtractError::Config("jobs must be at least 1".to_string()));
        }
        if self.enable_restoration && !(self.upscale_factor > 0.0) {
            return Err(ExtractError::Config(format!(
                "upscale factor must be positive, got {}",
                self.upscale_factor
            )));
        }
        if let RestoreSource::Frame { size: 0 } = self.restore_source {
            return Err(ExtractError::Config(
                "restore frame size must be positive".to_string(),
            ));
        }
        if self.detector_backend.eq_ignore_ascii_case("command") && self.detector_program.is_none()
        {
            return Err(ExtractError::Config(
                "the command detector needs --detector-program".to_string(),
            ));
        }
        if self.enable_restoration
            && self.restorer_backend.eq_ignore_ascii_case("command")
            && self.restorer_program.is_none()
        {
            return Err(ExtractError::Config(
                "the command restorer needs --restorer-program".to_string(),
            ));
        }
        if self.enable_analysis && self.analyzer_program.is_none() {
            return Err(ExtractError::Config(
                "analysis needs --analyzer-program".to_string(),
            ));
        }
        if self.max_frames == Some(0) {
            return Err(ExtractError::Config(
                "max frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn detector_spec(&self) -> DetectorSpec {
        DetectorSpec {
            backend: self.detector_backend.clone(),
            model_path: self.model_path.clone(),
            program: self.detector_program.clone(),
            params: self.detector_params.clone(),
        }
    }

    pub fn restorer_spec(&self) -> RestorerSpec {
        RestorerSpec {
            backend: self.restorer_backend.clone(),
            program: self.restorer_program.clone(),
            upscale: self.upscale_factor,
            scratch_dir: self.scratch_dir.clone(),
        }
    }
}

/// `base/run-YYYYmmdd_HHMMSS` for timestamped runs.
pub fn timestamped_dir(base: &Path, now: DateTime<Local>) -> PathBuf {
    base.join(format!("run-{}", now.format("%Y%m%d_%H%M%S")))
}
