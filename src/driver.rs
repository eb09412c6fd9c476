//! Walking a dataset and processing its videos.

use crate::config::RunConfig;
use crate::error::{ExtractError, ExtractResult};
use crate::persist::{Layout, VideoOutput, ensure_dir, write_json};
use crate::pipeline::{FacePipeline, ModelSet};
use crate::record::FaceRecord;
use crate::sampler::FrameSampler;
use crate::stats::{BatchReport, RunStats, VideoSummary};
use crate::video::FrameSource;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use walkdir::WalkDir;

/// Extensions of the files treated as videos in a class directory.
pub const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "avi"];

/// Shared stop signal, optionally tied to a wall-clock deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// One video of a dataset and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJob {
    pub class_name: String,
    pub video: PathBuf,
    pub output: VideoOutput,
}

/// Lists `root/<class>/<video>.{mp4,avi}` in lexicographic order.
pub fn discover_dataset(
    root: &Path,
    output_root: &Path,
    layout: Layout,
) -> ExtractResult<Vec<VideoJob>> {
    if !root.is_dir() {
        return Err(ExtractError::Config(format!(
            "dataset directory {:?} does not exist",
            root
        )));
    }

    let mut jobs = Vec::new();
    let classes = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Skipping unreadable dataset entry: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_dir());

    for class in classes {
        let class_name = class.file_name().to_string_lossy().into_owned();
        let videos = WalkDir::new(class.path())
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && is_video(e.path()));

        for video in videos {
            let stem = video
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            jobs.push(VideoJob {
                class_name: class_name.clone(),
                video: video.path().to_path_buf(),
                output: VideoOutput::new(output_root.join(&class_name).join(stem), layout),
            });
        }
    }

    Ok(jobs)
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Processes one opened video into `output`.
///
/// The source is closed before returning, whatever the outcome. The output
/// directory is complete once `run_stats.json` exists; an error leaves it
/// without one.
pub fn process_video(
    source: &mut dyn FrameSource,
    output: &VideoOutput,
    models: &mut ModelSet,
    config: &RunConfig,
    cancel: &CancelToken,
) -> ExtractResult<RunStats> {
    run_video(source, output, models, config, cancel, None)
}

fn run_video(
    source: &mut dyn FrameSource,
    output: &VideoOutput,
    models: &mut ModelSet,
    config: &RunConfig,
    cancel: &CancelToken,
    bars: Option<&MultiProgress>,
) -> ExtractResult<RunStats> {
    let result = run_frames(source, output, models, config, cancel, bars);
    source.close();
    result
}

fn run_frames(
    source: &mut dyn FrameSource,
    output: &VideoOutput,
    models: &mut ModelSet,
    config: &RunConfig,
    cancel: &CancelToken,
    bars: Option<&MultiProgress>,
) -> ExtractResult<RunStats> {
    let meta = source.metadata().clone();
    let name = meta
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| meta.path.display().to_string());

    info!("Processing video: {}", name);
    info!(
        "Total frames: {}",
        meta.total_frames
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    info!("FPS: {:.2}", meta.fps);
    info!("Resolution: {}x{}", meta.width, meta.height);

    ensure_dir(output.root())?;
    // A marker from an earlier run must not outlive a failure of this one.
    if output.is_complete() {
        std::fs::remove_file(output.run_stats())
            .map_err(|e| ExtractError::persistence(output.run_stats(), e))?;
    }

    let start_time = Instant::now();
    let deadline = config.video_timeout.map(|t| start_time + t);
    let sampler = FrameSampler::new(config.frame_interval);
    let progress = progress_bar(meta.total_frames, config.show_progress, bars);
    let mut pipeline = FacePipeline::new(models, config, output);
    let mut stats = RunStats::default();
    let mut records: Vec<FaceRecord> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            progress.abandon();
            return Err(ExtractError::Cancelled(meta.path.clone()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            progress.abandon();
            return Err(ExtractError::DeadlineExceeded {
                path: meta.path.clone(),
                seconds: config.video_timeout.map_or(0, |t| t.as_secs()),
            });
        }
        if config.max_frames.is_some_and(|max| stats.frames_processed >= max) {
            info!("Stopping {} after {} frames", name, stats.frames_processed);
            break;
        }

        let Some(frame) = source.read_next()? else {
            break;
        };

        if sampler.should_process(frame.index) {
            stats.frames_sampled += 1;
            let outcome = pipeline.process_frame(&frame);
            stats.faces_detected += outcome.faces_detected;
            stats.faces_failed += outcome.faces_failed;
            stats.faces_saved += outcome.records.len();
            if outcome.detection_failed {
                stats.detection_failures += 1;
            }
            records.extend(outcome.records);
        }

        stats.frames_processed += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    if let Some(path) = output.faces_info() {
        write_json(&path, &records)?;
    }

    stats.elapsed_seconds = start_time.elapsed().as_secs_f64();
    let summary = VideoSummary {
        video: meta.path.clone(),
        total_frames: meta.total_frames,
        fps: meta.fps,
        width: meta.width,
        height: meta.height,
        frame_interval: sampler.interval(),
        stats: stats.clone(),
    };
    write_json(&output.run_stats(), &summary)?;

    info!(
        "Finished {}: {} frames, {} faces detected, {} saved in {:.2} seconds ({:.2} frames/sec)",
        name,
        stats.frames_processed,
        stats.faces_detected,
        stats.faces_saved,
        stats.elapsed_seconds,
        stats.frames_per_second()
    );

    Ok(stats)
}

/// A frame progress bar, drawn under `bars` when several videos run at once.
fn progress_bar(total: Option<u64>, visible: bool, bars: Option<&MultiProgress>) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = match total {
        Some(len) if len > 0 => {
            let bar = ProgressBar::new(len);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Processing frames [{bar:40.cyan/blue}] {pos}/{len} [{elapsed_precise}<{eta}]")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            bar
        }
        _ => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} Processing frames... [{elapsed_precise}] {pos} frames")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar
        }
    };
    match bars {
        Some(bars) => bars.add(bar),
        None => bar,
    }
}

/// Processes every job, isolating failures per video.
///
/// With `config.jobs > 1` the videos are split round-robin into that many
/// groups that run in parallel, each with its own models. Only model
/// initialization errors abort the batch.
pub fn process_dataset<O, M>(
    jobs: &[VideoJob],
    config: &RunConfig,
    open: O,
    build_models: M,
    cancel: &CancelToken,
) -> ExtractResult<BatchReport>
where
    O: Fn(&Path) -> ExtractResult<Box<dyn FrameSource>> + Sync,
    M: Fn() -> ExtractResult<ModelSet> + Sync,
{
    config.validate()?;
    let start_time = Instant::now();

    let workers = config.jobs.min(jobs.len()).max(1);
    let mut report = if workers == 1 {
        let mut models = build_models()?;
        run_group(jobs.iter(), &mut models, config, &open, cancel, None)
    } else {
        info!("Processing {} videos with {} workers", jobs.len(), workers);
        let bars = MultiProgress::new();
        let groups: Vec<Vec<&VideoJob>> = (0..workers)
            .map(|w| jobs.iter().skip(w).step_by(workers).collect())
            .collect();
        groups
            .into_par_iter()
            .map(|group| -> ExtractResult<BatchReport> {
                let mut models = build_models()?;
                Ok(run_group(
                    group.into_iter(),
                    &mut models,
                    config,
                    &open,
                    cancel,
                    Some(&bars),
                ))
            })
            .collect::<ExtractResult<Vec<BatchReport>>>()?
            .into_iter()
            .fold(BatchReport::default(), |mut acc, r| {
                acc.merge(r);
                acc
            })
    };
    report.totals.elapsed_seconds = start_time.elapsed().as_secs_f64();

    info!(
        "Batch finished: {} videos processed, {} skipped, {} failed, {} frames, {} faces saved in {:.2} seconds",
        report.videos_processed,
        report.videos_skipped,
        report.failures.len(),
        report.totals.frames_processed,
        report.totals.faces_saved,
        report.totals.elapsed_seconds
    );
    if report.cancelled {
        warn!("Batch stopped before all videos were processed");
    }

    Ok(report)
}

fn run_group<'j, O>(
    jobs: impl Iterator<Item = &'j VideoJob>,
    models: &mut ModelSet,
    config: &RunConfig,
    open: &O,
    cancel: &CancelToken,
    bars: Option<&MultiProgress>,
) -> BatchReport
where
    O: Fn(&Path) -> ExtractResult<Box<dyn FrameSource>>,
{
    let mut report = BatchReport::default();

    for job in jobs {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if config.skip_completed && job.output.is_complete() {
            info!("Skipping completed video {:?}", job.video);
            report.videos_skipped += 1;
            continue;
        }

        info!("Class {}: {:?}", job.class_name, job.video);
        let mut source = match open(&job.video) {
            Ok(source) => source,
            Err(err) => {
                error!("{}", err);
                report.record_failure(job.video.clone(), err.to_string());
                continue;
            }
        };

        match run_video(source.as_mut(), &job.output, models, config, cancel, bars) {
            Ok(stats) => report.record_success(&stats),
            Err(err @ ExtractError::Cancelled(_)) => {
                warn!("{}", err);
                report.record_failure(job.video.clone(), err.to_string());
                report.cancelled = true;
                break;
            }
            Err(err) => {
                error!("Video {:?} failed: {}", job.video, err);
                report.record_failure(job.video.clone(), err.to_string());
            }
        }
    }

    report
}
