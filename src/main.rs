use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use video_face_extract::bridge::ExternalTool;
use video_face_extract::config::{DEFAULT_RESTORE_FRAME_SIZE, timestamped_dir};
use video_face_extract::restore::RestoreSource;
use video_face_extract::{
    CancelToken, Layout, ModelSet, RunConfig, VideoOutput, discover_dataset, open_video,
    process_dataset, process_video,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Extract faces from videos with optional restoration and demographic analysis")]
struct Cli {
    #[clap(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Process every video of a dataset laid out as <class>/<video>.{mp4,avi}
    Dataset {
        /// Root directory with one sub-directory per class
        #[clap(short, long, value_parser)]
        dataset_dir: PathBuf,

        /// Output directory, mirrored as <class>/<video name>
        #[clap(short, long, value_parser, default_value = "faces_detected")]
        output_dir: PathBuf,

        #[clap(flatten)]
        options: RunOptions,
    },
    /// Process a single video
    Video {
        /// Video file to process
        #[clap(value_parser)]
        video: PathBuf,

        /// Output directory for the video's artifacts
        #[clap(short, long, value_parser, default_value = "faces_detected")]
        output_dir: PathBuf,

        #[clap(flatten)]
        options: RunOptions,
    },
}

#[derive(clap::Args, Debug)]
struct RunOptions {
    /// Process 1 frame every N frames
    #[clap(short = 'n', long, default_value = "30")]
    frame_interval: usize,

    /// Output layout (defaults to batch for datasets, frame-dirs for single videos)
    #[clap(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Do not keep frame.png in the frame-dirs layout
    #[clap(long)]
    no_frames: bool,

    /// Write into a run-<timestamp> sub-directory of the output directory
    #[clap(long)]
    timestamped: bool,

    /// Face detector to use (rustface, command)
    #[clap(long, default_value = "rustface")]
    detector: String,

    /// Program run by the command detector
    #[clap(long, value_parser)]
    detector_program: Option<PathBuf>,

    /// Extra argument for the detector program (repeatable)
    #[clap(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// Optional detector-specific parameters (JSON string)
    #[clap(long, default_value = "")]
    detector_params: String,

    /// SeetaFace model file for the rustface detector
    #[clap(long, value_parser)]
    model_path: Option<PathBuf>,

    /// Restore each face before saving it
    #[clap(long)]
    restore: bool,

    /// Restoration backend (lanczos, command)
    #[clap(long, default_value = "lanczos")]
    restorer: String,

    /// Program run by the command restorer
    #[clap(long, value_parser)]
    restorer_program: Option<PathBuf>,

    /// Extra argument for the restorer program (repeatable)
    #[clap(long = "restorer-arg", allow_hyphen_values = true)]
    restorer_args: Vec<String>,

    /// What the restorer receives: the face crop or the resized frame
    #[clap(long, value_enum, default_value = "face")]
    restore_source: RestoreSourceArg,

    /// Side of the square the frame is resized to with --restore-source frame
    #[clap(long, default_value_t = DEFAULT_RESTORE_FRAME_SIZE)]
    restore_frame_size: u32,

    /// Restoration upscale factor
    #[clap(long, default_value = "4")]
    upscale: f32,

    /// Estimate age, gender and race for each face
    #[clap(long)]
    analyze: bool,

    /// Program run to estimate demographics
    #[clap(long, value_parser)]
    analyzer_program: Option<PathBuf>,

    /// Extra argument for the analyzer program (repeatable)
    #[clap(long = "analyzer-arg", allow_hyphen_values = true)]
    analyzer_args: Vec<String>,

    /// Stop each video after this many frames
    #[clap(long)]
    max_frames: Option<usize>,

    /// Give up on a video after this many seconds
    #[clap(long)]
    video_timeout_secs: Option<u64>,

    /// Stop starting new videos after this many seconds
    #[clap(long)]
    max_runtime_secs: Option<u64>,

    /// Extra attempts for a failed model call
    #[clap(long, default_value = "1")]
    inference_retries: u32,

    /// Number of videos processed in parallel
    #[clap(short, long, default_value = "1")]
    jobs: usize,

    /// Skip videos whose output already has a run_stats.json
    #[clap(long)]
    skip_completed: bool,

    /// Directory for temporary files handed to external programs
    #[clap(long, value_parser)]
    scratch_dir: Option<PathBuf>,

    /// Hide progress bars
    #[clap(long)]
    no_progress: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LayoutArg {
    Batch,
    FrameDirs,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RestoreSourceArg {
    Face,
    Frame,
}

fn tool(program: &Option<PathBuf>, args: &[String]) -> Option<ExternalTool> {
    program
        .as_ref()
        .map(|p| ExternalTool::new(p).with_args(args.iter().cloned()))
}

impl RunOptions {
    fn to_config(&self, default_layout: Layout) -> RunConfig {
        let layout = match self.layout {
            Some(LayoutArg::Batch) => Layout::Batch,
            Some(LayoutArg::FrameDirs) => Layout::FrameDirs,
            None => default_layout,
        };
        let restore_source = match self.restore_source {
            RestoreSourceArg::Face => RestoreSource::Face,
            RestoreSourceArg::Frame => RestoreSource::Frame {
                size: self.restore_frame_size,
            },
        };

        RunConfig {
            frame_interval: self.frame_interval,
            layout,
            save_frames: layout == Layout::FrameDirs && !self.no_frames,
            detector_backend: self.detector.clone(),
            detector_program: tool(&self.detector_program, &self.detector_args),
            detector_params: Some(self.detector_params.clone()).filter(|p| !p.is_empty()),
            model_path: self.model_path.clone(),
            enable_restoration: self.restore,
            restorer_backend: self.restorer.clone(),
            restorer_program: tool(&self.restorer_program, &self.restorer_args),
            restore_source,
            upscale_factor: self.upscale,
            enable_analysis: self.analyze,
            analyzer_program: tool(&self.analyzer_program, &self.analyzer_args),
            max_frames: self.max_frames,
            video_timeout: self.video_timeout_secs.map(Duration::from_secs),
            inference_retries: self.inference_retries,
            jobs: self.jobs,
            skip_completed: self.skip_completed,
            show_progress: !self.no_progress,
            scratch_dir: self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    fn cancel_token(&self) -> CancelToken {
        match self.max_runtime_secs {
            Some(secs) => CancelToken::with_deadline(Instant::now() + Duration::from_secs(secs)),
            None => CancelToken::new(),
        }
    }

    fn output_root(&self, output_dir: PathBuf) -> PathBuf {
        if self.timestamped {
            timestamped_dir(&output_dir, chrono::Local::now())
        } else {
            output_dir
        }
    }
}

fn run_dataset(dataset_dir: PathBuf, output_dir: PathBuf, options: RunOptions) -> Result<()> {
    let config = options.to_config(Layout::Batch);
    config.validate()?;
    let output_root = options.output_root(output_dir);

    info!("Scanning dataset directory for videos: {:?}", dataset_dir);
    let jobs = discover_dataset(&dataset_dir, &output_root, config.layout)?;
    info!("Found {} videos", jobs.len());

    if jobs.is_empty() {
        warn!("No videos found in dataset directory");
        return Ok(());
    }

    let report = process_dataset(
        &jobs,
        &config,
        open_video,
        || ModelSet::from_config(&config),
        &options.cancel_token(),
    )?;

    for (video, reason) in &report.failures {
        error!("Failed: {:?}: {}", video, reason);
    }
    info!(
        "Finished processing. Extracted {} faces from {} videos into {:?}",
        report.totals.faces_saved, report.videos_processed, output_root
    );

    Ok(())
}

fn run_video(video: PathBuf, output_dir: PathBuf, options: RunOptions) -> Result<()> {
    let config = options.to_config(Layout::FrameDirs);
    config.validate()?;
    let output = VideoOutput::new(options.output_root(output_dir), config.layout);

    info!("Initializing models (detector: {})", config.detector_backend);
    let mut models = ModelSet::from_config(&config).context("Failed to initialize models")?;

    let mut source = open_video(&video)?;
    let stats = process_video(
        source.as_mut(),
        &output,
        &mut models,
        &config,
        &options.cancel_token(),
    )
    .with_context(|| format!("Failed to process {:?}", video))?;

    info!(
        "Finished processing. Extracted {} faces in {:.2} seconds into {:?}",
        stats.faces_saved,
        stats.elapsed_seconds,
        output.root()
    );

    Ok(())
}

/// Main program logic
fn run(cli: Cli) -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match cli.command {
        Mode::Dataset {
            dataset_dir,
            output_dir,
            options,
        } => run_dataset(dataset_dir, output_dir, options),
        Mode::Video {
            video,
            output_dir,
            options,
        } => run_video(video, output_dir, options),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}
