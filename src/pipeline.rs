//! Per-frame face processing.
//!
//! A frame goes through detection, normalization and then, face by face,
//! restoration, analysis and persistence. Failures are contained at the
//! smallest unit: a failed detection skips the frame, a failed face skips
//! only that face.

use crate::analysis::{Demographics, DemographicsAnalyzer, create_analyzer};
use crate::bridge::ScratchImage;
use crate::config::RunConfig;
use crate::detector::{FaceDetector, ImageInput, InputKind, create_detector};
use crate::error::{ExtractError, ExtractResult};
use crate::normalize::{DetectedFace, normalize_all};
use crate::persist::{VideoOutput, write_image, write_json};
use crate::record::FaceRecord;
use crate::restore::{FaceRestorer, RestoreOutput, create_restorer, restore_input};
use crate::video::Frame;
use anyhow::Result;
use image::RgbImage;
use log::{debug, error, warn};

/// The model collaborators of a run, built once and reused for every frame.
pub struct ModelSet {
    pub detector: Box<dyn FaceDetector>,
    pub restorer: Option<Box<dyn FaceRestorer>>,
    pub analyzer: Option<Box<dyn DemographicsAnalyzer>>,
}

impl ModelSet {
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self {
            detector,
            restorer: None,
            analyzer: None,
        }
    }

    pub fn with_restorer(mut self, restorer: Box<dyn FaceRestorer>) -> Self {
        self.restorer = Some(restorer);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Box<dyn DemographicsAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Builds the collaborators enabled in `config`.
    pub fn from_config(config: &RunConfig) -> ExtractResult<Self> {
        let detector =
            create_detector(&config.detector_spec()).map_err(|e| ExtractError::ModelInit {
                model: "detector",
                reason: format!("{:#}", e),
            })?;
        let mut models = Self::new(detector);

        if config.enable_restoration {
            let restorer =
                create_restorer(&config.restorer_spec()).map_err(|e| ExtractError::ModelInit {
                    model: "restorer",
                    reason: format!("{:#}", e),
                })?;
            models = models.with_restorer(restorer);
        }

        if config.enable_analysis {
            let analyzer =
                create_analyzer(config.analyzer_program.clone(), config.scratch_dir.clone())
                    .map_err(|e| ExtractError::ModelInit {
                        model: "analyzer",
                        reason: format!("{:#}", e),
                    })?;
            models = models.with_analyzer(analyzer);
        }

        Ok(models)
    }
}

/// What happened to one sampled frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub faces_detected: usize,
    pub faces_failed: usize,
    pub detection_failed: bool,
    pub records: Vec<FaceRecord>,
}

/// Runs sampled frames of one video through the models and onto disk.
pub struct FacePipeline<'a> {
    models: &'a mut ModelSet,
    config: &'a RunConfig,
    output: &'a VideoOutput,
}

impl<'a> FacePipeline<'a> {
    pub fn new(models: &'a mut ModelSet, config: &'a RunConfig, output: &'a VideoOutput) -> Self {
        Self {
            models,
            config,
            output,
        }
    }

    pub fn process_frame(&mut self, frame: &Frame) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();

        if self.config.save_frames {
            if let Some(path) = self.output.frame_image(frame.index) {
                if let Err(err) = write_image(&path, &frame.image) {
                    error!(
                        "{}: frame {}: {}",
                        self.output.root().display(),
                        frame.index,
                        err
                    );
                }
            }
        }

        let faces = match self.detect(frame) {
            Ok(faces) => faces,
            Err(err) => {
                error!("{}: {}", self.output.root().display(), err);
                outcome.detection_failed = true;
                return outcome;
            }
        };
        outcome.faces_detected = faces.len();
        debug!("Frame {}: {} face(s)", frame.index, faces.len());

        for face in &faces {
            match self.process_face(frame, face) {
                Ok(record) => outcome.records.push(record),
                Err(err) => {
                    error!("{}: {}", self.output.root().display(), err);
                    outcome.faces_failed += 1;
                }
            }
        }

        outcome
    }

    fn detect(&mut self, frame: &Frame) -> ExtractResult<Vec<DetectedFace>> {
        let detection_err = |err: anyhow::Error| ExtractError::Detection {
            frame: frame.index,
            reason: format!("{:#}", err),
        };
        let retries = self.config.inference_retries;
        let detector = &mut self.models.detector;
        let order = detector.channel_order();

        let raw = match detector.input_kind() {
            InputKind::Buffer => with_retries(retries, "detection", || {
                detector.detect(ImageInput::Buffer(&frame.image))
            }),
            InputKind::Path => {
                // Removed when `scratch` drops, including on error.
                let scratch = ScratchImage::write(
                    &self.config.scratch_dir,
                    &format!("frame_{:05}", frame.index),
                    &frame.image,
                )
                .map_err(detection_err)?;
                let input = ImageInput::Path {
                    path: scratch.path(),
                    image: &frame.image,
                };
                with_retries(retries, "detection", || detector.detect(input))
            }
        }
        .map_err(detection_err)?;

        Ok(normalize_all(raw, order, frame.index))
    }

    fn process_face(&mut self, frame: &Frame, face: &DetectedFace) -> ExtractResult<FaceRecord> {
        let (frame_idx, face_idx) = (frame.index, face.face_index);
        let retries = self.config.inference_retries;

        let restored = match self.models.restorer.as_mut() {
            Some(restorer) => {
                let input = restore_input(self.config.restore_source, &face.image, &frame.image);
                match with_retries(retries, "restoration", || restorer.restore(&input)) {
                    Ok(output) => Some(output),
                    Err(err) => {
                        warn!(
                            "Restoration failed for face {} of frame {}: {:#}",
                            face_idx, frame_idx, err
                        );
                        None
                    }
                }
            }
            None => None,
        };
        let restored_face = restored.as_ref().and_then(|r| r.faces.first());
        if restored.is_some() && restored_face.is_none() {
            debug!(
                "Restorer returned no face for face {} of frame {}",
                face_idx, frame_idx
            );
        }

        let demographics = match self.models.analyzer.as_mut() {
            Some(analyzer) => {
                let best = restored_face.unwrap_or(&face.image);
                analyze(&mut **analyzer, best, retries, frame_idx, face_idx)
            }
            None => None,
        };

        self.persist_face(frame_idx, face, restored.as_ref())
            .map_err(|err| ExtractError::face(frame_idx, face_idx, err))?;

        let record = FaceRecord::new(frame_idx, face, demographics);
        if let Some(path) = self.output.face_sidecar(frame_idx, face_idx) {
            write_json(&path, &record.sidecar())
                .map_err(|err| ExtractError::face(frame_idx, face_idx, err))?;
        }

        Ok(record)
    }

    fn persist_face(
        &self,
        frame: usize,
        face: &DetectedFace,
        restored: Option<&RestoreOutput>,
    ) -> ExtractResult<()> {
        let idx = face.face_index;
        write_image(&self.output.face_image(frame, idx), &face.image)?;

        if self.models.restorer.is_none() {
            return Ok(());
        }
        if let Some(path) = self.output.original_face_image(frame, idx) {
            write_image(&path, &face.image)?;
        }
        let Some(restored) = restored else {
            return Ok(());
        };
        if let Some(image) = restored.faces.first() {
            write_image(&self.output.restored_face_image(frame, idx), image)?;
        }
        if let (Some(image), Some(path)) = (
            restored.full_image.as_ref(),
            self.output.restored_full_image(frame, idx),
        ) {
            write_image(&path, image)?;
        }
        Ok(())
    }
}

fn analyze(
    analyzer: &mut dyn DemographicsAnalyzer,
    image: &RgbImage,
    retries: u32,
    frame: usize,
    face: usize,
) -> Option<Demographics> {
    match with_retries(retries, "analysis", || analyzer.analyze(image)) {
        Ok(demographics) => demographics,
        Err(err) => {
            warn!(
                "Demographic analysis failed for face {} of frame {}: {:#}",
                face, frame, err
            );
            None
        }
    }
}

/// Calls `call` up to `retries + 1` times, returning the first success.
pub fn with_retries<T>(retries: u32, what: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!(
                    "{} failed (attempt {}/{}): {:#}",
                    what,
                    attempt,
                    retries + 1,
                    err
                );
            }
            Err(err) => return Err(err),
        }
    }
}
