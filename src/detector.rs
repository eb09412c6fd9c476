use crate::bridge::ExternalTool;
use anyhow::{Context, Result, anyhow};
use image::{RgbImage, imageops};
use log::{debug, info, warn};
use rustface::{Detector, ImageData};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location of the SeetaFace frontal model.
pub const DEFAULT_MODEL_PATH: &str = "model/seeta_fd_frontal_v1.0.bin";

const MODEL_URLS: [&str; 2] = [
    "https://github.com/atomashpolskiy/rustface/raw/master/model/seeta_fd_frontal_v1.0.bin",
    "https://raw.githubusercontent.com/atomashpolskiy/rustface/master/model/seeta_fd_frontal_v1.0.bin",
];

/// Channel order of pixel buffers handed back by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Pixel data as a detection backend produced it.
///
/// Buffers are row-major and interleaved. Float buffers may hold either
/// normalized values (0.0-1.0) or 8-bit magnitudes (0.0-255.0).
#[derive(Debug, Clone, PartialEq)]
pub enum FacePixels {
    U8 {
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
    },
    F32 {
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<f32>,
    },
}

impl FacePixels {
    pub fn empty() -> Self {
        Self::U8 {
            width: 0,
            height: 0,
            channels: 3,
            data: Vec::new(),
        }
    }
}

impl From<RgbImage> for FacePixels {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::U8 {
            width,
            height,
            channels: 3,
            data: image.into_raw(),
        }
    }
}

/// One detection in whichever shape the backend returns it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDetection {
    /// Named fields; missing confidence or area fall back to defaults.
    Record {
        face: FacePixels,
        confidence: Option<f64>,
        facial_area: Option<[i32; 4]>,
    },
    /// Image first, auxiliary backend data second.
    Pair(FacePixels, serde_json::Value),
    /// Just the face image.
    Bare(FacePixels),
}

/// How a detector wants its input delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Buffer,
    Path,
}

/// The frame being searched for faces.
#[derive(Debug, Clone, Copy)]
pub enum ImageInput<'a> {
    Buffer(&'a RgbImage),
    /// The frame written to `path`; `image` holds the same pixels.
    Path { path: &'a Path, image: &'a RgbImage },
}

impl<'a> ImageInput<'a> {
    pub fn image(&self) -> &'a RgbImage {
        match *self {
            Self::Buffer(image) => image,
            Self::Path { image, .. } => image,
        }
    }
}

/// Trait for face detector implementations
pub trait FaceDetector {
    fn name(&self) -> &str;

    fn input_kind(&self) -> InputKind {
        InputKind::Buffer
    }

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Detect faces in a frame
    fn detect(&mut self, input: ImageInput<'_>) -> Result<Vec<RawDetection>>;

    /// Optional method to set detector-specific parameters
    fn set_params(&mut self, _params: &str) -> Result<()> {
        // Default implementation does nothing
        Ok(())
    }
}

/// Tuning knobs for the rustface backend, settable as JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RustFaceParams {
    pub min_face_size: u32,
    pub score_thresh: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
    /// Extra margin around each box, as a fraction of its size.
    pub crop_padding: f32,
}

impl Default for RustFaceParams {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
            crop_padding: 0.5,
        }
    }
}

/// RustFace (SeetaFace) detector implementation
pub struct RustFaceDetector {
    detector: Box<dyn Detector>,
    params: RustFaceParams,
}

impl RustFaceDetector {
    pub fn new(model_path: &Path) -> Result<Self> {
        ensure_model(model_path)?;

        let model_str = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Model path is not valid UTF-8: {:?}", model_path))?;
        let detector =
            rustface::create_detector(model_str).context("Failed to create face detector")?;

        let mut this = Self {
            detector,
            params: RustFaceParams::default(),
        };
        this.apply_params();
        Ok(this)
    }

    fn apply_params(&mut self) {
        let p = &self.params;
        self.detector.set_min_face_size(p.min_face_size);
        self.detector.set_score_thresh(p.score_thresh);
        self.detector.set_pyramid_scale_factor(p.pyramid_scale_factor);
        self.detector
            .set_slide_window_step(p.slide_window_step, p.slide_window_step);
    }
}

impl FaceDetector for RustFaceDetector {
    fn name(&self) -> &str {
        "rustface"
    }

    fn detect(&mut self, input: ImageInput<'_>) -> Result<Vec<RawDetection>> {
        let image = input.image();
        let gray_image = imageops::grayscale(image);

        // Convert to rustface ImageData format
        let (width, height) = gray_image.dimensions();
        let mut image_data = ImageData::new(gray_image.as_raw(), width, height);

        let faces = self.detector.detect(&mut image_data);

        let mut result = Vec::with_capacity(faces.len());
        for face in faces {
            let bbox = face.bbox();
            let area = [
                bbox.x() as i32,
                bbox.y() as i32,
                bbox.width() as i32,
                bbox.height() as i32,
            ];

            // An unusable crop still yields a record so it is reported downstream.
            let crop = padded_square_crop(width, height, area, self.params.crop_padding)
                .map(|(x, y, size)| imageops::crop_imm(image, x, y, size, size).to_image());

            result.push(RawDetection::Record {
                face: crop.map(FacePixels::from).unwrap_or_else(FacePixels::empty),
                confidence: Some(face.score()),
                facial_area: Some(area),
            });
        }

        Ok(result)
    }

    fn set_params(&mut self, params: &str) -> Result<()> {
        self.params =
            serde_json::from_str(params).context("Invalid rustface detector parameters")?;
        self.apply_params();
        debug!("rustface parameters: {:?}", self.params);
        Ok(())
    }
}

/// Detection entry printed by an external detector.
#[derive(Debug, Deserialize)]
struct ToolDetection {
    facial_area: AreaRepr,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AreaRepr {
    List([i32; 4]),
    Map { x: i32, y: i32, w: i32, h: i32 },
}

impl AreaRepr {
    fn to_array(&self) -> [i32; 4] {
        match *self {
            Self::List(area) => area,
            Self::Map { x, y, w, h } => [x, y, w, h],
        }
    }
}

/// Detector that runs an external program on the frame file.
///
/// The program receives the image path as its last argument and prints a
/// JSON array of `{"facial_area": [x, y, w, h] | {"x","y","w","h"}, "confidence": f}`.
pub struct CommandDetector {
    tool: ExternalTool,
}

impl CommandDetector {
    pub fn new(tool: ExternalTool) -> Self {
        Self { tool }
    }
}

impl FaceDetector for CommandDetector {
    fn name(&self) -> &str {
        "command"
    }

    fn input_kind(&self) -> InputKind {
        InputKind::Path
    }

    fn detect(&mut self, input: ImageInput<'_>) -> Result<Vec<RawDetection>> {
        let ImageInput::Path { path, image } = input else {
            return Err(anyhow!("command detector needs the frame on disk"));
        };

        let stdout = self.tool.run([path])?;
        let entries: Vec<ToolDetection> =
            serde_json::from_slice(&stdout).context("Detector printed invalid JSON")?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let area = entry.facial_area.to_array();
                let face = clamp_crop(image.width(), image.height(), area)
                    .map(|(x, y, w, h)| imageops::crop_imm(image, x, y, w, h).to_image())
                    .map(FacePixels::from)
                    .unwrap_or_else(FacePixels::empty);
                RawDetection::Record {
                    face,
                    confidence: entry.confidence,
                    facial_area: Some(area),
                }
            })
            .collect())
    }
}

/// Square crop around `area` grown by `padding`, clipped to the image.
///
/// Returns `(x, y, size)`, or `None` when nothing of the box is inside the image.
pub fn padded_square_crop(
    img_width: u32,
    img_height: u32,
    area: [i32; 4],
    padding: f32,
) -> Option<(u32, u32, u32)> {
    let [fx, fy, fw, fh] = area;
    let padding_w = (fw as f32 * padding) as i32;
    let padding_h = (fh as f32 * padding) as i32;

    let x = (fx - padding_w / 2).max(0);
    let y = (fy - padding_h / 2).max(0);
    let width = (fw + padding_w).min(img_width as i32 - x);
    let height = (fh + padding_h).min(img_height as i32 - y);

    if width <= 0 || height <= 0 {
        return None;
    }

    // Get square crop (use the smaller dimension)
    let size = width.min(height);
    let x_center = x + width / 2;
    let y_center = y + height / 2;
    let x_crop = (x_center - size / 2).max(0);
    let y_crop = (y_center - size / 2).max(0);

    Some((x_crop as u32, y_crop as u32, size as u32))
}

/// `area` clipped to the image, as `(x, y, w, h)`.
fn clamp_crop(img_width: u32, img_height: u32, area: [i32; 4]) -> Option<(u32, u32, u32, u32)> {
    let [x, y, w, h] = area;
    let x0 = x.clamp(0, img_width as i32);
    let y0 = y.clamp(0, img_height as i32);
    let x1 = (x.saturating_add(w)).clamp(0, img_width as i32);
    let y1 = (y.saturating_add(h)).clamp(0, img_height as i32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Makes sure the SeetaFace model exists at `model_path`, downloading it if needed.
fn ensure_model(model_path: &Path) -> Result<()> {
    if model_path.exists() {
        debug!("Model already exists at: {:?}", model_path);
        return Ok(());
    }

    info!("Downloading face detection model to {:?}", model_path);
    if let Some(parent) = model_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut last_error = None;
    for url in MODEL_URLS {
        debug!("Trying to download from: {}", url);
        match ureq::get(url).call() {
            Ok(response) => {
                let mut reader = response.into_reader();
                let partial = model_path.with_extension("part");
                let mut file = std::fs::File::create(&partial)?;
                std::io::copy(&mut reader, &mut file)?;
                std::fs::rename(&partial, model_path)?;
                info!("Model downloaded successfully from {}", url);
                return Ok(());
            }
            Err(err) => {
                warn!("Failed to download from {}: {}", url, err);
                last_error = Some(err);
            }
        }
    }

    Err(anyhow!(
        "Failed to download model from all sources. Last error: {:?}\n\
        Please download the model manually from:\n\
        https://github.com/atomashpolskiy/rustface/tree/master/model\n\
        and place it at: {:?}",
        last_error,
        model_path
    ))
}

/// Settings needed to build any of the detector backends.
#[derive(Debug, Clone, Default)]
pub struct DetectorSpec {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub program: Option<ExternalTool>,
    pub params: Option<String>,
}

// Factory function to create detectors by name
pub fn create_detector(spec: &DetectorSpec) -> Result<Box<dyn FaceDetector>> {
    let mut detector: Box<dyn FaceDetector> = match spec.backend.to_lowercase().as_str() {
        "rustface" => {
            let model = spec
                .model_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH));
            Box::new(RustFaceDetector::new(&model)?)
        }
        "command" => {
            let tool = spec
                .program
                .clone()
                .ok_or_else(|| anyhow!("The command detector needs a program"))?;
            Box::new(CommandDetector::new(tool))
        }
        _ => return Err(anyhow!("Unknown detector: {}", spec.backend)),
    };

    if let Some(params) = spec.params.as_deref().filter(|p| !p.is_empty()) {
        detector.set_params(params)?;
    }

    Ok(detector)
}
