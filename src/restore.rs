use crate::bridge::{ExternalTool, ScratchImage, scratch_output};
use anyhow::{Context, Result, anyhow};
use image::{RgbImage, imageops};
use log::debug;
use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// What a restorer produced for one input.
#[derive(Debug, Clone, Default)]
pub struct RestoreOutput {
    /// Restored face crops. May be empty when the restorer found no face.
    pub faces: Vec<RgbImage>,
    /// The whole input with restored faces pasted back, if the backend makes one.
    pub full_image: Option<RgbImage>,
}

/// Trait for face restoration (super-resolution) backends.
pub trait FaceRestorer {
    fn name(&self) -> &str;

    fn restore(&mut self, image: &RgbImage) -> Result<RestoreOutput>;
}

/// Which pixels are handed to the restorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreSource {
    /// The detected face crop.
    #[default]
    Face,
    /// The whole frame resized to `size`x`size`; the restorer realigns faces itself.
    Frame { size: u32 },
}

/// Picks the restorer input for one face.
pub fn restore_input<'a>(
    source: RestoreSource,
    face: &'a RgbImage,
    frame: &RgbImage,
) -> Cow<'a, RgbImage> {
    match source {
        RestoreSource::Face => Cow::Borrowed(face),
        RestoreSource::Frame { size } => Cow::Owned(imageops::resize(
            frame,
            size,
            size,
            imageops::FilterType::CatmullRom,
        )),
    }
}

/// Plain Lanczos upscaling; a stand-in when no restoration model is available.
pub struct LanczosRestorer {
    upscale: f32,
}

impl LanczosRestorer {
    pub fn new(upscale: f32) -> Self {
        Self { upscale }
    }
}

impl FaceRestorer for LanczosRestorer {
    fn name(&self) -> &str {
        "lanczos"
    }

    fn restore(&mut self, image: &RgbImage) -> Result<RestoreOutput> {
        let (width, height) = image.dimensions();
        let target_w = scaled(width, self.upscale);
        let target_h = scaled(height, self.upscale);
        let restored = imageops::resize(
            image,
            target_w,
            target_h,
            imageops::FilterType::Lanczos3,
        );
        Ok(RestoreOutput {
            faces: vec![restored],
            full_image: None,
        })
    }
}

fn scaled(dim: u32, factor: f32) -> u32 {
    ((dim as f32 * factor).round() as u32).max(1)
}

/// Restorer that runs an external model program.
///
/// Invoked as `program [args] <input.png> <face.png> <upscale> <full.png>`.
/// The program writes the restored face to `face.png` and, when it pastes
/// faces back, the whole restored image to `full.png`. A missing or empty
/// face file means the model found no face to restore.
pub struct CommandRestorer {
    tool: ExternalTool,
    upscale: f32,
    scratch_dir: PathBuf,
}

impl CommandRestorer {
    pub fn new(tool: ExternalTool, upscale: f32, scratch_dir: PathBuf) -> Self {
        Self {
            tool,
            upscale,
            scratch_dir,
        }
    }
}

impl FaceRestorer for CommandRestorer {
    fn name(&self) -> &str {
        "command"
    }

    fn restore(&mut self, image: &RgbImage) -> Result<RestoreOutput> {
        let input = ScratchImage::write(&self.scratch_dir, "restore_in", image)?;
        let face_out = scratch_output(&self.scratch_dir, "restore_face", ".png")?;
        let full_out = scratch_output(&self.scratch_dir, "restore_full", ".png")?;

        let upscale = self.upscale.to_string();
        self.tool.run([
            input.path().as_os_str(),
            face_out.as_os_str(),
            OsStr::new(&upscale),
            full_out.as_os_str(),
        ])?;

        let Some(face) = read_written(&face_out)? else {
            debug!("Restorer produced no face for {:?}", input.path());
            return Ok(RestoreOutput::default());
        };

        Ok(RestoreOutput {
            faces: vec![face],
            full_image: read_written(&full_out)?,
        })
    }
}

/// The image a tool wrote to `path`, or `None` if it left the file empty.
fn read_written(path: &Path) -> Result<Option<RgbImage>> {
    let written = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if written == 0 {
        return Ok(None);
    }
    let image = image::open(path)
        .with_context(|| format!("Failed to read restored image {:?}", path))?
        .to_rgb8();
    Ok(Some(image))
}

/// Settings needed to build any of the restorer backends.
#[derive(Debug, Clone)]
pub struct RestorerSpec {
    pub backend: String,
    pub program: Option<ExternalTool>,
    pub upscale: f32,
    pub scratch_dir: PathBuf,
}

pub fn create_restorer(spec: &RestorerSpec) -> Result<Box<dyn FaceRestorer>> {
    if !(spec.upscale > 0.0) {
        return Err(anyhow!("Upscale factor must be positive, got {}", spec.upscale));
    }
    match spec.backend.to_lowercase().as_str() {
        "lanczos" => Ok(Box::new(LanczosRestorer::new(spec.upscale))),
        "command" => {
            let tool = spec
                .program
                .clone()
                .ok_or_else(|| anyhow!("The command restorer needs a program"))?;
            Ok(Box::new(CommandRestorer::new(
                tool,
                spec.upscale,
                spec.scratch_dir.clone(),
            )))
        }
        _ => Err(anyhow!("Unknown restorer: {}", spec.backend)),
    }
}
